//! 批处理运行时：每个 Run 序列化成任务文件并交给 sbatch
//!
//! 任务脚本回调本程序的 `--from-run <json>`，在计算节点上执行单个 Run。
//! 前置关系翻译为 `--dependency=afterok:<job>`。

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::{Ledger, Run, RunConfig, RunId, RunOutcome, Runtime};
use crate::error::{OrchError, Result};
use crate::exec::Executor;
use crate::util::shell_join;

/// 任务文件内容：Run 本身加运行配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchJob {
    pub run: Run,
    #[serde(default)]
    pub cfg: RunConfig,
}

impl BatchJob {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| OrchError::io(path, e))?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// 从 sbatch 的输出里取出任务号
pub fn parse_job_id(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .find_map(|l| l.trim().strip_prefix("Submitted batch job "))
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
}

pub struct SlurmRuntime {
    slurm_dir: PathBuf,
    sbatch: String,
    /// 计算节点上调用的编排器可执行文件
    exe: PathBuf,
    cfg: RunConfig,
    queue: Vec<(RunId, Run)>,
    ledger: Ledger,
    cancel: CancellationToken,
}

impl SlurmRuntime {
    pub fn new(slurm_dir: impl Into<PathBuf>, exe: impl Into<PathBuf>, cfg: RunConfig) -> Self {
        Self {
            slurm_dir: slurm_dir.into(),
            sbatch: "sbatch".to_string(),
            exe: exe.into(),
            cfg,
            queue: Vec::new(),
            ledger: Ledger::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn with_sbatch(mut self, sbatch: impl Into<String>) -> Self {
        self.sbatch = sbatch.into();
        self
    }

    fn time_limit(&self, run: &Run) -> Option<Duration> {
        self.cfg.run_timeout.or_else(|| {
            run.instantiation
                .simulation
                .timeout
                .map(Duration::from_secs)
        })
    }

    /// 生成任务脚本
    pub fn render_script(&self, run: &Run, job_file: &Path) -> Result<String> {
        let res = run.resources()?;
        let log = |ext: &str| self.slurm_dir.join(format!("{}.{ext}", run.run_id));
        let mut s = String::from("#!/bin/bash\n");
        s.push_str(&format!("#SBATCH --job-name={}\n", run.run_id));
        s.push_str(&format!("#SBATCH -o {}\n", log("out").display()));
        s.push_str(&format!("#SBATCH -e {}\n", log("err").display()));
        s.push_str(&format!("#SBATCH -c {}\n", res.cores.max(1)));
        s.push_str(&format!("#SBATCH --mem={}M\n", res.memory_mb.max(1)));
        if let Some(limit) = self.time_limit(run) {
            let minutes = limit.as_secs().div_ceil(60).max(1);
            s.push_str(&format!("#SBATCH --time={minutes}\n"));
        }
        s.push('\n');
        s.push_str(&format!(
            "exec {}\n",
            shell_join(&[
                self.exe.display().to_string(),
                "--from-run".to_string(),
                job_file.display().to_string(),
            ])
        ));
        Ok(s)
    }

    async fn submit(&self, run: &Run, after: Option<&str>) -> Result<String> {
        let job_file = self.slurm_dir.join(format!("{}.json", run.run_id));
        let script = self.slurm_dir.join(format!("{}.sh", run.run_id));
        let job = BatchJob {
            run: run.clone(),
            cfg: self.cfg.clone(),
        };
        let local = Executor::Local;
        local
            .write_file(&job_file, job.to_json()?.as_bytes())
            .await?;
        local
            .write_file(&script, self.render_script(run, &job_file)?.as_bytes())
            .await?;

        let mut argv = vec![self.sbatch.clone()];
        if let Some(dep) = after {
            argv.push(format!("--dependency=afterok:{dep}"));
        }
        argv.push(script.display().to_string());
        let out = local.output(&argv, None).await?;
        let stdout = String::from_utf8_lossy(&out.stdout);
        if !out.status.success() {
            return Err(OrchError::Executor(format!(
                "{} failed: {}",
                shell_join(&argv),
                String::from_utf8_lossy(&out.stderr).trim()
            )));
        }
        parse_job_id(&stdout).ok_or_else(|| {
            OrchError::Executor(format!("unexpected sbatch output: {}", stdout.trim()))
        })
    }
}

impl Runtime for SlurmRuntime {
    fn add_run(&mut self, run: Run) -> RunId {
        let id = self.ledger.register(&run);
        self.queue.push((id, run));
        id
    }

    #[tracing::instrument(skip(self), fields(dir = %self.slurm_dir.display(), queued = self.queue.len()))]
    async fn start(&mut self) -> Result<Vec<RunOutcome>> {
        Executor::Local.mkdir(&self.slurm_dir).await?;
        let mut jobs: BTreeMap<RunId, String> = BTreeMap::new();
        let mut outcomes = Vec::new();
        let queue = std::mem::take(&mut self.queue);
        for (id, run) in queue {
            if self.cancel.is_cancelled() {
                info!("⏹️  已中断，停止提交");
                break;
            }
            let after = run.prereq.and_then(|p| jobs.get(&p).cloned());
            if let (Some(p), None) = (run.prereq, &after) {
                // 前置未能提交，依赖它的 Run 也不提交
                let name = p.to_string();
                self.ledger.finish(id, false);
                outcomes.push(run.skip(&Ledger::prereq_error(name)));
                continue;
            }
            match self.submit(&run, after.as_deref()).await {
                Ok(job) => {
                    info!(run_id = %run.run_id, job = %job, "🚀 已提交");
                    jobs.insert(id, job);
                    self.ledger.finish(id, true);
                    outcomes.push(RunOutcome {
                        run_id: run.run_id.clone(),
                        success: true,
                        interrupted: false,
                        output_path: run.output_path.clone(),
                    });
                }
                Err(e) => {
                    error!(run_id = %run.run_id, error = %e, "❌ 提交失败");
                    self.ledger.finish(id, false);
                    outcomes.push(RunOutcome {
                        run_id: run.run_id.clone(),
                        success: false,
                        interrupted: false,
                        output_path: run.output_path.clone(),
                    });
                }
            }
        }
        Ok(outcomes)
    }

    fn interrupt(&self) {
        self.cancel.cancel();
    }
}
