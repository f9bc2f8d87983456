//! Run：一个实例化的一个分片的一次执行

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::config::RunConfig;
use crate::error::{OrchError, Result};
use crate::exec::{Executor, FragmentGroup, run_fragment};
use crate::instantiation::Instantiation;
use crate::output::SimulationOutput;
use crate::simulation::Resources;
use crate::system::FragmentId;

/// `add_run` 返回的句柄
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub usize);

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub run_id: String,
    pub index: usize,
    pub fragment: FragmentId,
    /// 环境已针对本 Run 派生
    pub instantiation: Instantiation,
    /// 同组 Run（同一实例化的各分片）需要同时运行
    pub group: String,
    #[serde(default)]
    pub prereq: Option<RunId>,
    pub output_path: PathBuf,
    #[serde(default)]
    pub executor: Executor,
}

impl Run {
    pub fn resources(&self) -> Result<Resources> {
        self.instantiation
            .fragment(self.fragment)?
            .resource_requirements(&self.instantiation.simulation)
    }

    /// 执行并把输出记录写到 `output_path`
    #[tracing::instrument(skip_all, fields(run_id = %self.run_id))]
    pub async fn execute(
        self,
        cfg: RunConfig,
        cancel: CancellationToken,
        group: Option<FragmentGroup>,
    ) -> RunOutcome {
        let out = run_fragment(
            self.instantiation,
            self.fragment,
            self.executor,
            cfg,
            cancel,
            self.index,
            group,
        )
        .await;
        RunOutcome::persist(&self.run_id, &self.output_path, out)
    }

    /// 在独立任务中执行；任务 panic 时按失败处理并通知同组
    pub async fn execute_guarded(
        self,
        cfg: RunConfig,
        cancel: CancellationToken,
        group: Option<FragmentGroup>,
    ) -> RunOutcome {
        let fallback = RunOutcome {
            run_id: self.run_id.clone(),
            success: false,
            interrupted: false,
            output_path: self.output_path.clone(),
        };
        let notify = group.clone();
        guarded(self.execute(cfg, cancel, group), fallback, notify).await
    }

    /// 本 Run 的分片是否含等待集合
    pub fn waits(&self) -> bool {
        self.instantiation
            .fragment(self.fragment)
            .is_ok_and(|f| f.waits(&self.instantiation.simulation))
    }

    /// 不执行，直接写出失败记录（前置 Run 未成功）
    pub fn skip(self, err: &OrchError) -> RunOutcome {
        let mut out = SimulationOutput::new(
            self.run_id.clone(),
            self.instantiation.simulation.name.clone(),
            self.instantiation
                .fragment(self.fragment)
                .map(|f| f.name.clone())
                .unwrap_or_default(),
            self.index,
            self.instantiation.simulation.metadata.clone(),
        );
        out.record_error(err);
        out.finish(false);
        info!(run_id = %self.run_id, reason = %err, "⏭️  跳过 Run");
        RunOutcome::persist(&self.run_id, &self.output_path, out)
    }
}

/// 一个 Run 的结局
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub run_id: String,
    pub success: bool,
    pub interrupted: bool,
    pub output_path: PathBuf,
}

impl RunOutcome {
    fn persist(run_id: &str, path: &Path, out: SimulationOutput) -> RunOutcome {
        if let Err(e) = out.dump(path) {
            error!(run_id, error = %e, "写出输出记录失败");
        }
        RunOutcome {
            run_id: run_id.to_string(),
            success: out.success,
            interrupted: out.interrupted,
            output_path: path.to_path_buf(),
        }
    }
}

pub(crate) async fn guarded<F>(
    fut: F,
    fallback: RunOutcome,
    group: Option<FragmentGroup>,
) -> RunOutcome
where
    F: Future<Output = RunOutcome> + Send + 'static,
{
    match tokio::spawn(fut).await {
        Ok(outcome) => outcome,
        Err(e) => {
            error!(run_id = %fallback.run_id, error = %e, "Run 任务异常结束");
            if let Some(g) = group {
                g.report(&fallback.run_id, false);
            }
            fallback
        }
    }
}

/// 一个实例化的一次重复：可选的检查点 Run 组，以及测量 Run 组
#[derive(Debug, Clone)]
pub struct RunSet {
    pub checkpoint: Vec<Run>,
    pub measure: Vec<Run>,
}

/// 为实例化的第 `index` 次重复生成 Run：每个分片一个
///
/// run id 为 `<sim>.<fragment>.<index>`，检查点 Run 再加 `.cp`；两者共用检查点键。
pub fn plan_runs(
    inst: &Instantiation,
    index: usize,
    outdir: &Path,
    executors: &BTreeMap<String, Executor>,
) -> Result<RunSet> {
    let mut inst = inst.clone();
    inst.ensure_fragments();
    inst.validate()?;
    let name = inst.name().to_string();

    let make = |frag: FragmentId, fname: &str, runner: Option<&str>, cp: bool| -> Result<Run> {
        let cp_key = format!("{name}.{fname}.{index}");
        let run_id = if cp { format!("{cp_key}.cp") } else { cp_key.clone() };
        let checkpointing = inst.simulation.checkpoint;
        let mut run_inst = inst.clone();
        run_inst.env = inst
            .env
            .for_run(&run_id, &cp_key, cp, checkpointing && !cp);
        let executor = match runner {
            None => Executor::Local,
            Some(label) => executors.get(label).cloned().ok_or_else(|| {
                OrchError::Executor(format!("fragment `{fname}` wants unknown runner `{label}`"))
            })?,
        };
        let group = if cp {
            format!("{name}.{index}.cp")
        } else {
            format!("{name}.{index}")
        };
        Ok(Run {
            output_path: outdir.join(format!("{run_id}.json")),
            run_id,
            index,
            fragment: frag,
            instantiation: run_inst,
            group,
            prereq: None,
            executor,
        })
    };

    let frags: Vec<(FragmentId, String, Option<String>)> = inst
        .fragments()
        .map(|f| (f.id, f.name.clone(), f.runner.clone()))
        .collect();
    let mut set = RunSet {
        checkpoint: Vec::new(),
        measure: Vec::new(),
    };
    for (id, fname, runner) in &frags {
        if inst.simulation.checkpoint {
            set.checkpoint.push(make(*id, fname, runner.as_deref(), true)?);
        }
        set.measure.push(make(*id, fname, runner.as_deref(), false)?);
    }
    Ok(set)
}
