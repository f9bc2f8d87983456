//! 分片执行器
//!
//! 一个分片一次 Run 的完整生命周期：解析、准备目录与镜像、按 DAG 顺序启动、
//! 等待等待集合退出、按信号阶梯关停、收集输出。无论哪条路径退出都会执行关停。

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::command::{ExitInfo, Executor, ProcessHandle, Signal};
use super::config_tar::build_config_tar;
use super::group::FragmentGroup;
use crate::error::{OrchError, Result};
use crate::instantiation::{resolve, DagNode, Instantiation, LaunchPlan, SocketType};
use crate::output::{SimulationOutput, now_ts};
use crate::runtime::{ProxyRetry, RunConfig};
use crate::simulation::SimContext;
use crate::system::{DiskPrep, FragmentId, HostConfig};

/// 单个仿真器（或代理）的生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimState {
    Unknown,
    Preparing,
    Starting,
    Running,
    Terminated,
}

/// 启动一个 DAG 节点所需的全部信息（纯计算结果）
#[derive(Debug, Clone)]
pub struct NodeLaunch {
    pub node: DagNode,
    /// 输出记录里的键
    pub key: String,
    pub class: String,
    pub argv: Vec<String>,
    pub prep_cmds: Vec<Vec<String>>,
    pub wait_paths: Vec<PathBuf>,
    pub shm_paths: Vec<PathBuf>,
    /// 属于等待集合
    pub waits: bool,
    /// 承载链路上主动连接的代理（失败时重试）
    pub connecting_proxy: bool,
}

/// 解析分片并生成每个节点的命令行，不启动任何进程
pub fn plan_fragment(inst: &mut Instantiation, frag: FragmentId) -> Result<(LaunchPlan, Vec<NodeLaunch>)> {
    inst.reset_sockets();
    let plan = resolve(inst, frag)?;
    let inst: &Instantiation = inst;
    let system = &inst.simulation.system;
    let mut launches = Vec::with_capacity(plan.order.len());
    for node in &plan.order {
        let launch = match *node {
            DagNode::Sim(id) => {
                let sim = inst.simulation.simulator(id)?;
                let ctx = SimContext::new(inst, sim);
                let behavior = sim.behavior();
                NodeLaunch {
                    node: *node,
                    key: sim.full_name(),
                    class: behavior.class_name().to_string(),
                    argv: behavior.run_cmd(&ctx)?,
                    prep_cmds: behavior.prep_cmds(&ctx)?,
                    wait_paths: behavior.sockets_wait(&ctx)?,
                    shm_paths: behavior.shm_paths(&ctx)?,
                    waits: sim.waits(system),
                    connecting_proxy: false,
                }
            }
            DagNode::Proxy(id) => {
                let proxy = inst.proxy(id)?;
                NodeLaunch {
                    node: *node,
                    key: format!("proxy.{}", proxy.name),
                    class: format!("{}Proxy", proxy.proxy_type),
                    argv: proxy.run_cmd(inst)?,
                    prep_cmds: Vec::new(),
                    wait_paths: proxy.listen_sockets(inst)?,
                    shm_paths: vec![proxy.shm_path(inst)],
                    waits: false,
                    connecting_proxy: proxy.mode == SocketType::Connect,
                }
            }
        };
        launches.push(launch);
    }
    Ok((plan, launches))
}

enum PrepJob {
    ConfigTar {
        sim: String,
        host: HostConfig,
        checkpoint_cmd: Option<&'static str>,
        exit_cmd: &'static str,
    },
    Command(Vec<String>),
}

struct Launched {
    key: String,
    handle: ProcessHandle,
    waits: bool,
    is_proxy: bool,
}

pub struct SimulationExecutor {
    inst: Instantiation,
    frag: FragmentId,
    exec: Executor,
    cfg: RunConfig,
    cancel: CancellationToken,
    states: BTreeMap<String, SimState>,
    launched: Vec<Launched>,
    cleanup_files: Vec<PathBuf>,
    output: SimulationOutput,
    group: Option<FragmentGroup>,
    /// 本分片含等待集合
    waits_here: bool,
}

impl SimulationExecutor {
    pub fn new(
        inst: Instantiation,
        frag: FragmentId,
        exec: Executor,
        cfg: RunConfig,
        cancel: CancellationToken,
        run_index: usize,
    ) -> Result<Self> {
        let fragment = inst.fragment(frag)?;
        let frag_name = fragment.name.clone();
        let waits_here = fragment.waits(&inst.simulation);
        let output = SimulationOutput::new(
            inst.env.run_id.clone(),
            inst.simulation.name.clone(),
            frag_name,
            run_index,
            inst.simulation.metadata.clone(),
        );
        Ok(Self {
            inst,
            frag,
            exec,
            cfg,
            cancel,
            states: BTreeMap::new(),
            launched: Vec::new(),
            cleanup_files: Vec::new(),
            output,
            group: None,
            waits_here,
        })
    }

    /// 与同组其余分片共享结束信号
    pub fn with_group(mut self, group: FragmentGroup) -> Self {
        self.group = Some(group);
        self
    }

    fn set_state(&mut self, key: &str, state: SimState) {
        let prev = self
            .states
            .insert(key.to_string(), state)
            .unwrap_or(SimState::Unknown);
        debug!(sim = key, from = ?prev, to = ?state, "状态迁移");
    }

    /// 执行整个 Run；总是返回输出记录
    #[tracing::instrument(skip(self), fields(run_id = %self.inst.env.run_id))]
    pub async fn run(mut self) -> SimulationOutput {
        info!("▶️  开始运行分片");
        let budget = self
            .cfg
            .run_timeout
            .or(self.inst.simulation.timeout.map(Duration::from_secs));
        let cancel = self.cancel.clone();
        let result = {
            let inner = async {
                tokio::select! {
                    r = self.run_inner() => r,
                    _ = cancel.cancelled() => Err(OrchError::Cancelled),
                }
            };
            match budget {
                Some(b) => tokio::time::timeout(b, inner)
                    .await
                    .unwrap_or(Err(OrchError::RunTimeout(b))),
                None => inner.await,
            }
        };

        let success = match &result {
            Ok(ok) => *ok,
            Err(e) => {
                error!(kind = e.kind(), error = %e, "Run 失败");
                self.output.record_error(e);
                false
            }
        };
        if let Some(g) = self.group.as_ref().filter(|_| self.waits_here) {
            g.report(&self.inst.env.run_id, success);
        }
        self.shutdown().await;
        self.collect();
        self.cleanup().await;
        self.output.finish(success);
        if self.output.success {
            info!("✅ 分片运行成功");
        } else {
            warn!(interrupted = self.output.interrupted, "❌ 分片运行失败");
        }
        self.output
    }

    async fn run_inner(&mut self) -> Result<bool> {
        let (plan, launches) = plan_fragment(&mut self.inst, self.frag)?;
        debug!(order = ?plan.order, "启动顺序");
        for l in &launches {
            self.set_state(&l.key, SimState::Unknown);
            self.cleanup_files.extend(l.shm_paths.iter().cloned());
            self.cleanup_files.extend(l.wait_paths.iter().cloned());
        }

        self.prep_dirs().await?;
        self.prep_disks().await?;

        for launch in launches {
            self.launch(launch).await?;
        }
        self.await_termination().await
    }

    /// 新建运行目录、共享内存目录与检查点目录（先清理残留）
    async fn prep_dirs(&mut self) -> Result<()> {
        let env = &self.inst.env;
        let (run_dir, shm_dir, cp_dir) = (env.run_dir(), env.shm_dir(), env.cp_dir());
        self.exec.rmtree(&run_dir).await?;
        self.exec.rmtree(&shm_dir).await?;
        if env.create_cp {
            self.exec.rmtree(&cp_dir).await?;
        }
        for d in [&run_dir, &shm_dir, &cp_dir] {
            self.exec.mkdir(d).await?;
        }
        debug!(run_dir = %run_dir.display(), "目录已就绪");
        Ok(())
    }

    /// 生成主机配置包并运行镜像准备命令
    async fn prep_disks(&mut self) -> Result<()> {
        for job in self.disk_jobs()? {
            match job {
                PrepJob::ConfigTar {
                    sim,
                    host,
                    checkpoint_cmd,
                    exit_cmd,
                } => {
                    build_config_tar(&self.exec, &self.inst.env, &sim, &host, checkpoint_cmd, exit_cmd)
                        .await?;
                }
                PrepJob::Command(cmd) => {
                    debug!(cmd = ?cmd, "运行准备命令");
                    self.exec.run_to_completion(&cmd).await?;
                }
            }
        }
        Ok(())
    }

    fn disk_jobs(&self) -> Result<Vec<PrepJob>> {
        let mut jobs = Vec::new();
        for id in &self.inst.fragment(self.frag)?.simulators {
            let sim = self.inst.simulation.simulator(*id)?;
            let ctx = SimContext::new(&self.inst, sim);
            let Ok(host) = ctx.host() else { continue };
            let behavior = sim.behavior();
            let checkpoint_cmd = if self.inst.simulation.checkpoint {
                behavior.checkpoint_cmd()
            } else {
                None
            };
            for (_, prep) in ctx.disks()? {
                if let DiskPrep::ConfigTar(_) = prep {
                    jobs.push(PrepJob::ConfigTar {
                        sim: sim.name.clone(),
                        host: host.clone(),
                        checkpoint_cmd,
                        exit_cmd: behavior.exit_cmd(),
                    });
                }
            }
            jobs.extend(behavior.prep_cmds(&ctx)?.into_iter().map(PrepJob::Command));
        }
        Ok(jobs)
    }

    #[tracing::instrument(skip(self, launch), fields(sim = %launch.key))]
    async fn launch(&mut self, launch: NodeLaunch) -> Result<()> {
        self.set_state(&launch.key, SimState::Preparing);
        if self.cancel.is_cancelled() {
            return Err(OrchError::Cancelled);
        }
        self.set_state(&launch.key, SimState::Starting);
        info!(argv = ?launch.argv, "🚀 启动仿真器");

        let handle = if launch.connecting_proxy {
            self.start_connecting_proxy(&launch).await?
        } else {
            self.exec
                .start(&launch.key, &launch.argv, None, self.cfg.verbose)
                .await?
        };
        self.output
            .add_sim(&launch.key, &launch.class, launch.argv.clone());
        self.launched.push(Launched {
            key: launch.key.clone(),
            handle,
            waits: launch.waits,
            is_proxy: matches!(launch.node, DagNode::Proxy(_)),
        });
        if !launch.connecting_proxy {
            for path in &launch.wait_paths {
                self.exec
                    .await_file(path, self.cfg.socket_timeout, self.cfg.poll_interval, &self.cancel)
                    .await?;
            }
        }
        self.set_state(&launch.key, SimState::Running);
        Ok(())
    }

    /// 主动连接的代理：承载链路在期限内未就绪或进程提前退出时按退避重试
    async fn start_connecting_proxy(&mut self, launch: &NodeLaunch) -> Result<ProcessHandle> {
        let retry = self.cfg.proxy_retry.clone();
        for attempt in 1..=retry.attempts {
            let mut handle = self
                .exec
                .start(&launch.key, &launch.argv, None, self.cfg.verbose)
                .await?;
            let ready = await_carrier(
                &self.exec,
                &mut handle,
                &launch.wait_paths,
                &retry,
                self.cfg.poll_interval,
                &self.cancel,
            )
            .await;
            match ready {
                Ok(()) => return Ok(handle),
                Err(OrchError::Cancelled) => return Err(OrchError::Cancelled),
                Err(e) => {
                    let wait = retry.backoff(attempt);
                    warn!(attempt, error = %e, backoff = ?wait, "代理承载链路未建立，稍后重试");
                    handle.signal(Signal::Kill);
                    drop(handle);
                    if attempt < retry.attempts {
                        tokio::select! {
                            _ = self.cancel.cancelled() => return Err(OrchError::Cancelled),
                            _ = tokio::time::sleep(wait) => {}
                        }
                    }
                }
            }
        }
        Err(OrchError::ProxyCarrierUnreachable {
            proxy: launch.key.clone(),
            attempts: retry.attempts,
        })
    }

    /// 等待集合全部正常退出
    ///
    /// 本分片没有等待集合时：同组有等待方则跟随组的结束信号，否则等待所有
    /// 仿真器退出。
    async fn await_termination(&mut self) -> Result<bool> {
        let any_waiter = self.launched.iter().any(|l| l.waits);
        let follow = if any_waiter {
            None
        } else {
            self.group.clone().filter(|g| g.has_waiters())
        };
        info!(
            waiters = self.launched.iter().filter(|l| l.waits).count(),
            follow_group = follow.is_some(),
            "⏳ 等待仿真结束"
        );
        loop {
            if let Some(g) = follow.as_ref().filter(|g| g.is_done()) {
                return match g.failure() {
                    None => {
                        info!("同组等待集合已结束，收尾本分片");
                        Ok(true)
                    }
                    Some(run) => Err(OrchError::PeerFragmentFailed(run)),
                };
            }
            let mut pending = false;
            for l in &self.launched {
                match l.handle.exit_status() {
                    Some(st) if !st.success() => {
                        return Err(OrchError::ChildCrashed {
                            name: l.key.clone(),
                            status: st.to_string(),
                        });
                    }
                    Some(_) => {}
                    None => {
                        if l.waits || (!any_waiter && !l.is_proxy) {
                            pending = true;
                        }
                    }
                }
            }
            if !pending {
                return Ok(true);
            }
            let group_done = async {
                match &follow {
                    Some(g) => g.finished().await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(OrchError::Cancelled),
                _ = group_done => {}
                _ = tokio::time::sleep(self.cfg.poll_interval) => {}
            }
        }
    }

    /// INT → TERM → KILL，按启动逆序；每一级最多等待对应的宽限期
    #[tracing::instrument(skip(self))]
    async fn shutdown(&mut self) {
        let ladder = [
            (Signal::Int, self.cfg.grace_int),
            (Signal::Term, self.cfg.grace_term),
            (Signal::Kill, Duration::from_secs(2)),
        ];
        for (sig, grace) in ladder {
            let live: Vec<usize> = (0..self.launched.len())
                .rev()
                .filter(|i| self.launched[*i].handle.is_running())
                .collect();
            if live.is_empty() {
                break;
            }
            info!(signal = ?sig, live = live.len(), "🛑 关停仿真器");
            for i in &live {
                self.launched[*i].handle.signal(sig);
            }
            let deadline = Instant::now() + grace;
            for i in live {
                let l = &mut self.launched[i];
                if tokio::time::timeout_at(deadline, l.handle.wait()).await.is_err() {
                    debug!(sim = %l.key, signal = ?sig, "宽限期内未退出");
                }
            }
        }
        for l in self.launched.iter_mut() {
            l.handle.drain(Duration::from_secs(2)).await;
        }
        let keys: Vec<String> = self.states.keys().cloned().collect();
        for k in keys {
            self.set_state(&k, SimState::Terminated);
        }
    }

    fn collect(&mut self) {
        let end = now_ts();
        for l in &self.launched {
            let (stdout, stderr) = l.handle.take_output();
            let status: Option<ExitInfo> = l.handle.exit_status();
            if let Some(rec) = self.output.sim_mut(&l.key) {
                rec.stdout.extend(stdout);
                rec.stderr.extend(stderr);
                rec.end_time = Some(end);
                if let Some(st) = status {
                    rec.exit_code = st.code;
                    rec.signal = st.signal;
                }
            }
        }
    }

    /// 删除 socket 与共享内存文件；未要求保留时删除运行目录
    async fn cleanup(&mut self) {
        for f in std::mem::take(&mut self.cleanup_files) {
            if let Err(e) = self.exec.remove_file(&f).await {
                debug!(path = %f.display(), error = %e, "清理文件失败");
            }
        }
        if self.inst.env.keep_workdir {
            return;
        }
        for dir in [self.inst.env.run_dir(), self.inst.env.shm_dir()] {
            if let Err(e) = self.exec.rmtree(&dir).await {
                warn!(path = %dir.display(), error = %e, "清理目录失败");
            }
        }
    }
}

/// 等待 `paths` 全部出现；进程先退出则失败
async fn await_ready(
    exec: &Executor,
    handle: &mut ProcessHandle,
    paths: &[PathBuf],
    timeout: Duration,
    poll: Duration,
    cancel: &CancellationToken,
) -> Result<()> {
    let name = handle.name().to_string();
    for p in paths {
        tokio::select! {
            r = exec.await_file(p, timeout, poll, cancel) => r?,
            st = handle.wait() => {
                return Err(OrchError::Executor(format!(
                    "`{name}` exited ({st}) before {} appeared",
                    p.display()
                )));
            }
        }
    }
    Ok(())
}

/// 连接方代理的就绪判定
///
/// 先等监听 socket 出现；配置了标记时再等 stdout 出现该标记，否则要求进程
/// 在 `settle` 内不退出。整个过程受 `connect_timeout` 约束。
async fn await_carrier(
    exec: &Executor,
    handle: &mut ProcessHandle,
    paths: &[PathBuf],
    retry: &ProxyRetry,
    poll: Duration,
    cancel: &CancellationToken,
) -> Result<()> {
    let name = handle.name().to_string();
    let deadline = Instant::now() + retry.connect_timeout;
    await_ready(exec, handle, paths, retry.connect_timeout, poll, cancel).await?;
    match &retry.ready_marker {
        Some(marker) => loop {
            if handle.stdout_snapshot().iter().any(|l| l.contains(marker.as_str())) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(OrchError::Executor(format!(
                    "`{name}` did not report `{marker}` within {:?}",
                    retry.connect_timeout
                )));
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(OrchError::Cancelled),
                st = handle.wait() => {
                    return Err(OrchError::Executor(format!("`{name}` exited ({st}) before its carrier was up")));
                }
                _ = tokio::time::sleep(poll) => {}
            }
        },
        None => {
            let settle = retry.settle.min(deadline.saturating_duration_since(Instant::now()));
            tokio::select! {
                _ = cancel.cancelled() => Err(OrchError::Cancelled),
                st = handle.wait() => {
                    Err(OrchError::Executor(format!("`{name}` exited ({st}) before its carrier was up")))
                }
                _ = tokio::time::sleep(settle) => Ok(()),
            }
        }
    }
}

/// 便捷入口：运行一个分片并返回输出记录
pub async fn run_fragment(
    inst: Instantiation,
    frag: FragmentId,
    exec: Executor,
    cfg: RunConfig,
    cancel: CancellationToken,
    run_index: usize,
    group: Option<FragmentGroup>,
) -> SimulationOutput {
    match SimulationExecutor::new(inst, frag, exec, cfg, cancel, run_index) {
        Ok(se) => match group {
            Some(g) => se.with_group(g).run().await,
            None => se.run().await,
        },
        Err(e) => {
            if let Some(g) = &group {
                g.report("", false);
            }
            let mut out = SimulationOutput::new("", "", "", run_index, BTreeMap::new());
            out.record_error(&e);
            out.finish(false);
            out
        }
    }
}
