//! 并行本地运行时：在核数与内存上限内同时运行多个 Run

use std::collections::VecDeque;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::{Ledger, Pending, Prereq, Run, RunConfig, RunId, RunOutcome, Runtime, pop_group};
use crate::error::Result;
use crate::exec::FragmentGroup;
use crate::simulation::Resources;

pub struct LocalParallelRuntime {
    queue: VecDeque<Pending>,
    ledger: Ledger,
    cfg: RunConfig,
    cancel: CancellationToken,
    capacity: Resources,
    used: Resources,
    running: usize,
}

type Finished = (RunId, Resources, RunOutcome);

impl LocalParallelRuntime {
    pub fn new(cfg: RunConfig, cores: u32, memory_mb: u64) -> Self {
        Self {
            queue: VecDeque::new(),
            ledger: Ledger::default(),
            cfg,
            cancel: CancellationToken::new(),
            capacity: Resources::new(cores, memory_mb),
            used: Resources::new(0, 0),
            running: 0,
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn fits(&self, need: Resources) -> bool {
        // 单独超出上限的组在空闲时仍可独占运行
        if self.running == 0 {
            return true;
        }
        let total = self.used + need;
        total.cores <= self.capacity.cores && total.memory_mb <= self.capacity.memory_mb
    }

    /// 按队列顺序尝试放行各组；返回被跳过 Run 的结局
    fn admit(&mut self, set: &mut JoinSet<Finished>) -> Vec<RunOutcome> {
        let mut skipped = Vec::new();
        let mut held = VecDeque::new();
        loop {
            let group = pop_group(&mut self.queue);
            if group.is_empty() {
                break;
            }

            let mut failed = None;
            let mut waiting = false;
            for p in &group {
                match self.ledger.check(&p.run) {
                    Prereq::Ready => {}
                    Prereq::Waiting(_) => waiting = true,
                    Prereq::Failed(name) => failed = Some(name),
                }
            }
            if let Some(name) = failed {
                for p in group {
                    self.ledger.finish(p.id, false);
                    skipped.push(p.run.skip(&Ledger::prereq_error(name.clone())));
                }
                continue;
            }
            if waiting {
                held.extend(group);
                continue;
            }

            let mut need = Resources::new(0, 0);
            let mut reqs = Vec::with_capacity(group.len());
            for p in &group {
                let r = p.run.resources().unwrap_or_else(|e| {
                    warn!(run_id = %p.run.run_id, error = %e, "无法计算资源需求，按零计");
                    Resources::new(0, 0)
                });
                need = need + r;
                reqs.push(r);
            }
            if !self.fits(need) {
                held.extend(group);
                continue;
            }

            self.used = self.used + need;
            let shared = FragmentGroup::new(group.iter().filter(|p| p.run.waits()).count());
            for (p, r) in group.into_iter().zip(reqs) {
                info!(run_id = %p.run.run_id, cores = r.cores, mem = r.memory_mb, "▶️  开始 Run");
                self.running += 1;
                let cfg = self.cfg.clone();
                let token = self.cancel.child_token();
                let g = shared.clone();
                set.spawn(async move { (p.id, r, p.run.execute_guarded(cfg, token, Some(g)).await) });
            }
        }
        self.queue = held;
        skipped
    }

    fn release(&mut self, r: Resources) {
        self.running = self.running.saturating_sub(1);
        self.used = Resources::new(
            self.used.cores.saturating_sub(r.cores),
            self.used.memory_mb.saturating_sub(r.memory_mb),
        );
    }
}

impl Runtime for LocalParallelRuntime {
    fn add_run(&mut self, run: Run) -> RunId {
        let id = self.ledger.register(&run);
        self.queue.push_back(Pending { id, run });
        id
    }

    #[tracing::instrument(skip(self), fields(queued = self.queue.len(), cores = self.capacity.cores))]
    async fn start(&mut self) -> Result<Vec<RunOutcome>> {
        let mut outcomes = Vec::new();
        let mut set = JoinSet::new();
        loop {
            if !self.cancel.is_cancelled() {
                outcomes.extend(self.admit(&mut set));
            }
            if self.running == 0 {
                if !self.queue.is_empty() && !self.cancel.is_cancelled() {
                    // 前置永远等不到：其所在 Run 不在本运行时中完成
                    for p in self.queue.drain(..) {
                        let name = p.run.prereq.map(|r| r.to_string()).unwrap_or_default();
                        outcomes.push(p.run.skip(&Ledger::prereq_error(name)));
                    }
                }
                break;
            }

            tokio::select! {
                joined = set.join_next() => match joined {
                    Some(Ok((id, r, outcome))) => {
                        self.release(r);
                        self.ledger.finish(id, outcome.success);
                        outcomes.push(outcome);
                    }
                    Some(Err(e)) => {
                        // panic 已在 execute_guarded 内转为失败结局，这里只剩外层任务被取消
                        error!(error = %e, "Run 任务异常结束");
                        self.running = self.running.saturating_sub(1);
                        if self.running == 0 {
                            self.used = Resources::new(0, 0);
                        }
                    }
                    None => self.running = 0,
                },
                _ = self.cancel.cancelled(), if !self.cancel.is_cancelled() => {
                    info!(running = self.running, "⏹️  已中断，等待运行中的 Run 关停");
                }
            }
        }
        if self.cancel.is_cancelled() && !self.queue.is_empty() {
            info!(remaining = self.queue.len(), "未启动的 Run 已放弃");
        }
        Ok(outcomes)
    }

    fn interrupt(&self) {
        self.cancel.cancel();
    }
}
