//! 顺序本地运行时：一次一个 Run（同组分片一起）

use std::collections::VecDeque;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::{Ledger, Pending, Prereq, Run, RunConfig, RunId, RunOutcome, Runtime, pop_group};
use crate::error::Result;
use crate::exec::FragmentGroup;

pub struct LocalSimpleRuntime {
    queue: VecDeque<Pending>,
    ledger: Ledger,
    cfg: RunConfig,
    cancel: CancellationToken,
}

impl LocalSimpleRuntime {
    pub fn new(cfg: RunConfig) -> Self {
        Self {
            queue: VecDeque::new(),
            ledger: Ledger::default(),
            cfg,
            cancel: CancellationToken::new(),
        }
    }

    /// 供信号处理等外部代码触发中断
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Runtime for LocalSimpleRuntime {
    fn add_run(&mut self, run: Run) -> RunId {
        let id = self.ledger.register(&run);
        self.queue.push_back(Pending { id, run });
        id
    }

    #[tracing::instrument(skip(self), fields(queued = self.queue.len()))]
    async fn start(&mut self) -> Result<Vec<RunOutcome>> {
        let mut outcomes = Vec::new();
        loop {
            if self.cancel.is_cancelled() {
                info!(remaining = self.queue.len(), "⏹️  已中断，不再启动新的 Run");
                break;
            }
            let group = pop_group(&mut self.queue);
            if group.is_empty() {
                break;
            }

            // 顺序执行时前置必已出队；未完成即视为失败。组内任一 Run 的前置失败则整组跳过
            let blocked = group.iter().find_map(|p| match self.ledger.check(&p.run) {
                Prereq::Ready => None,
                Prereq::Waiting(name) | Prereq::Failed(name) => Some(name),
            });
            if let Some(name) = blocked {
                for p in group {
                    let outcome = p.run.skip(&Ledger::prereq_error(name.clone()));
                    self.ledger.finish(p.id, false);
                    outcomes.push(outcome);
                }
                continue;
            }

            let shared = FragmentGroup::new(group.iter().filter(|p| p.run.waits()).count());
            let mut set = JoinSet::new();
            for p in group {
                info!(run_id = %p.run.run_id, "▶️  开始 Run");
                let cfg = self.cfg.clone();
                let token = self.cancel.child_token();
                let g = shared.clone();
                set.spawn(async move { (p.id, p.run.execute_guarded(cfg, token, Some(g)).await) });
            }
            while let Some(res) = set.join_next().await {
                match res {
                    Ok((id, outcome)) => {
                        self.ledger.finish(id, outcome.success);
                        outcomes.push(outcome);
                    }
                    Err(e) => error!(error = %e, "Run 任务异常结束"),
                }
            }
        }
        Ok(outcomes)
    }

    fn interrupt(&self) {
        self.cancel.cancel();
    }
}
