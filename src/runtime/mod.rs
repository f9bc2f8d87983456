//! 运行时：接收 Run、按前置关系与资源调度、持久化输出
//!
//! 三种实现共享同一个入队/启动/中断接口：顺序本地、并行本地、批处理（slurm）。

mod config;
mod parallel;
mod run;
mod sequential;
mod slurm;

use std::collections::{BTreeMap, VecDeque};

pub use config::{ProxyRetry, RunConfig};
pub use parallel::LocalParallelRuntime;
pub use run::{Run, RunId, RunOutcome, RunSet, plan_runs};
#[cfg(test)]
pub(crate) use run::guarded;
pub use sequential::LocalSimpleRuntime;
pub use slurm::{BatchJob, SlurmRuntime, parse_job_id};

use crate::error::{OrchError, Result};
use crate::system::FragmentId;

#[allow(async_fn_in_trait)]
pub trait Runtime {
    /// 入队；返回的句柄可作为后续 Run 的前置
    fn add_run(&mut self, run: Run) -> RunId;

    /// 处理队列直到为空或被中断
    async fn start(&mut self) -> Result<Vec<RunOutcome>>;

    /// 软停止：不再启动新 Run，通知运行中的 Run 关停
    fn interrupt(&self);
}

/// 把一组 Run 入队：测量 Run 以同分片的检查点 Run 为前置
pub fn enqueue<R: Runtime>(rt: &mut R, set: RunSet) -> Vec<RunId> {
    let mut cp_ids: BTreeMap<FragmentId, RunId> = BTreeMap::new();
    let mut ids = Vec::new();
    for run in set.checkpoint {
        let frag = run.fragment;
        let id = rt.add_run(run);
        cp_ids.insert(frag, id);
        ids.push(id);
    }
    for mut run in set.measure {
        if let Some(cp) = cp_ids.get(&run.fragment) {
            run.prereq = Some(*cp);
        }
        ids.push(rt.add_run(run));
    }
    ids
}

pub(crate) struct Pending {
    pub id: RunId,
    pub run: Run,
}

/// 前置 Run 的状态
pub(crate) enum Prereq {
    Ready,
    Waiting(String),
    Failed(String),
}

/// 已完成 Run 的登记
#[derive(Default)]
pub(crate) struct Ledger {
    names: BTreeMap<RunId, String>,
    complete: BTreeMap<RunId, bool>,
    next: usize,
}

impl Ledger {
    pub fn register(&mut self, run: &Run) -> RunId {
        let id = RunId(self.next);
        self.next += 1;
        self.names.insert(id, run.run_id.clone());
        id
    }

    pub fn finish(&mut self, id: RunId, success: bool) {
        self.complete.insert(id, success);
    }

    pub fn check(&self, run: &Run) -> Prereq {
        let Some(p) = run.prereq else {
            return Prereq::Ready;
        };
        let name = self.names.get(&p).cloned().unwrap_or_else(|| p.to_string());
        match self.complete.get(&p) {
            Some(true) => Prereq::Ready,
            Some(false) => Prereq::Failed(name),
            None if self.names.contains_key(&p) => Prereq::Waiting(name),
            None => Prereq::Failed(name),
        }
    }

    pub fn prereq_error(name: String) -> OrchError {
        OrchError::PrerequisiteFailed(name)
    }
}

/// 取出队首 Run 所在组的全部 Run，其余保持原顺序
pub(crate) fn pop_group(queue: &mut VecDeque<Pending>) -> Vec<Pending> {
    let Some(first) = queue.pop_front() else {
        return Vec::new();
    };
    let group = first.run.group.clone();
    let mut out = vec![first];
    let mut rest = VecDeque::with_capacity(queue.len());
    while let Some(p) = queue.pop_front() {
        if p.run.group == group {
            out.push(p);
        } else {
            rest.push_back(p);
        }
    }
    *queue = rest;
    out
}
