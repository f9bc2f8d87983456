//! 同组分片的协同结束
//!
//! 一个实例化拆成多个分片时，只有部分分片含等待集合。其余分片里的仿真器
//! （交换机、网卡、服务端主机）不会自行退出，需要由同组的等待方通知结束。

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;
use tracing::info;

/// 同组各 Run 共享的完成信号
#[derive(Debug, Clone)]
pub struct FragmentGroup {
    inner: Arc<GroupState>,
}

#[derive(Debug)]
struct GroupState {
    waiting: usize,
    pending: AtomicUsize,
    failed: Mutex<Option<String>>,
    done: CancellationToken,
}

impl FragmentGroup {
    /// `waiting`：组内含等待集合的分片数
    pub fn new(waiting: usize) -> Self {
        Self {
            inner: Arc::new(GroupState {
                waiting,
                pending: AtomicUsize::new(waiting),
                failed: Mutex::new(None),
                done: CancellationToken::new(),
            }),
        }
    }

    /// 组内是否有分片能触发结束
    pub fn has_waiters(&self) -> bool {
        self.inner.waiting > 0
    }

    /// 含等待集合的分片结束时调用；全部成功或任一失败都会触发结束
    pub fn report(&self, run_id: &str, success: bool) {
        if !success {
            if let Ok(mut f) = self.inner.failed.lock() {
                f.get_or_insert_with(|| run_id.to_string());
            }
            info!(run_id, "同组等待方失败，通知其余分片结束");
            self.inner.done.cancel();
            return;
        }
        let left = self
            .inner
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .map(|prev| prev - 1)
            .unwrap_or(0);
        if left == 0 {
            info!(run_id, "同组等待集合全部结束");
            self.inner.done.cancel();
        }
    }

    pub fn is_done(&self) -> bool {
        self.inner.done.is_cancelled()
    }

    pub async fn finished(&self) {
        self.inner.done.cancelled().await
    }

    /// 失败的等待方 Run；为 `None` 表示正常结束
    pub fn failure(&self) -> Option<String> {
        self.inner.failed.lock().ok().and_then(|f| f.clone())
    }
}
