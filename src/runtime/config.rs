//! Run 的时限与重试配置

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// 代理承载链路的重试策略（指数退避）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyRetry {
    pub attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// 单次尝试等待承载链路就绪的上限
    pub connect_timeout: Duration,
    /// 代理在 stdout 打印含此标记的行即视为承载链路已建立
    pub ready_marker: Option<String>,
    /// 未配置标记时，代理需在监听 socket 出现后存活这么久才算就绪
    pub settle: Duration,
}

impl Default for ProxyRetry {
    fn default() -> Self {
        Self {
            attempts: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
            connect_timeout: Duration::from_secs(10),
            ready_marker: None,
            settle: Duration::from_secs(1),
        }
    }
}

impl ProxyRetry {
    /// 第 `attempt` 次失败（从 1 计）之后的等待时间
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub socket_timeout: Duration,
    /// 全局时限；未设置时取仿真自带的 `timeout`
    pub run_timeout: Option<Duration>,
    pub grace_int: Duration,
    pub grace_term: Duration,
    pub poll_interval: Duration,
    pub proxy_retry: ProxyRetry,
    /// 子进程输出同时以 debug 级别打印
    pub verbose: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            socket_timeout: Duration::from_secs(30),
            run_timeout: None,
            grace_int: Duration::from_secs(5),
            grace_term: Duration::from_secs(5),
            poll_interval: Duration::from_millis(100),
            proxy_retry: ProxyRetry::default(),
            verbose: false,
        }
    }
}
