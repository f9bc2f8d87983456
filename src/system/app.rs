//! 主机应用
//!
//! 描述在仿真主机内执行的负载：检查点前后的准备命令、测量期间的命令与清理命令。

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// 应用类型
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "app", rename_all = "snake_case")]
pub enum AppKind {
    /// 任意 shell 命令
    Generic {
        #[serde(default)]
        pre_cp: Vec<String>,
        #[serde(default)]
        post_cp: Vec<String>,
        cmds: Vec<String>,
        #[serde(default)]
        cleanup: Vec<String>,
        #[serde(default)]
        files: BTreeMap<String, String>,
    },
    Sleep {
        secs: u64,
    },
    /// 永不退出，通常作为被动一端
    Idle,
    PingClient {
        server_ip: String,
        #[serde(default = "default_ping_count")]
        count: u32,
    },
    NetperfServer,
    NetperfClient {
        server_ip: String,
        #[serde(default = "default_netperf_duration")]
        duration_tp: u32,
        #[serde(default = "default_netperf_duration")]
        duration_lat: u32,
    },
    IperfTcpServer,
    IperfTcpClient {
        server_ip: String,
        #[serde(default = "default_iperf_duration")]
        duration: u32,
    },
}

fn default_ping_count() -> u32 {
    10
}

fn default_netperf_duration() -> u32 {
    10
}

fn default_iperf_duration() -> u32 {
    10
}

/// 主机上的一个应用；`wait` 为真表示它是测量负载，它的正常退出标志 Run 成功
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Application {
    #[serde(flatten)]
    pub kind: AppKind,
    #[serde(default)]
    pub wait: bool,
}

impl Application {
    pub fn new(kind: AppKind) -> Self {
        Self { kind, wait: false }
    }

    /// 标记为测量负载
    pub fn waiting(mut self) -> Self {
        self.wait = true;
        self
    }

    pub fn prepare_pre_cp(&self) -> Vec<String> {
        match &self.kind {
            AppKind::Generic { pre_cp, .. } => pre_cp.clone(),
            _ => Vec::new(),
        }
    }

    pub fn prepare_post_cp(&self) -> Vec<String> {
        match &self.kind {
            AppKind::Generic { post_cp, .. } => post_cp.clone(),
            _ => Vec::new(),
        }
    }

    pub fn run_cmds(&self) -> Vec<String> {
        match &self.kind {
            AppKind::Generic { cmds, .. } => cmds.clone(),
            AppKind::Sleep { secs } => vec![format!("sleep {secs}")],
            AppKind::Idle => vec!["sleep infinity".to_string()],
            AppKind::PingClient { server_ip, count } => {
                vec![format!("ping {server_ip} -c {count}")]
            }
            AppKind::NetperfServer => vec!["netserver".to_string(), "sleep infinity".to_string()],
            AppKind::NetperfClient {
                server_ip,
                duration_tp,
                duration_lat,
            } => vec![
                "netserver".to_string(),
                "sleep 0.5".to_string(),
                format!("netperf -H {server_ip} -l {duration_tp}"),
                format!(
                    "netperf -H {server_ip} -l {duration_lat} -t TCP_RR -- -o mean_latency,p50_latency,p90_latency,p99_latency"
                ),
            ],
            AppKind::IperfTcpServer => vec!["iperf -s -l 32M -w 32M".to_string()],
            AppKind::IperfTcpClient {
                server_ip,
                duration,
            } => vec![
                "sleep 1".to_string(),
                format!("iperf -l 32M -w 32M -c {server_ip} -i 1 -t {duration}"),
            ],
        }
    }

    pub fn cleanup_cmds(&self) -> Vec<String> {
        match &self.kind {
            AppKind::Generic { cleanup, .. } => cleanup.clone(),
            _ => Vec::new(),
        }
    }

    /// 额外放入 `guest/` 的文件（相对路径 -> 内容）
    pub fn config_files(&self) -> BTreeMap<String, String> {
        match &self.kind {
            AppKind::Generic { files, .. } => files.clone(),
            _ => BTreeMap::new(),
        }
    }
}
