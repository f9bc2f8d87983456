//! Run 输出记录
//!
//! 每次 Run 一份 JSON：元数据、起止时间、成功/中断标记、错误分类，
//! 以及每个仿真器的命令行、退出状态与带时间戳的输出行。

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{OrchError, Result};

/// 当前墙钟时间（Unix 秒）
pub fn now_ts() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// 一行捕获的输出
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputLine {
    pub ts: f64,
    pub line: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimOutput {
    pub class: String,
    pub argv: Vec<String>,
    /// 在启动序列中的位置
    pub launch_index: usize,
    #[serde(default)]
    pub start_time: Option<f64>,
    #[serde(default)]
    pub end_time: Option<f64>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub signal: Option<i32>,
    #[serde(default)]
    pub stdout: Vec<OutputLine>,
    #[serde(default)]
    pub stderr: Vec<OutputLine>,
}

impl SimOutput {
    pub fn stdout_text(&self) -> String {
        join_lines(&self.stdout)
    }

    pub fn stderr_text(&self) -> String {
        join_lines(&self.stderr)
    }

    /// 正常退出（退出码 0）
    pub fn exited_cleanly(&self) -> bool {
        self.exit_code == Some(0)
    }
}

fn join_lines(lines: &[OutputLine]) -> String {
    lines
        .iter()
        .map(|l| l.line.as_str())
        .collect::<Vec<_>>()
        .join("\n")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: String,
    pub message: String,
}

impl From<&OrchError> for ErrorRecord {
    fn from(e: &OrchError) -> Self {
        Self {
            kind: e.kind().to_string(),
            message: e.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationOutput {
    pub run_id: String,
    pub simulation: String,
    pub fragment: String,
    pub run_index: usize,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub start_time: f64,
    #[serde(default)]
    pub end_time: f64,
    pub success: bool,
    pub interrupted: bool,
    #[serde(default)]
    pub error: Option<ErrorRecord>,
    /// 实际启动顺序（full name）
    #[serde(default)]
    pub launch_order: Vec<String>,
    /// 以 `full_name()` 为键
    #[serde(default)]
    pub sims: BTreeMap<String, SimOutput>,
}

impl SimulationOutput {
    pub fn new(
        run_id: impl Into<String>,
        simulation: impl Into<String>,
        fragment: impl Into<String>,
        run_index: usize,
        metadata: BTreeMap<String, serde_json::Value>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            simulation: simulation.into(),
            fragment: fragment.into(),
            run_index,
            metadata,
            start_time: now_ts(),
            end_time: 0.0,
            success: false,
            interrupted: false,
            error: None,
            launch_order: Vec::new(),
            sims: BTreeMap::new(),
        }
    }

    /// 登记一个已启动的仿真器
    pub fn add_sim(&mut self, full_name: &str, class: &str, argv: Vec<String>) -> &mut SimOutput {
        let launch_index = self.launch_order.len();
        self.launch_order.push(full_name.to_string());
        self.sims.entry(full_name.to_string()).or_insert(SimOutput {
            class: class.to_string(),
            argv,
            launch_index,
            start_time: Some(now_ts()),
            end_time: None,
            exit_code: None,
            signal: None,
            stdout: Vec::new(),
            stderr: Vec::new(),
        })
    }

    pub fn sim(&self, full_name: &str) -> Option<&SimOutput> {
        self.sims.get(full_name)
    }

    pub fn sim_mut(&mut self, full_name: &str) -> Option<&mut SimOutput> {
        self.sims.get_mut(full_name)
    }

    /// 记录失败；中断类错误同时置 `interrupted`
    pub fn record_error(&mut self, err: &OrchError) {
        self.success = false;
        if err.is_interrupt() {
            self.interrupted = true;
        }
        self.error = Some(ErrorRecord::from(err));
    }

    pub fn finish(&mut self, success: bool) {
        self.success = success && self.error.is_none();
        self.end_time = now_ts();
    }

    pub fn dump(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(|e| OrchError::io(dir, e))?;
        }
        let raw = serde_json::to_string_pretty(self)?;
        fs::write(path, raw).map_err(|e| OrchError::io(path, e))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|e| OrchError::io(path, e))?;
        Ok(serde_json::from_str(&raw)?)
    }
}
