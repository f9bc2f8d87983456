//! 错误类型
//!
//! 编排器所有组件共享的错误分类：图构建、依赖解析、时序、执行与运行时。

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// 编排器错误
#[derive(Debug, Error)]
pub enum OrchError {
    #[error("invalid graph: {0}")]
    InvalidGraph(String),

    #[error("component {component} is already bound to simulator `{owner}`")]
    DuplicateBinding { component: u64, owner: String },

    #[error("no socket role assignment satisfies channel {channel} ({a} <-> {b})")]
    UnsatisfiableSocketRoles { channel: u64, a: String, b: String },

    #[error("interface {iface} of `{sim}` crosses fragments but no proxy in fragment {fragment} carries it")]
    UnassignedInterface {
        iface: u64,
        sim: String,
        fragment: u64,
    },

    #[error("cyclic start dependency among: {}", .0.join(", "))]
    CyclicDependency(Vec<String>),

    #[error("inconsistent timing: {0}")]
    InconsistentTiming(String),

    #[error("socket {} did not appear within {timeout:?}", path.display())]
    SocketTimeout { path: PathBuf, timeout: Duration },

    #[error("simulator `{name}` exited unexpectedly ({status})")]
    ChildCrashed { name: String, status: String },

    #[error("run exceeded its {0:?} budget")]
    RunTimeout(Duration),

    #[error("executor error: {0}")]
    Executor(String),

    #[error("proxy `{proxy}` could not reach its partner after {attempts} attempts")]
    ProxyCarrierUnreachable { proxy: String, attempts: u32 },

    #[error("run cancelled")]
    Cancelled,

    #[error("disk image `{image}` offers no format supported by `{sim}`")]
    ImageFormatUnsupported { image: String, sim: String },

    #[error("prerequisite run `{0}` did not succeed")]
    PrerequisiteFailed(String),

    #[error("run `{0}` of the same group failed")]
    PeerFragmentFailed(String),

    #[error("io error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl OrchError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        OrchError::Io {
            path: path.into(),
            source,
        }
    }

    /// 写入输出记录的稳定分类名
    pub fn kind(&self) -> &'static str {
        match self {
            OrchError::InvalidGraph(_) => "InvalidGraph",
            OrchError::DuplicateBinding { .. } => "DuplicateBinding",
            OrchError::UnsatisfiableSocketRoles { .. } => "UnsatisfiableSocketRoles",
            OrchError::UnassignedInterface { .. } => "UnassignedInterface",
            OrchError::CyclicDependency(_) => "CyclicDependency",
            OrchError::InconsistentTiming(_) => "InconsistentTiming",
            OrchError::SocketTimeout { .. } => "SocketTimeout",
            OrchError::ChildCrashed { .. } => "ChildCrashed",
            OrchError::RunTimeout(_) => "RunTimeout",
            OrchError::Executor(_) => "ExecutorError",
            OrchError::ProxyCarrierUnreachable { .. } => "ProxyCarrierUnreachable",
            OrchError::Cancelled => "Cancelled",
            OrchError::ImageFormatUnsupported { .. } => "ImageFormatUnsupported",
            OrchError::PrerequisiteFailed(_) => "PrerequisiteFailed",
            OrchError::PeerFragmentFailed(_) => "PeerFragmentFailed",
            OrchError::Io { .. } => "ExecutorError",
            OrchError::Json(_) => "Json",
        }
    }

    /// 是否属于中断类错误（用户取消或全局超时）
    pub fn is_interrupt(&self) -> bool {
        matches!(self, OrchError::Cancelled | OrchError::RunTimeout(_))
    }
}

pub type Result<T> = std::result::Result<T, OrchError>;
