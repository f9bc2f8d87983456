//! socket 角色与能力

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// socket 角色（从编排器视角）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SocketType {
    Listen,
    Connect,
}

impl SocketType {
    pub fn opposite(self) -> SocketType {
        match self {
            SocketType::Listen => SocketType::Connect,
            SocketType::Connect => SocketType::Listen,
        }
    }
}

/// 某接口上支持的角色集合
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SocketTypes {
    pub listen: bool,
    pub connect: bool,
}

impl SocketTypes {
    pub const NONE: SocketTypes = SocketTypes {
        listen: false,
        connect: false,
    };
    pub const LISTEN: SocketTypes = SocketTypes {
        listen: true,
        connect: false,
    };
    pub const CONNECT: SocketTypes = SocketTypes {
        listen: false,
        connect: true,
    };
    pub const BOTH: SocketTypes = SocketTypes {
        listen: true,
        connect: true,
    };

    pub fn supports(self, t: SocketType) -> bool {
        match t {
            SocketType::Listen => self.listen,
            SocketType::Connect => self.connect,
        }
    }

    /// 恰好只支持一种角色时返回该角色
    pub fn only(self) -> Option<SocketType> {
        match (self.listen, self.connect) {
            (true, false) => Some(SocketType::Listen),
            (false, true) => Some(SocketType::Connect),
            _ => None,
        }
    }

    pub fn is_empty(self) -> bool {
        !self.listen && !self.connect
    }
}

/// SimBricks 汇合点：文件系统路径 + 角色
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Socket {
    pub path: PathBuf,
    pub role: SocketType,
}

impl Socket {
    pub fn flipped(&self) -> Socket {
        Socket {
            path: self.path.clone(),
            role: self.role.opposite(),
        }
    }
}
