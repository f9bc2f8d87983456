//! 标识符类型
//!
//! 所有建模对象的唯一标识符，均由所属 System 的单调计数器分配。

use serde::{Deserialize, Serialize};

macro_rules! define_id {
    ($($(#[$meta:meta])* $name:ident),* $(,)?) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
            #[serde(transparent)]
            pub struct $name(pub u64);

            impl std::fmt::Display for $name {
                fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                    write!(f, "{}", self.0)
                }
            }
        )*
    };
}

define_id!(
    /// 组件标识符
    ComponentId,
    /// 接口标识符
    InterfaceId,
    /// 系统通道标识符
    ChannelId,
    /// 仿真器标识符
    SimulatorId,
    /// 仿真通道标识符
    SimChannelId,
    /// 分片标识符
    FragmentId,
    /// 代理标识符
    ProxyId,
);

/// 单调递增的 id 生成器
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdGen {
    next: u64,
}

impl IdGen {
    pub fn next(&mut self) -> u64 {
        let id = self.next;
        self.next += 1;
        id
    }

    /// 确保之后分配的 id 大于 `seen`（JSON 重建后调用）
    pub fn bump_past(&mut self, seen: u64) {
        self.next = self.next.max(seen + 1);
    }

    pub fn peek(&self) -> u64 {
        self.next
    }
}
