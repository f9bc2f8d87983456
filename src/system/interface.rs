//! 接口与系统通道

use serde::{Deserialize, Serialize};

use super::id::{ChannelId, ComponentId, InterfaceId};
use crate::util::Keyed;

/// 接口类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterfaceKind {
    PcieHost,
    PcieDevice,
    EthPort,
    MemHost,
    MemDevice,
}

impl InterfaceKind {
    /// 两端接口类型是否允许相连
    pub fn compatible(self, other: InterfaceKind) -> bool {
        use InterfaceKind::*;
        matches!(
            (self, other),
            (PcieHost, PcieDevice)
                | (PcieDevice, PcieHost)
                | (MemHost, MemDevice)
                | (MemDevice, MemHost)
                | (EthPort, EthPort)
        )
    }

    /// 接口族（用于通道分类与 socket 命名）
    pub fn family(self) -> InterfaceFamily {
        match self {
            InterfaceKind::PcieHost | InterfaceKind::PcieDevice => InterfaceFamily::Pcie,
            InterfaceKind::EthPort => InterfaceFamily::Eth,
            InterfaceKind::MemHost | InterfaceKind::MemDevice => InterfaceFamily::Mem,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterfaceFamily {
    Pcie,
    Eth,
    Mem,
}

impl std::fmt::Display for InterfaceFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            InterfaceFamily::Pcie => "pci",
            InterfaceFamily::Eth => "eth",
            InterfaceFamily::Mem => "mem",
        };
        f.write_str(s)
    }
}

/// 组件上的一个接口；最多连接一条通道
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interface {
    pub id: InterfaceId,
    pub component: ComponentId,
    pub kind: InterfaceKind,
    #[serde(default)]
    pub channel: Option<ChannelId>,
}

impl Interface {
    pub fn new(id: InterfaceId, component: ComponentId, kind: InterfaceKind) -> Self {
        Self {
            id,
            component,
            kind,
            channel: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.channel.is_some()
    }
}

impl Keyed for Interface {
    type Key = InterfaceId;
    fn key(&self) -> InterfaceId {
        self.id
    }
}

/// 系统通道：两个接口组成的无序对，带时延（纳秒）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub id: ChannelId,
    pub a: InterfaceId,
    pub b: InterfaceId,
    pub latency: u64,
}

impl Channel {
    pub fn new(id: ChannelId, a: InterfaceId, b: InterfaceId, latency: u64) -> Self {
        Self { id, a, b, latency }
    }

    /// 给定一端，返回另一端
    pub fn opposite(&self, iface: InterfaceId) -> Option<InterfaceId> {
        if iface == self.a {
            Some(self.b)
        } else if iface == self.b {
            Some(self.a)
        } else {
            None
        }
    }
}

impl Keyed for Channel {
    type Key = ChannelId;
    fn key(&self) -> ChannelId {
        self.id
    }
}
