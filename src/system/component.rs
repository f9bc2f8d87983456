//! 组件类型
//!
//! 组件持有有序接口列表；具体类别用枚举组合表达，而不是继承层次。

use serde::{Deserialize, Serialize};

use super::host::HostConfig;
use super::id::{ComponentId, InterfaceId};
use super::interface::InterfaceKind;
use crate::util::Keyed;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NicConfig {
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub mac: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemDeviceConfig {
    /// 字节数
    pub size: u64,
    pub addr: u64,
    #[serde(default)]
    pub as_id: u32,
}

/// 内存互连路由项：虚拟地址区间 [vaddr_lo, vaddr_hi) 映射到下游接口上的物理地址
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemRoute {
    pub as_id: u32,
    pub vaddr_lo: u64,
    pub vaddr_hi: u64,
    pub paddr: u64,
    pub downstream: InterfaceId,
}

impl MemRoute {
    pub fn overlaps(&self, other: &MemRoute) -> bool {
        self.as_id == other.as_id
            && self.vaddr_lo < other.vaddr_hi
            && other.vaddr_lo < self.vaddr_hi
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ComponentKind {
    Host(HostConfig),
    PcieDevice,
    Nic(NicConfig),
    EthSwitch,
    EthWire,
    MemDevice(MemDeviceConfig),
    MemInterconnect {
        #[serde(default)]
        routes: Vec<MemRoute>,
    },
}

impl ComponentKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            ComponentKind::Host(_) => "host",
            ComponentKind::PcieDevice => "pcie_device",
            ComponentKind::Nic(_) => "nic",
            ComponentKind::EthSwitch => "eth_switch",
            ComponentKind::EthWire => "eth_wire",
            ComponentKind::MemDevice(_) => "mem_device",
            ComponentKind::MemInterconnect { .. } => "mem_interconnect",
        }
    }

    /// 该类组件允许的接口类型及上限（None 表示不限）
    fn capacity(&self, kind: InterfaceKind) -> Option<Option<usize>> {
        use InterfaceKind::*;
        match (self, kind) {
            (ComponentKind::Host(_), PcieHost | MemHost | EthPort) => Some(None),
            (ComponentKind::PcieDevice, PcieDevice) => Some(Some(1)),
            (ComponentKind::Nic(_), PcieDevice | EthPort) => Some(Some(1)),
            (ComponentKind::EthSwitch, EthPort) => Some(None),
            (ComponentKind::EthWire, EthPort) => Some(Some(2)),
            (ComponentKind::MemDevice(_), MemDevice) => Some(Some(1)),
            (ComponentKind::MemInterconnect { .. }, MemDevice) => Some(Some(1)),
            (ComponentKind::MemInterconnect { .. }, MemHost) => Some(None),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Component {
    pub id: ComponentId,
    pub name: String,
    #[serde(default)]
    pub interfaces: Vec<InterfaceId>,
    #[serde(flatten)]
    pub kind: ComponentKind,
}

impl Component {
    pub fn new(id: ComponentId, name: impl Into<String>, kind: ComponentKind) -> Self {
        Self {
            id,
            name: name.into(),
            interfaces: Vec::new(),
            kind,
        }
    }

    /// 在已有接口类型为 `existing` 时能否再加一个 `kind` 接口
    pub fn accepts(&self, existing: &[InterfaceKind], kind: InterfaceKind) -> Result<(), String> {
        match self.kind.capacity(kind) {
            None => Err(format!(
                "{} `{}` does not take {:?} interfaces",
                self.kind.type_name(),
                self.name,
                kind
            )),
            Some(Some(max)) if existing.iter().filter(|k| **k == kind).count() >= max => {
                Err(format!(
                    "{} `{}` already has {} {:?} interface(s)",
                    self.kind.type_name(),
                    self.name,
                    max,
                    kind
                ))
            }
            Some(_) => Ok(()),
        }
    }

    pub fn host(&self) -> Option<&HostConfig> {
        match &self.kind {
            ComponentKind::Host(cfg) => Some(cfg),
            _ => None,
        }
    }
}

impl Keyed for Component {
    type Key = ComponentId;
    fn key(&self) -> ComponentId {
        self.id
    }
}
