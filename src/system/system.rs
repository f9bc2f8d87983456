//! 系统图
//!
//! 组件、接口、通道三张按 id 索引的表；接口与通道之间只通过 id 互相引用。

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::component::{Component, ComponentKind, MemDeviceConfig, MemRoute, NicConfig};
use super::host::HostConfig;
use super::id::{ChannelId, ComponentId, IdGen, InterfaceId};
use super::interface::{Channel, Interface, InterfaceKind};
use crate::error::{OrchError, Result};
use crate::util::id_table;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct System {
    #[serde(default)]
    ids: IdGen,
    #[serde(with = "id_table")]
    components: BTreeMap<ComponentId, Component>,
    #[serde(with = "id_table")]
    interfaces: BTreeMap<InterfaceId, Interface>,
    #[serde(with = "id_table")]
    channels: BTreeMap<ChannelId, Channel>,
}

impl System {
    pub fn new() -> Self {
        Self::default()
    }

    /// 分配一个新 id（仿真、实例化层的对象也从这里取号）
    pub fn alloc_id(&mut self) -> u64 {
        self.ids.next()
    }

    /// 之后分配的 id 一律大于 `seen`
    pub(crate) fn reserve_past(&mut self, seen: u64) {
        self.ids.bump_past(seen);
    }

    // ---- 底层注册接口 ----

    /// 注册组件；重复 id 报 `InvalidGraph`
    pub fn add(&mut self, component: Component) -> Result<ComponentId> {
        let id = component.id;
        if self.components.contains_key(&id) {
            return Err(OrchError::InvalidGraph(format!(
                "component {id} registered twice"
            )));
        }
        if !component.interfaces.is_empty() {
            return Err(OrchError::InvalidGraph(format!(
                "component {id} must be registered before its interfaces"
            )));
        }
        self.ids.bump_past(id.0);
        self.components.insert(id, component);
        Ok(id)
    }

    /// 注册接口并挂到所属组件上
    pub fn add_if(&mut self, iface: Interface) -> Result<InterfaceId> {
        let id = iface.id;
        if self.interfaces.contains_key(&id) {
            return Err(OrchError::InvalidGraph(format!(
                "interface {id} registered twice"
            )));
        }
        if iface.channel.is_some() {
            return Err(OrchError::InvalidGraph(format!(
                "interface {id} must be registered unconnected"
            )));
        }
        let existing: Vec<InterfaceKind> = {
            let comp = self.component(iface.component)?;
            comp.interfaces
                .iter()
                .filter_map(|i| self.interfaces.get(i).map(|x| x.kind))
                .collect()
        };
        let comp = self
            .components
            .get_mut(&iface.component)
            .ok_or_else(|| OrchError::InvalidGraph(format!("unknown component {}", iface.component)))?;
        comp.accepts(&existing, iface.kind)
            .map_err(OrchError::InvalidGraph)?;
        comp.interfaces.push(id);
        self.ids.bump_past(id.0);
        self.interfaces.insert(id, iface);
        Ok(id)
    }

    /// 注册通道：两端必须是本系统内、互不相同、尚未连接且类型相容的接口
    pub fn connect(&mut self, channel: Channel) -> Result<ChannelId> {
        let id = channel.id;
        if self.channels.contains_key(&id) {
            return Err(OrchError::InvalidGraph(format!(
                "channel {id} registered twice"
            )));
        }
        if channel.a == channel.b {
            return Err(OrchError::InvalidGraph(format!(
                "channel {id} connects interface {} to itself",
                channel.a
            )));
        }
        let a = self.interface(channel.a)?;
        let b = self.interface(channel.b)?;
        if let Some(c) = a.channel.or(b.channel) {
            return Err(OrchError::InvalidGraph(format!(
                "channel {id}: endpoint already connected by channel {c}"
            )));
        }
        if !a.kind.compatible(b.kind) {
            return Err(OrchError::InvalidGraph(format!(
                "channel {id}: cannot connect {:?} to {:?}",
                a.kind, b.kind
            )));
        }
        debug!(channel = %id, a = %channel.a, b = %channel.b, latency = channel.latency, "注册通道");
        for end in [channel.a, channel.b] {
            if let Some(iface) = self.interfaces.get_mut(&end) {
                iface.channel = Some(id);
            }
        }
        self.ids.bump_past(id.0);
        self.channels.insert(id, channel);
        Ok(id)
    }

    // ---- 便捷构建接口 ----

    pub fn add_component(&mut self, name: impl Into<String>, kind: ComponentKind) -> Result<ComponentId> {
        let id = ComponentId(self.alloc_id());
        self.add(Component::new(id, name, kind))
    }

    pub fn new_if(&mut self, component: ComponentId, kind: InterfaceKind) -> Result<InterfaceId> {
        let id = InterfaceId(self.alloc_id());
        self.add_if(Interface::new(id, component, kind))
    }

    pub fn link(&mut self, a: InterfaceId, b: InterfaceId, latency: u64) -> Result<ChannelId> {
        let id = ChannelId(self.alloc_id());
        self.connect(Channel::new(id, a, b, latency))
    }

    pub fn add_host(&mut self, name: impl Into<String>, cfg: HostConfig) -> Result<ComponentId> {
        self.add_component(name, ComponentKind::Host(cfg))
    }

    /// 添加网卡：同时创建一个 PCIe 设备接口和一个以太网接口
    pub fn add_nic(&mut self, name: impl Into<String>, cfg: NicConfig) -> Result<ComponentId> {
        let id = self.add_component(name, ComponentKind::Nic(cfg))?;
        self.new_if(id, InterfaceKind::PcieDevice)?;
        self.new_if(id, InterfaceKind::EthPort)?;
        Ok(id)
    }

    pub fn add_pcie_device(&mut self, name: impl Into<String>) -> Result<ComponentId> {
        let id = self.add_component(name, ComponentKind::PcieDevice)?;
        self.new_if(id, InterfaceKind::PcieDevice)?;
        Ok(id)
    }

    pub fn add_switch(&mut self, name: impl Into<String>) -> Result<ComponentId> {
        self.add_component(name, ComponentKind::EthSwitch)
    }

    pub fn add_wire(&mut self, name: impl Into<String>) -> Result<ComponentId> {
        self.add_component(name, ComponentKind::EthWire)
    }

    pub fn add_mem_device(&mut self, name: impl Into<String>, cfg: MemDeviceConfig) -> Result<ComponentId> {
        let id = self.add_component(name, ComponentKind::MemDevice(cfg))?;
        self.new_if(id, InterfaceKind::MemDevice)?;
        Ok(id)
    }

    /// 内存互连：上游一个 MemDevice 接口（朝向主机），下游接口随连接创建
    pub fn add_mem_interconnect(&mut self, name: impl Into<String>) -> Result<ComponentId> {
        let id = self.add_component(name, ComponentKind::MemInterconnect { routes: Vec::new() })?;
        self.new_if(id, InterfaceKind::MemDevice)?;
        Ok(id)
    }

    /// 主机通过新建的 PCIe 主机接口连到设备（或网卡）的 PCIe 设备接口
    pub fn connect_pcie(&mut self, host: ComponentId, dev: ComponentId, latency: u64) -> Result<ChannelId> {
        let dev_if = self.free_if(dev, InterfaceKind::PcieDevice)?;
        let host_if = self.new_if(host, InterfaceKind::PcieHost)?;
        self.link(host_if, dev_if, latency)
    }

    /// 以太网连接；交换机/线缆/主机按需新建端口，网卡使用自带端口
    pub fn connect_eth(&mut self, a: ComponentId, b: ComponentId, latency: u64) -> Result<ChannelId> {
        let ia = self.eth_port_for(a)?;
        let ib = self.eth_port_for(b)?;
        self.link(ia, ib, latency)
    }

    /// 主机（或内存互连的下游）连到内存设备（或内存互连的上游）
    pub fn connect_mem(&mut self, host: ComponentId, dev: ComponentId, latency: u64) -> Result<ChannelId> {
        let dev_if = self.free_if(dev, InterfaceKind::MemDevice)?;
        let host_if = self.new_if(host, InterfaceKind::MemHost)?;
        self.link(host_if, dev_if, latency)
    }

    pub fn add_mem_route(&mut self, interconnect: ComponentId, route: MemRoute) -> Result<()> {
        let owns = self.interface(route.downstream)?.component == interconnect;
        let comp = self
            .components
            .get_mut(&interconnect)
            .ok_or_else(|| OrchError::InvalidGraph(format!("unknown component {interconnect}")))?;
        let ComponentKind::MemInterconnect { routes } = &mut comp.kind else {
            return Err(OrchError::InvalidGraph(format!(
                "component `{}` is not a memory interconnect",
                comp.name
            )));
        };
        if !owns {
            return Err(OrchError::InvalidGraph(format!(
                "route target {} is not an interface of `{}`",
                route.downstream, comp.name
            )));
        }
        routes.push(route);
        Ok(())
    }

    fn eth_port_for(&mut self, comp: ComponentId) -> Result<InterfaceId> {
        match self.component(comp)?.kind {
            ComponentKind::Nic(_) => self.free_if(comp, InterfaceKind::EthPort),
            _ => self.new_if(comp, InterfaceKind::EthPort),
        }
    }

    fn free_if(&self, comp: ComponentId, kind: InterfaceKind) -> Result<InterfaceId> {
        let c = self.component(comp)?;
        c.interfaces
            .iter()
            .copied()
            .find(|i| {
                self.interfaces
                    .get(i)
                    .is_some_and(|x| x.kind == kind && x.channel.is_none())
            })
            .ok_or_else(|| {
                OrchError::InvalidGraph(format!("`{}` has no free {:?} interface", c.name, kind))
            })
    }

    // ---- 查询 ----

    pub fn component(&self, id: ComponentId) -> Result<&Component> {
        self.components
            .get(&id)
            .ok_or_else(|| OrchError::InvalidGraph(format!("unknown component {id}")))
    }

    pub fn component_mut(&mut self, id: ComponentId) -> Result<&mut Component> {
        self.components
            .get_mut(&id)
            .ok_or_else(|| OrchError::InvalidGraph(format!("unknown component {id}")))
    }

    pub fn interface(&self, id: InterfaceId) -> Result<&Interface> {
        self.interfaces
            .get(&id)
            .ok_or_else(|| OrchError::InvalidGraph(format!("unknown interface {id}")))
    }

    pub fn channel(&self, id: ChannelId) -> Result<&Channel> {
        self.channels
            .get(&id)
            .ok_or_else(|| OrchError::InvalidGraph(format!("unknown channel {id}")))
    }

    pub fn components(&self) -> impl Iterator<Item = &Component> {
        self.components.values()
    }

    pub fn interfaces(&self) -> impl Iterator<Item = &Interface> {
        self.interfaces.values()
    }

    pub fn channels(&self) -> impl Iterator<Item = &Channel> {
        self.channels.values()
    }

    /// 接口对端（未连接时为 None）
    pub fn opposite(&self, iface: InterfaceId) -> Result<Option<&Interface>> {
        let Some(ch) = self.interface(iface)?.channel else {
            return Ok(None);
        };
        let ch = self.channel(ch)?;
        let other = ch
            .opposite(iface)
            .ok_or_else(|| OrchError::InvalidGraph(format!("channel {} does not touch {iface}", ch.id)))?;
        self.interface(other).map(Some)
    }

    /// 检查系统不变量
    pub fn validate(&self) -> Result<()> {
        for iface in self.interfaces.values() {
            let comp = self.component(iface.component)?;
            if !comp.interfaces.contains(&iface.id) {
                return Err(OrchError::InvalidGraph(format!(
                    "interface {} not listed by its component `{}`",
                    iface.id, comp.name
                )));
            }
            if let Some(ch) = iface.channel {
                let ch = self.channel(ch)?;
                if ch.a != iface.id && ch.b != iface.id {
                    return Err(OrchError::InvalidGraph(format!(
                        "interface {} points at channel {} which does not touch it",
                        iface.id, ch.id
                    )));
                }
            }
        }
        for ch in self.channels.values() {
            if ch.a == ch.b {
                return Err(OrchError::InvalidGraph(format!(
                    "channel {} has identical endpoints",
                    ch.id
                )));
            }
            let a = self.interface(ch.a)?;
            let b = self.interface(ch.b)?;
            if a.channel != Some(ch.id) || b.channel != Some(ch.id) {
                return Err(OrchError::InvalidGraph(format!(
                    "channel {} endpoints do not point back at it",
                    ch.id
                )));
            }
            if !a.kind.compatible(b.kind) {
                return Err(OrchError::InvalidGraph(format!(
                    "channel {}: cannot connect {:?} to {:?}",
                    ch.id, a.kind, b.kind
                )));
            }
        }
        for comp in self.components.values() {
            let kinds: Vec<InterfaceKind> = comp
                .interfaces
                .iter()
                .map(|i| self.interface(*i).map(|x| x.kind))
                .collect::<Result<_>>()?;
            let eth = kinds.iter().filter(|k| **k == InterfaceKind::EthPort).count();
            match &comp.kind {
                ComponentKind::EthWire if eth != 2 => {
                    return Err(OrchError::InvalidGraph(format!(
                        "wire `{}` must carry exactly two Ethernet interfaces, has {eth}",
                        comp.name
                    )));
                }
                ComponentKind::EthSwitch if eth < 2 => {
                    return Err(OrchError::InvalidGraph(format!(
                        "switch `{}` needs at least two ports, has {eth}",
                        comp.name
                    )));
                }
                ComponentKind::Nic(_)
                    if eth != 1 || !kinds.contains(&InterfaceKind::PcieDevice) || kinds.len() != 2 =>
                {
                    return Err(OrchError::InvalidGraph(format!(
                        "NIC `{}` must have exactly one PCIe device and one Ethernet interface",
                        comp.name
                    )));
                }
                ComponentKind::MemInterconnect { routes } => {
                    for (i, r) in routes.iter().enumerate() {
                        if r.vaddr_lo >= r.vaddr_hi {
                            return Err(OrchError::InvalidGraph(format!(
                                "`{}` route {i} has an empty address range",
                                comp.name
                            )));
                        }
                        if !comp.interfaces.contains(&r.downstream) {
                            return Err(OrchError::InvalidGraph(format!(
                                "`{}` route {i} targets foreign interface {}",
                                comp.name, r.downstream
                            )));
                        }
                        if routes[..i].iter().any(|o| o.overlaps(r)) {
                            return Err(OrchError::InvalidGraph(format!(
                                "`{}` route {i} overlaps an earlier route",
                                comp.name
                            )));
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// 从 JSON 重建并校验；id 计数器推进到已见最大 id 之后
    pub fn from_json(raw: &str) -> Result<Self> {
        let mut sys: System = serde_json::from_str(raw)?;
        sys.reindex()?;
        Ok(sys)
    }

    pub(crate) fn reindex(&mut self) -> Result<()> {
        let max = self
            .components
            .keys()
            .map(|k| k.0)
            .chain(self.interfaces.keys().map(|k| k.0))
            .chain(self.channels.keys().map(|k| k.0))
            .max();
        if let Some(max) = max {
            self.ids.bump_past(max);
        }
        self.validate_refs()
    }

    /// 重建后只检查引用完整性（拓扑约束留给 `validate`）
    fn validate_refs(&self) -> Result<()> {
        for iface in self.interfaces.values() {
            self.component(iface.component)?;
            if let Some(ch) = iface.channel {
                self.channel(ch)?;
            }
        }
        for ch in self.channels.values() {
            self.interface(ch.a)?;
            self.interface(ch.b)?;
        }
        for comp in self.components.values() {
            for i in &comp.interfaces {
                self.interface(*i)?;
            }
        }
        Ok(())
    }
}
