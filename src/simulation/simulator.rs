//! 仿真器
//!
//! `Simulator` 保存通用属性；具体仿真器是 `SimulatorKind` 的一个变体，
//! 通过 `SimBehavior` 提供 socket 能力、命令行与资源需求。

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::channel::{ChannelTiming, ChannelView};
use super::hosts::{Gem5Host, QemuHost, SimicsHost};
use super::mems::{BasicMem, MemSwitch};
use super::nets::{SwitchNet, WireNet};
use super::nics::NicSim;
use crate::error::{OrchError, Result};
use crate::instantiation::{Environment, Instantiation, Socket, SocketType, SocketTypes};
use crate::system::{
    Component, ComponentId, ComponentKind, DiskFormat, DiskPrep, HostConfig, Interface,
    InterfaceKind, SimChannelId, SimulatorId, System,
};
use crate::util::Keyed;

/// 资源需求
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    pub cores: u32,
    pub memory_mb: u64,
}

impl Resources {
    pub const fn new(cores: u32, memory_mb: u64) -> Self {
        Self { cores, memory_mb }
    }
}

impl std::ops::Add for Resources {
    type Output = Resources;
    fn add(self, o: Resources) -> Resources {
        Resources {
            cores: self.cores + o.cores,
            memory_mb: self.memory_mb + o.memory_mb,
        }
    }
}

/// 仿真器大类（决定 full_name 前缀）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimCategory {
    Host,
    Nic,
    Net,
    Mem,
}

impl SimCategory {
    fn prefix(self) -> &'static str {
        match self {
            SimCategory::Host => "host",
            SimCategory::Nic => "nic",
            SimCategory::Net => "net",
            SimCategory::Mem => "mem",
        }
    }
}

/// 各类仿真器的行为
pub trait SimBehavior: Send + Sync {
    fn class_name(&self) -> &'static str;

    fn category(&self) -> SimCategory;

    /// 能否接管该类组件
    fn accepts(&self, kind: &ComponentKind) -> bool;

    fn supported_socket_types(&self, iface: InterfaceKind) -> SocketTypes;

    fn supported_image_formats(&self) -> &'static [DiskFormat] {
        &[]
    }

    fn default_resources(&self) -> Resources;

    /// 按固定顺序生成命令行（与仿真器二进制的约定）
    fn run_cmd(&self, ctx: &SimContext<'_>) -> Result<Vec<String>>;

    /// 启动前需要运行完毕的准备命令
    fn prep_cmds(&self, _ctx: &SimContext<'_>) -> Result<Vec<Vec<String>>> {
        Ok(Vec::new())
    }

    /// 客户机内触发检查点的命令
    fn checkpoint_cmd(&self) -> Option<&'static str> {
        None
    }

    fn exit_cmd(&self) -> &'static str {
        "poweroff -f"
    }

    /// 预构建 qcow2 镜像是否经由写时复制副本使用
    fn uses_cow_overlay(&self) -> bool {
        false
    }

    /// 启动后需等待出现的 socket
    fn sockets_wait(&self, ctx: &SimContext<'_>) -> Result<Vec<PathBuf>> {
        ctx.listen_sockets()
    }

    /// 仿真器创建的共享内存文件（Run 结束时删除）
    fn shm_paths(&self, ctx: &SimContext<'_>) -> Result<Vec<PathBuf>> {
        if ctx.listen_sockets()?.is_empty() {
            Ok(Vec::new())
        } else {
            Ok(vec![ctx.env().dev_shm_path(ctx.name())])
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SimulatorKind {
    Qemu(QemuHost),
    Gem5(Gem5Host),
    Simics(SimicsHost),
    Nic(NicSim),
    Switch(SwitchNet),
    Wire(WireNet),
    BasicMem(BasicMem),
    MemSwitch(MemSwitch),
}

impl SimulatorKind {
    pub fn behavior(&self) -> &dyn SimBehavior {
        match self {
            SimulatorKind::Qemu(s) => s,
            SimulatorKind::Gem5(s) => s,
            SimulatorKind::Simics(s) => s,
            SimulatorKind::Nic(s) => s,
            SimulatorKind::Switch(s) => s,
            SimulatorKind::Wire(s) => s,
            SimulatorKind::BasicMem(s) => s,
            SimulatorKind::MemSwitch(s) => s,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Simulator {
    pub id: SimulatorId,
    pub name: String,
    #[serde(default)]
    pub components: Vec<ComponentId>,
    /// 覆盖默认资源需求
    #[serde(default)]
    pub resources: Option<Resources>,
    #[serde(default)]
    pub start_tick: u64,
    #[serde(default)]
    pub extra_args: Vec<String>,
    /// 覆盖由应用推导出的 wait 标记
    #[serde(default)]
    pub wait: Option<bool>,
    #[serde(flatten)]
    pub kind: SimulatorKind,
}

impl Simulator {
    pub fn new(id: SimulatorId, name: impl Into<String>, kind: SimulatorKind) -> Self {
        Self {
            id,
            name: name.into(),
            components: Vec::new(),
            resources: None,
            start_tick: 0,
            extra_args: Vec::new(),
            wait: None,
            kind,
        }
    }

    pub fn behavior(&self) -> &dyn SimBehavior {
        self.kind.behavior()
    }

    /// 输出记录里使用的键
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.behavior().category().prefix(), self.name)
    }

    pub fn resource_requirements(&self) -> Resources {
        self.resources
            .unwrap_or_else(|| self.behavior().default_resources())
    }

    /// 是否属于等待集合：显式覆盖优先，否则看主机应用是否被标记
    pub fn waits(&self, system: &System) -> bool {
        if let Some(w) = self.wait {
            return w;
        }
        self.components.iter().any(|c| {
            system
                .component(*c)
                .ok()
                .and_then(|c| c.host())
                .is_some_and(|h| h.wait())
        })
    }
}

impl Keyed for Simulator {
    type Key = SimulatorId;
    fn key(&self) -> SimulatorId {
        self.id
    }
}

/// 生成命令行时可见的上下文
pub struct SimContext<'a> {
    pub inst: &'a Instantiation,
    pub sim: &'a Simulator,
}

impl<'a> SimContext<'a> {
    pub fn new(inst: &'a Instantiation, sim: &'a Simulator) -> Self {
        Self { inst, sim }
    }

    pub fn env(&self) -> &'a Environment {
        &self.inst.env
    }

    pub fn system(&self) -> &'a System {
        &self.inst.simulation.system
    }

    pub fn name(&self) -> &'a str {
        &self.sim.name
    }

    pub fn components(&self) -> Result<Vec<&'a Component>> {
        self.sim
            .components
            .iter()
            .map(|c| self.system().component(*c))
            .collect()
    }

    /// 对端属于其他仿真器的接口，按组件、接口顺序排列
    pub fn ext_interfaces(&self) -> Result<Vec<&'a Interface>> {
        let system = self.system();
        let mut out = Vec::new();
        for comp in self.components()? {
            for iid in &comp.interfaces {
                let iface = system.interface(*iid)?;
                let Some(peer) = system.opposite(*iid)? else {
                    continue;
                };
                if self.inst.simulation.simulator_of(peer.component) != Some(self.sim.id) {
                    out.push(iface);
                }
            }
        }
        Ok(out)
    }

    pub fn ext_of(&self, kind: InterfaceKind) -> Result<Vec<&'a Interface>> {
        Ok(self
            .ext_interfaces()?
            .into_iter()
            .filter(|i| i.kind == kind)
            .collect())
    }

    pub fn socket(&self, iface: &Interface) -> Result<&'a Socket> {
        self.inst.socket(iface.id).ok_or_else(|| {
            OrchError::InvalidGraph(format!(
                "interface {} of `{}` has no socket assigned",
                iface.id, self.sim.name
            ))
        })
    }

    /// 指定类型接口的第一个 socket（单端口设备用）
    pub fn single_socket(&self, kind: InterfaceKind) -> Result<&'a Socket> {
        let ifs = self.ext_of(kind)?;
        let iface = ifs.first().ok_or_else(|| {
            OrchError::InvalidGraph(format!(
                "`{}` has no connected {:?} interface",
                self.sim.name, kind
            ))
        })?;
        self.socket(iface)
    }

    pub fn listen_sockets(&self) -> Result<Vec<PathBuf>> {
        let mut out = Vec::new();
        for iface in self.ext_interfaces()? {
            match self.inst.socket(iface.id) {
                Some(s) if s.role == SocketType::Listen => out.push(s.path.clone()),
                _ => {}
            }
        }
        Ok(out)
    }

    /// 对本仿真器所有外部通道做时序协调
    pub fn timing(&self) -> Result<ChannelTiming> {
        let system = self.system();
        let mut views = Vec::new();
        for iface in self.ext_interfaces()? {
            let Some(ch_id) = iface.channel else { continue };
            let ch = system.channel(ch_id)?;
            let simulation = &self.inst.simulation;
            let sim_ch = match simulation.sim_channel(ch_id) {
                Some(sc) => sc.clone(),
                None => simulation.channel_defaults(SimChannelId(0), ch_id, ch.latency)?,
            };
            views.push(ChannelView {
                family: iface.kind.family(),
                synchronized: sim_ch.synchronized,
                sync_period: sim_ch.sync_period,
                latency: ch.latency,
            });
        }
        ChannelTiming::reconcile(&self.sim.name, &views)
    }

    pub fn opposite_component(&self, iface: &Interface) -> Result<&'a Component> {
        let peer = self.system().opposite(iface.id)?.ok_or_else(|| {
            OrchError::InvalidGraph(format!("interface {} is disconnected", iface.id))
        })?;
        self.system().component(peer.component)
    }

    pub fn host(&self) -> Result<&'a HostConfig> {
        self.components()?
            .into_iter()
            .find_map(|c| c.host())
            .ok_or_else(|| {
                OrchError::InvalidGraph(format!("`{}` simulates no host", self.sim.name))
            })
    }

    /// 主机各磁盘的格式与准备动作
    pub fn disks(&self) -> Result<Vec<(DiskFormat, DiskPrep)>> {
        let behavior = self.sim.behavior();
        self.host()?
            .disks
            .iter()
            .map(|d| {
                d.prepare(
                    self.env(),
                    self.name(),
                    behavior.supported_image_formats(),
                    behavior.uses_cow_overlay(),
                )
            })
            .collect()
    }
}
