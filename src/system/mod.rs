//! 系统模型
//!
//! 描述待仿真的物理/虚拟拓扑：组件、接口、带时延的通道，以及主机上的应用与磁盘镜像。

mod app;
mod component;
mod disk;
mod host;
mod id;
mod interface;
#[allow(clippy::module_inception)]
mod system;

pub use app::{AppKind, Application};
pub use component::{Component, ComponentKind, MemDeviceConfig, MemRoute, NicConfig};
pub use disk::{DiskFormat, DiskImage, DiskPrep};
pub use host::{HostConfig, NicDriver};
pub use id::{
    ChannelId, ComponentId, FragmentId, IdGen, InterfaceId, ProxyId, SimChannelId, SimulatorId,
};
pub use interface::{Channel, Interface, InterfaceFamily, InterfaceKind};
pub use system::System;
