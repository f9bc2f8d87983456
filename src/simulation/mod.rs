//! 仿真模型
//!
//! 把系统组件绑定到具体仿真器，附加通道同步参数，并负责各仿真器的命令行生成。

mod channel;
mod cmd;
mod hosts;
mod mems;
mod nets;
mod nics;
#[allow(clippy::module_inception)]
mod simulation;
mod simulator;

pub use channel::{ChannelTiming, ChannelView, DEFAULT_SYNC_PERIOD_NS, SimChannel, TimeUnit};
pub use cmd::CmdBuilder;
pub use hosts::{Gem5Host, QemuHost, SimicsHost};
pub use mems::{BasicMem, MemSwitch, port_mac_rev};
pub use nets::{SwitchNet, WireNet};
pub use nics::{NicModel, NicSim};
pub use simulation::Simulation;
pub use simulator::{
    Resources, SimBehavior, SimCategory, SimContext, Simulator, SimulatorKind,
};
