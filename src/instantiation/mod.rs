//! 实例化模型与依赖解析
//!
//! 把一个仿真切分为分片，确定跨分片代理、socket 角色与路径、启动顺序。

mod env;
mod fragment;
#[allow(clippy::module_inception)]
mod instantiation;
mod proxy;
mod resolver;
mod socket;

pub use env::Environment;
pub use fragment::Fragment;
pub use instantiation::Instantiation;
pub use proxy::{Proxy, ProxyType};
pub use resolver::{DagNode, LaunchPlan, node_name, pick_role, resolve};
pub use socket::{Socket, SocketType, SocketTypes};
