//! 网络仿真器：交换机与线缆

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::cmd::CmdBuilder;
use super::simulator::{Resources, SimBehavior, SimCategory, SimContext};
use crate::error::{OrchError, Result};
use crate::instantiation::{SocketType, SocketTypes};
use crate::system::{ComponentKind, InterfaceFamily, InterfaceKind};

/// 按角色拆分外部以太网 socket（各自保持接口顺序）
pub(crate) fn split_by_role(
    ctx: &SimContext<'_>,
    kind: InterfaceKind,
) -> Result<(Vec<PathBuf>, Vec<PathBuf>)> {
    let mut connect = Vec::new();
    let mut listen = Vec::new();
    for iface in ctx.ext_of(kind)? {
        let sock = ctx.socket(iface)?;
        match sock.role {
            SocketType::Connect => connect.push(sock.path.clone()),
            SocketType::Listen => listen.push(sock.path.clone()),
        }
    }
    Ok((connect, listen))
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchNet {
    #[serde(default)]
    pub pcap: Option<PathBuf>,
}

impl SimBehavior for SwitchNet {
    fn class_name(&self) -> &'static str {
        "SwitchNet"
    }

    fn category(&self) -> SimCategory {
        SimCategory::Net
    }

    fn accepts(&self, kind: &ComponentKind) -> bool {
        matches!(kind, ComponentKind::EthSwitch)
    }

    fn supported_socket_types(&self, iface: InterfaceKind) -> SocketTypes {
        match iface {
            InterfaceKind::EthPort => SocketTypes::BOTH,
            _ => SocketTypes::NONE,
        }
    }

    fn default_resources(&self) -> Resources {
        Resources::new(1, 256)
    }

    fn run_cmd(&self, ctx: &SimContext<'_>) -> Result<Vec<String>> {
        let timing = ctx.timing()?;
        let (connect, listen) = split_by_role(ctx, InterfaceKind::EthPort)?;

        let mut cmd = CmdBuilder::new(ctx.env().repo_path("sims/net/switch/net_switch"));
        cmd.opt("-S", timing.sync_period)
            .opt("-E", timing.latency(InterfaceFamily::Eth))
            .arg_if(!timing.sync, "-u");
        if let Some(pcap) = &self.pcap {
            cmd.opt("-p", pcap.display());
        }
        for p in &connect {
            cmd.opt("-s", p.display());
        }
        for p in &listen {
            cmd.opt("-h", p.display());
        }
        cmd.args(&ctx.sim.extra_args);
        Ok(cmd.build())
    }
}

/// 点对点线缆：两端都监听
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireNet {
    #[serde(default)]
    pub pcap: Option<PathBuf>,
}

impl SimBehavior for WireNet {
    fn class_name(&self) -> &'static str {
        "WireNet"
    }

    fn category(&self) -> SimCategory {
        SimCategory::Net
    }

    fn accepts(&self, kind: &ComponentKind) -> bool {
        matches!(kind, ComponentKind::EthWire)
    }

    fn supported_socket_types(&self, iface: InterfaceKind) -> SocketTypes {
        match iface {
            InterfaceKind::EthPort => SocketTypes::LISTEN,
            _ => SocketTypes::NONE,
        }
    }

    fn default_resources(&self) -> Resources {
        Resources::new(1, 256)
    }

    fn run_cmd(&self, ctx: &SimContext<'_>) -> Result<Vec<String>> {
        let timing = ctx.timing()?;
        let ports = ctx.ext_of(InterfaceKind::EthPort)?;
        let [a, b] = ports.as_slice() else {
            return Err(OrchError::InvalidGraph(format!(
                "wire `{}` needs two connected ports, has {}",
                ctx.name(),
                ports.len()
            )));
        };
        let mut cmd = CmdBuilder::new(ctx.env().repo_path("sims/net/wire/net_wire"));
        cmd.path(&ctx.socket(a)?.path)
            .path(&ctx.socket(b)?.path)
            .arg(timing.sync_flag())
            .arg(timing.sync_period)
            .arg(timing.latency(InterfaceFamily::Eth));
        if let Some(pcap) = &self.pcap {
            cmd.path(pcap);
        }
        cmd.args(&ctx.sim.extra_args);
        Ok(cmd.build())
    }
}
