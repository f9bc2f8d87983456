//! 内存仿真器：简单内存设备与内存交换互连

use serde::{Deserialize, Serialize};

use super::cmd::CmdBuilder;
use super::nets::split_by_role;
use super::simulator::{Resources, SimBehavior, SimCategory, SimContext};
use crate::error::{OrchError, Result};
use crate::instantiation::SocketTypes;
use crate::system::{ComponentKind, InterfaceFamily, InterfaceKind};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicMem {}

impl SimBehavior for BasicMem {
    fn class_name(&self) -> &'static str {
        "BasicMemDev"
    }

    fn category(&self) -> SimCategory {
        SimCategory::Mem
    }

    fn accepts(&self, kind: &ComponentKind) -> bool {
        matches!(kind, ComponentKind::MemDevice(_))
    }

    fn supported_socket_types(&self, iface: InterfaceKind) -> SocketTypes {
        match iface {
            InterfaceKind::MemDevice => SocketTypes::LISTEN,
            _ => SocketTypes::NONE,
        }
    }

    fn default_resources(&self) -> Resources {
        Resources::new(1, 1024)
    }

    fn run_cmd(&self, ctx: &SimContext<'_>) -> Result<Vec<String>> {
        let timing = ctx.timing()?;
        let cfg = ctx
            .components()?
            .into_iter()
            .find_map(|c| match &c.kind {
                ComponentKind::MemDevice(cfg) => Some(cfg),
                _ => None,
            })
            .ok_or_else(|| {
                OrchError::InvalidGraph(format!("`{}` simulates no memory device", ctx.name()))
            })?;
        let sock = ctx.single_socket(InterfaceKind::MemDevice)?;

        let mut cmd = CmdBuilder::new(ctx.env().repo_path("sims/mem/basicmem/basicmem"));
        cmd.arg(cfg.size)
            .arg(cfg.addr)
            .arg(cfg.as_id)
            .path(&sock.path)
            .path(ctx.env().dev_shm_path(ctx.name()))
            .arg(timing.sync_flag())
            .arg(ctx.sim.start_tick)
            .arg(timing.sync_period)
            .arg(timing.latency(InterfaceFamily::Mem));
        cmd.args(&ctx.sim.extra_args);
        Ok(cmd.build())
    }
}

/// 下游端口的 MAC（本地管理地址，低字节为端口序号），按字节逆序编码
///
/// 端口序号只占一个字节，超过 255 时报错。
pub fn port_mac_rev(port: usize) -> Result<u64> {
    let low = u8::try_from(port).map_err(|_| {
        OrchError::InvalidGraph(format!("memory switch port {port} does not fit in a MAC byte"))
    })?;
    let mac: [u8; 6] = [0x02, 0, 0, 0, 0, low];
    Ok(mac
        .iter()
        .rev()
        .fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemSwitch {}

impl SimBehavior for MemSwitch {
    fn class_name(&self) -> &'static str {
        "MemSwitchNet"
    }

    fn category(&self) -> SimCategory {
        SimCategory::Mem
    }

    fn accepts(&self, kind: &ComponentKind) -> bool {
        matches!(kind, ComponentKind::MemInterconnect { .. })
    }

    fn supported_socket_types(&self, iface: InterfaceKind) -> SocketTypes {
        match iface {
            InterfaceKind::MemHost | InterfaceKind::MemDevice => SocketTypes::BOTH,
            _ => SocketTypes::NONE,
        }
    }

    fn default_resources(&self) -> Resources {
        Resources::new(1, 256)
    }

    fn run_cmd(&self, ctx: &SimContext<'_>) -> Result<Vec<String>> {
        let timing = ctx.timing()?;
        let mut connect = Vec::new();
        let mut listen = Vec::new();
        for kind in [InterfaceKind::MemDevice, InterfaceKind::MemHost] {
            let (c, l) = split_by_role(ctx, kind)?;
            connect.extend(c);
            listen.extend(l);
        }

        let mut cmd = CmdBuilder::new(ctx.env().repo_path("sims/mem/memswitch/memswitch"));
        cmd.opt("-S", timing.sync_period)
            .opt("-E", timing.latency(InterfaceFamily::Mem))
            .arg_if(!timing.sync, "-u");
        for p in &connect {
            cmd.opt("-s", p.display());
        }
        for p in &listen {
            cmd.opt("-h", p.display());
        }

        let downstream = ctx.ext_of(InterfaceKind::MemHost)?;
        for comp in ctx.components()? {
            let ComponentKind::MemInterconnect { routes } = &comp.kind else {
                continue;
            };
            for r in routes {
                let port = downstream
                    .iter()
                    .position(|i| i.id == r.downstream)
                    .ok_or_else(|| {
                        OrchError::InvalidGraph(format!(
                            "`{}` routes to disconnected interface {}",
                            comp.name, r.downstream
                        ))
                    })?;
                cmd.opt(
                    "-m",
                    format!(
                        "{},{},{},{:#x},{}",
                        r.as_id,
                        r.vaddr_lo,
                        r.vaddr_hi,
                        port_mac_rev(port)?,
                        r.paddr
                    ),
                );
            }
        }
        cmd.args(&ctx.sim.extra_args);
        Ok(cmd.build())
    }
}
