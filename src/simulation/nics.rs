//! 网卡仿真器

use serde::{Deserialize, Serialize};

use super::cmd::CmdBuilder;
use super::simulator::{Resources, SimBehavior, SimCategory, SimContext};
use crate::error::Result;
use crate::instantiation::SocketTypes;
use crate::system::{ComponentKind, InterfaceFamily, InterfaceKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NicModel {
    I40e,
    E1000,
    CorundumBm,
    CorundumVerilator,
}

impl NicModel {
    fn binary(self) -> &'static str {
        match self {
            NicModel::I40e => "sims/nic/i40e_bm/i40e_bm",
            NicModel::E1000 => "sims/nic/e1000_gem5/e1000_gem5",
            NicModel::CorundumBm => "sims/nic/corundum_bm/corundum_bm",
            NicModel::CorundumVerilator => "sims/nic/corundum/corundum_verilator",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NicSim {
    pub model: NicModel,
    /// 仅 Verilator 模型使用（MHz）
    #[serde(default)]
    pub clock_freq: Option<u32>,
}

impl NicSim {
    pub fn new(model: NicModel) -> Self {
        Self {
            model,
            clock_freq: None,
        }
    }
}

impl SimBehavior for NicSim {
    fn class_name(&self) -> &'static str {
        match self.model {
            NicModel::I40e => "I40eNicSim",
            NicModel::E1000 => "E1000NicSim",
            NicModel::CorundumBm => "CorundumBmNicSim",
            NicModel::CorundumVerilator => "CorundumVerilatorNicSim",
        }
    }

    fn category(&self) -> SimCategory {
        SimCategory::Nic
    }

    fn accepts(&self, kind: &ComponentKind) -> bool {
        matches!(kind, ComponentKind::Nic(_) | ComponentKind::PcieDevice)
    }

    fn supported_socket_types(&self, iface: InterfaceKind) -> SocketTypes {
        match iface {
            InterfaceKind::PcieDevice => SocketTypes::LISTEN,
            InterfaceKind::EthPort => SocketTypes::CONNECT,
            _ => SocketTypes::NONE,
        }
    }

    fn default_resources(&self) -> Resources {
        match self.model {
            NicModel::CorundumVerilator => Resources::new(1, 2048),
            _ => Resources::new(1, 512),
        }
    }

    fn run_cmd(&self, ctx: &SimContext<'_>) -> Result<Vec<String>> {
        let env = ctx.env();
        let timing = ctx.timing()?;
        let pci = ctx.single_socket(InterfaceKind::PcieDevice)?;
        let eth = ctx.single_socket(InterfaceKind::EthPort)?;

        let mac = ctx.components()?.into_iter().find_map(|c| match &c.kind {
            ComponentKind::Nic(cfg) => cfg.mac.clone(),
            _ => None,
        });

        let mut cmd = CmdBuilder::new(env.repo_path(self.model.binary()));
        cmd.path(&pci.path)
            .path(&eth.path)
            .path(env.dev_shm_path(ctx.name()))
            .arg(timing.sync_flag())
            .arg(ctx.sim.start_tick)
            .arg(timing.sync_period)
            .arg(timing.latency(InterfaceFamily::Pcie))
            .arg(timing.latency(InterfaceFamily::Eth));
        if let Some(mac) = mac {
            cmd.arg(mac.replace(':', ""));
        }
        if self.model == NicModel::CorundumVerilator {
            cmd.arg(self.clock_freq.unwrap_or(250));
        }
        cmd.args(&ctx.sim.extra_args);
        Ok(cmd.build())
    }
}
