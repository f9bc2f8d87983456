//! 分片：在同一执行器上作为一个进程组运行的一组仿真器

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::simulation::{Resources, Simulation};
use crate::system::{FragmentId, ProxyId, SimulatorId};
use crate::util::Keyed;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fragment {
    pub id: FragmentId,
    pub name: String,
    pub simulators: Vec<SimulatorId>,
    #[serde(default)]
    pub proxies: Vec<ProxyId>,
    /// 执行器标签；缺省为本地
    #[serde(default)]
    pub runner: Option<String>,
}

impl Fragment {
    pub fn new(id: FragmentId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            simulators: Vec::new(),
            proxies: Vec::new(),
            runner: None,
        }
    }

    pub fn contains(&self, sim: SimulatorId) -> bool {
        self.simulators.contains(&sim)
    }

    /// 分片内是否有属于等待集合的仿真器
    pub fn waits(&self, simulation: &Simulation) -> bool {
        self.simulators.iter().any(|id| {
            simulation
                .simulator(*id)
                .is_ok_and(|s| s.waits(&simulation.system))
        })
    }

    /// 各仿真器资源需求之和
    pub fn resource_requirements(&self, simulation: &Simulation) -> Result<Resources> {
        self.simulators
            .iter()
            .try_fold(Resources::new(0, 0), |acc, id| {
                Ok(acc + simulation.simulator(*id)?.resource_requirements())
            })
    }
}

impl Keyed for Fragment {
    type Key = FragmentId;
    fn key(&self) -> FragmentId {
        self.id
    }
}
