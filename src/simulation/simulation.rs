//! 仿真
//!
//! 把系统组件绑定到具体仿真器，并为跨仿真器的系统通道维护仿真通道缓存。

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::channel::{SimChannel, TimeUnit};
use super::simulator::{Simulator, SimulatorKind};
use crate::error::{OrchError, Result};
use crate::system::{ChannelId, ComponentId, SimChannelId, SimulatorId, System};
use crate::util::id_table;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Simulation {
    pub name: String,
    pub system: System,
    #[serde(with = "id_table")]
    simulators: BTreeMap<SimulatorId, Simulator>,
    #[serde(with = "id_table", default)]
    channels: BTreeMap<ChannelId, SimChannel>,
    /// 用户注释，原样写入输出记录
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    /// 全局运行时限（秒）
    #[serde(default)]
    pub timeout: Option<u64>,
    /// 先跑一次创建检查点，再从检查点恢复做测量
    #[serde(default)]
    pub checkpoint: bool,
    /// `enable_synchronization` 的设置，对之后才建立的仿真通道同样生效
    #[serde(default)]
    sync_all: bool,
    #[serde(default)]
    sync_period: Option<u64>,
}

impl Simulation {
    pub fn new(name: impl Into<String>, system: System) -> Self {
        Self {
            name: name.into(),
            system,
            simulators: BTreeMap::new(),
            channels: BTreeMap::new(),
            metadata: BTreeMap::new(),
            timeout: None,
            checkpoint: false,
            sync_all: false,
            sync_period: None,
        }
    }

    pub fn add_simulator(&mut self, name: impl Into<String>, kind: SimulatorKind) -> SimulatorId {
        let id = SimulatorId(self.system.alloc_id());
        self.simulators.insert(id, Simulator::new(id, name, kind));
        id
    }

    /// 新建仿真器并接管给定组件
    pub fn add_simulator_for(
        &mut self,
        name: impl Into<String>,
        kind: SimulatorKind,
        components: &[ComponentId],
    ) -> Result<SimulatorId> {
        let id = self.add_simulator(name, kind);
        for c in components {
            self.adopt(id, *c)?;
        }
        Ok(id)
    }

    /// 仿真器接管组件；组件已被其他仿真器接管时报 `DuplicateBinding`
    pub fn adopt(&mut self, sim: SimulatorId, component: ComponentId) -> Result<()> {
        if let Some(owner) = self.simulator_of(component) {
            return Err(OrchError::DuplicateBinding {
                component: component.0,
                owner: self.simulator(owner)?.name.clone(),
            });
        }
        let comp = self.system.component(component)?;
        let target = self
            .simulators
            .get_mut(&sim)
            .ok_or_else(|| OrchError::InvalidGraph(format!("unknown simulator {sim}")))?;
        if !target.behavior().accepts(&comp.kind) {
            return Err(OrchError::InvalidGraph(format!(
                "{} `{}` cannot simulate {} `{}`",
                target.behavior().class_name(),
                target.name,
                comp.kind.type_name(),
                comp.name
            )));
        }
        debug!(sim = %target.name, component = %comp.name, "仿真器接管组件");
        target.components.push(component);
        Ok(())
    }

    pub fn simulator(&self, id: SimulatorId) -> Result<&Simulator> {
        self.simulators
            .get(&id)
            .ok_or_else(|| OrchError::InvalidGraph(format!("unknown simulator {id}")))
    }

    pub fn simulator_mut(&mut self, id: SimulatorId) -> Result<&mut Simulator> {
        self.simulators
            .get_mut(&id)
            .ok_or_else(|| OrchError::InvalidGraph(format!("unknown simulator {id}")))
    }

    pub fn all_simulators(&self) -> impl Iterator<Item = &Simulator> {
        self.simulators.values()
    }

    pub fn simulator_of(&self, component: ComponentId) -> Option<SimulatorId> {
        self.simulators
            .values()
            .find(|s| s.components.contains(&component))
            .map(|s| s.id)
    }

    pub fn simulator_name_of(&self, component: ComponentId) -> Result<&str> {
        let id = self.simulator_of(component).ok_or_else(|| {
            OrchError::InvalidGraph(format!("component {component} is not simulated"))
        })?;
        Ok(&self.simulator(id)?.name)
    }

    /// 端点属于不同仿真器的系统通道
    fn crosses_simulators(&self, ch: ChannelId) -> Result<bool> {
        let ch = self.system.channel(ch)?;
        let a = self.system.interface(ch.a)?.component;
        let b = self.system.interface(ch.b)?.component;
        Ok(self.simulator_of(a) != self.simulator_of(b))
    }

    /// 取缓存的仿真通道，不存在则按默认值创建；重复调用返回同一对象
    pub fn retrieve_or_create_channel(&mut self, ch: ChannelId) -> Result<&mut SimChannel> {
        let latency = self.system.channel(ch)?.latency;
        if !self.channels.contains_key(&ch) {
            let id = SimChannelId(self.system.alloc_id());
            let sc = self.channel_defaults(id, ch, latency)?;
            self.channels.insert(ch, sc);
        }
        self.channels
            .get_mut(&ch)
            .ok_or_else(|| OrchError::InvalidGraph(format!("unknown channel {ch}")))
    }

    /// 新仿真通道的初始值：默认参数叠加已启用的全局同步设置
    pub fn channel_defaults(&self, id: SimChannelId, ch: ChannelId, latency: u64) -> Result<SimChannel> {
        let mut sc = SimChannel::new(id, ch, latency);
        if self.sync_all {
            sc.synchronized = true;
            if let Some(p) = self.sync_period {
                if p > latency {
                    return Err(OrchError::InconsistentTiming(format!(
                        "sync period {p} ns exceeds latency {latency} ns of channel {ch}"
                    )));
                }
                sc.sync_period = p;
            }
        }
        Ok(sc)
    }

    pub fn sim_channel(&self, ch: ChannelId) -> Option<&SimChannel> {
        self.channels.get(&ch)
    }

    pub fn sim_channels(&self) -> impl Iterator<Item = &SimChannel> {
        self.channels.values()
    }

    /// 为所有跨仿真器的系统通道建立仿真通道
    pub fn materialize_channels(&mut self) -> Result<()> {
        let ids: Vec<ChannelId> = self.system.channels().map(|c| c.id).collect();
        for ch in ids {
            if self.crosses_simulators(ch)? {
                self.retrieve_or_create_channel(ch)?;
            }
        }
        Ok(())
    }

    /// 打开所有仿真通道的同步；给定周期时一并设置，周期超过任一通道时延则拒绝
    ///
    /// 设置同时记在仿真上，之后才跨仿真器的通道也会按它建立。
    pub fn enable_synchronization(&mut self, amount: Option<u64>, unit: TimeUnit) -> Result<()> {
        self.materialize_channels()?;
        let period = amount.map(|a| unit.to_ns(a));
        if let Some(p) = period {
            for ch in self.system.channels() {
                if p > ch.latency {
                    return Err(OrchError::InconsistentTiming(format!(
                        "sync period {p} ns exceeds latency {} ns of channel {}",
                        ch.latency, ch.id
                    )));
                }
            }
        }
        for sc in self.channels.values_mut() {
            sc.synchronized = true;
            if let Some(p) = period {
                sc.sync_period = p;
            }
        }
        self.sync_all = true;
        if period.is_some() {
            self.sync_period = period;
        }
        info!(simulation = %self.name, period_ns = ?period, "已启用同步");
        Ok(())
    }

    /// 检查仿真层不变量
    pub fn validate(&self) -> Result<()> {
        self.system.validate()?;
        let mut owners: BTreeMap<ComponentId, &str> = BTreeMap::new();
        for sim in self.simulators.values() {
            for c in &sim.components {
                let comp = self.system.component(*c)?;
                if !sim.behavior().accepts(&comp.kind) {
                    return Err(OrchError::InvalidGraph(format!(
                        "`{}` cannot simulate `{}`",
                        sim.name, comp.name
                    )));
                }
                if let Some(prev) = owners.insert(*c, &sim.name) {
                    return Err(OrchError::DuplicateBinding {
                        component: c.0,
                        owner: prev.to_string(),
                    });
                }
            }
        }
        for comp in self.system.components() {
            if !owners.contains_key(&comp.id) {
                return Err(OrchError::InvalidGraph(format!(
                    "component `{}` is not bound to any simulator",
                    comp.name
                )));
            }
        }
        for sc in self.channels.values() {
            let latency = self.system.channel(sc.sys_channel)?.latency;
            if sc.sync_period > latency {
                return Err(OrchError::InconsistentTiming(format!(
                    "channel {}: sync period {} ns exceeds latency {latency} ns",
                    sc.sys_channel, sc.sync_period
                )));
            }
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let mut sim: Simulation = serde_json::from_str(raw)?;
        sim.reindex()?;
        Ok(sim)
    }

    pub(crate) fn reindex(&mut self) -> Result<()> {
        self.system.reindex()?;
        for s in self.simulators.values() {
            for c in &s.components {
                self.system.component(*c)?;
            }
        }
        for sc in self.channels.values() {
            self.system.channel(sc.sys_channel)?;
        }
        let max = self
            .simulators
            .keys()
            .map(|k| k.0)
            .chain(self.channels.values().map(|c| c.id.0))
            .max();
        if let Some(max) = max {
            self.system.reserve_past(max);
        }
        Ok(())
    }
}
