//! 仿真通道与时序协调

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{OrchError, Result};
use crate::system::{ChannelId, InterfaceFamily, SimChannelId};
use crate::util::Keyed;

/// 新建仿真通道的默认同步周期上限（纳秒）
pub const DEFAULT_SYNC_PERIOD_NS: u64 = 500;

/// 时间单位
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeUnit {
    Ns,
    Us,
    Ms,
    S,
}

impl TimeUnit {
    pub fn to_ns(self, amount: u64) -> u64 {
        match self {
            TimeUnit::Ns => amount,
            TimeUnit::Us => amount.saturating_mul(1_000),
            TimeUnit::Ms => amount.saturating_mul(1_000_000),
            TimeUnit::S => amount.saturating_mul(1_000_000_000),
        }
    }
}

/// 仿真通道：在系统通道之上附加同步参数
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimChannel {
    pub id: SimChannelId,
    pub sys_channel: ChannelId,
    pub synchronized: bool,
    /// 纳秒
    pub sync_period: u64,
}

impl SimChannel {
    pub fn new(id: SimChannelId, sys_channel: ChannelId, latency: u64) -> Self {
        Self {
            id,
            sys_channel,
            synchronized: false,
            sync_period: DEFAULT_SYNC_PERIOD_NS.min(latency),
        }
    }
}

impl Keyed for SimChannel {
    type Key = ChannelId;
    fn key(&self) -> ChannelId {
        self.sys_channel
    }
}

/// 一次仿真器调用所见的通道参数
#[derive(Debug, Clone, Copy)]
pub struct ChannelView {
    pub family: InterfaceFamily,
    pub synchronized: bool,
    pub sync_period: u64,
    pub latency: u64,
}

/// 协调结果：`sync` 取任一，`sync_period` 取最小，时延按通道族各自必须一致
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelTiming {
    pub sync: bool,
    pub sync_period: u64,
    latencies: BTreeMap<InterfaceFamily, u64>,
}

impl ChannelTiming {
    pub fn reconcile(owner: &str, views: &[ChannelView]) -> Result<Self> {
        let mut latencies: BTreeMap<InterfaceFamily, u64> = BTreeMap::new();
        for v in views {
            if v.sync_period > v.latency {
                return Err(OrchError::InconsistentTiming(format!(
                    "`{owner}`: sync period {} ns exceeds {} channel latency {} ns",
                    v.sync_period, v.family, v.latency
                )));
            }
            match latencies.get(&v.family) {
                Some(l) if *l != v.latency => {
                    return Err(OrchError::InconsistentTiming(format!(
                        "`{owner}`: {} channels disagree on latency ({} ns vs {} ns)",
                        v.family, l, v.latency
                    )));
                }
                Some(_) => {}
                None => {
                    latencies.insert(v.family, v.latency);
                }
            }
        }
        Ok(Self {
            sync: views.iter().any(|v| v.synchronized),
            sync_period: views
                .iter()
                .map(|v| v.sync_period)
                .min()
                .unwrap_or(DEFAULT_SYNC_PERIOD_NS),
            latencies,
        })
    }

    /// 某通道族的时延；没有该族通道时退回默认同步周期
    pub fn latency(&self, family: InterfaceFamily) -> u64 {
        self.latencies
            .get(&family)
            .copied()
            .unwrap_or(DEFAULT_SYNC_PERIOD_NS)
    }

    pub fn sync_flag(&self) -> &'static str {
        if self.sync { "1" } else { "0" }
    }
}
