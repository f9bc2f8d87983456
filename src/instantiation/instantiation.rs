//! 实例化
//!
//! 一次仿真的执行计划：分片、跨分片代理、运行环境，以及接口到 socket 的缓存。

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::env::Environment;
use super::fragment::Fragment;
use super::proxy::{Proxy, ProxyType};
use super::socket::{Socket, SocketType};
use crate::error::{OrchError, Result};
use crate::simulation::Simulation;
use crate::system::{
    ChannelId, ComponentKind, FragmentId, Interface, InterfaceFamily, InterfaceId, InterfaceKind,
    ProxyId, SimulatorId,
};
use crate::util::id_table;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instantiation {
    pub simulation: Simulation,
    pub env: Environment,
    #[serde(with = "id_table", default)]
    fragments: BTreeMap<FragmentId, Fragment>,
    #[serde(with = "id_table", default)]
    proxies: BTreeMap<ProxyId, Proxy>,
    /// 解析期间填充，之后只读
    #[serde(skip)]
    sockets: BTreeMap<InterfaceId, Socket>,
}

impl Instantiation {
    pub fn new(simulation: Simulation, env: Environment) -> Self {
        Self {
            simulation,
            env,
            fragments: BTreeMap::new(),
            proxies: BTreeMap::new(),
            sockets: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.simulation.name
    }

    // ---- 分片 ----

    /// 没有显式分片时，把所有仿真器放进同一个分片
    pub fn ensure_fragments(&mut self) {
        if !self.fragments.is_empty() {
            return;
        }
        let id = FragmentId(self.simulation.system.alloc_id());
        let mut frag = Fragment::new(id, "main");
        frag.simulators = self.simulation.all_simulators().map(|s| s.id).collect();
        self.fragments.insert(id, frag);
    }

    pub fn add_fragment(&mut self, name: impl Into<String>, sims: &[SimulatorId]) -> Result<FragmentId> {
        for s in sims {
            self.simulation.simulator(*s)?;
            if let Some(f) = self.fragment_of(*s) {
                return Err(OrchError::InvalidGraph(format!(
                    "simulator {s} already belongs to fragment {f}"
                )));
            }
        }
        let id = FragmentId(self.simulation.system.alloc_id());
        let mut frag = Fragment::new(id, name);
        frag.simulators = sims.to_vec();
        self.fragments.insert(id, frag);
        Ok(id)
    }

    /// 指定分片运行在哪个执行器上
    pub fn set_runner(&mut self, frag: FragmentId, label: impl Into<String>) -> Result<()> {
        self.fragments
            .get_mut(&frag)
            .ok_or_else(|| OrchError::InvalidGraph(format!("unknown fragment {frag}")))?
            .runner = Some(label.into());
        Ok(())
    }

    pub fn fragment(&self, id: FragmentId) -> Result<&Fragment> {
        self.fragments
            .get(&id)
            .ok_or_else(|| OrchError::InvalidGraph(format!("unknown fragment {id}")))
    }

    pub fn fragments(&self) -> impl Iterator<Item = &Fragment> {
        self.fragments.values()
    }

    pub fn fragment_of(&self, sim: SimulatorId) -> Option<FragmentId> {
        self.fragments
            .values()
            .find(|f| f.contains(sim))
            .map(|f| f.id)
    }

    pub(crate) fn simulator_of_iface(&self, iface: InterfaceId) -> Result<SimulatorId> {
        let comp = self.simulation.system.interface(iface)?.component;
        self.simulation.simulator_of(comp).ok_or_else(|| {
            OrchError::InvalidGraph(format!("component {comp} is not bound to any simulator"))
        })
    }

    fn fragment_of_iface(&self, iface: InterfaceId) -> Result<Option<FragmentId>> {
        Ok(self.fragment_of(self.simulator_of_iface(iface)?))
    }

    // ---- 代理 ----

    /// 在两个分片间建立一对代理；两侧接口列表逐位对应同一条通道
    pub fn add_proxy_pair(
        &mut self,
        proxy_type: ProxyType,
        listen_frag: FragmentId,
        connect_frag: FragmentId,
        channels: &[ChannelId],
        ip: impl Into<String>,
        port: u16,
    ) -> Result<(ProxyId, ProxyId)> {
        if listen_frag == connect_frag {
            return Err(OrchError::InvalidGraph(format!(
                "proxy pair needs two distinct fragments, got {listen_frag} twice"
            )));
        }
        let lname = self.fragment(listen_frag)?.name.clone();
        let cname = self.fragment(connect_frag)?.name.clone();

        let mut l_ifs = Vec::with_capacity(channels.len());
        let mut c_ifs = Vec::with_capacity(channels.len());
        for ch in channels {
            let c = self.simulation.system.channel(*ch)?;
            let (a, b) = (c.a, c.b);
            let (fa, fb) = (self.fragment_of_iface(a)?, self.fragment_of_iface(b)?);
            let (l, r) = if fa == Some(listen_frag) && fb == Some(connect_frag) {
                (a, b)
            } else if fb == Some(listen_frag) && fa == Some(connect_frag) {
                (b, a)
            } else {
                return Err(OrchError::InvalidGraph(format!(
                    "channel {ch} does not run between fragments `{lname}` and `{cname}`"
                )));
            };
            if self.proxies.values().any(|p| p.carries(l) || p.carries(r)) {
                return Err(OrchError::InvalidGraph(format!(
                    "channel {ch} is already carried by a proxy"
                )));
            }
            l_ifs.push(l);
            c_ifs.push(r);
        }

        let ip = ip.into();
        let lid = ProxyId(self.simulation.system.alloc_id());
        let cid = ProxyId(self.simulation.system.alloc_id());
        let listener = Proxy {
            id: lid,
            name: format!("{proxy_type}_{lname}_{cname}_listen"),
            proxy_type,
            mode: SocketType::Listen,
            fragment: listen_frag,
            partner: cid,
            interfaces: l_ifs,
            ip: ip.clone(),
            port,
        };
        let connecter = Proxy {
            id: cid,
            name: format!("{proxy_type}_{lname}_{cname}_connect"),
            proxy_type,
            mode: SocketType::Connect,
            fragment: connect_frag,
            partner: lid,
            interfaces: c_ifs,
            ip,
            port,
        };
        debug!(listener = %listener.name, connecter = %connecter.name, channels = channels.len(), "添加代理对");
        self.proxies.insert(lid, listener);
        self.proxies.insert(cid, connecter);
        for (frag, id) in [(listen_frag, lid), (connect_frag, cid)] {
            if let Some(f) = self.fragments.get_mut(&frag) {
                f.proxies.push(id);
            }
        }
        Ok((lid, cid))
    }

    pub fn proxy(&self, id: ProxyId) -> Result<&Proxy> {
        self.proxies
            .get(&id)
            .ok_or_else(|| OrchError::InvalidGraph(format!("unknown proxy {id}")))
    }

    pub fn proxies(&self) -> impl Iterator<Item = &Proxy> {
        self.proxies.values()
    }

    /// 本分片内代表该接口的代理
    pub fn proxy_for(&self, frag: FragmentId, iface: InterfaceId) -> Option<&Proxy> {
        self.proxies
            .values()
            .find(|p| p.fragment == frag && p.carries(iface))
    }

    // ---- socket 缓存 ----

    pub fn socket(&self, iface: InterfaceId) -> Option<&Socket> {
        self.sockets.get(&iface)
    }

    /// 记录并返回接口的 socket；已记录时原样返回，角色冲突报错
    pub fn update_get_socket(&mut self, iface: InterfaceId, role: SocketType, path: PathBuf) -> Result<Socket> {
        if let Some(existing) = self.sockets.get(&iface) {
            if existing.role != role {
                return Err(OrchError::InvalidGraph(format!(
                    "interface {iface} already resolved as {:?}, now asked for {role:?}",
                    existing.role
                )));
            }
            return Ok(existing.clone());
        }
        let sock = Socket { path, role };
        self.sockets.insert(iface, sock.clone());
        Ok(sock)
    }

    /// 清空 socket 缓存（为新的 Run 重新解析前）
    pub fn reset_sockets(&mut self) {
        self.sockets.clear();
    }

    /// 通道的 socket 文件名，由监听端接口决定
    pub(crate) fn socket_name(&self, ch: ChannelId, listen_if: InterfaceId) -> Result<String> {
        let system = &self.simulation.system;
        let channel = system.channel(ch)?;
        let connect_if = channel.opposite(listen_if).ok_or_else(|| {
            OrchError::InvalidGraph(format!("channel {ch} does not touch {listen_if}"))
        })?;
        let l = system.interface(listen_if)?;
        let c = system.interface(connect_if)?;
        let sim_name = |i: &Interface| self.simulation.simulator_name_of(i.component);
        let comp_kind = |i: &Interface| system.component(i.component).map(|x| &x.kind);

        let (base, named) = match l.kind.family() {
            InterfaceFamily::Pcie => {
                let dev = if l.kind == InterfaceKind::PcieDevice { l } else { c };
                (format!("dev.pci.{}", sim_name(dev)?), dev)
            }
            InterfaceFamily::Mem => {
                let dev = if l.kind == InterfaceKind::MemDevice { l } else { c };
                (format!("dev.mem.{}", sim_name(dev)?), dev)
            }
            InterfaceFamily::Eth => {
                let (lk, ck) = (comp_kind(l)?, comp_kind(c)?);
                if matches!(lk, ComponentKind::Nic(_)) {
                    (format!("nic.eth.{}", sim_name(l)?), l)
                } else if matches!(ck, ComponentKind::Nic(_)) {
                    (format!("nic.eth.{}", sim_name(c)?), c)
                } else if matches!(lk, ComponentKind::Host(_)) {
                    (format!("n2h.eth.{}.{}", sim_name(c)?, sim_name(l)?), l)
                } else if matches!(ck, ComponentKind::Host(_)) {
                    (format!("n2h.eth.{}.{}", sim_name(l)?, sim_name(c)?), c)
                } else {
                    return Ok(format!("n2n.eth.{}.{}.{ch}", sim_name(l)?, sim_name(c)?));
                }
            }
        };
        if self.same_kind_count(named)? > 1 {
            Ok(format!("{base}.{}", named.id))
        } else {
            Ok(base)
        }
    }

    /// 与 `iface` 同一仿真器、同类型的接口个数
    fn same_kind_count(&self, iface: &Interface) -> Result<usize> {
        let system = &self.simulation.system;
        let sim = self.simulation.simulator(self.simulator_of_iface(iface.id)?)?;
        let mut n = 0;
        for comp in &sim.components {
            for i in &system.component(*comp)?.interfaces {
                if system.interface(*i)?.kind == iface.kind {
                    n += 1;
                }
            }
        }
        Ok(n)
    }

    // ---- 校验与序列化 ----

    /// 检查实例化层不变量
    pub fn validate(&self) -> Result<()> {
        self.simulation.validate()?;
        for sim in self.simulation.all_simulators() {
            let n = self.fragments.values().filter(|f| f.contains(sim.id)).count();
            if n != 1 {
                return Err(OrchError::InvalidGraph(format!(
                    "simulator `{}` belongs to {n} fragments",
                    sim.name
                )));
            }
        }
        for frag in self.fragments.values() {
            for s in &frag.simulators {
                self.simulation.simulator(*s)?;
            }
            for p in &frag.proxies {
                if self.proxy(*p)?.fragment != frag.id {
                    return Err(OrchError::InvalidGraph(format!(
                        "fragment `{}` lists foreign proxy {p}",
                        frag.name
                    )));
                }
            }
        }
        for p in self.proxies.values() {
            self.validate_pair(p)?;
        }
        for ch in self.simulation.system.channels() {
            let fa = self.fragment_of_iface(ch.a)?;
            let fb = self.fragment_of_iface(ch.b)?;
            if fa == fb {
                continue;
            }
            for (iface, frag) in [(ch.a, fa), (ch.b, fb)] {
                let carriers = self
                    .proxies
                    .values()
                    .filter(|p| Some(p.fragment) == frag && p.carries(iface))
                    .count();
                if carriers != 1 {
                    return Err(OrchError::InvalidGraph(format!(
                        "channel {} crosses fragments but is carried by {carriers} proxies on interface {iface}",
                        ch.id
                    )));
                }
            }
        }
        Ok(())
    }

    fn validate_pair(&self, p: &Proxy) -> Result<()> {
        let partner = self.proxy(p.partner)?;
        if partner.partner != p.id || partner.fragment == p.fragment || partner.mode != p.mode.opposite() {
            return Err(OrchError::InvalidGraph(format!(
                "proxies `{}` and `{}` are not a matched pair",
                p.name, partner.name
            )));
        }
        if partner.interfaces.len() != p.interfaces.len() {
            return Err(OrchError::InvalidGraph(format!(
                "proxies `{}` and `{}` carry different numbers of interfaces",
                p.name, partner.name
            )));
        }
        for (mine, theirs) in p.interfaces.iter().zip(&partner.interfaces) {
            let ch = self.simulation.system.interface(*mine)?.channel;
            if ch.is_none() || ch != self.simulation.system.interface(*theirs)?.channel {
                return Err(OrchError::InvalidGraph(format!(
                    "proxies `{}` and `{}` disagree on interface order",
                    p.name, partner.name
                )));
            }
            if self.fragment_of_iface(*mine)? != Some(p.fragment) {
                return Err(OrchError::InvalidGraph(format!(
                    "proxy `{}` lists interface {mine} outside its fragment",
                    p.name
                )));
            }
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let mut inst: Instantiation = serde_json::from_str(raw)?;
        inst.simulation.reindex()?;
        let max = max_plan_id(&inst);
        if let Some(max) = max {
            inst.simulation.system.reserve_past(max);
        }
        Ok(inst)
    }
}

fn max_plan_id(inst: &Instantiation) -> Option<u64> {
    inst.fragments
        .keys()
        .map(|k| k.0)
        .chain(inst.proxies.keys().map(|k| k.0))
        .max()
}
