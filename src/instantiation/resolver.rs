//! 依赖解析
//!
//! 为分片内每个跨仿真器接口分配 socket 角色与路径，并构造启动顺序 DAG。
//! 边 `u -> v` 表示 v 必须先启动且其监听 socket 已出现，u 才能启动。

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use tracing::{debug, info};

use super::instantiation::Instantiation;
use super::socket::{SocketType, SocketTypes};
use crate::error::{OrchError, Result};
use crate::system::{FragmentId, InterfaceId, ProxyId, SimulatorId};

/// DAG 节点：本分片的仿真器或代理
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DagNode {
    Sim(SimulatorId),
    Proxy(ProxyId),
}

impl DagNode {
    /// 仿真器与代理共用同一个 id 空间
    pub fn raw_id(self) -> u64 {
        match self {
            DagNode::Sim(s) => s.0,
            DagNode::Proxy(p) => p.0,
        }
    }
}

impl fmt::Display for DagNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DagNode::Sim(s) => write!(f, "sim#{s}"),
            DagNode::Proxy(p) => write!(f, "proxy#{p}"),
        }
    }
}

/// 解析结果
#[derive(Debug, Clone)]
pub struct LaunchPlan {
    pub fragment: FragmentId,
    pub dag: DiGraph<DagNode, ()>,
    /// 拓扑序：依赖在前
    pub order: Vec<DagNode>,
    index: BTreeMap<u64, NodeIndex>,
}

impl LaunchPlan {
    /// `node` 启动前必须就绪的节点
    pub fn dependencies(&self, node: DagNode) -> Vec<DagNode> {
        let Some(ix) = self.index.get(&node.raw_id()) else {
            return Vec::new();
        };
        let mut deps: Vec<DagNode> = self
            .dag
            .neighbors_directed(*ix, Direction::Outgoing)
            .map(|n| self.dag[n])
            .collect();
        deps.sort_by_key(|d| d.raw_id());
        deps
    }

    /// 所有边 (依赖方, 被依赖方)，按 id 排序
    pub fn edges(&self) -> Vec<(DagNode, DagNode)> {
        let mut out: Vec<(DagNode, DagNode)> = self
            .dag
            .edge_indices()
            .filter_map(|e| self.dag.edge_endpoints(e))
            .map(|(a, b)| (self.dag[a], self.dag[b]))
            .collect();
        out.sort_by_key(|(a, b)| (a.raw_id(), b.raw_id()));
        out
    }

    /// 没有任何依赖的节点
    pub fn roots(&self) -> Vec<DagNode> {
        self.order
            .iter()
            .copied()
            .filter(|n| self.dependencies(*n).is_empty())
            .collect()
    }
}

/// 选出 A 端角色；无解时返回 None
///
/// 两端都支持双向时，id 较小的一端监听。
pub fn pick_role(a: (u64, SocketTypes), b: (u64, SocketTypes)) -> Option<SocketType> {
    let (ida, ta) = a;
    let (idb, tb) = b;
    if ta.is_empty() || tb.is_empty() {
        return None;
    }
    match (ta.only(), tb.only()) {
        (Some(x), Some(y)) if x != y => Some(x),
        (Some(_), Some(_)) => None,
        (Some(x), None) => Some(x),
        (None, Some(y)) => Some(y.opposite()),
        (None, None) => Some(if ida < idb {
            SocketType::Listen
        } else {
            SocketType::Connect
        }),
    }
}

/// 解析一个分片；socket 选择记入实例化的缓存，重复解析结果相同
#[tracing::instrument(skip(inst), fields(inst = %inst.name()))]
pub fn resolve(inst: &mut Instantiation, frag: FragmentId) -> Result<LaunchPlan> {
    let fragment = inst.fragment(frag)?.clone();

    let mut dag: DiGraph<DagNode, ()> = DiGraph::new();
    let mut index: BTreeMap<u64, NodeIndex> = BTreeMap::new();
    let mut nodes: Vec<DagNode> = fragment
        .simulators
        .iter()
        .map(|s| DagNode::Sim(*s))
        .chain(fragment.proxies.iter().map(|p| DagNode::Proxy(*p)))
        .collect();
    nodes.sort_by_key(|n| n.raw_id());
    for n in &nodes {
        index.insert(n.raw_id(), dag.add_node(*n));
    }

    let mut sims = fragment.simulators.clone();
    sims.sort();
    for sim_id in sims {
        for iface in local_interfaces(inst, sim_id)? {
            resolve_interface(inst, frag, sim_id, iface, &mut dag, &index)?;
        }
    }

    let order = kahn_order(inst, &dag, &index)?;
    info!(
        fragment = %fragment.name,
        nodes = order.len(),
        edges = dag.edge_count(),
        "依赖解析完成"
    );
    Ok(LaunchPlan {
        fragment: frag,
        dag,
        order,
        index,
    })
}

fn local_interfaces(inst: &Instantiation, sim: SimulatorId) -> Result<Vec<InterfaceId>> {
    let system = &inst.simulation.system;
    let mut out = Vec::new();
    for comp in &inst.simulation.simulator(sim)?.components {
        out.extend(system.component(*comp)?.interfaces.iter().copied());
    }
    Ok(out)
}

fn resolve_interface(
    inst: &mut Instantiation,
    frag: FragmentId,
    sim_a: SimulatorId,
    iface_a: InterfaceId,
    dag: &mut DiGraph<DagNode, ()>,
    index: &BTreeMap<u64, NodeIndex>,
) -> Result<()> {
    let system = &inst.simulation.system;
    let a = system.interface(iface_a)?.clone();
    let Some(b) = system.opposite(iface_a)?.cloned() else {
        return Ok(());
    };
    let Some(ch) = a.channel else {
        return Ok(());
    };
    let sim_b = inst.simulator_of_iface(b.id)?;
    if sim_b == sim_a {
        return Ok(());
    }

    let sim_a_ref = inst.simulation.simulator(sim_a)?;
    let types_a = sim_a_ref.behavior().supported_socket_types(a.kind);
    let (node_b, types_b, name_b) = if inst.fragment(frag)?.contains(sim_b) {
        let s = inst.simulation.simulator(sim_b)?;
        (
            DagNode::Sim(sim_b),
            s.behavior().supported_socket_types(b.kind),
            s.name.clone(),
        )
    } else {
        let p = inst
            .proxy_for(frag, iface_a)
            .ok_or_else(|| OrchError::UnassignedInterface {
                iface: iface_a.0,
                sim: sim_a_ref.name.clone(),
                fragment: frag.0,
            })?;
        (DagNode::Proxy(p.id), SocketTypes::BOTH, p.name.clone())
    };
    let node_a = DagNode::Sim(sim_a);

    let role_a = pick_role((node_a.raw_id(), types_a), (node_b.raw_id(), types_b)).ok_or_else(
        || OrchError::UnsatisfiableSocketRoles {
            channel: ch.0,
            a: sim_a_ref.name.clone(),
            b: name_b.clone(),
        },
    )?;

    let listen_if = if role_a == SocketType::Listen { a.id } else { b.id };
    let path = inst.env.socket_path(&inst.socket_name(ch, listen_if)?);
    let sock = inst.update_get_socket(a.id, role_a, path.clone())?;
    if let DagNode::Sim(_) = node_b {
        inst.update_get_socket(b.id, role_a.opposite(), path)?;
    }
    debug!(
        channel = %ch,
        sim = %inst.simulation.simulator(sim_a)?.name,
        peer = %name_b,
        role = ?sock.role,
        path = %sock.path.display(),
        "分配 socket"
    );

    let (from, to) = match role_a {
        SocketType::Connect => (node_a, node_b),
        SocketType::Listen => (node_b, node_a),
    };
    if let (Some(f), Some(t)) = (index.get(&from.raw_id()), index.get(&to.raw_id())) {
        dag.update_edge(*f, *t, ());
    }
    Ok(())
}

/// 确定性 Kahn 排序：每轮取 id 最小的就绪节点
fn kahn_order(
    inst: &Instantiation,
    dag: &DiGraph<DagNode, ()>,
    index: &BTreeMap<u64, NodeIndex>,
) -> Result<Vec<DagNode>> {
    let mut pending: BTreeMap<u64, usize> = BTreeMap::new();
    let mut ready: BTreeSet<u64> = BTreeSet::new();
    for (id, ix) in index {
        let deps = dag.neighbors_directed(*ix, Direction::Outgoing).count();
        if deps == 0 {
            ready.insert(*id);
        } else {
            pending.insert(*id, deps);
        }
    }

    let mut order = Vec::with_capacity(index.len());
    while let Some(id) = ready.pop_first() {
        let Some(ix) = index.get(&id) else { continue };
        order.push(dag[*ix]);
        for dependent in dag.neighbors_directed(*ix, Direction::Incoming) {
            let did = dag[dependent].raw_id();
            if let Some(n) = pending.get_mut(&did) {
                *n -= 1;
                if *n == 0 {
                    pending.remove(&did);
                    ready.insert(did);
                }
            }
        }
    }

    if !pending.is_empty() {
        let names = pending
            .keys()
            .filter_map(|id| index.get(id).map(|ix| node_name(inst, dag[*ix])))
            .collect();
        return Err(OrchError::CyclicDependency(names));
    }
    Ok(order)
}

pub fn node_name(inst: &Instantiation, node: DagNode) -> String {
    match node {
        DagNode::Sim(s) => inst
            .simulation
            .simulator(s)
            .map(|s| s.name.clone())
            .unwrap_or_else(|_| node.to_string()),
        DagNode::Proxy(p) => inst
            .proxy(p)
            .map(|p| p.name.clone())
            .unwrap_or_else(|_| node.to_string()),
    }
}
