//! 内存池拓扑构建
//!
//! 拓扑结构：gem5 主机 -- memswitch -- mem0..memN
//! 主机虚拟地址空间按设备大小切片，第 i 片路由到第 i 个内存设备的物理地址 0。

use crate::error::Result;
use crate::instantiation::{Environment, Instantiation};
use crate::simulation::{BasicMem, Gem5Host, MemSwitch, Simulation, SimulatorKind, TimeUnit};
use crate::system::{
    AppKind, Application, HostConfig, MemDeviceConfig, MemRoute, SimulatorId, System,
};

#[derive(Debug, Clone)]
pub struct MemPoolOpts {
    pub devices: usize,
    /// 每个设备的字节数
    pub dev_size: u64,
    pub as_id: u32,
    /// 纳秒
    pub latency: u64,
    pub sync: bool,
}

impl Default for MemPoolOpts {
    fn default() -> Self {
        Self {
            devices: 2,
            dev_size: 1 << 30,
            as_id: 0,
            latency: 500,
            sync: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MemPool {
    pub instantiation: Instantiation,
    pub host: SimulatorId,
    pub memswitch: SimulatorId,
    pub devices: Vec<SimulatorId>,
}

/// 构建内存池实例化（单分片）
pub fn build_mem_pool(name: &str, opts: &MemPoolOpts, env: Environment) -> Result<MemPool> {
    let mut sys = System::new();
    let cfg = HostConfig::default().app(Application::new(AppKind::Sleep { secs: 1 }).waiting());
    let host = sys.add_host("host", cfg)?;
    let ic = sys.add_mem_interconnect("memswitch")?;
    sys.connect_mem(host, ic, opts.latency)?;

    let mut devs = Vec::with_capacity(opts.devices);
    for i in 0..opts.devices {
        let dev = sys.add_mem_device(
            format!("mem{i}"),
            MemDeviceConfig {
                size: opts.dev_size,
                addr: 0,
                as_id: opts.as_id,
            },
        )?;
        let ch = sys.connect_mem(ic, dev, opts.latency)?;
        let downstream = sys.channel(ch)?.a;
        let lo = opts.dev_size * i as u64;
        sys.add_mem_route(
            ic,
            MemRoute {
                as_id: opts.as_id,
                vaddr_lo: lo,
                vaddr_hi: lo + opts.dev_size,
                paddr: 0,
                downstream,
            },
        )?;
        devs.push(dev);
    }

    let mut simulation = Simulation::new(name, sys);
    let host_sim =
        simulation.add_simulator_for("host", SimulatorKind::Gem5(Gem5Host::default()), &[host])?;
    let memswitch = simulation.add_simulator_for(
        "memswitch",
        SimulatorKind::MemSwitch(MemSwitch::default()),
        &[ic],
    )?;
    let mut devices = Vec::with_capacity(devs.len());
    for (i, dev) in devs.iter().enumerate() {
        devices.push(simulation.add_simulator_for(
            format!("mem{i}"),
            SimulatorKind::BasicMem(BasicMem::default()),
            &[*dev],
        )?);
    }
    simulation.materialize_channels()?;
    if opts.sync {
        simulation.enable_synchronization(None, TimeUnit::Ns)?;
    }

    let mut inst = Instantiation::new(simulation, env);
    inst.ensure_fragments();
    inst.validate()?;
    Ok(MemPool {
        instantiation: inst,
        host: host_sim,
        memswitch,
        devices,
    })
}
