//! 主机对拓扑构建
//!
//! 拓扑结构：client -- nic_client -- switch -- nic_server -- server
//! 可选地把 server 侧（主机与网卡）放进第二个分片，交换机到 nic_server 的通道由代理承载。

use crate::error::Result;
use crate::instantiation::{Environment, Instantiation, ProxyType};
use crate::simulation::{
    Gem5Host, NicModel, NicSim, QemuHost, Simulation, SimulatorKind, SwitchNet, TimeUnit,
};
use crate::system::{
    AppKind, Application, ChannelId, ComponentId, HostConfig, NicConfig, NicDriver, SimulatorId,
    System,
};

/// 主机上跑的负载
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairApp {
    Netperf,
    Ping,
    Iperf,
}

/// 主机仿真器选择
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairHost {
    Qemu,
    Gem5,
}

/// 主机对拓扑配置选项
#[derive(Debug, Clone)]
pub struct PairOpts {
    pub app: PairApp,
    pub host: PairHost,
    pub nic: NicModel,
    pub server_ip: String,
    pub client_ip: String,
    /// 纳秒
    pub eth_latency: u64,
    pub pcie_latency: u64,
    pub sync: bool,
    /// 设置后 server 侧独占一个分片，经该类型代理与交换机相连
    pub split: Option<ProxyType>,
    pub proxy_ip: String,
    pub proxy_port: u16,
}

impl Default for PairOpts {
    fn default() -> Self {
        Self {
            app: PairApp::Netperf,
            host: PairHost::Qemu,
            nic: NicModel::I40e,
            server_ip: "10.0.0.2".to_string(),
            client_ip: "10.0.0.1".to_string(),
            eth_latency: 500,
            pcie_latency: 500,
            sync: false,
            split: None,
            proxy_ip: "127.0.0.1".to_string(),
            proxy_port: 12345,
        }
    }
}

/// 构建结果中各部件的 id，便于调用方进一步调整
#[derive(Debug, Clone)]
pub struct Pair {
    pub instantiation: Instantiation,
    pub client: SimulatorId,
    pub server: SimulatorId,
    pub nic_client: SimulatorId,
    pub nic_server: SimulatorId,
    pub switch: SimulatorId,
    /// 交换机与 nic_server 之间的通道
    pub server_link: ChannelId,
}

fn driver_for(model: NicModel) -> NicDriver {
    match model {
        NicModel::I40e => NicDriver::I40e,
        NicModel::E1000 => NicDriver::E1000,
        NicModel::CorundumBm | NicModel::CorundumVerilator => NicDriver::Corundum,
    }
}

fn apps(opts: &PairOpts) -> (AppKind, AppKind) {
    let server_ip = opts.server_ip.clone();
    match opts.app {
        PairApp::Netperf => (
            AppKind::NetperfServer,
            AppKind::NetperfClient {
                server_ip,
                duration_tp: 10,
                duration_lat: 10,
            },
        ),
        PairApp::Ping => (AppKind::Idle, AppKind::PingClient { server_ip, count: 10 }),
        PairApp::Iperf => (
            AppKind::IperfTcpServer,
            AppKind::IperfTcpClient {
                server_ip,
                duration: 10,
            },
        ),
    }
}

fn host_kind(host: PairHost) -> SimulatorKind {
    match host {
        PairHost::Qemu => SimulatorKind::Qemu(QemuHost::default()),
        PairHost::Gem5 => SimulatorKind::Gem5(Gem5Host::default()),
    }
}

fn add_endpoint(
    sys: &mut System,
    name: &str,
    ip: &str,
    app: AppKind,
    waits: bool,
    opts: &PairOpts,
) -> Result<(ComponentId, ComponentId)> {
    let mut app = Application::new(app);
    if waits {
        app = app.waiting();
    }
    let cfg = HostConfig {
        nic_driver: driver_for(opts.nic),
        ..HostConfig::with_ip(ip)
    }
    .app(app);
    let host = sys.add_host(name, cfg)?;
    let nic = sys.add_nic(
        format!("nic_{name}"),
        NicConfig {
            ip: Some(ip.to_string()),
            mac: None,
        },
    )?;
    sys.connect_pcie(host, nic, opts.pcie_latency)?;
    Ok((host, nic))
}

/// 构建主机对实例化
pub fn build_pair(name: &str, opts: &PairOpts, env: Environment) -> Result<Pair> {
    let (server_app, client_app) = apps(opts);

    let mut sys = System::new();
    let (h_client, n_client) = add_endpoint(&mut sys, "client", &opts.client_ip, client_app, true, opts)?;
    let (h_server, n_server) = add_endpoint(&mut sys, "server", &opts.server_ip, server_app, false, opts)?;
    let sw = sys.add_switch("switch")?;
    sys.connect_eth(n_client, sw, opts.eth_latency)?;
    let server_link = sys.connect_eth(n_server, sw, opts.eth_latency)?;

    let mut simulation = Simulation::new(name, sys);
    let client = simulation.add_simulator_for("client", host_kind(opts.host), &[h_client])?;
    let server = simulation.add_simulator_for("server", host_kind(opts.host), &[h_server])?;
    let nic_client = simulation.add_simulator_for(
        "nic_client",
        SimulatorKind::Nic(NicSim::new(opts.nic)),
        &[n_client],
    )?;
    let nic_server = simulation.add_simulator_for(
        "nic_server",
        SimulatorKind::Nic(NicSim::new(opts.nic)),
        &[n_server],
    )?;
    let switch = simulation.add_simulator_for(
        "switch",
        SimulatorKind::Switch(SwitchNet::default()),
        &[sw],
    )?;
    simulation.materialize_channels()?;
    if opts.sync {
        simulation.enable_synchronization(None, TimeUnit::Ns)?;
    }

    let mut inst = Instantiation::new(simulation, env);
    if let Some(proxy_type) = opts.split {
        let f0 = inst.add_fragment("f0", &[client, nic_client, switch])?;
        let f1 = inst.add_fragment("f1", &[server, nic_server])?;
        inst.add_proxy_pair(
            proxy_type,
            f0,
            f1,
            &[server_link],
            opts.proxy_ip.clone(),
            opts.proxy_port,
        )?;
    } else {
        inst.ensure_fragments();
    }
    inst.validate()?;

    Ok(Pair {
        instantiation: inst,
        client,
        server,
        nic_client,
        nic_server,
        switch,
        server_link,
    })
}
