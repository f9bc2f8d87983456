use clap::{Parser, Subcommand, ValueEnum};
use simbricks_orch::error::{OrchError, Result};
use simbricks_orch::instantiation::{Environment, Instantiation, ProxyType};
use simbricks_orch::simulation::NicModel;
use simbricks_orch::topo::memory::{MemPoolOpts, build_mem_pool};
use simbricks_orch::topo::pair::{PairApp, PairHost, PairOpts, build_pair};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(
    name = "simbricks-topo",
    about = "Write a reference SimBricks instantiation as JSON"
)]
struct Args {
    /// Instantiation name
    #[arg(long, default_value = "pair")]
    name: String,

    /// SimBricks repository root recorded in the environment
    #[arg(long, default_value = ".")]
    repo: PathBuf,

    /// Base working directory recorded in the environment
    #[arg(long, default_value = "work")]
    workdir: PathBuf,

    /// Output file; stdout when omitted
    #[arg(long)]
    out: Option<PathBuf>,

    /// Per-run time limit in seconds stored in the simulation
    #[arg(long)]
    timeout: Option<u64>,

    /// Create a checkpoint first and measure from it
    #[arg(long)]
    checkpoint: bool,

    #[command(subcommand)]
    topo: Topo,
}

#[derive(Debug, Subcommand)]
enum Topo {
    /// Two hosts with NICs behind one switch
    Pair {
        #[arg(long, value_enum, default_value_t = App::Netperf)]
        app: App,
        #[arg(long, value_enum, default_value_t = Host::Qemu)]
        host: Host,
        #[arg(long, value_enum, default_value_t = Nic::I40e)]
        nic: Nic,
        /// Ethernet and PCIe latency in ns
        #[arg(long, default_value_t = 500)]
        latency: u64,
        #[arg(long)]
        sync: bool,
        /// Put the server side in its own fragment behind a proxy pair
        #[arg(long, value_enum)]
        split: Option<Proxy>,
        #[arg(long, default_value = "127.0.0.1")]
        proxy_ip: String,
        #[arg(long, default_value_t = 12345)]
        proxy_port: u16,
    },
    /// A gem5 host in front of a memory switch and several memory devices
    MemPool {
        #[arg(long, default_value_t = 2)]
        devices: usize,
        /// Bytes per device
        #[arg(long, default_value_t = 1 << 30)]
        dev_size: u64,
        #[arg(long, default_value_t = 500)]
        latency: u64,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum App {
    Netperf,
    Ping,
    Iperf,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Host {
    Qemu,
    Gem5,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Nic {
    I40e,
    E1000,
    CorundumBm,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Proxy {
    Tcp,
    Rdma,
    Dummy,
}

fn build(args: &Args) -> Result<Instantiation> {
    let env = Environment::new(&args.repo, &args.workdir);
    let mut inst = match &args.topo {
        Topo::Pair {
            app,
            host,
            nic,
            latency,
            sync,
            split,
            proxy_ip,
            proxy_port,
        } => {
            let opts = PairOpts {
                app: match app {
                    App::Netperf => PairApp::Netperf,
                    App::Ping => PairApp::Ping,
                    App::Iperf => PairApp::Iperf,
                },
                host: match host {
                    Host::Qemu => PairHost::Qemu,
                    Host::Gem5 => PairHost::Gem5,
                },
                nic: match nic {
                    Nic::I40e => NicModel::I40e,
                    Nic::E1000 => NicModel::E1000,
                    Nic::CorundumBm => NicModel::CorundumBm,
                },
                eth_latency: *latency,
                pcie_latency: *latency,
                sync: *sync,
                split: split.map(|p| match p {
                    Proxy::Tcp => ProxyType::Tcp,
                    Proxy::Rdma => ProxyType::Rdma,
                    Proxy::Dummy => ProxyType::Dummy,
                }),
                proxy_ip: proxy_ip.clone(),
                proxy_port: *proxy_port,
                ..PairOpts::default()
            };
            build_pair(&args.name, &opts, env)?.instantiation
        }
        Topo::MemPool {
            devices,
            dev_size,
            latency,
        } => {
            let opts = MemPoolOpts {
                devices: *devices,
                dev_size: *dev_size,
                latency: *latency,
                ..MemPoolOpts::default()
            };
            build_mem_pool(&args.name, &opts, env)?.instantiation
        }
    };
    inst.simulation.timeout = args.timeout;
    inst.simulation.checkpoint = args.checkpoint;
    Ok(inst)
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_file(true)
        .with_line_number(true)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let res = build(&args).and_then(|inst| {
        let json = inst.to_json()?;
        match &args.out {
            Some(path) => {
                std::fs::write(path, json).map_err(|e| OrchError::io(path, e))?;
                info!(path = %path.display(), "✅ 已写出实例化");
            }
            None => println!("{json}"),
        }
        Ok(())
    });
    match res {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "❌ 生成失败");
            ExitCode::FAILURE
        }
    }
}
