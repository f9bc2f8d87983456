//! 主机仿真器：QEMU、gem5、Simics

use serde::{Deserialize, Serialize};

use super::cmd::CmdBuilder;
use super::simulator::{Resources, SimBehavior, SimCategory, SimContext};
use crate::error::{OrchError, Result};
use crate::instantiation::SocketTypes;
use crate::system::{ComponentKind, DiskFormat, DiskPrep, InterfaceFamily, InterfaceKind};

fn accepts_host(kind: &ComponentKind) -> bool {
    matches!(kind, ComponentKind::Host(_))
}

/// QEMU 主机
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QemuHost {
    #[serde(default)]
    pub kvm: bool,
    #[serde(default = "default_cores")]
    pub cores: u32,
    #[serde(default = "default_qemu_mem")]
    pub memory_mb: u64,
    #[serde(default = "default_cpu_mhz")]
    pub cpu_freq_mhz: u32,
    #[serde(default = "default_qemu_kernel")]
    pub kernel: String,
}

fn default_cores() -> u32 {
    1
}

fn default_qemu_mem() -> u64 {
    512
}

fn default_cpu_mhz() -> u32 {
    4000
}

fn default_qemu_kernel() -> String {
    "images/bzImage".to_string()
}

impl Default for QemuHost {
    fn default() -> Self {
        Self {
            kvm: false,
            cores: default_cores(),
            memory_mb: default_qemu_mem(),
            cpu_freq_mhz: default_cpu_mhz(),
            kernel: default_qemu_kernel(),
        }
    }
}

impl QemuHost {
    /// icount 指令计数位移：每条指令 2^shift 纳秒，不小于 0
    pub fn icount_shift(&self) -> u32 {
        let ns_per_insn = 1000.0 / f64::from(self.cpu_freq_mhz.max(1));
        ns_per_insn.log2().ceil().max(0.0) as u32
    }
}

impl SimBehavior for QemuHost {
    fn class_name(&self) -> &'static str {
        "QemuSim"
    }

    fn category(&self) -> SimCategory {
        SimCategory::Host
    }

    fn accepts(&self, kind: &ComponentKind) -> bool {
        accepts_host(kind)
    }

    fn supported_socket_types(&self, iface: InterfaceKind) -> SocketTypes {
        match iface {
            InterfaceKind::PcieHost => SocketTypes::CONNECT,
            _ => SocketTypes::NONE,
        }
    }

    fn supported_image_formats(&self) -> &'static [DiskFormat] {
        &[DiskFormat::Qcow2, DiskFormat::Raw]
    }

    fn default_resources(&self) -> Resources {
        Resources::new(1, self.memory_mb + 256)
    }

    fn uses_cow_overlay(&self) -> bool {
        true
    }

    fn prep_cmds(&self, ctx: &SimContext<'_>) -> Result<Vec<Vec<String>>> {
        let qemu_img = ctx.env().repo_path("sims/external/qemu/build/qemu-img");
        let mut cmds = Vec::new();
        for (_, prep) in ctx.disks()? {
            if let DiskPrep::CowOverlay { base, overlay } = prep {
                cmds.push(
                    CmdBuilder::new(&qemu_img)
                        .arg("create")
                        .opt("-f", "qcow2")
                        .opt("-o", format!("backing_file={}", base.display()))
                        .path(&overlay)
                        .build(),
                );
            }
        }
        Ok(cmds)
    }

    fn run_cmd(&self, ctx: &SimContext<'_>) -> Result<Vec<String>> {
        let env = ctx.env();
        let timing = ctx.timing()?;
        let host = ctx.host()?;

        let mut machine = "q35".to_string();
        if self.kvm && !timing.sync {
            machine.push_str(",accel=kvm");
        }

        let mut cmd = CmdBuilder::new(env.repo_path("sims/external/qemu/build/qemu-system-x86_64"));
        cmd.opt("-machine", machine)
            .opt("-serial", "mon:stdio")
            .opt("-cpu", "Skylake-Server")
            .opt("-display", "none")
            .opt("-nic", "none")
            .opt("-kernel", env.repo_path(&self.kernel).display());

        for (index, (format, prep)) in ctx.disks()?.into_iter().enumerate() {
            let driver = if format == DiskFormat::Raw { ",driver=raw" } else { "" };
            cmd.opt(
                "-drive",
                format!(
                    "file={},if=ide,index={index},media=disk{driver}",
                    prep.path().display()
                ),
            );
        }

        let append = format!(
            "earlyprintk=ttyS0 console=ttyS0 root=/dev/sda1 init=/home/ubuntu/guestinit.sh rw {}",
            host.kcmd_append
        );
        cmd.opt("-append", append.trim_end())
            .opt("-m", self.memory_mb)
            .opt("-smp", self.cores);

        if timing.sync {
            cmd.opt("-icount", format!("shift={},sleep=off", self.icount_shift()));
        }

        for iface in ctx.ext_of(InterfaceKind::PcieHost)? {
            let sock = ctx.socket(iface)?;
            let mut dev = format!("simbricks-pci,socket={}", sock.path.display());
            if timing.sync {
                dev.push_str(&format!(
                    ",sync=on,pci-latency={},sync-period={}",
                    timing.latency(InterfaceFamily::Pcie),
                    timing.sync_period
                ));
            } else {
                dev.push_str(",sync=off");
            }
            cmd.opt("-device", dev);
        }
        cmd.args(&ctx.sim.extra_args);
        Ok(cmd.build())
    }
}

/// gem5 主机
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gem5Host {
    #[serde(default = "default_gem5_variant")]
    pub variant: String,
    #[serde(default = "default_gem5_cpu")]
    pub cpu_type: String,
    /// 创建检查点时使用的 CPU 模型
    #[serde(default = "default_gem5_cpu_cp")]
    pub cpu_type_cp: String,
    #[serde(default = "default_gem5_cpu_freq")]
    pub cpu_freq: String,
    #[serde(default = "default_gem5_sys_clock")]
    pub sys_clock: String,
    #[serde(default = "default_cores")]
    pub cores: u32,
    #[serde(default = "default_gem5_mem")]
    pub memory_mb: u64,
    #[serde(default = "default_gem5_kernel")]
    pub kernel: String,
    #[serde(default)]
    pub extra_main_args: Vec<String>,
}

fn default_gem5_variant() -> String {
    "fast".to_string()
}

fn default_gem5_cpu() -> String {
    "TimingSimpleCPU".to_string()
}

fn default_gem5_cpu_cp() -> String {
    "X86KvmCPU".to_string()
}

fn default_gem5_cpu_freq() -> String {
    "4GHz".to_string()
}

fn default_gem5_sys_clock() -> String {
    "1GHz".to_string()
}

fn default_gem5_mem() -> u64 {
    8192
}

fn default_gem5_kernel() -> String {
    "images/vmlinux".to_string()
}

impl Default for Gem5Host {
    fn default() -> Self {
        Self {
            variant: default_gem5_variant(),
            cpu_type: default_gem5_cpu(),
            cpu_type_cp: default_gem5_cpu_cp(),
            cpu_freq: default_gem5_cpu_freq(),
            sys_clock: default_gem5_sys_clock(),
            cores: default_cores(),
            memory_mb: default_gem5_mem(),
            kernel: default_gem5_kernel(),
            extra_main_args: Vec::new(),
        }
    }
}

impl SimBehavior for Gem5Host {
    fn class_name(&self) -> &'static str {
        "Gem5Sim"
    }

    fn category(&self) -> SimCategory {
        SimCategory::Host
    }

    fn accepts(&self, kind: &ComponentKind) -> bool {
        accepts_host(kind)
    }

    fn supported_socket_types(&self, iface: InterfaceKind) -> SocketTypes {
        match iface {
            InterfaceKind::PcieHost | InterfaceKind::MemHost => SocketTypes::CONNECT,
            // 内置 e1000 网卡监听
            InterfaceKind::EthPort => SocketTypes::LISTEN,
            _ => SocketTypes::NONE,
        }
    }

    fn supported_image_formats(&self) -> &'static [DiskFormat] {
        &[DiskFormat::Raw]
    }

    fn default_resources(&self) -> Resources {
        Resources::new(1, self.memory_mb + 1024)
    }

    fn checkpoint_cmd(&self) -> Option<&'static str> {
        Some("m5 checkpoint")
    }

    fn exit_cmd(&self) -> &'static str {
        "m5 exit"
    }

    fn shm_paths(&self, ctx: &SimContext<'_>) -> Result<Vec<std::path::PathBuf>> {
        let mut out = Vec::new();
        for iface in ctx.ext_of(InterfaceKind::EthPort)? {
            let net = ctx.inst.simulation.simulator_name_of(ctx.opposite_component(iface)?.id)?;
            out.push(ctx.env().n2h_shm_path(net, ctx.name()));
        }
        Ok(out)
    }

    fn run_cmd(&self, ctx: &SimContext<'_>) -> Result<Vec<String>> {
        let env = ctx.env();
        let timing = ctx.timing()?;
        let name = ctx.name();
        let cpu_type = if env.create_cp {
            &self.cpu_type_cp
        } else {
            &self.cpu_type
        };

        let mut cmd = CmdBuilder::new(
            env.repo_path(&format!("sims/external/gem5/build/X86/gem5.{}", self.variant)),
        );
        cmd.arg(format!("--outdir={}", env.gem5_outdir(name).display()))
            .args(&self.extra_main_args)
            .path(env.repo_path("sims/external/gem5/configs/simbricks/simbricks.py"))
            .args([
                "--caches",
                "--l2cache",
                "--l3cache",
                "--l1d_size=32kB",
                "--l1i_size=32kB",
                "--l2_size=2MB",
                "--l3_size=32MB",
                "--l1d_assoc=8",
                "--l1i_assoc=8",
                "--l2_assoc=4",
                "--l3_assoc=16",
                "--cacheline_size=64",
            ])
            .arg(format!("--cpu-clock={}", self.cpu_freq))
            .arg(format!("--sys-clock={}", self.sys_clock))
            .arg(format!("--checkpoint-dir={}", env.gem5_cpdir(name).display()))
            .arg(format!("--kernel={}", env.repo_path(&self.kernel).display()));
        for (_, prep) in ctx.disks()? {
            cmd.arg(format!("--disk-image={}", prep.path().display()));
        }
        cmd.arg(format!("--cpu-type={cpu_type}"))
            .arg(format!("--mem-size={}MB", self.memory_mb))
            .arg(format!("--num-cpus={}", self.cores))
            .arg("--mem-type=DDR4_2400_16x4");

        if env.restore_cp {
            cmd.opt("-r", 1);
        }

        let sync_suffix = if timing.sync { ":sync" } else { "" };
        for iface in ctx.ext_of(InterfaceKind::PcieHost)? {
            let sock = ctx.socket(iface)?;
            cmd.arg(format!(
                "--simbricks-pci=connect:{}:latency={}ns:sync_interval={}ns{sync_suffix}",
                sock.path.display(),
                timing.latency(InterfaceFamily::Pcie),
                timing.sync_period
            ));
        }
        for iface in ctx.ext_of(InterfaceKind::MemHost)? {
            let sock = ctx.socket(iface)?;
            let (size, addr) = mem_window(ctx.opposite_component(iface)?)?;
            cmd.arg(format!(
                "--simbricks-mem={size}@{addr}@connect:{}:latency={}ns:sync_interval={}ns{sync_suffix}",
                sock.path.display(),
                timing.latency(InterfaceFamily::Mem),
                timing.sync_period
            ));
        }
        for iface in ctx.ext_of(InterfaceKind::EthPort)? {
            let sock = ctx.socket(iface)?;
            let net = ctx.inst.simulation.simulator_name_of(ctx.opposite_component(iface)?.id)?;
            cmd.arg(format!(
                "--simbricks-eth-e1000=listen:{}:{}:latency={}ns:sync_interval={}ns{sync_suffix}",
                sock.path.display(),
                env.n2h_shm_path(net, name).display(),
                timing.latency(InterfaceFamily::Eth),
                timing.sync_period
            ));
        }
        cmd.args(&ctx.sim.extra_args);
        Ok(cmd.build())
    }
}

/// 内存对端暴露的窗口 (size, addr)
fn mem_window(comp: &crate::system::Component) -> Result<(u64, u64)> {
    match &comp.kind {
        ComponentKind::MemDevice(cfg) => Ok((cfg.size, cfg.addr)),
        ComponentKind::MemInterconnect { routes } => {
            let lo = routes.iter().map(|r| r.vaddr_lo).min().unwrap_or(0);
            let hi = routes.iter().map(|r| r.vaddr_hi).max().unwrap_or(0);
            Ok((hi - lo, lo))
        }
        _ => Err(OrchError::InvalidGraph(format!(
            "`{}` is not a memory target",
            comp.name
        ))),
    }
}

/// Simics 主机；镜像准备尚未支持
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimicsHost {
    #[serde(default)]
    pub script: Option<String>,
}

impl SimBehavior for SimicsHost {
    fn class_name(&self) -> &'static str {
        "SimicsSim"
    }

    fn category(&self) -> SimCategory {
        SimCategory::Host
    }

    fn accepts(&self, kind: &ComponentKind) -> bool {
        accepts_host(kind)
    }

    fn supported_socket_types(&self, iface: InterfaceKind) -> SocketTypes {
        match iface {
            InterfaceKind::PcieHost => SocketTypes::CONNECT,
            _ => SocketTypes::NONE,
        }
    }

    fn default_resources(&self) -> Resources {
        Resources::new(1, 4096)
    }

    fn run_cmd(&self, ctx: &SimContext<'_>) -> Result<Vec<String>> {
        // 镜像格式列表为空，这里会以 ImageFormatUnsupported 失败
        ctx.disks()?;
        let mut cmd = CmdBuilder::new(ctx.env().repo_path("sims/external/simics/simics"));
        cmd.arg("-batch-mode");
        if let Some(script) = &self.script {
            cmd.arg(script);
        }
        cmd.args(&ctx.sim.extra_args);
        Ok(cmd.build())
    }
}
