use crate::exec::{NodeLaunch, plan_fragment};
use crate::instantiation::Instantiation;
use crate::simulation::{Simulation, SimulatorKind, SwitchNet, WireNet, port_mac_rev};
use crate::system::System;
use crate::topo::memory::{MemPoolOpts, build_mem_pool};

use super::{env, frag_named, netperf_pair};

fn launches(inst: &Instantiation, frag: &str) -> Vec<NodeLaunch> {
    let mut scratch = inst.clone();
    let id = frag_named(inst, frag);
    plan_fragment(&mut scratch, id).unwrap().1
}

fn launch<'a>(all: &'a [NodeLaunch], key: &str) -> &'a NodeLaunch {
    all.iter()
        .find(|l| l.key == key)
        .unwrap_or_else(|| panic!("no launch for {key}"))
}

fn strs(v: &[&str]) -> Vec<String> {
    v.iter().map(|s| s.to_string()).collect()
}

#[test]
fn nic_positional_arguments() {
    let pair = netperf_pair();
    let all = launches(&pair.instantiation, "main");
    let nic = launch(&all, "nic.nic_client");
    assert_eq!(nic.class, "I40eNicSim");
    assert_eq!(
        nic.argv,
        strs(&[
            "/repo/sims/nic/i40e_bm/i40e_bm",
            "/work/run/dev.pci.nic_client",
            "/work/run/nic.eth.nic_client",
            "/work/run/dev.shm.nic_client",
            "0",
            "0",
            "500",
            "500",
            "500",
        ])
    );
    assert_eq!(
        nic.wait_paths,
        vec![std::path::PathBuf::from("/work/run/dev.pci.nic_client")]
    );
}

#[test]
fn switch_listens_for_nics() {
    let pair = netperf_pair();
    let all = launches(&pair.instantiation, "main");
    let sw = launch(&all, "net.switch");
    assert_eq!(
        sw.argv,
        strs(&[
            "/repo/sims/net/switch/net_switch",
            "-S",
            "500",
            "-E",
            "500",
            "-u",
            "-h",
            "/work/run/nic.eth.nic_client",
            "-h",
            "/work/run/nic.eth.nic_server",
        ])
    );
    assert_eq!(sw.wait_paths.len(), 2);
}

#[test]
fn synchronized_switch_drops_unsync_flag() {
    let mut pair = netperf_pair();
    pair.instantiation
        .simulation
        .enable_synchronization(None, crate::simulation::TimeUnit::Ns)
        .unwrap();
    let all = launches(&pair.instantiation, "main");
    let sw = launch(&all, "net.switch");
    assert!(!sw.argv.iter().any(|a| a == "-u"));
    let nic = launch(&all, "nic.nic_server");
    assert_eq!(nic.argv[4], "1");
}

#[test]
fn qemu_host_uses_overlay_and_pci_device() {
    let pair = netperf_pair();
    let all = launches(&pair.instantiation, "main");
    let host = launch(&all, "host.client");
    assert_eq!(host.class, "QemuSim");
    assert_eq!(
        host.prep_cmds,
        vec![strs(&[
            "/repo/sims/external/qemu/build/qemu-img",
            "create",
            "-f",
            "qcow2",
            "-o",
            "backing_file=/repo/images/output-base/base",
            "/work/run/hdcopy.client",
        ])]
    );
    assert_eq!(
        host.argv[0],
        "/repo/sims/external/qemu/build/qemu-system-x86_64"
    );
    let dev = host
        .argv
        .windows(2)
        .find(|w| w[0] == "-device")
        .map(|w| w[1].clone())
        .unwrap();
    assert_eq!(dev, "simbricks-pci,socket=/work/run/dev.pci.nic_client,sync=off");
    assert!(host.argv.iter().any(|a| a
        == "file=/work/run/hdcopy.client,if=ide,index=0,media=disk"));
    assert!(host.argv.iter().any(|a| a
        == "file=/work/run/cfg.client.tar,if=ide,index=1,media=disk,driver=raw"));
    assert!(host.waits);
    assert!(!launch(&all, "host.server").waits);
    assert!(!host.argv.iter().any(|a| a == "-icount"));
}

#[test]
fn wire_listens_on_both_ends() {
    let mut sys = System::new();
    let s1 = sys.add_switch("s1").unwrap();
    let s2 = sys.add_switch("s2").unwrap();
    let w = sys.add_wire("w").unwrap();
    let c1 = sys.connect_eth(s1, w, 500).unwrap();
    let c2 = sys.connect_eth(s2, w, 500).unwrap();
    let mut sim = Simulation::new("wire", sys);
    sim.add_simulator_for("s1", SimulatorKind::Switch(SwitchNet::default()), &[s1])
        .unwrap();
    sim.add_simulator_for("s2", SimulatorKind::Switch(SwitchNet::default()), &[s2])
        .unwrap();
    sim.add_simulator_for("w", SimulatorKind::Wire(WireNet::default()), &[w])
        .unwrap();
    sim.materialize_channels().unwrap();
    let mut inst = Instantiation::new(sim, env());
    inst.ensure_fragments();

    let all = launches(&inst, "main");
    let a = format!("/work/run/n2n.eth.w.s1.{c1}");
    let b = format!("/work/run/n2n.eth.w.s2.{c2}");
    let wire = launch(&all, "net.w");
    assert_eq!(wire.class, "WireNet");
    assert_eq!(
        wire.argv,
        vec![
            "/repo/sims/net/wire/net_wire".to_string(),
            a.clone(),
            b.clone(),
            "0".into(),
            "500".into(),
            "500".into(),
        ]
    );
    assert_eq!(wire.wait_paths.len(), 2);
    assert_eq!(all[0].key, "net.w");
    let s1 = launch(&all, "net.s1");
    assert_eq!(&s1.argv[s1.argv.len() - 2..], &["-s".to_string(), a]);
}

#[test]
fn mem_pool_command_lines() {
    let pool = build_mem_pool("pool", &MemPoolOpts::default(), env()).unwrap();
    let all = launches(&pool.instantiation, "main");

    let mem0 = launch(&all, "mem.mem0");
    assert_eq!(mem0.class, "BasicMemDev");
    assert_eq!(
        mem0.argv,
        strs(&[
            "/repo/sims/mem/basicmem/basicmem",
            "1073741824",
            "0",
            "0",
            "/work/run/dev.mem.mem0",
            "/work/run/dev.shm.mem0",
            "1",
            "0",
            "500",
            "500",
        ])
    );

    let ms = launch(&all, "mem.memswitch");
    let size: u64 = 1 << 30;
    let expected = vec![
        "/repo/sims/mem/memswitch/memswitch".to_string(),
        "-S".into(),
        "500".into(),
        "-E".into(),
        "500".into(),
        "-s".into(),
        "/work/run/dev.mem.mem0".into(),
        "-s".into(),
        "/work/run/dev.mem.mem1".into(),
        "-h".into(),
        "/work/run/dev.mem.memswitch".into(),
        "-m".into(),
        format!("0,0,{size},{:#x},0", port_mac_rev(0).unwrap()),
        "-m".into(),
        format!("0,{size},{},{:#x},0", 2 * size, port_mac_rev(1).unwrap()),
    ];
    assert_eq!(ms.argv, expected);

    let host = launch(&all, "host.host");
    assert_eq!(host.class, "Gem5Sim");
    assert!(host.argv.iter().any(|a| a.starts_with(&format!(
        "--simbricks-mem={}@0@connect:/work/run/dev.mem.memswitch:latency=500ns:sync_interval=500ns:sync",
        2 * size
    ))));

    // 设备先于交换机，交换机先于主机
    let pos = |k: &str| all.iter().position(|l| l.key == k).unwrap();
    assert!(pos("mem.mem0") < pos("mem.memswitch"));
    assert!(pos("mem.mem1") < pos("mem.memswitch"));
    assert!(pos("mem.memswitch") < pos("host.host"));
}

#[test]
fn port_mac_is_byte_reversed() {
    assert_eq!(port_mac_rev(0).unwrap(), 0x02);
    assert_eq!(port_mac_rev(1).unwrap(), 0x0100_0000_0002);
    assert_eq!(port_mac_rev(255).unwrap(), 0xff00_0000_0002);
    assert_eq!(port_mac_rev(256).unwrap_err().kind(), "InvalidGraph");
}
