use simbricks_orch::instantiation::{Environment, Instantiation, ProxyType};
use simbricks_orch::output::SimulationOutput;
use simbricks_orch::runtime::{
    LocalParallelRuntime, LocalSimpleRuntime, ProxyRetry, RunConfig, RunOutcome, Runtime,
    enqueue, plan_runs,
};
use simbricks_orch::simulation::{SimicsHost, SimulatorKind};
use simbricks_orch::system::{ComponentKind, DiskImage};
use simbricks_orch::topo::pair::{PairApp, PairHost, PairOpts, build_pair};
use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

// 写脚本与 fork 子进程交错会导致 ETXTBSY，这些用例串行执行
static SERIAL: Mutex<()> = Mutex::new(());

const NIC: &str = "#!/bin/sh\ntouch \"$1\"\nexec sleep 30\n";
const NIC_CRASH: &str = "#!/bin/sh\necho 'device init failed' >&2\nexit 1\n";
const SWITCH: &str = "#!/bin/sh\nprev=\nfor a in \"$@\"; do\n  if [ \"$prev\" = -h ]; then touch \"$a\"; fi\n  prev=$a\ndone\nexec sleep 30\n";
const PROXY: &str = "#!/bin/sh\nprev=\nfor a in \"$@\"; do\n  if [ \"$prev\" = -L ]; then touch \"$a\"; fi\n  prev=$a\ndone\necho 'carrier up'\nexec sleep 30\n";
// 只有监听端能起来，连接端立即失败
const PROXY_NO_CONNECT: &str = "#!/bin/sh\ncase \" $* \" in\n  *\" -l \"*) ;;\n  *) echo 'connect: refused' >&2; exit 1 ;;\nesac\nprev=\nfor a in \"$@\"; do\n  if [ \"$prev\" = -L ]; then touch \"$a\"; fi\n  prev=$a\ndone\nexec sleep 30\n";
const QEMU_IMG: &str = "#!/bin/sh\nfor a in \"$@\"; do last=$a; done\ntouch \"$last\"\n";
const QEMU_SHORT: &str = "#!/bin/sh\necho 'guest up'\nsleep 1\nexit 0\n";
const QEMU_LONG: &str = "#!/bin/sh\necho 'guest up'\nexec sleep 30\n";
// server 主机从不自行退出，client 一秒后正常关机
const QEMU_CLIENT_ONLY: &str = "#!/bin/sh\ncase \"$*\" in\n  *hdcopy.server*) exec sleep 30 ;;\nesac\necho 'guest up'\nsleep 1\nexit 0\n";
const GEM5: &str = "#!/bin/sh\necho \"gem5 $*\"\nsleep 1\nexit 0\n";

fn unique_temp_dir(prefix: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("time went backwards")
        .as_nanos();
    let dir = std::env::temp_dir().join(format!(
        "simbricks-orch-{prefix}-{}-{nanos}",
        std::process::id()
    ));
    fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

fn write_script(repo: &Path, rel: &str, body: &str) {
    let path = repo.join(rel);
    fs::create_dir_all(path.parent().expect("script has a parent")).expect("create script dir");
    fs::write(&path, body).expect("write script");
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod script");
}

/// 用 shell 脚本冒充各仿真器的仓库
fn fake_repo(dir: &Path, nic: &str, qemu: &str) -> PathBuf {
    fake_repo_with_proxy(dir, nic, qemu, PROXY)
}

fn fake_repo_with_proxy(dir: &Path, nic: &str, qemu: &str, proxy: &str) -> PathBuf {
    let repo = dir.join("repo");
    write_script(&repo, "sims/nic/i40e_bm/i40e_bm", nic);
    write_script(&repo, "sims/net/switch/net_switch", SWITCH);
    write_script(&repo, "sims/external/qemu/build/qemu-img", QEMU_IMG);
    write_script(&repo, "sims/external/qemu/build/qemu-system-x86_64", qemu);
    write_script(&repo, "sims/external/gem5/build/X86/gem5.fast", GEM5);
    write_script(&repo, "dist/sockets/net_sockets", proxy);
    repo
}

fn test_config() -> RunConfig {
    RunConfig {
        socket_timeout: Duration::from_secs(2),
        grace_int: Duration::from_secs(1),
        grace_term: Duration::from_secs(1),
        poll_interval: Duration::from_millis(50),
        proxy_retry: ProxyRetry {
            attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(400),
            connect_timeout: Duration::from_secs(2),
            ready_marker: None,
            settle: Duration::from_millis(200),
        },
        ..RunConfig::default()
    }
}

fn pair(name: &str, opts: &PairOpts, repo: &Path, dir: &Path) -> Instantiation {
    let env = Environment::new(repo, dir.join("work"));
    build_pair(name, opts, env)
        .expect("build pair")
        .instantiation
}

async fn run_all(insts: &[Instantiation], outdir: &Path) -> Vec<RunOutcome> {
    let mut rt = LocalSimpleRuntime::new(test_config());
    for inst in insts {
        let set = plan_runs(inst, 0, outdir, &BTreeMap::new()).expect("plan runs");
        enqueue(&mut rt, set);
    }
    rt.start().await.expect("runtime start")
}

fn load(outdir: &Path, run_id: &str) -> SimulationOutput {
    SimulationOutput::load(&outdir.join(format!("{run_id}.json"))).expect("load output")
}

#[tokio::test]
async fn netperf_pair_runs_to_completion() {
    let _guard = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    let dir = unique_temp_dir("netperf");
    let repo = fake_repo(&dir, NIC, QEMU_SHORT);
    let inst = pair("netperf", &PairOpts::default(), &repo, &dir);
    let outdir = dir.join("out");

    let outcomes = run_all(&[inst], &outdir).await;
    assert_eq!(outcomes.len(), 1);
    assert!(outcomes[0].success, "{outcomes:?}");
    assert!(!outcomes[0].interrupted);

    let out = load(&outdir, "netperf.main.0");
    assert!(out.success);
    assert!(out.error.is_none());
    assert_eq!(out.launch_order.len(), 5);
    assert_eq!(out.launch_order[0], "net.switch");
    let pos = |k: &str| out.launch_order.iter().position(|x| x == k).expect("launched");
    assert!(pos("nic.nic_client") < pos("host.client"));
    assert!(pos("nic.nic_server") < pos("host.server"));

    let client = out.sim("host.client").expect("client record");
    assert_eq!(client.exit_code, Some(0));
    assert!(client.stdout_text().contains("guest up"));
    assert!(client.argv.iter().any(|a| a.contains("simbricks-pci,socket=")));
    assert!(!dir.join("work/netperf.main.0").exists());

    let _ = fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn split_pair_finishes_when_client_fragment_is_done() {
    let _guard = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    let dir = unique_temp_dir("split");
    let repo = fake_repo(&dir, NIC, QEMU_CLIENT_ONLY);
    let opts = PairOpts {
        app: PairApp::Ping,
        split: Some(ProxyType::Tcp),
        ..PairOpts::default()
    };
    let inst = pair("ping", &opts, &repo, &dir);
    let outdir = dir.join("out");

    let started = std::time::Instant::now();
    let outcomes = run_all(&[inst], &outdir).await;
    assert!(started.elapsed() < Duration::from_secs(20));
    assert_eq!(outcomes.len(), 2);
    assert!(outcomes.iter().all(|o| o.success), "{outcomes:?}");

    let f0 = load(&outdir, "ping.f0.0");
    assert_eq!(f0.fragment, "f0");
    assert_eq!(f0.launch_order[0], "net.switch");
    assert!(f0.sim("proxy.tcp_f0_f1_listen").is_some());
    assert!(f0.sim("host.server").is_none());
    assert_eq!(f0.sim("host.client").expect("client").exit_code, Some(0));

    // f1 没有等待对象，随 f0 的等待集合结束而收尾
    let f1 = load(&outdir, "ping.f1.0");
    assert!(f1.success);
    assert!(f1.error.is_none());
    assert_eq!(f1.launch_order[0], "proxy.tcp_f0_f1_connect");
    let proxy = f1.sim("proxy.tcp_f0_f1_connect").expect("proxy record");
    assert_eq!(proxy.class, "tcpProxy");
    let server = f1.sim("host.server").expect("server");
    assert_eq!(server.exit_code, None);
    assert!(server.signal.is_some());

    let _ = fs::remove_dir_all(&dir);
}

/// 代理方向反过来：交换机旁边的代理主动连接，只持有 CONNECT socket
fn reversed_split(name: &str, repo: &Path, dir: &Path) -> Instantiation {
    let opts = PairOpts {
        app: PairApp::Ping,
        ..PairOpts::default()
    };
    let built = build_pair(name, &opts, Environment::new(repo, dir.join("work"))).expect("build pair");
    let mut inst = Instantiation::new(
        built.instantiation.simulation.clone(),
        built.instantiation.env.clone(),
    );
    let f0 = inst
        .add_fragment("f0", &[built.client, built.nic_client, built.switch])
        .expect("fragment f0");
    let f1 = inst
        .add_fragment("f1", &[built.server, built.nic_server])
        .expect("fragment f1");
    inst.add_proxy_pair(ProxyType::Tcp, f1, f0, &[built.server_link], "127.0.0.1", 5000)
        .expect("proxy pair");
    inst
}

#[tokio::test]
async fn unreachable_carrier_is_retried_then_fails_the_group() {
    let _guard = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    let dir = unique_temp_dir("carrier");
    let repo = fake_repo_with_proxy(&dir, NIC, QEMU_CLIENT_ONLY, PROXY_NO_CONNECT);
    let inst = reversed_split("ping", &repo, &dir);
    let outdir = dir.join("out");

    let started = std::time::Instant::now();
    let outcomes = run_all(&[inst], &outdir).await;
    assert!(started.elapsed() < Duration::from_secs(20));
    assert_eq!(outcomes.len(), 2);
    assert!(outcomes.iter().all(|o| !o.success && !o.interrupted));

    let f0 = load(&outdir, "ping.f0.0");
    let err = f0.error.expect("f0 error");
    assert_eq!(err.kind, "ProxyCarrierUnreachable");
    assert!(err.message.contains("proxy.tcp_f1_f0_connect"));
    assert!(err.message.contains("3 attempts"));
    assert_eq!(f0.launch_order, vec!["net.switch"]);

    let f1 = load(&outdir, "ping.f1.0");
    let err = f1.error.expect("f1 error");
    assert_eq!(err.kind, "PeerFragmentFailed");
    assert!(err.message.contains("ping.f0.0"));
    assert!(f1.sims.values().all(|s| s.end_time.is_some()));

    let _ = fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn connecting_proxy_waits_for_ready_marker() {
    let _guard = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    let dir = unique_temp_dir("marker");
    let repo = fake_repo(&dir, NIC, QEMU_CLIENT_ONLY);
    let inst = reversed_split("ping", &repo, &dir);
    let outdir = dir.join("out");

    let mut cfg = test_config();
    cfg.proxy_retry.ready_marker = Some("carrier up".to_string());
    let mut rt = LocalSimpleRuntime::new(cfg);
    enqueue(&mut rt, plan_runs(&inst, 0, &outdir, &BTreeMap::new()).expect("plan runs"));
    let outcomes = rt.start().await.expect("runtime start");
    assert!(outcomes.iter().all(|o| o.success), "{outcomes:?}");

    let f0 = load(&outdir, "ping.f0.0");
    let pos = |k: &str| f0.launch_order.iter().position(|x| x == k).expect("launched");
    assert!(pos("net.switch") < pos("proxy.tcp_f1_f0_connect"));
    assert!(pos("proxy.tcp_f1_f0_connect") < pos("host.client"));
    let proxy = f0.sim("proxy.tcp_f1_f0_connect").expect("proxy record");
    assert!(proxy.stdout_text().contains("carrier up"));
    assert!(proxy.argv.iter().any(|a| a == "-C"));
    assert!(!proxy.argv.iter().any(|a| a == "-l"));

    let _ = fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn failed_prerequisite_skips_dependent() {
    let _guard = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    let dir = unique_temp_dir("prereq");
    let good = fake_repo(&dir, NIC, QEMU_SHORT);
    let empty = dir.join("empty-repo");
    fs::create_dir_all(&empty).expect("create empty repo");
    let a = pair("a", &PairOpts::default(), &empty, &dir);
    let b = pair("b", &PairOpts::default(), &good, &dir);
    let outdir = dir.join("out");

    let mut rt = LocalSimpleRuntime::new(test_config());
    let mut ra = plan_runs(&a, 0, &outdir, &BTreeMap::new()).expect("plan a");
    let mut rb = plan_runs(&b, 0, &outdir, &BTreeMap::new()).expect("plan b");
    let id_a = rt.add_run(ra.measure.remove(0));
    let mut run_b = rb.measure.remove(0);
    run_b.prereq = Some(id_a);
    rt.add_run(run_b);
    let outcomes = rt.start().await.expect("runtime start");

    assert_eq!(outcomes.len(), 2);
    assert!(!outcomes[0].success);
    assert!(!outcomes[1].success);
    let out_a = load(&outdir, "a.main.0");
    assert_eq!(out_a.error.expect("a error").kind, "ExecutorError");
    let out_b = load(&outdir, "b.main.0");
    let err = out_b.error.expect("b error");
    assert_eq!(err.kind, "PrerequisiteFailed");
    assert!(err.message.contains("a.main.0"));
    assert!(out_b.sims.is_empty());
    assert!(!out_b.interrupted);

    let _ = fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn missing_socket_times_out_and_records_exit_code() {
    let _guard = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    let dir = unique_temp_dir("crash");
    let repo = fake_repo(&dir, NIC_CRASH, QEMU_SHORT);
    let inst = pair("crash", &PairOpts::default(), &repo, &dir);
    let outdir = dir.join("out");

    let outcomes = run_all(&[inst], &outdir).await;
    assert!(!outcomes[0].success);
    assert!(!outcomes[0].interrupted);

    let out = load(&outdir, "crash.main.0");
    let err = out.error.as_ref().expect("error recorded");
    assert_eq!(err.kind, "SocketTimeout");
    assert!(err.message.contains("dev.pci.nic_client"));
    assert_eq!(out.launch_order, vec!["net.switch", "nic.nic_client"]);
    let nic = out.sim("nic.nic_client").expect("nic record");
    assert_eq!(nic.exit_code, Some(1));
    assert!(nic.stderr_text().contains("device init failed"));
    assert!(out.sim("host.client").is_none());

    let _ = fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn cancellation_interrupts_and_cleans_up() {
    let _guard = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    let dir = unique_temp_dir("cancel");
    let repo = fake_repo(&dir, NIC, QEMU_LONG);
    let inst = pair("cancel", &PairOpts::default(), &repo, &dir);
    let outdir = dir.join("out");

    let mut rt = LocalSimpleRuntime::new(test_config());
    let set = plan_runs(&inst, 0, &outdir, &BTreeMap::new()).expect("plan runs");
    enqueue(&mut rt, set);
    let token = rt.cancel_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(1500)).await;
        token.cancel();
    });
    let started = std::time::Instant::now();
    let outcomes = rt.start().await.expect("runtime start");
    assert!(started.elapsed() < Duration::from_secs(20));

    assert_eq!(outcomes.len(), 1);
    assert!(!outcomes[0].success);
    assert!(outcomes[0].interrupted);
    let out = load(&outdir, "cancel.main.0");
    assert_eq!(out.error.expect("error recorded").kind, "Cancelled");
    assert!(out.interrupted);
    // 所有仿真器都已被信号终止
    assert!(out.sims.values().all(|s| s.end_time.is_some()));
    assert!(out
        .sims
        .values()
        .all(|s| s.exit_code.is_some() || s.signal.is_some()));
    assert!(!dir.join("work/cancel.main.0").exists());

    let _ = fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn run_timeout_interrupts_and_shuts_down() {
    let _guard = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    let dir = unique_temp_dir("timeout");
    let repo = fake_repo(&dir, NIC, QEMU_LONG);
    let inst = pair("slow", &PairOpts::default(), &repo, &dir);
    let outdir = dir.join("out");

    let cfg = RunConfig {
        run_timeout: Some(Duration::from_secs(2)),
        ..test_config()
    };
    let mut rt = LocalSimpleRuntime::new(cfg);
    enqueue(&mut rt, plan_runs(&inst, 0, &outdir, &BTreeMap::new()).expect("plan runs"));
    let started = std::time::Instant::now();
    let outcomes = rt.start().await.expect("runtime start");
    assert!(started.elapsed() < Duration::from_secs(20));

    assert!(!outcomes[0].success);
    assert!(outcomes[0].interrupted);
    let out = load(&outdir, "slow.main.0");
    assert_eq!(out.error.expect("error recorded").kind, "RunTimeout");
    assert!(out.interrupted);
    assert_eq!(out.launch_order.len(), 5);
    assert!(out.sims.values().all(|s| s.end_time.is_some() && s.signal.is_some()));
    assert!(!dir.join("work/slow.main.0").exists());

    let _ = fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn checkpoint_run_gates_restoring_measurement() {
    let _guard = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    let dir = unique_temp_dir("checkpoint");
    let repo = fake_repo(&dir, NIC, QEMU_SHORT);
    let opts = PairOpts {
        host: PairHost::Gem5,
        ..PairOpts::default()
    };
    let mut inst = pair("cpt", &opts, &repo, &dir);
    inst.simulation.checkpoint = true;
    let outdir = dir.join("out");

    let outcomes = run_all(&[inst], &outdir).await;
    let ids: Vec<&str> = outcomes.iter().map(|o| o.run_id.as_str()).collect();
    assert_eq!(ids, vec!["cpt.main.0.cp", "cpt.main.0"]);
    assert!(outcomes.iter().all(|o| o.success), "{outcomes:?}");

    let cp = load(&outdir, "cpt.main.0.cp");
    let measure = load(&outdir, "cpt.main.0");
    assert!(measure.start_time >= cp.end_time);
    assert!(dir.join("work/checkpoints/cpt.main.0").is_dir());

    let restores = |out: &SimulationOutput| {
        let argv = &out.sim("host.client").expect("client record").argv;
        argv.windows(2).any(|w| w[0] == "-r" && w[1] == "1")
    };
    assert!(!restores(&cp));
    assert!(restores(&measure));
    let cp_dir = format!(
        "--checkpoint-dir={}",
        dir.join("work/checkpoints/cpt.main.0/gem5-cp.client").display()
    );
    assert!(cp.sim("host.client").expect("client").argv.contains(&cp_dir));
    assert!(measure.sim("host.client").expect("client").argv.contains(&cp_dir));

    let _ = fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn unsupported_images_fail_before_launch() {
    let _guard = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    let dir = unique_temp_dir("images");
    let repo = fake_repo(&dir, NIC, QEMU_SHORT);
    let outdir = dir.join("out");

    let mut packer = build_pair("packer", &PairOpts::default(), Environment::new(&repo, dir.join("work")))
        .expect("build pair");
    let client_comp = packer
        .instantiation
        .simulation
        .simulator(packer.client)
        .expect("client sim")
        .components[0];
    let comp = packer
        .instantiation
        .simulation
        .system
        .component_mut(client_comp)
        .expect("client component");
    if let ComponentKind::Host(cfg) = &mut comp.kind {
        cfg.disks[0] = DiskImage::Packer {
            name: "base".to_string(),
        };
    }

    let mut simics = build_pair("simics", &PairOpts::default(), Environment::new(&repo, dir.join("work")))
        .expect("build pair");
    simics
        .instantiation
        .simulation
        .simulator_mut(simics.client)
        .expect("client sim")
        .kind = SimulatorKind::Simics(SimicsHost::default());

    let outcomes = run_all(&[packer.instantiation, simics.instantiation], &outdir).await;
    assert_eq!(outcomes.len(), 2);
    for run_id in ["packer.main.0", "simics.main.0"] {
        let out = load(&outdir, run_id);
        assert!(!out.success);
        assert!(!out.interrupted);
        assert_eq!(out.error.expect("error recorded").kind, "ImageFormatUnsupported");
        assert!(out.sims.is_empty());
        assert!(out.launch_order.is_empty());
    }

    let _ = fs::remove_dir_all(&dir);
}

async fn run_parallel(names: &[&str], cores: u32, memory_mb: u64, dir: &Path, repo: &Path) -> Vec<SimulationOutput> {
    let outdir = dir.join("out");
    let mut rt = LocalParallelRuntime::new(test_config(), cores, memory_mb);
    for name in names {
        let inst = pair(name, &PairOpts::default(), repo, dir);
        enqueue(&mut rt, plan_runs(&inst, 0, &outdir, &BTreeMap::new()).expect("plan runs"));
    }
    let outcomes = rt.start().await.expect("runtime start");
    assert_eq!(outcomes.len(), names.len());
    assert!(outcomes.iter().all(|o| o.success), "{outcomes:?}");
    names
        .iter()
        .map(|n| load(&outdir, &format!("{n}.main.0")))
        .collect()
}

/// 每个主机对需要 5 核、2816 MB
#[tokio::test]
async fn parallel_admission_follows_capacity() {
    let _guard = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    let dir = unique_temp_dir("parallel");
    let repo = fake_repo(&dir, NIC, QEMU_SHORT);

    // 容量足够：两个 Run 同时运行
    let outs = run_parallel(&["wide1", "wide2"], 10, 8192, &dir, &repo).await;
    assert!(outs[1].start_time < outs[0].end_time);

    // 核数不够：第二个等第一个结束
    let outs = run_parallel(&["cores1", "cores2"], 8, 8192, &dir, &repo).await;
    assert!(outs[1].start_time >= outs[0].end_time);

    // 内存不够
    let outs = run_parallel(&["mem1", "mem2"], 16, 4096, &dir, &repo).await;
    assert!(outs[1].start_time >= outs[0].end_time);

    // 单个 Run 就超过整机：空闲时独占运行
    let outs = run_parallel(&["big1", "big2"], 2, 1024, &dir, &repo).await;
    assert!(outs[1].start_time >= outs[0].end_time);

    let _ = fs::remove_dir_all(&dir);
}
