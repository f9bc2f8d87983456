use serde_json::Value;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};

fn unique_temp_dir(prefix: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("time went backwards")
        .as_nanos();
    let dir = std::env::temp_dir().join(format!(
        "simbricks-orch-cli-{prefix}-{}-{nanos}",
        std::process::id()
    ));
    fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

fn topo(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_simbricks_topo"))
        .args(args)
        .output()
        .expect("run simbricks_topo")
}

fn run(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_simbricks_run"))
        .args(args)
        .output()
        .expect("run simbricks_run")
}

fn write_pair(dir: &Path, extra: &[&str]) -> PathBuf {
    let path = dir.join("pair.json");
    let mut args = vec![
        "--name",
        "pair",
        "--repo",
        "/repo",
        "--workdir",
        "/work",
        "--out",
        path.to_str().unwrap(),
        "pair",
    ];
    args.extend_from_slice(extra);
    let output = topo(&args);
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    path
}

#[test]
fn topo_writes_split_instantiation() {
    let dir = unique_temp_dir("topo");
    let path = write_pair(&dir, &["--app", "ping", "--split", "tcp"]);
    let v: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();

    assert_eq!(v["simulation"]["name"], "pair");
    assert_eq!(v["env"]["repo_dir"], "/repo");
    let frags: Vec<&str> = v["fragments"]
        .as_array()
        .expect("fragments array")
        .iter()
        .map(|f| f["name"].as_str().unwrap())
        .collect();
    assert_eq!(frags, vec!["f0", "f1"]);
    let proxies = v["proxies"].as_array().expect("proxies array");
    assert_eq!(proxies.len(), 2);
    assert!(proxies.iter().all(|p| p["proxy_type"] == "tcp"));
    assert_eq!(v["simulation"]["simulators"].as_array().unwrap().len(), 5);
}

#[test]
fn topo_to_stdout_and_mem_pool() {
    let output = topo(&["--name", "mp", "mem-pool", "--devices", "3"]);
    assert!(output.status.success());
    let v: Value = serde_json::from_slice(&output.stdout).expect("json on stdout");
    assert_eq!(v["simulation"]["name"], "mp");
    assert_eq!(v["simulation"]["simulators"].as_array().unwrap().len(), 5);
}

#[test]
fn dry_run_prints_launch_plan() {
    let dir = unique_temp_dir("dry");
    let path = write_pair(&dir, &[]);
    let output = run(&["--dry-run", path.to_str().unwrap()]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    let lines: Vec<&str> = stdout.lines().collect();

    assert_eq!(lines[0], "== pair / main ==");
    assert_eq!(lines[1], "net.switch (SwitchNet)");
    assert!(lines[2].starts_with("  cmd: /repo/sims/net/switch/net_switch -S 500 -E 500 -u"));
    assert!(stdout.contains("nic.nic_client (I40eNicSim)\n  after: switch\n"));
    assert!(stdout.contains(
        "  prep: /repo/sims/external/qemu/build/qemu-img create -f qcow2 -o backing_file=/repo/images/output-base/base /work/run/hdcopy.client"
    ));
    let hosts = lines.iter().filter(|l| l.ends_with("(QemuSim)")).count();
    assert_eq!(hosts, 2);
}

#[test]
fn filter_excludes_unmatched_instantiations() {
    let dir = unique_temp_dir("filter");
    let path = write_pair(&dir, &[]);
    let output = run(&["--dry-run", "--filter", "other*", path.to_str().unwrap()]);
    assert!(output.status.success());
    assert!(output.stdout.is_empty());

    let output = run(&["--dry-run", "--filter", "pa?r", path.to_str().unwrap()]);
    assert!(String::from_utf8_lossy(&output.stdout).contains("== pair / main =="));
}

#[test]
fn bad_remote_spec_is_rejected() {
    let output = run(&["--remote", "nolabel", "x.json"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("LABEL=SSH_DEST"));
}

fn write_script(repo: &Path, rel: &str, body: &str) {
    let path = repo.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(&path, body).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
}

#[test]
fn local_run_writes_output_and_skips_finished() {
    let dir = unique_temp_dir("local");
    let repo = dir.join("repo");
    write_script(&repo, "sims/nic/i40e_bm/i40e_bm", "#!/bin/sh\ntouch \"$1\"\nexec sleep 30\n");
    write_script(
        &repo,
        "sims/net/switch/net_switch",
        "#!/bin/sh\nprev=\nfor a in \"$@\"; do\n  if [ \"$prev\" = -h ]; then touch \"$a\"; fi\n  prev=$a\ndone\nexec sleep 30\n",
    );
    write_script(
        &repo,
        "sims/external/qemu/build/qemu-img",
        "#!/bin/sh\nfor a in \"$@\"; do last=$a; done\ntouch \"$last\"\n",
    );
    write_script(
        &repo,
        "sims/external/qemu/build/qemu-system-x86_64",
        "#!/bin/sh\necho booted\nsleep 1\nexit 0\n",
    );
    let path = write_pair(&dir, &[]);
    let work = dir.join("work");
    let out = dir.join("out");
    let args = [
        path.to_str().unwrap(),
        "--repo",
        repo.to_str().unwrap(),
        "--workdir",
        work.to_str().unwrap(),
        "--outdir",
        out.to_str().unwrap(),
        "--socket-timeout",
        "5",
    ];

    let output = run(&args);
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let record = out.join("pair.main.0.json");
    let first: Value = serde_json::from_str(&fs::read_to_string(&record).unwrap()).unwrap();
    assert_eq!(first["success"], true);
    assert_eq!(first["run_id"], "pair.main.0");
    assert_eq!(first["sims"]["host.client"]["exit_code"], 0);

    // 输出已存在：不加 --force 时不会重跑
    let output = run(&args);
    assert!(output.status.success());
    let second: Value = serde_json::from_str(&fs::read_to_string(&record).unwrap()).unwrap();
    assert_eq!(first["start_time"], second["start_time"]);

    let _ = fs::remove_dir_all(&dir);
}
