use clap::Parser;
use simbricks_orch::error::{OrchError, Result};
use simbricks_orch::exec::{Executor, plan_fragment};
use simbricks_orch::instantiation::{Instantiation, node_name};
use simbricks_orch::runtime::{
    BatchJob, LocalParallelRuntime, LocalSimpleRuntime, RunConfig, RunOutcome, RunSet, Runtime,
    SlurmRuntime, enqueue, plan_runs,
};
use simbricks_orch::util::shell_join;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Parser)]
#[command(
    name = "simbricks-run",
    about = "Launch SimBricks instantiations on the local machine, over ssh, or via slurm"
)]
struct Args {
    /// Instantiation JSON files
    instantiations: Vec<PathBuf>,

    /// SimBricks repository root (overrides the instantiation's environment)
    #[arg(long)]
    repo: Option<PathBuf>,

    /// Base directory for per-run working directories
    #[arg(long)]
    workdir: Option<PathBuf>,

    /// Directory receiving the per-run output JSON files
    #[arg(long, default_value = "out")]
    outdir: PathBuf,

    /// Base directory for checkpoints
    #[arg(long)]
    cpdir: Option<PathBuf>,

    /// Base directory for shared-memory pools
    #[arg(long)]
    shmdir: Option<PathBuf>,

    /// Number of repetitions of every instantiation
    #[arg(long, default_value_t = 1)]
    runs: usize,

    /// Index of the first repetition
    #[arg(long, default_value_t = 0)]
    firstrun: usize,

    /// Re-run even if the output file already exists
    #[arg(long)]
    force: bool,

    /// Only run instantiations whose name matches one of these globs
    #[arg(long)]
    filter: Vec<String>,

    /// Log at debug level and echo simulator output
    #[arg(long)]
    verbose: bool,

    /// Keep run and shared-memory directories after each run
    #[arg(long)]
    keep_workdir: bool,

    /// Print launch order and command lines without starting anything
    #[arg(long)]
    dry_run: bool,

    /// Run several Runs at once within --cores/--mem
    #[arg(long)]
    parallel: bool,

    /// Cores available to the parallel runtime (defaults to all)
    #[arg(long)]
    cores: Option<u32>,

    /// Memory (MB) available to the parallel runtime (defaults to physical memory)
    #[arg(long)]
    mem: Option<u64>,

    /// Submit Runs as slurm batch jobs
    #[arg(long)]
    slurm: bool,

    /// Directory for slurm job files and scripts
    #[arg(long, default_value = "slurm")]
    slurmdir: PathBuf,

    /// sbatch program
    #[arg(long, default_value = "sbatch")]
    sbatch: String,

    /// Execute a single Run from a batch job file
    #[arg(long)]
    from_run: Option<PathBuf>,

    /// Runner label mapped to an ssh destination, e.g. `node1=user@host`
    #[arg(long = "remote", value_parser = parse_remote)]
    remotes: Vec<(String, String)>,

    /// Seconds to wait for a simulator's sockets to appear
    #[arg(long)]
    socket_timeout: Option<u64>,

    /// Global per-Run time limit in seconds
    #[arg(long)]
    run_timeout: Option<u64>,
}

fn parse_remote(raw: &str) -> std::result::Result<(String, String), String> {
    match raw.split_once('=') {
        Some((label, dest)) if !label.is_empty() && !dest.is_empty() => {
            Ok((label.to_string(), dest.to_string()))
        }
        _ => Err(format!("expected LABEL=SSH_DEST, got `{raw}`")),
    }
}

/// `*` 匹配任意串，`?` 匹配单个字符
fn glob_match(pat: &str, s: &str) -> bool {
    fn go(p: &[char], s: &[char]) -> bool {
        match (p.first(), s.first()) {
            (None, None) => true,
            (Some('*'), _) => go(&p[1..], s) || (!s.is_empty() && go(p, &s[1..])),
            (Some('?'), Some(_)) => go(&p[1..], &s[1..]),
            (Some(a), Some(b)) if a == b => go(&p[1..], &s[1..]),
            _ => false,
        }
    }
    let p: Vec<char> = pat.chars().collect();
    let s: Vec<char> = s.chars().collect();
    go(&p, &s)
}

fn physical_mem_mb() -> u64 {
    // SAFETY: sysconf 只读取系统常量
    let (pages, page_size) = unsafe {
        (
            libc::sysconf(libc::_SC_PHYS_PAGES),
            libc::sysconf(libc::_SC_PAGESIZE),
        )
    };
    if pages <= 0 || page_size <= 0 {
        return 1024;
    }
    (pages as u64).saturating_mul(page_size as u64) / (1024 * 1024)
}

fn run_config(args: &Args) -> RunConfig {
    let mut cfg = RunConfig {
        verbose: args.verbose,
        ..RunConfig::default()
    };
    if let Some(s) = args.socket_timeout {
        cfg.socket_timeout = Duration::from_secs(s);
    }
    cfg.run_timeout = args.run_timeout.map(Duration::from_secs);
    cfg
}

fn load_instantiation(args: &Args, path: &Path) -> Result<Instantiation> {
    let raw = std::fs::read_to_string(path).map_err(|e| OrchError::io(path, e))?;
    let mut inst = Instantiation::from_json(&raw)?;
    if let Some(repo) = &args.repo {
        inst.env.repo_dir = repo.clone();
    }
    if let Some(work) = &args.workdir {
        inst.env.work_base = work.clone();
    }
    if let Some(cp) = &args.cpdir {
        inst.env.cp_base = cp.clone();
    }
    if let Some(shm) = &args.shmdir {
        inst.env.shm_base = shm.clone();
    }
    inst.env.keep_workdir |= args.keep_workdir;
    inst.ensure_fragments();
    Ok(inst)
}

fn print_plan(inst: &Instantiation) -> Result<()> {
    let frags: Vec<_> = inst.fragments().map(|f| (f.id, f.name.clone())).collect();
    for (id, fname) in frags {
        let mut scratch = inst.clone();
        let (plan, launches) = plan_fragment(&mut scratch, id)?;
        println!("== {} / {} ==", inst.name(), fname);
        for l in &launches {
            let deps: Vec<String> = plan
                .dependencies(l.node)
                .into_iter()
                .map(|d| node_name(&scratch, d))
                .collect();
            println!("{} ({})", l.key, l.class);
            if !deps.is_empty() {
                println!("  after: {}", deps.join(", "));
            }
            for p in &l.prep_cmds {
                println!("  prep: {}", shell_join(p));
            }
            println!("  cmd: {}", shell_join(&l.argv));
        }
    }
    Ok(())
}

/// 输出文件已存在的 Run 不再执行
fn drop_finished(set: &mut RunSet, force: bool) {
    if force {
        return;
    }
    let keep = |r: &simbricks_orch::runtime::Run| {
        let exists = r.output_path.exists();
        if exists {
            info!(run_id = %r.run_id, path = %r.output_path.display(), "⏭️  输出已存在，跳过");
        }
        !exists
    };
    set.checkpoint.retain(keep);
    set.measure.retain(keep);
}

async fn drive<R: Runtime>(
    rt: &mut R,
    token: CancellationToken,
    sets: Vec<RunSet>,
) -> Result<Vec<RunOutcome>> {
    for set in sets {
        enqueue(rt, set);
    }
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("🛑 收到 Ctrl-C，开始中断");
            token.cancel();
        }
    });
    let res = rt.start().await;
    watcher.abort();
    res
}

async fn from_run(path: &Path) -> Result<bool> {
    let job = BatchJob::load(path)?;
    let token = CancellationToken::new();
    let t = token.clone();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            t.cancel();
        }
    });
    let outcome = job.run.execute(job.cfg, token, None).await;
    watcher.abort();
    Ok(outcome.success)
}

async fn real_main(args: Args) -> Result<bool> {
    if let Some(path) = &args.from_run {
        return from_run(path).await;
    }

    let cfg = run_config(&args);
    let executors: BTreeMap<String, Executor> = args
        .remotes
        .iter()
        .map(|(label, dest)| (label.clone(), Executor::remote(dest.clone())))
        .collect();

    let mut insts = Vec::new();
    for path in &args.instantiations {
        let inst = load_instantiation(&args, path)?;
        if !args.filter.is_empty() && !args.filter.iter().any(|f| glob_match(f, inst.name())) {
            info!(name = %inst.name(), "⏭️  未匹配过滤条件");
            continue;
        }
        insts.push(inst);
    }

    if args.dry_run {
        for inst in &insts {
            print_plan(inst)?;
        }
        return Ok(true);
    }

    let mut sets = Vec::new();
    for inst in &insts {
        for index in args.firstrun..args.firstrun + args.runs {
            let mut set = plan_runs(inst, index, &args.outdir, &executors)?;
            drop_finished(&mut set, args.force);
            sets.push(set);
        }
    }

    let outcomes = if args.slurm {
        let exe = std::env::current_exe().map_err(|e| OrchError::io("current_exe", e))?;
        let mut rt = SlurmRuntime::new(&args.slurmdir, exe, cfg).with_sbatch(args.sbatch.clone());
        let token = rt.cancel_token();
        drive(&mut rt, token, sets).await?
    } else if args.parallel {
        let cores = args.cores.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get() as u32)
                .unwrap_or(1)
        });
        let mem = args.mem.unwrap_or_else(physical_mem_mb);
        let mut rt = LocalParallelRuntime::new(cfg, cores, mem);
        let token = rt.cancel_token();
        drive(&mut rt, token, sets).await?
    } else {
        let mut rt = LocalSimpleRuntime::new(cfg);
        let token = rt.cancel_token();
        drive(&mut rt, token, sets).await?
    };

    let failed: Vec<&RunOutcome> = outcomes.iter().filter(|o| !o.success).collect();
    for o in &failed {
        error!(run_id = %o.run_id, interrupted = o.interrupted, "❌ Run 未成功");
    }
    info!(total = outcomes.len(), failed = failed.len(), "全部完成");
    Ok(failed.is_empty())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();
    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_file(true)
        .with_line_number(true)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    match real_main(args).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!(error = %e, kind = e.kind(), "❌ 运行失败");
            ExitCode::FAILURE
        }
    }
}
