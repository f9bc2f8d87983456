//! 命令执行器
//!
//! 在本机或经 ssh 在远端启动子进程，逐行捕获输出，按进程组发送信号，
//! 并提供 Run 准备阶段所需的目录与文件原语。

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::{OrchError, Result};
use crate::output::{OutputLine, now_ts};
use crate::util::shell_join;

/// 进程在哪里运行
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Executor {
    #[default]
    Local,
    Remote {
        /// ssh 目标，如 `user@worker1`
        dest: String,
        #[serde(default)]
        ssh_args: Vec<String>,
    },
}

/// 关停阶梯上的信号
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Int,
    Term,
    Kill,
}

impl Signal {
    fn raw(self) -> libc::c_int {
        match self {
            Signal::Int => libc::SIGINT,
            Signal::Term => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        }
    }
}

/// 子进程的结束方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<std::process::ExitStatus> for ExitInfo {
    fn from(st: std::process::ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;
        Self {
            code: st.code(),
            signal: st.signal(),
        }
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(c), _) => write!(f, "exit code {c}"),
            (None, Some(s)) => write!(f, "killed by signal {s}"),
            (None, None) => f.write_str("unknown status"),
        }
    }
}

/// 实时输出（供旁路消费者跟踪）
#[derive(Debug, Clone)]
pub struct LiveLine {
    pub sim: String,
    pub stderr: bool,
    pub line: OutputLine,
}

type LineSink = Arc<Mutex<Vec<OutputLine>>>;

/// 已启动子进程的句柄
pub struct ProcessHandle {
    name: String,
    pid: Option<u32>,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
    stdout: LineSink,
    stderr: LineSink,
    live: broadcast::Sender<LiveLine>,
    readers: Vec<JoinHandle<()>>,
    waiter: JoinHandle<()>,
}

impl ProcessHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// 已退出时返回退出状态，不阻塞
    pub fn exit_status(&self) -> Option<ExitInfo> {
        *self.exit_rx.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.exit_status().is_none()
    }

    /// 等待子进程退出
    pub async fn wait(&mut self) -> ExitInfo {
        let status = self.exit_rx.wait_for(|s| s.is_some()).await.map(|st| *st);
        match status {
            Ok(info) => info.unwrap_or_default(),
            Err(_) => self.exit_status().unwrap_or_default(),
        }
    }

    /// 向整个进程组发信号；进程已退出时什么也不做
    pub fn signal(&self, sig: Signal) -> bool {
        if !self.is_running() {
            return false;
        }
        let Some(pgid) = self.pid.and_then(|p| libc::pid_t::try_from(p).ok()) else {
            return false;
        };
        debug!(sim = %self.name, pid = pgid, signal = ?sig, "发送信号");
        // SAFETY: kill(2) 只接收整数参数
        let rc = unsafe { libc::kill(-pgid, sig.raw()) };
        rc == 0
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LiveLine> {
        self.live.subscribe()
    }

    /// 等待输出读取任务读完管道，超过期限则放弃
    pub async fn drain(&mut self, budget: Duration) {
        let deadline = Instant::now() + budget;
        for r in self.readers.iter_mut() {
            if tokio::time::timeout_at(deadline, &mut *r).await.is_err() {
                warn!(sim = %self.name, "输出未在期限内读完");
                r.abort();
            }
        }
        self.readers.clear();
    }

    /// 取出目前捕获的 (stdout, stderr)
    pub fn take_output(&self) -> (Vec<OutputLine>, Vec<OutputLine>) {
        let take = |sink: &LineSink| {
            sink.lock()
                .map(|mut v| std::mem::take(&mut *v))
                .unwrap_or_default()
        };
        (take(&self.stdout), take(&self.stderr))
    }

    pub fn stdout_snapshot(&self) -> Vec<String> {
        self.stdout
            .lock()
            .map(|v| v.iter().map(|l| l.line.clone()).collect())
            .unwrap_or_default()
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        for r in &self.readers {
            r.abort();
        }
        if self.is_running() {
            self.signal(Signal::Kill);
        }
        self.waiter.abort();
    }
}

fn spawn_reader<R>(
    name: String,
    stream: R,
    is_stderr: bool,
    sink: LineSink,
    live: broadcast::Sender<LiveLine>,
    verbose: bool,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if verbose {
                        debug!(sim = %name, stderr = is_stderr, "{line}");
                    } else {
                        trace!(sim = %name, stderr = is_stderr, "{line}");
                    }
                    let entry = OutputLine { ts: now_ts(), line };
                    let _ = live.send(LiveLine {
                        sim: name.clone(),
                        stderr: is_stderr,
                        line: entry.clone(),
                    });
                    if let Ok(mut v) = sink.lock() {
                        v.push(entry);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(sim = %name, error = %e, "读取输出失败");
                    break;
                }
            }
        }
    })
}

impl Executor {
    pub fn remote(dest: impl Into<String>) -> Self {
        Executor::Remote {
            dest: dest.into(),
            ssh_args: Vec::new(),
        }
    }

    /// 远端执行时用 ssh 包装命令
    fn wrap(&self, argv: &[String]) -> Vec<String> {
        match self {
            Executor::Local => argv.to_vec(),
            Executor::Remote { dest, ssh_args } => {
                let mut full = vec!["ssh".to_string()];
                full.extend(ssh_args.iter().cloned());
                full.extend(["-o".to_string(), "BatchMode=yes".to_string()]);
                full.push(dest.clone());
                full.push(shell_join(argv));
                full
            }
        }
    }

    fn command(&self, argv: &[String]) -> Result<Command> {
        let full = self.wrap(argv);
        let (prog, args) = full
            .split_first()
            .ok_or_else(|| OrchError::Executor("empty command line".to_string()))?;
        let mut cmd = Command::new(prog);
        cmd.args(args).kill_on_drop(true);
        Ok(cmd)
    }

    /// 启动子进程（独立进程组），立即返回
    #[tracing::instrument(skip(self, argv, stdin), fields(exe = argv.first().map(String::as_str).unwrap_or("")))]
    pub async fn start(
        &self,
        name: &str,
        argv: &[String],
        stdin: Option<Vec<u8>>,
        verbose: bool,
    ) -> Result<ProcessHandle> {
        let mut cmd = self.command(argv)?;
        cmd.stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0);

        let mut child = cmd
            .spawn()
            .map_err(|e| OrchError::Executor(format!("failed to spawn `{name}`: {e}")))?;
        let pid = child.id();
        debug!(sim = %name, pid = ?pid, "子进程已启动");

        if let (Some(bytes), Some(mut sin)) = (stdin, child.stdin.take()) {
            let who = name.to_string();
            tokio::spawn(async move {
                if let Err(e) = sin.write_all(&bytes).await {
                    warn!(sim = %who, error = %e, "写入 stdin 失败");
                }
            });
        }

        let (live, _) = broadcast::channel(1024);
        let stdout: LineSink = Arc::new(Mutex::new(Vec::new()));
        let stderr: LineSink = Arc::new(Mutex::new(Vec::new()));
        let mut readers = Vec::new();
        if let Some(out) = child.stdout.take() {
            readers.push(spawn_reader(name.to_string(), out, false, stdout.clone(), live.clone(), verbose));
        }
        if let Some(err) = child.stderr.take() {
            readers.push(spawn_reader(name.to_string(), err, true, stderr.clone(), live.clone(), verbose));
        }

        let (tx, exit_rx) = watch::channel(None);
        let who = name.to_string();
        let waiter = tokio::spawn(async move {
            let info = match child.wait().await {
                Ok(st) => ExitInfo::from(st),
                Err(e) => {
                    warn!(sim = %who, error = %e, "等待子进程失败");
                    ExitInfo::default()
                }
            };
            debug!(sim = %who, status = %info, "子进程已退出");
            let _ = tx.send(Some(info));
        });

        Ok(ProcessHandle {
            name: name.to_string(),
            pid,
            exit_rx,
            stdout,
            stderr,
            live,
            readers,
            waiter,
        })
    }

    /// 运行到结束并收集输出
    pub async fn output(&self, argv: &[String], stdin: Option<&[u8]>) -> Result<Output> {
        let mut cmd = self.command(argv)?;
        cmd.stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
        let mut child = cmd
            .spawn()
            .map_err(|e| OrchError::Executor(format!("failed to spawn {}: {e}", shell_join(argv))))?;
        if let (Some(bytes), Some(mut sin)) = (stdin, child.stdin.take()) {
            sin.write_all(bytes)
                .await
                .map_err(|e| OrchError::Executor(format!("writing stdin of {}: {e}", shell_join(argv))))?;
        }
        child
            .wait_with_output()
            .await
            .map_err(|e| OrchError::Executor(format!("waiting for {}: {e}", shell_join(argv))))
    }

    /// 运行到结束；非零退出视为执行器错误
    pub async fn run_to_completion(&self, argv: &[String]) -> Result<()> {
        let out = self.output(argv, None).await?;
        if out.status.success() {
            return Ok(());
        }
        Err(OrchError::Executor(format!(
            "{} failed ({}): {}",
            shell_join(argv),
            ExitInfo::from(out.status),
            String::from_utf8_lossy(&out.stderr).trim()
        )))
    }

    fn path_argv(op: &[&str], path: &Path) -> Vec<String> {
        op.iter()
            .map(|s| s.to_string())
            .chain(std::iter::once(path.display().to_string()))
            .collect()
    }

    pub async fn mkdir(&self, path: &Path) -> Result<()> {
        match self {
            Executor::Local => tokio::fs::create_dir_all(path)
                .await
                .map_err(|e| OrchError::io(path, e)),
            Executor::Remote { .. } => {
                self.run_to_completion(&Self::path_argv(&["mkdir", "-p"], path))
                    .await
            }
        }
    }

    pub async fn rmtree(&self, path: &Path) -> Result<()> {
        match self {
            Executor::Local => match tokio::fs::remove_dir_all(path).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(OrchError::io(path, e)),
            },
            Executor::Remote { .. } => {
                self.run_to_completion(&Self::path_argv(&["rm", "-rf"], path))
                    .await
            }
        }
    }

    pub async fn remove_file(&self, path: &Path) -> Result<()> {
        match self {
            Executor::Local => match tokio::fs::remove_file(path).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(OrchError::io(path, e)),
            },
            Executor::Remote { .. } => {
                self.run_to_completion(&Self::path_argv(&["rm", "-f"], path))
                    .await
            }
        }
    }

    pub async fn write_file(&self, path: &Path, contents: &[u8]) -> Result<()> {
        match self {
            Executor::Local => tokio::fs::write(path, contents)
                .await
                .map_err(|e| OrchError::io(path, e)),
            Executor::Remote { .. } => {
                let argv = vec![
                    "sh".to_string(),
                    "-c".to_string(),
                    format!("cat > {}", shell_join(&[path.display().to_string()])),
                ];
                let out = self.output(&argv, Some(contents)).await?;
                if out.status.success() {
                    Ok(())
                } else {
                    Err(OrchError::Executor(format!(
                        "writing {} failed: {}",
                        path.display(),
                        String::from_utf8_lossy(&out.stderr).trim()
                    )))
                }
            }
        }
    }

    pub async fn exists(&self, path: &Path) -> Result<bool> {
        match self {
            Executor::Local => Ok(tokio::fs::try_exists(path).await.unwrap_or(false)),
            Executor::Remote { .. } => {
                let out = self
                    .output(&Self::path_argv(&["test", "-e"], path), None)
                    .await?;
                Ok(out.status.success())
            }
        }
    }

    /// 轮询等待文件出现；每次唤醒都检查取消
    pub async fn await_file(
        &self,
        path: &Path,
        timeout: Duration,
        poll: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.exists(path).await? {
                trace!(path = %path.display(), "文件已出现");
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(OrchError::SocketTimeout {
                    path: PathBuf::from(path),
                    timeout,
                });
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(OrchError::Cancelled),
                _ = tokio::time::sleep(poll) => {}
            }
        }
    }
}
