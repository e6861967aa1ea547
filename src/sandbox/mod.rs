//! Sandboxed process execution.
//!
//! Runs one process group under userland resource limits: CPU time, wall
//! time, resident memory, output size and idleness are polled on a short
//! interval while the child runs, and the group is killed on the first
//! breach. This is a trust-the-author sandbox; it enforces limits and
//! captures streams but does not attempt OS-level isolation.

pub mod monitor;
pub mod workdir;

use std::collections::BTreeMap;
use std::os::fd::OwnedFd;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use anyhow::anyhow;
use nix::sys::signal::Signal as NixSignal;
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use tokio::process::{Child, Command};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, IoContext, Result};
use crate::types::{Limits, StackLimit};

use monitor::{GroupMonitor, MonitorLimits};
pub use workdir::Workdir;

/// Monitoring poll interval.
pub const MONITOR_INTERVAL: Duration = Duration::from_millis(25);

/// Grace between SIGTERM and SIGKILL, and before straggler cleanup.
pub const KILL_GRACE: Duration = Duration::from_millis(500);

/// Extra wall time granted to the supervision layer above the sandbox's
/// own wall limit before it declares the monitor lost.
pub const SUPERVISION_SLACK_MS: u64 = 5000;

/// Tolerated CPU-over-wall skew before the monitoring layer declares
/// itself broken.
pub const CPU_WALL_EPSILON_MS: u64 = 50;

/// Stderr hard cap.
pub const STDERR_CAP_BYTES: u64 = 4 * 1024 * 1024;

/// Stderr size above which an `excessive-stderr` warning is attached.
pub const STDERR_WARN_BYTES: u64 = 1024 * 1024;

const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

const SANITIZER_BANNERS: &[&str] = &[
    "SUMMARY: AddressSanitizer",
    "SUMMARY: ThreadSanitizer",
    "SUMMARY: UndefinedBehaviorSanitizer",
    "LeakSanitizer",
    "runtime error:",
];

/// Where the child's stdin comes from.
#[derive(Debug, Default)]
pub enum StdinSource {
    #[default]
    Null,
    File(PathBuf),
    /// Inherit a pipe end (communication mode)
    Fd(OwnedFd),
}

/// Where a child output stream goes.
#[derive(Debug, Default)]
pub enum StreamSink {
    #[default]
    Null,
    /// Capture to a file, size-monitored
    File(PathBuf),
    /// Hand the stream to a pipe end (communication mode)
    Fd(OwnedFd),
}

impl StreamSink {
    pub fn capture_path(&self) -> Option<PathBuf> {
        match self {
            StreamSink::File(path) => Some(path.clone()),
            _ => None,
        }
    }
}

/// A file installed into the workdir before the run.
#[derive(Debug)]
pub struct ExtraFile {
    /// Logical name inside the workdir, possibly nested
    pub logical: String,
    pub source: PathBuf,
    /// Copy instead of symlinking (for sources that will not outlive the
    /// run)
    pub copy: bool,
    pub executable: bool,
}

impl ExtraFile {
    pub fn link(logical: impl Into<String>, source: impl Into<PathBuf>) -> Self {
        Self {
            logical: logical.into(),
            source: source.into(),
            copy: false,
            executable: false,
        }
    }

    pub fn copy(logical: impl Into<String>, source: impl Into<PathBuf>) -> Self {
        Self {
            logical: logical.into(),
            source: source.into(),
            copy: true,
            executable: false,
        }
    }

    /// Chmod the installed file to 0755 after install. Pair with
    /// [`ExtraFile::copy`]: chmod follows symlinks, and a linked source
    /// (a store entry in particular) must never be written through.
    pub fn executable(mut self) -> Self {
        self.executable = true;
        self
    }
}

/// Everything the sandbox needs to run one process group.
#[derive(Debug)]
pub struct SandboxParams {
    /// CPU time limit; `None` disables the CPU check (compilation)
    pub time_limit_ms: Option<u64>,
    pub wall_time_limit_ms: u64,
    /// Resident-set cap; also applied as an address-space rlimit
    pub memory_limit_bytes: Option<u64>,
    /// Stdout budget per the problem statement
    pub output_limit_bytes: u64,
    pub stderr_limit_bytes: u64,
    /// Streams are hard-truncated at `output_limit × slack`
    pub output_slack: f64,
    pub stack_limit: StackLimit,
    /// Expected process-group width, informational
    pub max_processes: u32,
    pub extra_files: Vec<ExtraFile>,
    pub stdin: StdinSource,
    pub stdout: StreamSink,
    pub stderr: StreamSink,
    /// Keep the parent environment instead of wiping it
    pub preserve_env: bool,
    /// Report a wall breach as `Timeout` (compilation treats wall as the
    /// only clock)
    pub wall_breach_is_time_limit: bool,
    /// Informational; the core does not enforce it
    pub allow_network: bool,
    pub idleness_wall_floor_ms: u64,
    pub idleness_window_ms: u64,
}

impl Default for SandboxParams {
    fn default() -> Self {
        Self {
            time_limit_ms: None,
            wall_time_limit_ms: 10_000,
            memory_limit_bytes: None,
            output_limit_bytes: 64 * 1024 * 1024,
            stderr_limit_bytes: STDERR_CAP_BYTES,
            output_slack: 1.1,
            stack_limit: StackLimit::Hard,
            max_processes: 1,
            extra_files: Vec::new(),
            stdin: StdinSource::Null,
            stdout: StreamSink::Null,
            stderr: StreamSink::Null,
            preserve_env: false,
            wall_breach_is_time_limit: false,
            allow_network: false,
            idleness_wall_floor_ms: 5000,
            idleness_window_ms: 2000,
        }
    }
}

impl SandboxParams {
    /// Derive sandbox parameters from declared problem limits.
    /// Wall limit is 3× the time limit, floored at 10 seconds.
    pub fn from_limits(limits: &Limits) -> Self {
        Self {
            time_limit_ms: Some(limits.time_ms),
            wall_time_limit_ms: (3 * limits.time_ms).max(10_000),
            memory_limit_bytes: Some(limits.memory_bytes()),
            output_limit_bytes: limits.output_bytes(),
            stack_limit: limits.stack,
            ..Self::default()
        }
    }

    /// Parameters for compilation: no CPU clock, 60 s wall, 1 GiB memory,
    /// generous log budget.
    pub fn for_compilation() -> Self {
        Self {
            time_limit_ms: None,
            wall_time_limit_ms: 60_000,
            memory_limit_bytes: Some(1024 * 1024 * 1024),
            output_limit_bytes: 8 * 1024 * 1024,
            wall_breach_is_time_limit: true,
            max_processes: 16,
            ..Self::default()
        }
    }

    /// Double time and wall limits (slow-solution reruns).
    pub fn with_doubled_time(mut self) -> Self {
        if let Some(t) = self.time_limit_ms.as_mut() {
            *t *= 2;
        }
        self.wall_time_limit_ms *= 2;
        self
    }
}

/// Exit classification of a sandboxed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitStatusKind {
    /// Clean zero exit
    Ok,
    /// Killed by a signal, or plain non-zero exit
    Signal,
    /// CPU time limit breached
    Timeout,
    /// Wall clock limit breached
    WallTimeout,
    /// Resident-set limit breached
    MemoryLimit,
    /// Stream size limit breached
    OutputLimit,
    /// No CPU progress while the wall clock ran
    IdlenessLimit,
    /// Cancelled from above
    Terminated,
    /// The monitoring layer itself failed
    InternalError,
}

/// Complete record of one sandboxed run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunLog {
    pub exit_code: i32,
    pub status: ExitStatusKind,
    pub cpu_time_ms: u64,
    pub wall_time_ms: u64,
    pub peak_memory_bytes: u64,
    pub stdout_bytes: u64,
    pub stderr_bytes: u64,
    pub warnings: Vec<String>,
    pub metadata: BTreeMap<String, String>,
    /// Set when wall or CPU time reached the limit even though the exit
    /// was clean; upstream may promote the verdict to TLE
    pub time_limit_flagged: bool,
}

impl RunLog {
    /// A log for a run that never happened or that the machinery lost.
    pub fn internal_error(message: impl Into<String>) -> Self {
        let mut metadata = BTreeMap::new();
        metadata.insert("error".to_string(), message.into());
        Self {
            exit_code: -1,
            status: ExitStatusKind::InternalError,
            cpu_time_ms: 0,
            wall_time_ms: 0,
            peak_memory_bytes: 0,
            stdout_bytes: 0,
            stderr_bytes: 0,
            warnings: Vec::new(),
            metadata,
            time_limit_flagged: false,
        }
    }

    pub fn is_clean(&self) -> bool {
        self.status == ExitStatusKind::Ok
    }

    /// Persist `runlog.json` next to the captured streams.
    pub async fn persist(&self, dir: &std::path::Path) -> Result<()> {
        let path = dir.join("runlog.json");
        tokio::fs::write(&path, serde_json::to_vec_pretty(self)?)
            .await
            .path_ctx(&path)
    }
}

/// Sandbox runner bound to a cancellation source.
#[derive(Debug, Clone)]
pub struct Sandbox {
    cancel: CancellationToken,
}

impl Sandbox {
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel }
    }

    /// Run in a fresh throwaway workdir.
    pub async fn run(&self, argv: &[String], params: SandboxParams) -> Result<RunLog> {
        let workdir = Workdir::create()?;
        self.run_in(&workdir, argv, params).await
    }

    /// Run inside a caller-provided workdir (the caller wants files out of
    /// it afterwards, e.g. a freshly-built executable).
    pub async fn run_in(
        &self,
        workdir: &Workdir,
        argv: &[String],
        mut params: SandboxParams,
    ) -> Result<RunLog> {
        if argv.is_empty() {
            return Err(Error::InvalidInput("empty sandbox command".into()));
        }

        for extra in params.extra_files.drain(..) {
            if extra.copy {
                workdir.install_copy(&extra.logical, &extra.source).await?;
            } else {
                workdir.install_link(&extra.logical, &extra.source).await?;
            }
            if extra.executable {
                workdir.mark_executable(&extra.logical).await?;
            }
        }

        let stdout_capture = params.stdout.capture_path();
        let stderr_capture = params.stderr.capture_path();

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .current_dir(workdir.path())
            .kill_on_drop(true)
            .process_group(0);

        if !params.preserve_env {
            cmd.env_clear()
                .env("PATH", DEFAULT_PATH)
                .env("HOME", workdir.path());
        }

        cmd.stdin(match std::mem::take(&mut params.stdin) {
            StdinSource::Null => Stdio::null(),
            StdinSource::File(path) => {
                Stdio::from(std::fs::File::open(&path).path_ctx(&path)?)
            }
            StdinSource::Fd(fd) => Stdio::from(fd),
        });
        cmd.stdout(match std::mem::take(&mut params.stdout) {
            StreamSink::Null => Stdio::null(),
            StreamSink::File(path) => {
                Stdio::from(std::fs::File::create(&path).path_ctx(&path)?)
            }
            StreamSink::Fd(fd) => Stdio::from(fd),
        });
        cmd.stderr(match std::mem::take(&mut params.stderr) {
            StreamSink::Null => Stdio::null(),
            StreamSink::File(path) => {
                Stdio::from(std::fs::File::create(&path).path_ctx(&path)?)
            }
            StreamSink::Fd(fd) => Stdio::from(fd),
        });

        let memory_limit = params.memory_limit_bytes;
        let stack_limit = params.stack_limit;
        unsafe {
            cmd.pre_exec(move || apply_rlimits(memory_limit, stack_limit));
        }

        let started = Instant::now();
        let mut child = cmd
            .spawn()
            .map_err(|e| Error::Sandbox(anyhow!("failed to spawn {}: {e}", argv[0])))?;
        // The command object still owns the parent copies of any inherited
        // pipe ends; drop it now so EOF propagates when the child dies.
        drop(cmd);
        let pid = child
            .id()
            .ok_or_else(|| Error::Sandbox(anyhow!("spawned child has no pid")))?
            as i32;

        tracing::debug!(pid, command = %argv.join(" "), "Sandbox spawned");

        let mut group_monitor = GroupMonitor::new(
            pid,
            MonitorLimits {
                time_limit_ms: params.time_limit_ms,
                wall_limit_ms: params.wall_time_limit_ms,
                memory_limit_bytes: params.memory_limit_bytes,
                stdout_cap_bytes: (params.output_limit_bytes as f64 * params.output_slack)
                    as u64,
                stderr_cap_bytes: params.stderr_limit_bytes,
                wall_breach_is_time_limit: params.wall_breach_is_time_limit,
                idleness_wall_floor_ms: params.idleness_wall_floor_ms,
                idleness_window_ms: params.idleness_window_ms,
            },
            stdout_capture.clone(),
            stderr_capture.clone(),
        );

        // Outer supervision: if the monitor loop itself stalls, force-kill
        // and report an internal error.
        let supervision =
            Duration::from_millis(params.wall_time_limit_ms + SUPERVISION_SLACK_MS);
        let supervised = tokio::time::timeout(
            supervision,
            self.supervise(&mut child, pid, &mut group_monitor),
        )
        .await;

        let (exit_status, breach, cancelled) = match supervised {
            Ok(result) => result?,
            Err(_) => {
                kill_group(pid, NixSignal::SIGKILL);
                let _ = child.wait().await;
                tracing::error!(pid, "Sandbox supervision timeout, monitor stalled");
                return Ok(RunLog::internal_error("sandbox supervision timeout"));
            }
        };

        // Stragglers: polite nudge now, hard kill after the grace period.
        kill_group(pid, NixSignal::SIGTERM);
        tokio::spawn(async move {
            tokio::time::sleep(KILL_GRACE).await;
            kill_group(pid, NixSignal::SIGKILL);
        });

        let usage = group_monitor.usage();
        let wall_time_ms = started.elapsed().as_millis() as u64;
        let (mut stdout_bytes, stderr_bytes) = group_monitor.stream_sizes();

        let signal = exit_status.signal();
        let (mut status, exit_code) = classify_exit(&exit_status, breach, cancelled, signal);

        let mut warnings = Vec::new();

        // Monotonic clock sanity: CPU beyond wall means sampling lost track
        if usage.cpu_ms > wall_time_ms + CPU_WALL_EPSILON_MS {
            warnings.push("cpu-accounting-exceeds-wall-clock".to_string());
            status = ExitStatusKind::InternalError;
        }

        // Fast writers can overshoot between samples; catch it after the
        // fact and hard-truncate the capture at the slack boundary.
        if let Some(path) = &stdout_capture {
            let cap = (params.output_limit_bytes as f64 * params.output_slack) as u64;
            if stdout_bytes > cap {
                if let Ok(file) = std::fs::OpenOptions::new().write(true).open(path) {
                    let _ = file.set_len(cap);
                }
                stdout_bytes = cap;
            }
            if stdout_bytes > params.output_limit_bytes && status == ExitStatusKind::Ok {
                status = ExitStatusKind::OutputLimit;
            }
        }

        if let Some(path) = &stderr_capture {
            scan_stderr(path, stderr_bytes, &mut warnings).await;
        }

        let time_limit_flagged = params
            .time_limit_ms
            .map(|limit| usage.cpu_ms >= limit || wall_time_ms >= limit)
            .unwrap_or(false);

        let mut metadata = BTreeMap::new();
        metadata.insert("command".to_string(), argv.join(" "));
        if params.allow_network {
            metadata.insert("allow_network".to_string(), "true".to_string());
        }

        let log = RunLog {
            exit_code,
            status,
            cpu_time_ms: usage.cpu_ms,
            wall_time_ms,
            peak_memory_bytes: usage.peak_rss_bytes,
            stdout_bytes,
            stderr_bytes,
            warnings,
            metadata,
            time_limit_flagged,
        };
        tracing::debug!(
            pid,
            status = ?log.status,
            cpu_ms = log.cpu_time_ms,
            wall_ms = log.wall_time_ms,
            "Sandbox finished"
        );
        Ok(log)
    }

    /// Wait for the child while polling the monitor, killing the group on
    /// the first limit breach or cancellation.
    async fn supervise(
        &self,
        child: &mut Child,
        pgid: i32,
        group_monitor: &mut GroupMonitor,
    ) -> Result<(ExitStatus, Option<ExitStatusKind>, bool)> {
        let mut interval = tokio::time::interval(MONITOR_INTERVAL);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut breach: Option<ExitStatusKind> = None;
        let mut cancelled = false;
        let mut term_deadline: Option<Instant> = None;

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled(), if !cancelled => {
                    cancelled = true;
                    kill_group(pgid, NixSignal::SIGTERM);
                    term_deadline = Some(Instant::now() + KILL_GRACE);
                }
                status = child.wait() => {
                    let status = status
                        .map_err(|e| Error::Sandbox(anyhow!("wait failed: {e}")))?;
                    return Ok((status, breach, cancelled));
                }
                _ = interval.tick() => {
                    if let Some(deadline) = term_deadline {
                        if Instant::now() >= deadline {
                            kill_group(pgid, NixSignal::SIGKILL);
                            term_deadline = None;
                        }
                    }
                    if breach.is_none() && !cancelled {
                        if let Some(kind) = group_monitor.sample() {
                            breach = Some(kind);
                            kill_group(pgid, NixSignal::SIGKILL);
                        }
                    }
                }
            }
        }
    }
}

/// Map the raw wait status to (classification, Bash-style exit code).
fn classify_exit(
    exit_status: &ExitStatus,
    breach: Option<ExitStatusKind>,
    cancelled: bool,
    signal: Option<i32>,
) -> (ExitStatusKind, i32) {
    let exit_code = match (exit_status.code(), signal) {
        (Some(code), _) => code,
        (None, Some(sig)) => 128 + sig,
        (None, None) => -1,
    };
    if let Some(kind) = breach {
        return (kind, exit_code);
    }
    if cancelled {
        return (ExitStatusKind::Terminated, exit_code);
    }
    if exit_status.success() {
        return (ExitStatusKind::Ok, 0);
    }
    (ExitStatusKind::Signal, exit_code)
}

/// Apply per-process resource limits between fork and exec. Only
/// async-signal-safe calls allowed here.
fn apply_rlimits(
    memory_limit: Option<u64>,
    stack_limit: StackLimit,
) -> std::io::Result<()> {
    use nix::sys::resource::{Resource, getrlimit, setrlimit};

    let errno = |e: nix::errno::Errno| std::io::Error::from_raw_os_error(e as i32);

    if let Some(bytes) = memory_limit {
        setrlimit(Resource::RLIMIT_AS, bytes, bytes).map_err(errno)?;
    }
    match stack_limit {
        StackLimit::Hard => {
            let (_, hard) = getrlimit(Resource::RLIMIT_STACK).map_err(errno)?;
            setrlimit(Resource::RLIMIT_STACK, hard, hard).map_err(errno)?;
        }
        StackLimit::Bytes(bytes) => {
            setrlimit(Resource::RLIMIT_STACK, bytes, bytes).map_err(errno)?;
        }
    }
    Ok(())
}

/// Signal the whole process group, ignoring already-gone groups.
fn kill_group(pgid: i32, signal: NixSignal) {
    let _ = nix::sys::signal::killpg(Pid::from_raw(pgid), signal);
}

/// Post-process a captured stderr file: sanitizer banners and excessive
/// volume become warnings.
async fn scan_stderr(path: &std::path::Path, stderr_bytes: u64, warnings: &mut Vec<String>) {
    if stderr_bytes > STDERR_WARN_BYTES {
        warnings.push("excessive-stderr".to_string());
    }
    let Ok(bytes) = tokio::fs::read(path).await else {
        return;
    };
    let head = &bytes[..bytes.len().min(256 * 1024)];
    let text = String::from_utf8_lossy(head);
    if SANITIZER_BANNERS.iter().any(|banner| text.contains(banner)) {
        warnings.push("sanitizer-warning".to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["/bin/sh".into(), "-c".into(), script.into()]
    }

    fn sandbox() -> Sandbox {
        Sandbox::new(CancellationToken::new())
    }

    #[tokio::test]
    async fn clean_exit_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("stdout");
        let params = SandboxParams {
            stdout: StreamSink::File(out.clone()),
            ..SandboxParams::default()
        };
        let log = sandbox().run(&sh("echo hello"), params).await.unwrap();
        assert_eq!(log.status, ExitStatusKind::Ok);
        assert_eq!(log.exit_code, 0);
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "hello\n");
        assert_eq!(log.stdout_bytes, 6);
    }

    #[tokio::test]
    async fn nonzero_exit_keeps_raw_code() {
        let log = sandbox()
            .run(&sh("exit 3"), SandboxParams::default())
            .await
            .unwrap();
        assert_eq!(log.status, ExitStatusKind::Signal);
        assert_eq!(log.exit_code, 3);
    }

    #[tokio::test]
    async fn signal_death_reports_bash_style_code() {
        let log = sandbox()
            .run(&sh("kill -9 $$"), SandboxParams::default())
            .await
            .unwrap();
        assert_eq!(log.status, ExitStatusKind::Signal);
        assert_eq!(log.exit_code, 137);
    }

    #[tokio::test]
    async fn busy_loop_hits_cpu_limit() {
        let params = SandboxParams {
            time_limit_ms: Some(200),
            wall_time_limit_ms: 10_000,
            ..SandboxParams::default()
        };
        let log = sandbox()
            .run(&sh("while :; do :; done"), params)
            .await
            .unwrap();
        assert_eq!(log.status, ExitStatusKind::Timeout);
        assert!(log.cpu_time_ms >= 200);
        assert!(log.wall_time_ms < 5000);
    }

    #[tokio::test]
    async fn sleeper_hits_wall_limit() {
        let params = SandboxParams {
            wall_time_limit_ms: 300,
            // Keep the idleness rule out of this test's way
            idleness_wall_floor_ms: 60_000,
            ..SandboxParams::default()
        };
        let log = sandbox().run(&sh("sleep 5"), params).await.unwrap();
        assert_eq!(log.status, ExitStatusKind::WallTimeout);
        assert!(log.wall_time_ms >= 300);
        assert!(log.wall_time_ms < 3000);
    }

    #[tokio::test]
    async fn idle_sleeper_hits_idleness_limit() {
        let params = SandboxParams {
            wall_time_limit_ms: 20_000,
            idleness_wall_floor_ms: 200,
            idleness_window_ms: 300,
            ..SandboxParams::default()
        };
        let log = sandbox().run(&sh("sleep 10"), params).await.unwrap();
        assert_eq!(log.status, ExitStatusKind::IdlenessLimit);
        assert!(log.wall_time_ms < 5000);
    }

    #[tokio::test]
    async fn flood_hits_output_limit() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("stdout");
        let params = SandboxParams {
            output_limit_bytes: 10 * 1024,
            stdout: StreamSink::File(out.clone()),
            ..SandboxParams::default()
        };
        let log = sandbox()
            .run(&sh("head -c 1000000 /dev/zero; sleep 2"), params)
            .await
            .unwrap();
        assert_eq!(log.status, ExitStatusKind::OutputLimit);
        // Hard truncation at the slack boundary
        let cap = (10.0 * 1024.0 * 1.1) as u64;
        assert!(std::fs::metadata(&out).unwrap().len() <= cap);
    }

    #[tokio::test]
    async fn generous_memory_limit_does_not_interfere() {
        let params = SandboxParams {
            memory_limit_bytes: Some(512 * 1024 * 1024),
            ..SandboxParams::default()
        };
        let log = sandbox().run(&sh("true"), params).await.unwrap();
        assert_eq!(log.status, ExitStatusKind::Ok);
        assert!(log.peak_memory_bytes < 512 * 1024 * 1024);
    }

    #[tokio::test]
    async fn stdin_redirection_feeds_the_child() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input");
        let out = dir.path().join("stdout");
        std::fs::write(&input, "ping\n").unwrap();

        let params = SandboxParams {
            stdin: StdinSource::File(input),
            stdout: StreamSink::File(out.clone()),
            ..SandboxParams::default()
        };
        let log = sandbox().run(&sh("cat"), params).await.unwrap();
        assert_eq!(log.status, ExitStatusKind::Ok);
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "ping\n");
    }

    #[tokio::test]
    async fn environment_is_wiped_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("stdout");
        // Set a marker in our own environment; the child must not see it
        unsafe { std::env::set_var("RBX_TEST_MARKER", "leaked") };
        let params = SandboxParams {
            stdout: StreamSink::File(out.clone()),
            ..SandboxParams::default()
        };
        let log = sandbox()
            .run(&sh("printf '%s' \"$RBX_TEST_MARKER\""), params)
            .await
            .unwrap();
        assert_eq!(log.status, ExitStatusKind::Ok);
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "");
    }

    #[tokio::test]
    async fn cancellation_terminates_the_group() {
        let cancel = CancellationToken::new();
        let sandbox = Sandbox::new(cancel.clone());
        let params = SandboxParams {
            wall_time_limit_ms: 30_000,
            idleness_wall_floor_ms: 60_000,
            ..SandboxParams::default()
        };

        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(150)).await;
                cancel.cancel();
            })
        };

        let log = sandbox.run(&sh("sleep 20"), params).await.unwrap();
        canceller.await.unwrap();
        assert_eq!(log.status, ExitStatusKind::Terminated);
        assert!(log.wall_time_ms < 5000);
    }

    #[tokio::test]
    async fn soft_tle_flag_set_on_clean_but_slow_exit() {
        let params = SandboxParams {
            time_limit_ms: Some(10),
            wall_time_limit_ms: 10_000,
            idleness_wall_floor_ms: 60_000,
            ..SandboxParams::default()
        };
        let log = sandbox().run(&sh("sleep 0.2"), params).await.unwrap();
        assert_eq!(log.status, ExitStatusKind::Ok);
        assert!(log.time_limit_flagged);
    }

    #[tokio::test]
    async fn sanitizer_banner_becomes_warning() {
        let dir = tempfile::tempdir().unwrap();
        let err = dir.path().join("stderr");
        let params = SandboxParams {
            stderr: StreamSink::File(err),
            ..SandboxParams::default()
        };
        let log = sandbox()
            .run(
                &sh("echo 'SUMMARY: AddressSanitizer: heap-buffer-overflow' >&2"),
                params,
            )
            .await
            .unwrap();
        assert!(log.warnings.iter().any(|w| w == "sanitizer-warning"));
    }

    #[tokio::test]
    async fn extra_files_are_installed_and_linked() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("data.txt");
        let out = dir.path().join("stdout");
        std::fs::write(&src, "payload").unwrap();

        let params = SandboxParams {
            extra_files: vec![ExtraFile::link("data.txt", &src)],
            stdout: StreamSink::File(out.clone()),
            ..SandboxParams::default()
        };
        let log = sandbox().run(&sh("cat data.txt"), params).await.unwrap();
        assert_eq!(log.status, ExitStatusKind::Ok);
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "payload");
    }

    #[tokio::test]
    async fn runlog_persists_as_json() {
        let dir = tempfile::tempdir().unwrap();
        let log = sandbox()
            .run(&sh("true"), SandboxParams::default())
            .await
            .unwrap();
        log.persist(dir.path()).await.unwrap();
        let text = std::fs::read_to_string(dir.path().join("runlog.json")).unwrap();
        let back: RunLog = serde_json::from_str(&text).unwrap();
        assert_eq!(back.status, ExitStatusKind::Ok);
    }
}
