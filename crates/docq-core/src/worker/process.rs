//! Out-of-process worker launcher.
//!
//! Spawns the configured executable with `<artifact path> <query>`, drains
//! stdout and stderr on two independently spawned tasks while waiting for
//! exit, and enforces a wall-clock timeout. On unix the worker leads its
//! own process group; on timeout the whole group gets SIGTERM, a short
//! grace period, then SIGKILL.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{SpawnError, WAIT_FAILED_EXIT_CODE, WorkerInvocation, WorkerLauncher, WorkerState};

/// Default wall-clock budget for one worker run.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);
/// Default wait between SIGTERM and SIGKILL.
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(2);
/// Default stdout retention cap (8 MiB).
pub const DEFAULT_MAX_STDOUT_BYTES: usize = 8 * 1024 * 1024;
/// Default stderr retention cap (64 KiB).
pub const DEFAULT_MAX_STDERR_BYTES: usize = 64 * 1024;

const READ_CHUNK: usize = 8 * 1024;

/// Knobs for a single worker run.
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    /// Maximum time the worker may run before it is terminated.
    pub timeout: Duration,
    /// Time allowed between SIGTERM and SIGKILL, and for output streams to
    /// reach EOF once the process has exited.
    pub kill_grace: Duration,
    /// Bytes of stdout kept in memory; the rest is read and discarded.
    pub max_stdout_bytes: usize,
    /// Bytes of stderr kept in memory; the rest is read and discarded.
    pub max_stderr_bytes: usize,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            kill_grace: DEFAULT_KILL_GRACE,
            max_stdout_bytes: DEFAULT_MAX_STDOUT_BYTES,
            max_stderr_bytes: DEFAULT_MAX_STDERR_BYTES,
        }
    }
}

/// Launches a fixed executable for every request.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    executable: PathBuf,
    options: LaunchOptions,
}

impl ProcessLauncher {
    pub fn new(executable: impl Into<PathBuf>, options: LaunchOptions) -> Self {
        Self {
            executable: executable.into(),
            options,
        }
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    pub fn options(&self) -> &LaunchOptions {
        &self.options
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    fn name(&self) -> &str {
        "process"
    }

    async fn invoke(&self, artifact_path: &Path, query: &str) -> WorkerInvocation {
        let args = vec![OsString::from(artifact_path), OsString::from(query)];
        invoke(&self.executable, args, &self.options).await
    }
}

/// Bytes read from one output stream.
#[derive(Debug, Default)]
struct Captured {
    bytes: Vec<u8>,
    truncated: bool,
    /// The stream never reached EOF; `bytes` is what arrived before.
    abandoned: bool,
}

/// Capture buffer shared between a drain task and the launcher, so output
/// read before a drain is abandoned is not lost with it.
type SharedCapture = Arc<Mutex<Captured>>;

fn lock(capture: &SharedCapture) -> MutexGuard<'_, Captured> {
    capture.lock().unwrap_or_else(|e| e.into_inner())
}

/// A running drain task and the buffer it fills.
struct Drain {
    task: JoinHandle<()>,
    capture: SharedCapture,
}

impl Drain {
    fn spawn<R>(reader: R, cap: usize, stream: &'static str) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let capture = SharedCapture::default();
        let task = tokio::spawn(drain(reader, Arc::clone(&capture), cap, stream));
        Self { task, capture }
    }
}

/// Read `reader` to EOF into `capture`, keeping at most `cap` bytes.
///
/// Reading continues past the cap so the writer never blocks on a full
/// pipe. Read errors end the drain with whatever was collected.
async fn drain<R>(mut reader: R, capture: SharedCapture, cap: usize, stream: &'static str)
where
    R: AsyncRead + Unpin,
{
    let mut chunk = vec![0u8; READ_CHUNK];

    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                let mut captured = lock(&capture);
                let room = cap.saturating_sub(captured.bytes.len());
                let keep = n.min(room);
                captured.bytes.extend_from_slice(&chunk[..keep]);
                if keep < n {
                    captured.truncated = true;
                }
            }
            Err(e) => {
                warn!(stream, error = %e, "error reading worker output");
                break;
            }
        }
    }
}

/// Wait for a drain task, giving up after `grace`.
///
/// A stream can stay open after the worker exits if it left a child
/// process holding the pipe. The drain is then stopped and whatever it
/// read so far is returned, flagged as abandoned.
async fn collect(drain: Option<Drain>, grace: Duration, stream: &str) -> Captured {
    let Some(Drain { mut task, capture }) = drain else {
        return Captured::default();
    };

    match tokio::time::timeout(grace, &mut task).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            warn!(stream, error = %e, "worker output drain task failed");
        }
        Err(_) => {
            task.abort();
            warn!(stream, "worker output still open after exit, keeping what was read");
            lock(&capture).abandoned = true;
        }
    }

    std::mem::take(&mut *lock(&capture))
}

/// Map an exit status to a single integer code.
///
/// Processes killed by a signal report `128 + signal`, as shells do.
fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    WAIT_FAILED_EXIT_CODE
}

/// Send `signal` to every process in the worker's process group.
///
/// The worker is spawned as a group leader, so its pid is the group id.
/// Returns false if no process in the group received the signal.
#[cfg(unix)]
fn signal_group(pgid: u32, signal: libc::c_int) -> bool {
    // SAFETY: a negative pid addresses the process group created at spawn.
    // The group id cannot be reused while any member is still alive.
    unsafe { libc::kill(-(pgid as libc::pid_t), signal) == 0 }
}

/// Kill whatever is left in the worker's process group.
fn kill_group(pgid: Option<u32>) {
    #[cfg(unix)]
    {
        if let Some(pgid) = pgid {
            if signal_group(pgid, libc::SIGKILL) {
                debug!(pgid, "killed leftover processes in worker group");
            }
        }
    }
    #[cfg(not(unix))]
    let _ = pgid;
}

/// Terminate a running worker and everything it started: SIGTERM to the
/// process group, wait up to `grace`, then SIGKILL the group.
///
/// Returns once the direct child has been reaped (or reaping failed).
async fn terminate(child: &mut Child, pgid: Option<u32>, grace: Duration) {
    #[cfg(unix)]
    {
        if let Some(pgid) = pgid {
            if !signal_group(pgid, libc::SIGTERM) {
                warn!(pgid, "SIGTERM to worker group failed, proceeding to SIGKILL");
            }
        }
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(_status)) => {
            debug!("worker exited after SIGTERM");
        }
        _ => {
            debug!("worker did not exit after SIGTERM, sending SIGKILL");
            if let Err(e) = child.kill().await {
                warn!(error = %e, "failed to kill worker");
            }
        }
    }

    // Descendants that ignored SIGTERM outlive the leader otherwise.
    kill_group(pgid);
}

/// Message recorded as stderr when waiting on a live worker fails. The io
/// error itself is only logged.
const WAIT_FAILED_MESSAGE: &str = "worker could not be waited on";

fn record_wait_failure(invocation: &mut WorkerInvocation) {
    invocation.stderr = WAIT_FAILED_MESSAGE.as_bytes().to_vec();
    invocation.advance(WorkerState::Exited(WAIT_FAILED_EXIT_CODE));
}

/// Run `executable` with `args` to a terminal state.
///
/// Never returns while the spawned process is still alive: every branch
/// either observes its exit or kills and reaps it. On unix the worker runs
/// in its own process group, and anything still alive in that group when
/// the run ends is killed.
pub async fn invoke(
    executable: &Path,
    args: Vec<OsString>,
    options: &LaunchOptions,
) -> WorkerInvocation {
    let start = Instant::now();
    let mut invocation = WorkerInvocation::new(executable, args);

    let mut cmd = Command::new(executable);
    cmd.args(&invocation.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    {
        cmd.process_group(0);
    }

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(source) => {
            warn!(
                executable = %executable.display(),
                error = %source,
                "failed to spawn worker"
            );
            invocation.fail_spawn(SpawnError {
                executable: executable.to_path_buf(),
                source,
            });
            invocation.elapsed = start.elapsed();
            return invocation;
        }
    };

    invocation.pid = child.id();
    let pgid = invocation.pid;

    let stdout_drain = child
        .stdout
        .take()
        .map(|pipe| Drain::spawn(pipe, options.max_stdout_bytes, "stdout"));
    let stderr_drain = child
        .stderr
        .take()
        .map(|pipe| Drain::spawn(pipe, options.max_stderr_bytes, "stderr"));

    invocation.advance(WorkerState::Running);
    debug!(
        pid = invocation.pid,
        executable = %executable.display(),
        "worker running"
    );

    match tokio::time::timeout(options.timeout, child.wait()).await {
        Ok(Ok(status)) => {
            let code = exit_code(status);
            let (stdout, stderr) = tokio::join!(
                collect(stdout_drain, options.kill_grace, "stdout"),
                collect(stderr_drain, options.kill_grace, "stderr"),
            );
            invocation.output_abandoned = stdout.abandoned || stderr.abandoned;
            if invocation.output_abandoned {
                kill_group(pgid);
            }
            invocation.stdout = stdout.bytes;
            invocation.stdout_truncated = stdout.truncated;
            invocation.stderr = stderr.bytes;
            invocation.stderr_truncated = stderr.truncated;
            invocation.advance(WorkerState::Exited(code));
        }
        Ok(Err(e)) => {
            warn!(pid = invocation.pid, error = %e, "failed to wait on worker");
            terminate(&mut child, pgid, options.kill_grace).await;
            abort_drains(stdout_drain, stderr_drain);
            record_wait_failure(&mut invocation);
        }
        Err(_) => {
            info!(
                pid = invocation.pid,
                timeout_secs = options.timeout.as_secs_f64(),
                "worker exceeded timeout, terminating"
            );
            terminate(&mut child, pgid, options.kill_grace).await;
            // Partial output of a timed-out worker is never decoded.
            abort_drains(stdout_drain, stderr_drain);
            invocation.advance(WorkerState::TimedOut);
        }
    }

    invocation.elapsed = start.elapsed();
    invocation
}

fn abort_drains(stdout: Option<Drain>, stderr: Option<Drain>) {
    for drain in [stdout, stderr].into_iter().flatten() {
        drain.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> (PathBuf, Vec<OsString>) {
        (
            PathBuf::from("/bin/sh"),
            vec![OsString::from("-c"), OsString::from(script)],
        )
    }

    fn quick() -> LaunchOptions {
        LaunchOptions {
            timeout: Duration::from_secs(10),
            kill_grace: Duration::from_millis(500),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn captures_both_streams_and_exit_code() {
        let (exe, args) = sh("echo out; echo err >&2; exit 3");
        let inv = invoke(&exe, args, &quick()).await;

        assert_eq!(inv.state(), WorkerState::Exited(3));
        assert_eq!(String::from_utf8_lossy(&inv.stdout), "out\n");
        assert_eq!(String::from_utf8_lossy(&inv.stderr), "err\n");
        assert!(inv.pid.is_some());
    }

    #[tokio::test]
    async fn missing_executable_is_spawn_failure() {
        let inv = invoke(
            Path::new("/definitely/not/a/docq/worker"),
            vec![],
            &quick(),
        )
        .await;

        assert_eq!(inv.state(), WorkerState::SpawnFailed);
        let err = inv.spawn_error.expect("spawn error recorded");
        assert_eq!(err.source.kind(), std::io::ErrorKind::NotFound);
        assert!(inv.pid.is_none());
    }

    #[tokio::test]
    async fn timeout_terminates_and_discards_output() {
        let (exe, args) = sh("echo partial; sleep 30");
        let options = LaunchOptions {
            timeout: Duration::from_millis(300),
            kill_grace: Duration::from_millis(500),
            ..Default::default()
        };

        let started = Instant::now();
        let inv = invoke(&exe, args, &options).await;

        assert_eq!(inv.state(), WorkerState::TimedOut);
        assert!(inv.stdout.is_empty(), "partial output must be discarded");
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn sigterm_ignoring_worker_is_killed() {
        let (exe, args) = sh("trap '' TERM; sleep 30");
        let options = LaunchOptions {
            timeout: Duration::from_millis(200),
            kill_grace: Duration::from_millis(200),
            ..Default::default()
        };

        let started = Instant::now();
        let inv = invoke(&exe, args, &options).await;

        assert_eq!(inv.state(), WorkerState::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn large_stderr_does_not_stall_worker() {
        // ~1 MiB on stderr, well past any pipe buffer, before stdout.
        let (exe, args) = sh(
            "i=0; while [ $i -lt 1024 ]; do \
               printf '%1024s' x >&2; i=$((i+1)); \
             done; echo done",
        );
        let inv = invoke(&exe, args, &quick()).await;

        assert_eq!(inv.state(), WorkerState::Exited(0));
        assert_eq!(String::from_utf8_lossy(&inv.stdout), "done\n");
        assert_eq!(inv.stderr.len(), DEFAULT_MAX_STDERR_BYTES);
        assert!(inv.stderr_truncated);
        assert!(!inv.stdout_truncated);
    }

    #[tokio::test]
    async fn stdout_cap_flags_truncation() {
        let (exe, args) = sh("printf '0123456789'");
        let options = LaunchOptions {
            max_stdout_bytes: 4,
            ..quick()
        };
        let inv = invoke(&exe, args, &options).await;

        assert_eq!(inv.stdout, b"0123");
        assert!(inv.stdout_truncated);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn signal_death_maps_to_shell_code() {
        let (exe, args) = sh("kill -9 $$");
        let inv = invoke(&exe, args, &quick()).await;
        assert_eq!(inv.state(), WorkerState::Exited(128 + 9));
    }

    #[tokio::test]
    async fn output_survives_a_child_holding_the_pipe() {
        // The background sleep inherits stdout and keeps it open after exit.
        let (exe, args) = sh("echo '{\"status\":\"ok\"}'; sleep 5 & exit 0");

        let started = Instant::now();
        let inv = invoke(&exe, args, &quick()).await;

        assert_eq!(inv.state(), WorkerState::Exited(0));
        assert_eq!(String::from_utf8_lossy(&inv.stdout), "{\"status\":\"ok\"}\n");
        assert!(inv.output_abandoned);
        assert!(!inv.stdout_truncated);
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timeout_kills_worker_descendants() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mark = tmp.path().join("finished");
        // A wrapper that backgrounds the real work, which ignores SIGTERM.
        let (exe, args) = sh(&format!(
            "sh -c \"trap '' TERM; sleep 1; touch '{}'\" & wait",
            mark.display()
        ));
        let options = LaunchOptions {
            timeout: Duration::from_millis(200),
            kill_grace: Duration::from_millis(200),
            ..Default::default()
        };

        let inv = invoke(&exe, args, &options).await;
        assert_eq!(inv.state(), WorkerState::TimedOut);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!mark.exists(), "descendant kept running after the timeout");
    }

    #[test]
    fn wait_failure_records_fixed_message() {
        let mut inv = WorkerInvocation::new("/bin/worker", vec![]);
        inv.advance(WorkerState::Running);

        record_wait_failure(&mut inv);

        assert_eq!(inv.state(), WorkerState::Exited(WAIT_FAILED_EXIT_CODE));
        assert_eq!(inv.stderr, WAIT_FAILED_MESSAGE.as_bytes());
    }

    #[tokio::test]
    async fn process_launcher_passes_path_then_query() {
        let tmp = tempfile::TempDir::new().unwrap();
        let script = tmp.path().join("worker.sh");
        std::fs::write(&script, "#!/bin/sh\nprintf '%s|%s' \"$1\" \"$2\"\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let launcher = ProcessLauncher::new(&script, quick());
        let inv = launcher
            .invoke(Path::new("/tmp/x.pdf"), "what is covered?")
            .await;

        assert_eq!(inv.state(), WorkerState::Exited(0));
        assert_eq!(
            String::from_utf8_lossy(&inv.stdout),
            "/tmp/x.pdf|what is covered?"
        );
    }
}
