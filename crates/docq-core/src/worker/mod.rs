//! Analysis worker supervision.
//!
//! The orchestrator talks to the worker through the [`WorkerLauncher`]
//! trait. The production implementation, [`ProcessLauncher`], spawns one
//! OS process per request and records everything it observed in a
//! [`WorkerInvocation`].
//!
//! ```text
//! Spawned --> Running --> Exited(code)
//!    |           |
//!    |           +------> TimedOut
//!    +------------------> SpawnFailed
//! ```

pub mod process;

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use process::{LaunchOptions, ProcessLauncher, invoke};

/// Exit code recorded when waiting on a live worker failed at the OS level.
pub const WAIT_FAILED_EXIT_CODE: i32 = -1;

/// Lifecycle of a single worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Spawned,
    Running,
    /// The process exited on its own. Signal deaths are reported as
    /// `128 + signal`.
    Exited(i32),
    /// The timeout expired and the process was terminated.
    TimedOut,
    /// The executable could not be started.
    SpawnFailed,
}

impl WorkerState {
    /// Terminal states are final.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkerState::Exited(_) | WorkerState::TimedOut | WorkerState::SpawnFailed
        )
    }

    /// Whether `from -> to` is an edge of the lifecycle graph.
    pub fn is_valid_transition(from: WorkerState, to: WorkerState) -> bool {
        matches!(
            (from, to),
            (WorkerState::Spawned, WorkerState::Running)
                | (WorkerState::Spawned, WorkerState::SpawnFailed)
                | (WorkerState::Running, WorkerState::Exited(_))
                | (WorkerState::Running, WorkerState::TimedOut)
        )
    }
}

/// Why a worker never started.
#[derive(Debug, Error)]
#[error("failed to start worker {}", executable.display())]
pub struct SpawnError {
    pub executable: PathBuf,
    #[source]
    pub source: std::io::Error,
}

/// Everything observed about one worker run.
#[derive(Debug)]
pub struct WorkerInvocation {
    /// Executable that was (or would have been) started.
    pub executable: PathBuf,
    /// Positional arguments passed to the executable.
    pub args: Vec<OsString>,
    /// OS process id, if the process started.
    pub pid: Option<u32>,
    /// Captured standard output (possibly capped, see `stdout_truncated`).
    pub stdout: Vec<u8>,
    /// Captured standard error (possibly capped, see `stderr_truncated`).
    pub stderr: Vec<u8>,
    /// Standard output exceeded the retention cap and was cut short.
    pub stdout_truncated: bool,
    /// Standard error exceeded the retention cap and was cut short.
    pub stderr_truncated: bool,
    /// An output stream was still open when the exit grace ran out (a
    /// leftover child held the pipe). The buffers hold what arrived before.
    pub output_abandoned: bool,
    /// Set when the state is [`WorkerState::SpawnFailed`].
    pub spawn_error: Option<SpawnError>,
    /// Wall-clock time from spawn attempt to terminal state.
    pub elapsed: Duration,
    state: WorkerState,
}

impl WorkerInvocation {
    /// A fresh invocation in the `Spawned` state with nothing captured.
    pub fn new(executable: impl Into<PathBuf>, args: Vec<OsString>) -> Self {
        Self {
            executable: executable.into(),
            args,
            pid: None,
            stdout: Vec::new(),
            stderr: Vec::new(),
            stdout_truncated: false,
            stderr_truncated: false,
            output_abandoned: false,
            spawn_error: None,
            elapsed: Duration::ZERO,
            state: WorkerState::Spawned,
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Move to `next`. Invalid edges (including any move out of a terminal
    /// state) are ignored and reported.
    pub fn advance(&mut self, next: WorkerState) {
        if !WorkerState::is_valid_transition(self.state, next) {
            debug_assert!(false, "invalid worker transition {:?} -> {:?}", self.state, next);
            tracing::error!(from = ?self.state, to = ?next, "ignoring invalid worker transition");
            return;
        }
        self.state = next;
    }

    /// Record a failed spawn. Buffers stay empty.
    pub fn fail_spawn(&mut self, error: SpawnError) {
        self.advance(WorkerState::SpawnFailed);
        self.spawn_error = Some(error);
    }
}

/// Runs the analysis worker for one artifact and query.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    /// Short name for logs (e.g. "process").
    fn name(&self) -> &str;

    /// Run the worker to a terminal state.
    ///
    /// Implementations must not return until any process they created has
    /// exited or been killed and reaped.
    async fn invoke(&self, artifact_path: &Path, query: &str) -> WorkerInvocation;
}

// Compile-time assertion: WorkerLauncher must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn WorkerLauncher) {}
};
