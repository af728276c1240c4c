//! Per-request orchestration: validate, write the artifact, run the worker,
//! release the artifact, decode, translate.
//!
//! ```text
//! Received -> Validated -> ArtifactWritten -> WorkerInvoked -> Cleaned -> Decoded -> Responded
//!     |            |
//!     |            +--(artifact write failed)-------------------------------------> Responded
//!     +--(invalid)------------------------------------------------------------------> Responded
//! ```
//!
//! Once the artifact exists, every path goes through `Cleaned` before
//! `Responded`. The explicit release runs right after the worker returns;
//! if the request future is dropped or panics first, the artifact guard
//! removes the file on drop and the child process is killed on drop.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::artifact::ArtifactStore;
use crate::decode::{DecodeContract, outcome_from_invocation};
use crate::outcome::AnalysisOutcome;
use crate::request::{AnalysisRequest, ValidationPolicy};
use crate::translate::{AnalysisResponse, translate};
use crate::worker::{LaunchOptions, ProcessLauncher, WorkerLauncher};

/// Default number of workers allowed to run at once.
pub const DEFAULT_MAX_CONCURRENT_WORKERS: usize = 4;

/// Configuration for the orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Checks applied before any artifact is written.
    pub validation: ValidationPolicy,
    /// Shape a successful worker result must have.
    pub decode: DecodeContract,
    /// Maximum number of concurrently running workers.
    pub max_concurrent_workers: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            validation: ValidationPolicy::default(),
            decode: DecodeContract::default(),
            max_concurrent_workers: DEFAULT_MAX_CONCURRENT_WORKERS,
        }
    }
}

/// Steps a request passes through, in the order they happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestPhase {
    Received,
    Validated,
    ArtifactWritten,
    WorkerInvoked,
    Cleaned,
    Decoded,
    Responded,
}

/// What happened to one request, for logging and tests.
#[derive(Debug, Clone)]
pub struct RequestReport {
    pub request_id: Uuid,
    /// Phases in the order they were entered.
    pub phases: Vec<RequestPhase>,
    /// Where the artifact was written, if one was.
    pub artifact_path: Option<PathBuf>,
    /// Outcome kind, see [`AnalysisOutcome::kind`]. Set once decided.
    pub outcome_kind: Option<&'static str>,
    pub elapsed: Duration,
}

impl RequestReport {
    fn new(request_id: Uuid) -> Self {
        Self {
            request_id,
            phases: vec![RequestPhase::Received],
            artifact_path: None,
            outcome_kind: None,
            elapsed: Duration::ZERO,
        }
    }

    fn enter(&mut self, phase: RequestPhase) {
        debug!(request_id = %self.request_id, ?phase, "request phase");
        self.phases.push(phase);
    }

    /// Whether `phase` was entered.
    pub fn reached(&self, phase: RequestPhase) -> bool {
        self.phases.contains(&phase)
    }

    /// Position of `phase` in the sequence, if it was entered.
    pub fn position(&self, phase: RequestPhase) -> Option<usize> {
        self.phases.iter().position(|p| *p == phase)
    }
}

/// A response together with the report of how it was produced.
#[derive(Debug)]
pub struct HandledRequest {
    pub response: AnalysisResponse,
    pub report: RequestReport,
}

/// Sequences validation, artifact, worker, cleanup, decoding and
/// translation for each inbound request.
///
/// Cheap to share: wrap it in an `Arc` and call [`Self::handle`] from as
/// many tasks as needed. Requests share nothing but the artifact directory
/// (with collision-free keys) and the worker permit pool.
pub struct Orchestrator {
    store: ArtifactStore,
    launcher: Arc<dyn WorkerLauncher>,
    config: OrchestratorConfig,
    permits: Arc<Semaphore>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("artifact_dir", &self.store.base_dir())
            .field("launcher", &self.launcher.name())
            .field("config", &self.config)
            .finish()
    }
}

impl Orchestrator {
    /// Build an orchestrator around any launcher.
    ///
    /// A `max_concurrent_workers` of zero is treated as one.
    pub fn new(
        store: ArtifactStore,
        launcher: Arc<dyn WorkerLauncher>,
        config: OrchestratorConfig,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_workers.max(1)));
        Self {
            store,
            launcher,
            config,
            permits,
        }
    }

    /// Build an orchestrator that runs `executable` as an OS process.
    pub fn with_process_worker(
        store: ArtifactStore,
        executable: impl Into<PathBuf>,
        launch: LaunchOptions,
        config: OrchestratorConfig,
    ) -> Self {
        let launcher = Arc::new(ProcessLauncher::new(executable, launch));
        Self::new(store, launcher, config)
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn artifact_store(&self) -> &ArtifactStore {
        &self.store
    }

    /// Worker slots not currently in use.
    pub fn available_workers(&self) -> usize {
        self.permits.available_permits()
    }

    /// Run one request end to end and build its response.
    pub async fn handle(&self, request: AnalysisRequest) -> HandledRequest {
        let (outcome, mut report) = self.process(request).await;

        let kind = outcome.kind();
        let response = translate(outcome);
        report.enter(RequestPhase::Responded);

        info!(
            request_id = %report.request_id,
            outcome = kind,
            status = response.status,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "request handled"
        );

        HandledRequest { response, report }
    }

    /// Run one request up to (not including) response construction.
    ///
    /// The returned outcome has not been translated yet; the artifact, if
    /// one was written, has already been released.
    pub async fn process(&self, request: AnalysisRequest) -> (AnalysisOutcome, RequestReport) {
        let start = Instant::now();
        let request_id = Uuid::new_v4();
        let mut report = RequestReport::new(request_id);

        let outcome = self.run(request, &mut report).await;

        report.outcome_kind = Some(outcome.kind());
        report.elapsed = start.elapsed();
        (outcome, report)
    }

    async fn run(&self, request: AnalysisRequest, report: &mut RequestReport) -> AnalysisOutcome {
        let request_id = report.request_id;

        let validated = match self.config.validation.validate(request) {
            Ok(v) => v,
            Err(reason) => {
                info!(request_id = %request_id, %reason, "request rejected");
                return AnalysisOutcome::ValidationFailed(reason);
            }
        };
        report.enter(RequestPhase::Validated);

        let artifact = match self
            .store
            .acquire(&validated.document, &validated.original_name, request_id)
            .await
        {
            Ok(artifact) => artifact,
            Err(e) => {
                warn!(
                    request_id = %request_id,
                    error = %e,
                    cause = %e.io_error(),
                    "failed to write artifact"
                );
                return AnalysisOutcome::ArtifactError(e);
            }
        };
        report.artifact_path = Some(artifact.path().to_path_buf());
        report.enter(RequestPhase::ArtifactWritten);

        let invocation = {
            // The semaphore is never closed, so acquire cannot fail.
            let _permit = self.permits.acquire().await.ok();
            self.launcher
                .invoke(artifact.path(), &validated.query)
                .await
        };
        report.enter(RequestPhase::WorkerInvoked);
        debug!(
            request_id = %request_id,
            launcher = self.launcher.name(),
            state = ?invocation.state(),
            elapsed_ms = invocation.elapsed.as_millis() as u64,
            stdout_bytes = invocation.stdout.len(),
            stderr_bytes = invocation.stderr.len(),
            output_abandoned = invocation.output_abandoned,
            "worker finished"
        );

        artifact.release().await;
        report.enter(RequestPhase::Cleaned);

        let outcome = outcome_from_invocation(invocation, &self.config.decode);
        report.enter(RequestPhase::Decoded);

        match &outcome {
            AnalysisOutcome::SpawnFailed(e) => {
                warn!(request_id = %request_id, error = %e, cause = %e.source, "worker did not start");
            }
            AnalysisOutcome::TimedOut { after } => {
                warn!(request_id = %request_id, after_ms = after.as_millis() as u64, "worker timed out");
            }
            AnalysisOutcome::NonZeroExit {
                code,
                stderr_excerpt,
            } => {
                warn!(request_id = %request_id, code, stderr = %stderr_excerpt, "worker failed");
            }
            AnalysisOutcome::DecodeFailed {
                reason,
                raw_excerpt,
            } => {
                warn!(request_id = %request_id, %reason, raw = %raw_excerpt, "worker output rejected");
            }
            _ => {}
        }

        outcome
    }
}
