//! Document query orchestration.
//!
//! Accepts a document plus a natural-language query, writes the document to
//! a transient artifact, runs an external analysis worker against it, and
//! turns whatever the worker did into a single response. The artifact and
//! the worker process are released on every path.
//!
//! ```text
//! AnalysisRequest
//!     |
//!     v
//! Orchestrator::handle
//!     |-- ValidationPolicy::validate
//!     |-- ArtifactStore::acquire ------> EphemeralArtifact (guard)
//!     |-- WorkerLauncher::invoke ------> WorkerInvocation
//!     |-- EphemeralArtifact::release
//!     |-- decode::outcome_from_invocation -> AnalysisOutcome
//!     +-- translate::translate ---------> AnalysisResponse
//! ```

pub mod artifact;
pub mod decode;
pub mod orchestrator;
pub mod outcome;
pub mod request;
pub mod translate;
pub mod worker;

pub use artifact::{ArtifactError, ArtifactStore, EphemeralArtifact};
pub use decode::DecodeContract;
pub use orchestrator::{
    HandledRequest, Orchestrator, OrchestratorConfig, RequestPhase, RequestReport,
};
pub use outcome::AnalysisOutcome;
pub use request::{AnalysisRequest, ValidationError, ValidationPolicy};
pub use translate::{AnalysisResponse, ErrorBody, ResponseBody};
pub use worker::{
    LaunchOptions, ProcessLauncher, SpawnError, WorkerInvocation, WorkerLauncher, WorkerState,
};
