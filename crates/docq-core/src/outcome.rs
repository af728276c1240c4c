use std::time::Duration;

use serde_json::Value;

use crate::artifact::ArtifactError;
use crate::request::ValidationError;
use crate::worker::SpawnError;

/// How one request's processing ended.
///
/// Produced once per request and consumed exactly once by
/// [`crate::translate::translate`].
#[derive(Debug)]
pub enum AnalysisOutcome {
    /// The worker exited `0` and produced a decodable JSON object.
    Success(Value),
    /// The request was rejected before any artifact was written.
    ValidationFailed(ValidationError),
    /// The uploaded document could not be written to storage.
    ArtifactError(ArtifactError),
    /// The worker executable could not be started.
    SpawnFailed(SpawnError),
    /// The worker ran past its time budget and was terminated.
    TimedOut { after: Duration },
    /// The worker exited with a non-zero code.
    NonZeroExit { code: i32, stderr_excerpt: String },
    /// The worker exited `0` but its stdout was not a valid result.
    DecodeFailed { reason: String, raw_excerpt: String },
}

impl AnalysisOutcome {
    /// Stable snake_case name, used in logs and response bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            AnalysisOutcome::Success(_) => "success",
            AnalysisOutcome::ValidationFailed(_) => "validation_failed",
            AnalysisOutcome::ArtifactError(_) => "artifact_error",
            AnalysisOutcome::SpawnFailed(_) => "spawn_failed",
            AnalysisOutcome::TimedOut { .. } => "timed_out",
            AnalysisOutcome::NonZeroExit { .. } => "non_zero_exit",
            AnalysisOutcome::DecodeFailed { .. } => "decode_failed",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, AnalysisOutcome::Success(_))
    }
}
