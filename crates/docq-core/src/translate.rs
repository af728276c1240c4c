//! Maps an [`AnalysisOutcome`] to the status code and body a caller sees.
//!
//! | Outcome          | Status | Body                                  |
//! |------------------|--------|---------------------------------------|
//! | Success          | 200    | worker payload, verbatim              |
//! | ValidationFailed | 400    | validation reason                     |
//! | ArtifactError    | 500    | generic storage failure               |
//! | SpawnFailed      | 500    | "could not start analysis worker"     |
//! | TimedOut         | 500    | "analysis exceeded time budget"       |
//! | NonZeroExit      | 500    | exit code + stderr excerpt            |
//! | DecodeFailed     | 500    | "malformed worker output" + reason    |
//!
//! Internal details such as artifact paths or io error text are never
//! placed in a response body.

use serde::Serialize;
use serde_json::Value;

use crate::outcome::AnalysisOutcome;

pub const STATUS_OK: u16 = 200;
pub const STATUS_BAD_REQUEST: u16 = 400;
pub const STATUS_INTERNAL_ERROR: u16 = 500;

/// Error envelope returned for every non-success outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorBody {
    /// Human-readable message.
    pub error: String,
    /// Outcome kind, see [`AnalysisOutcome::kind`].
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Either the worker payload or an error envelope.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ResponseBody {
    Payload(Value),
    Error(ErrorBody),
}

/// Transport-neutral response: an HTTP-style status plus a JSON body.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisResponse {
    pub status: u16,
    pub body: ResponseBody,
}

impl AnalysisResponse {
    pub fn is_success(&self) -> bool {
        self.status == STATUS_OK
    }

    fn error(status: u16, kind: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ResponseBody::Error(ErrorBody {
                error: message.into(),
                kind,
                exit_code: None,
                detail: None,
            }),
        }
    }

    fn with_exit_code(mut self, code: i32) -> Self {
        if let ResponseBody::Error(ref mut body) = self.body {
            body.exit_code = Some(code);
        }
        self
    }

    fn with_detail(mut self, detail: impl Into<String>) -> Self {
        if let ResponseBody::Error(ref mut body) = self.body {
            body.detail = Some(detail.into());
        }
        self
    }
}

/// Build the caller-facing response for `outcome`. Pure; no side effects.
pub fn translate(outcome: AnalysisOutcome) -> AnalysisResponse {
    let kind = outcome.kind();
    match outcome {
        AnalysisOutcome::Success(payload) => AnalysisResponse {
            status: STATUS_OK,
            body: ResponseBody::Payload(payload),
        },
        AnalysisOutcome::ValidationFailed(reason) => {
            AnalysisResponse::error(STATUS_BAD_REQUEST, kind, reason.to_string())
        }
        AnalysisOutcome::ArtifactError(_) => AnalysisResponse::error(
            STATUS_INTERNAL_ERROR,
            kind,
            "failed to store the uploaded document",
        ),
        AnalysisOutcome::SpawnFailed(_) => AnalysisResponse::error(
            STATUS_INTERNAL_ERROR,
            kind,
            "could not start analysis worker",
        ),
        AnalysisOutcome::TimedOut { .. } => AnalysisResponse::error(
            STATUS_INTERNAL_ERROR,
            kind,
            "analysis exceeded time budget",
        ),
        AnalysisOutcome::NonZeroExit {
            code,
            stderr_excerpt,
        } => {
            let response = AnalysisResponse::error(
                STATUS_INTERNAL_ERROR,
                kind,
                format!("analysis worker exited with code {code}"),
            )
            .with_exit_code(code);
            if stderr_excerpt.is_empty() {
                response
            } else {
                response.with_detail(stderr_excerpt)
            }
        }
        AnalysisOutcome::DecodeFailed { reason, .. } => {
            AnalysisResponse::error(STATUS_INTERNAL_ERROR, kind, "malformed worker output")
                .with_detail(reason)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::artifact::ArtifactError;
    use crate::request::ValidationError;
    use crate::worker::SpawnError;

    fn body_json(response: &AnalysisResponse) -> Value {
        serde_json::to_value(&response.body).unwrap()
    }

    #[test]
    fn success_passes_payload_through() {
        let payload = json!({"status": "ok", "answer": "42"});
        let response = translate(AnalysisOutcome::Success(payload.clone()));
        assert_eq!(response.status, 200);
        assert!(response.is_success());
        assert_eq!(body_json(&response), payload);
    }

    #[test]
    fn validation_failure_is_400_with_reason() {
        let response = translate(AnalysisOutcome::ValidationFailed(ValidationError::MissingQuery));
        assert_eq!(response.status, 400);
        assert_eq!(
            body_json(&response),
            json!({
                "error": "a non-empty query string is required",
                "kind": "validation_failed",
            })
        );
    }

    #[test]
    fn artifact_error_hides_path() {
        let response = translate(AnalysisOutcome::ArtifactError(ArtifactError::Write {
            path: PathBuf::from("/secret/tmp/abc-doc.pdf"),
            source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        }));
        assert_eq!(response.status, 500);
        let body = body_json(&response).to_string();
        assert!(!body.contains("/secret"), "path leaked: {body}");
        assert!(body.contains("artifact_error"));
    }

    #[test]
    fn spawn_and_timeout_messages() {
        let spawn = translate(AnalysisOutcome::SpawnFailed(SpawnError {
            executable: PathBuf::from("/missing"),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        }));
        assert_eq!(spawn.status, 500);
        assert_eq!(body_json(&spawn)["error"], "could not start analysis worker");

        let timeout = translate(AnalysisOutcome::TimedOut {
            after: Duration::from_secs(5),
        });
        assert_eq!(timeout.status, 500);
        assert_eq!(body_json(&timeout)["error"], "analysis exceeded time budget");
        assert_eq!(body_json(&timeout)["kind"], "timed_out");
    }

    #[test]
    fn non_zero_exit_includes_code_and_excerpt() {
        let response = translate(AnalysisOutcome::NonZeroExit {
            code: 2,
            stderr_excerpt: "OOM".into(),
        });
        assert_eq!(response.status, 500);
        let body = body_json(&response);
        assert_eq!(body["exit_code"], 2);
        assert_eq!(body["detail"], "OOM");
    }

    #[test]
    fn non_zero_exit_without_stderr_omits_detail() {
        let response = translate(AnalysisOutcome::NonZeroExit {
            code: 1,
            stderr_excerpt: String::new(),
        });
        assert!(body_json(&response).get("detail").is_none());
    }

    #[test]
    fn decode_failure_withholds_raw_output() {
        let response = translate(AnalysisOutcome::DecodeFailed {
            reason: "output is not a JSON object".into(),
            raw_excerpt: "SECRET RAW".into(),
        });
        assert_eq!(response.status, 500);
        let body = body_json(&response);
        assert_eq!(body["error"], "malformed worker output");
        assert!(!body.to_string().contains("SECRET RAW"));
    }
}
