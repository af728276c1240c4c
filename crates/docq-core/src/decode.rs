//! Turns a finished [`WorkerInvocation`] into an [`AnalysisOutcome`].
//!
//! A zero exit code is necessary but not sufficient: the worker's stdout
//! must also hold exactly one JSON object carrying every required field.
//! Decodability is the authoritative success signal.

use serde_json::Value;

use crate::outcome::AnalysisOutcome;
use crate::worker::{WorkerInvocation, WorkerState};

/// Default cap on diagnostic excerpts (4 KiB).
pub const DEFAULT_EXCERPT_BYTES: usize = 4 * 1024;

/// What a successful worker result must look like.
#[derive(Debug, Clone)]
pub struct DecodeContract {
    /// Top-level fields that must be present and non-null.
    pub required_fields: Vec<String>,
    /// Maximum size of stderr / raw-output excerpts kept in outcomes.
    pub excerpt_bytes: usize,
}

impl Default for DecodeContract {
    fn default() -> Self {
        Self {
            required_fields: vec!["status".to_owned()],
            excerpt_bytes: DEFAULT_EXCERPT_BYTES,
        }
    }
}

/// Decode captured output for a worker that exited with `exit_code`.
///
/// Non-zero codes never look at stdout.
pub fn decode(
    exit_code: i32,
    stdout: &[u8],
    stderr: &[u8],
    contract: &DecodeContract,
) -> AnalysisOutcome {
    if exit_code != 0 {
        return AnalysisOutcome::NonZeroExit {
            code: exit_code,
            stderr_excerpt: tail_snippet(&String::from_utf8_lossy(stderr), contract.excerpt_bytes),
        };
    }

    match parse_payload(stdout, &contract.required_fields) {
        Ok(payload) => AnalysisOutcome::Success(payload),
        Err(reason) => decode_failed(reason, stdout, contract),
    }
}

/// Map any terminal invocation to an outcome.
pub fn outcome_from_invocation(
    invocation: WorkerInvocation,
    contract: &DecodeContract,
) -> AnalysisOutcome {
    match invocation.state() {
        WorkerState::SpawnFailed => match invocation.spawn_error {
            Some(error) => AnalysisOutcome::SpawnFailed(error),
            None => AnalysisOutcome::SpawnFailed(crate::worker::SpawnError {
                executable: invocation.executable,
                source: std::io::Error::other("spawn failed without an error"),
            }),
        },
        WorkerState::TimedOut => AnalysisOutcome::TimedOut {
            after: invocation.elapsed,
        },
        WorkerState::Exited(0) if invocation.stdout_truncated => decode_failed(
            "worker output exceeded the retention limit".to_owned(),
            &invocation.stdout,
            contract,
        ),
        WorkerState::Exited(code) => {
            decode(code, &invocation.stdout, &invocation.stderr, contract)
        }
        state @ (WorkerState::Spawned | WorkerState::Running) => {
            // Launchers must return terminal invocations; treat anything
            // else as a failed run rather than guessing at success.
            tracing::error!(?state, "launcher returned a non-terminal invocation");
            AnalysisOutcome::NonZeroExit {
                code: crate::worker::WAIT_FAILED_EXIT_CODE,
                stderr_excerpt: format!("worker left in state {state:?}"),
            }
        }
    }
}

fn decode_failed(reason: String, stdout: &[u8], contract: &DecodeContract) -> AnalysisOutcome {
    AnalysisOutcome::DecodeFailed {
        reason,
        raw_excerpt: truncate_snippet(&String::from_utf8_lossy(stdout), contract.excerpt_bytes),
    }
}

fn parse_payload(stdout: &[u8], required_fields: &[String]) -> Result<Value, String> {
    let trimmed = stdout.trim_ascii();
    if trimmed.is_empty() {
        return Err("worker produced no output".to_owned());
    }

    let value: Value =
        serde_json::from_slice(trimmed).map_err(|e| format!("output is not a single JSON document: {e}"))?;

    let Some(object) = value.as_object() else {
        return Err("output is not a JSON object".to_owned());
    };

    for field in required_fields {
        match object.get(field) {
            Some(v) if !v.is_null() => {}
            _ => return Err(format!("output is missing required field {field:?}")),
        }
    }

    Ok(value)
}

/// Keep the first `max_bytes` of `s`, appending `...` when cut.
pub fn truncate_snippet(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_owned();
    }
    // Find a valid UTF-8 boundary near the limit.
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    let mut truncated = s[..end].to_owned();
    truncated.push_str("...");
    truncated
}

/// Keep the last `max_bytes` of `s`, prefixing `...` when cut.
///
/// Fatal worker messages land at the end of stderr, so that is the part
/// worth keeping.
pub fn tail_snippet(s: &str, max_bytes: usize) -> String {
    let s = s.trim_end();
    if s.len() <= max_bytes {
        return s.to_owned();
    }
    let mut start = s.len() - max_bytes;
    while start < s.len() && !s.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &s[start..])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contract() -> DecodeContract {
        DecodeContract::default()
    }

    #[test]
    fn ok_object_with_status_is_success() {
        let out = decode(0, br#"{"status":"ok","answer":"42"}"#, b"", &contract());
        match out {
            AnalysisOutcome::Success(payload) => assert_eq!(payload["answer"], "42"),
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[test]
    fn surrounding_whitespace_is_ignored() {
        let out = decode(0, b"\n  {\"status\":\"ok\"}\n\n", b"", &contract());
        assert!(out.is_success());
    }

    #[test]
    fn non_json_is_decode_failure() {
        let out = decode(0, b"not json", b"", &contract());
        match out {
            AnalysisOutcome::DecodeFailed { raw_excerpt, .. } => assert_eq!(raw_excerpt, "not json"),
            other => panic!("expected decode failure, got {other:?}"),
        }
    }

    #[test]
    fn json_string_is_decode_failure() {
        // A bare JSON string parses but is not an object.
        let out = decode(0, br#""not json""#, b"", &contract());
        assert_eq!(out.kind(), "decode_failed");
    }

    #[test]
    fn missing_or_null_required_field_is_decode_failure() {
        let out = decode(0, br#"{"answer":"42"}"#, b"", &contract());
        assert_eq!(out.kind(), "decode_failed");

        let out = decode(0, br#"{"status":null}"#, b"", &contract());
        assert_eq!(out.kind(), "decode_failed");
    }

    #[test]
    fn two_documents_are_decode_failure() {
        let out = decode(0, b"{\"status\":\"a\"}\n{\"status\":\"b\"}", b"", &contract());
        assert_eq!(out.kind(), "decode_failed");
    }

    #[test]
    fn empty_output_is_decode_failure() {
        let out = decode(0, b"   ", b"", &contract());
        assert_eq!(out.kind(), "decode_failed");
    }

    #[test]
    fn custom_required_fields() {
        let c = DecodeContract {
            required_fields: vec!["decision".into(), "justification".into()],
            ..Default::default()
        };
        let ok = decode(0, br#"{"decision":"Approved","justification":["a"]}"#, b"", &c);
        assert!(ok.is_success());

        let no_status_needed = decode(0, br#"{"decision":"x","justification":[]}"#, b"", &c);
        assert!(no_status_needed.is_success());
    }

    #[test]
    fn non_zero_exit_ignores_stdout() {
        let out = decode(2, br#"{"status":"ok"}"#, b"OOM\n", &contract());
        match out {
            AnalysisOutcome::NonZeroExit {
                code,
                stderr_excerpt,
            } => {
                assert_eq!(code, 2);
                assert_eq!(stderr_excerpt, "OOM");
            }
            other => panic!("expected non-zero exit, got {other:?}"),
        }
    }

    #[test]
    fn stderr_excerpt_keeps_tail() {
        let c = DecodeContract {
            excerpt_bytes: 8,
            ..Default::default()
        };
        let stderr = format!("{}FATAL: OOM", "noise ".repeat(100));
        match decode(1, b"", stderr.as_bytes(), &c) {
            AnalysisOutcome::NonZeroExit { stderr_excerpt, .. } => {
                assert_eq!(stderr_excerpt, "...TAL: OOM");
            }
            other => panic!("expected non-zero exit, got {other:?}"),
        }
    }

    #[test]
    fn truncated_stdout_is_decode_failure() {
        let mut inv = WorkerInvocation::new("w", vec![]);
        inv.advance(WorkerState::Running);
        inv.stdout = br#"{"status":"ok"}"#.to_vec();
        inv.stdout_truncated = true;
        inv.advance(WorkerState::Exited(0));

        let out = outcome_from_invocation(inv, &contract());
        assert_eq!(out.kind(), "decode_failed");
    }

    #[test]
    fn timed_out_invocation_is_never_decoded() {
        let mut inv = WorkerInvocation::new("w", vec![]);
        inv.advance(WorkerState::Running);
        inv.stdout = br#"{"status":"ok"}"#.to_vec();
        inv.advance(WorkerState::TimedOut);

        let out = outcome_from_invocation(inv, &contract());
        assert_eq!(out.kind(), "timed_out");
    }

    #[test]
    fn truncate_short_string_unchanged() {
        assert_eq!(truncate_snippet("hello", 10), "hello");
    }

    #[test]
    fn truncate_long_string_with_ellipsis() {
        assert_eq!(truncate_snippet("abcdefghij", 5), "abcde...");
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        // "é" is two bytes; cutting at 1 must back off to 0.
        assert_eq!(truncate_snippet("éé", 1), "...");
        assert_eq!(tail_snippet("éé", 1), "...");
    }

    #[test]
    fn tail_trims_trailing_newlines() {
        assert_eq!(tail_snippet("boom\n\n", 100), "boom");
    }
}
