use std::path::Path;

use anyhow::{Context, Result};

use docq_core::{AnalysisRequest, Orchestrator};

/// Run one document through the orchestrator and print the response body.
///
/// Returns whether the request succeeded; the caller maps that to the
/// process exit code.
pub async fn run_ask(orchestrator: &Orchestrator, file: &Path, query: &str) -> Result<bool> {
    let document = tokio::fs::read(file)
        .await
        .with_context(|| format!("failed to read {}", file.display()))?;
    let name = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let handled = orchestrator
        .handle(AnalysisRequest::new(document, name, query))
        .await;

    let rendered = serde_json::to_string_pretty(&handled.response.body)
        .context("failed to render response")?;
    println!("{rendered}");

    if !handled.response.is_success() {
        tracing::debug!(
            request_id = %handled.report.request_id,
            status = handled.response.status,
            "ask finished with an error response"
        );
    }
    Ok(handled.response.is_success())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use docq_core::OrchestratorConfig;
    use docq_test_utils::{echo_worker, failing_worker, files_in, orchestrator};

    use super::*;

    #[tokio::test]
    async fn ask_reports_success() {
        let tmp = tempfile::TempDir::new().unwrap();
        let artifacts = tmp.path().join("artifacts");
        let doc = tmp.path().join("claim.pdf");
        std::fs::write(&doc, b"%PDF-1.4").unwrap();
        let worker = echo_worker(tmp.path());
        let orch = orchestrator(
            &artifacts,
            &worker,
            Duration::from_secs(10),
            OrchestratorConfig::default(),
        );

        assert!(run_ask(&orch, &doc, "covered?").await.unwrap());
        assert!(files_in(&artifacts).is_empty());
    }

    #[tokio::test]
    async fn ask_reports_worker_failure() {
        let tmp = tempfile::TempDir::new().unwrap();
        let doc = tmp.path().join("claim.pdf");
        std::fs::write(&doc, b"%PDF-1.4").unwrap();
        let worker = failing_worker(tmp.path(), 3, "bad input");
        let orch = orchestrator(
            &tmp.path().join("artifacts"),
            &worker,
            Duration::from_secs(10),
            OrchestratorConfig::default(),
        );

        assert!(!run_ask(&orch, &doc, "covered?").await.unwrap());
    }

    #[tokio::test]
    async fn ask_errors_on_unreadable_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let worker = echo_worker(tmp.path());
        let orch = orchestrator(
            &tmp.path().join("artifacts"),
            &worker,
            Duration::from_secs(10),
            OrchestratorConfig::default(),
        );

        let err = run_ask(&orch, &tmp.path().join("missing.pdf"), "q")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("missing.pdf"), "unexpected error: {err}");
    }
}
