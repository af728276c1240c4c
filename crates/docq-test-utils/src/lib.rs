//! Shared test utilities for docq integration tests.
//!
//! Workers are small `/bin/sh` scripts written into a temporary directory,
//! so tests exercise real process spawning, pipes, exit codes and signals
//! without needing the real analysis worker installed.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use docq_core::{
    AnalysisRequest, ArtifactStore, LaunchOptions, Orchestrator, OrchestratorConfig,
    ProcessLauncher,
};

/// Write an executable `/bin/sh` script named `name` into `dir`.
///
/// The script receives the artifact path as `$1` and the query as `$2`.
pub fn script_worker(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n"))
        .unwrap_or_else(|e| panic!("failed to write worker script {}: {e}", path.display()));

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .unwrap_or_else(|e| panic!("failed to chmod worker script {}: {e}", path.display()));
    }

    path
}

/// A worker that prints `stdout` verbatim and exits `0`.
pub fn json_worker(dir: &Path, stdout: &str) -> PathBuf {
    script_worker(dir, "json-worker.sh", &format!("cat <<'EOF'\n{stdout}\nEOF"))
}

/// A worker that prints `stderr` to standard error and exits with `code`.
pub fn failing_worker(dir: &Path, code: i32, stderr: &str) -> PathBuf {
    script_worker(
        dir,
        "failing-worker.sh",
        &format!("printf '%s\\n' '{stderr}' >&2\nexit {code}"),
    )
}

/// A worker that sleeps far longer than any test timeout.
pub fn sleeping_worker(dir: &Path) -> PathBuf {
    script_worker(dir, "sleeping-worker.sh", "exec sleep 60")
}

/// A worker that checks it can read its artifact and echoes the query back
/// as a JSON answer.
pub fn echo_worker(dir: &Path) -> PathBuf {
    script_worker(
        dir,
        "echo-worker.sh",
        r#"[ -r "$1" ] || { echo "cannot read $1" >&2; exit 4; }
bytes=$(wc -c < "$1" | tr -d ' ')
printf '{"status":"ok","answer":"%s","bytes":%s,"artifact":"%s"}\n' "$2" "$bytes" "$1""#,
    )
}

/// Launch options with a short timeout and grace, suitable for tests.
pub fn quick_launch(timeout: Duration) -> LaunchOptions {
    LaunchOptions {
        timeout,
        kill_grace: Duration::from_millis(500),
        ..Default::default()
    }
}

/// An orchestrator writing artifacts to `artifact_dir` and running `worker`.
pub fn orchestrator(
    artifact_dir: &Path,
    worker: &Path,
    timeout: Duration,
    config: OrchestratorConfig,
) -> Arc<Orchestrator> {
    let launcher = Arc::new(ProcessLauncher::new(worker, quick_launch(timeout)));
    Arc::new(Orchestrator::new(
        ArtifactStore::new(artifact_dir),
        launcher,
        config,
    ))
}

/// A small PDF-looking request asking `query`.
pub fn pdf_request(query: &str) -> AnalysisRequest {
    AnalysisRequest::new(b"%PDF-1.4\n% test document\n".to_vec(), "policy.pdf", query)
        .content_type("application/pdf")
}

/// Files currently present in `dir` (empty if the directory is missing).
pub fn files_in(dir: &Path) -> Vec<PathBuf> {
    match std::fs::read_dir(dir) {
        Ok(entries) => entries.filter_map(|e| e.ok().map(|e| e.path())).collect(),
        Err(_) => Vec::new(),
    }
}
