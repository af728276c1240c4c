//! Configuration file management for docq.
//!
//! Provides a TOML-based config file at `~/.config/docq/config.toml` and a
//! resolution chain: CLI flag > env var > config file > default.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use docq_core::orchestrator::DEFAULT_MAX_CONCURRENT_WORKERS;
use docq_core::request::DEFAULT_MAX_DOCUMENT_BYTES;
use docq_core::worker::process::{DEFAULT_KILL_GRACE, DEFAULT_TIMEOUT};
use docq_core::{
    ArtifactStore, DecodeContract, LaunchOptions, Orchestrator, OrchestratorConfig,
    ValidationPolicy,
};

/// Worker executable used when nothing else is configured (PATH lookup).
pub const DEFAULT_WORKER: &str = "docq-worker";
pub const DEFAULT_BIND: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8000;

/// Multipart framing allowance on top of the largest accepted document.
const MULTIPART_OVERHEAD_BYTES: usize = 64 * 1024;

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub worker: WorkerSection,
    pub artifacts: ArtifactsSection,
    pub server: ServerSection,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSection {
    pub executable: String,
    pub timeout_secs: u64,
    pub kill_grace_secs: u64,
    pub max_concurrent: usize,
    /// Top-level fields a successful result must carry.
    pub required_fields: Vec<String>,
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            executable: DEFAULT_WORKER.to_string(),
            timeout_secs: DEFAULT_TIMEOUT.as_secs(),
            kill_grace_secs: DEFAULT_KILL_GRACE.as_secs(),
            max_concurrent: DEFAULT_MAX_CONCURRENT_WORKERS,
            required_fields: DecodeContract::default().required_fields,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtifactsSection {
    /// Unset means `$TMPDIR/docq-artifacts`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
    pub max_document_bytes: usize,
    /// Empty accepts any declared content type.
    pub accepted_content_types: Vec<String>,
}

impl Default for ArtifactsSection {
    fn default() -> Self {
        Self {
            dir: None,
            max_document_bytes: DEFAULT_MAX_DOCUMENT_BYTES,
            accepted_content_types: Vec::new(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub bind: String,
    pub port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
            port: DEFAULT_PORT,
        }
    }
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the docq config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/docq` or `~/.config/docq`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("docq");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("docq")
}

/// Return the path to the docq config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

/// Default artifact directory under the system temp dir.
pub fn default_artifact_dir() -> PathBuf {
    std::env::temp_dir().join("docq-artifacts")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load the config file at `path`. A missing file yields `None`; a file
/// that exists but does not parse is an error.
pub fn load_config_from(path: &Path) -> Result<Option<ConfigFile>> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(e)
                .with_context(|| format!("failed to read config file at {}", path.display()));
        }
    };
    let config: ConfigFile = toml::from_str(&contents)
        .with_context(|| format!("failed to parse config file at {}", path.display()))?;
    Ok(Some(config))
}

/// Load the config file from its default location.
pub fn load_config() -> Result<Option<ConfigFile>> {
    load_config_from(&config_path())
}

/// Serialize and write the config file to `path`, creating parent dirs.
pub fn save_config_to(config: &ConfigFile, path: &Path) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create config directory {}", dir.display()))?;
    }

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    Ok(())
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Values given on the command line. `None` falls through to env / file.
#[derive(Debug, Default, Clone)]
pub struct CliOverrides {
    pub worker: Option<PathBuf>,
    pub timeout_secs: Option<u64>,
    pub bind: Option<String>,
    pub port: Option<u16>,
}

/// Fully resolved configuration, ready for use.
#[derive(Debug)]
pub struct DocqConfig {
    pub worker: PathBuf,
    pub launch: LaunchOptions,
    pub artifact_dir: PathBuf,
    pub orchestrator: OrchestratorConfig,
    pub bind: String,
    pub port: u16,
}

impl DocqConfig {
    /// Resolve configuration using the chain: CLI flag > env var > config file > default.
    ///
    /// - Worker: `--worker` > `DOCQ_WORKER` > `worker.executable`
    /// - Timeout: `--timeout` > `DOCQ_WORKER_TIMEOUT_SECS` > `worker.timeout_secs`
    /// - Concurrency: `DOCQ_MAX_WORKERS` > `worker.max_concurrent`
    /// - Artifacts: `DOCQ_ARTIFACT_DIR` > `artifacts.dir` > `$TMPDIR/docq-artifacts`
    /// - Server: `--bind`/`--port` > `DOCQ_BIND`/`DOCQ_PORT` > `server.*`
    pub fn resolve(cli: &CliOverrides) -> Result<Self> {
        let file = load_config()?;
        Self::resolve_with(file, cli, |name| std::env::var(name).ok())
    }

    /// Resolution with an explicit config file and environment lookup.
    pub fn resolve_with(
        file: Option<ConfigFile>,
        cli: &CliOverrides,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let file = file.unwrap_or_default();

        let worker = match &cli.worker {
            Some(path) => path.clone(),
            None => env("DOCQ_WORKER")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(&file.worker.executable)),
        };
        if worker.as_os_str().is_empty() {
            bail!("worker executable must not be empty");
        }

        let timeout_secs = match cli.timeout_secs {
            Some(t) => t,
            None => parse_env(&env, "DOCQ_WORKER_TIMEOUT_SECS")?
                .unwrap_or(file.worker.timeout_secs),
        };
        if timeout_secs == 0 {
            bail!("worker timeout must be at least one second");
        }

        let max_concurrent =
            parse_env(&env, "DOCQ_MAX_WORKERS")?.unwrap_or(file.worker.max_concurrent);
        if max_concurrent == 0 {
            bail!("worker.max_concurrent must be at least 1");
        }

        let artifact_dir = env("DOCQ_ARTIFACT_DIR")
            .map(PathBuf::from)
            .or(file.artifacts.dir)
            .unwrap_or_else(default_artifact_dir);

        let bind = cli
            .bind
            .clone()
            .or_else(|| env("DOCQ_BIND"))
            .unwrap_or(file.server.bind);
        let port = match cli.port {
            Some(p) => p,
            None => parse_env(&env, "DOCQ_PORT")?.unwrap_or(file.server.port),
        };

        let launch = LaunchOptions {
            timeout: Duration::from_secs(timeout_secs),
            kill_grace: Duration::from_secs(file.worker.kill_grace_secs),
            ..Default::default()
        };

        let orchestrator = OrchestratorConfig {
            validation: ValidationPolicy {
                max_document_bytes: file.artifacts.max_document_bytes,
                accepted_content_types: file.artifacts.accepted_content_types,
            },
            decode: DecodeContract {
                required_fields: file.worker.required_fields,
                ..Default::default()
            },
            max_concurrent_workers: max_concurrent,
        };

        Ok(Self {
            worker,
            launch,
            artifact_dir,
            orchestrator,
            bind,
            port,
        })
    }

    /// Largest request body the HTTP server accepts.
    pub fn body_limit(&self) -> usize {
        self.orchestrator
            .validation
            .max_document_bytes
            .saturating_add(MULTIPART_OVERHEAD_BYTES)
    }

    /// Build the orchestrator for this configuration.
    pub fn build_orchestrator(&self) -> Orchestrator {
        Orchestrator::with_process_worker(
            ArtifactStore::new(&self.artifact_dir),
            &self.worker,
            self.launch.clone(),
            self.orchestrator.clone(),
        )
    }
}

fn parse_env<T>(env: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("{name} is not a valid value: {raw:?}")),
        None => Ok(None),
    }
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------
