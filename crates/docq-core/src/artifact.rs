//! Transient on-disk artifacts, one per request.
//!
//! [`ArtifactStore::acquire`] writes the uploaded bytes to a path derived
//! from the request id and the sanitized original name, so two requests
//! never share a key and no locking is needed. The returned
//! [`EphemeralArtifact`] is a guard: call [`EphemeralArtifact::release`]
//! on the normal path, and if the guard is dropped without that (panic, or
//! the owning future is cancelled) its destructor removes the file instead.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

/// Longest sanitized file name kept in an artifact key.
const MAX_NAME_BYTES: usize = 64;

/// Name used when the original name sanitizes to nothing.
const FALLBACK_NAME: &str = "document";

/// Errors from writing an artifact to storage.
#[derive(Debug, Error)]
pub enum ArtifactError {
    /// The artifact base directory could not be created.
    #[error("failed to prepare artifact directory {path}")]
    Prepare {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Writing the artifact file failed (disk full, permission denied, ...).
    #[error("failed to write artifact {path}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ArtifactError {
    /// The underlying io error.
    pub fn io_error(&self) -> &std::io::Error {
        match self {
            ArtifactError::Prepare { source, .. } | ArtifactError::Write { source, .. } => source,
        }
    }
}

/// Creates and names artifacts under a single base directory.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    base_dir: PathBuf,
}

impl ArtifactStore {
    /// Create a store rooted at `base_dir`. The directory is not touched
    /// until [`Self::prepare`] or the first acquire.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// The directory artifacts are written into.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Create the base directory if it does not exist yet.
    pub async fn prepare(&self) -> Result<(), ArtifactError> {
        tokio::fs::create_dir_all(&self.base_dir)
            .await
            .map_err(|source| ArtifactError::Prepare {
                path: self.base_dir.clone(),
                source,
            })
    }

    /// Path an artifact for `request_id` / `suggested_name` would occupy.
    pub fn path_for(&self, request_id: Uuid, suggested_name: &str) -> PathBuf {
        self.base_dir.join(format!(
            "{}-{}",
            request_id.simple(),
            sanitize_name(suggested_name)
        ))
    }

    /// Write `bytes` to a fresh, collision-free path owned by `request_id`.
    ///
    /// The file is opened with create-new semantics; an existing file at the
    /// derived path is an error, never overwritten. On a failed write the
    /// partial file is removed before returning.
    pub async fn acquire(
        &self,
        bytes: &[u8],
        suggested_name: &str,
        request_id: Uuid,
    ) -> Result<EphemeralArtifact, ArtifactError> {
        self.prepare().await?;

        let path = self.path_for(request_id, suggested_name);

        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
            .map_err(|source| ArtifactError::Write {
                path: path.clone(),
                source,
            })?;

        // From here on the file exists, so the guard owns it even if the
        // write below fails.
        let artifact = EphemeralArtifact {
            path,
            request_id,
            created_at: Utc::now(),
            released: false,
        };

        let written = async {
            file.write_all(bytes).await?;
            file.flush().await?;
            file.sync_all().await
        }
        .await;
        drop(file);

        if let Err(source) = written {
            let path = artifact.path.clone();
            artifact.release().await;
            return Err(ArtifactError::Write { path, source });
        }

        debug!(
            request_id = %request_id,
            path = %artifact.path.display(),
            bytes = bytes.len(),
            "artifact written"
        );
        Ok(artifact)
    }
}

/// The on-disk copy of one request's document.
#[derive(Debug)]
pub struct EphemeralArtifact {
    path: PathBuf,
    request_id: Uuid,
    created_at: DateTime<Utc>,
    released: bool,
}

impl EphemeralArtifact {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Delete the artifact.
    ///
    /// A file that is already gone counts as released. Any other failure is
    /// logged and swallowed: cleanup never fails the request.
    pub async fn release(mut self) {
        self.released = true;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                debug!(request_id = %self.request_id, path = %self.path.display(), "artifact released");
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(request_id = %self.request_id, path = %self.path.display(), "artifact already gone");
            }
            Err(e) => {
                warn!(
                    request_id = %self.request_id,
                    path = %self.path.display(),
                    error = %e,
                    "failed to remove artifact"
                );
            }
        }
    }
}

impl Drop for EphemeralArtifact {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                warn!(
                    request_id = %self.request_id,
                    path = %self.path.display(),
                    "artifact removed on drop without explicit release"
                );
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                warn!(
                    request_id = %self.request_id,
                    path = %self.path.display(),
                    error = %e,
                    "failed to remove artifact on drop"
                );
            }
        }
    }
}

/// Reduce an arbitrary client-supplied file name to a safe path component.
///
/// Keeps ASCII alphanumerics, `.`, `-` and `_`; everything else becomes
/// `_`. Leading dots are stripped so the result is never hidden or a
/// relative path segment. Names longer than [`MAX_NAME_BYTES`] keep their
/// extension and lose the middle of the stem.
pub fn sanitize_name(name: &str) -> String {
    // Only the final component matters; browsers sometimes send full paths.
    let base = name.rsplit(['/', '\\']).next().unwrap_or("");

    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');

    if cleaned.is_empty() {
        return FALLBACK_NAME.to_owned();
    }
    if cleaned.len() <= MAX_NAME_BYTES {
        return cleaned.to_owned();
    }

    // Everything is ASCII at this point, so byte slicing is safe.
    match cleaned.rfind('.') {
        Some(dot) if cleaned.len() - dot <= 16 => {
            let ext = &cleaned[dot..];
            let stem = &cleaned[..MAX_NAME_BYTES - ext.len()];
            format!("{stem}{ext}")
        }
        _ => cleaned[..MAX_NAME_BYTES].to_owned(),
    }
}
