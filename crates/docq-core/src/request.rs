//! Inbound request type and its validation rules.
//!
//! An [`AnalysisRequest`] lives only for the duration of one call. The
//! orchestrator validates it before touching the filesystem, so a request
//! rejected here never produces an artifact or a worker process.

use thiserror::Error;

/// Default upper bound on document size (20 MiB).
pub const DEFAULT_MAX_DOCUMENT_BYTES: usize = 20 * 1024 * 1024;

/// One uploaded document plus the question to ask about it.
#[derive(Debug, Clone, Default)]
pub struct AnalysisRequest {
    /// Raw document bytes. `None` when the caller sent no file part.
    pub document: Option<Vec<u8>>,
    /// Name the caller gave the file (e.g. `policy.pdf`).
    pub original_name: Option<String>,
    /// Declared MIME type of the upload, if the transport carried one.
    pub content_type: Option<String>,
    /// Natural-language query passed through to the worker.
    pub query: Option<String>,
}

impl AnalysisRequest {
    /// Build a request with a document and a query.
    pub fn new(
        document: impl Into<Vec<u8>>,
        original_name: impl Into<String>,
        query: impl Into<String>,
    ) -> Self {
        Self {
            document: Some(document.into()),
            original_name: Some(original_name.into()),
            content_type: None,
            query: Some(query.into()),
        }
    }

    /// Set the declared content type.
    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

/// Why a request was rejected before any work was done.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("a document file is required")]
    MissingDocument,

    #[error("the uploaded document is empty")]
    EmptyDocument,

    #[error("a non-empty query string is required")]
    MissingQuery,

    #[error("document is {size} bytes, exceeding the {limit} byte limit")]
    DocumentTooLarge { size: usize, limit: usize },

    #[error("unsupported content type {0:?}")]
    UnsupportedContentType(String),
}

/// Limits applied to every request before an artifact is written.
#[derive(Debug, Clone)]
pub struct ValidationPolicy {
    /// Largest accepted document in bytes.
    pub max_document_bytes: usize,
    /// Accepted MIME types. Empty accepts anything.
    pub accepted_content_types: Vec<String>,
}

impl Default for ValidationPolicy {
    fn default() -> Self {
        Self {
            max_document_bytes: DEFAULT_MAX_DOCUMENT_BYTES,
            accepted_content_types: Vec::new(),
        }
    }
}

/// A request that passed validation. Fields are no longer optional.
#[derive(Debug)]
pub struct ValidatedRequest {
    pub document: Vec<u8>,
    pub original_name: String,
    pub query: String,
}

impl ValidationPolicy {
    /// Check a request against the policy, consuming it on success.
    pub fn validate(&self, request: AnalysisRequest) -> Result<ValidatedRequest, ValidationError> {
        let document = request.document.ok_or(ValidationError::MissingDocument)?;

        let query = match request.query {
            Some(q) if !q.trim().is_empty() => q,
            _ => return Err(ValidationError::MissingQuery),
        };

        if document.is_empty() {
            return Err(ValidationError::EmptyDocument);
        }

        if document.len() > self.max_document_bytes {
            return Err(ValidationError::DocumentTooLarge {
                size: document.len(),
                limit: self.max_document_bytes,
            });
        }

        if !self.accepted_content_types.is_empty() {
            let declared = request.content_type.unwrap_or_default();
            // Ignore parameters such as `; charset=binary`.
            let essence = declared.split(';').next().unwrap_or("").trim();
            let accepted = self
                .accepted_content_types
                .iter()
                .any(|ct| ct.eq_ignore_ascii_case(essence));
            if !accepted {
                return Err(ValidationError::UnsupportedContentType(declared));
            }
        }

        Ok(ValidatedRequest {
            document,
            original_name: request.original_name.unwrap_or_default(),
            query,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_document_and_query() {
        let req = AnalysisRequest::new(b"%PDF-1.4".to_vec(), "policy.pdf", "is surgery covered?");
        let validated = ValidationPolicy::default().validate(req).unwrap();
        assert_eq!(validated.original_name, "policy.pdf");
        assert_eq!(validated.query, "is surgery covered?");
    }

    #[test]
    fn rejects_missing_document() {
        let req = AnalysisRequest {
            query: Some("anything".into()),
            ..Default::default()
        };
        assert_eq!(
            ValidationPolicy::default().validate(req).unwrap_err(),
            ValidationError::MissingDocument
        );
    }

    #[test]
    fn rejects_missing_and_blank_query() {
        let mut req = AnalysisRequest::new(b"data".to_vec(), "a.txt", "");
        req.query = None;
        assert_eq!(
            ValidationPolicy::default().validate(req).unwrap_err(),
            ValidationError::MissingQuery
        );

        let req = AnalysisRequest::new(b"data".to_vec(), "a.txt", "   \n");
        assert_eq!(
            ValidationPolicy::default().validate(req).unwrap_err(),
            ValidationError::MissingQuery
        );
    }

    #[test]
    fn rejects_empty_document() {
        let req = AnalysisRequest::new(Vec::new(), "empty.pdf", "q");
        assert_eq!(
            ValidationPolicy::default().validate(req).unwrap_err(),
            ValidationError::EmptyDocument
        );
    }

    #[test]
    fn rejects_oversized_document() {
        let policy = ValidationPolicy {
            max_document_bytes: 4,
            ..Default::default()
        };
        let req = AnalysisRequest::new(b"12345".to_vec(), "big.bin", "q");
        assert_eq!(
            policy.validate(req).unwrap_err(),
            ValidationError::DocumentTooLarge { size: 5, limit: 4 }
        );
    }

    #[test]
    fn content_type_allowlist_ignores_parameters_and_case() {
        let policy = ValidationPolicy {
            accepted_content_types: vec!["application/pdf".into()],
            ..Default::default()
        };

        let ok = AnalysisRequest::new(b"x".to_vec(), "a.pdf", "q")
            .content_type("Application/PDF; charset=binary");
        assert!(policy.validate(ok).is_ok());

        let bad = AnalysisRequest::new(b"x".to_vec(), "a.txt", "q").content_type("text/plain");
        assert_eq!(
            policy.validate(bad).unwrap_err(),
            ValidationError::UnsupportedContentType("text/plain".into())
        );

        let undeclared = AnalysisRequest::new(b"x".to_vec(), "a.pdf", "q");
        assert!(policy.validate(undeclared).is_err());
    }
}
