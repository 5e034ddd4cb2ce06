// SPDX-License-Identifier: MIT OR Apache-2.0
//! Unified error taxonomy with stable error codes for oc-memory.
//!
//! Every error carries an [`ErrorCode`] (a machine-readable, stable string
//! tag), a human-readable message, an optional cause chain, and arbitrary
//! key-value context. Use the builder returned by [`OcError::new`] to
//! construct errors fluently.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Broad family that an [`ErrorCode`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Service unreachable: timeouts, connection refused.
    Unavailable,
    /// 2xx-bounded transport but a non-OK application status.
    ApiError,
    /// Response or input fails schema.
    ValidationError,
    /// A lock could not be acquired within its deadline.
    LockContention,
    /// On-disk data is unparseable or structurally invalid.
    Corruption,
    /// Unrecoverable: the process cannot continue.
    Fatal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unavailable => "unavailable",
            Self::ApiError => "api_error",
            Self::ValidationError => "validation_error",
            Self::LockContention => "lock_contention",
            Self::Corruption => "corruption",
            Self::Fatal => "fatal",
        };
        f.write_str(s)
    }
}

/// Machine-readable, stable error code.
///
/// Each variant serializes to a `SCREAMING_SNAKE_CASE` string guaranteed not
/// to change across patch releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // -- Unavailable --
    /// The worker did not respond to the health probe.
    WorkerUnreachable,
    /// A network call exceeded its configured timeout.
    RequestTimeout,

    // -- ApiError --
    /// `/api/import` rejected the payload with a non-2xx status.
    ImportRejected,
    /// A read endpoint rejected the request.
    QueryRejected,
    /// Catch-all for a non-OK HTTP status that didn't parse into a known
    /// error envelope shape.
    HttpError,

    // -- ValidationError --
    /// Input or response failed the declared schema.
    SchemaInvalid,
    /// `narrative` is missing or below the minimum length.
    NarrativeTooShort,
    /// `oc_metadata` failed validation against its declared shape.
    MetadataInvalid,

    // -- LockContention --
    /// Could not acquire a lock before its deadline.
    LockTimeout,

    // -- Corruption --
    /// A JSONL line could not be parsed as JSON.
    JsonlUnparseable,
    /// Metadata JSON stored in a row is structurally invalid.
    MetadataCorrupt,

    // -- Fatal --
    /// The installation salt could not be created or read.
    SaltInitFailed,
    /// A SQLite database could not be opened after migration.
    DbOpenFailed,
    /// Catch-all for unexpected internal errors.
    Internal,
}

impl ErrorCode {
    /// Returns the broad [`ErrorCategory`] this code belongs to.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::WorkerUnreachable | Self::RequestTimeout => ErrorCategory::Unavailable,

            Self::ImportRejected | Self::QueryRejected | Self::HttpError => {
                ErrorCategory::ApiError
            }

            Self::SchemaInvalid | Self::NarrativeTooShort | Self::MetadataInvalid => {
                ErrorCategory::ValidationError
            }

            Self::LockTimeout => ErrorCategory::LockContention,

            Self::JsonlUnparseable | Self::MetadataCorrupt => ErrorCategory::Corruption,

            Self::SaltInitFailed | Self::DbOpenFailed | Self::Internal => ErrorCategory::Fatal,
        }
    }

    /// Whether this code is eligible for the exponential-backoff retry
    /// schedule (`Unavailable` only — `ApiError`/`ValidationError` never
    /// retry).
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.category() == ErrorCategory::Unavailable
    }

    /// Stable `&'static str` representation (e.g. `"WORKER_UNREACHABLE"`).
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WorkerUnreachable => "WORKER_UNREACHABLE",
            Self::RequestTimeout => "REQUEST_TIMEOUT",
            Self::ImportRejected => "IMPORT_REJECTED",
            Self::QueryRejected => "QUERY_REJECTED",
            Self::HttpError => "HTTP_ERROR",
            Self::SchemaInvalid => "SCHEMA_INVALID",
            Self::NarrativeTooShort => "NARRATIVE_TOO_SHORT",
            Self::MetadataInvalid => "METADATA_INVALID",
            Self::LockTimeout => "LOCK_TIMEOUT",
            Self::JsonlUnparseable => "JSONL_UNPARSEABLE",
            Self::MetadataCorrupt => "METADATA_CORRUPT",
            Self::SaltInitFailed => "SALT_INIT_FAILED",
            Self::DbOpenFailed => "DB_OPEN_FAILED",
            Self::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unified oc-memory error.
///
/// Carries a stable [`ErrorCode`], a human-readable message, an optional
/// source error for cause-chaining, and arbitrary structured context.
///
/// # Builder usage
///
/// ```
/// use ocmem_error::{ErrorCode, OcError};
///
/// let err = OcError::new(ErrorCode::WorkerUnreachable, "health probe timed out")
///     .with_context("timeout_ms", 2000);
/// ```
pub struct OcError {
    /// Machine-readable error code.
    pub code: ErrorCode,
    /// Human-readable description.
    pub message: String,
    /// Optional underlying cause.
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
    /// Arbitrary structured context for diagnostics.
    pub context: BTreeMap<String, serde_json::Value>,
}

impl OcError {
    /// Create a new error with the given code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            source: None,
            context: BTreeMap::new(),
        }
    }

    /// Attach a key-value pair to the diagnostic context.
    ///
    /// The value is converted via [`serde_json::to_value`]; if serialization
    /// fails, the entry is silently skipped.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    /// Attach an underlying cause.
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Shorthand for `self.code.category()`.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        self.code.category()
    }
}

impl fmt::Debug for OcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("OcError");
        d.field("code", &self.code);
        d.field("message", &self.message);
        if let Some(ref src) = self.source {
            d.field("source", &src.to_string());
        }
        if !self.context.is_empty() {
            d.field("context", &self.context);
        }
        d.finish()
    }
}

impl fmt::Display for OcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code.as_str(), self.message)?;
        if !self.context.is_empty() {
            if let Ok(ctx) = serde_json::to_string(&self.context) {
                write!(f, " {ctx}")?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for OcError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

/// Serializable snapshot of an [`OcError`] (without the opaque source),
/// matching the `{code, message, details?}` envelope the worker HTTP API
/// renders.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OcErrorDto {
    /// Error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
    /// Structured context, rendered as `details` on the wire.
    #[serde(rename = "details", skip_serializing_if = "BTreeMap::is_empty", default)]
    pub context: BTreeMap<String, serde_json::Value>,
    /// String representation of the source error, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_message: Option<String>,
}

impl From<&OcError> for OcErrorDto {
    fn from(err: &OcError) -> Self {
        Self {
            code: err.code,
            message: err.message.clone(),
            context: err.context.clone(),
            source_message: err.source.as_ref().map(|s| s.to_string()),
        }
    }
}

impl From<OcErrorDto> for OcError {
    fn from(dto: OcErrorDto) -> Self {
        Self {
            code: dto.code,
            message: dto.message,
            source: None,
            context: dto.context,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::io;

    const ALL_CODES: &[ErrorCode] = &[
        ErrorCode::WorkerUnreachable,
        ErrorCode::RequestTimeout,
        ErrorCode::ImportRejected,
        ErrorCode::QueryRejected,
        ErrorCode::HttpError,
        ErrorCode::SchemaInvalid,
        ErrorCode::NarrativeTooShort,
        ErrorCode::MetadataInvalid,
        ErrorCode::LockTimeout,
        ErrorCode::JsonlUnparseable,
        ErrorCode::MetadataCorrupt,
        ErrorCode::SaltInitFailed,
        ErrorCode::DbOpenFailed,
        ErrorCode::Internal,
    ];

    #[test]
    fn basic_construction() {
        let err = OcError::new(ErrorCode::Internal, "boom");
        assert_eq!(err.code, ErrorCode::Internal);
        assert_eq!(err.message, "boom");
        assert!(err.source.is_none());
        assert!(err.context.is_empty());
    }

    #[test]
    fn display_without_context() {
        let err = OcError::new(ErrorCode::WorkerUnreachable, "no response");
        assert_eq!(err.to_string(), "[WORKER_UNREACHABLE] no response");
    }

    #[test]
    fn display_with_context() {
        let err = OcError::new(ErrorCode::RequestTimeout, "timed out")
            .with_context("timeout_ms", 5000);
        let s = err.to_string();
        assert!(s.starts_with("[REQUEST_TIMEOUT] timed out"));
        assert!(s.contains("timeout_ms"));
    }

    #[test]
    fn debug_with_source() {
        let src = io::Error::new(io::ErrorKind::NotFound, "file missing");
        let err = OcError::new(ErrorCode::DbOpenFailed, "open failed").with_source(src);
        let dbg = format!("{err:?}");
        assert!(dbg.contains("source"));
        assert!(dbg.contains("file missing"));
    }

    #[test]
    fn only_unavailable_is_retryable() {
        assert!(ErrorCode::WorkerUnreachable.is_retryable());
        assert!(ErrorCode::RequestTimeout.is_retryable());
        assert!(!ErrorCode::ImportRejected.is_retryable());
        assert!(!ErrorCode::SchemaInvalid.is_retryable());
        assert!(!ErrorCode::LockTimeout.is_retryable());
    }

    #[test]
    fn category_mapping_matches_spec_taxonomy() {
        assert_eq!(ErrorCode::WorkerUnreachable.category(), ErrorCategory::Unavailable);
        assert_eq!(ErrorCode::ImportRejected.category(), ErrorCategory::ApiError);
        assert_eq!(ErrorCode::NarrativeTooShort.category(), ErrorCategory::ValidationError);
        assert_eq!(ErrorCode::LockTimeout.category(), ErrorCategory::LockContention);
        assert_eq!(ErrorCode::JsonlUnparseable.category(), ErrorCategory::Corruption);
        assert_eq!(ErrorCode::SaltInitFailed.category(), ErrorCategory::Fatal);
    }

    #[test]
    fn all_codes_have_unique_as_str() {
        let mut seen = HashSet::new();
        for code in ALL_CODES {
            assert!(seen.insert(code.as_str()));
        }
        assert_eq!(seen.len(), ALL_CODES.len());
    }

    #[test]
    fn all_codes_display_matches_as_str() {
        for code in ALL_CODES {
            assert_eq!(code.to_string(), code.as_str());
        }
    }

    #[test]
    fn dto_roundtrip_without_source() {
        let err = OcError::new(ErrorCode::SchemaInvalid, "bad shape").with_context("field", "title");
        let dto: OcErrorDto = (&err).into();
        let json = serde_json::to_string(&dto).unwrap();
        let back: OcErrorDto = serde_json::from_str(&json).unwrap();
        assert_eq!(dto, back);
        assert!(back.source_message.is_none());
    }

    #[test]
    fn dto_omits_empty_details() {
        let err = OcError::new(ErrorCode::Internal, "plain");
        let dto: OcErrorDto = (&err).into();
        let json = serde_json::to_string(&dto).unwrap();
        assert!(!json.contains("details"));
    }

    #[test]
    fn std_error_source_chain() {
        let inner = io::Error::new(io::ErrorKind::NotFound, "not found");
        let err = OcError::new(ErrorCode::DbOpenFailed, "open").with_source(inner);
        let src = std::error::Error::source(&err).unwrap();
        assert_eq!(src.to_string(), "not found");
    }
}
