//! Typed error taxonomy for the scan engine
//!
//! Every failure the engine can surface carries a stable kebab-case code,
//! a human-readable message, and optional structured details. Codes are
//! part of the public contract; messages are not.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable error codes surfaced by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    // Input errors: synchronous, never a scan failure
    InvalidUrl,
    UnsupportedUrl,

    // Admission errors
    AdmissionRejected,

    // Acquisition errors
    RepositoryNotFound,
    RepositoryAccessDenied,
    RepositoryTimeout,
    NetworkError,
    RepositoryTooLarge,
    RepositoryAccessError,

    // Operational errors
    CloneFailed,
    FileReadError,
    ScanTimeout,
    Cancelled,

    // Resource errors
    ResourceLimitExceeded,
    TooManyStreams,
    MemoryCritical,
    EmergencyMode,

    // Internal errors: degrade behavior, never surfaced directly
    DeduplicationFailed,
    RetryExhausted,
    CircuitOpen,

    // Lookup
    NotFound,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidUrl => "invalid-url",
            ErrorCode::UnsupportedUrl => "unsupported-url",
            ErrorCode::AdmissionRejected => "admission-rejected",
            ErrorCode::RepositoryNotFound => "repository-not-found",
            ErrorCode::RepositoryAccessDenied => "repository-access-denied",
            ErrorCode::RepositoryTimeout => "repository-timeout",
            ErrorCode::NetworkError => "network-error",
            ErrorCode::RepositoryTooLarge => "repository-too-large",
            ErrorCode::RepositoryAccessError => "repository-access-error",
            ErrorCode::CloneFailed => "clone-failed",
            ErrorCode::FileReadError => "file-read-error",
            ErrorCode::ScanTimeout => "scan-timeout",
            ErrorCode::Cancelled => "cancelled",
            ErrorCode::ResourceLimitExceeded => "resource-limit-exceeded",
            ErrorCode::TooManyStreams => "too-many-streams",
            ErrorCode::MemoryCritical => "memory-critical",
            ErrorCode::EmergencyMode => "emergency-mode",
            ErrorCode::DeduplicationFailed => "deduplication-failed",
            ErrorCode::RetryExhausted => "retry-exhausted",
            ErrorCode::CircuitOpen => "circuit-open",
            ErrorCode::NotFound => "not-found",
        }
    }

    /// Whether an error with this code warrants a retry with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::NetworkError | ErrorCode::RepositoryTimeout | ErrorCode::TooManyStreams
        )
    }

    /// Failures that must halt the remaining phases of a scan.
    pub fn halts_scan(&self) -> bool {
        matches!(
            self,
            ErrorCode::ResourceLimitExceeded
                | ErrorCode::MemoryCritical
                | ErrorCode::EmergencyMode
                | ErrorCode::Cancelled
                | ErrorCode::ScanTimeout
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sub-reasons attached to `admission-rejected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AdmissionReason {
    DiskBudgetExhausted,
    ConcurrentScanCap,
    EmergencyMode,
}

impl AdmissionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdmissionReason::DiskBudgetExhausted => "disk-budget-exhausted",
            AdmissionReason::ConcurrentScanCap => "concurrent-scan-cap",
            AdmissionReason::EmergencyMode => "emergency-mode",
        }
    }
}

/// A structured engine error: stable code, human message, detail payload.
///
/// Details never include secret values from scanned content; the original
/// cause is retained for diagnostics only.
#[derive(Debug, thiserror::Error)]
#[error("{code}: {message}")]
pub struct ScanError {
    pub code: ErrorCode,
    pub message: String,
    pub details: serde_json::Value,
    #[source]
    source: Option<anyhow::Error>,
}

impl ScanError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: serde_json::Value::Null,
            source: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    pub fn with_source(mut self, source: impl Into<anyhow::Error>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn admission(reason: AdmissionReason, message: impl Into<String>) -> Self {
        Self::new(ErrorCode::AdmissionRejected, message)
            .with_details(serde_json::json!({ "reason": reason.as_str() }))
    }

    pub fn not_found(scan_id: uuid::Uuid) -> Self {
        Self::new(ErrorCode::NotFound, format!("unknown scan {scan_id}"))
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorCode::Cancelled, "scan cancelled")
    }

    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }
}

pub type ScanResult<T> = std::result::Result<T, ScanError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_kebab_case() {
        assert_eq!(ErrorCode::UnsupportedUrl.as_str(), "unsupported-url");
        assert_eq!(ErrorCode::RepositoryTooLarge.as_str(), "repository-too-large");
        assert_eq!(
            serde_json::to_value(ErrorCode::TooManyStreams).unwrap(),
            serde_json::json!("too-many-streams")
        );
    }

    #[test]
    fn admission_error_carries_reason() {
        let err = ScanError::admission(AdmissionReason::ConcurrentScanCap, "at capacity");
        assert_eq!(err.code, ErrorCode::AdmissionRejected);
        assert_eq!(err.details["reason"], "concurrent-scan-cap");
    }

    #[test]
    fn retryable_classification() {
        assert!(ErrorCode::NetworkError.is_retryable());
        assert!(!ErrorCode::RepositoryNotFound.is_retryable());
        assert!(ErrorCode::Cancelled.halts_scan());
        assert!(!ErrorCode::FileReadError.halts_scan());
    }
}
