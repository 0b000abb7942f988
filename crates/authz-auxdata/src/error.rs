//! Error types for auxiliary data extraction
//!
//! Two layers of errors exist:
//!
//! - [`KeyError`] is produced while turning configured or fetched bytes into
//!   key material. Local keysets capture it at construction and hand out a
//!   clone on every resolution, so it must be `Clone`.
//! - [`AuxDataError`] is what a single `extract` call returns. Every variant
//!   belongs to exactly one stage of the extraction pipeline (see
//!   [`AuxDataError::stage`]).
//!
//! Build-time configuration problems use [`crate::config::ConfigError`].

use thiserror::Error;

/// Result type for extraction operations
pub type Result<T> = std::result::Result<T, AuxDataError>;

/// Failure to obtain usable key material from raw bytes
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("failed to apply base64 decoder to key data: {0}")]
    Decode(String),

    #[error("failed to read keyset from '{path}': {message}")]
    Read { path: String, message: String },

    #[error("failed to parse key data: {0}")]
    Parse(String),

    #[error("key data contains no usable verification key")]
    Empty,
}

/// Errors returned by a single extraction call
#[derive(Error, Debug, Clone)]
pub enum AuxDataError {
    /// A local keyset was misconfigured; the construction error is replayed
    #[error("keyset configuration error: {0}")]
    Config(#[from] KeyError),

    #[error("cannot determine keyset to use for validating the JWT")]
    NoKeySetToVerify,

    #[error("keyset not found: {0}")]
    KeySetNotFound(String),

    #[error("failed to retrieve keyset from {url}: {message}")]
    KeySetFetch { url: String, message: String },

    #[error("request cancelled")]
    Cancelled,

    #[error("request deadline exceeded")]
    DeadlineExceeded,

    #[error("failed to parse JWT: {0}")]
    TokenParse(String),

    #[error("JWT validation failed: {0}")]
    TokenValidation(String),
}

/// Pipeline stage an [`AuxDataError`] originated from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Selecting and resolving the keyset
    KeySetResolution,
    /// Structural decoding of the token
    Parse,
    /// Signature and time-claim checks
    Validation,
}

impl AuxDataError {
    /// Stable label for logging and metrics
    pub fn category(&self) -> &'static str {
        match self {
            AuxDataError::Config(_) => "keyset_config",
            AuxDataError::NoKeySetToVerify => "no_keyset_to_verify",
            AuxDataError::KeySetNotFound(_) => "keyset_not_found",
            AuxDataError::KeySetFetch { .. } => "keyset_fetch",
            AuxDataError::Cancelled => "cancelled",
            AuxDataError::DeadlineExceeded => "deadline_exceeded",
            AuxDataError::TokenParse(_) => "token_parse",
            AuxDataError::TokenValidation(_) => "token_validation",
        }
    }

    /// The stage of the extraction that failed
    pub fn stage(&self) -> Stage {
        match self {
            AuxDataError::Config(_)
            | AuxDataError::NoKeySetToVerify
            | AuxDataError::KeySetNotFound(_)
            | AuxDataError::KeySetFetch { .. }
            | AuxDataError::Cancelled
            | AuxDataError::DeadlineExceeded => Stage::KeySetResolution,
            AuxDataError::TokenParse(_) => Stage::Parse,
            AuxDataError::TokenValidation(_) => Stage::Validation,
        }
    }

    /// True when the caller's context, not the token or keyset, ended the call
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            AuxDataError::Cancelled | AuxDataError::DeadlineExceeded
        )
    }

    pub(crate) fn fetch(url: &str, message: impl Into<String>) -> Self {
        AuxDataError::KeySetFetch {
            url: url.to_string(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categorization() {
        let err = AuxDataError::KeySetNotFound("ks9".to_string());
        assert_eq!(err.category(), "keyset_not_found");
        assert_eq!(err.stage(), Stage::KeySetResolution);
        assert!(!err.is_cancellation());

        let err = AuxDataError::TokenValidation("token expired".to_string());
        assert_eq!(err.category(), "token_validation");
        assert_eq!(err.stage(), Stage::Validation);

        assert!(AuxDataError::DeadlineExceeded.is_cancellation());
        assert!(AuxDataError::Cancelled.is_cancellation());
    }

    #[test]
    fn test_error_display() {
        let err = AuxDataError::KeySetNotFound("ks9".to_string());
        assert_eq!(err.to_string(), "keyset not found: ks9");

        let err = AuxDataError::from(KeyError::Read {
            path: "/missing.pem".to_string(),
            message: "No such file or directory".to_string(),
        });
        assert_eq!(
            err.to_string(),
            "keyset configuration error: failed to read keyset from '/missing.pem': No such file or directory"
        );
        assert_eq!(err.category(), "keyset_config");
    }
}
