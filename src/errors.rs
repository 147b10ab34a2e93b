//! Storage error taxonomy.
//!
//! Every variant maps to a stable error code string so callers (an admin
//! UI, the CLI) can branch on the kind of failure without matching on
//! message text.  Listing operations never surface these to the caller;
//! uploads and presigning do.

use thiserror::Error;

/// Errors raised by the storage core.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Credentials, endpoint or bucket are missing or invalid.
    #[error("S3 storage is not configured: {0}")]
    NotConfigured(String),

    /// Network, TLS or timeout failure talking to the endpoint.
    #[error("Could not reach the storage endpoint: {0}")]
    Connection(String),

    /// Both SigV4 and the legacy signature were rejected.
    #[error("The storage endpoint rejected every supported authentication method")]
    AuthFailure,

    /// The endpoint answered with a body we could not parse.
    #[error("Malformed response from the storage endpoint: {0}")]
    Parse(String),

    /// A PUT returned a non-2xx status or the local file was unreadable.
    #[error("Upload failed: {message}")]
    UploadFailed {
        /// HTTP status of the rejected PUT, if one was received.
        status: Option<u16>,
        message: String,
    },

    /// Input rejected before any network call was attempted.
    #[error("{0}")]
    Validation(String),
}

impl StorageError {
    /// Return the stable error code string.
    pub fn code(&self) -> &'static str {
        match self {
            StorageError::NotConfigured(_) => "NotConfigured",
            StorageError::Connection(_) => "ConnectionError",
            StorageError::AuthFailure => "AuthFailure",
            StorageError::Parse(_) => "ParseError",
            StorageError::UploadFailed { .. } => "UploadFailed",
            StorageError::Validation(_) => "ValidationError",
        }
    }

    /// Whether a user-initiated retry could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::Connection(_))
    }

    pub(crate) fn upload(status: Option<u16>, message: impl Into<String>) -> Self {
        StorageError::UploadFailed {
            status,
            message: message.into(),
        }
    }
}

impl From<reqwest::Error> for StorageError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            StorageError::Connection(format!("request timed out: {err}"))
        } else {
            StorageError::Connection(err.to_string())
        }
    }
}

impl From<quick_xml::Error> for StorageError {
    fn from(err: quick_xml::Error) -> Self {
        StorageError::Parse(format!("XML parse error: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(StorageError::NotConfigured("x".into()).code(), "NotConfigured");
        assert_eq!(StorageError::Connection("x".into()).code(), "ConnectionError");
        assert_eq!(StorageError::AuthFailure.code(), "AuthFailure");
        assert_eq!(StorageError::Parse("x".into()).code(), "ParseError");
        assert_eq!(StorageError::upload(Some(403), "x").code(), "UploadFailed");
        assert_eq!(StorageError::Validation("x".into()).code(), "ValidationError");
    }

    #[test]
    fn test_only_connection_errors_are_retryable() {
        assert!(StorageError::Connection("reset".into()).is_retryable());
        assert!(!StorageError::AuthFailure.is_retryable());
        assert!(!StorageError::upload(Some(500), "boom").is_retryable());
        assert!(!StorageError::Validation("too big".into()).is_retryable());
    }

    #[test]
    fn test_upload_failed_message_carries_detail() {
        let err = StorageError::upload(Some(403), "status 403 Forbidden");
        assert_eq!(err.to_string(), "Upload failed: status 403 Forbidden");
        match err {
            StorageError::UploadFailed { status, .. } => assert_eq!(status, Some(403)),
            other => panic!("unexpected variant: {other:?}"),
        }
    }
}
