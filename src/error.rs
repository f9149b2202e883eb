//! Error types for lfs-migrate operations.

use thiserror::Error;

/// Result type for lfs-migrate operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while migrating LFS objects.
#[derive(Error, Debug)]
pub enum Error {
    /// Pointer text is not a well-formed LFS pointer
    #[error("malformed LFS pointer: {0}")]
    MalformedPointer(String),

    /// Pointer declares a version we do not understand
    #[error("unsupported LFS pointer version: {0}")]
    UnsupportedPointerVersion(String),

    /// OID parsing error
    #[error("invalid OID: {0}")]
    InvalidOid(String),

    /// Endpoint refused our credentials
    #[error("authentication failed for {endpoint}")]
    Auth { endpoint: String },

    /// Object is absent at the endpoint
    #[error("object not found: {0}")]
    ObjectNotFound(String),

    /// Downloaded bytes do not hash to the claimed oid
    #[error("integrity mismatch for {oid}: got {actual_oid} ({actual_size} bytes, expected {expected_size})")]
    IntegrityMismatch {
        oid: String,
        actual_oid: String,
        expected_size: u64,
        actual_size: u64,
    },

    /// Retries exhausted
    #[error("transfer of {oid} failed after {attempts} attempts: {last_error}")]
    TransferFailed {
        oid: String,
        attempts: u32,
        last_error: String,
    },

    /// Source branch or tree could not be read
    #[error("cannot read repository: {0}")]
    RepositoryRead(String),

    /// Signed transfer URL was refused or expired
    #[error("transfer action expired or was refused (HTTP {0})")]
    ActionExpired(u16),

    /// HTTP transport failure
    #[error("HTTP error: {0}")]
    Http(String),

    /// Server returned an error
    #[error("LFS server error: {message} (code: {code})")]
    Server { code: u16, message: String },

    /// Caller broke a request precondition
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Invalid URL
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    /// Configuration could not be used
    #[error("configuration error: {0}")]
    Config(String),

    /// Run was cancelled
    #[error("cancelled")]
    Cancelled,

    /// Git operation error
    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// URL parsing error
    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),
}

impl Error {
    /// Whether the transfer pipeline may try again after this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Http(_) | Error::Io(_) | Error::ActionExpired(_) => true,
            Error::Server { code, .. } => *code >= 500 || *code == 429 || *code == 408,
            _ => false,
        }
    }

    /// Whether the error ends the whole repository run rather than one object.
    pub fn is_repository_fatal(&self) -> bool {
        matches!(
            self,
            Error::Auth { .. } | Error::RepositoryRead(_) | Error::Cancelled | Error::Config(_)
        )
    }

    /// Short machine-friendly label used in reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::MalformedPointer(_) => "malformed_pointer",
            Error::UnsupportedPointerVersion(_) => "unsupported_pointer_version",
            Error::InvalidOid(_) => "invalid_oid",
            Error::Auth { .. } => "auth_error",
            Error::ObjectNotFound(_) => "object_not_found",
            Error::IntegrityMismatch { .. } => "integrity_mismatch",
            Error::TransferFailed { .. } => "transfer_failed",
            Error::RepositoryRead(_) => "repository_read_error",
            Error::ActionExpired(_) => "action_expired",
            Error::Http(_) => "http",
            Error::Server { .. } => "server",
            Error::InvalidRequest(_) => "invalid_request",
            Error::InvalidUrl(_) | Error::UrlParse(_) => "invalid_url",
            Error::Config(_) => "config",
            Error::Cancelled => "cancelled",
            Error::Git(_) => "git",
            Error::Io(_) => "io",
            Error::Json(_) => "json",
        }
    }
}

impl From<ureq::Error> for Error {
    fn from(err: ureq::Error) -> Self {
        match err {
            ureq::Error::Status(404, _) => Error::ObjectNotFound("object not found".into()),
            ureq::Error::Status(code, response) => {
                let message = response
                    .into_string()
                    .unwrap_or_else(|_| "unknown error".into());
                Error::Server { code, message }
            }
            other => Error::Http(other.to_string()),
        }
    }
}
