//! Unified storage error model and mapping helpers.
//! Every public operation of the engine returns `Result<T>`; the protocol layer maps the
//! variants to wire status codes through `http_status`.

use thiserror::Error;

use crate::metadata::AttrError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("already_exists: {0}")]
    AlreadyExists(String),
    #[error("permission_denied: {0}")]
    PermissionDenied(String),
    /// An explicit deny grant matched the caller.
    #[error("access_denied: {0}")]
    AccessDenied(String),
    #[error("aborted: {0}")]
    Aborted(String),
    #[error("checksum_mismatch: {0}")]
    ChecksumMismatch(String),
    #[error("insufficient_storage: {0}")]
    InsufficientStorage(String),
    #[error("invalid_argument: {0}")]
    InvalidArgument(String),
    #[error("locked: {0}")]
    Locked(String),
    #[error("not_supported: {0}")]
    NotSupported(String),
    #[error("internal: {0}")]
    Internal(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn code_str(&self) -> &'static str {
        match self {
            Error::NotFound(_) => "not_found",
            Error::AlreadyExists(_) => "already_exists",
            Error::PermissionDenied(_) => "permission_denied",
            Error::AccessDenied(_) => "access_denied",
            Error::Aborted(_) => "aborted",
            Error::ChecksumMismatch(_) => "checksum_mismatch",
            Error::InsufficientStorage(_) => "insufficient_storage",
            Error::InvalidArgument(_) => "invalid_argument",
            Error::Locked(_) => "locked",
            Error::NotSupported(_) => "not_supported",
            Error::Internal(_) => "internal",
            Error::Io(_) => "io",
        }
    }

    pub fn message(&self) -> String {
        match self {
            Error::NotFound(m)
            | Error::AlreadyExists(m)
            | Error::PermissionDenied(m)
            | Error::AccessDenied(m)
            | Error::Aborted(m)
            | Error::ChecksumMismatch(m)
            | Error::InsufficientStorage(m)
            | Error::InvalidArgument(m)
            | Error::Locked(m)
            | Error::NotSupported(m)
            | Error::Internal(m) => m.clone(),
            Error::Io(e) => e.to_string(),
        }
    }

    pub fn not_found<S: Into<String>>(msg: S) -> Self { Error::NotFound(msg.into()) }
    pub fn already_exists<S: Into<String>>(msg: S) -> Self { Error::AlreadyExists(msg.into()) }
    pub fn permission_denied<S: Into<String>>(msg: S) -> Self { Error::PermissionDenied(msg.into()) }
    pub fn access_denied<S: Into<String>>(msg: S) -> Self { Error::AccessDenied(msg.into()) }
    pub fn aborted<S: Into<String>>(msg: S) -> Self { Error::Aborted(msg.into()) }
    pub fn checksum_mismatch<S: Into<String>>(msg: S) -> Self { Error::ChecksumMismatch(msg.into()) }
    pub fn insufficient_storage<S: Into<String>>(msg: S) -> Self { Error::InsufficientStorage(msg.into()) }
    pub fn invalid<S: Into<String>>(msg: S) -> Self { Error::InvalidArgument(msg.into()) }
    pub fn locked<S: Into<String>>(msg: S) -> Self { Error::Locked(msg.into()) }
    pub fn not_supported<S: Into<String>>(msg: S) -> Self { Error::NotSupported(msg.into()) }
    pub fn internal<S: Into<String>>(msg: S) -> Self { Error::Internal(msg.into()) }

    pub fn is_not_found(&self) -> bool { matches!(self, Error::NotFound(_)) }
    pub fn is_already_exists(&self) -> bool { matches!(self, Error::AlreadyExists(_)) }

    /// Map to HTTP status code.
    pub fn http_status(&self) -> u16 {
        match self {
            Error::NotFound(_) => 404,
            Error::AlreadyExists(_) => 409,
            Error::PermissionDenied(_) | Error::AccessDenied(_) => 403,
            Error::Aborted(_) | Error::ChecksumMismatch(_) => 412,
            Error::InsufficientStorage(_) => 507,
            Error::InvalidArgument(_) => 400,
            Error::Locked(_) => 423,
            Error::NotSupported(_) => 502,
            Error::Internal(_) | Error::Io(_) => 500,
        }
    }
}

impl From<AttrError> for Error {
    fn from(err: AttrError) -> Self {
        match err {
            AttrError::NotExist(p) => Error::NotFound(p),
            AttrError::AttrUnset { path, key } => Error::NotFound(format!("attribute {} not set on {}", key, path)),
            AttrError::NotDir(p) => Error::NotFound(format!("not a directory: {}", p)),
            AttrError::LockTimeout(p) => Error::Locked(format!("timed out waiting for lock on {}", p)),
            AttrError::Corrupt { path, reason } => Error::Internal(format!("corrupt attribute record {}: {}", path, reason)),
            AttrError::Io(e) => Error::Io(e),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Internal(format!("json: {}", err))
    }
}
