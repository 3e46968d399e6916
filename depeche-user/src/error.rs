use thiserror::Error;

/// Error kinds that cross component boundaries.
///
/// The protocol layers translate these into response codes
/// (`NO [NONEXISTENT]`, `NO [ALREADYEXISTS]`, ...), the workers decide
/// between retrying and giving up based on `is_transient`.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("authentication failed")]
    AuthFailed,

    #[error("not allowed: {0}")]
    Permission(String),

    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("transient i/o error: {0}")]
    TransientIo(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("operation cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn already_exists(what: impl Into<String>) -> Self {
        Self::AlreadyExists(what.into())
    }

    pub fn permission(what: impl Into<String>) -> Self {
        Self::Permission(what.into())
    }

    pub fn malformed(what: impl std::fmt::Display) -> Self {
        Self::MalformedMessage(what.to_string())
    }

    pub fn transient(source: impl std::fmt::Display) -> Self {
        Self::TransientIo(source.to_string())
    }

    pub fn internal(source: impl std::fmt::Display) -> Self {
        Self::Internal(source.to_string())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientIo(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound("file".into()),
            _ => Self::TransientIo(e.to_string()),
        }
    }
}
