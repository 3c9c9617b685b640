use thiserror::Error;

pub type BackendResult<T> = Result<T, BackendError>;

/// Failure of a single restvirt REST call.
///
/// Not-found and conflict are split out so callers can turn duplicate
/// deletes and attaches into successes.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("restvirt returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("request to restvirt failed: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("failed to decode restvirt response: {0}")]
    Decode(String),

    #[error("invalid restvirt endpoint: {0}")]
    InvalidEndpoint(String),
}

impl BackendError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}
