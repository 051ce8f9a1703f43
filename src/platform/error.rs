use thiserror::Error;

/// Failure talking to the platform, classified by how callers recover.
#[derive(Debug, Error)]
pub enum PlatformError {
    /// 404: the addressed object no longer exists remotely.
    #[error("not found: {0}")]
    NotFound(String),
    /// 401: the token used is invalid or expired.
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    /// Any other 4xx; retrying the same request will not help.
    #[error("rejected with HTTP {status}: {message}")]
    Rejected { status: u16, message: String },
    /// Timeouts, connection failures, 5xx and 429.
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("unexpected response: {0}")]
    Decode(String),
    /// Missing client id/secret and similar local misconfiguration.
    #[error("platform client misconfigured: {0}")]
    Config(String),
}

impl PlatformError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// 409: the object being created already exists.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Rejected { status: 409, .. })
    }

    pub(crate) fn from_status(status: u16, message: String) -> Self {
        match status {
            404 => Self::NotFound(message),
            401 => Self::Unauthorized(message),
            429 | 500..=599 => Self::Transient(format!("HTTP {status}: {message}")),
            _ => Self::Rejected { status, message },
        }
    }

    pub(crate) fn from_transport(err: &reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            Self::Transient(err.to_string())
        } else if err.is_decode() {
            Self::Decode(err.to_string())
        } else {
            Self::Transient(err.to_string())
        }
    }
}
