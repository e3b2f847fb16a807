//! Error taxonomy for the runtime orchestration engine.
//!
//! Provisioners, broker phases and exposers never swallow errors; everything
//! propagates to the start/stop synchronizer, which decides between retry,
//! rollback and fatal failure.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Reportable cluster-interaction failure (network, transient API error).
    #[error("Infrastructure error: {message}")]
    Infrastructure { message: String, code: Option<u16> },

    /// Programming or configuration defect. Never retried.
    #[error("Internal infrastructure error: {0}")]
    Internal(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Concurrent-access rejection or a cluster 409.
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Timed out: {0}")]
    Timeout(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn infrastructure(message: impl Into<String>) -> Self {
        Self::Infrastructure {
            message: message.into(),
            code: None,
        }
    }

    /// Transport failures, throttling and server-side errors are worth another attempt.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Infrastructure { code: None, .. } => true,
            Self::Infrastructure {
                code: Some(code), ..
            } => *code == 429 || *code >= 500,
            _ => false,
        }
    }

    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<kube::Error> for Error {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(response) => match response.code {
                404 => Self::NotFound(response.message),
                409 => Self::Conflict(response.message),
                403 => Self::Forbidden(response.message),
                code => Self::Infrastructure {
                    message: format!("{} ({})", response.message, response.reason),
                    code: Some(code),
                },
            },
            other => Self::Infrastructure {
                message: other.to_string(),
                code: None,
            },
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("Serialization error: {err}"))
    }
}

impl From<crate::server::token::TokenError> for Error {
    fn from(err: crate::server::token::TokenError) -> Self {
        Self::Internal(format!("Signing key error: {err}"))
    }
}
