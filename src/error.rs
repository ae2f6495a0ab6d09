use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Webhook signature invalid: {0}")]
    SignatureInvalid(String),

    #[error("Credential denied by platform: {0}")]
    CredentialDenied(String),

    #[error("Upstream transient failure: {0}")]
    UpstreamTransient(String),

    #[error("Upstream permanent failure: {0}")]
    UpstreamPermanent(String),

    #[error("Generative model failure: {0}")]
    ModelFailure(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Chat delivery failure: {0}")]
    ChatDelivery(String),

    #[error("Store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Whether the queue should retry a job that failed with this error.
    ///
    /// Only transient upstream conditions warrant a retry; everything else
    /// either cannot succeed on replay (`NotFound`, `CredentialDenied`) or is
    /// surfaced through PR state instead (`ModelFailure`).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::UpstreamTransient(_) | AppError::Store(_) | AppError::Io(_)
        )
    }
}

impl From<octocrab::Error> for AppError {
    fn from(e: octocrab::Error) -> Self {
        match &e {
            octocrab::Error::GitHub { source, .. } => {
                let status = source.status_code.as_u16();
                match status {
                    401 | 403 | 404 => AppError::CredentialDenied(source.message.clone()),
                    500..=599 => AppError::UpstreamTransient(source.message.clone()),
                    _ => AppError::UpstreamPermanent(source.message.clone()),
                }
            }
            // A response that arrived but does not deserialize will not get
            // better on replay.
            octocrab::Error::Serde { source, .. } => {
                AppError::UpstreamPermanent(format!("Malformed platform response: {source}"))
            }
            octocrab::Error::Json { source, .. } => {
                AppError::UpstreamPermanent(format!("Malformed platform response: {source}"))
            }
            _ => AppError::UpstreamTransient(e.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_are_retryable() {
        assert!(AppError::UpstreamTransient("502".into()).is_retryable());
    }

    #[test]
    fn business_outcomes_are_not_retryable() {
        assert!(!AppError::NotFound("pr gone".into()).is_retryable());
        assert!(!AppError::CredentialDenied("bad app id".into()).is_retryable());
        assert!(!AppError::ModelFailure("empty tldr".into()).is_retryable());
        assert!(!AppError::UpstreamPermanent("422".into()).is_retryable());
    }
}
