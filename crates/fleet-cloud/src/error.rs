use thiserror::Error;

#[derive(Debug, Error)]
pub enum CloudError {
    #[error("credentials error: {0}")]
    Credentials(String),

    #[error("request failed: {0}")]
    Request(String),

    #[error("{action}: {code} — {message}")]
    Api {
        action: String,
        code: String,
        message: String,
    },

    #[error("response parse error: {0}")]
    Parse(String),

    #[error("domain error: {0}")]
    Domain(#[from] fleet_domain::DomainError),
}
