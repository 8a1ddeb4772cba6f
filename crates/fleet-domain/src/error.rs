use thiserror::Error;

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("unknown node state: {0}")]
    UnknownNodeState(String),

    #[error("malformed comment: {0}")]
    MalformedComment(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
