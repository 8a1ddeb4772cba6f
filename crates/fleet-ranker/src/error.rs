use thiserror::Error;

#[derive(Debug, Error)]
pub enum RankerError {
    #[error("domain error: {0}")]
    Domain(#[from] fleet_domain::DomainError),
}
