pub mod error;
pub mod types;

pub use error::DomainError;
pub use types::*;
