pub mod acquire;
pub mod error;
pub mod hosts;

pub use acquire::{acquire, AcquisitionOutcome};
pub use error::EngineError;
pub use hosts::publish_host_entry;
