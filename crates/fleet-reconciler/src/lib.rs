pub mod error;
pub mod report;
pub mod state_machine;
pub mod sweep;
pub mod transplant;

pub use error::ReconcileError;
pub use report::SweepReport;
pub use sweep::sweep;
