pub mod client;
pub mod error;
pub mod local;
pub mod parse;

pub use client::{SchedulerClient, SlurmScheduler, UPDATE_PARAM_KEYS};
pub use error::SchedulerError;
pub use parse::parse_show_nodes;
