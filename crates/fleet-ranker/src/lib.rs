pub mod error;
pub mod pricing;
pub mod rank;

pub use error::RankerError;
pub use pricing::{HttpPricingClient, PricingClient};
pub use rank::rank_instance_types;
