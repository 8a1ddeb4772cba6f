mod credentials;
mod sigv4;
mod xml;

pub mod client;
pub mod ec2;
pub mod error;
pub mod local;
pub mod types;

pub use client::CloudApi;
pub use ec2::Ec2CloudClient;
pub use error::CloudError;
pub use local::FakeCloudClient;
