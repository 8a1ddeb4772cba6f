//! Request/response shapes for the EC2 operations this crate wraps.
//!
//! These are deliberately narrower than the full EC2 API: only the fields
//! the acquisition engine and reconciler actually consume.

#[derive(Debug, Clone, Default)]
pub struct MarketOptions {
    /// Always `"persistent"` for nodegroup-managed spot capacity.
    pub spot_instance_type: String,
    pub instance_interruption_behavior: String,
}

#[derive(Debug, Clone)]
pub struct NetworkInterfaceSpec {
    pub device_index: u32,
    pub network_interface_id: String,
}

#[derive(Debug, Clone)]
pub struct TagSpec {
    pub resource_type: String,
    pub tags: Vec<(String, String)>,
}

#[derive(Debug, Clone, Default)]
pub struct RunInstancesSpec {
    pub launch_template_id: Option<String>,
    pub instance_type: String,
    pub subnet_id: Option<String>,
    pub market_options: Option<MarketOptions>,
    pub network_interfaces: Vec<NetworkInterfaceSpec>,
    pub hibernation_configured: bool,
    pub tag_specifications: Vec<TagSpec>,
    /// Raw `Key=Value` EC2 API parameters layered on top, used to apply a
    /// nodegroup's `overrides` passthrough without a bespoke field per key.
    pub extra_params: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct RunInstancesResult {
    pub instance_id: String,
    pub private_ip: Option<String>,
    pub spot_instance_request_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct InstanceStatusSummary {
    pub instance_id: String,
    pub reachability_passed: bool,
}

/// Subset of `RequestLaunchTemplateData` the transplant workflow reuses
/// when it materializes a new launch spec from an existing node's template.
#[derive(Debug, Clone, Default)]
pub struct LaunchTemplateVersion {
    pub image_id: Option<String>,
    pub key_name: Option<String>,
    pub instance_type: Option<String>,
    /// Any other captured `(field, value)` pair. `SecurityGroupIds` and
    /// `UserData` are intentionally never captured here.
    pub extra_params: Vec<(String, String)>,
}
