use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Raw JSON representation of the daemon's config file, mirroring the
/// on-disk schema exactly (field names, required-ness) before conversion
/// into the strict domain types.
#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct RawConfig {
    pub log_level: String,
    pub log_file_name: String,
    pub slurm_bin_path: String,
    pub region: String,
    pub slurm_conf: String,
    pub partitions: BTreeMap<String, BTreeMap<String, RawNodegroup>>,
    /// Per-partition pass-through options consumed by the static
    /// `slurm.conf` generator; the daemon itself never interprets these.
    #[serde(default)]
    pub partition_options: BTreeMap<String, BTreeMap<String, serde_json::Value>>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct RawNodegroup {
    pub num_nodes: u32,
    pub purchasing_option: String,
    pub interruption_behavior: String,
    pub allocation_strategy: String,
    pub launch_template_id: String,
    pub subnet_ids: Vec<String>,
    pub instances: Vec<String>,
    pub overrides: Option<serde_json::Value>,
    pub max_hibernation_min: Option<u32>,
}
