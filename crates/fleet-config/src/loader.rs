use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use fleet_domain::{
    AllocationStrategy, InterruptionBehavior, Nodegroup, NodegroupName, PartitionName,
    PurchasingOption,
};
use tracing::debug;

use crate::error::ConfigError;
use crate::raw::{RawConfig, RawNodegroup};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DEBUG" => Ok(LogLevel::Debug),
            "INFO" => Ok(LogLevel::Info),
            "WARNING" => Ok(LogLevel::Warning),
            "ERROR" => Ok(LogLevel::Error),
            "CRITICAL" => Ok(LogLevel::Critical),
            other => Err(format!("invalid log level '{other}'")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: LogLevel,
    pub log_file_name: PathBuf,
    /// Always ends with `/`, matching the scheduler CLI's path joining.
    pub slurm_bin_path: PathBuf,
    pub region: String,
    pub slurm_conf: PathBuf,
    pub nodegroups: Vec<Nodegroup>,
    pub partition_options: BTreeMap<String, BTreeMap<String, serde_json::Value>>,
}

impl Config {
    pub fn nodegroups_in(&self, partition: &PartitionName) -> impl Iterator<Item = &Nodegroup> {
        self.nodegroups
            .iter()
            .filter(move |ng| &ng.partition_name == partition)
    }

    pub fn partitions(&self) -> Vec<PartitionName> {
        let mut seen = Vec::new();
        for ng in &self.nodegroups {
            if !seen.contains(&ng.partition_name) {
                seen.push(ng.partition_name.clone());
            }
        }
        seen
    }
}

pub fn load(path: &Path) -> Result<Config, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.display().to_string(),
        source: e,
    })?;
    let raw: RawConfig = serde_json::from_str(&content).map_err(|e| ConfigError::JsonParse {
        path: path.display().to_string(),
        source: e,
    })?;
    debug!(path = %path.display(), "loaded raw config");
    convert(raw, path)
}

fn convert(raw: RawConfig, path: &Path) -> Result<Config, ConfigError> {
    let log_level = raw.log_level.parse::<LogLevel>().map_err(|message| {
        ConfigError::Validation {
            path: path.display().to_string(),
            message,
        }
    })?;

    let mut slurm_bin_path = raw.slurm_bin_path;
    if !slurm_bin_path.ends_with('/') {
        slurm_bin_path.push('/');
    }

    let mut nodegroups = Vec::new();
    for (partition_name, ngs) in raw.partitions {
        for (nodegroup_name, raw_ng) in ngs {
            let ng = convert_nodegroup(&partition_name, &nodegroup_name, raw_ng, path)?;
            ng.validate().map_err(|e| ConfigError::Validation {
                path: path.display().to_string(),
                message: e.to_string(),
            })?;
            nodegroups.push(ng);
        }
    }

    Ok(Config {
        log_level,
        log_file_name: PathBuf::from(raw.log_file_name),
        slurm_bin_path: PathBuf::from(slurm_bin_path),
        region: raw.region,
        slurm_conf: PathBuf::from(raw.slurm_conf),
        nodegroups,
        partition_options: raw.partition_options,
    })
}

fn convert_nodegroup(
    partition_name: &str,
    nodegroup_name: &str,
    raw: RawNodegroup,
    path: &Path,
) -> Result<Nodegroup, ConfigError> {
    let purchasing_option = parse_purchasing_option(&raw.purchasing_option, path)?;
    let interruption_behavior = parse_interruption_behavior(&raw.interruption_behavior, path)?;
    let allocation_strategy = parse_allocation_strategy(&raw.allocation_strategy, path)?;

    if raw.subnet_ids.is_empty() {
        return Err(ConfigError::Validation {
            path: path.display().to_string(),
            message: format!("nodegroup {partition_name}/{nodegroup_name} has empty SubnetIds"),
        });
    }
    if raw.instances.is_empty() {
        return Err(ConfigError::Validation {
            path: path.display().to_string(),
            message: format!("nodegroup {partition_name}/{nodegroup_name} has empty Instances"),
        });
    }

    Ok(Nodegroup {
        partition_name: PartitionName::new(partition_name),
        nodegroup_name: NodegroupName::new(nodegroup_name),
        num_nodes: raw.num_nodes,
        purchasing_option,
        interruption_behavior,
        allocation_strategy,
        launch_template_id: raw.launch_template_id,
        subnet_ids: raw.subnet_ids,
        instances: raw.instances,
        overrides: raw.overrides,
        max_hibernation_min: raw.max_hibernation_min,
    })
}

fn parse_purchasing_option(s: &str, path: &Path) -> Result<PurchasingOption, ConfigError> {
    match s {
        "spot" => Ok(PurchasingOption::Spot),
        "on-demand" => Ok(PurchasingOption::OnDemand),
        other => Err(ConfigError::Validation {
            path: path.display().to_string(),
            message: format!("unknown PurchasingOption '{other}'"),
        }),
    }
}

fn parse_interruption_behavior(s: &str, path: &Path) -> Result<InterruptionBehavior, ConfigError> {
    match s {
        "terminate" => Ok(InterruptionBehavior::Terminate),
        "stop" => Ok(InterruptionBehavior::Stop),
        "hibernate" => Ok(InterruptionBehavior::Hibernate),
        other => Err(ConfigError::Validation {
            path: path.display().to_string(),
            message: format!("unknown InterruptionBehavior '{other}'"),
        }),
    }
}

fn parse_allocation_strategy(s: &str, path: &Path) -> Result<AllocationStrategy, ConfigError> {
    match s {
        "rank" => Ok(AllocationStrategy::Rank),
        "lowest-price" => Ok(AllocationStrategy::LowestPrice),
        "capacity-optimized" => Ok(AllocationStrategy::CapacityOptimized),
        "price-capacity-optimized" => Ok(AllocationStrategy::PriceCapacityOptimized),
        other => Err(ConfigError::Validation {
            path: path.display().to_string(),
            message: format!("unknown AllocationStrategy '{other}'"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_json() -> &'static str {
        r#"{
            "LogLevel": "INFO",
            "LogFileName": "/var/log/fleetd.log",
            "SlurmBinPath": "/usr/bin",
            "Region": "us-east-1",
            "SlurmConf": "/etc/slurm/slurm.conf",
            "Partitions": {
                "p1": {
                    "ng1": {
                        "NumNodes": 4,
                        "PurchasingOption": "spot",
                        "InterruptionBehavior": "stop",
                        "AllocationStrategy": "lowest-price",
                        "LaunchTemplateId": "lt-0123",
                        "SubnetIds": ["s-a", "s-b"],
                        "Instances": ["m5.large", "m5.xlarge"]
                    }
                }
            },
            "PartitionOptions": {
                "p1": {"MaxTime": "INFINITE"}
            }
        }"#
    }

    #[test]
    fn loads_and_normalizes_bin_path() {
        let raw: RawConfig = serde_json::from_str(sample_json()).unwrap();
        let cfg = convert(raw, Path::new("config.json")).unwrap();
        assert_eq!(cfg.slurm_bin_path, PathBuf::from("/usr/bin/"));
        assert_eq!(cfg.nodegroups.len(), 1);
        assert_eq!(cfg.nodegroups[0].subnet_ids, vec!["s-a", "s-b"]);
    }

    #[test]
    fn rejects_spot_with_terminate() {
        let json = sample_json().replace("\"stop\"", "\"terminate\"");
        let raw: RawConfig = serde_json::from_str(&json).unwrap();
        assert!(convert(raw, Path::new("config.json")).is_err());
    }

    #[test]
    fn rejects_unknown_allocation_strategy() {
        let json = sample_json().replace("lowest-price", "bogus");
        let raw: RawConfig = serde_json::from_str(&json).unwrap();
        assert!(convert(raw, Path::new("config.json")).is_err());
    }
}
