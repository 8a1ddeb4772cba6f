use std::path::Path;
use std::time::Duration;

use fleet_cloud::types::{MarketOptions, RunInstancesResult, RunInstancesSpec, TagSpec};
use fleet_cloud::CloudApi;
use fleet_domain::{InterruptionBehavior, Node, NodeComment, Nodegroup, PurchasingOption, WEIGHT_LOCKED};
use fleet_scheduler::SchedulerClient;
use tracing::warn;

use crate::error::EngineError;
use crate::hosts::publish_host_entry;

const RATE_LIMIT_SLEEP: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquisitionOutcome {
    Acquired {
        instance_id: String,
        spot_id: Option<String>,
        ip: String,
    },
    /// All (type, subnet) combinations failed, spot and (if applicable)
    /// on-demand fallback both exhausted. The node stays `POWERING_UP`.
    Exhausted,
}

/// Attempts to provision capacity for `node` over the ranked instance-type
/// grid, publishing the result to the scheduler and `/etc/hosts` on the
/// first success. A single success ends the sweep for this node.
#[allow(clippy::too_many_arguments)]
pub async fn acquire(
    node: &Node,
    nodegroup: &Nodegroup,
    ranked_types: &[String],
    cloud: &dyn CloudApi,
    scheduler: &dyn SchedulerClient,
    hosts_path: &Path,
    hosts_lock_path: &Path,
) -> Result<AcquisitionOutcome, EngineError> {
    let spot_requested = matches!(nodegroup.purchasing_option, PurchasingOption::Spot);

    if let Some(result) = try_grid(node, nodegroup, ranked_types, spot_requested, cloud).await {
        return publish(node, result, spot_requested, scheduler, hosts_path, hosts_lock_path).await;
    }

    if spot_requested {
        warn!(node = %node.name, "spot acquisition exhausted, falling back to on-demand");
        if let Some(result) = try_grid(node, nodegroup, ranked_types, false, cloud).await {
            return publish(node, result, false, scheduler, hosts_path, hosts_lock_path).await;
        }
    }

    warn!(node = %node.name, "acquisition exhausted all (type, subnet) combinations");
    Ok(AcquisitionOutcome::Exhausted)
}

async fn try_grid(
    node: &Node,
    nodegroup: &Nodegroup,
    ranked_types: &[String],
    spot: bool,
    cloud: &dyn CloudApi,
) -> Option<RunInstancesResult> {
    for instance_type in ranked_types {
        for subnet in &nodegroup.subnet_ids {
            let spec = build_spec(node, nodegroup, instance_type, subnet, spot);
            let outcome = cloud.run_instances(&spec).await;
            tokio::time::sleep(RATE_LIMIT_SLEEP).await;
            match outcome {
                Ok(result) => return Some(result),
                Err(e) => {
                    warn!(
                        node = %node.name,
                        instance_type = instance_type.as_str(),
                        subnet = subnet.as_str(),
                        spot,
                        error = %e,
                        "runInstances failed"
                    );
                }
            }
        }
    }
    None
}

fn build_spec(
    node: &Node,
    nodegroup: &Nodegroup,
    instance_type: &str,
    subnet: &str,
    spot: bool,
) -> RunInstancesSpec {
    let tags = vec![
        ("nodegroup".to_string(), nodegroup.tag_value()),
        ("launchtemplate".to_string(), nodegroup.launch_template_id.clone()),
        ("Name".to_string(), node.name.to_string()),
    ];

    let tag_specifications = if spot {
        vec![
            TagSpec {
                resource_type: "instance".into(),
                tags: tags.clone(),
            },
            TagSpec {
                resource_type: "spot-instances-request".into(),
                tags,
            },
        ]
    } else {
        vec![TagSpec {
            resource_type: "instance".into(),
            tags,
        }]
    };

    let market_options = if spot {
        Some(MarketOptions {
            spot_instance_type: "persistent".into(),
            instance_interruption_behavior: interruption_behavior_wire(nodegroup.interruption_behavior),
        })
    } else {
        None
    };

    RunInstancesSpec {
        launch_template_id: Some(nodegroup.launch_template_id.clone()),
        instance_type: instance_type.to_string(),
        subnet_id: Some(subnet.to_string()),
        market_options,
        network_interfaces: Vec::new(),
        hibernation_configured: false,
        tag_specifications,
        extra_params: overrides_to_params(&nodegroup.overrides),
    }
}

pub(crate) fn interruption_behavior_wire(behavior: InterruptionBehavior) -> String {
    match behavior {
        InterruptionBehavior::Terminate => "terminate",
        InterruptionBehavior::Stop => "stop",
        InterruptionBehavior::Hibernate => "hibernate",
    }
    .to_string()
}

pub(crate) fn overrides_to_params(overrides: &Option<serde_json::Value>) -> Vec<(String, String)> {
    let mut out = Vec::new();
    if let Some(serde_json::Value::Object(map)) = overrides {
        for (k, v) in map {
            let value = match v {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            out.push((k.clone(), value));
        }
    }
    out
}

async fn publish(
    node: &Node,
    result: RunInstancesResult,
    spot_used: bool,
    scheduler: &dyn SchedulerClient,
    hosts_path: &Path,
    hosts_lock_path: &Path,
) -> Result<AcquisitionOutcome, EngineError> {
    let ip = result.private_ip.clone().unwrap_or_default();
    let spot_id = if spot_used {
        result.spot_instance_request_id.clone()
    } else {
        None
    };
    let comment = NodeComment {
        instance_id: result.instance_id.clone(),
        spot_id: spot_id.clone().unwrap_or_default(),
    };
    let weight = if spot_used { 2 } else { 1 };
    debug_assert!(weight != WEIGHT_LOCKED);

    scheduler
        .update_node(
            &node.name,
            &[
                ("nodeaddr", ip.as_str()),
                ("nodehostname", node.name.as_str()),
                ("comment", comment.render().as_str()),
                ("weight", weight.to_string().as_str()),
            ],
        )
        .await?;

    if !ip.is_empty() {
        if let Err(e) = publish_host_entry(hosts_path, hosts_lock_path, &ip, node.name.as_str()) {
            warn!(node = %node.name, error = %e, "hosts publish failed, next sweep retries");
        }
    }

    Ok(AcquisitionOutcome::Acquired {
        instance_id: result.instance_id,
        spot_id,
        ip,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_cloud::FakeCloudClient;
    use fleet_domain::{
        AllocationStrategy, NodeComment as DomainComment, NodeName, NodeState, NodeStateSet,
        NodegroupName, PartitionName,
    };
    use fleet_scheduler::local::FakeScheduler;
    use std::collections::BTreeSet;
    use tempfile::tempdir;

    fn nodegroup(purchasing: PurchasingOption) -> Nodegroup {
        Nodegroup {
            partition_name: PartitionName::new("p1"),
            nodegroup_name: NodegroupName::new("ng1"),
            num_nodes: 3,
            purchasing_option: purchasing,
            interruption_behavior: InterruptionBehavior::Stop,
            allocation_strategy: AllocationStrategy::Rank,
            launch_template_id: "lt-1".into(),
            subnet_ids: vec!["s-a".into(), "s-b".into()],
            instances: vec!["m5.large".into(), "m5.xlarge".into()],
            overrides: None,
            max_hibernation_min: None,
        }
    }

    fn node() -> Node {
        let mut states = BTreeSet::new();
        states.insert(NodeState::Cloud);
        states.insert(NodeState::PoweringUp);
        Node {
            name: NodeName::new("p1-ng1-3"),
            partition: PartitionName::new("p1"),
            state_set: states as NodeStateSet,
            node_addr: None,
            weight: 1,
            comment: DomainComment::empty(),
        }
    }

    #[tokio::test]
    async fn cold_acquire_publishes_spot_metadata() {
        let cloud = FakeCloudClient::new();
        let n = node();
        let mut nodes = std::collections::BTreeMap::new();
        nodes.insert(n.name.clone(), n.clone());
        let scheduler = FakeScheduler::new(nodes);
        let dir = tempdir().unwrap();
        let hosts = dir.path().join("hosts");
        let lock = dir.path().join("hosts.lock");

        let outcome = acquire(
            &n,
            &nodegroup(PurchasingOption::Spot),
            &["m5.large".to_string(), "m5.xlarge".to_string()],
            &cloud,
            &scheduler,
            &hosts,
            &lock,
        )
        .await
        .unwrap();

        match outcome {
            AcquisitionOutcome::Acquired { spot_id, ip, .. } => {
                assert!(spot_id.is_some());
                assert!(!ip.is_empty());
            }
            AcquisitionOutcome::Exhausted => panic!("expected acquisition to succeed"),
        }
        assert_eq!(scheduler.update_count(), 1);
        let contents = std::fs::read_to_string(&hosts).unwrap();
        assert!(contents.contains("p1-ng1-3"));
    }
}
