//! The fourteen-step swap: moves a hibernated donor instance's EBS volumes
//! and ENIs onto a freshly-launched on-demand recipient, then resumes the
//! node under the recipient. Grounded on the teacher's pattern of wrapping
//! a fallible multi-step provisioning sequence where every exit path leaves
//! state consistent before returning.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use fleet_cloud::types::{RunInstancesSpec, TagSpec};
use fleet_cloud::CloudApi;
use fleet_domain::{InstanceState, Node, NodeName, Nodegroup};
use fleet_scheduler::SchedulerClient;
use tracing::{error, info, warn};

use crate::error::ReconcileError;

const REACHABILITY_TIMEOUT: Duration = Duration::from_secs(180);
const REACHABILITY_POLL: Duration = Duration::from_secs(3);
const STOPPED_TIMEOUT: Duration = Duration::from_secs(120);
const STOPPED_POLL: Duration = Duration::from_secs(3);
const POST_REACHABLE_SETTLE: Duration = Duration::from_secs(20);
const DETACH_SETTLE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransplantOutcome {
    Completed { new_instance_id: String },
    /// Steps 1–8 abort without rollback; the donor may already be
    /// terminated and a recipient may already exist. The next sweep's
    /// state machine reconciles from the fresh snapshot.
    Aborted { step: u8, reason: String },
}

/// Restores `node.weight` to `1` on drop unless [`WeightLockGuard::restore`]
/// already ran. The `Drop` impl is a backstop for panics; every normal exit
/// path in [`transplant`] calls `restore` explicitly.
struct WeightLockGuard {
    node_name: NodeName,
    scheduler: Arc<dyn SchedulerClient>,
    armed: AtomicBool,
}

impl WeightLockGuard {
    async fn acquire(node_name: NodeName, scheduler: Arc<dyn SchedulerClient>) -> Result<Self, ReconcileError> {
        scheduler.update_node(&node_name, &[("weight", "0")]).await?;
        Ok(WeightLockGuard { node_name, scheduler, armed: AtomicBool::new(true) })
    }

    async fn restore(&self) {
        if self.armed.swap(false, Ordering::SeqCst) {
            if let Err(e) = self.scheduler.update_node(&self.node_name, &[("weight", "1")]).await {
                error!(node = %self.node_name, error = %e, "weight restore failed");
            }
        }
    }
}

impl Drop for WeightLockGuard {
    fn drop(&mut self) {
        if self.armed.load(Ordering::SeqCst) {
            let node_name = self.node_name.clone();
            let scheduler = self.scheduler.clone();
            tokio::spawn(async move {
                if let Err(e) = scheduler.update_node(&node_name, &[("weight", "1")]).await {
                    error!(node = %node_name, error = %e, "weight restore on drop failed");
                }
            });
        }
    }
}

pub async fn transplant(
    node: &Node,
    donor_instance_id: &str,
    nodegroup: &Nodegroup,
    cloud: &dyn CloudApi,
    scheduler: Arc<dyn SchedulerClient>,
) -> Result<TransplantOutcome, ReconcileError> {
    let guard = WeightLockGuard::acquire(node.name.clone(), scheduler.clone()).await?;

    let result = run_steps(node, donor_instance_id, nodegroup, cloud, scheduler.as_ref()).await;
    guard.restore().await;
    result
}

async fn donor_still_stopped(cloud: &dyn CloudApi, donor_id: &str) -> Result<bool, ReconcileError> {
    let instances = cloud
        .describe_instances(&[("instance-id", donor_id)])
        .await?;
    Ok(instances.iter().any(|i| i.id == donor_id && i.state == InstanceState::Stopped))
}

async fn run_steps(
    node: &Node,
    donor_instance_id: &str,
    nodegroup: &Nodegroup,
    cloud: &dyn CloudApi,
    scheduler: &dyn SchedulerClient,
) -> Result<TransplantOutcome, ReconcileError> {
    if !donor_still_stopped(cloud, donor_instance_id).await? {
        return Ok(TransplantOutcome::Aborted {
            step: 0,
            reason: "donor resumed concurrently before transplant started".into(),
        });
    }

    let donor = cloud
        .describe_instances(&[("instance-id", donor_instance_id)])
        .await?
        .into_iter()
        .find(|i| i.id == donor_instance_id)
        .ok_or_else(|| ReconcileError::Domain(fleet_domain::DomainError::InvalidConfig(format!(
            "donor instance {donor_instance_id} vanished"
        ))))?;

    // Step 1: cancel the donor's spot request. Open question (a): a failure
    // here is logged and the workflow continues, matching observed "source
    // continues" behavior rather than aborting over a possibly-stale request.
    if let Some(spot_id) = &donor.spot_request_id {
        if let Err(e) = cloud.cancel_spot_requests(&[spot_id.clone()]).await {
            warn!(node = %node.name, spot_id, error = %e, "donor spot cancel failed, continuing");
        }
    }

    // Step 2: detach donor volumes, recording deviceName per volumeId.
    let donor_volumes = donor.block_device_mappings.clone();
    for bdm in &donor_volumes {
        if let Err(e) = cloud.detach_volume(&bdm.volume_id, &donor.id).await {
            error!(node = %node.name, volume = %bdm.volume_id, error = %e, "donor volume detach failed");
            return Ok(TransplantOutcome::Aborted { step: 2, reason: e.to_string() });
        }
    }

    // Step 3: record donor ENIs and disable delete-on-termination on each.
    let donor_enis = donor.network_interfaces.clone();
    for eni in &donor_enis {
        if let Err(e) = cloud
            .modify_network_interface_attribute(&eni.eni_id, &eni.attachment_id, false)
            .await
        {
            error!(node = %node.name, eni = %eni.eni_id, error = %e, "donor eni DeleteOnTermination=false failed");
            return Ok(TransplantOutcome::Aborted { step: 3, reason: e.to_string() });
        }
    }

    if !donor_still_stopped(cloud, donor_instance_id).await? {
        return Ok(TransplantOutcome::Aborted {
            step: 4,
            reason: "donor resumed concurrently before termination".into(),
        });
    }

    // Step 4: terminate the donor.
    if let Err(e) = cloud.terminate_instances(&[donor.id.clone()]).await {
        error!(node = %node.name, instance = %donor.id, error = %e, "donor termination failed");
        return Ok(TransplantOutcome::Aborted { step: 4, reason: e.to_string() });
    }

    // Step 5: reconstruct the launch template, stripping SecurityGroupIds
    // and UserData (they conflict with the donor's ENIs), merging overrides,
    // forcing hibernation support and the donor's exact instance type.
    let template = match cloud
        .describe_launch_template_versions(&nodegroup.launch_template_id)
        .await
    {
        Ok(t) => t,
        Err(e) => {
            error!(node = %node.name, error = %e, "launch template lookup failed");
            return Ok(TransplantOutcome::Aborted { step: 5, reason: e.to_string() });
        }
    };

    let network_interfaces = donor_enis
        .iter()
        .map(|eni| fleet_cloud::types::NetworkInterfaceSpec {
            device_index: eni.card_index,
            network_interface_id: eni.eni_id.clone(),
        })
        .collect();

    let mut extra_params: Vec<(String, String)> = template
        .extra_params
        .into_iter()
        .filter(|(k, _)| k != "SecurityGroupIds" && k != "UserData")
        .collect();
    extra_params.extend(overrides_to_params(&nodegroup.overrides));

    let spec = RunInstancesSpec {
        launch_template_id: None,
        instance_type: donor.instance_type.clone(),
        subnet_id: None,
        market_options: None,
        network_interfaces,
        hibernation_configured: true,
        tag_specifications: vec![TagSpec {
            resource_type: "instance".into(),
            tags: vec![
                ("nodegroup".into(), nodegroup.tag_value()),
                ("launchtemplate".into(), nodegroup.launch_template_id.clone()),
                ("Name".into(), node.name.to_string()),
            ],
        }],
        extra_params,
    };

    // Step 6: launch the recipient on-demand and publish its identity.
    let recipient = match cloud.run_instances(&spec).await {
        Ok(r) => r,
        Err(e) => {
            error!(node = %node.name, error = %e, "recipient run_instances failed");
            return Ok(TransplantOutcome::Aborted { step: 6, reason: e.to_string() });
        }
    };
    let comment = fleet_domain::NodeComment {
        instance_id: recipient.instance_id.clone(),
        spot_id: String::new(),
    };
    scheduler
        .update_node(&node.name, &[("comment", comment.render().as_str())])
        .await?;

    // Step 7: poll for reachability, then settle.
    let deadline = Instant::now() + REACHABILITY_TIMEOUT;
    let mut reachable = false;
    while Instant::now() < deadline {
        match cloud
            .describe_instance_status(
                &[recipient.instance_id.clone()],
                &[("system-status.reachability", "passed")],
            )
            .await
        {
            Ok(statuses) if statuses.iter().any(|s| s.reachability_passed) => {
                reachable = true;
                break;
            }
            Ok(_) => {}
            Err(e) => warn!(node = %node.name, error = %e, "reachability poll failed, retrying"),
        }
        tokio::time::sleep(REACHABILITY_POLL).await;
    }
    if !reachable {
        return Ok(TransplantOutcome::Aborted {
            step: 7,
            reason: "recipient never reached system-status.reachability=passed".into(),
        });
    }
    tokio::time::sleep(POST_REACHABLE_SETTLE).await;

    // Step 8: hibernate the recipient and wait for it to stop.
    if let Err(e) = cloud.stop_instances(&[recipient.instance_id.clone()], true).await {
        error!(node = %node.name, error = %e, "recipient stopInstances(Hibernate) failed");
        return Ok(TransplantOutcome::Aborted { step: 8, reason: e.to_string() });
    }
    let deadline = Instant::now() + STOPPED_TIMEOUT;
    let mut stopped = false;
    while Instant::now() < deadline {
        match cloud
            .describe_instances(&[("instance-id", recipient.instance_id.as_str())])
            .await
        {
            Ok(instances) if instances.iter().any(|i| i.state == InstanceState::Stopped) => {
                stopped = true;
                break;
            }
            Ok(_) => {}
            Err(e) => warn!(node = %node.name, error = %e, "recipient stopped-poll failed, retrying"),
        }
        tokio::time::sleep(STOPPED_POLL).await;
    }
    if !stopped {
        return Ok(TransplantOutcome::Aborted {
            step: 8,
            reason: "recipient never reached state=stopped".into(),
        });
    }

    // Step 9: re-read the recipient's ENIs, re-enable DeleteOnTermination.
    match cloud
        .describe_instances(&[("instance-id", recipient.instance_id.as_str())])
        .await
    {
        Ok(instances) => {
            if let Some(recip) = instances.into_iter().find(|i| i.id == recipient.instance_id) {
                for eni in &recip.network_interfaces {
                    if let Err(e) = cloud
                        .modify_network_interface_attribute(&eni.eni_id, &eni.attachment_id, true)
                        .await
                    {
                        warn!(node = %node.name, eni = %eni.eni_id, error = %e, "recipient eni DeleteOnTermination=true failed, continuing");
                    }
                }
            }
        }
        Err(e) => warn!(node = %node.name, error = %e, "recipient eni re-read failed, continuing"),
    }

    // Step 10: detach the recipient's original volumes.
    let recipient_originals = match cloud
        .describe_instances(&[("instance-id", recipient.instance_id.as_str())])
        .await
    {
        Ok(instances) => instances
            .into_iter()
            .find(|i| i.id == recipient.instance_id)
            .map(|i| i.block_device_mappings)
            .unwrap_or_default(),
        Err(e) => {
            warn!(node = %node.name, error = %e, "recipient volume re-read failed, continuing");
            Vec::new()
        }
    };
    for bdm in &recipient_originals {
        if let Err(e) = cloud.detach_volume(&bdm.volume_id, &recipient.instance_id).await {
            warn!(node = %node.name, volume = %bdm.volume_id, error = %e, "recipient original volume detach failed, continuing");
        }
    }

    // Step 11: settle, then attach each donor volume under its original device name.
    tokio::time::sleep(DETACH_SETTLE).await;
    for bdm in &donor_volumes {
        if let Err(e) = cloud
            .attach_volume(&bdm.device_name, &recipient.instance_id, &bdm.volume_id)
            .await
        {
            warn!(node = %node.name, volume = %bdm.volume_id, error = %e, "donor volume attach to recipient failed, continuing");
        }
    }

    // Step 12: resume the recipient.
    if let Err(e) = cloud.start_instances(&[recipient.instance_id.clone()]).await {
        warn!(node = %node.name, error = %e, "recipient startInstances failed, continuing");
    }

    // Step 13: delete the recipient's original volumes.
    for bdm in &recipient_originals {
        if let Err(e) = cloud.delete_volume(&bdm.volume_id).await {
            warn!(node = %node.name, volume = %bdm.volume_id, error = %e, "recipient original volume delete failed, continuing");
        }
    }

    // Step 14: undrain.
    if let Err(e) = scheduler.update_node(&node.name, &[("state", "UNDRAIN")]).await {
        warn!(node = %node.name, error = %e, "post-transplant UNDRAIN failed, continuing");
    }

    info!(node = %node.name, donor = %donor.id, recipient = %recipient.instance_id, "transplant complete");
    Ok(TransplantOutcome::Completed { new_instance_id: recipient.instance_id })
}

fn overrides_to_params(overrides: &Option<serde_json::Value>) -> Vec<(String, String)> {
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

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_cloud::local::FakeCloudClient;
    use fleet_domain::{
        AllocationStrategy, Instance, InterruptionBehavior, NodeComment, NodeState, NodeStateSet,
        NodegroupName, PartitionName, PurchasingOption,
    };
    use fleet_scheduler::local::FakeScheduler;
    use std::collections::BTreeMap;

    fn nodegroup() -> Nodegroup {
        Nodegroup {
            partition_name: PartitionName::new("p1"),
            nodegroup_name: NodegroupName::new("ng1"),
            num_nodes: 1,
            purchasing_option: PurchasingOption::Spot,
            interruption_behavior: InterruptionBehavior::Hibernate,
            allocation_strategy: AllocationStrategy::Rank,
            launch_template_id: "lt-1".into(),
            subnet_ids: vec!["s-a".into()],
            instances: vec!["m5.large".into()],
            overrides: None,
            max_hibernation_min: Some(30),
        }
    }

    fn node() -> Node {
        let mut states: NodeStateSet = std::collections::BTreeSet::new();
        states.insert(NodeState::Cloud);
        Node {
            name: NodeName::new("p1-ng1-1"),
            partition: PartitionName::new("p1"),
            state_set: states,
            node_addr: Some("10.0.0.9".into()),
            weight: 1,
            comment: NodeComment { instance_id: "i-stopped".into(), spot_id: String::new() },
        }
    }

    #[tokio::test]
    async fn successful_transplant_restores_weight_and_publishes_new_instance() {
        tokio::time::pause();

        let cloud = FakeCloudClient::new();
        cloud.seed_launch_template(
            "lt-1",
            fleet_cloud::types::LaunchTemplateVersion {
                image_id: Some("ami-1".into()),
                key_name: None,
                instance_type: Some("m5.large".into()),
                extra_params: vec![("UserData".into(), "#!/bin/sh".into())],
            },
        );
        cloud.seed_instance(
            Instance {
                id: "i-stopped".into(),
                instance_type: "m5.large".into(),
                private_ip: Some("10.0.0.9".into()),
                lifecycle: fleet_domain::InstanceLifecycle::Spot,
                state: fleet_domain::InstanceState::Stopped,
                state_transition_reason: "User initiated (2024-10-05 09:31:33 UTC)".into(),
                block_device_mappings: Vec::new(),
                network_interfaces: Vec::new(),
                spot_request_id: None,
            },
            BTreeMap::new(),
        );

        let n = node();
        let mut nodes = BTreeMap::new();
        nodes.insert(n.name.clone(), n.clone());
        let scheduler = Arc::new(FakeScheduler::new(nodes));

        let outcome = transplant(&n, "i-stopped", &nodegroup(), &cloud, scheduler.clone())
            .await
            .unwrap();

        match outcome {
            TransplantOutcome::Completed { new_instance_id } => assert!(!new_instance_id.is_empty()),
            TransplantOutcome::Aborted { step, reason } => panic!("aborted at step {step}: {reason}"),
        }

        let final_node = scheduler.node(&n.name).unwrap();
        assert_eq!(final_node.weight, 1, "weight must be restored after transplant");
    }
}
