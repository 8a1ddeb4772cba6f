//! Iterates `partitions x nodegroups`, running the per-node state machine
//! over a fresh snapshot of each nodegroup and reaping orphans afterward.
//! Each nodegroup is wrapped so an unexpected error is logged with context
//! and the loop moves on to the next one rather than aborting the sweep.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use tracing::{error, info, warn};

use fleet_cloud::CloudApi;
use fleet_config::Config;
use fleet_domain::{Instance, Node, Nodegroup, PartitionName, SpotRequest, SpotRequestState};
use fleet_ranker::{rank_instance_types, PricingClient};
use fleet_scheduler::SchedulerClient;

use crate::error::ReconcileError;
use crate::report::SweepReport;
use crate::state_machine::{self, Decision};
use crate::transplant::{self, TransplantOutcome};

const LOCK_TIMEOUT: Duration = Duration::from_secs(10);
const LOCK_POLL: Duration = Duration::from_millis(100);

/// Instance states a live node can plausibly still be linked to. Excludes
/// `terminated`, so a node whose instance already vanished falls through to
/// `state_machine::decide`'s `!linked` repair path instead of being treated
/// as linked to a dead instance.
const LIVE_INSTANCE_STATES: [&str; 4] = ["pending", "running", "stopped", "stopping"];

struct NodegroupLock {
    file: std::fs::File,
}

impl NodegroupLock {
    fn acquire(path: &Path) -> std::io::Result<Option<Self>> {
        let file = OpenOptions::new().create(true).write(true).open(path)?;
        let deadline = Instant::now() + LOCK_TIMEOUT;
        loop {
            if file.try_lock_exclusive().is_ok() {
                return Ok(Some(NodegroupLock { file }));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            std::thread::sleep(LOCK_POLL);
        }
    }
}

impl Drop for NodegroupLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Runs one sweep over every partition/nodegroup in `config`.
#[allow(clippy::too_many_arguments)]
pub async fn sweep(
    config: &Config,
    cloud: &dyn CloudApi,
    scheduler: Arc<dyn SchedulerClient>,
    pricing: &dyn PricingClient,
    hosts_path: &Path,
    hosts_lock_path: &Path,
    lock_dir: &Path,
    stack_prefix: &str,
) -> SweepReport {
    let mut report = SweepReport::new();
    let now = Utc::now();

    let prices = pricing.fetch_spot_prices(&config.region).await;
    let interruption_rates = pricing.fetch_interruption_rates(&config.region).await;

    for partition in config.partitions() {
        for nodegroup in config.nodegroups_in(&partition) {
            let lock_path = lock_dir.join(format!(
                "{stack_prefix}-{}-{}.lock",
                partition.as_str(),
                nodegroup.nodegroup_name.as_str()
            ));

            let _lock = match NodegroupLock::acquire(&lock_path) {
                Ok(Some(lock)) => lock,
                Ok(None) => {
                    info!(
                        partition = %partition,
                        nodegroup = %nodegroup.nodegroup_name,
                        "advisory lock timed out, skipping nodegroup this sweep"
                    );
                    report.nodegroups_skipped_lock_timeout += 1;
                    continue;
                }
                Err(e) => {
                    error!(
                        partition = %partition,
                        nodegroup = %nodegroup.nodegroup_name,
                        error = %e,
                        "lock file open failed, skipping nodegroup"
                    );
                    report.errors.push(format!(
                        "{partition}/{}: lock open: {e}",
                        nodegroup.nodegroup_name
                    ));
                    continue;
                }
            };

            if let Err(e) = sweep_nodegroup(
                &partition,
                nodegroup,
                cloud,
                &scheduler,
                &prices,
                &interruption_rates,
                hosts_path,
                hosts_lock_path,
                now,
                &mut report,
            )
            .await
            {
                error!(
                    partition = %partition,
                    nodegroup = %nodegroup.nodegroup_name,
                    error = %e,
                    "nodegroup sweep failed unexpectedly"
                );
                report
                    .errors
                    .push(format!("{partition}/{}: {e}", nodegroup.nodegroup_name));
            }
            report.nodegroups_swept += 1;
        }
    }

    report
}

#[allow(clippy::too_many_arguments)]
async fn sweep_nodegroup(
    partition: &PartitionName,
    nodegroup: &Nodegroup,
    cloud: &dyn CloudApi,
    scheduler: &Arc<dyn SchedulerClient>,
    prices: &HashMap<String, f64>,
    interruption_rates: &HashMap<String, u8>,
    hosts_path: &Path,
    hosts_lock_path: &Path,
    now: DateTime<Utc>,
    report: &mut SweepReport,
) -> Result<(), ReconcileError> {
    let all_nodes = scheduler.load_nodes().await?;
    let nodes: Vec<Node> = all_nodes
        .into_values()
        .filter(|n| n.name.belongs_to(partition, &nodegroup.nodegroup_name))
        .collect();

    let tag_filters = [
        ("tag:nodegroup".to_string(), nodegroup.tag_value()),
        ("tag:launchtemplate".to_string(), nodegroup.launch_template_id.clone()),
    ];
    let filter_refs: Vec<(&str, &str)> =
        tag_filters.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();

    let mut instance_filter_refs = filter_refs.clone();
    instance_filter_refs.extend(LIVE_INSTANCE_STATES.iter().map(|s| ("instance-state-name", *s)));

    let instances = cloud.describe_instances(&instance_filter_refs).await?;
    let instance_map: BTreeMap<String, Instance> =
        instances.iter().cloned().map(|i| (i.id.clone(), i)).collect();

    let spot_requests = cloud.describe_spot_requests(&filter_refs, &[]).await?;
    let spot_map: BTreeMap<String, SpotRequest> =
        spot_requests.into_iter().map(|s| (s.id.clone(), s)).collect();

    let ranked = rank_instance_types(
        &nodegroup.instances,
        nodegroup.allocation_strategy,
        nodegroup.purchasing_option,
        prices,
        interruption_rates,
    );

    let mut referenced_instances: BTreeSet<String> = BTreeSet::new();
    let mut referenced_spots: BTreeSet<String> = BTreeSet::new();
    // Instances/spot requests a node action already terminated or cancelled
    // this sweep. The snapshot `instances`/`spot_map` below predates the
    // node pass, so without this the orphan sweep would re-terminate them.
    let mut handled_instances: BTreeSet<String> = BTreeSet::new();
    let mut handled_spots: BTreeSet<String> = BTreeSet::new();

    for node in &nodes {
        let instance = state_machine::linked(node, &instance_map);
        let decision = state_machine::decide(node, instance, nodegroup.max_hibernation_min, now);

        let (referenced_instance_id, referenced_spot_id) = match &decision {
            Decision::ClearComment | Decision::TerminateThenClear { .. } => (String::new(), String::new()),
            _ => (node.comment.instance_id.clone(), node.comment.spot_id.clone()),
        };
        if !referenced_instance_id.is_empty() {
            referenced_instances.insert(referenced_instance_id);
        }
        if !referenced_spot_id.is_empty() {
            referenced_spots.insert(referenced_spot_id);
        }
        if let Decision::TerminateThenClear { instance_id, spot_id } = &decision {
            handled_instances.insert(instance_id.clone());
            if let Some(sid) = spot_id {
                handled_spots.insert(sid.clone());
            }
        }

        if let Err(e) = apply_decision(
            node,
            nodegroup,
            decision,
            instance,
            cloud,
            scheduler,
            &ranked,
            hosts_path,
            hosts_lock_path,
            report,
        )
        .await
        {
            warn!(node = %node.name, error = %e, "node action failed, next sweep retries");
            report.errors.push(format!("{}: {e}", node.name));
        }
    }

    reap_orphans(
        partition,
        nodegroup,
        cloud,
        &instances,
        &spot_map,
        &referenced_instances,
        &referenced_spots,
        &handled_instances,
        &handled_spots,
        report,
    )
    .await
}

#[allow(clippy::too_many_arguments)]
async fn apply_decision(
    node: &Node,
    nodegroup: &Nodegroup,
    decision: Decision,
    instance: Option<&Instance>,
    cloud: &dyn CloudApi,
    scheduler: &Arc<dyn SchedulerClient>,
    ranked: &[String],
    hosts_path: &Path,
    hosts_lock_path: &Path,
    report: &mut SweepReport,
) -> Result<(), ReconcileError> {
    match decision {
        Decision::Skip | Decision::NoAction => {}

        Decision::SetIdle => {
            scheduler.update_node(&node.name, &[("state", "IDLE")]).await?;
        }

        Decision::Acquire => {
            match fleet_engine::acquire(
                node,
                nodegroup,
                ranked,
                cloud,
                scheduler.as_ref(),
                hosts_path,
                hosts_lock_path,
            )
            .await?
            {
                fleet_engine::AcquisitionOutcome::Acquired { .. } => report.acquisitions += 1,
                fleet_engine::AcquisitionOutcome::Exhausted => report.acquisitions_exhausted += 1,
            }
        }

        Decision::ClearComment => {
            let empty = fleet_domain::NodeComment::empty().render();
            scheduler.update_node(&node.name, &[("comment", empty.as_str())]).await?;
        }

        Decision::SetStateReason { state, reason } => {
            scheduler
                .update_node(&node.name, &[("state", state), ("reason", reason)])
                .await?;
        }

        Decision::TerminateThenClear { instance_id, spot_id } => {
            cloud.terminate_instances(&[instance_id]).await?;
            if let Some(sid) = spot_id {
                cloud.cancel_spot_requests(&[sid]).await?;
            }
            let empty = fleet_domain::NodeComment::empty().render();
            scheduler.update_node(&node.name, &[("comment", empty.as_str())]).await?;
        }

        Decision::DrainHibernated { schedule_transplant } => {
            scheduler
                .update_node(&node.name, &[("state", "DRAIN"), ("reason", "instance_hibernated")])
                .await?;
            if schedule_transplant {
                if let Some(inst) = instance {
                    match transplant::transplant(node, &inst.id, nodegroup, cloud, scheduler.clone()).await? {
                        TransplantOutcome::Completed { .. } => report.transplants_completed += 1,
                        TransplantOutcome::Aborted { step, reason } => {
                            warn!(node = %node.name, step, %reason, "transplant aborted");
                            report.transplants_aborted += 1;
                        }
                    }
                }
            }
        }

        Decision::Undrain => {
            scheduler.update_node(&node.name, &[("state", "UNDRAIN")]).await?;
        }

        Decision::UpdateNodeAddr { ip } => {
            scheduler.update_node(&node.name, &[("nodeaddr", ip.as_str())]).await?;
        }
    }
    Ok(())
}

/// Instances/spot requests tagged for this nodegroup but referenced by no
/// node after the per-node pass. Computed over the sweep's up-front
/// snapshot, so a node un-linked during the pass can be reaped in the same
/// sweep (spec.md §5 ordering).
#[allow(clippy::too_many_arguments)]
async fn reap_orphans(
    partition: &PartitionName,
    nodegroup: &Nodegroup,
    cloud: &dyn CloudApi,
    instances: &[Instance],
    spot_map: &BTreeMap<String, SpotRequest>,
    referenced_instances: &BTreeSet<String>,
    referenced_spots: &BTreeSet<String>,
    handled_instances: &BTreeSet<String>,
    handled_spots: &BTreeSet<String>,
    report: &mut SweepReport,
) -> Result<(), ReconcileError> {
    let mut orphan_instance_ids = Vec::new();
    let mut cancelled_via_instance = BTreeSet::new();

    for inst in instances {
        if inst.state.is_terminal_or_stopping() {
            continue;
        }
        if referenced_instances.contains(&inst.id) || handled_instances.contains(&inst.id) {
            continue;
        }
        orphan_instance_ids.push(inst.id.clone());
        if let Some(sid) = &inst.spot_request_id {
            cancelled_via_instance.insert(sid.clone());
        }
    }

    if !orphan_instance_ids.is_empty() {
        info!(
            partition = %partition,
            nodegroup = %nodegroup.nodegroup_name,
            ids = ?orphan_instance_ids,
            "terminating orphan instances"
        );
        cloud.terminate_instances(&orphan_instance_ids).await?;
        report.orphan_instances_terminated += orphan_instance_ids.len() as u32;
        // Instance termination always also cancels its spot request, if any.
        let to_cancel: Vec<String> = cancelled_via_instance.into_iter().collect();
        if !to_cancel.is_empty() {
            cloud.cancel_spot_requests(&to_cancel).await?;
        }
    }

    let orphan_spot_ids: Vec<String> = spot_map
        .values()
        .filter(|s| {
            !referenced_spots.contains(&s.id)
                && !handled_spots.contains(&s.id)
                && !matches!(
                    s.state,
                    SpotRequestState::Cancelled | SpotRequestState::Closed | SpotRequestState::Failed
                )
        })
        .filter(|s| s.instance_id.as_deref().map(|id| !orphan_instance_ids.contains(&id.to_string())).unwrap_or(true))
        .map(|s| s.id.clone())
        .collect();

    if !orphan_spot_ids.is_empty() {
        info!(
            partition = %partition,
            nodegroup = %nodegroup.nodegroup_name,
            ids = ?orphan_spot_ids,
            "cancelling orphan spot requests"
        );
        cloud.cancel_spot_requests(&orphan_spot_ids).await?;
        report.orphan_spots_cancelled += orphan_spot_ids.len() as u32;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use fleet_cloud::local::FakeCloudClient;
    use fleet_config::Config;
    use fleet_domain::{
        AllocationStrategy, Instance, InstanceLifecycle, InstanceState, InterruptionBehavior,
        NodeComment, NodeName, NodeState, NodeStateSet, NodegroupName, PurchasingOption,
    };
    use fleet_scheduler::local::FakeScheduler;
    use std::collections::BTreeSet;
    use tempfile::tempdir;

    struct NullPricingClient;

    #[async_trait]
    impl PricingClient for NullPricingClient {
        async fn fetch_spot_prices(&self, _region: &str) -> HashMap<String, f64> {
            HashMap::new()
        }
        async fn fetch_interruption_rates(&self, _region: &str) -> HashMap<String, u8> {
            HashMap::new()
        }
    }

    fn nodegroup(purchasing: PurchasingOption) -> Nodegroup {
        Nodegroup {
            partition_name: PartitionName::new("p1"),
            nodegroup_name: NodegroupName::new("ng1"),
            num_nodes: 2,
            purchasing_option: purchasing,
            interruption_behavior: InterruptionBehavior::Stop,
            allocation_strategy: AllocationStrategy::Rank,
            launch_template_id: "lt-1".into(),
            subnet_ids: vec!["s-a".into()],
            instances: vec!["m5.large".into()],
            overrides: None,
            max_hibernation_min: Some(30),
        }
    }

    fn config(ng: Nodegroup) -> Config {
        Config {
            log_level: fleet_config::LogLevel::Info,
            log_file_name: "/tmp/fleetd.log".into(),
            slurm_bin_path: "/usr/bin/".into(),
            region: "us-east-1".into(),
            slurm_conf: "/etc/slurm/slurm.conf".into(),
            nodegroups: vec![ng],
            partition_options: BTreeMap::new(),
        }
    }

    fn node(states: &[NodeState], comment: NodeComment, node_addr: Option<&str>) -> Node {
        let state_set: NodeStateSet = states.iter().copied().collect::<BTreeSet<_>>();
        Node {
            name: NodeName::new("p1-ng1-1"),
            partition: PartitionName::new("p1"),
            state_set,
            node_addr: node_addr.map(str::to_string),
            weight: 1,
            comment,
        }
    }

    struct Fixture {
        cloud: FakeCloudClient,
        scheduler: Arc<FakeScheduler>,
        pricing: NullPricingClient,
        hosts_dir: tempfile::TempDir,
        lock_dir: tempfile::TempDir,
    }

    impl Fixture {
        fn new(nodes: Vec<Node>) -> Self {
            let mut map = BTreeMap::new();
            for n in nodes {
                map.insert(n.name.clone(), n);
            }
            Fixture {
                cloud: FakeCloudClient::new(),
                scheduler: Arc::new(FakeScheduler::new(map)),
                pricing: NullPricingClient,
                hosts_dir: tempdir().unwrap(),
                lock_dir: tempdir().unwrap(),
            }
        }

        async fn sweep(&self, cfg: &Config) -> SweepReport {
            sweep(
                cfg,
                &self.cloud,
                self.scheduler.clone(),
                &self.pricing,
                &self.hosts_dir.path().join("hosts"),
                &self.hosts_dir.path().join("hosts.lock"),
                self.lock_dir.path(),
                "fleetd",
            )
            .await
        }
    }

    #[tokio::test]
    async fn cold_node_acquires_capacity() {
        let n = node(&[NodeState::Cloud, NodeState::PoweringUp], NodeComment::empty(), None);
        let name = n.name.clone();
        let fx = Fixture::new(vec![n]);
        let cfg = config(nodegroup(PurchasingOption::OnDemand));

        let report = fx.sweep(&cfg).await;

        assert_eq!(report.acquisitions, 1);
        assert!(report.errors.is_empty());
        let updated = fx.scheduler.node(&name).unwrap();
        assert!(updated.comment.linked());
        assert_eq!(updated.weight, 1);
    }

    #[tokio::test]
    async fn powered_down_linked_node_terminates_and_clears() {
        let comment = NodeComment { instance_id: "i-live".into(), spot_id: String::new() };
        let n = node(
            &[NodeState::Cloud, NodeState::Idle, NodeState::PoweredDown],
            comment,
            Some("10.0.0.5"),
        );
        let name = n.name.clone();
        let fx = Fixture::new(vec![n]);
        fx.cloud.seed_instance(
            Instance {
                id: "i-live".into(),
                instance_type: "m5.large".into(),
                private_ip: Some("10.0.0.5".into()),
                lifecycle: InstanceLifecycle::OnDemand,
                state: InstanceState::Running,
                state_transition_reason: String::new(),
                block_device_mappings: Vec::new(),
                network_interfaces: Vec::new(),
                spot_request_id: None,
            },
            [
                ("nodegroup".to_string(), "p1-ng1".to_string()),
                ("launchtemplate".to_string(), "lt-1".to_string()),
            ]
            .into_iter()
            .collect(),
        );
        let cfg = config(nodegroup(PurchasingOption::OnDemand));

        fx.sweep(&cfg).await;

        assert_eq!(fx.cloud.terminate_calls(), vec!["i-live".to_string()]);
        let updated = fx.scheduler.node(&name).unwrap();
        assert!(!updated.comment.linked());
    }

    #[tokio::test]
    async fn vanished_instance_triggers_power_down_force() {
        // The instance a node's comment still points at has already been
        // terminated out of band (outside this sweep). It must not show up
        // in the snapshot, so the node is treated as unlinked rather than
        // linked to a dead instance.
        let comment = NodeComment { instance_id: "i-gone".into(), spot_id: String::new() };
        let n = node(&[NodeState::Cloud, NodeState::Idle], comment, Some("10.0.0.5"));
        let name = n.name.clone();
        let fx = Fixture::new(vec![n]);
        fx.cloud.seed_instance(
            Instance {
                id: "i-gone".into(),
                instance_type: "m5.large".into(),
                private_ip: Some("10.0.0.5".into()),
                lifecycle: InstanceLifecycle::OnDemand,
                state: InstanceState::Terminated,
                state_transition_reason: String::new(),
                block_device_mappings: Vec::new(),
                network_interfaces: Vec::new(),
                spot_request_id: None,
            },
            [
                ("nodegroup".to_string(), "p1-ng1".to_string()),
                ("launchtemplate".to_string(), "lt-1".to_string()),
            ]
            .into_iter()
            .collect(),
        );
        let cfg = config(nodegroup(PurchasingOption::OnDemand));

        fx.sweep(&cfg).await;

        let updates = fx.scheduler.updates.lock().unwrap();
        assert_eq!(
            updates.last(),
            Some(&(
                name,
                vec![
                    ("state".to_string(), "POWER_DOWN_FORCE".to_string()),
                    ("reason".to_string(), "instance_terminated".to_string()),
                ]
            ))
        );
    }

    #[tokio::test]
    async fn unreferenced_instance_is_reaped_as_orphan() {
        let fx = Fixture::new(vec![]);
        fx.cloud.seed_instance(
            Instance {
                id: "i-orphan".into(),
                instance_type: "m5.large".into(),
                private_ip: Some("10.0.0.7".into()),
                lifecycle: InstanceLifecycle::OnDemand,
                state: InstanceState::Running,
                state_transition_reason: String::new(),
                block_device_mappings: Vec::new(),
                network_interfaces: Vec::new(),
                spot_request_id: None,
            },
            [
                ("nodegroup".to_string(), "p1-ng1".to_string()),
                ("launchtemplate".to_string(), "lt-1".to_string()),
            ]
            .into_iter()
            .collect(),
        );
        let cfg = config(nodegroup(PurchasingOption::OnDemand));

        let report = fx.sweep(&cfg).await;

        assert_eq!(report.orphan_instances_terminated, 1);
        assert_eq!(fx.cloud.terminate_calls(), vec!["i-orphan".to_string()]);
    }

    #[tokio::test]
    async fn stable_fixture_is_idempotent_across_sweeps() {
        let comment = NodeComment { instance_id: "i-stable".into(), spot_id: String::new() };
        let n = node(&[NodeState::Cloud, NodeState::Idle], comment, Some("10.0.0.9"));
        let fx = Fixture::new(vec![n]);
        fx.cloud.seed_instance(
            Instance {
                id: "i-stable".into(),
                instance_type: "m5.large".into(),
                private_ip: Some("10.0.0.9".into()),
                lifecycle: InstanceLifecycle::OnDemand,
                state: InstanceState::Running,
                state_transition_reason: String::new(),
                block_device_mappings: Vec::new(),
                network_interfaces: Vec::new(),
                spot_request_id: None,
            },
            [
                ("nodegroup".to_string(), "p1-ng1".to_string()),
                ("launchtemplate".to_string(), "lt-1".to_string()),
            ]
            .into_iter()
            .collect(),
        );
        let cfg = config(nodegroup(PurchasingOption::OnDemand));

        fx.sweep(&cfg).await;
        let updates_after_first = fx.scheduler.update_count();
        fx.sweep(&cfg).await;
        let updates_after_second = fx.scheduler.update_count();

        assert_eq!(updates_after_first, updates_after_second, "stable fixture must not churn");
        assert!(fx.cloud.terminate_calls().is_empty());
    }

    #[tokio::test]
    async fn hibernated_instance_drains_without_transplant_under_threshold() {
        let comment = NodeComment { instance_id: "i-hib".into(), spot_id: String::new() };
        let n = node(&[NodeState::Cloud, NodeState::Idle], comment, Some("10.0.0.9"));
        let name = n.name.clone();
        let fx = Fixture::new(vec![n]);
        fx.cloud.seed_instance(
            Instance {
                id: "i-hib".into(),
                instance_type: "m5.large".into(),
                private_ip: Some("10.0.0.9".into()),
                lifecycle: InstanceLifecycle::OnDemand,
                state: InstanceState::Stopped,
                state_transition_reason: format!(
                    "User initiated ({} UTC)",
                    Utc::now().format("%Y-%m-%d %H:%M:%S")
                ),
                block_device_mappings: Vec::new(),
                network_interfaces: Vec::new(),
                spot_request_id: None,
            },
            [
                ("nodegroup".to_string(), "p1-ng1".to_string()),
                ("launchtemplate".to_string(), "lt-1".to_string()),
            ]
            .into_iter()
            .collect(),
        );
        let cfg = config(nodegroup(PurchasingOption::OnDemand));

        let report = fx.sweep(&cfg).await;

        assert_eq!(report.transplants_completed, 0);
        assert_eq!(report.transplants_aborted, 0);
        let updated = fx.scheduler.node(&name).unwrap();
        assert!(updated.has_state(NodeState::Drain));
    }
}
