use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use fleet_domain::{Instance, InstanceLifecycle, InstanceState, SpotRequest, SpotRequestState};

use crate::client::CloudApi;
use crate::error::CloudError;
use crate::types::{
    InstanceStatusSummary, LaunchTemplateVersion, RunInstancesResult, RunInstancesSpec,
};

/// In-memory `CloudApi` double. Tags applied via `run_instances` /
/// `create_tags` are recorded so nodegroup-scoped `tag:` filters behave the
/// way the real API's filtering does.
pub struct FakeCloudClient {
    instances: Mutex<BTreeMap<String, (Instance, BTreeMap<String, String>)>>,
    spot_requests: Mutex<BTreeMap<String, SpotRequest>>,
    launch_templates: Mutex<BTreeMap<String, LaunchTemplateVersion>>,
    next_id: Mutex<u64>,
    terminate_calls: Mutex<Vec<String>>,
}

impl FakeCloudClient {
    pub fn new() -> Self {
        FakeCloudClient {
            instances: Mutex::new(BTreeMap::new()),
            spot_requests: Mutex::new(BTreeMap::new()),
            launch_templates: Mutex::new(BTreeMap::new()),
            next_id: Mutex::new(1),
            terminate_calls: Mutex::new(Vec::new()),
        }
    }

    fn alloc_id(&self, prefix: &str) -> String {
        let mut n = self.next_id.lock().unwrap();
        let id = format!("{prefix}-{:06}", *n);
        *n += 1;
        id
    }

    pub fn seed_launch_template(&self, id: &str, version: LaunchTemplateVersion) {
        self.launch_templates
            .lock()
            .unwrap()
            .insert(id.to_string(), version);
    }

    /// Insert an instance directly, bypassing `run_instances` — for fixtures
    /// that start mid-lifecycle (e.g. an orphan with no matching node).
    pub fn seed_instance(&self, instance: Instance, tags: BTreeMap<String, String>) {
        self.instances
            .lock()
            .unwrap()
            .insert(instance.id.clone(), (instance, tags));
    }

    pub fn terminate_calls(&self) -> Vec<String> {
        self.terminate_calls.lock().unwrap().clone()
    }

    pub fn instance_count(&self) -> usize {
        self.instances.lock().unwrap().len()
    }
}

impl Default for FakeCloudClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CloudApi for FakeCloudClient {
    async fn describe_instances(
        &self,
        filters: &[(&str, &str)],
    ) -> Result<Vec<Instance>, CloudError> {
        let instances = self.instances.lock().unwrap();
        Ok(instances
            .values()
            .filter(|(inst, tags)| matches_grouped_filters(filters, |k, v| {
                if let Some(tag_key) = k.strip_prefix("tag:") {
                    tags.get(tag_key).map(|tv| tv == v).unwrap_or(false)
                } else if k == "instance-state-name" {
                    instance_state_name(inst.state) == v
                } else {
                    true
                }
            }))
            .map(|(inst, _)| inst.clone())
            .collect())
    }

    async fn run_instances(
        &self,
        spec: &RunInstancesSpec,
    ) -> Result<RunInstancesResult, CloudError> {
        let id = self.alloc_id("i");
        let spot_id = spec.market_options.as_ref().map(|_| self.alloc_id("sir"));

        let mut tags = BTreeMap::new();
        for tag_spec in &spec.tag_specifications {
            for (k, v) in &tag_spec.tags {
                tags.insert(k.clone(), v.clone());
            }
        }

        let instance = Instance {
            id: id.clone(),
            instance_type: spec.instance_type.clone(),
            private_ip: Some("10.0.0.10".to_string()),
            lifecycle: if spec.market_options.is_some() {
                InstanceLifecycle::Spot
            } else {
                InstanceLifecycle::OnDemand
            },
            // Real EC2 takes seconds to transition pending -> running; since
            // this double has no lifecycle clock of its own, new instances
            // start usable immediately.
            state: InstanceState::Running,
            state_transition_reason: String::new(),
            block_device_mappings: Vec::new(),
            network_interfaces: Vec::new(),
            spot_request_id: spot_id.clone(),
        };

        if let Some(ref sid) = spot_id {
            self.spot_requests.lock().unwrap().insert(
                sid.clone(),
                SpotRequest {
                    id: sid.clone(),
                    state: SpotRequestState::Active,
                    instance_id: Some(id.clone()),
                },
            );
        }

        let result = RunInstancesResult {
            instance_id: id.clone(),
            private_ip: instance.private_ip.clone(),
            spot_instance_request_id: spot_id,
        };
        self.instances.lock().unwrap().insert(id, (instance, tags));
        Ok(result)
    }

    async fn terminate_instances(&self, ids: &[String]) -> Result<(), CloudError> {
        let mut instances = self.instances.lock().unwrap();
        let mut calls = self.terminate_calls.lock().unwrap();
        for id in ids {
            if let Some((inst, _)) = instances.get_mut(id) {
                inst.state = InstanceState::Terminated;
            }
            calls.push(id.clone());
        }
        Ok(())
    }

    async fn describe_spot_requests(
        &self,
        _filters: &[(&str, &str)],
        ids: &[String],
    ) -> Result<Vec<SpotRequest>, CloudError> {
        let requests = self.spot_requests.lock().unwrap();
        if ids.is_empty() {
            Ok(requests.values().cloned().collect())
        } else {
            Ok(ids.iter().filter_map(|id| requests.get(id).cloned()).collect())
        }
    }

    async fn cancel_spot_requests(&self, ids: &[String]) -> Result<(), CloudError> {
        let mut requests = self.spot_requests.lock().unwrap();
        for id in ids {
            if let Some(req) = requests.get_mut(id) {
                req.state = SpotRequestState::Cancelled;
            }
        }
        Ok(())
    }

    async fn stop_instances(&self, ids: &[String], _hibernate: bool) -> Result<(), CloudError> {
        let mut instances = self.instances.lock().unwrap();
        for id in ids {
            if let Some((inst, _)) = instances.get_mut(id) {
                inst.state = InstanceState::Stopped;
            }
        }
        Ok(())
    }

    async fn start_instances(&self, ids: &[String]) -> Result<(), CloudError> {
        let mut instances = self.instances.lock().unwrap();
        for id in ids {
            if let Some((inst, _)) = instances.get_mut(id) {
                inst.state = InstanceState::Running;
            }
        }
        Ok(())
    }

    async fn describe_instance_status(
        &self,
        ids: &[String],
        _filters: &[(&str, &str)],
    ) -> Result<Vec<InstanceStatusSummary>, CloudError> {
        let instances = self.instances.lock().unwrap();
        Ok(ids
            .iter()
            .filter_map(|id| {
                instances.get(id).map(|(inst, _)| InstanceStatusSummary {
                    instance_id: inst.id.clone(),
                    reachability_passed: inst.state == InstanceState::Running,
                })
            })
            .collect())
    }

    async fn detach_volume(&self, _volume_id: &str, _instance_id: &str) -> Result<(), CloudError> {
        Ok(())
    }

    async fn attach_volume(
        &self,
        _device: &str,
        _instance_id: &str,
        _volume_id: &str,
    ) -> Result<(), CloudError> {
        Ok(())
    }

    async fn delete_volume(&self, _volume_id: &str) -> Result<(), CloudError> {
        Ok(())
    }

    async fn modify_network_interface_attribute(
        &self,
        _eni_id: &str,
        _attachment_id: &str,
        _delete_on_termination: bool,
    ) -> Result<(), CloudError> {
        Ok(())
    }

    async fn describe_launch_template_versions(
        &self,
        launch_template_id: &str,
    ) -> Result<LaunchTemplateVersion, CloudError> {
        self.launch_templates
            .lock()
            .unwrap()
            .get(launch_template_id)
            .cloned()
            .ok_or_else(|| CloudError::Parse(format!("no such launch template: {launch_template_id}")))
    }

    async fn create_tags(&self, ids: &[String], tags: &[(String, String)]) -> Result<(), CloudError> {
        let mut instances = self.instances.lock().unwrap();
        for id in ids {
            if let Some((_, existing_tags)) = instances.get_mut(id) {
                for (k, v) in tags {
                    existing_tags.insert(k.clone(), v.clone());
                }
            }
        }
        Ok(())
    }
}

/// Mirrors the real API's filter semantics: values for the same filter name
/// are OR'd together, different filter names are AND'd.
fn matches_grouped_filters(filters: &[(&str, &str)], matches: impl Fn(&str, &str) -> bool) -> bool {
    let mut grouped: Vec<(&str, Vec<&str>)> = Vec::new();
    for &(name, value) in filters {
        match grouped.iter_mut().find(|entry| entry.0 == name) {
            Some(entry) => entry.1.push(value),
            None => grouped.push((name, vec![value])),
        }
    }
    grouped
        .iter()
        .all(|&(name, ref values)| values.iter().any(|&v| matches(name, v)))
}

fn instance_state_name(state: InstanceState) -> &'static str {
    match state {
        InstanceState::Pending => "pending",
        InstanceState::Running => "running",
        InstanceState::Stopping => "stopping",
        InstanceState::Stopped => "stopped",
        InstanceState::Terminated => "terminated",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MarketOptions, TagSpec};

    #[tokio::test]
    async fn run_instances_records_tags_and_spot_request() {
        let client = FakeCloudClient::new();
        let spec = RunInstancesSpec {
            instance_type: "m5.large".into(),
            market_options: Some(MarketOptions {
                spot_instance_type: "persistent".into(),
                instance_interruption_behavior: "stop".into(),
            }),
            tag_specifications: vec![TagSpec {
                resource_type: "instance".into(),
                tags: vec![("nodegroup".into(), "p1-ng1".into())],
            }],
            ..Default::default()
        };
        let result = client.run_instances(&spec).await.unwrap();
        assert!(result.spot_instance_request_id.is_some());

        let found = client
            .describe_instances(&[("tag:nodegroup", "p1-ng1")])
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, result.instance_id);
    }

    #[tokio::test]
    async fn terminate_instances_marks_terminated_and_records_call() {
        let client = FakeCloudClient::new();
        let spec = RunInstancesSpec {
            instance_type: "m5.large".into(),
            ..Default::default()
        };
        let result = client.run_instances(&spec).await.unwrap();
        client
            .terminate_instances(&[result.instance_id.clone()])
            .await
            .unwrap();
        assert_eq!(client.terminate_calls(), vec![result.instance_id.clone()]);

        let status = client
            .describe_instance_status(&[result.instance_id], &[])
            .await
            .unwrap();
        assert!(status.is_empty() || !status[0].reachability_passed);
    }
}
