use async_trait::async_trait;
use fleet_domain::{Instance, SpotRequest};

use crate::error::CloudError;
use crate::types::{InstanceStatusSummary, LaunchTemplateVersion, RunInstancesResult, RunInstancesSpec};

/// Everything the acquisition engine and reconciler need from the elastic
/// compute provider. One implementation talks to the real API over signed
/// HTTP requests; another is an in-memory double for tests.
#[async_trait]
pub trait CloudApi: Send + Sync {
    async fn describe_instances(
        &self,
        filters: &[(&str, &str)],
    ) -> Result<Vec<Instance>, CloudError>;

    async fn run_instances(
        &self,
        spec: &RunInstancesSpec,
    ) -> Result<RunInstancesResult, CloudError>;

    async fn terminate_instances(&self, ids: &[String]) -> Result<(), CloudError>;

    async fn describe_spot_requests(
        &self,
        filters: &[(&str, &str)],
        ids: &[String],
    ) -> Result<Vec<SpotRequest>, CloudError>;

    async fn cancel_spot_requests(&self, ids: &[String]) -> Result<(), CloudError>;

    async fn stop_instances(&self, ids: &[String], hibernate: bool) -> Result<(), CloudError>;

    async fn start_instances(&self, ids: &[String]) -> Result<(), CloudError>;

    async fn describe_instance_status(
        &self,
        ids: &[String],
        filters: &[(&str, &str)],
    ) -> Result<Vec<InstanceStatusSummary>, CloudError>;

    async fn detach_volume(&self, volume_id: &str, instance_id: &str) -> Result<(), CloudError>;

    async fn attach_volume(
        &self,
        device: &str,
        instance_id: &str,
        volume_id: &str,
    ) -> Result<(), CloudError>;

    async fn delete_volume(&self, volume_id: &str) -> Result<(), CloudError>;

    async fn modify_network_interface_attribute(
        &self,
        eni_id: &str,
        attachment_id: &str,
        delete_on_termination: bool,
    ) -> Result<(), CloudError>;

    async fn describe_launch_template_versions(
        &self,
        launch_template_id: &str,
    ) -> Result<LaunchTemplateVersion, CloudError>;

    async fn create_tags(&self, ids: &[String], tags: &[(String, String)]) -> Result<(), CloudError>;
}
