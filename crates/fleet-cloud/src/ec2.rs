use async_trait::async_trait;
use fleet_domain::{
    BlockDeviceMapping, Instance, InstanceLifecycle, InstanceState, NetworkInterface, SpotRequest,
    SpotRequestState,
};

use crate::client::CloudApi;
use crate::credentials::{
    AwsCliCredentialsProvider, CredentialsProvider, ImdsCredentialsProvider,
    StaticCredentialsProvider,
};
use crate::error::CloudError;
use crate::sigv4::{sigv4_headers, url_encode, url_host};
use crate::types::{InstanceStatusSummary, LaunchTemplateVersion, RunInstancesResult, RunInstancesSpec};
use crate::xml::{xml_block, xml_error_code, xml_error_message, xml_items, xml_text};

const API_VERSION: &str = "2016-11-15";

/// Signs and sends EC2 Query API requests against a single region.
pub struct Ec2CloudClient {
    http: reqwest::Client,
    credentials: Box<dyn CredentialsProvider>,
    region: String,
    endpoint: String,
}

impl Ec2CloudClient {
    /// Builds a client whose credentials come from the standard chain:
    /// static env vars, then ECS task-metadata, then EC2 IMDSv2, then the
    /// AWS CLI's own configured credentials as a last resort.
    pub async fn new(region: impl Into<String>) -> Self {
        let region = region.into();
        let endpoint = format!("https://ec2.{region}.amazonaws.com");
        let http = reqwest::Client::new();
        let credentials = Self::autodetect_credentials(&http).await;
        Ec2CloudClient {
            http,
            credentials,
            region,
            endpoint,
        }
    }

    async fn autodetect_credentials(http: &reqwest::Client) -> Box<dyn CredentialsProvider> {
        if let (Ok(key), Ok(secret)) = (
            std::env::var("AWS_ACCESS_KEY_ID"),
            std::env::var("AWS_SECRET_ACCESS_KEY"),
        ) {
            return Box::new(StaticCredentialsProvider {
                access_key_id: key,
                secret_access_key: secret,
                session_token: std::env::var("AWS_SESSION_TOKEN").ok(),
            });
        }

        if let Ok(ecs_uri) = std::env::var("AWS_CONTAINER_CREDENTIALS_RELATIVE_URI") {
            return Box::new(ImdsCredentialsProvider {
                client: http.clone(),
                ecs_uri: Some(ecs_uri),
                cache: tokio::sync::Mutex::new(None),
            });
        }

        let probe = http
            .put("http://169.254.169.254/latest/api/token")
            .header("X-aws-ec2-metadata-token-ttl-seconds", "60")
            .timeout(std::time::Duration::from_secs(2))
            .send()
            .await;
        if probe.is_ok() {
            Box::new(ImdsCredentialsProvider {
                client: http.clone(),
                ecs_uri: None,
                cache: tokio::sync::Mutex::new(None),
            })
        } else {
            Box::new(AwsCliCredentialsProvider)
        }
    }

    #[cfg(test)]
    pub(crate) fn with_test_config(
        endpoint: impl Into<String>,
        region: impl Into<String>,
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<String>,
    ) -> Self {
        Ec2CloudClient {
            http: reqwest::Client::new(),
            credentials: Box::new(crate::credentials::StaticCredentials {
                access_key_id: access_key_id.into(),
                secret_access_key: secret_access_key.into(),
                session_token: None,
            }),
            region: region.into(),
            endpoint: endpoint.into(),
        }
    }

    async fn query_api(
        &self,
        action: &str,
        mut params: Vec<(String, String)>,
    ) -> Result<String, CloudError> {
        params.push(("Action".into(), action.to_string()));
        params.push(("Version".into(), API_VERSION.to_string()));
        params.sort();

        let body = params
            .iter()
            .map(|(k, v)| format!("{}={}", url_encode(k), url_encode(v)))
            .collect::<Vec<_>>()
            .join("&");

        let creds = self.credentials.credentials().await?;
        let host = url_host(&self.endpoint).to_string();
        let headers = sigv4_headers(
            "POST",
            "/",
            "",
            "application/x-www-form-urlencoded",
            body.as_bytes(),
            &creds,
            &self.region,
            "ec2",
            &host,
        );

        let mut req = self
            .http
            .post(&self.endpoint)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(body);
        for (k, v) in &headers {
            req = req.header(k.as_str(), v.as_str());
        }

        let resp = req
            .send()
            .await
            .map_err(|e| CloudError::Request(format!("{action}: {e}")))?;
        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| CloudError::Request(format!("{action}: {e}")))?;

        if !status.is_success() {
            return Err(CloudError::Api {
                action: action.to_string(),
                code: xml_error_code(&text),
                message: xml_error_message(&text),
            });
        }
        Ok(text)
    }
}

/// Groups filters by name so repeated `(name, value)` pairs become multiple
/// `Filter.N.Value.M` entries (OR'd) under the same `Filter.N`, rather than
/// separate filters (AND'd) that could never all match at once.
fn filter_params(filters: &[(&str, &str)]) -> Vec<(String, String)> {
    let mut grouped: Vec<(&str, Vec<&str>)> = Vec::new();
    for &(name, value) in filters {
        match grouped.iter_mut().find(|entry| entry.0 == name) {
            Some(entry) => entry.1.push(value),
            None => grouped.push((name, vec![value])),
        }
    }
    let mut out = Vec::new();
    for (i, entry) in grouped.iter().enumerate() {
        let n = i + 1;
        out.push((format!("Filter.{n}.Name"), entry.0.to_string()));
        for (j, value) in entry.1.iter().enumerate() {
            out.push((format!("Filter.{n}.Value.{}", j + 1), value.to_string()));
        }
    }
    out
}

fn id_params(prefix: &str, ids: &[String]) -> Vec<(String, String)> {
    ids.iter()
        .enumerate()
        .map(|(i, id)| (format!("{prefix}.{}", i + 1), id.clone()))
        .collect()
}

fn parse_instance(item: &str) -> Result<Instance, CloudError> {
    let id = xml_text(item, "instanceId")
        .ok_or_else(|| CloudError::Parse("instanceId missing".into()))?;
    let instance_type = xml_text(item, "instanceType").unwrap_or_default();
    let private_ip = xml_text(item, "privateIpAddress");
    let lifecycle = match xml_text(item, "instanceLifecycle").as_deref() {
        Some("spot") => InstanceLifecycle::Spot,
        _ => InstanceLifecycle::OnDemand,
    };

    let state_block = xml_block(item, "instanceState").unwrap_or_default();
    let state_name = xml_text(&state_block, "name").unwrap_or_default();
    let state = match state_name.as_str() {
        "pending" => InstanceState::Pending,
        "running" => InstanceState::Running,
        "stopping" => InstanceState::Stopping,
        "stopped" => InstanceState::Stopped,
        "terminated" | "shutting-down" => InstanceState::Terminated,
        other => return Err(CloudError::Parse(format!("unknown instance state: {other}"))),
    };

    let state_transition_reason = xml_text(item, "stateTransitionReason").unwrap_or_default();
    let spot_request_id = xml_text(item, "spotInstanceRequestId");

    let mut block_device_mappings = Vec::new();
    if let Some(bdm_set) = xml_block(item, "blockDeviceMapping") {
        for bdm in xml_items(&bdm_set, "item") {
            let device_name = xml_text(&bdm, "deviceName").unwrap_or_default();
            let ebs = xml_block(&bdm, "ebs").unwrap_or_default();
            let volume_id = xml_text(&ebs, "volumeId").unwrap_or_default();
            block_device_mappings.push(BlockDeviceMapping {
                device_name,
                volume_id,
            });
        }
    }

    let mut network_interfaces = Vec::new();
    if let Some(eni_set) = xml_block(item, "networkInterfaceSet") {
        for eni in xml_items(&eni_set, "item") {
            let eni_id = xml_text(&eni, "networkInterfaceId").unwrap_or_default();
            let eni_private_ip = xml_text(&eni, "privateIpAddress");
            let attachment = xml_block(&eni, "attachment").unwrap_or_default();
            let attachment_id = xml_text(&attachment, "attachmentId").unwrap_or_default();
            let card_index = xml_text(&attachment, "deviceIndex")
                .and_then(|s| s.parse().ok())
                .unwrap_or(0);
            network_interfaces.push(NetworkInterface {
                eni_id,
                attachment_id,
                card_index,
                private_ip: eni_private_ip,
            });
        }
    }

    Ok(Instance {
        id,
        instance_type,
        private_ip,
        lifecycle,
        state,
        state_transition_reason,
        block_device_mappings,
        network_interfaces,
        spot_request_id,
    })
}

#[async_trait]
impl CloudApi for Ec2CloudClient {
    async fn describe_instances(
        &self,
        filters: &[(&str, &str)],
    ) -> Result<Vec<Instance>, CloudError> {
        let xml = self
            .query_api("DescribeInstances", filter_params(filters))
            .await?;
        let reservation_set = xml_block(&xml, "reservationSet").unwrap_or_default();
        let mut instances = Vec::new();
        for reservation in xml_items(&reservation_set, "item") {
            let instances_set = xml_block(&reservation, "instancesSet").unwrap_or_default();
            for item in xml_items(&instances_set, "item") {
                instances.push(parse_instance(&item)?);
            }
        }
        Ok(instances)
    }

    async fn run_instances(
        &self,
        spec: &RunInstancesSpec,
    ) -> Result<RunInstancesResult, CloudError> {
        let mut params = vec![
            ("MinCount".to_string(), "1".to_string()),
            ("MaxCount".to_string(), "1".to_string()),
        ];
        if let Some(lt) = &spec.launch_template_id {
            params.push(("LaunchTemplate.LaunchTemplateId".into(), lt.clone()));
        }
        if !spec.instance_type.is_empty() {
            params.push(("InstanceType".into(), spec.instance_type.clone()));
        }
        if let Some(subnet) = &spec.subnet_id {
            params.push(("SubnetId".into(), subnet.clone()));
        }
        if let Some(market) = &spec.market_options {
            params.push(("InstanceMarketOptions.MarketType".into(), "spot".into()));
            params.push((
                "InstanceMarketOptions.SpotOptions.SpotInstanceType".into(),
                market.spot_instance_type.clone(),
            ));
            params.push((
                "InstanceMarketOptions.SpotOptions.InstanceInterruptionBehavior".into(),
                market.instance_interruption_behavior.clone(),
            ));
        }
        params.push((
            "HibernationOptions.Configured".into(),
            spec.hibernation_configured.to_string(),
        ));
        for (i, eni) in spec.network_interfaces.iter().enumerate() {
            let n = i + 1;
            params.push((
                format!("NetworkInterface.{n}.DeviceIndex"),
                eni.device_index.to_string(),
            ));
            params.push((
                format!("NetworkInterface.{n}.NetworkInterfaceId"),
                eni.network_interface_id.clone(),
            ));
        }
        for (i, tag_spec) in spec.tag_specifications.iter().enumerate() {
            let n = i + 1;
            params.push((
                format!("TagSpecification.{n}.ResourceType"),
                tag_spec.resource_type.clone(),
            ));
            for (j, (k, v)) in tag_spec.tags.iter().enumerate() {
                let m = j + 1;
                params.push((format!("TagSpecification.{n}.Tag.{m}.Key"), k.clone()));
                params.push((format!("TagSpecification.{n}.Tag.{m}.Value"), v.clone()));
            }
        }
        params.extend(spec.extra_params.iter().cloned());

        let xml = self.query_api("RunInstances", params).await?;
        let instances_set = xml_block(&xml, "instancesSet").unwrap_or_default();
        let item = xml_items(&instances_set, "item")
            .into_iter()
            .next()
            .ok_or_else(|| CloudError::Parse("RunInstances returned no instance".into()))?;
        Ok(RunInstancesResult {
            instance_id: xml_text(&item, "instanceId")
                .ok_or_else(|| CloudError::Parse("instanceId missing".into()))?,
            private_ip: xml_text(&item, "privateIpAddress"),
            spot_instance_request_id: xml_text(&item, "spotInstanceRequestId"),
        })
    }

    async fn terminate_instances(&self, ids: &[String]) -> Result<(), CloudError> {
        self.query_api("TerminateInstances", id_params("InstanceId", ids))
            .await?;
        Ok(())
    }

    async fn describe_spot_requests(
        &self,
        filters: &[(&str, &str)],
        ids: &[String],
    ) -> Result<Vec<SpotRequest>, CloudError> {
        let mut params = filter_params(filters);
        params.extend(id_params("SpotInstanceRequestId", ids));
        let xml = self
            .query_api("DescribeSpotInstanceRequests", params)
            .await?;
        let set = xml_block(&xml, "spotInstanceRequestSet").unwrap_or_default();
        let mut out = Vec::new();
        for item in xml_items(&set, "item") {
            let id = xml_text(&item, "spotInstanceRequestId")
                .ok_or_else(|| CloudError::Parse("spotInstanceRequestId missing".into()))?;
            let state = match xml_text(&item, "state").unwrap_or_default().as_str() {
                "open" => SpotRequestState::Open,
                "active" => SpotRequestState::Active,
                "cancelled" => SpotRequestState::Cancelled,
                "closed" => SpotRequestState::Closed,
                "failed" => SpotRequestState::Failed,
                other => {
                    return Err(CloudError::Parse(format!(
                        "unknown spot request state: {other}"
                    )))
                }
            };
            out.push(SpotRequest {
                id,
                state,
                instance_id: xml_text(&item, "instanceId"),
            });
        }
        Ok(out)
    }

    async fn cancel_spot_requests(&self, ids: &[String]) -> Result<(), CloudError> {
        self.query_api(
            "CancelSpotInstanceRequests",
            id_params("SpotInstanceRequestId", ids),
        )
        .await?;
        Ok(())
    }

    async fn stop_instances(&self, ids: &[String], hibernate: bool) -> Result<(), CloudError> {
        let mut params = id_params("InstanceId", ids);
        if hibernate {
            params.push(("Hibernate".into(), "true".into()));
        }
        self.query_api("StopInstances", params).await?;
        Ok(())
    }

    async fn start_instances(&self, ids: &[String]) -> Result<(), CloudError> {
        self.query_api("StartInstances", id_params("InstanceId", ids))
            .await?;
        Ok(())
    }

    async fn describe_instance_status(
        &self,
        ids: &[String],
        filters: &[(&str, &str)],
    ) -> Result<Vec<InstanceStatusSummary>, CloudError> {
        let mut params = id_params("InstanceId", ids);
        params.extend(filter_params(filters));
        params.push(("IncludeAllInstances".into(), "true".into()));
        let xml = self.query_api("DescribeInstanceStatus", params).await?;
        let set = xml_block(&xml, "instanceStatusSet").unwrap_or_default();
        let mut out = Vec::new();
        for item in xml_items(&set, "item") {
            let instance_id = xml_text(&item, "instanceId")
                .ok_or_else(|| CloudError::Parse("instanceId missing".into()))?;
            let reach_block = xml_block(&item, "instanceStatus").unwrap_or_default();
            let status = xml_text(&reach_block, "status").unwrap_or_default();
            out.push(InstanceStatusSummary {
                instance_id,
                reachability_passed: status == "ok",
            });
        }
        Ok(out)
    }

    async fn detach_volume(&self, volume_id: &str, instance_id: &str) -> Result<(), CloudError> {
        let params = vec![
            ("VolumeId".into(), volume_id.to_string()),
            ("InstanceId".into(), instance_id.to_string()),
        ];
        self.query_api("DetachVolume", params).await?;
        Ok(())
    }

    async fn attach_volume(
        &self,
        device: &str,
        instance_id: &str,
        volume_id: &str,
    ) -> Result<(), CloudError> {
        let params = vec![
            ("Device".into(), device.to_string()),
            ("InstanceId".into(), instance_id.to_string()),
            ("VolumeId".into(), volume_id.to_string()),
        ];
        self.query_api("AttachVolume", params).await?;
        Ok(())
    }

    async fn delete_volume(&self, volume_id: &str) -> Result<(), CloudError> {
        self.query_api(
            "DeleteVolume",
            vec![("VolumeId".into(), volume_id.to_string())],
        )
        .await?;
        Ok(())
    }

    async fn modify_network_interface_attribute(
        &self,
        eni_id: &str,
        attachment_id: &str,
        delete_on_termination: bool,
    ) -> Result<(), CloudError> {
        let params = vec![
            ("NetworkInterfaceId".into(), eni_id.to_string()),
            ("Attachment.AttachmentId".into(), attachment_id.to_string()),
            (
                "Attachment.DeleteOnTermination".into(),
                delete_on_termination.to_string(),
            ),
        ];
        self.query_api("ModifyNetworkInterfaceAttribute", params)
            .await?;
        Ok(())
    }

    async fn describe_launch_template_versions(
        &self,
        launch_template_id: &str,
    ) -> Result<LaunchTemplateVersion, CloudError> {
        let params = vec![
            ("LaunchTemplateId".into(), launch_template_id.to_string()),
            ("Versions.1".into(), "$Latest".into()),
        ];
        let xml = self
            .query_api("DescribeLaunchTemplateVersions", params)
            .await?;
        let set = xml_block(&xml, "launchTemplateVersionSet").unwrap_or_default();
        let item = xml_items(&set, "item").into_iter().next().ok_or_else(|| {
            CloudError::Parse("no launch template version returned".into())
        })?;
        let data = xml_block(&item, "launchTemplateData").unwrap_or_default();
        let image_id = xml_text(&data, "imageId");
        let key_name = xml_text(&data, "keyName");
        let instance_type = xml_text(&data, "instanceType");

        let mut extra_params = Vec::new();
        if let Some(id) = &image_id {
            extra_params.push(("ImageId".to_string(), id.clone()));
        }
        if let Some(kn) = &key_name {
            extra_params.push(("KeyName".to_string(), kn.clone()));
        }

        Ok(LaunchTemplateVersion {
            image_id,
            key_name,
            instance_type,
            extra_params,
        })
    }

    async fn create_tags(&self, ids: &[String], tags: &[(String, String)]) -> Result<(), CloudError> {
        let mut params = id_params("ResourceId", ids);
        for (i, (k, v)) in tags.iter().enumerate() {
            let n = i + 1;
            params.push((format!("Tag.{n}.Key"), k.clone()));
            params.push((format!("Tag.{n}.Value"), v.clone()));
        }
        self.query_api("CreateTags", params).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_client(endpoint: &str) -> Ec2CloudClient {
        Ec2CloudClient::with_test_config(endpoint, "us-east-1", "AKIDTEST", "secretkey")
    }

    #[tokio::test]
    async fn describe_instances_parses_nested_xml() {
        let server = MockServer::start().await;
        let body = r#"<DescribeInstancesResponse>
            <reservationSet>
                <item>
                    <instancesSet>
                        <item>
                            <instanceId>i-0123</instanceId>
                            <instanceType>m5.large</instanceType>
                            <privateIpAddress>10.0.0.5</privateIpAddress>
                            <instanceState><name>running</name></instanceState>
                            <stateTransitionReason></stateTransitionReason>
                            <blockDeviceMapping>
                                <item>
                                    <deviceName>/dev/xvda</deviceName>
                                    <ebs><volumeId>vol-1</volumeId></ebs>
                                </item>
                            </blockDeviceMapping>
                            <networkInterfaceSet>
                                <item>
                                    <networkInterfaceId>eni-1</networkInterfaceId>
                                    <privateIpAddress>10.0.0.5</privateIpAddress>
                                    <attachment>
                                        <attachmentId>eni-attach-1</attachmentId>
                                        <deviceIndex>0</deviceIndex>
                                    </attachment>
                                </item>
                            </networkInterfaceSet>
                        </item>
                    </instancesSet>
                </item>
            </reservationSet>
        </DescribeInstancesResponse>"#;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;

        let client = test_client(&server.uri());
        let instances = client.describe_instances(&[]).await.unwrap();
        assert_eq!(instances.len(), 1);
        let inst = &instances[0];
        assert_eq!(inst.id, "i-0123");
        assert_eq!(inst.state, InstanceState::Running);
        assert_eq!(inst.block_device_mappings.len(), 1);
        assert_eq!(inst.network_interfaces.len(), 1);
        assert_eq!(inst.network_interfaces[0].attachment_id, "eni-attach-1");
    }

    #[tokio::test]
    async fn error_response_surfaces_code_and_message() {
        let server = MockServer::start().await;
        let body = r#"<Response><Errors><Error><Code>InvalidInstanceID.NotFound</Code><Message>no such instance</Message></Error></Errors></Response>"#;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string(body))
            .mount(&server)
            .await;

        let client = test_client(&server.uri());
        let err = client
            .terminate_instances(&["i-missing".to_string()])
            .await
            .unwrap_err();
        match err {
            CloudError::Api { code, message, .. } => {
                assert_eq!(code, "InvalidInstanceID.NotFound");
                assert_eq!(message, "no such instance");
            }
            other => panic!("expected Api error, got {other:?}"),
        }
    }
}
