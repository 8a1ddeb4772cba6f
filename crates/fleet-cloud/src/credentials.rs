use std::process::Command as StdCommand;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;

use crate::error::CloudError;

#[derive(Clone, Debug)]
pub(crate) struct AwsCredentials {
    pub(crate) access_key_id: String,
    pub(crate) secret_access_key: String,
    pub(crate) session_token: Option<String>,
}

#[async_trait]
pub(crate) trait CredentialsProvider: Send + Sync {
    async fn credentials(&self) -> Result<AwsCredentials, CloudError>;
}

/// Static credentials from `AWS_ACCESS_KEY_ID` / `AWS_SECRET_ACCESS_KEY`.
pub(crate) struct StaticCredentialsProvider {
    pub(crate) access_key_id: String,
    pub(crate) secret_access_key: String,
    pub(crate) session_token: Option<String>,
}

#[async_trait]
impl CredentialsProvider for StaticCredentialsProvider {
    async fn credentials(&self) -> Result<AwsCredentials, CloudError> {
        Ok(AwsCredentials {
            access_key_id: self.access_key_id.clone(),
            secret_access_key: self.secret_access_key.clone(),
            session_token: self.session_token.clone(),
        })
    }
}

/// ECS task-metadata or EC2 IMDSv2 credentials, cached for 10 minutes.
pub(crate) struct ImdsCredentialsProvider {
    pub(crate) client: reqwest::Client,
    pub(crate) ecs_uri: Option<String>,
    pub(crate) cache: tokio::sync::Mutex<Option<(AwsCredentials, Instant)>>,
}

#[async_trait]
impl CredentialsProvider for ImdsCredentialsProvider {
    async fn credentials(&self) -> Result<AwsCredentials, CloudError> {
        {
            let guard = self.cache.lock().await;
            if let Some((creds, expiry)) = guard.as_ref() {
                if Instant::now() < *expiry {
                    return Ok(creds.clone());
                }
            }
        }

        let creds = if let Some(ref uri) = self.ecs_uri {
            let url = format!("http://169.254.170.2{}", uri);
            let resp: Value = self
                .client
                .get(&url)
                .send()
                .await
                .map_err(|e| CloudError::Credentials(format!("ECS IMDS request: {e}")))?
                .json()
                .await
                .map_err(|e| CloudError::Credentials(format!("ECS IMDS decode: {e}")))?;
            creds_from_json(&resp)
        } else {
            let token_resp = self
                .client
                .put("http://169.254.169.254/latest/api/token")
                .header("X-aws-ec2-metadata-token-ttl-seconds", "21600")
                .send()
                .await
                .map_err(|e| CloudError::Credentials(format!("IMDSv2 token request: {e}")))?;
            let imds_token = token_resp
                .text()
                .await
                .map_err(|e| CloudError::Credentials(format!("IMDSv2 token decode: {e}")))?;

            let roles_resp = self
                .client
                .get("http://169.254.169.254/latest/meta-data/iam/security-credentials/")
                .header("X-aws-ec2-metadata-token", &imds_token)
                .send()
                .await
                .map_err(|e| CloudError::Credentials(format!("IMDS roles request: {e}")))?;
            let roles_text = roles_resp.text().await.unwrap_or_default();
            let role_name = roles_text.lines().next().unwrap_or("").to_string();
            if role_name.is_empty() {
                return Err(CloudError::Credentials("IMDS: no IAM role found".into()));
            }

            let creds_url = format!(
                "http://169.254.169.254/latest/meta-data/iam/security-credentials/{role_name}"
            );
            let resp: Value = self
                .client
                .get(&creds_url)
                .header("X-aws-ec2-metadata-token", &imds_token)
                .send()
                .await
                .map_err(|e| CloudError::Credentials(format!("IMDS creds request: {e}")))?
                .json()
                .await
                .map_err(|e| CloudError::Credentials(format!("IMDS creds decode: {e}")))?;
            creds_from_json(&resp)
        };

        let expiry = Instant::now() + Duration::from_secs(600);
        *self.cache.lock().await = Some((creds.clone(), expiry));
        Ok(creds)
    }
}

fn creds_from_json(resp: &Value) -> AwsCredentials {
    AwsCredentials {
        access_key_id: resp["AccessKeyId"].as_str().unwrap_or("").to_string(),
        secret_access_key: resp["SecretAccessKey"].as_str().unwrap_or("").to_string(),
        session_token: resp["Token"].as_str().map(str::to_string),
    }
}

/// Last-resort fallback: shell out to the AWS CLI's own credential chain.
pub(crate) struct AwsCliCredentialsProvider;

#[async_trait]
impl CredentialsProvider for AwsCliCredentialsProvider {
    async fn credentials(&self) -> Result<AwsCredentials, CloudError> {
        let output = StdCommand::new("aws")
            .args([
                "sts",
                "get-session-token",
                "--duration-seconds",
                "3600",
                "--output",
                "json",
            ])
            .output()
            .map_err(|e| {
                CloudError::Credentials(format!(
                    "aws CLI not found: {e}. Install the AWS CLI or configure credentials via env vars."
                ))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CloudError::Credentials(format!(
                "aws sts get-session-token failed: {}. Run 'aws configure' first.",
                stderr.trim()
            )));
        }

        let resp: Value = serde_json::from_slice(&output.stdout)
            .map_err(|e| CloudError::Credentials(format!("aws CLI output parse: {e}")))?;
        let creds = &resp["Credentials"];
        Ok(AwsCredentials {
            access_key_id: creds["AccessKeyId"].as_str().unwrap_or("").to_string(),
            secret_access_key: creds["SecretAccessKey"].as_str().unwrap_or("").to_string(),
            session_token: creds["SessionToken"].as_str().map(str::to_string),
        })
    }
}

/// Injected credentials, used exclusively in tests.
#[cfg(test)]
pub(crate) struct StaticCredentials {
    pub(crate) access_key_id: String,
    pub(crate) secret_access_key: String,
    pub(crate) session_token: Option<String>,
}

#[cfg(test)]
#[async_trait]
impl CredentialsProvider for StaticCredentials {
    async fn credentials(&self) -> Result<AwsCredentials, CloudError> {
        Ok(AwsCredentials {
            access_key_id: self.access_key_id.clone(),
            secret_access_key: self.secret_access_key.clone(),
            session_token: self.session_token.clone(),
        })
    }
}
