use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use fleet_domain::{Node, NodeName};
use tokio::process::Command;
use tracing::{debug, error};

use crate::error::SchedulerError;
use crate::parse::parse_show_nodes;

/// Recognized mutation keys, exactly the set the core ever writes.
pub const UPDATE_PARAM_KEYS: &[&str] =
    &["state", "reason", "nodeaddr", "nodehostname", "comment", "weight"];

#[async_trait]
pub trait SchedulerClient: Send + Sync {
    async fn load_nodes(&self) -> Result<BTreeMap<NodeName, Node>, SchedulerError>;
    async fn update_node(
        &self,
        name: &NodeName,
        params: &[(&str, &str)],
    ) -> Result<(), SchedulerError>;
}

/// Drives the real Slurm `scontrol` binary.
pub struct SlurmScheduler {
    bin_path: PathBuf,
}

impl SlurmScheduler {
    /// `bin_path` must already end with `/`, matching [`fleet_config::Config::slurm_bin_path`].
    pub fn new(bin_path: PathBuf) -> Self {
        SlurmScheduler { bin_path }
    }

    fn scontrol(&self) -> PathBuf {
        self.bin_path.join("scontrol")
    }

    async fn run(&self, args: &[&str]) -> Result<String, SchedulerError> {
        let bin = self.scontrol();
        debug!(command = %bin.display(), ?args, "running scontrol");

        let output = Command::new(&bin)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| SchedulerError::Spawn {
                command: bin.display().to_string(),
                source: e,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            error!(command = %bin.display(), code = output.status.code(), %stderr, "scontrol failed");
            return Err(SchedulerError::CommandFailed {
                command: bin.display().to_string(),
                code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl SchedulerClient for SlurmScheduler {
    async fn load_nodes(&self) -> Result<BTreeMap<NodeName, Node>, SchedulerError> {
        let stdout = self.run(&["show", "nodes"]).await?;
        parse_show_nodes(&stdout)
    }

    async fn update_node(
        &self,
        name: &NodeName,
        params: &[(&str, &str)],
    ) -> Result<(), SchedulerError> {
        let nodename_arg = format!("nodename={}", name.0);
        let mut args: Vec<String> = vec!["update".to_string(), nodename_arg];
        for (k, v) in params {
            debug_assert!(
                UPDATE_PARAM_KEYS.contains(k),
                "unrecognized update param key: {k}"
            );
            args.push(format!("{k}={v}"));
        }
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run(&arg_refs).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_param_keys_cover_the_core_set() {
        for k in ["state", "reason", "nodeaddr", "nodehostname", "comment", "weight"] {
            assert!(UPDATE_PARAM_KEYS.contains(&k));
        }
    }
}
