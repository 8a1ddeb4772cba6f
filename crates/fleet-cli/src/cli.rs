use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "fleetd",
    about = "One-shot reconciliation sweep between a Slurm-like scheduler and its cloud-provisioned nodes",
    version
)]
pub struct Cli {
    /// Path to the JSON config file (partitions, nodegroups, region, log settings).
    #[arg(long, default_value = "/etc/fleetd/config.json")]
    pub config: PathBuf,

    /// Prefix used when naming per-nodegroup advisory lock files.
    #[arg(long, default_value = "fleetd")]
    pub stack_prefix: String,

    /// Hosts file updated with newly acquired nodes' addresses.
    #[arg(long, default_value = "/etc/hosts")]
    pub hosts_path: PathBuf,

    /// Advisory lock guarding the hosts file above.
    #[arg(long, default_value = "/etc/hosts.lock")]
    pub hosts_lock_path: PathBuf,

    /// Directory holding the per-nodegroup advisory lock files.
    #[arg(long, default_value = "/tmp")]
    pub lock_dir: PathBuf,
}
