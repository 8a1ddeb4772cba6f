use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("cloud error: {0}")]
    Cloud(#[from] fleet_cloud::CloudError),

    #[error("scheduler error: {0}")]
    Scheduler(#[from] fleet_scheduler::SchedulerError),

    #[error("hosts file lock timed out after 10s: {0}")]
    LockTimeout(String),

    #[error("hosts file io error: {0}")]
    HostsIo(String),
}
