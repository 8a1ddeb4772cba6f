use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("scheduler error: {0}")]
    Scheduler(#[from] fleet_scheduler::SchedulerError),

    #[error("cloud error: {0}")]
    Cloud(#[from] fleet_cloud::CloudError),

    #[error("acquisition engine error: {0}")]
    Engine(#[from] fleet_engine::EngineError),

    #[error("domain error: {0}")]
    Domain(#[from] fleet_domain::DomainError),

    #[error("advisory lock timed out after 10s: {0}")]
    LockTimeout(String),
}
