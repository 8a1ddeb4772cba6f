use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} exited with code {code}: {stderr}")]
    CommandFailed {
        command: String,
        code: i32,
        stderr: String,
    },

    #[error("duplicate NodeName in show-nodes output: {0}")]
    DuplicateNodeName(String),

    #[error("malformed show-nodes record: {0}")]
    Parse(String),

    #[error("domain error: {0}")]
    Domain(#[from] fleet_domain::DomainError),
}
