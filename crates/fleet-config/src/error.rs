use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("json parse error in {path}: {source}")]
    JsonParse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("validation error in {path}: {message}")]
    Validation { path: String, message: String },

    #[error("domain error: {0}")]
    Domain(#[from] fleet_domain::DomainError),
}
