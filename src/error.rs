//! Buffer errors

pub type Result<T> = std::result::Result<T, BufferError>;

#[derive(Debug, thiserror::Error)]
pub enum BufferError {
    #[error("Invalid configuration for {field}: {reason}")]
    InvalidConfig { field: &'static str, reason: String },
    #[error("Cluster {cluster} has no capacity: {clusters} clusters share a global size of {global_size}")]
    ZeroClusterCapacity {
        cluster: String,
        clusters: usize,
        global_size: usize,
    },
    #[error("Failed to parse configuration: {0}")]
    Json(#[from] serde_json::Error),
}

impl BufferError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        BufferError::InvalidConfig {
            field,
            reason: reason.into(),
        }
    }
}
