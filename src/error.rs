//! Error types for query execution

use thiserror::Error;

pub type Result<T> = std::result::Result<T, QueryError>;

#[derive(Error, Debug)]
pub enum QueryError {
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Invalid node id: {0:?}")]
    InvalidNodeId(String),

    #[error("Stage {stage}: {reason}")]
    InvalidDescriptor { stage: usize, reason: String },

    #[error("Cyclic ancestry detected at node {0}")]
    CyclicAncestry(String),

    #[error("Ancestor chain of {node} exceeds maximum depth {max}")]
    DepthExceeded { node: String, max: usize },

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Storage error: {0}")]
    Storage(#[from] rocksdb::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Query task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("Query service is shut down")]
    ServiceClosed,
}

impl QueryError {
    pub fn descriptor(stage: usize, reason: impl Into<String>) -> Self {
        QueryError::InvalidDescriptor {
            stage,
            reason: reason.into(),
        }
    }

    /// Error code reported alongside failed queries
    pub fn code(&self) -> &'static str {
        match self {
            QueryError::NodeNotFound(_) => "NODE_NOT_FOUND",
            QueryError::InvalidNodeId(_) => "INVALID_NODE_ID",
            QueryError::InvalidDescriptor { .. } => "INVALID_DESCRIPTOR",
            QueryError::CyclicAncestry(_) | QueryError::DepthExceeded { .. } => "DATA_INTEGRITY",
            QueryError::Config(_) | QueryError::Metrics(_) => "CONFIGURATION",
            QueryError::ServiceClosed => "SERVICE_CLOSED",
            _ => "BACKEND_UNAVAILABLE",
        }
    }

    /// The executor never retries; this only tells callers whether a retry
    /// could change the outcome.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            QueryError::Backend(_) | QueryError::Storage(_) | QueryError::Io(_) | QueryError::Task(_)
        )
    }
}
