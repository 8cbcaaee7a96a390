//! Error types for gangrun

use thiserror::Error;

/// Main error type for gangrun
#[derive(Error, Debug)]
pub enum GangrunError {
    /// Invalid executor or cluster configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Placement group was not ready within the acquisition timeout
    #[error(
        "Placement group creation timed out after {timeout_secs}s. Make sure your cluster \
         either has enough resources or use an autoscaling cluster. Current resources \
         available: {available}, resources requested by the placement group: {requested}"
    )]
    ResourceTimeout {
        /// Requested bundle shapes
        requested: String,
        /// Resources the scheduler reported as available at timeout
        available: String,
        /// Timeout that elapsed
        timeout_secs: f64,
    },

    /// Co-located workers reported overlapping or missing devices
    #[error("Device isolation violated: {0}")]
    DeviceIsolation(String),

    /// A call to a worker failed
    #[error("Worker {rank} communication failed: {message}")]
    WorkerCommunication {
        /// World rank of the worker
        rank: u32,
        /// Failure description
        message: String,
    },

    /// Cluster scheduler error
    #[error("Scheduler error: {0}")]
    Scheduler(String),

    /// Rendezvous service error
    #[error("Rendezvous error: {0}")]
    Rendezvous(String),

    /// Worker runtime error
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// Operation requires a started executor
    #[error("Executor has not been started")]
    NotStarted,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Result type for gangrun operations
pub type GangrunResult<T> = Result<T, GangrunError>;

impl GangrunError {
    /// Build a worker communication error
    pub fn worker(rank: u32, message: impl Into<String>) -> Self {
        GangrunError::WorkerCommunication {
            rank,
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for GangrunError {
    fn from(err: serde_json::Error) -> Self {
        GangrunError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for GangrunError {
    fn from(err: toml::de::Error) -> Self {
        GangrunError::Config(err.to_string())
    }
}
