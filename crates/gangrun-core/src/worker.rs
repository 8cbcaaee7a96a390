//! Worker metadata

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::Resources;

/// Static description of a spawned worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerInfo {
    /// Unique worker identifier
    pub id: Uuid,
    /// Rank assigned at spawn time
    pub world_rank: u32,
    /// Number of workers in the group
    pub world_size: u32,
    /// Host identity of the node the worker runs on
    pub hostname: String,
    /// IP address of that node
    pub node_address: String,
    /// Resources reserved for this worker
    pub resources: Resources,
    /// Device ids allotted to this worker
    pub gpu_ids: Vec<u32>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

impl WorkerInfo {
    /// Create a new worker description
    pub fn new(world_rank: u32, world_size: u32, hostname: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            world_rank,
            world_size,
            hostname: hostname.into(),
            node_address: "127.0.0.1".to_string(),
            resources: Resources::default(),
            gpu_ids: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_resources(mut self, resources: Resources, gpu_ids: Vec<u32>) -> Self {
        self.resources = resources;
        self.gpu_ids = gpu_ids;
        self
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.node_address = address.into();
        self
    }
}

/// Worker lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    /// Spawned, no executable yet
    Idle,
    /// Executable instantiated
    Running,
    /// Worker has been shut down
    Terminated,
    /// Executable construction failed
    Error,
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerStatus::Idle => write!(f, "Idle"),
            WorkerStatus::Running => write!(f, "Running"),
            WorkerStatus::Terminated => write!(f, "Terminated"),
            WorkerStatus::Error => write!(f, "Error"),
        }
    }
}
