//! Worker trait definitions

use async_trait::async_trait;
use gangrun_core::{GangrunResult, WorkerInfo, WorkerStatus};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::executable::{ExecutableFactory, ExecuteFn, RunFn};

/// Handle to a worker process placed by the cluster scheduler
///
/// Every call is a request to the worker; calls on one worker are applied in
/// the order they are issued.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Spawn-time description of the worker
    fn info(&self) -> &WorkerInfo;

    /// World rank fixed at spawn time
    fn world_rank(&self) -> u32 {
        self.info().world_rank
    }

    /// Host identity the worker runs on
    async fn hostname(&self) -> GangrunResult<String>;

    /// Device ids the worker can currently see
    async fn gpu_ids(&self) -> GangrunResult<Vec<u32>>;

    /// Merge entries into the worker's environment
    async fn update_env_vars(&self, env: HashMap<String, String>) -> GangrunResult<()>;

    /// Snapshot of the worker's environment
    async fn env_vars(&self) -> GangrunResult<HashMap<String, String>>;

    /// Instantiate the user executable
    async fn start_executable(&self, factory: Arc<dyn ExecutableFactory>) -> GangrunResult<()>;

    /// Apply a function to the executable
    async fn execute(&self, f: ExecuteFn) -> GangrunResult<Value>;

    /// Apply a function on the worker
    async fn run(&self, f: RunFn) -> GangrunResult<Value>;

    /// Current lifecycle status
    async fn status(&self) -> GangrunResult<WorkerStatus>;

    /// Tear the worker down, dropping its executable
    async fn shutdown(&self) -> GangrunResult<()>;
}
