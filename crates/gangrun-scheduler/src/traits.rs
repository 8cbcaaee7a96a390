//! Cluster scheduler interface

use async_trait::async_trait;
use gangrun_core::{BundleRef, GangrunResult, PlacementGroupId, PlacementPolicy, Resources};
use gangrun_runtime::Worker;
use std::sync::Arc;

/// Request to start one worker inside a reserved bundle
#[derive(Debug, Clone, Copy)]
pub struct SpawnRequest {
    /// Bundle the worker is bound to
    pub bundle: BundleRef,
    /// Resources carved out of the bundle for this worker
    pub resources: Resources,
    /// Rank assigned at spawn time
    pub world_rank: u32,
    /// Size of the worker group
    pub world_size: u32,
}

/// Cluster resource scheduler: places bundle groups and spawns workers
#[async_trait]
pub trait ClusterScheduler: Send + Sync {
    /// Request a placement group; placement may complete later
    async fn create_placement_group(
        &self,
        bundles: Vec<Resources>,
        policy: PlacementPolicy,
    ) -> GangrunResult<PlacementGroupId>;

    /// Resolve once every bundle of the group is reserved
    async fn wait_ready(&self, id: PlacementGroupId) -> GangrunResult<()>;

    /// Resources not reserved by any placement group
    async fn available_resources(&self) -> GangrunResult<Resources>;

    /// Release a placement group, its reservations and the workers bound to it
    async fn remove_placement_group(&self, id: PlacementGroupId) -> GangrunResult<()>;

    /// Start a worker bound to a bundle of a ready placement group
    async fn spawn_worker(&self, request: SpawnRequest) -> GangrunResult<Arc<dyn Worker>>;
}
