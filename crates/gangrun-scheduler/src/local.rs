//! In-process cluster scheduler
//!
//! `LocalCluster` models a set of nodes with CPU and GPU capacity. Placement
//! groups are placed all-or-nothing; a group that does not fit stays pending
//! and is retried whenever another group releases its resources.

use async_trait::async_trait;
use gangrun_core::{
    ClusterConfig, GangrunError, GangrunResult, GpuInfo, NodeConfig, PlacementGroupId,
    PlacementPolicy, Resources, WorkerInfo,
};
use gangrun_runtime::{LocalWorker, Worker};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::gpu_allocator::GpuAllocator;
use crate::traits::{ClusterScheduler, SpawnRequest};

struct NodeState {
    hostname: String,
    address: String,
    available_cpu: u32,
    gpus: GpuAllocator,
}

impl NodeState {
    fn available(&self) -> Resources {
        Resources::new(self.available_cpu, self.gpus.available_count())
    }
}

struct PlacedBundle {
    node: usize,
    reserved: Resources,
    remaining: Resources,
    /// Bundle devices not yet handed to a worker
    free_gpus: Vec<u32>,
}

struct GroupState {
    policy: PlacementPolicy,
    bundles: Vec<Resources>,
    placed: Option<Vec<PlacedBundle>>,
    ready: watch::Sender<bool>,
    workers: Vec<Arc<LocalWorker>>,
}

struct ClusterState {
    nodes: Vec<NodeState>,
    groups: HashMap<PlacementGroupId, GroupState>,
    /// Groups waiting for resources, oldest first
    pending: Vec<PlacementGroupId>,
}

impl ClusterState {
    /// Reserve resources for a group if all of its bundles fit
    fn try_place(&mut self, id: PlacementGroupId) -> GangrunResult<bool> {
        let group = self
            .groups
            .get_mut(&id)
            .ok_or_else(|| GangrunError::Scheduler(format!("Unknown placement group {}", id)))?;

        let Some(assignment) = plan_placement(&self.nodes, &group.bundles, group.policy) else {
            return Ok(false);
        };

        let mut placed = Vec::with_capacity(group.bundles.len());
        for (bundle, node_index) in group.bundles.iter().zip(assignment) {
            let node = &mut self.nodes[node_index];
            node.available_cpu -= bundle.cpu;
            let gpu_ids = node.gpus.reserve(id, bundle.gpu)?;
            debug!(
                placement_group = %id,
                bundle_index = placed.len(),
                hostname = %node.hostname,
                gpus = ?gpu_ids,
                "Bundle placed"
            );
            placed.push(PlacedBundle {
                node: node_index,
                reserved: *bundle,
                remaining: *bundle,
                free_gpus: gpu_ids,
            });
        }

        group.placed = Some(placed);
        group.ready.send_replace(true);
        self.pending.retain(|p| *p != id);

        info!(
            placement_group = %id,
            policy = %group.policy,
            bundles = group.bundles.len(),
            "Placement group ready"
        );
        Ok(true)
    }

    fn retry_pending(&mut self) {
        for id in self.pending.clone() {
            if let Err(e) = self.try_place(id) {
                warn!(placement_group = %id, error = %e, "Failed to place pending group");
            }
        }
    }

    fn release(&mut self, id: PlacementGroupId, placed: Vec<PlacedBundle>) {
        for bundle in placed {
            let node = &mut self.nodes[bundle.node];
            node.available_cpu += bundle.reserved.cpu;
            node.gpus.release_group(id);
        }
    }
}

/// Choose a node for every bundle, or `None` if the group does not fit
fn plan_placement(
    nodes: &[NodeState],
    bundles: &[Resources],
    policy: PlacementPolicy,
) -> Option<Vec<usize>> {
    let mut free: Vec<Resources> = nodes.iter().map(NodeState::available).collect();
    let mut used: Vec<usize> = Vec::new();
    let mut assignment = Vec::with_capacity(bundles.len());

    for bundle in bundles {
        let node = match policy {
            PlacementPolicy::StrictSpread => {
                (0..free.len()).find(|i| !used.contains(i) && free[*i].fits(bundle))
            }
            PlacementPolicy::Pack => used
                .iter()
                .copied()
                .find(|i| free[*i].fits(bundle))
                .or_else(|| (0..free.len()).find(|i| free[*i].fits(bundle))),
        }?;

        free[node] = free[node].checked_sub(bundle)?;
        if !used.contains(&node) {
            used.push(node);
        }
        assignment.push(node);
    }

    Some(assignment)
}

/// Cluster scheduler backed by in-process nodes and actor workers
pub struct LocalCluster {
    state: Mutex<ClusterState>,
}

impl LocalCluster {
    /// Create a cluster from a node description
    pub fn new(config: &ClusterConfig) -> Self {
        Self::from_nodes(&config.nodes)
    }

    pub fn from_nodes(nodes: &[NodeConfig]) -> Self {
        let nodes: Vec<NodeState> = nodes
            .iter()
            .map(|n| NodeState {
                hostname: n.hostname.clone(),
                address: n.address.clone(),
                available_cpu: n.cpus,
                gpus: GpuAllocator::new(GpuInfo::with_count(n.gpus)),
            })
            .collect();

        info!(nodes = nodes.len(), "Local cluster initialized");

        Self {
            state: Mutex::new(ClusterState {
                nodes,
                groups: HashMap::new(),
                pending: Vec::new(),
            }),
        }
    }

    /// Whether a placement group exists and has been placed
    #[cfg(test)]
    pub fn is_ready(&self, id: PlacementGroupId) -> bool {
        self.state
            .lock()
            .groups
            .get(&id)
            .map(|g| g.placed.is_some())
            .unwrap_or(false)
    }

    /// Number of live placement groups, placed or pending
    pub fn placement_group_count(&self) -> usize {
        self.state.lock().groups.len()
    }
}

#[async_trait]
impl ClusterScheduler for LocalCluster {
    async fn create_placement_group(
        &self,
        bundles: Vec<Resources>,
        policy: PlacementPolicy,
    ) -> GangrunResult<PlacementGroupId> {
        if bundles.is_empty() {
            return Err(GangrunError::Scheduler(
                "Placement group needs at least one bundle".to_string(),
            ));
        }

        let id = PlacementGroupId::new();
        let (ready, _) = watch::channel(false);

        let mut state = self.state.lock();
        state.groups.insert(
            id,
            GroupState {
                policy,
                bundles,
                placed: None,
                ready,
                workers: Vec::new(),
            },
        );
        state.pending.push(id);

        if !state.try_place(id)? {
            debug!(placement_group = %id, "Placement group pending on resources");
        }

        Ok(id)
    }

    async fn wait_ready(&self, id: PlacementGroupId) -> GangrunResult<()> {
        let mut ready = {
            let state = self.state.lock();
            state
                .groups
                .get(&id)
                .ok_or_else(|| {
                    GangrunError::Scheduler(format!("Unknown placement group {}", id))
                })?
                .ready
                .subscribe()
        };

        ready.wait_for(|placed| *placed).await.map_err(|_| {
            GangrunError::Scheduler(format!(
                "Placement group {} was removed before it became ready",
                id
            ))
        })?;
        Ok(())
    }

    async fn available_resources(&self) -> GangrunResult<Resources> {
        let state = self.state.lock();
        Ok(state
            .nodes
            .iter()
            .fold(Resources::default(), |acc, n| acc.saturating_add(&n.available())))
    }

    async fn remove_placement_group(&self, id: PlacementGroupId) -> GangrunResult<()> {
        let workers = {
            let mut state = self.state.lock();
            let group = state.groups.remove(&id).ok_or_else(|| {
                GangrunError::Scheduler(format!("Unknown placement group {}", id))
            })?;
            state.pending.retain(|p| *p != id);
            if let Some(placed) = group.placed {
                state.release(id, placed);
            }
            state.retry_pending();
            group.workers
        };

        for worker in &workers {
            worker.shutdown().await?;
        }

        info!(placement_group = %id, workers = workers.len(), "Placement group removed");
        Ok(())
    }

    async fn spawn_worker(&self, request: SpawnRequest) -> GangrunResult<Arc<dyn Worker>> {
        let group_id = request.bundle.group;
        let bundle_index = request.bundle.index;

        let mut state = self.state.lock();
        let ClusterState { nodes, groups, .. } = &mut *state;

        let group = groups.get_mut(&group_id).ok_or_else(|| {
            GangrunError::Scheduler(format!("Unknown placement group {}", group_id))
        })?;
        let placed = group.placed.as_mut().ok_or_else(|| {
            GangrunError::Scheduler(format!("Placement group {} is not ready", group_id))
        })?;
        let bundle = placed.get_mut(bundle_index).ok_or_else(|| {
            GangrunError::Scheduler(format!(
                "Placement group {} has no bundle {}",
                group_id, bundle_index
            ))
        })?;

        let remaining = bundle.remaining.checked_sub(&request.resources).ok_or_else(|| {
            GangrunError::Scheduler(format!(
                "Bundle {} of placement group {} cannot fit {} (remaining {})",
                bundle_index, group_id, request.resources, bundle.remaining
            ))
        })?;
        let gpu_ids: Vec<u32> = bundle
            .free_gpus
            .drain(..request.resources.gpu as usize)
            .collect();
        bundle.remaining = remaining;

        let node = &nodes[bundle.node];
        let info = WorkerInfo::new(request.world_rank, request.world_size, node.hostname.clone())
            .with_address(node.address.clone())
            .with_resources(request.resources, gpu_ids);

        let worker = Arc::new(LocalWorker::spawn(info));
        group.workers.push(worker.clone());

        Ok(worker as Arc<dyn Worker>)
    }
}
