//! Worker placement strategies
//!
//! A strategy turns the executor configuration into bundles, acquires them
//! from the cluster scheduler and spawns one worker per slot. Spread puts a
//! fixed number of workers on each of `num_hosts` distinct hosts; Pack asks
//! for one bundle per worker and lets the scheduler co-locate them.

use futures::future::try_join_all;
use gangrun_core::{
    env, format_device_ids, ExecutorConfig, GangrunError, GangrunResult, PlacementGroup,
    PlacementPolicy, PlacementShape, Resources,
};
use gangrun_runtime::Worker;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::acquire::acquire;
use crate::traits::{ClusterScheduler, SpawnRequest};

/// Workers produced by a strategy
#[derive(Clone)]
pub struct WorkerSet {
    /// All workers, ordered by world rank
    pub workers: Vec<Arc<dyn Worker>>,
    /// First worker on each distinct host, in host-first-seen order
    pub node_workers: Vec<Arc<dyn Worker>>,
}

/// Placement group and workers held by one strategy instance
struct Reservation {
    scheduler: Arc<dyn ClusterScheduler>,
    timeout: Duration,
    per_worker: Resources,
    placement_group: Option<PlacementGroup>,
    workers: Vec<Arc<dyn Worker>>,
}

impl Reservation {
    fn new(config: &ExecutorConfig, scheduler: Arc<dyn ClusterScheduler>) -> Self {
        let gpus = if config.use_gpu {
            config.effective_gpus_per_worker()
        } else {
            0
        };
        Self {
            scheduler,
            timeout: config.settings.placement_group_timeout(),
            per_worker: Resources::new(config.cpus_per_worker, gpus),
            placement_group: None,
            workers: Vec::new(),
        }
    }

    async fn acquire(
        &mut self,
        bundle: Resources,
        num_bundles: u32,
        policy: PlacementPolicy,
    ) -> GangrunResult<PlacementGroup> {
        if self.placement_group.is_some() {
            return Err(GangrunError::Scheduler(
                "Workers were already created by this strategy".to_string(),
            ));
        }
        let group = acquire(
            self.scheduler.as_ref(),
            bundle,
            num_bundles,
            policy,
            self.timeout,
        )
        .await?;
        self.placement_group = Some(group.clone());
        Ok(group)
    }

    /// Spawn a batch of workers concurrently, keeping them for shutdown
    async fn spawn(&mut self, requests: Vec<SpawnRequest>) -> GangrunResult<Vec<Arc<dyn Worker>>> {
        let scheduler = &self.scheduler;
        let spawned = try_join_all(requests.into_iter().map(|r| scheduler.spawn_worker(r))).await?;
        self.workers.extend(spawned.iter().cloned());
        Ok(spawned)
    }

    async fn worker_set(&self) -> GangrunResult<WorkerSet> {
        Ok(WorkerSet {
            workers: self.workers.clone(),
            node_workers: node_workers(&self.workers).await?,
        })
    }

    async fn release(&mut self) -> GangrunResult<()> {
        self.workers.clear();
        if let Some(group) = self.placement_group.take() {
            debug!(placement_group = %group.id, "Releasing placement group");
            self.scheduler.remove_placement_group(group.id).await?;
        }
        Ok(())
    }
}

/// Fixed number of workers on each of `num_hosts` distinct hosts
pub struct SpreadStrategy {
    reservation: Reservation,
    num_hosts: u32,
    num_workers_per_host: u32,
    use_gpu: bool,
}

impl SpreadStrategy {
    pub fn num_workers(&self) -> u32 {
        self.num_hosts * self.num_workers_per_host
    }

    async fn create_workers(&mut self) -> GangrunResult<WorkerSet> {
        let per_host = self.num_workers_per_host;
        let per_worker = self.reservation.per_worker;
        let bundle = per_worker.times(per_host);
        let world_size = self.num_workers();

        let group = self
            .reservation
            .acquire(bundle, self.num_hosts, PlacementPolicy::StrictSpread)
            .await?;

        for b in 0..self.num_hosts {
            let requests = (0..per_host)
                .map(|i| SpawnRequest {
                    bundle: group.bundle(b as usize),
                    resources: per_worker,
                    world_rank: b * per_host + i,
                    world_size,
                })
                .collect();
            let bundle_workers = self.reservation.spawn(requests).await?;

            if self.use_gpu {
                reconcile_visible_devices(b, &bundle_workers, per_host).await?;
            }
        }

        info!(
            num_hosts = self.num_hosts,
            workers_per_host = per_host,
            "Spread workers created"
        );
        self.reservation.worker_set().await
    }
}

/// One bundle per worker, co-location left to the scheduler
pub struct PackStrategy {
    reservation: Reservation,
    num_workers: u32,
}

impl PackStrategy {
    pub fn num_workers(&self) -> u32 {
        self.num_workers
    }

    async fn create_workers(&mut self) -> GangrunResult<WorkerSet> {
        let per_worker = self.reservation.per_worker;
        let group = self
            .reservation
            .acquire(per_worker, self.num_workers, PlacementPolicy::Pack)
            .await?;

        let requests = (0..self.num_workers)
            .map(|rank| SpawnRequest {
                bundle: group.bundle(rank as usize),
                resources: per_worker,
                world_rank: rank,
                world_size: self.num_workers,
            })
            .collect();
        self.reservation.spawn(requests).await?;

        info!(num_workers = self.num_workers, "Pack workers created");
        self.reservation.worker_set().await
    }
}

/// Placement strategy selected from the executor configuration
pub enum PlacementStrategy {
    Spread(SpreadStrategy),
    Pack(PackStrategy),
}

impl PlacementStrategy {
    /// Pick Spread when `num_hosts` is set, Pack when `num_workers` is set
    pub fn from_config(
        config: &ExecutorConfig,
        scheduler: Arc<dyn ClusterScheduler>,
    ) -> GangrunResult<Self> {
        let reservation = Reservation::new(config, scheduler);
        Ok(match config.shape()? {
            PlacementShape::Spread {
                num_hosts,
                num_workers_per_host,
            } => PlacementStrategy::Spread(SpreadStrategy {
                reservation,
                num_hosts,
                num_workers_per_host,
                use_gpu: config.use_gpu,
            }),
            PlacementShape::Pack { num_workers } => {
                PlacementStrategy::Pack(PackStrategy {
                    reservation,
                    num_workers,
                })
            }
        })
    }

    /// Acquire bundles and spawn every worker
    pub async fn create_workers(&mut self) -> GangrunResult<WorkerSet> {
        match self {
            PlacementStrategy::Spread(s) => s.create_workers().await,
            PlacementStrategy::Pack(p) => p.create_workers().await,
        }
    }

    /// Total number of workers this strategy produces
    pub fn num_workers(&self) -> u32 {
        match self {
            PlacementStrategy::Spread(s) => s.num_workers(),
            PlacementStrategy::Pack(p) => p.num_workers(),
        }
    }

    /// Placement group held by this strategy, if acquired
    pub fn placement_group(&self) -> Option<&PlacementGroup> {
        self.reservation().placement_group.as_ref()
    }

    /// Release the placement group and forget the workers. Safe to call twice.
    pub async fn shutdown(&mut self) -> GangrunResult<()> {
        match self {
            PlacementStrategy::Spread(s) => s.reservation.release().await,
            PlacementStrategy::Pack(p) => p.reservation.release().await,
        }
    }

    fn reservation(&self) -> &Reservation {
        match self {
            PlacementStrategy::Spread(s) => &s.reservation,
            PlacementStrategy::Pack(p) => &p.reservation,
        }
    }
}

/// Check that the workers of one bundle see disjoint devices and make the
/// union visible to all of them.
///
/// The union must hold exactly `expected` ids, one per worker on the bundle.
pub async fn reconcile_visible_devices(
    bundle_index: u32,
    workers: &[Arc<dyn Worker>],
    expected: u32,
) -> GangrunResult<()> {
    let per_worker = try_join_all(workers.iter().map(|w| w.gpu_ids())).await?;
    let ids: Vec<u32> = per_worker.into_iter().flatten().collect();

    let distinct: HashSet<u32> = ids.iter().copied().collect();
    if distinct.len() != ids.len() {
        return Err(GangrunError::DeviceIsolation(format!(
            "Workers on bundle {} share device ids: {:?}",
            bundle_index, ids
        )));
    }
    if ids.len() != expected as usize {
        return Err(GangrunError::DeviceIsolation(format!(
            "Workers on bundle {} expected {} device ids, got {:?}",
            bundle_index, expected, ids
        )));
    }

    let visible = format_device_ids(&ids);
    debug!(bundle = bundle_index, devices = %visible, "Widening device visibility");

    try_join_all(workers.iter().map(|w| {
        w.update_env_vars(HashMap::from([(
            env::VISIBLE_DEVICES.to_string(),
            visible.clone(),
        )]))
    }))
    .await?;
    Ok(())
}

/// First worker per distinct host, in the order hosts first appear
pub async fn node_workers(workers: &[Arc<dyn Worker>]) -> GangrunResult<Vec<Arc<dyn Worker>>> {
    let hostnames = try_join_all(workers.iter().map(|w| w.hostname())).await?;
    let mut seen = HashSet::new();
    Ok(workers
        .iter()
        .zip(hostnames)
        .filter(|(_, host)| seen.insert(host.clone()))
        .map(|(w, _)| w.clone())
        .collect())
}
