//! Worker group orchestration
//!
//! An [`Executor`] takes a validated [`ExecutorConfig`] and drives one worker
//! group through its lifecycle:
//!
//! 1. the placement strategy acquires bundles and spawns the workers,
//! 2. every worker reports its host and the coordinator assigns ranks,
//! 3. rank, rendezvous and interface variables are pushed to the workers,
//! 4. every worker builds its executable.
//!
//! Calls on the group are issued to all workers at once and then awaited
//! together. Results cross the worker boundary as JSON values and are
//! deserialized on the driver side.

use futures::future::{join_all, try_join_all};
use gangrun_core::{ExecutorConfig, GangrunError, GangrunResult, RankRecord};
use gangrun_network::{driver_address, nics_to_env, DefaultNics, NicDetector};
use gangrun_rendezvous::RendezvousService;
use gangrun_runtime::{ExecutableFactory, ExecuteFn, RunFn, Worker, WorkerContext};
use gangrun_scheduler::{ClusterScheduler, PlacementStrategy, WorkerSet};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::{type_name, Any};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::coordinator::Coordinator;

/// Result of a call issued with [`Executor::run_remote`]
pub struct PendingResult<R> {
    world_rank: u32,
    handle: JoinHandle<GangrunResult<serde_json::Value>>,
    _result: PhantomData<fn() -> R>,
}

impl<R: DeserializeOwned> PendingResult<R> {
    /// World rank of the worker the call was sent to
    pub fn world_rank(&self) -> u32 {
        self.world_rank
    }

    /// Wait for the worker to finish the call
    pub async fn wait(self) -> GangrunResult<R> {
        let world_rank = self.world_rank;
        let value = self
            .handle
            .await
            .map_err(|e| GangrunError::worker(world_rank, format!("call was aborted: {}", e)))??;
        Ok(serde_json::from_value(value)?)
    }
}

/// Launches and drives a group of workers
pub struct Executor {
    config: ExecutorConfig,
    scheduler: Arc<dyn ClusterScheduler>,
    nic_detector: Arc<dyn NicDetector>,
    rendezvous: Option<Box<dyn RendezvousService>>,
    strategy: Option<PlacementStrategy>,
    coordinator: Option<Coordinator>,
    workers: Vec<Arc<dyn Worker>>,
}

impl Executor {
    /// Validate `config` and prepare an executor on `scheduler`
    pub fn new(config: ExecutorConfig, scheduler: Arc<dyn ClusterScheduler>) -> GangrunResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            scheduler,
            nic_detector: Arc::new(DefaultNics),
            rendezvous: None,
            strategy: None,
            coordinator: None,
            workers: Vec::new(),
        })
    }

    /// Use a different interface detector
    pub fn with_nic_detector(mut self, detector: Arc<dyn NicDetector>) -> Self {
        self.nic_detector = detector;
        self
    }

    /// Use a different rendezvous service instead of the HTTP server
    pub fn with_rendezvous(mut self, rendezvous: Box<dyn RendezvousService>) -> Self {
        self.rendezvous = Some(rendezvous);
        self
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Workers ordered by world rank; empty before `start`
    pub fn workers(&self) -> &[Arc<dyn Worker>] {
        &self.workers
    }

    pub fn num_workers(&self) -> u32 {
        self.config.shape().map(|s| s.num_workers()).unwrap_or(0)
    }

    pub fn is_started(&self) -> bool {
        !self.workers.is_empty()
    }

    /// Start the group, building each worker's executable with
    /// `factory(ctx, &args)` once the environment is in place
    pub async fn start<A, F, E>(
        &mut self,
        factory: F,
        args: A,
        extra_env: HashMap<String, String>,
    ) -> GangrunResult<()>
    where
        A: Send + Sync + 'static,
        F: Fn(&WorkerContext, &A) -> GangrunResult<E> + Send + Sync + 'static,
        E: Send + 'static,
    {
        let factory = move |ctx: &WorkerContext| factory(ctx, &args);
        self.start_with_factory(Arc::new(factory), extra_env).await
    }

    /// Start the group with a prepared executable factory
    ///
    /// On failure the group is left partially started; call
    /// [`Executor::shutdown`] to release it.
    pub async fn start_with_factory(
        &mut self,
        factory: Arc<dyn ExecutableFactory>,
        extra_env: HashMap<String, String>,
    ) -> GangrunResult<()> {
        if self.strategy.is_some() {
            return Err(GangrunError::Runtime(
                "Executor was already started".to_string(),
            ));
        }

        let strategy = self.strategy.insert(PlacementStrategy::from_config(
            &self.config,
            self.scheduler.clone(),
        )?);
        let WorkerSet {
            workers,
            node_workers,
        } = strategy.create_workers().await?;
        self.workers = workers;

        let hostnames = try_join_all(self.workers.iter().map(|w| w.hostname())).await?;

        let coordinator = match self.rendezvous.take() {
            Some(rendezvous) => Coordinator::with_rendezvous(rendezvous),
            None => Coordinator::new(&self.config.settings),
        };
        let coordinator = self.coordinator.insert(coordinator);

        for (worker, hostname) in self.workers.iter().zip(&hostnames) {
            coordinator.register(hostname, worker.world_rank());
        }
        let records = coordinator.finalize_registration();

        let rank_envs = self
            .workers
            .iter()
            .map(|w| {
                records
                    .get(&w.world_rank())
                    .map(RankRecord::to_env)
                    .ok_or_else(|| {
                        GangrunError::Runtime(format!(
                            "No rank record for world rank {}",
                            w.world_rank()
                        ))
                    })
            })
            .collect::<GangrunResult<Vec<_>>>()?;
        try_join_all(
            self.workers
                .iter()
                .zip(rank_envs)
                .map(|(w, env)| w.update_env_vars(env)),
        )
        .await?;
        debug!(hosts = %coordinator.hoststring(), "Rank environment pushed");

        let mut env = coordinator.establish_rendezvous(driver_address().await).await?;
        env.extend(extra_env);
        let nics = self
            .nic_detector
            .detect(&self.config.settings, &hostnames, &node_workers)
            .await?;
        env.extend(nics_to_env(&nics));

        try_join_all(self.workers.iter().map(|w| w.update_env_vars(env.clone()))).await?;
        try_join_all(
            self.workers
                .iter()
                .map(|w| w.start_executable(factory.clone())),
        )
        .await?;

        info!(
            workers = self.workers.len(),
            hosts = %coordinator.hoststring(),
            "Worker group started"
        );
        Ok(())
    }

    fn require_started(&self) -> GangrunResult<()> {
        if self.workers.is_empty() {
            Err(GangrunError::NotStarted)
        } else {
            Ok(())
        }
    }

    /// Apply `f` to the executable of every worker; results in world-rank order
    pub async fn execute<E, R, F>(&self, f: F) -> GangrunResult<Vec<R>>
    where
        E: 'static,
        R: Serialize + DeserializeOwned,
        F: Fn(&mut E) -> R + Send + Sync + 'static,
    {
        self.require_started()?;
        let f = Arc::new(f);
        let values = try_join_all(self.workers.iter().map(|w| {
            let f = f.clone();
            w.execute(execute_fn(move |exe: &mut E| (*f)(exe)))
        }))
        .await?;
        values
            .into_iter()
            .map(|v| Ok(serde_json::from_value(v)?))
            .collect()
    }

    /// Apply `f` to the executable of the world rank 0 worker only
    pub async fn execute_single<E, R, F>(&self, f: F) -> GangrunResult<R>
    where
        E: 'static,
        R: Serialize + DeserializeOwned,
        F: FnOnce(&mut E) -> R + Send + 'static,
    {
        self.require_started()?;
        let worker = self
            .workers
            .iter()
            .find(|w| w.world_rank() == 0)
            .ok_or(GangrunError::NotStarted)?;
        let value = worker.execute(execute_fn(f)).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Call `f(ctx, &args)` on every worker and wait for all results
    pub async fn run<A, R, F>(&self, f: F, args: A) -> GangrunResult<Vec<R>>
    where
        A: Send + Sync + 'static,
        R: Serialize + DeserializeOwned,
        F: Fn(&WorkerContext, &A) -> R + Send + Sync + 'static,
    {
        self.require_started()?;
        let call = Arc::new((f, args));
        let values = try_join_all(
            self.workers
                .iter()
                .map(|w| w.run(run_fn(call.clone()))),
        )
        .await?;
        values
            .into_iter()
            .map(|v| Ok(serde_json::from_value(v)?))
            .collect()
    }

    /// Call `f(ctx, &args)` on every worker without waiting for the results
    pub fn run_remote<A, R, F>(&self, f: F, args: A) -> GangrunResult<Vec<PendingResult<R>>>
    where
        A: Send + Sync + 'static,
        R: Serialize + DeserializeOwned,
        F: Fn(&WorkerContext, &A) -> R + Send + Sync + 'static,
    {
        self.require_started()?;
        let call = Arc::new((f, args));
        Ok(self
            .workers
            .iter()
            .map(|w| {
                let worker = w.clone();
                let run = run_fn(call.clone());
                PendingResult {
                    world_rank: worker.world_rank(),
                    handle: tokio::spawn(async move { worker.run(run).await }),
                    _result: PhantomData,
                }
            })
            .collect())
    }

    /// Tear down workers, release the placement group and stop rendezvous
    ///
    /// Every step is attempted; the first failure is returned. Calling this
    /// before `start` or more than once is a no-op.
    pub async fn shutdown(&mut self) -> GangrunResult<()> {
        let mut first_error = None;

        let workers = std::mem::take(&mut self.workers);
        for (worker, result) in workers
            .iter()
            .zip(join_all(workers.iter().map(|w| w.shutdown())).await)
        {
            if let Err(e) = result {
                warn!(world_rank = worker.world_rank(), error = %e, "Worker shutdown failed");
                first_error.get_or_insert(e);
            }
        }

        if let Some(mut strategy) = self.strategy.take() {
            if let Err(e) = strategy.shutdown().await {
                warn!(error = %e, "Failed to release placement group");
                first_error.get_or_insert(e);
            }
        }

        if let Some(mut coordinator) = self.coordinator.take() {
            if let Err(e) = coordinator.shutdown().await {
                warn!(error = %e, "Failed to stop rendezvous");
                first_error.get_or_insert(e);
            }
        }

        if !workers.is_empty() {
            info!(workers = workers.len(), "Worker group shut down");
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Wrap a typed executable function for the worker boundary
fn execute_fn<E, R, F>(f: F) -> ExecuteFn
where
    E: 'static,
    R: Serialize,
    F: FnOnce(&mut E) -> R + Send + 'static,
{
    Box::new(move |exe: &mut (dyn Any + Send)| -> GangrunResult<serde_json::Value> {
        let exe = exe.downcast_mut::<E>().ok_or_else(|| {
            GangrunError::Runtime(format!("Executable is not a {}", type_name::<E>()))
        })?;
        Ok(serde_json::to_value(f(exe))?)
    })
}

fn run_fn<A, R, F>(call: Arc<(F, A)>) -> RunFn
where
    A: Send + Sync + 'static,
    R: Serialize,
    F: Fn(&WorkerContext, &A) -> R + Send + Sync + 'static,
{
    Box::new(move |ctx: &WorkerContext| -> GangrunResult<serde_json::Value> {
        let (f, args) = &*call;
        Ok(serde_json::to_value(f(ctx, args))?)
    })
}
