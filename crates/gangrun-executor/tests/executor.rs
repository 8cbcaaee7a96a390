//! End-to-end tests driving worker groups on an in-process cluster

use async_trait::async_trait;
use gangrun_core::{
    env, ExecutorConfig, GangrunError, GangrunResult, NodeConfig, PlacementGroupId,
    PlacementPolicy, Resources, WorkerInfo, WorkerStatus,
};
use gangrun_executor::Executor;
use gangrun_rendezvous::RendezvousClient;
use gangrun_runtime::{LocalWorker, Worker, WorkerContext};
use gangrun_scheduler::{ClusterScheduler, LocalCluster, SpawnRequest};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

fn node(hostname: &str, cpus: u32, gpus: u32) -> NodeConfig {
    NodeConfig {
        hostname: hostname.to_string(),
        address: "127.0.0.1".to_string(),
        cpus,
        gpus,
    }
}

fn local_settings(config: &mut ExecutorConfig) {
    config.settings.rendezvous_address = "127.0.0.1".to_string();
    config.settings.nics = Some(vec!["eth0".to_string()]);
    config.settings.placement_group_timeout_secs = 5;
}

/// Executable built on every worker
struct Trainer {
    world_rank: u32,
    local_rank: u32,
    steps: u32,
}

fn trainer(ctx: &WorkerContext, _args: &()) -> GangrunResult<Trainer> {
    Ok(Trainer {
        world_rank: ctx.world_rank,
        local_rank: ctx.local_rank().unwrap_or(u32::MAX),
        steps: 0,
    })
}

async fn env_of(worker: &Arc<dyn Worker>) -> HashMap<String, String> {
    worker.env_vars().await.unwrap()
}

#[tokio::test]
async fn test_pack_ranks_match_host_layout() {
    let cluster = Arc::new(LocalCluster::from_nodes(&[node("A", 3, 0), node("B", 2, 0)]));
    let mut config = ExecutorConfig::with_workers(5);
    local_settings(&mut config);

    let mut executor = Executor::new(config, cluster.clone()).unwrap();
    executor.start(trainer, (), HashMap::new()).await.unwrap();
    assert!(executor.is_started());

    let expected = [
        ("A", 0, 2, 0, 3),
        ("A", 0, 2, 1, 3),
        ("A", 0, 1, 2, 3),
        ("B", 1, 2, 0, 2),
        ("B", 1, 2, 1, 2),
    ];
    for (worker, (host, cross_rank, cross_size, local_rank, local_size)) in
        executor.workers().iter().zip(expected)
    {
        assert_eq!(worker.hostname().await.unwrap(), host);
        let env = env_of(worker).await;
        assert_eq!(env[env::CROSS_RANK], cross_rank.to_string());
        assert_eq!(env[env::CROSS_SIZE], cross_size.to_string());
        assert_eq!(env[env::LOCAL_RANK], local_rank.to_string());
        assert_eq!(env[env::LOCAL_SIZE], local_size.to_string());
        assert_eq!(env[env::WORLD_SIZE], "5");
    }

    executor.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_spread_group_environment() {
    let cluster = Arc::new(LocalCluster::from_nodes(&[
        node("node-0", 4, 0),
        node("node-1", 4, 0),
    ]));
    let mut config = ExecutorConfig::with_hosts(2, 2);
    local_settings(&mut config);

    let mut executor = Executor::new(config, cluster).unwrap();
    let extra = HashMap::from([("EXPERIMENT".to_string(), "baseline".to_string())]);
    executor.start(trainer, (), extra).await.unwrap();

    let first = env_of(&executor.workers()[0]).await;
    for worker in executor.workers() {
        let env = env_of(worker).await;
        assert_eq!(env[env::CONTROLLER], "gloo");
        assert_eq!(env[env::CPU_OPERATIONS], "gloo");
        assert_eq!(env[env::SOCKET_IFNAME], "eth0");
        assert_eq!(env["EXPERIMENT"], "baseline");
        assert_eq!(env[env::RENDEZVOUS_ADDR], first[env::RENDEZVOUS_ADDR]);
        assert_eq!(env[env::RENDEZVOUS_PORT], first[env::RENDEZVOUS_PORT]);
    }

    let port: u16 = first[env::RENDEZVOUS_PORT].parse().unwrap();
    let client = RendezvousClient::new("127.0.0.1", port, Duration::from_secs(5)).unwrap();
    let slot = client.slot("node-1", 1).await.unwrap();
    assert_eq!(slot.rank, 3);
    assert_eq!(slot.cross_rank, 1);
    assert_eq!(slot.cross_size, 2);

    executor.shutdown().await.unwrap();
    assert!(!client.health().await);
}

#[tokio::test]
async fn test_execute_and_run() {
    let cluster = Arc::new(LocalCluster::from_nodes(&[node("A", 2, 0), node("B", 2, 0)]));
    let mut config = ExecutorConfig::with_hosts(2, 2);
    local_settings(&mut config);

    let mut executor = Executor::new(config, cluster).unwrap();
    executor.start(trainer, (), HashMap::new()).await.unwrap();

    let ranks: Vec<u32> = executor
        .execute(|t: &mut Trainer| t.world_rank)
        .await
        .unwrap();
    assert_eq!(ranks, vec![0, 1, 2, 3]);

    let local: Vec<u32> = executor
        .execute(|t: &mut Trainer| t.local_rank)
        .await
        .unwrap();
    assert_eq!(local, vec![0, 1, 0, 1]);

    let steps: Vec<u32> = executor
        .execute(|t: &mut Trainer| {
            t.steps += 1;
            t.steps
        })
        .await
        .unwrap();
    assert_eq!(steps, vec![1, 1, 1, 1]);

    let single: u32 = executor
        .execute_single(|t: &mut Trainer| {
            t.steps += 10;
            t.steps
        })
        .await
        .unwrap();
    assert_eq!(single, 11);

    let hosts: Vec<String> = executor
        .run(
            |ctx: &WorkerContext, suffix: &String| format!("{}{}", ctx.hostname, suffix),
            "!".to_string(),
        )
        .await
        .unwrap();
    assert_eq!(hosts, vec!["A!", "A!", "B!", "B!"]);

    let pending = executor
        .run_remote(
            |ctx: &WorkerContext, base: &u32| base + ctx.cross_rank().unwrap_or(0),
            100u32,
        )
        .unwrap();
    assert_eq!(pending.len(), 4);
    let mut results = Vec::new();
    for handle in pending {
        results.push((handle.world_rank(), handle.wait().await.unwrap()));
    }
    assert_eq!(results, vec![(0, 100), (1, 100), (2, 101), (3, 101)]);

    executor.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_execute_with_wrong_executable_type() {
    let cluster = Arc::new(LocalCluster::from_nodes(&[node("A", 1, 0)]));
    let mut config = ExecutorConfig::with_workers(1);
    local_settings(&mut config);

    let mut executor = Executor::new(config, cluster).unwrap();
    executor.start(trainer, (), HashMap::new()).await.unwrap();

    let result = executor.execute(|n: &mut u64| *n).await;
    assert!(matches!(
        result,
        Err(GangrunError::WorkerCommunication { rank: 0, .. })
            | Err(GangrunError::Runtime(_))
    ));

    executor.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_calls_before_start() {
    let cluster = Arc::new(LocalCluster::from_nodes(&[node("A", 1, 0)]));
    let mut executor = Executor::new(ExecutorConfig::with_workers(1), cluster).unwrap();

    assert!(matches!(
        executor.execute(|t: &mut Trainer| t.world_rank).await,
        Err(GangrunError::NotStarted)
    ));
    assert!(matches!(
        executor.run(|ctx: &WorkerContext, _: &()| ctx.world_rank, ()).await,
        Err(GangrunError::NotStarted)
    ));
    executor.shutdown().await.unwrap();
}

#[test]
fn test_config_errors_before_any_resource() {
    let cluster = Arc::new(LocalCluster::from_nodes(&[node("A", 4, 0)]));

    let mut both = ExecutorConfig::with_workers(2);
    both.num_hosts = Some(2);
    assert!(matches!(
        Executor::new(both, cluster.clone()),
        Err(GangrunError::Config(_))
    ));

    let mut gpus_without_gpu = ExecutorConfig::with_workers(2);
    gpus_without_gpu.gpus_per_worker = Some(1);
    assert!(matches!(
        Executor::new(gpus_without_gpu, cluster.clone()),
        Err(GangrunError::Config(_))
    ));

    assert!(matches!(
        Executor::new(ExecutorConfig::default(), cluster.clone()),
        Err(GangrunError::Config(_))
    ));
    assert_eq!(cluster.placement_group_count(), 0);
}

#[tokio::test]
async fn test_unsatisfiable_group_times_out() {
    let cluster = Arc::new(LocalCluster::from_nodes(&[node("A", 2, 0)]));
    let mut config = ExecutorConfig::with_workers(4);
    local_settings(&mut config);
    config.settings.placement_group_timeout_secs = 0;

    let mut executor = Executor::new(config, cluster.clone()).unwrap();
    let err = executor
        .start(trainer, (), HashMap::new())
        .await
        .err()
        .unwrap();
    match err {
        GangrunError::ResourceTimeout {
            requested,
            available,
            ..
        } => {
            assert!(requested.contains("{CPU: 1, GPU: 0}"));
            assert_eq!(available, "{CPU: 2, GPU: 0}");
        }
        other => panic!("unexpected error: {other}"),
    }

    executor.shutdown().await.unwrap();
    assert_eq!(cluster.placement_group_count(), 0);
}

#[tokio::test]
async fn test_shutdown_releases_everything() {
    let cluster = Arc::new(LocalCluster::from_nodes(&[node("A", 2, 2)]));
    let mut config = ExecutorConfig::with_workers(2);
    config.use_gpu = true;
    local_settings(&mut config);

    let mut executor = Executor::new(config, cluster.clone()).unwrap();
    executor.shutdown().await.unwrap();
    executor.start(trainer, (), HashMap::new()).await.unwrap();
    assert_eq!(
        cluster.available_resources().await.unwrap(),
        Resources::new(0, 0)
    );

    let worker = executor.workers()[0].clone();
    executor.shutdown().await.unwrap();
    executor.shutdown().await.unwrap();

    assert!(!executor.is_started());
    assert_eq!(worker.status().await.unwrap(), WorkerStatus::Terminated);
    assert_eq!(cluster.placement_group_count(), 0);
    assert_eq!(
        cluster.available_resources().await.unwrap(),
        Resources::new(2, 2)
    );
    assert!(matches!(
        executor.execute(|t: &mut Trainer| t.world_rank).await,
        Err(GangrunError::NotStarted)
    ));
}

/// Scheduler whose workers on a bundle all claim device 0
struct SharedDeviceScheduler;

#[async_trait]
impl ClusterScheduler for SharedDeviceScheduler {
    async fn create_placement_group(
        &self,
        _bundles: Vec<Resources>,
        _policy: PlacementPolicy,
    ) -> GangrunResult<PlacementGroupId> {
        Ok(PlacementGroupId::new())
    }

    async fn wait_ready(&self, _id: PlacementGroupId) -> GangrunResult<()> {
        Ok(())
    }

    async fn available_resources(&self) -> GangrunResult<Resources> {
        Ok(Resources::default())
    }

    async fn remove_placement_group(&self, _id: PlacementGroupId) -> GangrunResult<()> {
        Ok(())
    }

    async fn spawn_worker(&self, request: SpawnRequest) -> GangrunResult<Arc<dyn Worker>> {
        let host = format!("host-{}", request.bundle.index);
        let info = WorkerInfo::new(request.world_rank, request.world_size, host)
            .with_resources(request.resources, vec![0]);
        Ok(Arc::new(LocalWorker::spawn(info)) as Arc<dyn Worker>)
    }
}

#[tokio::test]
async fn test_overlapping_devices_fail_start() {
    let mut config = ExecutorConfig::with_hosts(2, 2);
    config.use_gpu = true;
    local_settings(&mut config);

    let mut executor = Executor::new(config, Arc::new(SharedDeviceScheduler)).unwrap();
    let err = executor
        .start(trainer, (), HashMap::new())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, GangrunError::DeviceIsolation(_)));
    executor.shutdown().await.unwrap();
}

/// Worker that answers the host query only after a delay
struct SlowHostWorker {
    inner: Arc<dyn Worker>,
    delay: Duration,
}

#[async_trait]
impl Worker for SlowHostWorker {
    fn info(&self) -> &WorkerInfo {
        self.inner.info()
    }

    async fn hostname(&self) -> GangrunResult<String> {
        tokio::time::sleep(self.delay).await;
        self.inner.hostname().await
    }

    async fn gpu_ids(&self) -> GangrunResult<Vec<u32>> {
        self.inner.gpu_ids().await
    }

    async fn update_env_vars(&self, env: HashMap<String, String>) -> GangrunResult<()> {
        self.inner.update_env_vars(env).await
    }

    async fn env_vars(&self) -> GangrunResult<HashMap<String, String>> {
        self.inner.env_vars().await
    }

    async fn start_executable(
        &self,
        factory: Arc<dyn gangrun_runtime::ExecutableFactory>,
    ) -> GangrunResult<()> {
        self.inner.start_executable(factory).await
    }

    async fn execute(&self, f: gangrun_runtime::ExecuteFn) -> GangrunResult<serde_json::Value> {
        self.inner.execute(f).await
    }

    async fn run(&self, f: gangrun_runtime::RunFn) -> GangrunResult<serde_json::Value> {
        self.inner.run(f).await
    }

    async fn status(&self) -> GangrunResult<WorkerStatus> {
        self.inner.status().await
    }

    async fn shutdown(&self) -> GangrunResult<()> {
        self.inner.shutdown().await
    }
}

/// Local cluster whose later ranks are slower to report their host
struct SlowHostCluster(LocalCluster);

#[async_trait]
impl ClusterScheduler for SlowHostCluster {
    async fn create_placement_group(
        &self,
        bundles: Vec<Resources>,
        policy: PlacementPolicy,
    ) -> GangrunResult<PlacementGroupId> {
        self.0.create_placement_group(bundles, policy).await
    }

    async fn wait_ready(&self, id: PlacementGroupId) -> GangrunResult<()> {
        self.0.wait_ready(id).await
    }

    async fn available_resources(&self) -> GangrunResult<Resources> {
        self.0.available_resources().await
    }

    async fn remove_placement_group(&self, id: PlacementGroupId) -> GangrunResult<()> {
        self.0.remove_placement_group(id).await
    }

    async fn spawn_worker(&self, request: SpawnRequest) -> GangrunResult<Arc<dyn Worker>> {
        let inner = self.0.spawn_worker(request).await?;
        Ok(Arc::new(SlowHostWorker {
            inner,
            delay: Duration::from_millis(50 * u64::from(request.world_rank)),
        }) as Arc<dyn Worker>)
    }
}

#[tokio::test]
async fn test_start_waits_for_slow_host_reports() {
    let cluster = LocalCluster::from_nodes(&[node("A", 2, 0), node("B", 2, 0)]);
    let mut config = ExecutorConfig::with_workers(4);
    local_settings(&mut config);

    let mut executor = Executor::new(config, Arc::new(SlowHostCluster(cluster))).unwrap();
    executor.start(trainer, (), HashMap::new()).await.unwrap();

    let local_ranks = executor.execute(|t: &mut Trainer| t.local_rank).await.unwrap();
    assert_eq!(local_ranks, vec![0, 1, 0, 1]);
    executor.shutdown().await.unwrap();
}
