//! In-process worker runtime
//!
//! Each [`LocalWorker`] is a tokio task that owns the worker state and serves
//! commands one at a time from a channel, so calls on a worker are applied in
//! the order they were sent, the same way a remote worker process would.

use async_trait::async_trait;
use gangrun_core::{
    env, format_device_ids, GangrunError, GangrunResult, WorkerInfo, WorkerStatus,
};
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::executable::{AnyExecutable, ExecutableFactory, ExecuteFn, RunFn, WorkerContext};
use crate::traits::Worker;

const COMMAND_BUFFER: usize = 64;

enum WorkerCommand {
    Hostname(oneshot::Sender<String>),
    GpuIds(oneshot::Sender<Vec<u32>>),
    UpdateEnv(HashMap<String, String>, oneshot::Sender<()>),
    Env(oneshot::Sender<HashMap<String, String>>),
    Start(Arc<dyn ExecutableFactory>, oneshot::Sender<GangrunResult<()>>),
    Execute(ExecuteFn, oneshot::Sender<GangrunResult<Value>>),
    Run(RunFn, oneshot::Sender<GangrunResult<Value>>),
    Status(oneshot::Sender<WorkerStatus>),
    Shutdown(oneshot::Sender<()>),
}

/// Worker running as an actor task in the current process
pub struct LocalWorker {
    info: WorkerInfo,
    tx: mpsc::Sender<WorkerCommand>,
}

impl LocalWorker {
    /// Spawn the worker task. Must be called from within a tokio runtime.
    pub fn spawn(info: WorkerInfo) -> Self {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let actor = WorkerActor::new(info.clone());

        debug!(
            worker_id = %info.id,
            world_rank = info.world_rank,
            hostname = %info.hostname,
            gpus = ?info.gpu_ids,
            "Spawning local worker"
        );

        tokio::spawn(actor.run(rx));

        Self { info, tx }
    }

    async fn call<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> WorkerCommand,
    ) -> GangrunResult<T> {
        let rank = self.info.world_rank;
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(command(reply_tx))
            .await
            .map_err(|_| GangrunError::worker(rank, "worker is no longer running"))?;
        reply_rx
            .await
            .map_err(|_| GangrunError::worker(rank, "worker exited before replying"))
    }
}

#[async_trait]
impl Worker for LocalWorker {
    fn info(&self) -> &WorkerInfo {
        &self.info
    }

    async fn hostname(&self) -> GangrunResult<String> {
        self.call(WorkerCommand::Hostname).await
    }

    async fn gpu_ids(&self) -> GangrunResult<Vec<u32>> {
        self.call(WorkerCommand::GpuIds).await
    }

    async fn update_env_vars(&self, env: HashMap<String, String>) -> GangrunResult<()> {
        self.call(|tx| WorkerCommand::UpdateEnv(env, tx)).await
    }

    async fn env_vars(&self) -> GangrunResult<HashMap<String, String>> {
        self.call(WorkerCommand::Env).await
    }

    async fn start_executable(&self, factory: Arc<dyn ExecutableFactory>) -> GangrunResult<()> {
        self.call(|tx| WorkerCommand::Start(factory, tx)).await?
    }

    async fn execute(&self, f: ExecuteFn) -> GangrunResult<Value> {
        self.call(|tx| WorkerCommand::Execute(f, tx)).await?
    }

    async fn run(&self, f: RunFn) -> GangrunResult<Value> {
        self.call(|tx| WorkerCommand::Run(f, tx)).await?
    }

    async fn status(&self) -> GangrunResult<WorkerStatus> {
        match self.call(WorkerCommand::Status).await {
            Ok(status) => Ok(status),
            Err(_) if self.tx.is_closed() => Ok(WorkerStatus::Terminated),
            Err(e) => Err(e),
        }
    }

    async fn shutdown(&self) -> GangrunResult<()> {
        if self.tx.is_closed() {
            return Ok(());
        }
        // A worker that exits between the check and the send is already down.
        let _ = self.call(WorkerCommand::Shutdown).await;
        Ok(())
    }
}

struct WorkerActor {
    info: WorkerInfo,
    env: HashMap<String, String>,
    executable: Option<AnyExecutable>,
    status: WorkerStatus,
}

impl WorkerActor {
    fn new(info: WorkerInfo) -> Self {
        let mut env = HashMap::from([
            (env::WORLD_RANK.to_string(), info.world_rank.to_string()),
            (env::WORLD_SIZE.to_string(), info.world_size.to_string()),
        ]);
        if !info.gpu_ids.is_empty() {
            env.insert(
                env::VISIBLE_DEVICES.to_string(),
                format_device_ids(&info.gpu_ids),
            );
        }

        Self {
            info,
            env,
            executable: None,
            status: WorkerStatus::Idle,
        }
    }

    fn context(&self) -> WorkerContext {
        WorkerContext {
            world_rank: self.info.world_rank,
            world_size: self.info.world_size,
            hostname: self.info.hostname.clone(),
            env: self.env.clone(),
        }
    }

    /// Devices currently visible, honoring a widened visibility list
    fn visible_devices(&self) -> Vec<u32> {
        self.env
            .get(env::VISIBLE_DEVICES)
            .and_then(|v| gangrun_core::parse_device_ids(v).ok())
            .unwrap_or_else(|| self.info.gpu_ids.clone())
    }

    async fn run(mut self, mut rx: mpsc::Receiver<WorkerCommand>) {
        while let Some(command) = rx.recv().await {
            match command {
                WorkerCommand::Hostname(reply) => {
                    let _ = reply.send(self.info.hostname.clone());
                }
                WorkerCommand::GpuIds(reply) => {
                    let _ = reply.send(self.info.gpu_ids.clone());
                }
                WorkerCommand::UpdateEnv(vars, reply) => {
                    debug!(
                        world_rank = self.info.world_rank,
                        keys = ?vars.keys().collect::<Vec<_>>(),
                        "Updating worker environment"
                    );
                    self.env.extend(vars);
                    let _ = reply.send(());
                }
                WorkerCommand::Env(reply) => {
                    let _ = reply.send(self.env.clone());
                }
                WorkerCommand::Start(factory, reply) => {
                    let _ = reply.send(self.start(factory));
                }
                WorkerCommand::Execute(f, reply) => {
                    let _ = reply.send(self.execute(f));
                }
                WorkerCommand::Run(f, reply) => {
                    let ctx = self.context();
                    let rank = self.info.world_rank;
                    let result = catch_unwind(AssertUnwindSafe(|| f(&ctx)))
                        .unwrap_or_else(|panic| Err(panic_error(rank, panic)));
                    let _ = reply.send(result);
                }
                WorkerCommand::Status(reply) => {
                    let _ = reply.send(self.status);
                }
                WorkerCommand::Shutdown(reply) => {
                    self.executable = None;
                    self.status = WorkerStatus::Terminated;
                    info!(world_rank = self.info.world_rank, "Worker shut down");
                    let _ = reply.send(());
                    break;
                }
            }
        }
    }

    fn start(&mut self, factory: Arc<dyn ExecutableFactory>) -> GangrunResult<()> {
        let ctx = self.context();
        let rank = self.info.world_rank;
        let created = catch_unwind(AssertUnwindSafe(|| factory.create(&ctx)))
            .unwrap_or_else(|panic| Err(panic_error(rank, panic)));

        match created {
            Ok(executable) => {
                self.executable = Some(executable);
                self.status = WorkerStatus::Running;
                debug!(
                    world_rank = rank,
                    visible_devices = ?self.visible_devices(),
                    "Executable started"
                );
                Ok(())
            }
            Err(e) => {
                warn!(world_rank = rank, error = %e, "Failed to start executable");
                self.status = WorkerStatus::Error;
                Err(e)
            }
        }
    }

    fn execute(&mut self, f: ExecuteFn) -> GangrunResult<Value> {
        let rank = self.info.world_rank;
        let executable = self.executable.as_mut().ok_or_else(|| {
            GangrunError::Runtime(format!("executable not started on worker {}", rank))
        })?;
        let target: &mut (dyn Any + Send) = &mut **executable;
        catch_unwind(AssertUnwindSafe(|| f(target)))
            .unwrap_or_else(|panic| Err(panic_error(rank, panic)))
    }
}

fn panic_error(rank: u32, panic: Box<dyn Any + Send>) -> GangrunError {
    let message = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    GangrunError::worker(rank, format!("panicked: {}", message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use gangrun_core::Resources;

    fn spawn_worker(rank: u32, gpus: Vec<u32>) -> LocalWorker {
        let info = WorkerInfo::new(rank, 4, "node-a")
            .with_resources(Resources::new(1, gpus.len() as u32), gpus);
        LocalWorker::spawn(info)
    }

    #[tokio::test]
    async fn test_hostname_and_gpu_ids() {
        let worker = spawn_worker(1, vec![2]);
        assert_eq!(worker.hostname().await.unwrap(), "node-a");
        assert_eq!(worker.gpu_ids().await.unwrap(), vec![2]);
        assert_eq!(worker.world_rank(), 1);
    }

    #[tokio::test]
    async fn test_initial_env() {
        let worker = spawn_worker(3, vec![0]);
        let env = worker.env_vars().await.unwrap();
        assert_eq!(env["WORLD_RANK"], "3");
        assert_eq!(env["WORLD_SIZE"], "4");
        assert_eq!(env["VISIBLE_DEVICES"], "0");

        let cpu_only = spawn_worker(0, vec![]);
        let env = cpu_only.env_vars().await.unwrap();
        assert!(!env.contains_key("VISIBLE_DEVICES"));
    }

    #[tokio::test]
    async fn test_update_env_visible_to_executable() {
        let worker = spawn_worker(0, vec![]);
        worker
            .update_env_vars(HashMap::from([("LOCAL_RANK".to_string(), "0".to_string())]))
            .await
            .unwrap();

        let factory: Arc<dyn ExecutableFactory> =
            Arc::new(|ctx: &WorkerContext| Ok::<_, GangrunError>(ctx.local_rank()));
        worker.start_executable(factory).await.unwrap();
        assert_eq!(worker.status().await.unwrap(), WorkerStatus::Running);

        let value = worker
            .execute(Box::new(|exe: &mut (dyn Any + Send)| {
                let local_rank = exe.downcast_ref::<Option<u32>>().cloned().flatten();
                Ok(serde_json::to_value(local_rank)?)
            }))
            .await
            .unwrap();
        assert_eq!(value, serde_json::json!(0));
    }

    #[tokio::test]
    async fn test_execute_before_start_fails() {
        let worker = spawn_worker(0, vec![]);
        let err = worker
            .execute(Box::new(|_: &mut (dyn Any + Send)| Ok(Value::Null)))
            .await
            .unwrap_err();
        assert!(matches!(err, GangrunError::Runtime(_)));
    }

    #[tokio::test]
    async fn test_panic_is_reported() {
        let worker = spawn_worker(2, vec![]);
        let err = worker
            .run(Box::new(|_: &WorkerContext| -> GangrunResult<Value> {
                panic!("boom")
            }))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("boom"));

        // The worker keeps serving after a failed call
        assert_eq!(worker.hostname().await.unwrap(), "node-a");
    }

    #[tokio::test]
    async fn test_shutdown() {
        let worker = spawn_worker(0, vec![]);
        worker.shutdown().await.unwrap();
        assert!(worker.hostname().await.is_err());
        assert_eq!(worker.status().await.unwrap(), WorkerStatus::Terminated);
        worker.shutdown().await.unwrap();
    }
}
