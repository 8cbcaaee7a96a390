//! CLI commands implementation

use anyhow::{Context, Result};
use clap::Args;
use gangrun_core::{ClusterConfig, ExecutorConfig};
use gangrun_executor::{get_host_assignments, parse_hosts, Executor};
use gangrun_runtime::{command_factory, CommandExecutable, CommandSpec};
use gangrun_scheduler::LocalCluster;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Options for `gangrun launch`
#[derive(Args, Debug)]
pub struct LaunchArgs {
    /// Executor configuration file (TOML)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Cluster description file (TOML); defaults to this machine
    #[arg(long)]
    pub cluster: Option<PathBuf>,

    /// Total number of workers
    #[arg(long)]
    pub num_workers: Option<u32>,

    /// Number of hosts to spread workers over
    #[arg(long)]
    pub num_hosts: Option<u32>,

    /// Workers on each host, with --num-hosts
    #[arg(long)]
    pub workers_per_host: Option<u32>,

    /// CPUs reserved per worker
    #[arg(long)]
    pub cpus_per_worker: Option<u32>,

    /// Reserve GPUs for workers
    #[arg(long)]
    pub use_gpu: bool,

    /// GPUs reserved per worker
    #[arg(long)]
    pub gpus_per_worker: Option<u32>,

    /// Seconds to wait for cluster resources
    #[arg(long)]
    pub pg_timeout: Option<u64>,

    /// Network interfaces to use, comma separated
    #[arg(long, value_delimiter = ',')]
    pub nics: Option<Vec<String>>,

    /// How often to check whether workers have exited, in milliseconds
    #[arg(long, default_value_t = 500)]
    pub poll_interval_ms: u64,

    /// Program and arguments to run on every worker
    #[arg(last = true, required = true)]
    pub command: Vec<String>,
}

impl LaunchArgs {
    /// Executor configuration: file values overridden by flags
    fn executor_config(&self) -> Result<ExecutorConfig> {
        let mut config = match &self.config {
            Some(path) => ExecutorConfig::from_file(path)?,
            None => ExecutorConfig::default(),
        };

        if let Some(n) = self.num_workers {
            config.num_workers = Some(n);
        }
        if let Some(n) = self.num_hosts {
            config.num_hosts = Some(n);
        }
        if let Some(n) = self.workers_per_host {
            config.num_workers_per_host = n;
        }
        if let Some(n) = self.cpus_per_worker {
            config.cpus_per_worker = n;
        }
        if self.use_gpu {
            config.use_gpu = true;
        }
        if let Some(n) = self.gpus_per_worker {
            config.gpus_per_worker = Some(n);
        }
        if let Some(secs) = self.pg_timeout {
            config.settings.placement_group_timeout_secs = secs;
        }
        if let Some(nics) = &self.nics {
            config.settings.nics = Some(nics.clone());
        }

        Ok(config)
    }

    fn cluster_config(&self) -> Result<ClusterConfig> {
        Ok(match &self.cluster {
            Some(path) => ClusterConfig::from_file(path)?,
            None => ClusterConfig::default(),
        })
    }
}

/// Launch the program on a new worker group; returns the exit code to use
pub async fn launch(args: LaunchArgs) -> Result<i32> {
    let config = args.executor_config()?;
    let cluster = args.cluster_config()?;
    let (program, program_args) = args
        .command
        .split_first()
        .context("No program given to launch")?;

    let scheduler = Arc::new(LocalCluster::new(&cluster));
    let mut executor = Executor::new(config, scheduler)?;
    let spec = CommandSpec::new(program, program_args.to_vec());
    let poll = Duration::from_millis(args.poll_interval_ms);

    let outcome = tokio::select! {
        result = run_to_completion(&mut executor, spec, poll) => Some(result),
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, stopping workers");
            None
        }
    };
    executor.shutdown().await?;
    let Some(outcome) = outcome else {
        return Ok(130);
    };
    let codes = outcome?;

    for (rank, code) in codes.iter().enumerate() {
        match code {
            Some(0) => {}
            Some(code) => eprintln!("Worker {} exited with code {}", rank, code),
            None => eprintln!("Worker {} was stopped", rank),
        }
    }
    Ok(codes.into_iter().flatten().find(|c| *c != 0).unwrap_or(0))
}

/// Start the group and wait until every worker program exits
///
/// When one worker fails, the remaining workers are stopped and reported
/// as `None`.
async fn run_to_completion(
    executor: &mut Executor,
    spec: CommandSpec,
    poll: Duration,
) -> Result<Vec<Option<i32>>> {
    executor
        .start_with_factory(Arc::new(command_factory(spec)), HashMap::new())
        .await?;
    info!(workers = executor.workers().len(), "Workers started");

    loop {
        let codes: Vec<Option<i32>> = executor
            .execute(|exe: &mut CommandExecutable| exe.try_exit_code().unwrap_or(Some(-1)))
            .await?;

        if codes.iter().all(Option::is_some) {
            return Ok(codes);
        }

        if codes.iter().any(|c| matches!(c, Some(code) if *code != 0)) {
            warn!("A worker failed, stopping the others");
            executor
                .execute(|exe: &mut CommandExecutable| exe.kill().is_ok())
                .await?;
            return Ok(codes);
        }

        tokio::time::sleep(poll).await;
    }
}

/// Print the host allocation plan for `hosts`
pub fn plan(hosts: &str, num_proc: Option<u32>, json: bool) -> Result<()> {
    let hosts = parse_hosts(hosts)?;
    let num_proc = num_proc.unwrap_or_else(|| hosts.iter().map(|h| h.slots).sum());
    let plan = get_host_assignments(&hosts, num_proc)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(());
    }

    println!(
        "{:<6} {:<20} {:<11} {:<11} {:<11} {:<11}",
        "RANK", "HOST", "LOCAL_RANK", "LOCAL_SIZE", "CROSS_RANK", "CROSS_SIZE"
    );
    for slot in &plan {
        println!(
            "{:<6} {:<20} {:<11} {:<11} {:<11} {:<11}",
            slot.rank,
            slot.hostname,
            slot.local_rank,
            slot.local_size,
            slot.cross_rank,
            slot.cross_size
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct LaunchCli {
        #[command(flatten)]
        launch: LaunchArgs,
    }

    fn parse(args: &[&str]) -> LaunchArgs {
        LaunchCli::try_parse_from(std::iter::once("gangrun").chain(args.iter().copied()))
            .unwrap()
            .launch
    }

    #[test]
    fn test_flags_build_config() {
        let args = parse(&[
            "--num-hosts",
            "2",
            "--workers-per-host",
            "4",
            "--use-gpu",
            "--pg-timeout",
            "10",
            "--nics",
            "eth0,ib0",
            "--",
            "python",
            "train.py",
        ]);
        let config = args.executor_config().unwrap();
        assert_eq!(config.num_hosts, Some(2));
        assert_eq!(config.num_workers_per_host, 4);
        assert!(config.use_gpu);
        assert_eq!(config.settings.placement_group_timeout_secs, 10);
        assert_eq!(
            config.settings.nics,
            Some(vec!["eth0".to_string(), "ib0".to_string()])
        );
        assert_eq!(args.command, vec!["python", "train.py"]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_program_is_required() {
        let result = LaunchCli::try_parse_from(["gangrun", "--num-workers", "2"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_plan_rejects_short_hosts() {
        assert!(plan("a:1", Some(2), false).is_err());
        assert!(plan("a:2,b:1", None, true).is_ok());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_launch_reports_failing_rank() {
        let dir = tempfile::TempDir::new().unwrap();
        let cluster = dir.path().join("cluster.toml");
        std::fs::write(
            &cluster,
            "[[nodes]]\nhostname = \"localhost\"\ncpus = 4\n",
        )
        .unwrap();

        let args = parse(&[
            "--cluster",
            cluster.to_str().unwrap(),
            "--num-workers",
            "2",
            "--poll-interval-ms",
            "20",
            "--",
            "/bin/sh",
            "-c",
            "exit $WORLD_RANK",
        ]);
        assert_eq!(launch(args).await.unwrap(), 1);
    }
}
