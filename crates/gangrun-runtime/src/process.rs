//! Process-backed executables
//!
//! A [`CommandExecutable`] runs the training program as an OS process with the
//! worker's environment materialized, so rank and rendezvous variables reach
//! the program exactly as they were pushed to the worker.

use gangrun_core::{GangrunError, GangrunResult};
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::{Child, Command};
use tracing::{debug, error, info};

use crate::executable::{ExecutableFactory, WorkerContext};

/// Program to launch on every worker
#[derive(Debug, Clone)]
pub struct CommandSpec {
    /// Path to the program
    pub program: PathBuf,
    /// Program arguments
    pub args: Vec<String>,
    /// Forward the program's stdout/stderr to ours instead of discarding it
    pub inherit_output: bool,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            inherit_output: true,
        }
    }
}

/// A running worker program
pub struct CommandExecutable {
    child: Child,
    pid: Option<u32>,
    world_rank: u32,
}

impl CommandExecutable {
    /// Spawn the program for the worker described by `ctx`
    pub fn spawn(spec: &CommandSpec, ctx: &WorkerContext) -> GangrunResult<Self> {
        info!(
            world_rank = ctx.world_rank,
            hostname = %ctx.hostname,
            program = %spec.program.display(),
            "Starting worker program"
        );

        let mut cmd = build_command(spec, ctx);
        match cmd.spawn() {
            Ok(child) => {
                let pid = child.id();
                debug!(world_rank = ctx.world_rank, pid = ?pid, "Worker program spawned");
                Ok(Self {
                    child,
                    pid,
                    world_rank: ctx.world_rank,
                })
            }
            Err(e) => {
                error!(
                    world_rank = ctx.world_rank,
                    error = %e,
                    "Failed to spawn worker program"
                );
                Err(GangrunError::Runtime(format!(
                    "Failed to spawn {}: {}",
                    spec.program.display(),
                    e
                )))
            }
        }
    }

    /// OS process id, if the process was started
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Exit code if the program has finished; `-1` when killed by a signal
    pub fn try_exit_code(&mut self) -> GangrunResult<Option<i32>> {
        let status = self.child.try_wait()?;
        Ok(status.map(|s| s.code().unwrap_or(-1)))
    }

    /// Ask the program to stop
    pub fn kill(&mut self) -> GangrunResult<()> {
        debug!(world_rank = self.world_rank, pid = ?self.pid, "Killing worker program");
        self.child.start_kill()?;
        Ok(())
    }
}

/// Factory that launches `spec` on every worker
pub fn command_factory(spec: CommandSpec) -> impl ExecutableFactory {
    move |ctx: &WorkerContext| CommandExecutable::spawn(&spec, ctx)
}

/// Build the command to start a worker program
fn build_command(spec: &CommandSpec, ctx: &WorkerContext) -> Command {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args);
    cmd.envs(&ctx.env);
    cmd.kill_on_drop(true);

    if spec.inherit_output {
        cmd.stdout(Stdio::inherit());
        cmd.stderr(Stdio::inherit());
    } else {
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::null());
    }

    cmd
}
