//! gangrun-runtime: Worker abstraction layer
//!
//! This crate provides the worker side of gangrun:
//! - The `Worker` trait the launcher drives
//! - An in-process actor worker used by the local cluster
//! - Executable factories, including process-backed executables

pub mod executable;
pub mod local;
pub mod process;
pub mod traits;

pub use executable::{AnyExecutable, ExecutableFactory, ExecuteFn, RunFn, WorkerContext};
pub use local::LocalWorker;
pub use process::{command_factory, CommandExecutable, CommandSpec};
pub use traits::Worker;
