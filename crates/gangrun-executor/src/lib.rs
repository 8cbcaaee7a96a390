//! gangrun-executor: Worker group orchestration
//!
//! This crate ties placement, rank assignment and rendezvous together:
//! - Host strings and the host allocation plan
//! - The rank coordinator
//! - The `Executor` driving a worker group through its lifecycle

pub mod coordinator;
pub mod executor;
pub mod hosts;

pub use coordinator::Coordinator;
pub use executor::{Executor, PendingResult};
pub use hosts::{format_hosts, get_host_assignments, parse_hosts, HostInfo};
