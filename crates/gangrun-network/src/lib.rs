//! gangrun-network: Networking helpers for gangrun
//!
//! This crate provides:
//! - Network interface detection across the hosts of a worker group
//! - Discovery of the driver's reachable address

pub mod address;
pub mod nics;

pub use address::driver_address;
pub use nics::{list_interfaces, nics_to_env, DefaultNics, NicDetector};
