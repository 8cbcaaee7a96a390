//! gangrun-core: Core types for the gangrun launcher
//!
//! This crate provides the fundamental types used throughout gangrun:
//! - Executor, cluster and logging configuration
//! - Error handling
//! - Resource bundles and placement policies
//! - Rank records and rendezvous slots
//! - GPU device bookkeeping and worker metadata

pub mod config;
pub mod env;
pub mod error;
pub mod gpu;
pub mod rank;
pub mod resources;
pub mod worker;

pub use config::*;
pub use error::*;
pub use gpu::*;
pub use rank::*;
pub use resources::*;
pub use worker::*;
