//! gangrun-scheduler: Bundle placement for gangrun
//!
//! This crate decides where workers run:
//! - The `ClusterScheduler` interface and an in-process `LocalCluster`
//! - GPU allocation and tracking per node
//! - Bounded-time bundle acquisition
//! - Spread and Pack placement strategies

pub mod acquire;
pub mod gpu_allocator;
pub mod local;
pub mod placement;
pub mod traits;

pub use acquire::acquire;
pub use gpu_allocator::GpuAllocator;
pub use local::LocalCluster;
pub use placement::{PackStrategy, PlacementStrategy, SpreadStrategy, WorkerSet};
pub use traits::{ClusterScheduler, SpawnRequest};
