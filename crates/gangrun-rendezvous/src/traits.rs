//! Rendezvous service interface

use async_trait::async_trait;
use gangrun_core::{GangrunResult, SlotInfo};

/// Service workers contact to join the collective
#[async_trait]
pub trait RendezvousService: Send + Sync {
    /// Start listening and return the bound port
    async fn start(&mut self) -> GangrunResult<u16>;

    /// Install the host allocation plan for this run
    async fn init(&mut self, plan: Vec<SlotInfo>) -> GangrunResult<()>;

    /// Stop listening. Safe to call when not started.
    async fn stop(&mut self) -> GangrunResult<()>;
}
