//! gangrun-rendezvous: Rendezvous service for gangrun
//!
//! Workers look up their slot in the host allocation plan and exchange
//! addresses through this service:
//! - The `RendezvousService` lifecycle interface
//! - An HTTP implementation built on axum
//! - A reqwest client for workers

pub mod client;
pub mod server;
pub mod traits;

pub use client::RendezvousClient;
pub use server::{create_router, HttpRendezvousServer, RendezvousState};
pub use traits::RendezvousService;
