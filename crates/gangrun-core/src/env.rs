//! Environment variable names pushed to workers

pub const WORLD_RANK: &str = "WORLD_RANK";
pub const WORLD_SIZE: &str = "WORLD_SIZE";

pub const CROSS_RANK: &str = "CROSS_RANK";
pub const CROSS_SIZE: &str = "CROSS_SIZE";
pub const LOCAL_RANK: &str = "LOCAL_RANK";
pub const LOCAL_SIZE: &str = "LOCAL_SIZE";

pub const RENDEZVOUS_ADDR: &str = "RENDEZVOUS_ADDR";
pub const RENDEZVOUS_PORT: &str = "RENDEZVOUS_PORT";
pub const CONTROLLER: &str = "CONTROLLER";
pub const CPU_OPERATIONS: &str = "CPU_OPERATIONS";

/// Devices visible to every worker of a Spread bundle
pub const VISIBLE_DEVICES: &str = "VISIBLE_DEVICES";

/// Comma-separated network interfaces for collective traffic
pub const SOCKET_IFNAME: &str = "SOCKET_IFNAME";

/// Controller and CPU operation backend
pub const GLOO: &str = "gloo";
