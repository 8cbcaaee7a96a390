//! GPU device bookkeeping and device-list formatting

use serde::{Deserialize, Serialize};

use crate::{GangrunError, GangrunResult};

/// Represents a GPU device on a node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpuDevice {
    /// Device index
    pub index: u32,
    /// Device name
    pub name: String,
    /// Whether the device is available for allocation
    pub available: bool,
}

/// GPU inventory of a node
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GpuInfo {
    /// List of GPU devices
    pub devices: Vec<GpuDevice>,
    /// Total number of GPUs
    pub total_count: u32,
    /// Number of available GPUs
    pub available_count: u32,
}

impl GpuInfo {
    /// Inventory of `count` identical, available devices indexed from 0
    pub fn with_count(count: u32) -> Self {
        let devices = (0..count)
            .map(|index| GpuDevice {
                index,
                name: format!("GPU {}", index),
                available: true,
            })
            .collect();
        Self {
            devices,
            total_count: count,
            available_count: count,
        }
    }
}

/// Render device ids as a visibility list, e.g. `0,1,3`
pub fn format_device_ids(ids: &[u32]) -> String {
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// Parse a visibility list produced by [`format_device_ids`]
pub fn parse_device_ids(value: &str) -> GangrunResult<Vec<u32>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<u32>()
                .map_err(|e| GangrunError::Config(format!("Invalid device id '{}': {}", s, e)))
        })
        .collect()
}
