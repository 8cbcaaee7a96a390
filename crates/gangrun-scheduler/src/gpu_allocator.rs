//! Per-node GPU bookkeeping for placement groups

use gangrun_core::{GangrunError, GangrunResult, GpuDevice, GpuInfo, PlacementGroupId};
use std::collections::BTreeMap;
use tracing::debug;

/// Tracks which placement group holds each device of one node
#[derive(Debug, Clone)]
pub struct GpuAllocator {
    devices: Vec<GpuDevice>,
    /// device index -> owning group
    owners: BTreeMap<u32, PlacementGroupId>,
}

impl GpuAllocator {
    pub fn new(gpu_info: GpuInfo) -> Self {
        Self {
            devices: gpu_info.devices,
            owners: BTreeMap::new(),
        }
    }

    fn free_indices(&self) -> impl Iterator<Item = u32> + '_ {
        self.devices
            .iter()
            .filter(|d| d.available && !self.owners.contains_key(&d.index))
            .map(|d| d.index)
    }

    /// Devices neither reserved nor marked unavailable
    pub fn available_count(&self) -> u32 {
        self.free_indices().count() as u32
    }

    /// Reserve `count` devices for `group`, lowest indices first
    ///
    /// A group may reserve several times (one call per bundle); all of its
    /// devices are returned together by [`GpuAllocator::release_group`].
    pub fn reserve(&mut self, group: PlacementGroupId, count: u32) -> GangrunResult<Vec<u32>> {
        let ids: Vec<u32> = self.free_indices().take(count as usize).collect();
        if ids.len() < count as usize {
            return Err(GangrunError::Scheduler(format!(
                "Not enough GPUs available: requested {}, available {}",
                count,
                ids.len()
            )));
        }

        for id in &ids {
            self.owners.insert(*id, group);
        }
        if !ids.is_empty() {
            debug!(placement_group = %group, gpus = ?ids, "Reserved GPUs");
        }
        Ok(ids)
    }

    /// Return every device held by `group`; returns how many were freed
    pub fn release_group(&mut self, group: PlacementGroupId) -> u32 {
        let before = self.owners.len();
        self.owners.retain(|_, owner| *owner != group);
        let freed = (before - self.owners.len()) as u32;
        if freed > 0 {
            debug!(placement_group = %group, freed, "Released GPUs");
        }
        freed
    }
}
