//! Host strings and the host allocation plan

use gangrun_core::{GangrunError, GangrunResult, SlotInfo};
use std::collections::HashMap;

/// A host and the number of process slots it offers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostInfo {
    pub hostname: String,
    pub slots: u32,
}

impl HostInfo {
    pub fn new(hostname: impl Into<String>, slots: u32) -> Self {
        Self {
            hostname: hostname.into(),
            slots,
        }
    }

    /// Parse a `host:slots` entry
    pub fn parse(entry: &str) -> GangrunResult<Self> {
        let (hostname, slots) = entry.trim().rsplit_once(':').ok_or_else(|| {
            GangrunError::Config(format!("Invalid host '{}', expected host:slots", entry))
        })?;
        if hostname.is_empty() {
            return Err(GangrunError::Config(format!(
                "Invalid host '{}': empty hostname",
                entry
            )));
        }
        let slots = slots.parse::<u32>().map_err(|e| {
            GangrunError::Config(format!("Invalid slot count in '{}': {}", entry, e))
        })?;
        Ok(Self::new(hostname, slots))
    }
}

impl std::fmt::Display for HostInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.hostname, self.slots)
    }
}

/// Parse a comma-separated host string such as `a:2,b:3`
pub fn parse_hosts(hosts: &str) -> GangrunResult<Vec<HostInfo>> {
    hosts
        .split(',')
        .filter(|s| !s.trim().is_empty())
        .map(HostInfo::parse)
        .collect()
}

/// Render hosts back into `a:2,b:3` form
pub fn format_hosts(hosts: &[HostInfo]) -> String {
    hosts
        .iter()
        .map(HostInfo::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// Assign `num_proc` ranks to host slots
///
/// Ranks fill each host's slots before moving to the next host, in the order
/// given. A host's cross rank for a local rank is its position among hosts
/// that have a slot at that local rank.
pub fn get_host_assignments(hosts: &[HostInfo], num_proc: u32) -> GangrunResult<Vec<SlotInfo>> {
    let mut host_ranks: Vec<(&HostInfo, Vec<u32>)> = Vec::with_capacity(hosts.len());
    // local_rank -> hostname -> cross_rank
    let mut cross_ranks: HashMap<u32, HashMap<&str, u32>> = HashMap::new();
    let mut rank = 0;

    for host in hosts {
        let mut ranks = Vec::new();
        for local_rank in 0..host.slots {
            if rank == num_proc {
                break;
            }
            ranks.push(rank);
            rank += 1;

            let at_local = cross_ranks.entry(local_rank).or_default();
            let next = at_local.len() as u32;
            at_local.insert(host.hostname.as_str(), next);
        }
        host_ranks.push((host, ranks));
    }

    let world_size = rank;
    if world_size < num_proc {
        return Err(GangrunError::Config(format!(
            "Requested {} processes, but hosts {} only provide {} slots",
            num_proc,
            format_hosts(hosts),
            world_size
        )));
    }

    let mut plan = Vec::with_capacity(world_size as usize);
    for (host, ranks) in host_ranks {
        let local_size = ranks.len() as u32;
        for (local_rank, rank) in ranks.into_iter().enumerate() {
            let local_rank = local_rank as u32;
            let at_local = &cross_ranks[&local_rank];
            plan.push(SlotInfo {
                hostname: host.hostname.clone(),
                rank,
                local_rank,
                cross_rank: at_local[host.hostname.as_str()],
                size: world_size,
                local_size,
                cross_size: at_local.len() as u32,
            });
        }
    }

    Ok(plan)
}
