//! Rank coordination
//!
//! The coordinator learns which host every world rank landed on, derives the
//! local and cross ranks from that layout and owns the rendezvous service the
//! workers meet at.

use gangrun_core::{env, GangrunError, GangrunResult, RankRecord, Settings};
use gangrun_rendezvous::{HttpRendezvousServer, RendezvousService};
use indexmap::IndexMap;
use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use tracing::{debug, info};

use crate::hosts::{format_hosts, get_host_assignments, HostInfo};

/// Assigns local and cross ranks from the host layout of a worker group
pub struct Coordinator {
    /// hostname -> world ranks, in registration order
    hostnames_by_rank: IndexMap<String, Vec<u32>>,
    rendezvous: Box<dyn RendezvousService>,
    rendezvous_started: bool,
}

impl Coordinator {
    /// Coordinator serving rendezvous over HTTP as configured in `settings`
    pub fn new(settings: &Settings) -> Self {
        Self::with_rendezvous(Box::new(HttpRendezvousServer::new(
            settings.rendezvous_address.clone(),
            settings.rendezvous_port,
        )))
    }

    pub fn with_rendezvous(rendezvous: Box<dyn RendezvousService>) -> Self {
        Self {
            hostnames_by_rank: IndexMap::new(),
            rendezvous,
            rendezvous_started: false,
        }
    }

    /// Record that `world_rank` runs on `hostname`
    ///
    /// Workers must be registered in world-rank order; local ranks follow the
    /// order of registration within each host.
    pub fn register(&mut self, hostname: &str, world_rank: u32) {
        debug!(hostname, world_rank, "Registering worker");
        self.hostnames_by_rank
            .entry(hostname.to_string())
            .or_default()
            .push(world_rank);
    }

    /// Number of registered workers
    pub fn world_size(&self) -> u32 {
        self.hostnames_by_rank.values().map(|r| r.len() as u32).sum()
    }

    /// Registered hosts in first-registration order
    pub fn hostnames(&self) -> Vec<String> {
        self.hostnames_by_rank.keys().cloned().collect()
    }

    /// Registered hosts with their worker counts
    pub fn hosts(&self) -> Vec<HostInfo> {
        self.hostnames_by_rank
            .iter()
            .map(|(host, ranks)| HostInfo::new(host.clone(), ranks.len() as u32))
            .collect()
    }

    /// `host:n` pairs in registration order
    pub fn hoststring(&self) -> String {
        format_hosts(&self.hosts())
    }

    /// Rank record for every registered world rank
    ///
    /// Hosts are visited in first-registration order; the cross rank of a
    /// worker is the number of earlier hosts that have a worker at the same
    /// local rank. Does not modify the registrations.
    pub fn finalize_registration(&self) -> BTreeMap<u32, RankRecord> {
        let mut cross_sizes: HashMap<u32, u32> = HashMap::new();
        let mut records = BTreeMap::new();

        for world_ranks in self.hostnames_by_rank.values() {
            let local_size = world_ranks.len() as u32;
            for (local_rank, &world_rank) in world_ranks.iter().enumerate() {
                let local_rank = local_rank as u32;
                let count = cross_sizes.entry(local_rank).or_insert(0);
                records.insert(
                    world_rank,
                    RankRecord {
                        cross_rank: *count,
                        cross_size: 0,
                        local_rank,
                        local_size,
                    },
                );
                *count += 1;
            }
        }

        for record in records.values_mut() {
            record.cross_size = cross_sizes[&record.local_rank];
        }

        records
    }

    /// Start the rendezvous service and return the environment workers need
    /// to reach it. Call after every worker is registered.
    ///
    /// The plan handed to the service fills hosts one after another, so
    /// `SlotInfo::rank` is a position in that plan. When registrations
    /// interleave hosts it differs from the worker's `WORLD_RANK`; look slots
    /// up by `(hostname, local_rank)` instead.
    pub async fn establish_rendezvous(
        &mut self,
        driver_address: IpAddr,
    ) -> GangrunResult<HashMap<String, String>> {
        let world_size = self.world_size();
        if world_size == 0 {
            return Err(GangrunError::Rendezvous(
                "No workers registered before rendezvous".to_string(),
            ));
        }

        let plan = get_host_assignments(&self.hosts(), world_size)?;
        let port = self.rendezvous.start().await?;
        self.rendezvous_started = true;
        self.rendezvous.init(plan).await?;

        info!(
            address = %driver_address,
            port,
            hosts = %self.hoststring(),
            "Rendezvous established"
        );

        Ok(HashMap::from([
            (env::RENDEZVOUS_ADDR.to_string(), driver_address.to_string()),
            (env::RENDEZVOUS_PORT.to_string(), port.to_string()),
            (env::CONTROLLER.to_string(), env::GLOO.to_string()),
            (env::CPU_OPERATIONS.to_string(), env::GLOO.to_string()),
        ]))
    }

    /// Stop the rendezvous service if it was started
    pub async fn shutdown(&mut self) -> GangrunResult<()> {
        if self.rendezvous_started {
            self.rendezvous.stop().await?;
            self.rendezvous_started = false;
        }
        Ok(())
    }
}
