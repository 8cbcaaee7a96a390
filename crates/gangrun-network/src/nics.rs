//! Network interface detection for collective traffic

use async_trait::async_trait;
use futures::future::try_join_all;
use gangrun_core::{env, GangrunError, GangrunResult, Settings};
use gangrun_runtime::{RunFn, Worker, WorkerContext};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Where the kernel lists network interfaces
pub const SYS_CLASS_NET: &str = "/sys/class/net";

/// Chooses the interfaces workers use to reach each other
#[async_trait]
pub trait NicDetector: Send + Sync {
    /// Interfaces usable by every host, sorted; empty when no choice is needed
    async fn detect(
        &self,
        settings: &Settings,
        hostnames: &[String],
        node_workers: &[Arc<dyn Worker>],
    ) -> GangrunResult<Vec<String>>;
}

/// Configured interfaces, or the interfaces common to every host
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultNics;

#[async_trait]
impl NicDetector for DefaultNics {
    async fn detect(
        &self,
        settings: &Settings,
        hostnames: &[String],
        node_workers: &[Arc<dyn Worker>],
    ) -> GangrunResult<Vec<String>> {
        if let Some(nics) = &settings.nics {
            let nics: BTreeSet<String> = nics.iter().cloned().collect();
            debug!(nics = ?nics, "Using configured interfaces");
            return Ok(nics.into_iter().collect());
        }

        let distinct: HashSet<&String> = hostnames.iter().collect();
        if distinct.len() <= 1 {
            debug!("Single host, skipping interface detection");
            return Ok(Vec::new());
        }

        let probes = node_workers.iter().map(|w| {
            let probe: RunFn = Box::new(|_: &WorkerContext| -> GangrunResult<Value> {
                Ok(serde_json::to_value(list_interfaces(Path::new(SYS_CLASS_NET))?)?)
            });
            w.run(probe)
        });
        let reported = try_join_all(probes).await?;

        let mut common: Option<BTreeSet<String>> = None;
        for value in reported {
            let names: BTreeSet<String> = serde_json::from_value::<Vec<String>>(value)?
                .into_iter()
                .collect();
            common = Some(match common {
                Some(acc) => acc.intersection(&names).cloned().collect(),
                None => names,
            });
        }

        let common: Vec<String> = common.unwrap_or_default().into_iter().collect();
        if common.is_empty() {
            return Err(GangrunError::Runtime(format!(
                "No network interface is shared by all {} hosts",
                distinct.len()
            )));
        }

        info!(nics = ?common, hosts = distinct.len(), "Detected common interfaces");
        Ok(common)
    }
}

/// Non-loopback interface names under `root`, sorted
pub fn list_interfaces(root: &Path) -> GangrunResult<Vec<String>> {
    let mut names = Vec::new();
    for entry in std::fs::read_dir(root)? {
        let name = entry?.file_name().to_string_lossy().into_owned();
        if name != "lo" {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}

/// Environment entries selecting `nics` for collective traffic
pub fn nics_to_env(nics: &[String]) -> HashMap<String, String> {
    if nics.is_empty() {
        return HashMap::new();
    }
    let mut sorted: Vec<&str> = nics.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    sorted.dedup();
    HashMap::from([(env::SOCKET_IFNAME.to_string(), sorted.join(","))])
}
