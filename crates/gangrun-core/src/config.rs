//! Configuration types for gangrun

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{GangrunError, GangrunResult};

/// Executor configuration: how many workers to launch and what each one needs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Total number of workers, placed without per-host balance
    pub num_workers: Option<u32>,
    /// Number of hosts to spread workers over
    pub num_hosts: Option<u32>,
    /// Workers on each host, only used together with `num_hosts`
    #[serde(alias = "num_slots")]
    pub num_workers_per_host: u32,
    /// CPUs reserved for each worker
    pub cpus_per_worker: u32,
    /// Whether workers reserve GPUs
    pub use_gpu: bool,
    /// GPUs reserved for each worker (defaults to 1 when `use_gpu` is set)
    pub gpus_per_worker: Option<u32>,
    /// Launcher settings
    pub settings: Settings,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            num_workers: None,
            num_hosts: None,
            num_workers_per_host: 1,
            cpus_per_worker: 1,
            use_gpu: false,
            gpus_per_worker: None,
            settings: Settings::default(),
        }
    }
}

/// Shape of the worker group, derived from a validated [`ExecutorConfig`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlacementShape {
    /// One bundle per worker, co-location left to the scheduler
    Pack { num_workers: u32 },
    /// One bundle per host with a fixed number of workers each
    Spread {
        num_hosts: u32,
        num_workers_per_host: u32,
    },
}

impl PlacementShape {
    /// Total number of workers in the group
    pub fn num_workers(&self) -> u32 {
        match self {
            PlacementShape::Pack { num_workers } => *num_workers,
            PlacementShape::Spread {
                num_hosts,
                num_workers_per_host,
            } => num_hosts * num_workers_per_host,
        }
    }
}

impl ExecutorConfig {
    /// Configuration for `num_workers` workers placed anywhere
    pub fn with_workers(num_workers: u32) -> Self {
        Self {
            num_workers: Some(num_workers),
            ..Self::default()
        }
    }

    /// Configuration for `num_hosts` hosts running `per_host` workers each
    pub fn with_hosts(num_hosts: u32, per_host: u32) -> Self {
        Self {
            num_hosts: Some(num_hosts),
            num_workers_per_host: per_host,
            ..Self::default()
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> GangrunResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            GangrunError::Config(format!("Failed to read config file: {}", e))
        })?;
        toml::from_str(&content)
            .map_err(|e| GangrunError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Check the configuration before any cluster resource is touched
    pub fn validate(&self) -> GangrunResult<()> {
        match (self.num_workers, self.num_hosts) {
            (None, None) => {
                return Err(GangrunError::Config(
                    "Either `num_workers` or `num_hosts` must be set".to_string(),
                ))
            }
            (Some(_), Some(_)) => {
                return Err(GangrunError::Config(
                    "Both `num_workers` and `num_hosts` cannot be set".to_string(),
                ))
            }
            (Some(0), None) => {
                return Err(GangrunError::Config(
                    "`num_workers` must be >= 1".to_string(),
                ))
            }
            (None, Some(0)) => {
                return Err(GangrunError::Config("`num_hosts` must be >= 1".to_string()))
            }
            _ => {}
        }

        if self.cpus_per_worker == 0 {
            return Err(GangrunError::Config(
                "`cpus_per_worker` must be >= 1".to_string(),
            ));
        }

        if self.num_hosts.is_some() && self.num_workers_per_host == 0 {
            return Err(GangrunError::Config(
                "`num_workers_per_host` must be >= 1".to_string(),
            ));
        }

        if let Some(gpus) = self.gpus_per_worker {
            if !self.use_gpu {
                return Err(GangrunError::Config(
                    "`gpus_per_worker` is set, but `use_gpu` is false. `use_gpu` must be \
                     true if `gpus_per_worker` is set"
                        .to_string(),
                ));
            }
            if gpus < 1 {
                return Err(GangrunError::Config(format!(
                    "`gpus_per_worker` must be >= 1: got {}",
                    gpus
                )));
            }
        }

        Ok(())
    }

    /// Validated placement shape
    pub fn shape(&self) -> GangrunResult<PlacementShape> {
        self.validate()?;
        Ok(match (self.num_workers, self.num_hosts) {
            (Some(num_workers), _) => PlacementShape::Pack { num_workers },
            (None, Some(num_hosts)) => PlacementShape::Spread {
                num_hosts,
                num_workers_per_host: self.num_workers_per_host,
            },
            (None, None) => unreachable!("validated above"),
        })
    }

    /// GPUs per worker with the default applied
    pub fn effective_gpus_per_worker(&self) -> u32 {
        self.gpus_per_worker.unwrap_or(1)
    }
}

/// Launcher settings shared by placement and rendezvous
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Timeout in seconds for placement group acquisition
    pub placement_group_timeout_secs: u64,
    /// Network interfaces to use; detected when unset
    pub nics: Option<Vec<String>>,
    /// Address the rendezvous server binds to
    pub rendezvous_address: String,
    /// Port for the rendezvous server (0 picks a free port)
    pub rendezvous_port: u16,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            placement_group_timeout_secs: 100,
            nics: None,
            rendezvous_address: "0.0.0.0".to_string(),
            rendezvous_port: 0,
        }
    }
}

impl Settings {
    /// Placement group acquisition timeout
    pub fn placement_group_timeout(&self) -> Duration {
        Duration::from_secs(self.placement_group_timeout_secs)
    }
}

/// Description of the nodes a local cluster exposes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Cluster nodes
    pub nodes: Vec<NodeConfig>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1);
        Self {
            nodes: vec![NodeConfig {
                hostname: "localhost".to_string(),
                address: "127.0.0.1".to_string(),
                cpus,
                gpus: 0,
            }],
        }
    }
}

impl ClusterConfig {
    /// Load a cluster description from a TOML file
    pub fn from_file(path: &Path) -> GangrunResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            GangrunError::Config(format!("Failed to read cluster file: {}", e))
        })?;
        let config: ClusterConfig = toml::from_str(&content)?;
        if config.nodes.is_empty() {
            return Err(GangrunError::Config(
                "Cluster file defines no nodes".to_string(),
            ));
        }
        Ok(config)
    }
}

/// A single cluster node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Host identity reported by workers on this node
    pub hostname: String,
    /// Node IP address
    #[serde(default = "default_node_address")]
    pub address: String,
    /// Schedulable CPUs
    pub cpus: u32,
    /// Schedulable GPUs
    #[serde(default)]
    pub gpus: u32,
}

fn default_node_address() -> String {
    "127.0.0.1".to_string()
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
    /// Log file path (if any)
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.placement_group_timeout_secs, 100);
        assert_eq!(settings.rendezvous_port, 0);
        assert!(settings.nics.is_none());
    }

    #[test]
    fn test_neither_count_rejected() {
        let err = ExecutorConfig::default().validate().unwrap_err();
        assert!(matches!(err, GangrunError::Config(_)));
    }

    #[test]
    fn test_both_counts_rejected() {
        let mut config = ExecutorConfig::with_workers(4);
        config.num_hosts = Some(2);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("cannot be set"));
    }

    #[test]
    fn test_gpus_without_use_gpu_rejected() {
        let mut config = ExecutorConfig::with_workers(4);
        config.gpus_per_worker = Some(2);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("use_gpu"));
    }

    #[test]
    fn test_zero_gpus_rejected() {
        let mut config = ExecutorConfig::with_workers(4);
        config.use_gpu = true;
        config.gpus_per_worker = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_cpus_rejected() {
        let mut config = ExecutorConfig::with_hosts(2, 1);
        config.cpus_per_worker = 0;
        assert!(matches!(config.validate(), Err(GangrunError::Config(_))));
    }

    #[test]
    fn test_shape() {
        assert_eq!(
            ExecutorConfig::with_workers(3).shape().unwrap(),
            PlacementShape::Pack { num_workers: 3 }
        );
        let shape = ExecutorConfig::with_hosts(2, 4).shape().unwrap();
        assert_eq!(
            shape,
            PlacementShape::Spread {
                num_hosts: 2,
                num_workers_per_host: 4
            }
        );
        assert_eq!(shape.num_workers(), 8);
    }

    #[test]
    fn test_effective_gpus_default() {
        let mut config = ExecutorConfig::with_workers(1);
        config.use_gpu = true;
        assert_eq!(config.effective_gpus_per_worker(), 1);
        config.gpus_per_worker = Some(2);
        assert_eq!(config.effective_gpus_per_worker(), 2);
    }

    #[test]
    fn test_executor_config_parse() {
        let toml_str = r#"
num_hosts = 2
num_slots = 4
use_gpu = true

[settings]
placement_group_timeout_secs = 5
nics = ["eth0"]
"#;
        let config: ExecutorConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.num_hosts, Some(2));
        assert_eq!(config.num_workers_per_host, 4);
        assert_eq!(config.cpus_per_worker, 1);
        assert_eq!(config.settings.placement_group_timeout_secs, 5);
        assert_eq!(config.settings.rendezvous_address, "0.0.0.0");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_cluster_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[[nodes]]
hostname = "node-a"
cpus = 8
gpus = 2

[[nodes]]
hostname = "node-b"
address = "10.0.0.2"
cpus = 4
"#
        )
        .unwrap();

        let config = ClusterConfig::from_file(file.path()).unwrap();
        assert_eq!(config.nodes.len(), 2);
        assert_eq!(config.nodes[0].address, "127.0.0.1");
        assert_eq!(config.nodes[1].gpus, 0);
    }

    #[test]
    fn test_missing_config_file() {
        let err = ExecutorConfig::from_file(Path::new("/nonexistent/gangrun.toml")).unwrap_err();
        assert!(matches!(err, GangrunError::Config(_)));
    }
}
