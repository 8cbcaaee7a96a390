//! Resource requests and placement group types

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// CPU/GPU quantity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resources {
    pub cpu: u32,
    pub gpu: u32,
}

impl Resources {
    pub fn new(cpu: u32, gpu: u32) -> Self {
        Self { cpu, gpu }
    }

    /// Whether `other` fits inside these resources
    pub fn fits(&self, other: &Resources) -> bool {
        self.cpu >= other.cpu && self.gpu >= other.gpu
    }

    /// Subtract `other`, or `None` if it does not fit
    pub fn checked_sub(&self, other: &Resources) -> Option<Resources> {
        Some(Resources {
            cpu: self.cpu.checked_sub(other.cpu)?,
            gpu: self.gpu.checked_sub(other.gpu)?,
        })
    }

    pub fn saturating_add(&self, other: &Resources) -> Resources {
        Resources {
            cpu: self.cpu.saturating_add(other.cpu),
            gpu: self.gpu.saturating_add(other.gpu),
        }
    }

    /// Scale every quantity by `n`
    pub fn times(&self, n: u32) -> Resources {
        Resources {
            cpu: self.cpu * n,
            gpu: self.gpu * n,
        }
    }
}

impl std::fmt::Display for Resources {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{CPU: {}, GPU: {}}}", self.cpu, self.gpu)
    }
}

/// Render a list of bundle shapes for diagnostics
pub fn format_bundles(bundles: &[Resources]) -> String {
    let parts: Vec<String> = bundles.iter().map(|b| b.to_string()).collect();
    format!("[{}]", parts.join(", "))
}

/// How the scheduler may arrange a placement group's bundles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlacementPolicy {
    /// Every bundle on a different host
    StrictSpread,
    /// Bundles may share hosts
    Pack,
}

impl std::fmt::Display for PlacementPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlacementPolicy::StrictSpread => write!(f, "STRICT_SPREAD"),
            PlacementPolicy::Pack => write!(f, "PACK"),
        }
    }
}

/// Identifier of a placement group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlacementGroupId(pub Uuid);

impl PlacementGroupId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PlacementGroupId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for PlacementGroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A ready placement group as seen by its owner
#[derive(Debug, Clone)]
pub struct PlacementGroup {
    pub id: PlacementGroupId,
    pub policy: PlacementPolicy,
    /// Resources of each bundle, indexed by bundle index
    pub bundles: Vec<Resources>,
}

impl PlacementGroup {
    pub fn bundle(&self, index: usize) -> BundleRef {
        BundleRef {
            group: self.id,
            index,
        }
    }
}

/// Reference to one bundle inside a placement group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BundleRef {
    pub group: PlacementGroupId,
    pub index: usize,
}
