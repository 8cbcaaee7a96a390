//! Rank records and rendezvous slot assignments

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::env;

/// Local and cross placement of one world rank
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankRecord {
    /// Ordinal of this worker's host among hosts with a worker at `local_rank`
    pub cross_rank: u32,
    /// Number of hosts with at least `local_rank + 1` workers
    pub cross_size: u32,
    /// Position of this worker within its host
    pub local_rank: u32,
    /// Number of workers on this worker's host
    pub local_size: u32,
}

impl RankRecord {
    /// Environment entries for this record
    pub fn to_env(&self) -> HashMap<String, String> {
        HashMap::from([
            (env::CROSS_RANK.to_string(), self.cross_rank.to_string()),
            (env::CROSS_SIZE.to_string(), self.cross_size.to_string()),
            (env::LOCAL_RANK.to_string(), self.local_rank.to_string()),
            (env::LOCAL_SIZE.to_string(), self.local_size.to_string()),
        ])
    }
}

/// One process slot of the rendezvous allocation plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotInfo {
    pub hostname: String,
    pub rank: u32,
    pub local_rank: u32,
    pub cross_rank: u32,
    pub size: u32,
    pub local_size: u32,
    pub cross_size: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rank_record_env() {
        let record = RankRecord {
            cross_rank: 1,
            cross_size: 2,
            local_rank: 0,
            local_size: 3,
        };
        let env = record.to_env();
        assert_eq!(env.len(), 4);
        assert_eq!(env["CROSS_RANK"], "1");
        assert_eq!(env["CROSS_SIZE"], "2");
        assert_eq!(env["LOCAL_RANK"], "0");
        assert_eq!(env["LOCAL_SIZE"], "3");
    }
}
