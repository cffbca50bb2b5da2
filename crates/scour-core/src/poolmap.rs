//! In-memory pool-map model used by the engine's pool-cleanup phase.
//!
//! The real on-disk map mutation layer is an external collaborator; the
//! checker loads a snapshot through the pool-store port, repairs it in
//! memory, and flushes it back when something changed.

use serde::{Deserialize, Serialize};

use crate::types::Rank;

/// Status of a pool-map component (domain or target).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MapEntryState {
    Up,
    UpIn,
    New,
    Down,
    DownOut,
    Drain,
    /// A value the checker does not understand (downgrade artefact).
    Unknown,
}

impl MapEntryState {
    pub fn is_down(self) -> bool {
        matches!(self, Self::Down | Self::DownOut)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapTarget {
    pub index: u32,
    pub state: MapEntryState,
    /// Failure sequence, bumped when the checker marks the target down.
    pub fseq: u32,
    #[serde(skip)]
    pub checked: bool,
}

/// One rank-level domain with its targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapDomain {
    pub rank: Rank,
    pub state: MapEntryState,
    pub targets: Vec<MapTarget>,
    #[serde(skip)]
    pub checked: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolMap {
    pub version: u32,
    pub domains: Vec<MapDomain>,
}

impl PoolMap {
    pub fn find_domain(&mut self, rank: Rank) -> Option<&mut MapDomain> {
        self.domains.iter_mut().find(|dom| dom.rank == rank)
    }

    pub fn bump_version(&mut self) -> u32 {
        self.version += 1;
        self.version
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bump_version_is_monotonic() {
        let mut map = PoolMap {
            version: 4,
            domains: Vec::new(),
        };
        assert_eq!(map.bump_version(), 5);
        assert_eq!(map.bump_version(), 6);
    }
}
