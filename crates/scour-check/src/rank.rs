//! Rank records (leader only).
//!
//! The leader tracks every participating rank; a rank record owns the
//! pending decisions that originated on that rank so that a rank death can
//! wake all of its parked producers at once.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex as StdMutex};

use scour_core::types::{CheckPhase, Rank};

use crate::pending::PendingRec;

#[derive(Debug)]
pub struct RankRec {
    pub rank: Rank,
    pub phase: StdMutex<CheckPhase>,
    pending: StdMutex<Vec<Arc<PendingRec>>>,
}

impl RankRec {
    pub fn new(rank: Rank, phase: CheckPhase) -> Arc<Self> {
        Arc::new(Self {
            rank,
            phase: StdMutex::new(phase),
            pending: StdMutex::new(Vec::new()),
        })
    }

    pub fn set_phase(&self, phase: CheckPhase) {
        *self.phase.lock().unwrap() = phase;
    }

    pub fn add_pending(&self, rec: Arc<PendingRec>) {
        self.pending.lock().unwrap().push(rec);
    }

    pub fn remove_pending(&self, seq: u64) {
        self.pending.lock().unwrap().retain(|rec| rec.seq != seq);
    }

    pub fn drain_pending(&self) -> Vec<Arc<PendingRec>> {
        std::mem::take(&mut *self.pending.lock().unwrap())
    }
}

#[derive(Debug, Default)]
pub struct RankRegistry {
    ranks: BTreeMap<Rank, Arc<RankRec>>,
}

impl RankRegistry {
    pub fn insert(&mut self, rank: Rank, phase: CheckPhase) -> Arc<RankRec> {
        self.ranks
            .entry(rank)
            .or_insert_with(|| RankRec::new(rank, phase))
            .clone()
    }

    pub fn get(&self, rank: Rank) -> Option<Arc<RankRec>> {
        self.ranks.get(&rank).cloned()
    }

    pub fn remove(&mut self, rank: Rank) -> Option<Arc<RankRec>> {
        self.ranks.remove(&rank)
    }

    pub fn clear(&mut self) -> Vec<Arc<RankRec>> {
        let ranks = std::mem::take(&mut self.ranks);
        ranks.into_values().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.ranks.is_empty()
    }

    pub fn set_all_phases(&self, phase: CheckPhase) {
        for rec in self.ranks.values() {
            rec.set_phase(phase);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_is_idempotent() {
        let mut reg = RankRegistry::default();
        let a = reg.insert(3, CheckPhase::Prepare);
        let b = reg.insert(3, CheckPhase::PoolList);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(*a.phase.lock().unwrap(), CheckPhase::Prepare);
    }

    #[test]
    fn remove_returns_the_record_with_its_pending() {
        let mut reg = RankRegistry::default();
        let rec = reg.insert(5, CheckPhase::Prepare);
        let mut table = crate::pending::PendingTable::default();
        let pending = table
            .add(
                uuid::Uuid::new_v4(),
                77,
                5,
                scour_core::types::InconsistClass::Unknown,
            )
            .unwrap();
        rec.add_pending(pending);
        let gone = reg.remove(5).unwrap();
        assert_eq!(gone.drain_pending().len(), 1);
        assert!(reg.get(5).is_none());
    }
}
