//! Pending-decision records.
//!
//! Every interactive report parks its producer task on a pending record
//! keyed by report sequence. The operator's decision (or instance teardown)
//! removes the record from the table and wakes the producer, which then
//! observes either the chosen action or the exiting mark.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use scour_core::types::{InconsistClass, Rank, RepairAction};
use scour_core::{CheckError, Result};
use tokio::sync::Notify;
use uuid::Uuid;

#[derive(Debug)]
struct PendingState {
    action: RepairAction,
    busy: bool,
    exiting: bool,
}

#[derive(Debug)]
pub struct PendingRec {
    pub seq: u64,
    pub pool: Uuid,
    pub rank: Rank,
    pub class: InconsistClass,
    /// The producer blocks locally on the leader instead of a remote engine.
    on_leader: AtomicBool,
    state: Mutex<PendingState>,
    notify: Notify,
}

impl PendingRec {
    fn new(seq: u64, pool: Uuid, rank: Rank, class: InconsistClass) -> Self {
        Self {
            seq,
            pool,
            rank,
            class,
            on_leader: AtomicBool::new(false),
            state: Mutex::new(PendingState {
                action: RepairAction::Interact,
                busy: false,
                exiting: false,
            }),
            notify: Notify::new(),
        }
    }

    pub fn action(&self) -> RepairAction {
        self.state.lock().unwrap().action
    }

    pub fn on_leader(&self) -> bool {
        self.on_leader.load(Ordering::Acquire)
    }

    pub fn set_on_leader(&self) {
        self.on_leader.store(true, Ordering::Release);
    }

    pub fn is_interact(&self) -> bool {
        self.action() == RepairAction::Interact
    }

    pub fn mark_busy(&self) {
        self.state.lock().unwrap().busy = true;
    }

    /// Record the operator's decision and wake the producer.
    pub fn decide(&self, action: RepairAction) {
        self.state.lock().unwrap().action = action;
        self.notify.notify_one();
    }

    /// Tear the record down from under a (possibly) blocked producer.
    pub fn mark_exiting(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        state.exiting = true;
        self.notify.notify_one();
        state.busy
    }

    /// Block until a decision arrives or the record is torn down.
    ///
    /// Exit conditions are re-checked at every wake: a decision
    /// (`action != Interact`) wins over teardown; teardown or a stopped
    /// scheduler returns `Interrupted`.
    pub async fn wait(&self, sched_alive: impl Fn() -> bool) -> Result<RepairAction> {
        loop {
            let notified = self.notify.notified();
            {
                let state = self.state.lock().unwrap();
                if state.action != RepairAction::Interact {
                    return Ok(state.action);
                }
                if state.exiting || !sched_alive() {
                    return Err(CheckError::Interrupted);
                }
            }
            notified.await;
        }
    }
}

/// The instance-wide pending table, keyed by sequence. Mutations go through
/// the owning instance's writer lock; the table itself only enforces the
/// uniqueness invariant.
#[derive(Debug, Default)]
pub struct PendingTable {
    recs: BTreeMap<u64, Arc<PendingRec>>,
}

impl PendingTable {
    /// Insert a new record. A sequence collision yields `Again`; the caller
    /// regenerates the sequence and retries.
    pub fn add(
        &mut self,
        pool: Uuid,
        seq: u64,
        rank: Rank,
        class: InconsistClass,
    ) -> Result<Arc<PendingRec>> {
        if self.recs.contains_key(&seq) {
            tracing::warn!(
                seq,
                %pool,
                ?class,
                "interaction hit sequence conflict, need retry"
            );
            return Err(CheckError::Again);
        }
        let rec = Arc::new(PendingRec::new(seq, pool, rank, class));
        rec.mark_busy();
        self.recs.insert(seq, Arc::clone(&rec));
        Ok(rec)
    }

    /// Remove by sequence without signalling the producer.
    pub fn del(&mut self, seq: u64) -> Option<Arc<PendingRec>> {
        self.recs.remove(&seq)
    }

    /// Remove by sequence and wake the producer if one is parked.
    pub fn wakeup(&mut self, rec: &Arc<PendingRec>) {
        self.recs.remove(&rec.seq);
        rec.mark_exiting();
    }

    pub fn get(&self, seq: u64) -> Option<Arc<PendingRec>> {
        self.recs.get(&seq).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.recs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.recs.len()
    }

    /// Drain every record, waking all parked producers. Used on teardown.
    pub fn drain_all(&mut self) {
        let recs = std::mem::take(&mut self.recs);
        for rec in recs.values() {
            rec.mark_exiting();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn decision_unblocks_the_producer() {
        let mut table = PendingTable::default();
        let rec = table
            .add(Uuid::new_v4(), 11, 2, InconsistClass::PoolBadLabel)
            .unwrap();

        let waiter = {
            let rec = Arc::clone(&rec);
            tokio::spawn(async move { rec.wait(|| true).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        table.del(11).unwrap().decide(RepairAction::TrustPs);

        assert_eq!(waiter.await.unwrap(), Ok(RepairAction::TrustPs));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn decision_before_wait_is_not_lost() {
        let mut table = PendingTable::default();
        let rec = table
            .add(Uuid::new_v4(), 12, 2, InconsistClass::PoolBadLabel)
            .unwrap();
        rec.decide(RepairAction::Ignore);
        assert_eq!(rec.wait(|| true).await, Ok(RepairAction::Ignore));
    }

    #[tokio::test]
    async fn teardown_interrupts_the_producer() {
        let mut table = PendingTable::default();
        let rec = table
            .add(Uuid::new_v4(), 13, 0, InconsistClass::ContBadLabel)
            .unwrap();

        let waiter = {
            let rec = Arc::clone(&rec);
            tokio::spawn(async move { rec.wait(|| true).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        table.wakeup(&rec);

        assert_eq!(waiter.await.unwrap(), Err(CheckError::Interrupted));
    }

    #[tokio::test]
    async fn seq_collision_returns_again() {
        let mut table = PendingTable::default();
        table
            .add(Uuid::new_v4(), 14, 0, InconsistClass::Unknown)
            .unwrap();
        assert!(matches!(
            table.add(Uuid::new_v4(), 14, 1, InconsistClass::Unknown),
            Err(CheckError::Again)
        ));
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn dead_scheduler_interrupts() {
        let mut table = PendingTable::default();
        let rec = table
            .add(Uuid::new_v4(), 15, 0, InconsistClass::Unknown)
            .unwrap();
        assert_eq!(rec.wait(|| false).await, Err(CheckError::Interrupted));
    }
}
