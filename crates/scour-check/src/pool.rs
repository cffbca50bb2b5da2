//! Pool records.
//!
//! A pool record is created when the pool is first observed (Start-reply
//! aggregation on the leader, a POOL_START on an engine) and carries the
//! shards reported for it, its persisted bookmark, the mutable flag set the
//! schedulers steer by, and the worker task that drives the pool through
//! its phases. External events serialise against the worker through the
//! record's async mutex and wake it through the record's notifier.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use scour_core::bookmark::PoolBookmark;
use scour_core::clue::PoolClue;
use scour_core::rpc::PoolMember;
use scour_core::types::{CheckPhase, PoolStatus, Rank};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::pending::PendingRec;

/// One rank's view of the pool.
#[derive(Debug, Clone)]
pub struct PoolShard {
    pub rank: Rank,
    pub clue: Option<PoolClue>,
}

/// Cheaply checkable pool flags. Several may be set at once.
#[derive(Debug, Default)]
pub struct PoolFlags {
    /// Local pool service is up.
    pub started: AtomicBool,
    /// Full (exported) pool service is up.
    pub start_post: AtomicBool,
    /// The pool is being torn down; the worker must bail out.
    pub stop: AtomicBool,
    pub done: AtomicBool,
    /// Subsequent phases skip this pool.
    pub skip: AtomicBool,
    /// Known to MS, no shard reported by any engine.
    pub dangling: AtomicBool,
    /// Placeholder created for orphan-pool processing only.
    pub for_orphan: AtomicBool,
    pub exist_on_ms: AtomicBool,
    /// Keep the pool service private after the check finishes.
    pub not_export_ps: AtomicBool,
    pub map_refreshed: AtomicBool,
    /// Label repair deferred to the container-cleanup phase.
    pub delay_label: AtomicBool,
    pub destroyed: AtomicBool,
    /// The pool service has quorum.
    pub healthy: AtomicBool,
    /// Final state already published to the peers.
    pub notified_exit: AtomicBool,
}

macro_rules! flag_accessors {
    ($($name:ident, $setter:ident);* $(;)?) => {
        $(
            pub fn $name(&self) -> bool {
                self.flags.$name.load(Ordering::Acquire)
            }

            pub fn $setter(&self, value: bool) {
                self.flags.$name.store(value, Ordering::Release);
            }
        )*
    };
}

/// Mutable pool state guarded by the record's mutex.
#[derive(Debug, Default)]
pub struct PoolMut {
    pub shards: Vec<PoolShard>,
    /// Clue vector built by the leader at PREPARE, advice index into it.
    pub clues: Vec<PoolClue>,
    pub advice: Option<usize>,
    /// MS label and its sequence.
    pub label: Option<String>,
    pub label_seq: u64,
    /// Membership table delivered by POOL_MBS (engine side).
    pub members: Vec<PoolMember>,
}

pub struct PoolRec {
    pub uuid: Uuid,
    flags: PoolFlags,
    pub bk: Mutex<PoolBookmark>,
    pub state: Mutex<PoolMut>,
    /// Pool-local pending decisions.
    pub pending: StdMutex<Vec<Arc<PendingRec>>>,
    worker: StdMutex<Option<JoinHandle<()>>>,
    pub notify: Notify,
}

impl std::fmt::Debug for PoolRec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolRec").field("uuid", &self.uuid).finish()
    }
}

impl PoolRec {
    pub fn new(uuid: Uuid, bk: PoolBookmark) -> Arc<Self> {
        Arc::new(Self {
            uuid,
            flags: PoolFlags::default(),
            bk: Mutex::new(bk),
            state: Mutex::new(PoolMut::default()),
            pending: StdMutex::new(Vec::new()),
            worker: StdMutex::new(None),
            notify: Notify::new(),
        })
    }

    flag_accessors! {
        started, set_started;
        start_post, set_start_post;
        stop, set_stop;
        done, set_done;
        skip, set_skip;
        dangling, set_dangling;
        for_orphan, set_for_orphan;
        exist_on_ms, set_exist_on_ms;
        not_export_ps, set_not_export_ps;
        map_refreshed, set_map_refreshed;
        delay_label, set_delay_label;
        destroyed, set_destroyed;
        healthy, set_healthy;
        notified_exit, set_notified_exit;
    }

    pub fn attach_worker(&self, handle: JoinHandle<()>) {
        let prev = self.worker.lock().unwrap().replace(handle);
        debug_assert!(prev.is_none(), "pool worker attached twice");
    }

    pub fn take_worker(&self) -> Option<JoinHandle<()>> {
        self.worker.lock().unwrap().take()
    }

    pub fn has_worker(&self) -> bool {
        self.worker.lock().unwrap().is_some()
    }

    pub fn add_pending(&self, rec: Arc<PendingRec>) {
        self.pending.lock().unwrap().push(rec);
    }

    pub fn remove_pending(&self, seq: u64) {
        self.pending.lock().unwrap().retain(|rec| rec.seq != seq);
    }

    pub fn pending_snapshot(&self) -> Vec<Arc<PendingRec>> {
        self.pending.lock().unwrap().clone()
    }

    pub fn pending_is_empty(&self) -> bool {
        self.pending.lock().unwrap().is_empty()
    }

    /// Does any shard sit in a zombie directory?
    pub async fn in_zombie(&self) -> bool {
        let state = self.state.lock().await;
        state
            .shards
            .iter()
            .any(|shard| matches!(&shard.clue, Some(clue) if clue.dir == scour_core::clue::PoolDir::Zombie))
    }

    pub async fn shard_ranks(&self) -> Vec<Rank> {
        let state = self.state.lock().await;
        state.shards.iter().map(|shard| shard.rank).collect()
    }

    pub async fn phase(&self) -> CheckPhase {
        self.bk.lock().await.phase
    }

    pub async fn status(&self) -> PoolStatus {
        self.bk.lock().await.status
    }
}

/// The pool tree of one instance, keyed by uuid.
#[derive(Debug, Default)]
pub struct PoolRegistry {
    pools: BTreeMap<Uuid, Arc<PoolRec>>,
}

impl PoolRegistry {
    /// Upsert a shard. A fresh record is created on first sight; an
    /// existing record just gains the shard. Callers that only want the
    /// record (no local view to contribute) pass no clue.
    pub async fn add_shard(
        &mut self,
        uuid: Uuid,
        rank: Rank,
        bk: Option<PoolBookmark>,
        clue: Option<PoolClue>,
    ) -> Arc<PoolRec> {
        let rec = self
            .pools
            .entry(uuid)
            .or_insert_with(|| PoolRec::new(uuid, bk.unwrap_or_else(|| PoolBookmark::new(0))))
            .clone();
        if clue.is_some() {
            let mut state = rec.state.lock().await;
            if let Some(shard) = state.shards.iter_mut().find(|shard| shard.rank == rank) {
                shard.clue = clue;
            } else {
                state.shards.push(PoolShard { rank, clue });
            }
        }
        rec
    }

    pub fn get(&self, uuid: &Uuid) -> Option<Arc<PoolRec>> {
        self.pools.get(uuid).cloned()
    }

    pub fn remove(&mut self, uuid: &Uuid) -> Option<Arc<PoolRec>> {
        self.pools.remove(uuid)
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn snapshot(&self) -> Vec<Arc<PoolRec>> {
        self.pools.values().cloned().collect()
    }

    pub fn uuids(&self) -> Vec<Uuid> {
        self.pools.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scour_core::clue::PoolDir;

    fn clue(pool: Uuid, rank: Rank, dir: PoolDir) -> PoolClue {
        PoolClue {
            pool,
            rank,
            dir,
            phase: Some(CheckPhase::Prepare),
            label: None,
            label_seq: 0,
            svc: None,
            svc_busy: false,
            targets: Vec::new(),
        }
    }

    #[tokio::test]
    async fn add_shard_upserts() {
        let mut registry = PoolRegistry::default();
        let uuid = Uuid::new_v4();
        let rec = registry
            .add_shard(uuid, 1, None, Some(clue(uuid, 1, PoolDir::Normal)))
            .await;
        registry
            .add_shard(uuid, 2, None, Some(clue(uuid, 2, PoolDir::Normal)))
            .await;
        assert_eq!(registry.len(), 1);
        assert_eq!(rec.shard_ranks().await, vec![1, 2]);
    }

    #[tokio::test]
    async fn zombie_shard_is_visible() {
        let mut registry = PoolRegistry::default();
        let uuid = Uuid::new_v4();
        let rec = registry
            .add_shard(uuid, 1, None, Some(clue(uuid, 1, PoolDir::Zombie)))
            .await;
        assert!(rec.in_zombie().await);
    }

    #[tokio::test]
    async fn flags_are_independent() {
        let rec = PoolRec::new(Uuid::new_v4(), PoolBookmark::new(1));
        rec.set_skip(true);
        rec.set_healthy(true);
        assert!(rec.skip());
        assert!(rec.healthy());
        assert!(!rec.done());
        rec.set_skip(false);
        assert!(!rec.skip());
        assert!(rec.healthy());
    }
}
