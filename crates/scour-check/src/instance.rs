//! The per-role instance skeleton shared by leader and engine.
//!
//! Owns the pool tree, the pending table, the (leader-only) rank tree, the
//! dead-rank queue, the shutdown list, the persisted bookmark and property,
//! the report-sequence generator, and the lifecycle booleans. The leader and
//! engine schedulers are built on top of this.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::Utc;
use scour_core::bookmark::InstanceBookmark;
use scour_core::iv::IvMessage;
use scour_core::policy::Property;
use scour_core::types::{
    CheckPhase, InstanceStatus, PoolStatus, Rank, StartDisposition,
};
use scour_core::{CheckError, Result};
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::pending::PendingTable;
use crate::pool::{PoolRec, PoolRegistry};
use crate::rank::RankRegistry;
use crate::seq::SeqGen;
use crate::store::CheckStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Leader,
    Engine,
}

/// Lifecycle booleans. Every one of these is observed at suspension points,
/// so they are plain atomics rather than guarded state.
#[derive(Debug, Default)]
pub struct InstanceFlags {
    pub inited: AtomicBool,
    pub starting: AtomicBool,
    pub stopping: AtomicBool,
    pub started: AtomicBool,
    pub sched_running: AtomicBool,
    pub sched_exiting: AtomicBool,
    pub pause: AtomicBool,
    pub rejoining: AtomicBool,
    pub implicated: AtomicBool,
    /// Orphan-pool processing finished (published by the leader).
    pub orphan_done: AtomicBool,
    /// Some pool was explicitly stopped during this instance.
    pub pool_stopped: AtomicBool,
    /// The instance only exists to process orphan pools.
    pub for_orphan: AtomicBool,
}

macro_rules! instance_flags {
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

/// What the scheduler concluded from one sweep over the pool tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepProgress {
    /// Some pool was explicitly stopped; the scheduler exits as stopped.
    Stopped,
    /// Nothing active locally, but the leader has not announced the end of
    /// orphan processing; more pools may still arrive.
    AwaitOrphans,
    /// Every pool is done.
    Done,
    /// Pools still running; the slowest sits at this phase.
    Running(CheckPhase),
}

pub struct Instance {
    pub role: Role,
    pub rank: Rank,
    pub store: CheckStore,

    pub bk: Mutex<InstanceBookmark>,
    pub prop: Mutex<Property>,
    pub ranks: Mutex<Vec<Rank>>,

    pub pools: RwLock<PoolRegistry>,
    /// Protected together with the rank tree by this lock; every mutator
    /// takes the writer side.
    pub pending: RwLock<PendingTable>,
    pub rank_recs: RwLock<RankRegistry>,

    pub dead_ranks: StdMutex<VecDeque<Rank>>,
    pub shutdown_pools: StdMutex<Vec<Arc<PoolRec>>>,

    pub seq: StdMutex<SeqGen>,
    pub slowest_fail_phase: StdMutex<Option<CheckPhase>>,
    pub disposition: StdMutex<StartDisposition>,

    pub flags: InstanceFlags,
    /// Start handshake and scheduler wakeups.
    pub notify: Notify,
    sched: StdMutex<Option<JoinHandle<()>>>,
}

impl Instance {
    pub fn new(role: Role, rank: Rank, store: CheckStore, bk: InstanceBookmark) -> Arc<Self> {
        let seq_rank = match role {
            Role::Leader => scour_core::LEADER_RANK,
            Role::Engine => rank,
        };
        Arc::new(Self {
            role,
            rank,
            store,
            bk: Mutex::new(bk),
            prop: Mutex::new(Property::new(rank)),
            ranks: Mutex::new(Vec::new()),
            pools: RwLock::new(PoolRegistry::default()),
            pending: RwLock::new(PendingTable::default()),
            rank_recs: RwLock::new(RankRegistry::default()),
            dead_ranks: StdMutex::new(VecDeque::new()),
            shutdown_pools: StdMutex::new(Vec::new()),
            seq: StdMutex::new(SeqGen::new(seq_rank)),
            slowest_fail_phase: StdMutex::new(None),
            disposition: StdMutex::new(StartDisposition::default()),
            flags: InstanceFlags::default(),
            notify: Notify::new(),
            sched: StdMutex::new(None),
        })
    }

    instance_flags! {
        inited, set_inited;
        starting, set_starting;
        stopping, set_stopping;
        started, set_started;
        sched_running, set_sched_running;
        sched_exiting, set_sched_exiting;
        pause, set_pause;
        rejoining, set_rejoining;
        implicated, set_implicated;
        orphan_done, set_orphan_done;
        pool_stopped, set_pool_stopped;
        for_orphan, set_for_orphan;
    }

    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }

    /// A producer may stay parked only while this holds.
    pub fn sched_alive(&self) -> bool {
        self.sched_running() && !self.sched_exiting()
    }

    /// Gate for `start`: busy while another start is in flight, in-progress
    /// while a stop or teardown is draining, already when a scheduler runs.
    pub fn can_start(&self) -> Result<()> {
        if !self.inited() {
            return Err(CheckError::Again);
        }
        if self.starting() {
            return Err(CheckError::Busy);
        }
        if self.stopping() || self.sched_exiting() {
            return Err(CheckError::InProgress);
        }
        if self.sched_running() {
            return Err(CheckError::Already);
        }
        Ok(())
    }

    /// New instance generation, derived from a high-resolution clock so it
    /// is monotonic across restarts.
    pub fn generate_gen() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(1)
    }

    pub fn next_seq(&self) -> u64 {
        self.seq.lock().unwrap().next()
    }

    pub fn reset_seq(&self) {
        let rank = match self.role {
            Role::Leader => scour_core::LEADER_RANK,
            Role::Engine => self.rank,
        };
        *self.seq.lock().unwrap() = SeqGen::new(rank);
    }

    /// Record a failed pool's phase; keeps the slowest (earliest) one.
    pub fn set_fail_phase(&self, phase: CheckPhase) {
        let mut slot = self.slowest_fail_phase.lock().unwrap();
        match *slot {
            Some(cur) if cur <= phase => {}
            _ => *slot = Some(phase),
        }
    }

    pub fn fail_phase(&self) -> Option<CheckPhase> {
        *self.slowest_fail_phase.lock().unwrap()
    }

    pub fn attach_sched(&self, handle: JoinHandle<()>) {
        *self.sched.lock().unwrap() = Some(handle);
    }

    pub fn take_sched(&self) -> Option<JoinHandle<()>> {
        self.sched.lock().unwrap().take()
    }

    pub async fn gen(&self) -> u64 {
        self.bk.lock().await.gen
    }

    /// One sweep over the pool tree: compute the slowest phase and whether
    /// the instance can finish. The "no pools, orphans pending" situation is
    /// an explicit state here, not a late-set boolean.
    pub async fn sweep(&self) -> SweepProgress {
        if self.pool_stopped() {
            return SweepProgress::Stopped;
        }

        let pools = self.pools.read().await.snapshot();
        let mut slowest: Option<CheckPhase> = None;
        for pool in pools {
            if pool.done() || pool.stop() {
                continue;
            }
            let phase = pool.phase().await;
            slowest = Some(match slowest {
                Some(cur) if cur <= phase => cur,
                _ => phase,
            });
        }

        match slowest {
            Some(phase) => SweepProgress::Running(phase),
            None if self.role == Role::Engine && !self.orphan_done() => {
                SweepProgress::AwaitOrphans
            }
            None => SweepProgress::Done,
        }
    }

    /// Stop one pool: unlink it from the tree first (so the worker exits),
    /// wake its pending producers, join the worker, then update the
    /// bookmark if the pool was still in flight. Returns the removed record
    /// for the role-specific tail (engine-side PS shutdown).
    pub async fn pool_stop_one(
        &self,
        uuid: Uuid,
        status: PoolStatus,
        phase: Option<CheckPhase>,
    ) -> Result<Option<Arc<PoolRec>>> {
        let removed = self.pools.write().await.remove(&uuid);
        let Some(pool) = removed else {
            return Ok(None);
        };

        pool.set_stop(true);
        pool.notify.notify_waiters();

        {
            let mut pending = self.pending.write().await;
            for rec in pool.pending_snapshot() {
                pending.wakeup(&rec);
            }
            pool.pending.lock().unwrap().clear();
        }

        if let Some(worker) = pool.take_worker() {
            let _ = worker.await;
        }

        {
            let mut bk = pool.bk.lock().await;
            if matches!(bk.status, PoolStatus::Checking | PoolStatus::Pending) {
                if let Some(phase) = phase {
                    bk.advance(phase);
                }
                bk.mark_stopped(status);
                if status == PoolStatus::Stopped {
                    self.set_pool_stopped(true);
                }
                self.store.update_pool(uuid, &bk).await?;
            }
        }

        Ok(Some(pool))
    }

    /// Stop every pool; the per-pool records are returned for the caller's
    /// role-specific teardown.
    pub async fn pool_stop_all(&self, status: PoolStatus) -> Result<Vec<Arc<PoolRec>>> {
        let uuids = self.pools.read().await.uuids();
        let mut stopped = Vec::with_capacity(uuids.len());
        for uuid in uuids {
            if let Some(pool) = self.pool_stop_one(uuid, status, None).await? {
                stopped.push(pool);
            }
        }
        Ok(stopped)
    }

    /// Pause path of the store traversal: flip every still-running pool
    /// bookmark of this generation to PAUSED. A bookmark that vanished
    /// underneath us is fine; pause races with pool destruction and must
    /// stay idempotent.
    pub async fn pause_all_pools(&self, gen: u64) -> Result<()> {
        for uuid in self.store.pool_keys().await? {
            let bk = match self.store.fetch_pool(uuid).await {
                Ok(Some(bk)) => bk,
                Ok(None) | Err(CheckError::NotFound(_)) => continue,
                Err(err) => return Err(err),
            };
            if bk.gen != gen
                || !matches!(bk.status, PoolStatus::Checking | PoolStatus::Pending)
            {
                continue;
            }
            let mut bk = bk;
            bk.mark_stopped(PoolStatus::Paused);
            match self.store.update_pool(uuid, &bk).await {
                Ok(()) | Err(CheckError::NotFound(_)) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Cleanup path of the store traversal: delete every pool bookmark.
    /// Unlike pause this does not mask missing keys.
    pub async fn cleanup_all_pools(&self) -> Result<()> {
        for uuid in self.store.pool_keys().await? {
            if self.store.fetch_pool(uuid).await?.is_some() {
                self.store.delete_pool(uuid).await?;
            }
        }
        Ok(())
    }

    /// Raise every in-flight pool bookmark to `phase`.
    pub async fn update_pools_bk(&self, phase: CheckPhase) -> Result<()> {
        let pools = self.pools.read().await.snapshot();
        let mut ret = Ok(());
        for pool in pools {
            let mut bk = pool.bk.lock().await;
            if bk.phase < phase && bk.status == PoolStatus::Checking {
                bk.advance(phase);
                if let Err(err) = self.store.update_pool(pool.uuid, &bk).await {
                    ret = Err(err);
                }
            }
        }
        ret
    }

    /// Apply a per-pool IV notification to the local record. Returns the
    /// record when the notification marked it finished, so the caller can
    /// run its role-specific tail (restart or shutdown of the local PS).
    pub async fn pool_handle_notify(&self, iv: &IvMessage) -> Result<Option<Arc<PoolRec>>> {
        let Some(uuid) = iv.pool else {
            return Err(CheckError::NotApplicable);
        };
        let Some(status) = iv.pool_status else {
            return Err(CheckError::NotApplicable);
        };
        let Some(pool) = self.pools.read().await.get(&uuid) else {
            return Err(CheckError::NotApplicable);
        };

        if pool.stop() {
            return Err(CheckError::NotApplicable);
        }
        if pool.done() {
            return Ok(None);
        }

        {
            let mut bk = pool.bk.lock().await;
            if iv.phase < bk.phase {
                return Err(CheckError::NotApplicable);
            }

            match status {
                PoolStatus::Checked => pool.set_done(true),
                PoolStatus::Failed | PoolStatus::Implicated => {
                    pool.set_skip(true);
                    if !pool.has_worker() {
                        pool.set_done(true);
                    }
                }
                PoolStatus::Checking => {}
                _ => return Err(CheckError::NotApplicable),
            }

            if iv.phase != bk.phase || status != bk.status {
                bk.advance(iv.phase);
                bk.status = status;
                if status != PoolStatus::Checking {
                    bk.time.stop_time = Utc::now().timestamp();
                }
                self.store.update_pool(uuid, &bk).await?;
            }
        }

        Ok(pool.done().then_some(pool))
    }

    /// Queue a finished pool for the scheduler's shutdown drain.
    pub fn queue_shutdown(&self, pool: Arc<PoolRec>) {
        self.shutdown_pools.lock().unwrap().push(pool);
    }

    pub fn drain_shutdown(&self) -> Vec<Arc<PoolRec>> {
        std::mem::take(&mut *self.shutdown_pools.lock().unwrap())
    }

    /// Tear down the trees at instance exit; every parked producer wakes.
    pub async fn destroy_trees(&self) {
        self.pending.write().await.drain_all();
        let pools = {
            let mut pools = self.pools.write().await;
            let snapshot = pools.snapshot();
            for pool in &snapshot {
                pools.remove(&pool.uuid);
            }
            snapshot
        };
        for pool in pools {
            pool.set_stop(true);
            pool.notify.notify_waiters();
            if let Some(worker) = pool.take_worker() {
                let _ = worker.await;
            }
        }
        self.rank_recs.write().await.clear();
    }
}

/// Merge two pool statuses for query aggregation; the "most alive" wins.
pub fn merge_pool_status(a: PoolStatus, b: PoolStatus) -> PoolStatus {
    const ORDER: [PoolStatus; 8] = [
        PoolStatus::Pending,
        PoolStatus::Checking,
        PoolStatus::Failed,
        PoolStatus::Stopped,
        PoolStatus::Implicated,
        PoolStatus::Checked,
        PoolStatus::Paused,
        PoolStatus::Unchecked,
    ];
    for status in ORDER {
        if a == status || b == status {
            return status;
        }
    }
    PoolStatus::Unchecked
}

/// Accumulating view of the instance status across engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergedInfo {
    pub gen: u64,
    pub status: InstanceStatus,
    pub phase: CheckPhase,
}

/// Fold `src` into `dst` for query aggregation. The newest generation wins
/// unless an older one is still RUNNING; at equal generation the phase is
/// the minimum and statuses merge by liveness priority, with the phase
/// forced to `Done` alongside a COMPLETED status.
pub fn merge_ins_info(dst: &mut MergedInfo, src: MergedInfo) {
    use InstanceStatus as S;

    if dst.gen < src.gen {
        if dst.status == S::Running {
            return;
        }
        *dst = src;
        return;
    }
    if dst.gen > src.gen {
        if src.status == S::Running {
            *dst = src;
        }
        return;
    }

    if dst.phase > src.phase {
        dst.phase = src.phase;
    }

    const ORDER: [InstanceStatus; 6] = [
        S::Running,
        S::Failed,
        S::Stopped,
        S::Implicated,
        S::Completed,
        S::Paused,
    ];
    for status in ORDER {
        if dst.status == status {
            if status == S::Completed {
                dst.phase = CheckPhase::Done;
            }
            return;
        }
        if src.status == status {
            dst.status = status;
            if status == S::Completed {
                dst.phase = CheckPhase::Done;
            }
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scour_core::bookmark::BK_MAGIC_ENGINE;

    fn merged(gen: u64, status: InstanceStatus, phase: CheckPhase) -> MergedInfo {
        MergedInfo { gen, status, phase }
    }

    #[test]
    fn newer_gen_wins_unless_old_is_running() {
        let mut dst = merged(1, InstanceStatus::Paused, CheckPhase::PoolMbs);
        merge_ins_info(
            &mut dst,
            merged(2, InstanceStatus::Completed, CheckPhase::Done),
        );
        assert_eq!(dst.gen, 2);
        assert_eq!(dst.status, InstanceStatus::Completed);

        let mut running = merged(1, InstanceStatus::Running, CheckPhase::PoolList);
        merge_ins_info(
            &mut running,
            merged(2, InstanceStatus::Completed, CheckPhase::Done),
        );
        assert_eq!(running.gen, 1);
        assert_eq!(running.status, InstanceStatus::Running);
    }

    #[test]
    fn equal_gen_takes_min_phase_and_liveness_priority() {
        let mut dst = merged(3, InstanceStatus::Paused, CheckPhase::ContList);
        merge_ins_info(
            &mut dst,
            merged(3, InstanceStatus::Running, CheckPhase::PoolMbs),
        );
        assert_eq!(dst.status, InstanceStatus::Running);
        assert_eq!(dst.phase, CheckPhase::PoolMbs);
    }

    #[test]
    fn completed_forces_done_phase() {
        let mut dst = merged(3, InstanceStatus::Completed, CheckPhase::ContCleanup);
        merge_ins_info(
            &mut dst,
            merged(3, InstanceStatus::Paused, CheckPhase::PoolList),
        );
        assert_eq!(dst.phase, CheckPhase::Done);
    }

    #[test]
    fn pool_status_merge_prefers_pending() {
        assert_eq!(
            merge_pool_status(PoolStatus::Checked, PoolStatus::Pending),
            PoolStatus::Pending
        );
        assert_eq!(
            merge_pool_status(PoolStatus::Paused, PoolStatus::Checking),
            PoolStatus::Checking
        );
        assert_eq!(
            merge_pool_status(PoolStatus::Unchecked, PoolStatus::Unchecked),
            PoolStatus::Unchecked
        );
    }

    #[test]
    fn can_start_gates() {
        let store = CheckStore::new(Arc::new(crate::testutil::MemSysDb::default()));
        let bk = InstanceBookmark::new(BK_MAGIC_ENGINE, 1, Uuid::nil());
        let ins = Instance::new(Role::Engine, 0, store, bk);
        assert_eq!(ins.can_start(), Err(CheckError::Again));
        ins.set_inited(true);
        assert!(ins.can_start().is_ok());
        ins.set_starting(true);
        assert_eq!(ins.can_start(), Err(CheckError::Busy));
        ins.set_starting(false);
        ins.set_stopping(true);
        assert_eq!(ins.can_start(), Err(CheckError::InProgress));
        ins.set_stopping(false);
        ins.set_sched_running(true);
        assert_eq!(ins.can_start(), Err(CheckError::Already));
    }

    #[test]
    fn fail_phase_keeps_the_earliest() {
        let store = CheckStore::new(Arc::new(crate::testutil::MemSysDb::default()));
        let bk = InstanceBookmark::new(BK_MAGIC_ENGINE, 1, Uuid::nil());
        let ins = Instance::new(Role::Engine, 0, store, bk);
        ins.set_fail_phase(CheckPhase::ContList);
        ins.set_fail_phase(CheckPhase::PoolList);
        ins.set_fail_phase(CheckPhase::ContCleanup);
        assert_eq!(ins.fail_phase(), Some(CheckPhase::PoolList));
    }
}
