//! The check leader.
//!
//! One leader per cluster. It globally orders the check instance, compares
//! the union of engine-reported pool shards against the MS pool list,
//! classifies MS-scope inconsistencies (orphan pools, dangling pools, lost
//! PS quorum, bad pool labels), interacts with the operator through the
//! report/act protocol, and aggregates per-engine progress over the IV bus.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use scour_core::bookmark::{InstanceBookmark, BK_MAGIC_LEADER};
use scour_core::clue::{evaluate_clues, PoolClue};
use scour_core::iv::{IvMessage, IvSync};
use scour_core::policy::PolicyEntry;
use scour_core::ports::{
    CheckHandler, ClusterTransport, MgmtStore, ReportSink, SysDb,
};
use scour_core::report::ReportUnit;
use scour_core::rpc::{
    CheckReply, CheckRequest, MarkIn, PoolMbsIn, PoolMember, PoolShardInfo, PoolStartFlags,
    PoolStartIn, RejoinOut, StartIn,
};
use scour_core::types::{
    CheckPhase, InconsistClass, InstanceStatus, PoolStatus, PropertyFlags, Rank, RepairAction,
    StartDisposition, StartFlags, SvcStartMode,
};
use scour_core::{CheckError, Result};
use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::instance::{merge_pool_status, Instance, MergedInfo, Role, SweepProgress};
use crate::pool::PoolRec;
use crate::rpc;
use crate::store::CheckStore;
use crate::upcall::report_upcall;
use crate::iv::IvPublisher;

const SCHED_TICK: Duration = Duration::from_millis(300);

/// Operator start request.
#[derive(Debug, Clone, Default)]
pub struct StartRequest {
    pub ranks: Vec<Rank>,
    pub policies: Vec<PolicyEntry>,
    pub pools: Vec<Uuid>,
    pub flags: StartFlags,
    pub phase_limit: Option<CheckPhase>,
}

/// Operator query result.
#[derive(Debug, Clone)]
pub struct QueryResult {
    pub gen: u64,
    pub status: InstanceStatus,
    pub phase: CheckPhase,
    pub shards: Vec<PoolShardInfo>,
}

impl QueryResult {
    /// Collapse the per-rank shard entries into one status per pool.
    pub fn pool_summary(&self) -> Vec<(Uuid, PoolStatus)> {
        let mut merged: BTreeMap<Uuid, PoolStatus> = BTreeMap::new();
        for shard in &self.shards {
            merged
                .entry(shard.pool)
                .and_modify(|cur| *cur = merge_pool_status(*cur, shard.status))
                .or_insert(shard.status);
        }
        merged.into_iter().collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Repaired,
    Ignored,
    Failed,
}

pub struct CheckLeader {
    ins: Arc<Instance>,
    transport: Arc<dyn ClusterTransport>,
    mgmt: Arc<dyn MgmtStore>,
    sink: Arc<dyn ReportSink>,
    iv: IvPublisher,
    /// Ranks evicted from the current instance, for the group version.
    evictions: AtomicU32,
    /// Serialises operator start/stop against each other.
    lifecycle: Mutex<()>,
}

impl CheckLeader {
    /// Build the leader role for this rank. A bookmark left RUNNING by a
    /// crashed process is rewritten to PAUSED before anything else.
    pub async fn new(
        rank: Rank,
        db: Arc<dyn SysDb>,
        transport: Arc<dyn ClusterTransport>,
        mgmt: Arc<dyn MgmtStore>,
        sink: Arc<dyn ReportSink>,
    ) -> Result<Arc<Self>> {
        let store = CheckStore::new(db);
        let mut bk = match store.fetch_leader().await? {
            Some(bk) => {
                if bk.magic != BK_MAGIC_LEADER {
                    return Err(CheckError::Io(format!(
                        "leader bookmark magic mismatch: {:#x}",
                        bk.magic
                    )));
                }
                bk
            }
            None => InstanceBookmark::new(BK_MAGIC_LEADER, 0, Uuid::nil()),
        };
        if bk.status == InstanceStatus::Running {
            bk.mark_stopped(InstanceStatus::Paused);
            store.update_leader(&bk).await?;
            tracing::info!(gen = bk.gen, "leader bookmark found RUNNING at boot, paused");
        }

        let ins = Instance::new(Role::Leader, rank, store.clone(), bk);
        if let Some((prop, ranks)) = match ins.store.fetch_property().await {
            Ok(found) => found,
            Err(CheckError::Io(msg)) => return Err(CheckError::Io(msg)),
            Err(_) => None,
        } {
            *ins.prop.lock().await = prop;
            *ins.ranks.lock().await = ranks;
        }
        ins.set_inited(true);

        Ok(Arc::new(Self {
            iv: IvPublisher::new(Arc::clone(&transport), rank),
            ins,
            transport,
            mgmt,
            sink,
            evictions: AtomicU32::new(0),
            lifecycle: Mutex::new(()),
        }))
    }

    pub fn instance(&self) -> &Arc<Instance> {
        &self.ins
    }

    async fn tally(&self, pool: Option<&Arc<PoolRec>>, outcome: Outcome) {
        if let Some(pool) = pool {
            let mut bk = pool.bk.lock().await;
            match outcome {
                Outcome::Repaired => bk.statistics.repaired += 1,
                Outcome::Ignored => bk.statistics.ignored += 1,
                Outcome::Failed => bk.statistics.failed += 1,
            }
        }
        let mut bk = self.ins.bk.lock().await;
        match outcome {
            Outcome::Repaired => bk.statistics.repaired += 1,
            Outcome::Ignored => bk.statistics.ignored += 1,
            Outcome::Failed => bk.statistics.failed += 1,
        }
    }

    async fn tally_total(&self, pool: Option<&Arc<PoolRec>>) {
        if let Some(pool) = pool {
            pool.bk.lock().await.statistics.total += 1;
        }
        self.ins.bk.lock().await.statistics.total += 1;
    }

    // ── operator surface ──────────────────────────────────────────

    pub async fn start(self: &Arc<Self>, req: StartRequest) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        self.ins.can_start()?;
        self.ins.set_starting(true);
        let result = self.start_inner(req).await;
        self.ins.set_starting(false);
        result
    }

    async fn start_inner(self: &Arc<Self>, req: StartRequest) -> Result<()> {
        let ins = &self.ins;
        ins.set_started(false);
        ins.set_stopping(false);
        ins.set_sched_exiting(false);
        ins.set_pause(false);
        ins.set_orphan_done(false);
        ins.set_implicated(false);
        ins.set_pool_stopped(false);
        ins.set_for_orphan(false);
        *ins.slowest_fail_phase.lock().unwrap() = None;
        self.evictions.store(0, Ordering::Release);
        if let Some(old) = ins.take_sched() {
            old.abort();
        }

        let gen = Instance::generate_gen();
        let iv_uuid = Uuid::new_v4();

        let persisted = match ins.store.fetch_property().await {
            Ok(found) => found,
            Err(CheckError::Io(msg)) => return Err(CheckError::Io(msg)),
            Err(err) => return Err(err),
        };

        let mut ranks = if req.ranks.is_empty() {
            persisted
                .as_ref()
                .map(|(_, ranks)| ranks.clone())
                .filter(|ranks| !ranks.is_empty())
                .ok_or_else(|| CheckError::Invalid("no ranks given and none persisted".into()))?
        } else {
            req.ranks.clone()
        };
        ranks.sort_unstable();
        ranks.dedup();
        if !ranks.contains(&ins.rank) {
            return Err(CheckError::Invalid(
                "the leader rank must take part in the check".into(),
            ));
        }

        // No former property means the system was never checked: that is a
        // from-scratch start, as is a materially changed ranks list.
        let first_start = persisted.is_none();
        let ranks_changed = persisted
            .as_ref()
            .map(|(_, old)| old != &ranks)
            .unwrap_or(false);
        let prev_dryrun = persisted
            .as_ref()
            .map(|(prop, _)| prop.flags.dryrun)
            .unwrap_or(false);

        let from_scratch = req.flags.reset || ranks_changed || first_start;
        let disposition = StartDisposition {
            reset_all: from_scratch,
            reset_noncomp: prev_dryrun,
            orphan_pool: req.flags.orphan_pool || (req.pools.is_empty() && from_scratch),
        };
        *ins.disposition.lock().unwrap() = disposition;

        {
            let mut prop = ins.prop.lock().await;
            prop.prepare(
                ins.rank,
                req.flags,
                req.phase_limit,
                &req.policies,
                ranks.len() as u32,
            )?;
            ins.store.update_property(&prop, &ranks).await?;
        }
        *ins.ranks.lock().await = ranks.clone();

        let min_phase = if disposition.reset_all {
            ins.cleanup_all_pools().await?;
            CheckPhase::Prepare
        } else if !req.pools.is_empty() {
            self.load_pool_list(gen, &req.pools, req.flags.reset).await?
        } else {
            self.load_pools_from_store(gen, disposition.reset_noncomp)
                .await?
        };

        {
            let mut bk = ins.bk.lock().await;
            bk.gen = gen;
            bk.iv_uuid = iv_uuid;
            bk.phase = if min_phase == CheckPhase::Done {
                CheckPhase::Prepare
            } else {
                min_phase
            };
            bk.status = InstanceStatus::Init;
            if req.flags.reset {
                bk.statistics = Default::default();
                bk.time = Default::default();
            }
        }
        ins.reset_seq();

        self.transport
            .update_group(&ranks, (gen as u32).wrapping_sub(ranks.len() as u32 + 1))
            .await?;

        let start_in = StartIn {
            gen,
            flags: req.flags,
            reset_all: disposition.reset_all,
            reset_noncomp: disposition.reset_noncomp,
            orphan_pool: disposition.orphan_pool,
            phase_limit: req.phase_limit,
            leader: ins.rank,
            ranks: ranks.clone(),
            policies: req.policies.clone(),
            pools: req.pools.clone(),
            iv_uuid,
        };
        let agg = match rpc::start_remote(self.transport.as_ref(), &ranks, start_in).await {
            Ok(agg) => agg,
            Err(err) => {
                let _ =
                    rpc::stop_remote(self.transport.as_ref(), &ranks, gen, Vec::new()).await;
                let mut bk = ins.bk.lock().await;
                bk.mark_stopped(InstanceStatus::Failed);
                let _ = ins.store.update_leader(&bk).await;
                return Err(err);
            }
        };

        {
            let mut pools = ins.pools.write().await;
            for (rank, clue) in agg.clues {
                let uuid = clue.pool;
                pools.add_shard(uuid, rank, None, Some(clue)).await;
            }
        }

        let running = self.start_post(gen).await?;
        if !running {
            tracing::info!(gen, "nothing to check, instance completed at start");
            return Ok(());
        }

        {
            let mut recs = self.ins.rank_recs.write().await;
            let phase = self.ins.bk.lock().await.phase;
            for rank in &ranks {
                recs.insert(*rank, phase);
            }
        }

        ins.set_sched_running(true);
        let this = Arc::clone(self);
        ins.attach_sched(tokio::spawn(async move { this.sched().await }));
        ins.set_started(true);
        ins.notify.notify_waiters();

        tracing::info!(gen, ?ranks, "leader started check instance");
        Ok(())
    }

    /// Load the caller-specified pools; a pool already DONE in a former
    /// instance is skipped on the leader.
    async fn load_pool_list(&self, gen: u64, uuids: &[Uuid], reset: bool) -> Result<CheckPhase> {
        let reset_noncomp = self.ins.disposition.lock().unwrap().reset_noncomp;
        let mut min_phase = CheckPhase::Done;
        for &uuid in uuids {
            let mut bk = match self.ins.store.fetch_pool(uuid).await? {
                Some(bk) if !reset => bk,
                _ => scour_core::bookmark::PoolBookmark::new(gen),
            };
            if reset_noncomp && bk.phase != CheckPhase::Done {
                bk = scour_core::bookmark::PoolBookmark::new(gen);
            }
            if bk.phase == CheckPhase::Done {
                continue;
            }
            bk.gen = gen;
            if bk.phase < min_phase {
                min_phase = bk.phase;
            }
            self.ins
                .pools
                .write()
                .await
                .add_shard(uuid, scour_core::LEADER_RANK, Some(bk), None)
                .await;
        }
        Ok(min_phase)
    }

    async fn load_pools_from_store(&self, gen: u64, reset_noncomp: bool) -> Result<CheckPhase> {
        let mut min_phase = CheckPhase::Done;
        for uuid in self.ins.store.pool_keys().await? {
            let Some(mut bk) = self.ins.store.fetch_pool(uuid).await? else {
                continue;
            };
            if bk.phase == CheckPhase::Done {
                continue;
            }
            if reset_noncomp {
                bk = scour_core::bookmark::PoolBookmark::new(gen);
            }
            bk.gen = gen;
            if bk.phase < min_phase {
                min_phase = bk.phase;
            }
            self.ins
                .pools
                .write()
                .await
                .add_shard(uuid, scour_core::LEADER_RANK, Some(bk), None)
                .await;
        }
        Ok(min_phase)
    }

    /// Fold the aggregated clues into per-pool bookmarks, settle pools that
    /// already finished, and decide whether a scheduler is needed at all.
    async fn start_post(&self, gen: u64) -> Result<bool> {
        let ins = &self.ins;
        let pools = ins.pools.read().await.snapshot();
        let mut ins_phase = CheckPhase::Done;

        for pool in &pools {
            let mut pool_phase = CheckPhase::Done;
            let mut for_orphan = false;
            {
                let state = pool.state.lock().await;
                if state.shards.is_empty() {
                    // No engine reported it: leave for the dangling logic.
                    continue;
                }
                for shard in &state.shards {
                    match shard.clue.as_ref().and_then(|clue| clue.phase) {
                        None => {
                            for_orphan = true;
                            break;
                        }
                        Some(phase) if phase < pool_phase => pool_phase = phase,
                        Some(_) => {}
                    }
                }
            }
            if for_orphan {
                pool.set_for_orphan(true);
                continue;
            }

            let mut bk = pool.bk.lock().await;
            bk.gen = gen;
            // Within the leader-driven window the leader's own record wins;
            // past POOL_MBS the engines know better.
            if bk.phase <= CheckPhase::PoolMbs || pool_phase <= CheckPhase::PoolMbs {
                // keep bk.phase
            } else {
                bk.phase = pool_phase;
            }
            if bk.phase != CheckPhase::Done {
                bk.mark_checking();
            } else {
                bk.mark_stopped(PoolStatus::Checked);
                pool.set_done(true);
            }
            ins.store.update_pool(pool.uuid, &bk).await?;

            if bk.phase == CheckPhase::Done {
                let msg = IvMessage::pool(gen, pool.uuid, CheckPhase::Done, PoolStatus::Checked);
                let _ = self.iv.update(msg, IvSync::Eager, || true).await;
            } else if bk.phase < ins_phase {
                ins_phase = bk.phase;
            }
        }

        let orphan_pool = ins.disposition.lock().unwrap().orphan_pool;
        let mut bk = ins.bk.lock().await;
        bk.phase = ins_phase;
        if ins_phase != CheckPhase::Done || orphan_pool {
            if ins_phase == CheckPhase::Done {
                ins.set_for_orphan(true);
            }
            bk.mark_running();
            ins.store.update_leader(&bk).await?;
            if ins.for_orphan() {
                // Keep the in-memory phase away from DONE while orphans are
                // outstanding so query does not see done-but-running.
                bk.phase = CheckPhase::Prepare;
            }
            Ok(true)
        } else {
            bk.mark_stopped(InstanceStatus::Completed);
            bk.phase = CheckPhase::Done;
            ins.store.update_leader(&bk).await?;
            Ok(false)
        }
    }

    pub async fn stop(&self, gen: u64, pools: Vec<Uuid>) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        let ins = &self.ins;
        let cur_gen = ins.gen().await;
        if gen != 0 && gen != cur_gen {
            return Err(CheckError::NotApplicable);
        }
        if ins.starting() {
            return Err(CheckError::Busy);
        }
        if ins.stopping() || ins.sched_exiting() {
            return Err(CheckError::InProgress);
        }
        if ins.bk.lock().await.status != InstanceStatus::Running {
            return Err(CheckError::Already);
        }

        ins.set_stopping(true);
        let result = self.stop_inner(cur_gen, pools).await;
        ins.set_stopping(false);
        result
    }

    async fn stop_inner(&self, gen: u64, pools: Vec<Uuid>) -> Result<()> {
        let ins = &self.ins;
        if pools.is_empty() {
            ins.pool_stop_all(PoolStatus::Stopped).await?;
        } else {
            for uuid in &pools {
                ins.pool_stop_one(*uuid, PoolStatus::Stopped, None).await?;
            }
        }

        let ranks = ins.ranks.lock().await.clone();
        let stopped =
            rpc::stop_remote(self.transport.as_ref(), &ranks, gen, pools.clone()).await?;
        if stopped {
            ins.set_pool_stopped(true);
        }

        let active = {
            let snapshot = ins.pools.read().await.snapshot();
            snapshot
                .iter()
                .any(|pool| !pool.done() && !pool.skip() && !pool.stop())
        };
        if !active {
            self.stop_sched().await;
        }

        tracing::info!(gen, pool_nr = pools.len(), "leader stopped check");
        Ok(())
    }

    /// The process is shutting down: park the scheduler and leave the
    /// bookmarks to be resumed by a future start or rejoin.
    pub async fn pause(&self) {
        self.stop_sched().await;
    }

    async fn stop_sched(&self) {
        let ins = &self.ins;
        ins.set_pause(true);
        if ins.sched_running() && !ins.sched_exiting() {
            ins.set_sched_exiting(true);
            ins.notify.notify_waiters();
            if let Some(handle) = ins.take_sched() {
                let _ = handle.await;
            }
        } else {
            let gen = ins.gen().await;
            while (ins.sched_running() || ins.rejoining()) && gen == ins.gen().await {
                tokio::time::sleep(SCHED_TICK).await;
            }
        }
    }

    pub async fn query(&self, gen: u64, pools: Vec<Uuid>) -> Result<QueryResult> {
        let ins = &self.ins;
        let bk = ins.bk.lock().await.clone();
        if gen != 0 && gen != bk.gen {
            return Err(CheckError::NotApplicable);
        }
        let seed = MergedInfo {
            gen: bk.gen,
            status: bk.status,
            phase: bk.phase,
        };
        let ranks = ins.ranks.lock().await.clone();
        let (merged, shards) =
            rpc::query_remote(self.transport.as_ref(), &ranks, bk.gen, pools, seed).await?;
        Ok(QueryResult {
            gen: merged.gen,
            status: merged.status,
            phase: merged.phase,
            shards,
        })
    }

    pub async fn prop(&self) -> Result<(Vec<PolicyEntry>, PropertyFlags)> {
        let prop = self.ins.prop.lock().await;
        Ok((prop.policies.entries(), prop.flags))
    }

    /// Deliver an operator decision for a pending report.
    pub async fn act(&self, seq: u64, action: RepairAction, for_all: bool) -> Result<()> {
        let ins = &self.ins;
        if ins.bk.lock().await.magic != BK_MAGIC_LEADER {
            return Err(CheckError::NotLeader);
        }
        if ins.bk.lock().await.status != InstanceStatus::Running {
            return Err(CheckError::NotApplicable);
        }
        if action == RepairAction::Interact {
            return Err(CheckError::Invalid(
                "interact is not a valid decision".into(),
            ));
        }

        let (class, primary_on_leader) = self.act_one(seq, action, for_all, false).await?;
        if !for_all {
            return Ok(());
        }

        {
            let mut prop = ins.prop.lock().await;
            if prop.policies.action_for(class) != action {
                prop.policies.set(class, action);
                let ranks = ins.ranks.lock().await.clone();
                ins.store.update_property(&prop, &ranks).await?;
            }
        }

        // Resolve every other pending record of the same class. When the
        // primary was remote, its for-all broadcast already reached every
        // engine; when it was leader-local, the remote acts go out here.
        let pools = ins.pools.read().await.snapshot();
        for pool in pools {
            for rec in pool.pending_snapshot() {
                if rec.class == class && rec.is_interact() {
                    let _ = self
                        .act_one(rec.seq, action, false, !primary_on_leader)
                        .await;
                }
            }
        }
        Ok(())
    }

    /// Resolve one pending record. `local_only` skips the remote delivery
    /// (used on the for-all fan-out, where engines act on the broadcast).
    async fn act_one(
        &self,
        seq: u64,
        action: RepairAction,
        for_all: bool,
        local_only: bool,
    ) -> Result<(InconsistClass, bool)> {
        let ins = &self.ins;
        let rec = {
            let mut pending = ins.pending.write().await;
            pending.del(seq).ok_or_else(|| {
                CheckError::NotFound(format!("no pending report with seq {seq:#x}"))
            })?
        };
        let class = rec.class;

        if rec.on_leader() {
            rec.decide(action);
        } else {
            if let Some(pool) = ins.pools.read().await.get(&rec.pool) {
                let mut bk = pool.bk.lock().await;
                if bk.status == PoolStatus::Pending {
                    bk.status = PoolStatus::Checking;
                }
                pool.remove_pending(seq);
            }
            if let Some(rank_rec) = ins.rank_recs.read().await.get(rec.rank) {
                rank_rec.remove_pending(seq);
            }
            if !local_only {
                let ranks = ins.ranks.lock().await.clone();
                let gen = ins.gen().await;
                rpc::act_remote(
                    self.transport.as_ref(),
                    &ranks,
                    rec.rank,
                    scour_core::rpc::ActIn {
                        gen,
                        seq,
                        class,
                        action,
                        for_all,
                    },
                )
                .await?;
            }
        }

        tracing::info!(seq, %action, %class, "leader took action for report");
        Ok((class, rec.on_leader()))
    }

    // ── report pathway ────────────────────────────────────────────

    /// Handle a report, remote (from an engine) or local (the leader's own
    /// detectors pass `want_decision` and block until the operator answers).
    pub async fn report(
        &self,
        unit: &mut ReportUnit,
        want_decision: bool,
    ) -> Result<Option<RepairAction>> {
        let ins = &self.ins;
        {
            let bk = ins.bk.lock().await;
            if bk.magic != BK_MAGIC_LEADER {
                return Err(CheckError::NotLeader);
            }
            if bk.status != InstanceStatus::Running {
                return Err(CheckError::NotApplicable);
            }
            if unit.gen != bk.gen {
                return Err(CheckError::NotApplicable);
            }
        }

        if unit.seq == 0 {
            unit.seq = ins.next_seq();
        }
        tracing::info!(
            gen = unit.gen,
            seq = unit.seq,
            rank = unit.rank,
            class = %unit.class,
            action = %unit.action,
            local = want_decision,
            "leader handles report"
        );

        let mut pending = None;
        let mut pool_rec = None;
        if unit.action == RepairAction::Interact {
            let pool_uuid = unit
                .pool
                .ok_or_else(|| CheckError::Invalid("interactive report without pool".into()))?;
            let pool = ins
                .pools
                .read()
                .await
                .get(&pool_uuid)
                .ok_or_else(|| CheckError::NotFound(format!("pool {pool_uuid}")))?;

            loop {
                let mut table = ins.pending.write().await;
                match table.add(pool_uuid, unit.seq, unit.rank, unit.class) {
                    Ok(rec) => {
                        if want_decision {
                            rec.set_on_leader();
                        } else if let Some(rank_rec) = ins.rank_recs.read().await.get(unit.rank) {
                            rank_rec.add_pending(Arc::clone(&rec));
                        }
                        pool.add_pending(Arc::clone(&rec));
                        pending = Some(rec);
                        break;
                    }
                    Err(CheckError::Again) if want_decision => {
                        drop(table);
                        unit.seq = ins.next_seq();
                    }
                    Err(err) => return Err(err),
                }
            }
            pool_rec = Some(pool);
        }

        report_upcall(self.sink.as_ref(), unit, unit.seq).await?;

        if let (Some(pool), Some(rec)) = (&pool_rec, &pending) {
            if rec.is_interact() {
                let mut bk = pool.bk.lock().await;
                if bk.status == PoolStatus::Checking {
                    bk.status = PoolStatus::Pending;
                }
            }
        }

        if !want_decision {
            return Ok(None);
        }
        let Some(rec) = pending else {
            return Ok(None);
        };

        tracing::info!(seq = rec.seq, class = %rec.class, "leader waits for interaction");
        let decision = rec.wait(|| ins.sched_alive()).await;

        if let Some(pool) = &pool_rec {
            let mut bk = pool.bk.lock().await;
            if bk.status == PoolStatus::Pending {
                bk.status = PoolStatus::Checking;
            }
            pool.remove_pending(rec.seq);
        }
        ins.pending.write().await.del(rec.seq);

        decision.map(Some)
    }

    // ── IV notifications (engine → leader) ────────────────────────

    pub async fn notify(&self, iv: &IvMessage) -> Result<()> {
        match self.notify_inner(iv).await {
            Err(CheckError::NotApplicable) => {
                tracing::debug!(gen = iv.gen, rank = iv.rank, "stale IV notification dropped");
                Ok(())
            }
            Err(err) => {
                tracing::error!(
                    gen = iv.gen,
                    rank = iv.rank,
                    phase = %iv.phase,
                    %err,
                    "leader failed to handle notification"
                );
                Err(err)
            }
            Ok(()) => Ok(()),
        }
    }

    async fn notify_inner(&self, iv: &IvMessage) -> Result<()> {
        let ins = &self.ins;
        {
            let bk = ins.bk.lock().await;
            if bk.magic != BK_MAGIC_LEADER
                || bk.gen != iv.gen
                || bk.status != InstanceStatus::Running
            {
                return Err(CheckError::NotApplicable);
            }
        }

        if iv.pool.is_some() {
            ins.pool_handle_notify(iv).await?;
            return Ok(());
        }

        match iv.ins_status {
            Some(InstanceStatus::Init)
            | Some(InstanceStatus::Stopped)
            | Some(InstanceStatus::Paused)
            | Some(InstanceStatus::Implicated) => Ok(()),
            Some(InstanceStatus::Running) => {
                let bk_phase = ins.bk.lock().await.phase;
                if iv.phase < bk_phase {
                    return Err(CheckError::NotApplicable);
                }
                if let Some(rec) = ins.rank_recs.read().await.get(iv.rank) {
                    rec.set_phase(iv.phase);
                }
                Ok(())
            }
            Some(InstanceStatus::Completed) => {
                if iv.phase != CheckPhase::ContCleanup && iv.phase != CheckPhase::Done {
                    return Err(CheckError::Invalid(format!(
                        "engine {} completed at phase {}",
                        iv.rank, iv.phase
                    )));
                }
                self.rank_del(iv.rank).await;
                Ok(())
            }
            Some(InstanceStatus::Failed) => {
                ins.set_fail_phase(iv.phase);
                self.rank_del(iv.rank).await;
                if ins.prop.lock().await.flags.failout {
                    ins.set_implicated(true);
                    self.stop_sched().await;
                }
                Ok(())
            }
            None => Err(CheckError::Invalid("instance IV without status".into())),
        }
    }

    /// Remove a rank record, waking every pending producer it owns.
    async fn rank_del(&self, rank: Rank) {
        let rec = self.ins.rank_recs.write().await.remove(rank);
        let Some(rec) = rec else { return };
        let mut pending = self.ins.pending.write().await;
        for rec in rec.drain_pending() {
            if let Some(pool) = self.ins.pools.read().await.get(&rec.pool) {
                pool.remove_pending(rec.seq);
            }
            pending.wakeup(&rec);
        }
    }

    // ── rejoin ────────────────────────────────────────────────────

    pub async fn rejoin(&self, gen: u64, rank: Rank, iv_uuid: Uuid) -> Result<RejoinOut> {
        let ins = &self.ins;
        let bk = ins.bk.lock().await.clone();
        if bk.magic != BK_MAGIC_LEADER {
            return Err(CheckError::NotLeader);
        }
        if bk.iv_uuid != iv_uuid {
            return Err(CheckError::Stale(format!("iv uuid {iv_uuid}")));
        }
        if bk.gen != gen {
            return Err(CheckError::Stale(format!("gen {gen:#x}")));
        }
        if bk.status != InstanceStatus::Running {
            return Err(CheckError::Shutdown);
        }
        if !ins.ranks.lock().await.contains(&rank) {
            return Err(CheckError::NoPerm);
        }

        let pools = ins.pools.read().await.uuids();
        tracing::info!(gen, rank, pool_nr = pools.len(), "leader accepted rejoin");
        Ok(RejoinOut {
            orphan_done: ins.orphan_done(),
            pools,
        })
    }

    // ── rank-death events ─────────────────────────────────────────

    /// Transport upcall: a rank died. Queued for the scheduler cycle.
    pub fn rank_dead(&self, rank: Rank) {
        if !self.ins.sched_running() {
            return;
        }
        self.ins.dead_ranks.lock().unwrap().push_back(rank);
    }

    /// Transport upcall: a dead rank came back before we processed it.
    pub fn rank_alive(&self, rank: Rank) {
        self.ins
            .dead_ranks
            .lock()
            .unwrap()
            .retain(|&dead| dead != rank);
    }

    async fn mark_rank_dead(&self, rank: Rank) {
        let ins = &self.ins;
        let gen = ins.gen().await;
        {
            let mut ranks = ins.ranks.lock().await;
            let before = ranks.len();
            ranks.retain(|&r| r != rank);
            if ranks.len() == before {
                return;
            }
        }
        // First eviction publishes gen − 1, the next gen − 2, and so on.
        let prior = self.evictions.fetch_add(1, Ordering::AcqRel);
        let version = (gen as u32).wrapping_sub(prior).wrapping_sub(1);

        let ranks = ins.ranks.lock().await.clone();
        {
            let mut prop = ins.prop.lock().await;
            prop.rank_count = ranks.len() as u32;
            if let Err(err) = ins.store.update_property(&prop, &ranks).await {
                tracing::error!(rank, %err, "failed to persist ranks after death");
                return;
            }
        }
        if let Err(err) = self.transport.update_group(&ranks, version).await {
            tracing::error!(rank, version, %err, "failed to modify IV group");
            return;
        }

        self.rank_del(rank).await;

        if !ins.rank_recs.read().await.is_empty() {
            let result = rpc::mark_remote(
                self.transport.as_ref(),
                &ranks,
                MarkIn {
                    gen,
                    rank,
                    group_version: version,
                },
            )
            .await;
            if let Err(err) = result {
                tracing::error!(rank, %err, "failed to broadcast rank death");
                return;
            }
        }
        tracing::info!(rank, version, "leader marked rank dead");
    }

    // ── scheduler ─────────────────────────────────────────────────

    async fn sched(self: Arc<Self>) {
        let ins = &self.ins;
        tracing::info!(
            gen = ins.gen().await,
            phase = %ins.bk.lock().await.phase,
            "leader scheduler enters"
        );

        // Start handshake. The waiter is registered before the flags are
        // read so a wakeup between check and wait is never lost.
        loop {
            let notified = ins.notify.notified();
            if ins.sched_exiting() {
                self.sched_exit(0).await;
                return;
            }
            if ins.started() {
                break;
            }
            notified.await;
        }

        let has_pools = !ins.pools.read().await.is_empty();
        let orphan_pool = ins.disposition.lock().unwrap().orphan_pool;
        if has_pools || orphan_pool {
            if let Err(err) = self.handle_pools_list().await {
                tracing::error!(%err, "leader failed to handle pools list");
                self.sched_exit(-1).await;
                return;
            }
        }

        let rc = loop {
            tokio::time::sleep(SCHED_TICK).await;

            // Drain dead ranks before looking at progress.
            loop {
                let next = ins.dead_ranks.lock().unwrap().pop_front();
                match next {
                    Some(rank) => self.mark_rank_dead(rank).await,
                    None => break,
                }
                if let Some(rc) = self.need_stop().await {
                    self.sched_exit(rc).await;
                    return;
                }
            }

            if let Some(rc) = self.need_stop().await {
                break rc;
            }

            let progress = ins.sweep().await;

            if matches!(progress, SweepProgress::Running(_) | SweepProgress::Done) {
                let announce = match progress {
                    SweepProgress::Done => CheckPhase::Done,
                    SweepProgress::Running(phase) => phase,
                    _ => unreachable!(),
                };
                if announce >= CheckPhase::PoolMbs && !ins.orphan_done() {
                    let gen = ins.gen().await;
                    let msg = IvMessage::instance(gen, announce, InstanceStatus::Running);
                    match self.iv.update(msg, IvSync::Eager, || !ins.pause()).await {
                        Ok(()) => {
                            ins.set_orphan_done(true);
                            tracing::info!("leader announced orphan processing done");
                        }
                        Err(err) => {
                            tracing::warn!(%err, "failed to announce orphan processing")
                        }
                    }
                }
            }

            match progress {
                SweepProgress::Done => break 1,
                SweepProgress::Stopped => break 0,
                SweepProgress::AwaitOrphans => {}
                SweepProgress::Running(min_phase) => {
                    let mut bk = ins.bk.lock().await;
                    if bk.phase < min_phase {
                        tracing::info!(from = %bk.phase, to = %min_phase, "leader advances phase");
                        bk.advance(min_phase);
                        if let Err(err) = ins.store.update_leader(&bk).await {
                            drop(bk);
                            tracing::error!(%err, "failed to persist leader phase");
                            self.sched_exit(-1).await;
                            return;
                        }
                    }
                }
            }
        };

        self.sched_exit(rc).await;
    }

    /// `rc` follows the original convention: positive means the check ran to
    /// its end, zero means stop/pause, negative means failure.
    async fn sched_exit(&self, rc: i32) {
        let ins = &self.ins;
        let failout = ins.prop.lock().await.flags.failout;
        let (ins_phase, ins_status, pool_status) = if rc > 0 {
            match ins.fail_phase() {
                Some(phase) if failout => (
                    Some(phase),
                    InstanceStatus::Failed,
                    PoolStatus::Implicated,
                ),
                _ => (
                    Some(CheckPhase::Done),
                    InstanceStatus::Completed,
                    PoolStatus::Checked,
                ),
            }
        } else if rc == 0 {
            if ins.implicated() {
                (None, InstanceStatus::Implicated, PoolStatus::Implicated)
            } else if ins.stopping() {
                (None, InstanceStatus::Stopped, PoolStatus::Stopped)
            } else {
                (None, InstanceStatus::Paused, PoolStatus::Paused)
            }
        } else {
            (None, InstanceStatus::Failed, PoolStatus::Implicated)
        };

        ins.set_sched_exiting(true);

        let _ = ins.pool_stop_all(pool_status).await;

        let bcast = rc < 0 || ins_status == InstanceStatus::Failed;
        if (bcast && ins_status == InstanceStatus::Failed)
            || ins_status == InstanceStatus::Implicated
            || (ins_status == InstanceStatus::Completed && !ins.orphan_done())
        {
            let gen = ins.gen().await;
            let phase = match ins_phase {
                Some(phase) => phase,
                None => ins.bk.lock().await.phase,
            };
            let msg = IvMessage::instance(gen, phase, ins_status);
            let _ = self.iv.update(msg, IvSync::Eager, || true).await;
        }

        ins.destroy_trees().await;

        {
            let mut bk = ins.bk.lock().await;
            if bk.status == InstanceStatus::Running {
                if let Some(phase) = ins_phase {
                    bk.phase = phase;
                }
                bk.mark_stopped(ins_status);
                if let Err(err) = ins.store.update_leader(&bk).await {
                    tracing::error!(%err, "failed to persist leader exit");
                }
            }
        }

        tracing::info!(status = %ins_status, rc, "leader scheduler exits");
        ins.set_sched_exiting(false);
        ins.set_sched_running(false);
        ins.set_started(false);
    }

    /// Leader-side termination test: once no engine rank remains, only
    /// unfinished dangling pools keep the instance alive.
    async fn need_stop(&self) -> Option<i32> {
        let ins = &self.ins;
        if ins.pause() || ins.sched_exiting() {
            return Some(0);
        }
        if ins.rank_recs.read().await.is_empty() {
            let pools = ins.pools.read().await.snapshot();
            let dangling = pools
                .iter()
                .any(|pool| pool.dangling() && !pool.skip() && !pool.done());
            if !dangling {
                return Some(if ins.pool_stopped() { 0 } else { 1 });
            }
        }
        None
    }

    // ── start-time classification ─────────────────────────────────

    /// Compare the MS pool list with the engine-reported shards and spawn
    /// the per-pool workers: dangling pools get a dangling worker, orphan
    /// candidates confirmed by MS are dropped, everything else gets the
    /// regular pool worker.
    async fn handle_pools_list(self: &Arc<Self>) -> Result<()> {
        let ins = &self.ins;
        let orphan_pool = ins.disposition.lock().unwrap().orphan_pool;
        let ms_pools = self.mgmt.list_pools().await?;

        for entry in &ms_pools {
            let existing = ins.pools.read().await.get(&entry.uuid);
            match existing {
                Some(pool) => {
                    pool.set_exist_on_ms(true);
                    if pool.done() {
                        continue;
                    }
                    {
                        let mut state = pool.state.lock().await;
                        state.label = entry.label.clone();
                    }

                    let has_shards = !pool.state.lock().await.shards.is_empty();
                    if !has_shards {
                        pool.set_dangling(true);
                        self.spawn_dangling_worker(&pool);
                        continue;
                    }
                    if pool.for_orphan() {
                        // Known to MS after all: not an orphan, and not in
                        // the check list either.
                        pool.set_skip(true);
                        ins.pools.write().await.remove(&pool.uuid);
                        continue;
                    }
                    self.spawn_pool_worker(&pool);
                }
                None => {
                    if !orphan_pool {
                        continue;
                    }
                    let pool = {
                        let mut pools = ins.pools.write().await;
                        pools
                            .add_shard(entry.uuid, scour_core::LEADER_RANK, None, None)
                            .await
                    };
                    pool.set_exist_on_ms(true);
                    pool.set_dangling(true);
                    {
                        let mut bk = pool.bk.lock().await;
                        bk.gen = ins.gen().await;
                    }
                    {
                        let mut state = pool.state.lock().await;
                        state.label = entry.label.clone();
                    }
                    self.spawn_dangling_worker(&pool);
                }
            }
        }

        // Everything the engines reported but MS does not know: orphans.
        let pools = ins.pools.read().await.snapshot();
        for pool in pools {
            if pool.skip() || pool.done() || pool.exist_on_ms() || pool.dangling() {
                continue;
            }
            if pool.bk.lock().await.phase == CheckPhase::Done {
                pool.set_done(true);
                continue;
            }
            self.spawn_pool_worker(&pool);
        }

        Ok(())
    }

    fn spawn_pool_worker(self: &Arc<Self>, pool: &Arc<PoolRec>) {
        let this = Arc::clone(self);
        let pool_clone = Arc::clone(pool);
        pool.attach_worker(tokio::spawn(async move {
            this.pool_worker(pool_clone).await;
        }));
    }

    fn spawn_dangling_worker(self: &Arc<Self>, pool: &Arc<PoolRec>) {
        let this = Arc::clone(self);
        let pool_clone = Arc::clone(pool);
        pool.attach_worker(tokio::spawn(async move {
            this.dangling_worker(pool_clone).await;
        }));
    }

    fn pool_need_stop(&self, pool: &Arc<PoolRec>) -> bool {
        pool.skip() || pool.stop() || self.ins.pause() || self.ins.sched_exiting()
    }

    // ── dangling-pool worker ──────────────────────────────────────

    async fn dangling_worker(self: Arc<Self>, pool: Arc<PoolRec>) {
        tracing::info!(pool = %pool.uuid, "dangling-pool worker enters");
        let result = self.dangling_pool(&pool).await;
        if matches!(result, Err(CheckError::Interrupted)) {
            tracing::info!(pool = %pool.uuid, "dangling-pool worker interrupted");
            return;
        }

        {
            let mut bk = pool.bk.lock().await;
            bk.advance(CheckPhase::Done);
            match &result {
                Ok(()) => bk.mark_stopped(PoolStatus::Checked),
                Err(_) => bk.mark_stopped(PoolStatus::Failed),
            }
            let _ = self.ins.store.update_pool(pool.uuid, &bk).await;
        }
        pool.set_done(true);
        tracing::info!(pool = %pool.uuid, ok = result.is_ok(), "dangling-pool worker exits");
    }

    /// A pool known to MS that no engine reported. Default repair drops the
    /// MS entry.
    async fn dangling_pool(&self, pool: &Arc<PoolRec>) -> Result<()> {
        let ins = &self.ins;
        let (policy, dryrun, auto) = {
            let prop = ins.prop.lock().await;
            (
                prop.policies.action_for(InconsistClass::PoolNonexistOnEngine),
                prop.flags.dryrun,
                prop.flags.auto,
            )
        };
        let gen = ins.gen().await;
        let label = pool.state.lock().await.label.clone();
        self.tally_total(Some(pool)).await;

        let mut action = policy;
        loop {
            let mut unit = ReportUnit::new(
                gen,
                InconsistClass::PoolNonexistOnEngine,
                RepairAction::Interact,
                scour_core::LEADER_RANK,
            );
            unit.pool = Some(pool.uuid);
            unit.pool_label = label.clone();
            unit.msg = format!("Check leader detects dangling pool {}.", pool.uuid);

            match action {
                RepairAction::Default | RepairAction::Discard | RepairAction::TrustPs => {
                    unit.action = RepairAction::Discard;
                    unit.seq = ins.next_seq();
                    let result = if dryrun {
                        self.tally(Some(pool), Outcome::Repaired).await;
                        Ok(())
                    } else {
                        match self.mgmt.deregister_pool(unit.seq, pool.uuid).await {
                            Ok(()) => {
                                self.tally(Some(pool), Outcome::Repaired).await;
                                Ok(())
                            }
                            Err(err) => {
                                self.tally(Some(pool), Outcome::Failed).await;
                                Err(err)
                            }
                        }
                    };
                    unit.result = result.as_ref().err().map(|err| err.to_string());
                    self.report(&mut unit, true).await?;
                    return result;
                }
                RepairAction::Ignore => {
                    unit.action = RepairAction::Ignore;
                    self.tally(Some(pool), Outcome::Ignored).await;
                    self.report(&mut unit, true).await?;
                    return Ok(());
                }
                _ => {
                    if auto {
                        action = RepairAction::Ignore;
                        continue;
                    }
                    unit.action = RepairAction::Interact;
                    unit.options = vec![RepairAction::Discard, RepairAction::Ignore];
                    unit.details = vec![
                        "Discard the dangling pool entry from MS [suggested].".into(),
                        "Keep the dangling pool entry on MS, repair nothing.".into(),
                    ];
                    match self.report(&mut unit, true).await? {
                        Some(decision) => {
                            action = match decision {
                                RepairAction::Discard => RepairAction::Discard,
                                _ => RepairAction::Ignore,
                            };
                        }
                        None => return Ok(()),
                    }
                }
            }
        }
    }

    // ── regular pool worker ───────────────────────────────────────

    async fn pool_worker(self: Arc<Self>, pool: Arc<PoolRec>) {
        tracing::info!(pool = %pool.uuid, "leader pool worker enters");
        let mut rc = self.pool_worker_inner(&pool).await;
        if matches!(rc, Err(CheckError::Interrupted)) {
            // Stopped from outside; the sponsor owns the bookkeeping.
            rc = Ok(());
        }

        // Publish the failure unless an external stop owns the bookkeeping.
        if (rc.is_err() || pool.skip()) && !pool.notified_exit() && !pool.stop() {
            let gen = self.ins.gen().await;
            let phase = pool.bk.lock().await.phase;
            let msg = IvMessage::pool(gen, pool.uuid, phase, PoolStatus::Failed);
            if self
                .iv
                .update(msg, IvSync::Eager, || !self.ins.pause())
                .await
                .is_ok()
            {
                pool.set_notified_exit(true);
            }
        }

        if pool.skip() {
            pool.set_done(true);
        }
        tracing::info!(pool = %pool.uuid, ok = rc.is_ok(), "leader pool worker exits");
    }

    async fn pool_worker_inner(&self, pool: &Arc<PoolRec>) -> Result<()> {
        let ins = &self.ins;
        let gen = ins.gen().await;

        if self.pool_need_stop(pool) {
            return Ok(());
        }

        // Clues are rebuilt even when resuming; they seed pool start and
        // membership below.
        self.handle_pool_clues(pool).await?;
        if self.pool_need_stop(pool) {
            return Ok(());
        }

        if pool.bk.lock().await.phase <= CheckPhase::Prepare {
            if !pool.exist_on_ms() {
                self.orphan_pool(pool).await?;
                if self.pool_need_stop(pool) {
                    return Ok(());
                }
            } else {
                let (ms_label, ps_label) = {
                    let state = pool.state.lock().await;
                    let ps = state
                        .advice
                        .and_then(|idx| state.clues.get(idx))
                        .and_then(|clue| clue.label.clone());
                    (state.label.clone(), ps)
                };
                if ms_label != ps_label {
                    self.handle_pool_label(pool, ms_label, ps_label).await?;
                    if self.pool_need_stop(pool) {
                        return Ok(());
                    }
                }
            }

            let mut bk = pool.bk.lock().await;
            if bk.phase < CheckPhase::PoolList {
                bk.advance(CheckPhase::PoolList);
                if let Err(err) = ins.store.update_pool(pool.uuid, &bk).await {
                    pool.set_skip(true);
                    return Err(err);
                }
            }
        }

        // Tell every shard to bring the pool up, piggybacking the phase.
        // Evicted ranks are gone from the group; collectives skip them.
        let live = ins.ranks.lock().await.clone();
        let shard_ranks: Vec<Rank> = pool
            .shard_ranks()
            .await
            .into_iter()
            .filter(|rank| live.contains(rank))
            .collect();
        let flags = PoolStartFlags {
            for_orphan: pool.for_orphan(),
            not_export_ps: pool.not_export_ps(),
        };
        let start = PoolStartIn {
            gen,
            pool: pool.uuid,
            phase: CheckPhase::PoolList,
            flags,
            svc_mode: None,
            svc_ranks: Vec::new(),
        };
        if let Err(err) =
            rpc::pool_start_remote(self.transport.as_ref(), &shard_ranks, start).await
        {
            pool.set_skip(true);
            if matches!(err, CheckError::Shutdown | CheckError::NotFound(_)) {
                return Ok(());
            }
            return Err(err);
        }
        if self.pool_need_stop(pool) {
            return Ok(());
        }

        if ins.prop.lock().await.flags.dryrun {
            // No persistent repair is possible, so the engine-side phases
            // cannot run against a stable base. The pool is settled here.
            let gen = ins.gen().await;
            {
                let mut bk = pool.bk.lock().await;
                bk.advance(CheckPhase::Done);
                bk.mark_stopped(PoolStatus::Checked);
                let _ = ins.store.update_pool(pool.uuid, &bk).await;
            }
            let msg = IvMessage::pool(gen, pool.uuid, CheckPhase::Done, PoolStatus::Checked);
            if self.iv.update(msg, IvSync::Eager, || !ins.pause()).await.is_ok() {
                pool.set_notified_exit(true);
            }
            pool.set_done(true);
            return Ok(());
        }
        self.start_pool_svc(pool, gen).await?;
        if self.pool_need_stop(pool) {
            return Ok(());
        }

        {
            let mut bk = pool.bk.lock().await;
            if bk.phase < CheckPhase::PoolMbs {
                bk.advance(CheckPhase::PoolMbs);
                if let Err(err) = ins.store.update_pool(pool.uuid, &bk).await {
                    pool.set_skip(true);
                    return Err(err);
                }
            }
        }

        self.pool_mbs_one(pool, gen).await
    }

    /// Build the PS-clue vector from the shards, pick the advice replica,
    /// and run the no-quorum handler when the cohort lost its majority.
    /// Shards whose service is still shutting down, or that came with no
    /// clue at all, are left out; a pool with no usable clue is failed.
    async fn handle_pool_clues(&self, pool: &Arc<PoolRec>) -> Result<()> {
        let usable = {
            let mut state = pool.state.lock().await;
            let clues: Vec<PoolClue> = state
                .shards
                .iter()
                .filter_map(|shard| shard.clue.as_ref())
                .filter(|clue| !clue.svc_busy)
                .cloned()
                .collect();
            let usable = !clues.is_empty();
            state.clues = clues;
            usable
        };

        if !usable {
            // No engine could describe the pool; report and skip.
            self.fail_pool(pool, &CheckError::Busy).await;
            return Ok(());
        }

        let verdict = {
            let state = pool.state.lock().await;
            evaluate_clues(&state.clues)
        };
        match verdict {
            Some(verdict) => {
                pool.state.lock().await.advice = Some(verdict.advice);
                if verdict.healthy {
                    pool.set_healthy(true);
                    return Ok(());
                }
            }
            None => {
                pool.state.lock().await.advice = None;
            }
        }

        self.no_quorum_pool(pool).await
    }

    /// An engine could not describe the pool at all; nothing can be
    /// classified, so report and skip.
    async fn fail_pool(&self, pool: &Arc<PoolRec>, err: &CheckError) {
        let ins = &self.ins;
        let gen = ins.gen().await;
        self.tally_total(Some(pool)).await;
        self.tally(Some(pool), Outcome::Ignored).await;
        pool.set_skip(true);

        let mut unit = ReportUnit::new(
            gen,
            InconsistClass::Unknown,
            RepairAction::Ignore,
            scour_core::LEADER_RANK,
        );
        unit.seq = ins.next_seq();
        unit.pool = Some(pool.uuid);
        unit.pool_label = pool.state.lock().await.label.clone();
        unit.result = Some(err.to_string());
        unit.msg = "Some engine failed to report information for pool.".into();
        let rc = self.report(&mut unit, true).await;
        tracing::warn!(pool = %pool.uuid, %err, ok = rc.is_ok(), "pool skipped, shard report missing");
    }

    /// Orphan pool: engines hold it, MS does not. Default re-registers it
    /// with the chosen PS clue; a zombie shard forces the operator to
    /// confirm continuing the destruction.
    async fn orphan_pool(&self, pool: &Arc<PoolRec>) -> Result<()> {
        let ins = &self.ins;
        let (policy, dryrun, auto) = {
            let prop = ins.prop.lock().await;
            (
                prop.policies.action_for(InconsistClass::PoolNonexistOnMs),
                prop.flags.dryrun,
                prop.flags.auto,
            )
        };
        let gen = ins.gen().await;
        let in_zombie = pool.in_zombie().await;
        let (ps_label, replicas) = {
            let state = pool.state.lock().await;
            let clue = state.advice.and_then(|idx| state.clues.get(idx));
            (
                clue.and_then(|clue| clue.label.clone()),
                clue.and_then(|clue| clue.svc.as_ref())
                    .map(|svc| svc.replicas.clone())
                    .unwrap_or_default(),
            )
        };

        self.tally_total(Some(pool)).await;
        // Keep the PS private until MS knows the pool again.
        pool.set_not_export_ps(true);

        let mut action = policy;
        loop {
            let mut unit = ReportUnit::new(
                gen,
                InconsistClass::PoolNonexistOnMs,
                RepairAction::Interact,
                scour_core::LEADER_RANK,
            );
            unit.pool = Some(pool.uuid);
            unit.pool_label = ps_label.clone();
            unit.msg = format!("Check leader detects orphan pool {}.", pool.uuid);

            match action {
                // A zombie shard means the pool was half-destroyed; never
                // auto-readd it, ask the operator instead.
                RepairAction::Default | RepairAction::Readd | RepairAction::TrustPs
                    if !in_zombie =>
                {
                    unit.action = RepairAction::Readd;
                    unit.seq = ins.next_seq();
                    let result = if dryrun {
                        self.tally(Some(pool), Outcome::Repaired).await;
                        pool.set_exist_on_ms(true);
                        Ok(())
                    } else {
                        match self
                            .mgmt
                            .register_pool(unit.seq, pool.uuid, ps_label.as_deref(), &replicas)
                            .await
                        {
                            Ok(()) => {
                                self.tally(Some(pool), Outcome::Repaired).await;
                                pool.set_exist_on_ms(true);
                                pool.set_not_export_ps(false);
                                Ok(())
                            }
                            Err(err) => {
                                self.tally(Some(pool), Outcome::Failed).await;
                                Err(err)
                            }
                        }
                    };
                    if result.is_ok() {
                        // MS now carries the PS label; the later label check
                        // must not re-register.
                        pool.state.lock().await.label = ps_label.clone();
                    }
                    unit.result = result.as_ref().err().map(|err| err.to_string());
                    self.report(&mut unit, true).await?;
                    self.post_repair(pool, &result, pool.skip() && !pool.destroyed())
                        .await;
                    return result;
                }
                RepairAction::Discard | RepairAction::TrustMs => {
                    unit.action = RepairAction::Discard;
                    unit.seq = ins.next_seq();
                    let result = self.destroy_pool(pool, unit.seq, false, dryrun).await;
                    pool.set_skip(true);
                    unit.result = result.as_ref().err().map(|err| err.to_string());
                    self.report(&mut unit, true).await?;
                    self.post_repair(pool, &result, !pool.destroyed()).await;
                    return result;
                }
                RepairAction::Ignore => {
                    unit.action = RepairAction::Ignore;
                    self.tally(Some(pool), Outcome::Ignored).await;
                    self.report(&mut unit, true).await?;
                    self.post_repair(pool, &Ok(()), pool.skip()).await;
                    return Ok(());
                }
                _ => {
                    if auto {
                        action = RepairAction::Ignore;
                        continue;
                    }
                    unit.action = RepairAction::Interact;
                    if in_zombie {
                        unit.options = vec![RepairAction::Discard, RepairAction::Ignore];
                        unit.details = vec![
                            "Continue destroying the half-destroyed pool [suggested].".into(),
                            "Keep the orphan pool entry on engines, repair nothing.".into(),
                        ];
                    } else {
                        unit.options = vec![
                            RepairAction::Readd,
                            RepairAction::Discard,
                            RepairAction::Ignore,
                        ];
                        unit.details = vec![
                            "Re-add the orphan pool back to MS [suggested].".into(),
                            "Destroy the orphan pool to release space.".into(),
                            "Keep the orphan pool entry on engines, repair nothing.".into(),
                        ];
                    }
                    match self.report(&mut unit, true).await? {
                        Some(decision) => {
                            action = match decision {
                                RepairAction::Readd if !in_zombie => RepairAction::Readd,
                                RepairAction::Discard => RepairAction::Discard,
                                _ => RepairAction::Ignore,
                            };
                        }
                        None => return Ok(()),
                    }
                }
            }
        }
    }

    /// Deregister (optionally) and destroy the pool's storage on its ranks.
    async fn destroy_pool(
        &self,
        pool: &Arc<PoolRec>,
        seq: u64,
        dereg: bool,
        dryrun: bool,
    ) -> Result<()> {
        if dryrun {
            self.tally(Some(pool), Outcome::Repaired).await;
            return Ok(());
        }
        let result = async {
            if dereg {
                match self.mgmt.deregister_pool(seq, pool.uuid).await {
                    Ok(()) | Err(CheckError::NotFound(_)) => {}
                    Err(err) => return Err(err),
                }
            }
            let ranks = pool.shard_ranks().await;
            match self.mgmt.destroy_pool(seq, pool.uuid, &ranks).await {
                Ok(()) | Err(CheckError::NotFound(_)) => Ok(()),
                Err(err) => Err(err),
            }
        }
        .await;
        match &result {
            Ok(()) => {
                pool.set_destroyed(true);
                self.tally(Some(pool), Outcome::Repaired).await;
            }
            Err(_) => self.tally(Some(pool), Outcome::Failed).await,
        }
        result
    }

    /// The PS cohort lost its majority. With a computable advice replica the
    /// default restarts the service in dictated mode; without one the pool
    /// can only be destroyed or ignored.
    async fn no_quorum_pool(&self, pool: &Arc<PoolRec>) -> Result<()> {
        let ins = &self.ins;
        let (policy, dryrun, auto) = {
            let prop = ins.prop.lock().await;
            (
                prop.policies
                    .action_for(InconsistClass::PoolLessSvcWithoutQuorum),
                prop.flags.dryrun,
                prop.flags.auto,
            )
        };
        let gen = ins.gen().await;
        let (advice, ms_label) = {
            let state = pool.state.lock().await;
            (state.advice, state.label.clone())
        };

        self.tally_total(Some(pool)).await;

        let mut action = policy;
        loop {
            let mut unit = ReportUnit::new(
                gen,
                InconsistClass::PoolLessSvcWithoutQuorum,
                RepairAction::Interact,
                scour_core::LEADER_RANK,
            );
            unit.pool = Some(pool.uuid);
            unit.pool_label = ms_label.clone();
            unit.msg = format!(
                "Check leader detects corrupted pool {} without quorum.",
                pool.uuid
            );

            match (action, advice) {
                (RepairAction::Default | RepairAction::TrustPs, Some(idx)) => {
                    unit.action = RepairAction::TrustPs;
                    unit.seq = ins.next_seq();
                    if dryrun {
                        self.tally(Some(pool), Outcome::Repaired).await;
                        // Dictated restart cannot happen under dryrun.
                        pool.set_skip(true);
                        self.report(&mut unit, true).await?;
                        self.post_repair(pool, &Ok(()), pool.skip()).await;
                        return Ok(());
                    }
                    let result = self.reset_pool_svc(pool, idx).await;
                    let result = match result {
                        Ok(()) if !pool.exist_on_ms() => {
                            let (label, replicas) = {
                                let state = pool.state.lock().await;
                                let clue = state.clues.get(idx);
                                (
                                    clue.and_then(|clue| clue.label.clone()),
                                    clue.and_then(|clue| clue.svc.as_ref())
                                        .map(|svc| svc.replicas.clone())
                                        .unwrap_or_default(),
                                )
                            };
                            match self
                                .mgmt
                                .register_pool(unit.seq, pool.uuid, label.as_deref(), &replicas)
                                .await
                            {
                                Ok(()) => {
                                    pool.set_exist_on_ms(true);
                                    pool.state.lock().await.label = label;
                                    Ok(())
                                }
                                Err(err) => {
                                    self.tally(Some(pool), Outcome::Failed).await;
                                    pool.set_skip(true);
                                    Err(err)
                                }
                            }
                        }
                        other => other,
                    };
                    // Success is not counted repaired yet: the dictated
                    // service start completes the repair.
                    unit.result = result.as_ref().err().map(|err| err.to_string());
                    self.report(&mut unit, true).await?;
                    self.post_repair(pool, &result, pool.skip()).await;
                    return result;
                }
                (RepairAction::Default | RepairAction::Discard, _) => {
                    unit.action = RepairAction::Discard;
                    unit.seq = ins.next_seq();
                    let result = self.destroy_pool(pool, unit.seq, true, dryrun).await;
                    pool.set_skip(true);
                    unit.result = result.as_ref().err().map(|err| err.to_string());
                    self.report(&mut unit, true).await?;
                    self.post_repair(pool, &result, pool.skip()).await;
                    return result;
                }
                (RepairAction::Ignore, _) => {
                    unit.action = RepairAction::Ignore;
                    self.tally(Some(pool), Outcome::Ignored).await;
                    pool.set_skip(true);
                    self.report(&mut unit, true).await?;
                    self.post_repair(pool, &Ok(()), pool.skip()).await;
                    return Ok(());
                }
                _ => {
                    if auto {
                        action = RepairAction::Ignore;
                        continue;
                    }
                    unit.action = RepairAction::Interact;
                    match advice {
                        Some(idx) => {
                            let rank = pool
                                .state
                                .lock()
                                .await
                                .clues
                                .get(idx)
                                .map(|clue| clue.rank)
                                .unwrap_or_default();
                            unit.options = vec![
                                RepairAction::TrustPs,
                                RepairAction::Discard,
                                RepairAction::Ignore,
                            ];
                            unit.details = vec![
                                format!(
                                    "Start pool service under DICTATE mode from rank {rank} [suggested]."
                                ),
                                "Destroy the corrupted pool from related engines.".into(),
                                "Keep the corrupted pool on related engines, repair nothing.".into(),
                            ];
                        }
                        None => {
                            unit.options = vec![RepairAction::Discard, RepairAction::Ignore];
                            unit.details = vec![
                                "Destroy the corrupted pool from related engines [suggested]."
                                    .into(),
                                "Keep the corrupted pool on related engines, repair nothing."
                                    .into(),
                            ];
                        }
                    }
                    match self.report(&mut unit, true).await? {
                        Some(decision) => {
                            action = match decision {
                                RepairAction::TrustPs if advice.is_some() => RepairAction::TrustPs,
                                RepairAction::Discard => RepairAction::Discard,
                                _ => RepairAction::Ignore,
                            };
                        }
                        None => return Ok(()),
                    }
                }
            }
        }
    }

    /// Keep only the chosen PS replica; the others are destroyed so the
    /// dictated restart has a single voice.
    async fn reset_pool_svc(&self, pool: &Arc<PoolRec>, chosen: usize) -> Result<()> {
        let (keep, evict): (Rank, Vec<Rank>) = {
            let state = pool.state.lock().await;
            let keep = state.clues[chosen].rank;
            let evict = state
                .clues
                .iter()
                .enumerate()
                .filter(|(idx, _)| *idx != chosen)
                .map(|(_, clue)| clue.rank)
                .collect();
            (keep, evict)
        };
        if evict.is_empty() {
            return Ok(());
        }
        let result = self.mgmt.reset_svc(pool.uuid, keep, &evict).await;
        if let Err(err) = &result {
            tracing::error!(pool = %pool.uuid, %err, "failed to destroy surplus PS replicas");
            self.tally(Some(pool), Outcome::Failed).await;
            pool.set_skip(true);
        }
        result
    }

    /// MS and PS disagree about the pool label. The default trusts MS and
    /// defers the PS-side write to the container-cleanup phase.
    async fn handle_pool_label(
        &self,
        pool: &Arc<PoolRec>,
        ms_label: Option<String>,
        ps_label: Option<String>,
    ) -> Result<()> {
        let ins = &self.ins;
        let (policy, dryrun, auto) = {
            let prop = ins.prop.lock().await;
            (
                prop.policies.action_for(InconsistClass::PoolBadLabel),
                prop.flags.dryrun,
                prop.flags.auto,
            )
        };
        let gen = ins.gen().await;
        let replicas = {
            let state = pool.state.lock().await;
            state
                .advice
                .and_then(|idx| state.clues.get(idx))
                .and_then(|clue| clue.svc.as_ref())
                .map(|svc| svc.replicas.clone())
                .unwrap_or_default()
        };

        let mut action = policy;
        loop {
            let mut unit = ReportUnit::new(
                gen,
                InconsistClass::PoolBadLabel,
                RepairAction::Interact,
                scour_core::LEADER_RANK,
            );
            unit.pool = Some(pool.uuid);
            unit.msg = format!(
                "Check leader detects corrupted pool label: {} (MS) vs {} (PS).",
                ms_label.as_deref().unwrap_or("(null)"),
                ps_label.as_deref().unwrap_or("(null)")
            );

            match action {
                RepairAction::Default if ms_label.is_none() => {
                    action = RepairAction::TrustPs;
                    continue;
                }
                RepairAction::Default | RepairAction::TrustMs => {
                    // The engine repairs the PS copy later; statistics are
                    // counted there, against the pool bookmark.
                    pool.set_delay_label(true);
                    let seq = ins.next_seq();
                    pool.state.lock().await.label_seq = seq;
                    return Ok(());
                }
                RepairAction::TrustPs => {
                    unit.action = RepairAction::TrustPs;
                    unit.seq = ins.next_seq();
                    unit.pool_label = ps_label.clone();
                    self.tally_total(Some(pool)).await;
                    let result = if dryrun {
                        self.tally(Some(pool), Outcome::Repaired).await;
                        Ok(())
                    } else {
                        match self
                            .mgmt
                            .register_pool(unit.seq, pool.uuid, ps_label.as_deref(), &replicas)
                            .await
                        {
                            Ok(()) => {
                                self.tally(Some(pool), Outcome::Repaired).await;
                                Ok(())
                            }
                            Err(err) => {
                                self.tally(Some(pool), Outcome::Failed).await;
                                Err(err)
                            }
                        }
                    };
                    unit.result = result.as_ref().err().map(|err| err.to_string());
                    self.report(&mut unit, true).await?;
                    self.post_repair(pool, &result, false).await;
                    // A failed label repair is not fatal for the pool.
                    return Ok(());
                }
                RepairAction::Ignore => {
                    unit.action = RepairAction::Ignore;
                    unit.pool_label = ms_label.clone().or_else(|| ps_label.clone());
                    self.tally_total(Some(pool)).await;
                    self.tally(Some(pool), Outcome::Ignored).await;
                    self.report(&mut unit, true).await?;
                    return Ok(());
                }
                _ => {
                    if auto {
                        action = RepairAction::Ignore;
                        continue;
                    }
                    unit.action = RepairAction::Interact;
                    unit.pool_label = ms_label.clone().or_else(|| ps_label.clone());
                    if ms_label.is_none() {
                        unit.options = vec![
                            RepairAction::TrustPs,
                            RepairAction::TrustMs,
                            RepairAction::Ignore,
                        ];
                        unit.details = vec![
                            format!(
                                "Trust PS pool label: {} [suggested].",
                                ps_label.as_deref().unwrap_or("(null)")
                            ),
                            "Trust MS pool label: (null).".into(),
                            "Keep the inconsistent pool label, repair nothing.".into(),
                        ];
                    } else {
                        unit.options = vec![
                            RepairAction::TrustMs,
                            RepairAction::TrustPs,
                            RepairAction::Ignore,
                        ];
                        unit.details = vec![
                            format!(
                                "Trust MS pool label: {} [suggested].",
                                ms_label.as_deref().unwrap_or("(null)")
                            ),
                            format!(
                                "Trust PS pool label: {}.",
                                ps_label.as_deref().unwrap_or("(null)")
                            ),
                            "Keep the inconsistent pool label, repair nothing.".into(),
                        ];
                    }
                    match self.report(&mut unit, true).await? {
                        Some(decision) => {
                            action = match decision {
                                RepairAction::TrustMs => RepairAction::TrustMs,
                                RepairAction::TrustPs => RepairAction::TrustPs,
                                _ => RepairAction::Ignore,
                            };
                        }
                        None => return Ok(()),
                    }
                }
            }
        }
    }

    /// Start the pool service: the full reported cohort when healthy, the
    /// single advice replica in dictated mode otherwise.
    async fn start_pool_svc(&self, pool: &Arc<PoolRec>, gen: u64) -> Result<()> {
        let healthy = pool.healthy();
        let (mode, svc_ranks) = {
            let state = pool.state.lock().await;
            if healthy {
                let ranks = state
                    .clues
                    .iter()
                    .filter(|clue| clue.svc.is_some())
                    .map(|clue| clue.rank)
                    .collect::<Vec<_>>();
                (SvcStartMode::Normal, ranks)
            } else {
                let Some(idx) = state.advice else {
                    pool.set_skip(true);
                    return Ok(());
                };
                (SvcStartMode::Dictate, vec![state.clues[idx].rank])
            }
        };
        let live = self.ins.ranks.lock().await.clone();
        let svc_ranks: Vec<Rank> = svc_ranks
            .into_iter()
            .filter(|rank| live.contains(rank))
            .collect();
        if svc_ranks.is_empty() {
            // Every PS replica is gone from the group.
            pool.set_skip(true);
            let failed: Result<()> = Err(CheckError::Shutdown);
            self.post_repair(pool, &failed, true).await;
            return Ok(());
        }

        let req = PoolStartIn {
            gen,
            pool: pool.uuid,
            phase: CheckPhase::PoolList,
            flags: PoolStartFlags {
                for_orphan: pool.for_orphan(),
                not_export_ps: pool.not_export_ps(),
            },
            svc_mode: Some(mode),
            svc_ranks: svc_ranks.clone(),
        };
        let result = rpc::pool_start_remote(self.transport.as_ref(), &svc_ranks, req).await;
        match result {
            Ok(()) => {
                if !healthy {
                    // The dictated restart completes the no-quorum repair.
                    self.tally(Some(pool), Outcome::Repaired).await;
                    self.post_repair(pool, &Ok(()), false).await;
                }
                Ok(())
            }
            Err(err) => {
                tracing::error!(
                    pool = %pool.uuid,
                    healthy,
                    %err,
                    "failed to start pool service, skipping pool"
                );
                pool.set_skip(true);
                if !healthy {
                    self.tally(Some(pool), Outcome::Failed).await;
                }
                let failed: Result<()> = Err(err.clone());
                self.post_repair(pool, &failed, true).await;
                Err(err)
            }
        }
    }

    /// Ship the membership table to the PS leader, with PS-leader discovery
    /// back-off, then let the PS leader drive the remaining phases.
    async fn pool_mbs_one(&self, pool: &Arc<PoolRec>, gen: u64) -> Result<()> {
        let (members, candidates, label, label_seq) = {
            let state = pool.state.lock().await;
            let members = state
                .shards
                .iter()
                .filter_map(|shard| {
                    shard.clue.as_ref().map(|clue| PoolMember {
                        rank: shard.rank,
                        targets: clue.targets.clone(),
                    })
                })
                .collect::<Vec<_>>();
            let candidates = state
                .clues
                .iter()
                .filter(|clue| clue.svc.is_some())
                .map(|clue| clue.rank)
                .collect::<Vec<_>>();
            (members, candidates, state.label.clone(), state.label_seq)
        };
        let live = self.ins.ranks.lock().await.clone();
        let candidates: Vec<Rank> = candidates
            .into_iter()
            .filter(|rank| live.contains(rank))
            .collect();
        if candidates.is_empty() {
            pool.set_skip(true);
            let failed: Result<()> = Err(CheckError::Shutdown);
            self.post_repair(pool, &failed, true).await;
            return Ok(());
        }

        let req = PoolMbsIn {
            gen,
            pool: pool.uuid,
            phase: CheckPhase::PoolMbs,
            repair_label: pool.delay_label(),
            label,
            label_seq,
            members,
        };
        let result = rpc::pool_mbs_remote(self.transport.as_ref(), &candidates, req, || {
            !pool.stop() && self.ins.sched_alive()
        })
        .await;
        match result {
            Ok(()) => Ok(()),
            Err(CheckError::Interrupted) => Ok(()),
            Err(err) => {
                pool.set_skip(true);
                let failed: Result<()> = Err(err.clone());
                self.post_repair(pool, &failed, true).await;
                if matches!(err, CheckError::Shutdown | CheckError::NotFound(_)) {
                    return Ok(());
                }
                Err(err)
            }
        }
    }

    /// Common repair epilogue: a failure raises the instance fail phase
    /// (fatal under failout), a finished pool's bookmark is settled, and the
    /// engines are told to drop the pool when asked to.
    async fn post_repair(&self, pool: &Arc<PoolRec>, result: &Result<()>, notify: bool) {
        let ins = &self.ins;
        let failout = ins.prop.lock().await.flags.failout;
        let failed = result.is_err();

        if failed {
            let phase = pool.bk.lock().await.phase;
            ins.set_fail_phase(phase);
            if failout {
                pool.set_skip(true);
            }
        }

        if pool.skip() || pool.destroyed() {
            let mut bk = pool.bk.lock().await;
            if failed {
                bk.status = PoolStatus::Failed;
            } else if pool.destroyed() {
                bk.phase = CheckPhase::Done;
                bk.status = PoolStatus::Checked;
            } else {
                bk.status = PoolStatus::Implicated;
            }
            bk.time.stop_time = Utc::now().timestamp();
            if let Err(err) = ins.store.update_pool(pool.uuid, &bk).await {
                tracing::warn!(pool = %pool.uuid, %err, "failed to update pool bookmark after repair");
            }
        }

        if (!failed || !failout) && notify {
            let gen = ins.gen().await;
            let (phase, status) = {
                let bk = pool.bk.lock().await;
                (bk.phase, bk.status)
            };
            let mut msg = IvMessage::pool(gen, pool.uuid, phase, status);
            msg.ins_status = Some(ins.bk.lock().await.status);
            msg.pool_destroyed = pool.destroyed();
            if self
                .iv
                .update(msg, IvSync::Eager, || !ins.pause())
                .await
                .is_ok()
            {
                pool.set_notified_exit(true);
            }
        }

        if let Err(err) = ins.store.update_leader(&*ins.bk.lock().await).await {
            tracing::warn!(%err, "cannot update leader bookmark after repair");
        }
    }
}

#[async_trait]
impl CheckHandler for CheckLeader {
    async fn handle(&self, req: CheckRequest) -> Result<CheckReply> {
        match req {
            CheckRequest::Report(mut body) => {
                self.report(&mut body.unit, false).await?;
                Ok(CheckReply::Report)
            }
            CheckRequest::Rejoin(body) => {
                let out = self.rejoin(body.gen, body.rank, body.iv_uuid).await?;
                Ok(CheckReply::Rejoin(out))
            }
            other => Err(CheckError::Invalid(format!(
                "leader does not serve {}",
                other.opcode()
            ))),
        }
    }

    async fn iv_refresh(&self, _iv: IvMessage) -> Result<()> {
        Err(CheckError::Invalid("leader does not take refreshes".into()))
    }

    async fn iv_update(&self, iv: IvMessage) -> Result<()> {
        if !iv.to_leader {
            return Err(CheckError::Invalid(
                "non-leader-bound update arrived at the root".into(),
            ));
        }
        self.notify(&iv).await
    }
}
