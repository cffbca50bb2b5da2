//! The check engine.
//!
//! One engine per rank. It serves the leader's collectives, classifies
//! pool-shard scope inconsistencies (pool-map entries vs local targets) and
//! container-scope inconsistencies (orphan containers, label conflicts),
//! repairs them through the pool store, and reports everything to the
//! leader, blocking on a pending record when the policy says interact.

use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use scour_core::bookmark::{InstanceBookmark, PoolBookmark, BK_MAGIC_ENGINE};
use scour_core::iv::{IvMessage, IvSync};
use scour_core::poolmap::{MapEntryState, PoolMap};
use scour_core::ports::{CheckHandler, ClusterTransport, PoolStore, SysDb};
use scour_core::report::ReportUnit;
use scour_core::rpc::{
    ActIn, CheckReply, CheckRequest, ContListIn, ContListOut, MarkIn, PoolMbsIn, PoolMbsOut,
    PoolShardInfo, PoolStartIn, QueryIn, QueryOut, RejoinIn, ReportIn, StartIn, StartOut, StopIn,
    StopOut,
};
use scour_core::types::{
    CheckPhase, InconsistClass, InstanceStatus, PoolStatus, Rank, RepairAction, StartDisposition,
    SvcStartMode, TargetState,
};
use scour_core::{CheckError, Result};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::instance::{Instance, Role, SweepProgress};
use crate::iv::IvPublisher;
use crate::pool::PoolRec;
use crate::rpc;
use crate::store::CheckStore;

const SCHED_TICK: Duration = Duration::from_millis(300);
const REJOIN_RETRY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Repaired,
    Ignored,
    Failed,
}

pub struct CheckEngine {
    ins: Arc<Instance>,
    transport: Arc<dyn ClusterTransport>,
    pool_store: Arc<dyn PoolStore>,
    iv: IvPublisher,
    lifecycle: Mutex<()>,
    /// Back-reference for the handler surface; workers need the owning Arc.
    self_ref: StdMutex<Weak<CheckEngine>>,
}

impl CheckEngine {
    /// Build the engine role for this rank. A bookmark left RUNNING by a
    /// crashed process is rewritten to PAUSED before anything else, which is
    /// also what arms the rejoin path.
    pub async fn new(
        rank: Rank,
        db: Arc<dyn SysDb>,
        transport: Arc<dyn ClusterTransport>,
        pool_store: Arc<dyn PoolStore>,
    ) -> Result<Arc<Self>> {
        let store = CheckStore::new(db);
        let mut bk = match store.fetch_engine().await? {
            Some(bk) => {
                if bk.magic != BK_MAGIC_ENGINE {
                    return Err(CheckError::Io(format!(
                        "engine bookmark magic mismatch: {:#x}",
                        bk.magic
                    )));
                }
                bk
            }
            None => InstanceBookmark::new(BK_MAGIC_ENGINE, 0, Uuid::nil()),
        };
        if bk.status == InstanceStatus::Running {
            bk.mark_stopped(InstanceStatus::Paused);
            store.update_engine(&bk).await?;
            tracing::info!(
                rank,
                gen = bk.gen,
                "engine bookmark found RUNNING at boot, paused"
            );
        }

        let ins = Instance::new(Role::Engine, rank, store, bk);
        if let Some((prop, ranks)) = match ins.store.fetch_property().await {
            Ok(found) => found,
            Err(CheckError::Io(msg)) => return Err(CheckError::Io(msg)),
            Err(_) => None,
        } {
            *ins.prop.lock().await = prop;
            *ins.ranks.lock().await = ranks;
        }
        ins.set_inited(true);

        let engine = Arc::new(Self {
            iv: IvPublisher::new(Arc::clone(&transport), rank),
            ins,
            transport,
            pool_store,
            lifecycle: Mutex::new(()),
            self_ref: StdMutex::new(Weak::new()),
        });
        *engine.self_ref.lock().unwrap() = Arc::downgrade(&engine);
        Ok(engine)
    }

    pub fn instance(&self) -> &Arc<Instance> {
        &self.ins
    }

    /// Wire the co-resident leader so `to_leader` IV updates bypass the bus.
    pub fn set_local_leader(&self, leader: Arc<dyn CheckHandler>) {
        self.iv.set_local_leader(leader);
    }

    async fn tally(&self, pool: &Arc<PoolRec>, outcome: Outcome) {
        let mut bk = pool.bk.lock().await;
        match outcome {
            Outcome::Repaired => bk.statistics.repaired += 1,
            Outcome::Ignored => bk.statistics.ignored += 1,
            Outcome::Failed => bk.statistics.failed += 1,
        }
    }

    async fn tally_total(&self, pool: &Arc<PoolRec>) {
        pool.bk.lock().await.statistics.total += 1;
    }

    async fn prop_snapshot(&self, class: InconsistClass) -> (RepairAction, bool, bool) {
        let prop = self.ins.prop.lock().await;
        (
            prop.policies.action_for(class),
            prop.flags.dryrun,
            prop.flags.auto,
        )
    }

    // ── start ─────────────────────────────────────────────────────

    async fn engine_start(self: &Arc<Self>, req: StartIn) -> Result<StartOut> {
        let _guard = self.lifecycle.lock().await;
        self.ins.can_start()?;
        self.ins.set_starting(true);
        let result = self.engine_start_inner(req).await;
        self.ins.set_starting(false);
        result
    }

    async fn engine_start_inner(self: &Arc<Self>, req: StartIn) -> Result<StartOut> {
        let ins = &self.ins;
        ins.set_started(false);
        ins.set_stopping(false);
        ins.set_sched_exiting(false);
        ins.set_pause(false);
        ins.set_for_orphan(false);
        ins.set_orphan_done(false);
        ins.set_implicated(false);
        ins.set_pool_stopped(false);
        *ins.slowest_fail_phase.lock().unwrap() = None;
        if let Some(old) = ins.take_sched() {
            old.abort();
        }

        let disposition = StartDisposition {
            reset_all: req.reset_all,
            reset_noncomp: req.reset_noncomp,
            orphan_pool: req.orphan_pool,
        };
        *ins.disposition.lock().unwrap() = disposition;

        // The leader co-resident on this rank has already persisted the
        // property and ranks; everyone else adopts them from the request.
        if req.leader == ins.rank {
            let (prop, ranks) = ins
                .store
                .fetch_property()
                .await?
                .ok_or_else(|| CheckError::NotFound("property".into()))?;
            *ins.prop.lock().await = prop;
            *ins.ranks.lock().await = ranks;
        } else {
            let mut ranks = req.ranks.clone();
            ranks.sort_unstable();
            ranks.dedup();
            {
                let mut prop = ins.prop.lock().await;
                prop.prepare(
                    req.leader,
                    req.flags,
                    req.phase_limit,
                    &req.policies,
                    ranks.len() as u32,
                )?;
                ins.store.update_property(&prop, &ranks).await?;
            }
            *ins.ranks.lock().await = ranks;
        }

        let min_phase = if disposition.reset_all {
            self.reset_pools(req.gen, &req.pools).await?;
            CheckPhase::Prepare
        } else if !req.pools.is_empty() {
            self.load_pool_list(req.gen, &req.pools, req.flags.reset, disposition.reset_noncomp)
                .await?
        } else {
            self.load_pools_from_store(req.gen, disposition.reset_noncomp)
                .await?
        };

        if ins.pools.read().await.is_empty() && !disposition.orphan_pool {
            return Ok(StartOut {
                nothing_to_do: true,
                clues: Vec::new(),
            });
        }

        {
            let mut bk = ins.bk.lock().await;
            if disposition.reset_all {
                *bk = InstanceBookmark::new(BK_MAGIC_ENGINE, req.gen, req.iv_uuid);
            }
            bk.gen = req.gen;
            bk.iv_uuid = req.iv_uuid;
            if bk.phase > min_phase || disposition.reset_all {
                bk.phase = if min_phase == CheckPhase::Done {
                    CheckPhase::Prepare
                } else {
                    min_phase
                };
            }
            if req.flags.reset {
                bk.statistics = Default::default();
                bk.time = Default::default();
            }
        }
        ins.reset_seq();

        self.start_post().await?;

        let clues = match self.collect_clues(disposition.orphan_pool).await {
            Ok(clues) => clues,
            Err(err) => {
                if let Ok(stopped) = ins.pool_stop_all(PoolStatus::Implicated).await {
                    for pool in stopped {
                        self.shutdown_pool(&pool).await;
                    }
                }
                let mut bk = ins.bk.lock().await;
                if bk.status == InstanceStatus::Running {
                    bk.mark_stopped(InstanceStatus::Failed);
                    let _ = ins.store.update_engine(&bk).await;
                }
                return Err(err);
            }
        };

        ins.set_sched_running(true);
        let this = Arc::clone(self);
        ins.attach_sched(tokio::spawn(async move { this.sched().await }));
        ins.set_started(true);
        ins.notify.notify_waiters();

        let pools_len = ins.pools.read().await.len();
        tracing::info!(
            rank = ins.rank,
            gen = req.gen,
            pools = pools_len,
            "engine started check instance"
        );
        Ok(StartOut {
            nothing_to_do: false,
            clues,
        })
    }

    /// Reset path: every pool bookmark is dropped, then pools are reloaded
    /// from the caller's list or the local directory sets.
    async fn reset_pools(&self, gen: u64, pools: &[Uuid]) -> Result<()> {
        self.ins.cleanup_all_pools().await?;
        let uuids = if pools.is_empty() {
            self.pool_store.local_pools().await?
        } else {
            let mut kept = Vec::new();
            for &uuid in pools {
                if self.pool_store.pool_exists(uuid).await? {
                    kept.push(uuid);
                }
            }
            kept
        };
        let mut registry = self.ins.pools.write().await;
        for uuid in uuids {
            registry
                .add_shard(uuid, self.ins.rank, Some(PoolBookmark::new(gen)), None)
                .await;
        }
        Ok(())
    }

    /// Load the caller's pool list. Unlike the leader, a pool that already
    /// finished is still loaded, otherwise it would look dangling later.
    async fn load_pool_list(
        &self,
        gen: u64,
        pools: &[Uuid],
        reset: bool,
        reset_noncomp: bool,
    ) -> Result<CheckPhase> {
        let mut min_phase = CheckPhase::Done;
        for &uuid in pools {
            if !self.pool_store.pool_exists(uuid).await? {
                continue;
            }
            let mut bk = match self.ins.store.fetch_pool(uuid).await? {
                Some(bk) if !reset => bk,
                _ => PoolBookmark::new(gen),
            };
            if reset_noncomp && bk.phase != CheckPhase::Done {
                bk = PoolBookmark::new(gen);
            }
            bk.gen = gen;
            if bk.phase < min_phase {
                min_phase = bk.phase;
            }
            self.ins
                .pools
                .write()
                .await
                .add_shard(uuid, self.ins.rank, Some(bk), None)
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
            if !self.pool_store.pool_exists(uuid).await? {
                continue;
            }
            if reset_noncomp {
                bk = PoolBookmark::new(gen);
            }
            bk.gen = gen;
            if bk.phase < min_phase {
                min_phase = bk.phase;
            }
            self.ins
                .pools
                .write()
                .await
                .add_shard(uuid, self.ins.rank, Some(bk), None)
                .await;
        }
        Ok(min_phase)
    }

    /// Persist per-pool CHECKING marks and the RUNNING instance bookmark,
    /// then make sure no pool service from a former instance is left open.
    async fn start_post(&self) -> Result<()> {
        let ins = &self.ins;
        let pools = ins.pools.read().await.snapshot();
        let mut phase = CheckPhase::Done;
        let gen = ins.gen().await;

        for pool in &pools {
            let mut bk = pool.bk.lock().await;
            if bk.phase == CheckPhase::Done {
                pool.set_done(true);
                continue;
            }
            if bk.phase < phase {
                phase = bk.phase;
            }
            bk.gen = gen;
            bk.mark_checking();
            ins.store.update_pool(pool.uuid, &bk).await?;
        }

        {
            let mut bk = ins.bk.lock().await;
            // New pools may sit behind the engine's recorded phase; the
            // instance phase is allowed to move backwards here.
            bk.phase = if phase == CheckPhase::Done {
                CheckPhase::Prepare
            } else {
                phase
            };
            bk.mark_running();
            ins.store.update_engine(&bk).await?;
        }

        for pool in &pools {
            let _ = self.pool_store.stop_svc(pool.uuid).await;
        }
        Ok(())
    }

    /// Build this rank's clue for every locally present pool. Pools outside
    /// the check list are reported with no phase when orphan processing is
    /// on; otherwise they are left alone.
    async fn collect_clues(&self, orphan_pool: bool) -> Result<Vec<scour_core::clue::PoolClue>> {
        let mut clues = Vec::new();
        for uuid in self.pool_store.local_pools().await? {
            let phase = match self.ins.pools.read().await.get(&uuid) {
                Some(pool) => Some(pool.bk.lock().await.phase),
                None if orphan_pool => None,
                None => continue,
            };
            clues.push(self.pool_store.collect_clue(uuid, phase).await?);
        }
        Ok(clues)
    }

    // ── stop / query / mark / act ─────────────────────────────────

    async fn engine_stop(&self, req: StopIn) -> Result<StopOut> {
        let _guard = self.lifecycle.lock().await;
        let ins = &self.ins;
        let bk = ins.bk.lock().await.clone();
        if req.gen != 0 && req.gen != bk.gen {
            return Err(CheckError::NotApplicable);
        }
        if ins.starting() {
            return Err(CheckError::Busy);
        }
        if ins.stopping() || ins.sched_exiting() {
            return Err(CheckError::InProgress);
        }
        if bk.status != InstanceStatus::Running {
            return Err(CheckError::Already);
        }

        ins.set_stopping(true);
        let result = self.engine_stop_inner(&req).await;
        ins.set_pool_stopped(false);
        ins.set_stopping(false);
        result
    }

    async fn engine_stop_inner(&self, req: &StopIn) -> Result<StopOut> {
        let ins = &self.ins;
        let stopped = if req.pools.is_empty() {
            for pool in ins.pool_stop_all(PoolStatus::Stopped).await? {
                self.shutdown_pool(&pool).await;
            }
            ins.pool_stopped()
        } else {
            for &uuid in &req.pools {
                if let Some(pool) = ins.pool_stop_one(uuid, PoolStatus::Stopped, None).await? {
                    self.shutdown_pool(&pool).await;
                }
            }
            ins.pool_stopped()
        };

        let active = {
            let pools = ins.pools.read().await.snapshot();
            pools
                .iter()
                .any(|pool| !pool.done() && !pool.skip() && !pool.stop())
        };
        if !active {
            self.stop_sched().await;
        }

        Ok(StopOut {
            pool_stopped: stopped,
        })
    }

    /// Engine-side teardown of a stopped pool: the local pool service stays
    /// up only for a fully checked pool with an exportable service.
    async fn shutdown_pool(&self, pool: &Arc<PoolRec>) {
        let status = pool.bk.lock().await.status;
        if status != PoolStatus::Checked || pool.not_export_ps() {
            let _ = self.pool_store.stop_svc(pool.uuid).await;
            pool.set_started(false);
            pool.set_start_post(false);
        }
    }

    async fn engine_query(&self, req: QueryIn) -> Result<QueryOut> {
        let ins = &self.ins;
        let bk = ins.bk.lock().await.clone();
        if req.gen != 0 && req.gen != bk.gen {
            return Err(CheckError::NotApplicable);
        }

        let wanted = |uuid: &Uuid| req.pools.is_empty() || req.pools.contains(uuid);
        let mut shards = Vec::new();
        for uuid in ins.store.pool_keys().await? {
            if !wanted(&uuid) {
                continue;
            }
            let Some(pool_bk) = ins.store.fetch_pool(uuid).await? else {
                continue;
            };
            let targets = self.pool_store.target_states(uuid).await.unwrap_or_default();
            shards.push(PoolShardInfo {
                pool: uuid,
                rank: ins.rank,
                status: pool_bk.status,
                phase: pool_bk.phase,
                statistics: pool_bk.statistics,
                time: pool_bk.time,
                targets,
            });
        }

        Ok(QueryOut {
            gen: bk.gen,
            status: bk.status,
            phase: bk.phase,
            shards,
        })
    }

    async fn engine_mark(&self, req: MarkIn) -> Result<()> {
        let ins = &self.ins;
        if req.gen != ins.gen().await {
            return Err(CheckError::NotApplicable);
        }
        {
            let mut ranks = ins.ranks.lock().await;
            let before = ranks.len();
            ranks.retain(|&rank| rank != req.rank);
            if ranks.len() == before {
                return Ok(());
            }
        }
        let ranks = ins.ranks.lock().await.clone();
        {
            let mut prop = ins.prop.lock().await;
            prop.rank_count = ranks.len() as u32;
            ins.store.update_property(&prop, &ranks).await?;
        }
        self.transport.update_group(&ranks, req.group_version).await?;
        tracing::info!(rank = req.rank, version = req.group_version, "engine marked rank dead");
        Ok(())
    }

    async fn engine_act(&self, req: ActIn) -> Result<()> {
        let ins = &self.ins;
        if req.gen != ins.gen().await {
            return Err(CheckError::NotApplicable);
        }
        if ins.bk.lock().await.status != InstanceStatus::Running {
            return Err(CheckError::NotApplicable);
        }

        let found = self.act_one(req.seq, req.action).await;
        if !req.for_all {
            return found;
        }

        {
            let mut prop = ins.prop.lock().await;
            if prop.policies.action_for(req.class) != req.action {
                prop.policies.set(req.class, req.action);
                let ranks = ins.ranks.lock().await.clone();
                ins.store.update_property(&prop, &ranks).await?;
            }
        }

        let pools = ins.pools.read().await.snapshot();
        for pool in pools {
            for rec in pool.pending_snapshot() {
                if rec.class == req.class && rec.is_interact() {
                    let _ = self.act_one(rec.seq, req.action).await;
                }
            }
        }
        Ok(())
    }

    async fn act_one(&self, seq: u64, action: RepairAction) -> Result<()> {
        let rec = {
            let mut pending = self.ins.pending.write().await;
            pending.del(seq)
        };
        match rec {
            Some(rec) => {
                rec.decide(action);
                Ok(())
            }
            None => Err(CheckError::NotFound(format!(
                "no pending report with seq {seq:#x}"
            ))),
        }
    }

    async fn engine_cont_list(&self, req: ContListIn) -> Result<ContListOut> {
        if req.gen != self.ins.gen().await {
            return Err(CheckError::NotApplicable);
        }
        Ok(ContListOut {
            conts: self.pool_store.shard_containers(req.pool).await?,
        })
    }

    // ── pool start / pool mbs ─────────────────────────────────────

    async fn engine_pool_start(&self, req: PoolStartIn) -> Result<()> {
        let ins = &self.ins;
        if req.gen != ins.gen().await {
            return Err(CheckError::NotApplicable);
        }
        if ins.bk.lock().await.status != InstanceStatus::Running {
            return Err(CheckError::Shutdown);
        }

        let pool = ins.pools.read().await.get(&req.pool);
        let pool = match pool {
            Some(pool) => pool,
            None => {
                if !req.flags.for_orphan {
                    return Err(CheckError::NotFound(format!("pool {}", req.pool)));
                }
                if !self.pool_store.pool_exists(req.pool).await? {
                    return Err(CheckError::NotFound(format!("pool {}", req.pool)));
                }
                let mut bk = match ins.store.fetch_pool(req.pool).await? {
                    Some(bk) => bk,
                    None => {
                        let mut bk = PoolBookmark::new(req.gen);
                        bk.mark_checking();
                        bk
                    }
                };
                bk.gen = req.gen;
                ins.pools
                    .write()
                    .await
                    .add_shard(req.pool, ins.rank, Some(bk), None)
                    .await
            }
        };

        if pool.stop() {
            return Err(CheckError::Shutdown);
        }

        if !pool.started() {
            if req.flags.not_export_ps {
                pool.set_not_export_ps(true);
            }

            if let Err(err) = self.pool_store.start_shard(req.pool).await {
                let phase = pool.bk.lock().await.phase.max(req.phase);
                if matches!(err, CheckError::NotFound(_)) {
                    let _ = ins
                        .pool_stop_one(req.pool, PoolStatus::Checked, Some(CheckPhase::Done))
                        .await;
                    return Ok(());
                }
                ins.set_fail_phase(phase);
                if let Ok(Some(stopped)) =
                    ins.pool_stop_one(req.pool, PoolStatus::Failed, None).await
                {
                    self.shutdown_pool(&stopped).await;
                }
                return Err(err);
            }

            {
                let mut bk = pool.bk.lock().await;
                if bk.phase < req.phase {
                    bk.advance(req.phase);
                    if let Err(err) = ins.store.update_pool(req.pool, &bk).await {
                        drop(bk);
                        let _ = self.pool_store.stop_shard(req.pool).await;
                        return Err(err);
                    }
                }
            }
            pool.set_started(true);
        }

        if let Some(mode) = req.svc_mode {
            if req.svc_ranks.contains(&ins.rank) {
                self.pool_store.start_svc(req.pool, mode).await?;
            }
        }

        Ok(())
    }

    async fn engine_pool_mbs(self: &Arc<Self>, req: PoolMbsIn) -> Result<PoolMbsOut> {
        let ins = &self.ins;
        if req.gen != ins.gen().await {
            return Err(CheckError::NotApplicable);
        }
        if ins.bk.lock().await.status != InstanceStatus::Running {
            return Err(CheckError::Shutdown);
        }

        match self.pool_store.svc_leader(req.pool).await? {
            Some(leader) if leader == ins.rank => {}
            Some(leader) => {
                return Ok(PoolMbsOut {
                    svc_hint: Some(leader),
                })
            }
            None => return Err(CheckError::NotLeader),
        }

        let pool = ins
            .pools
            .read()
            .await
            .get(&req.pool)
            .ok_or_else(|| CheckError::NotFound(format!("pool {}", req.pool)))?;
        if pool.stop() {
            return Err(CheckError::Shutdown);
        }

        {
            let mut state = pool.state.lock().await;
            if !state.members.is_empty() {
                // Resent request; the worker is already on it.
                return Ok(PoolMbsOut { svc_hint: None });
            }
            state.members = req.members.clone();
            state.label = req.label.clone();
            state.label_seq = req.label_seq;
        }
        if req.repair_label {
            pool.set_delay_label(true);
        }

        {
            let mut bk = pool.bk.lock().await;
            if bk.phase < req.phase {
                bk.advance(req.phase);
                if let Err(err) = ins.store.update_pool(req.pool, &bk).await {
                    drop(bk);
                    self.fail_pool_mbs(&pool, req.phase).await;
                    return Err(err);
                }
            }
        }

        let this = Arc::clone(self);
        let pool_clone = Arc::clone(&pool);
        pool.attach_worker(tokio::spawn(async move {
            this.pool_worker(pool_clone).await;
        }));

        Ok(PoolMbsOut { svc_hint: None })
    }

    async fn fail_pool_mbs(&self, pool: &Arc<PoolRec>, phase: CheckPhase) {
        {
            let mut state = pool.state.lock().await;
            state.members.clear();
        }
        pool.set_delay_label(false);
        let cur = pool.bk.lock().await.phase;
        self.ins.set_fail_phase(cur.max(phase));
        if let Ok(Some(stopped)) = self
            .ins
            .pool_stop_one(pool.uuid, PoolStatus::Failed, None)
            .await
        {
            self.shutdown_pool(&stopped).await;
        }
    }

    // ── report pathway ────────────────────────────────────────────

    /// Send a report to the leader. For an interactive report the caller is
    /// parked on a pending record until the operator answers; the chosen
    /// action comes back as the decision.
    async fn report(&self, unit: &mut ReportUnit) -> Result<Option<RepairAction>> {
        let ins = &self.ins;
        let interactive = unit.action == RepairAction::Interact;
        let pool_uuid = unit
            .pool
            .ok_or_else(|| CheckError::Invalid("engine report without pool".into()))?;
        let leader = ins.prop.lock().await.leader;

        loop {
            if unit.seq == 0 {
                unit.seq = ins.next_seq();
            }

            let pending = if interactive {
                let pool = ins
                    .pools
                    .read()
                    .await
                    .get(&pool_uuid)
                    .ok_or_else(|| CheckError::NotFound(format!("pool {pool_uuid}")))?;
                let rec = {
                    let mut table = ins.pending.write().await;
                    match table.add(pool_uuid, unit.seq, unit.rank, unit.class) {
                        Ok(rec) => rec,
                        Err(CheckError::Again) => {
                            unit.seq = 0;
                            continue;
                        }
                        Err(err) => return Err(err),
                    }
                };
                pool.add_pending(Arc::clone(&rec));
                Some((pool, rec))
            } else {
                None
            };

            let sent = rpc::unicast_retry(
                self.transport.as_ref(),
                leader,
                CheckRequest::Report(ReportIn { unit: unit.clone() }),
                || !ins.pause(),
            )
            .await;

            match sent {
                Err(CheckError::Again) => {
                    // The leader saw a sequence collision; regenerate.
                    if let Some((pool, rec)) = pending {
                        pool.remove_pending(rec.seq);
                        ins.pending.write().await.del(rec.seq);
                    }
                    unit.seq = 0;
                    continue;
                }
                Err(err) => {
                    if let Some((pool, rec)) = pending {
                        pool.remove_pending(rec.seq);
                        ins.pending.write().await.del(rec.seq);
                    }
                    return Err(err);
                }
                Ok(_) => {}
            }

            let Some((pool, rec)) = pending else {
                return Ok(None);
            };

            if rec.is_interact() {
                let mut bk = pool.bk.lock().await;
                if bk.status == PoolStatus::Checking {
                    bk.status = PoolStatus::Pending;
                }
            }

            tracing::info!(
                rank = ins.rank,
                seq = rec.seq,
                class = %rec.class,
                "engine waits for interaction"
            );
            let decision = rec.wait(|| ins.sched_alive()).await;

            {
                let mut bk = pool.bk.lock().await;
                if bk.status == PoolStatus::Pending {
                    bk.status = PoolStatus::Checking;
                }
            }
            pool.remove_pending(rec.seq);
            ins.pending.write().await.del(rec.seq);

            return decision.map(Some);
        }
    }

    /// Publish a pool's phase/status both to the other pool shards and to
    /// the leader.
    async fn pool_notify(&self, pool: &Arc<PoolRec>) {
        let ins = &self.ins;
        let (gen, ins_status) = {
            let bk = ins.bk.lock().await;
            (bk.gen, bk.status)
        };
        let (phase, status) = {
            let bk = pool.bk.lock().await;
            (bk.phase, bk.status)
        };

        let mut msg = IvMessage::pool(gen, pool.uuid, phase, status);
        msg.ins_status = Some(ins_status);
        msg.from_ps_leader = true;
        if let Err(err) = self
            .iv
            .update(msg.clone(), IvSync::Eager, || !ins.pause())
            .await
        {
            tracing::warn!(pool = %pool.uuid, %err, "failed to notify pool shards");
        }

        msg.from_ps_leader = false;
        msg.to_leader = true;
        if let Err(err) = self.iv.update(msg, IvSync::Lazy, || !ins.pause()).await {
            tracing::warn!(pool = %pool.uuid, %err, "failed to notify check leader");
        }
    }

    // ── engine pool worker ────────────────────────────────────────

    async fn pool_worker(self: Arc<Self>, pool: Arc<PoolRec>) {
        let ins = &self.ins;
        tracing::info!(rank = ins.rank, pool = %pool.uuid, "engine pool worker enters");

        let rc = self.pool_worker_inner(&pool).await;

        // An external stop owns the bookkeeping; otherwise settle the final
        // state and publish it.
        if !pool.stop() {
            let (snapshot, update) = {
                let mut bk = pool.bk.lock().await;
                let update = match &rc {
                    Err(err) if !matches!(err, CheckError::Interrupted) => {
                        bk.status = PoolStatus::Failed;
                        true
                    }
                    _ if bk.phase != CheckPhase::Done => {
                        bk.status = PoolStatus::Checked;
                        bk.advance(CheckPhase::Done);
                        true
                    }
                    _ => {
                        bk.status = PoolStatus::Checked;
                        false
                    }
                };
                bk.time.stop_time = Utc::now().timestamp();
                (bk.clone(), update)
            };
            if update {
                if let Err(err) = ins.store.update_pool(pool.uuid, &snapshot).await {
                    tracing::warn!(pool = %pool.uuid, %err, "failed to settle pool bookmark");
                }
            }
            self.pool_notify(&pool).await;

            let status = pool.bk.lock().await.status;
            if status == PoolStatus::Checked && !pool.not_export_ps() {
                match self.pool_store.export_svc(pool.uuid).await {
                    Ok(()) => {
                        pool.set_started(true);
                        pool.set_start_post(true);
                    }
                    Err(err) => {
                        tracing::warn!(pool = %pool.uuid, %err, "cannot export pool service after check");
                    }
                }
            }
        }

        pool.set_done(true);
        if ins.sched_alive() {
            let status = pool.bk.lock().await.status;
            if status != PoolStatus::Checked || pool.not_export_ps() {
                ins.queue_shutdown(Arc::clone(&pool));
            }
        }
        tracing::info!(
            rank = ins.rank,
            pool = %pool.uuid,
            ok = rc.is_ok(),
            "engine pool worker exits"
        );
    }

    async fn pool_worker_inner(&self, pool: &Arc<PoolRec>) -> Result<()> {
        let ins = &self.ins;
        let gen = ins.gen().await;

        if pool.stop() {
            return Ok(());
        }

        let start_phase = pool.bk.lock().await.phase;
        if start_phase <= CheckPhase::PoolCleanup {
            if start_phase < CheckPhase::PoolCleanup {
                let snapshot = {
                    let mut bk = pool.bk.lock().await;
                    bk.advance(CheckPhase::PoolCleanup);
                    bk.clone()
                };
                ins.store.update_pool(pool.uuid, &snapshot).await?;
                self.pool_notify(pool).await;
                if pool.stop() {
                    return Ok(());
                }
            }

            let mut map = self.pool_store.load_map(pool.uuid).await?;
            let members = pool.state.lock().await.members.clone();
            for member in &members {
                if pool.stop() {
                    return Ok(());
                }
                self.pool_mbs_one(pool, &mut map, member).await?;
                if pool.skip() || pool.stop() {
                    return Ok(());
                }
            }

            self.find_dangling_map_entries(pool, &mut map).await?;
            if pool.skip() || pool.stop() {
                return Ok(());
            }

            if pool.map_refreshed() {
                if ins.prop.lock().await.flags.dryrun {
                    // The changed map cannot be made durable, so everything
                    // downstream of it has to be skipped.
                    pool.set_skip(true);
                    return Ok(());
                }
                self.pool_store.flush_map(pool.uuid, &map).await?;
                if pool.skip() || pool.stop() {
                    return Ok(());
                }
            }

            if pool.delay_label() {
                self.bad_pool_label(pool).await?;
                if pool.skip() || pool.stop() {
                    return Ok(());
                }
            }

            // Old connections predate the repairs; drop them, best effort.
            let _ = self.pool_store.evict_connections(pool.uuid).await;
            if pool.stop() {
                return Ok(());
            }
        }

        if pool.bk.lock().await.phase < CheckPhase::ContList {
            let snapshot = {
                let mut bk = pool.bk.lock().await;
                bk.advance(CheckPhase::ContList);
                bk.clone()
            };
            ins.store.update_pool(pool.uuid, &snapshot).await?;
            self.pool_notify(pool).await;
            if pool.stop() {
                return Ok(());
            }
        }

        if pool.bk.lock().await.phase > CheckPhase::ContCleanup {
            return Ok(());
        }

        // Collect container uuids from every pool shard. A rejoin-resumed
        // pool has no membership table; ask the whole instance group then.
        let live = ins.ranks.lock().await.clone();
        let shard_ranks: Vec<Rank> = {
            let state = pool.state.lock().await;
            if state.members.is_empty() {
                live
            } else {
                state
                    .members
                    .iter()
                    .map(|member| member.rank)
                    .filter(|rank| live.contains(rank))
                    .collect()
            }
        };
        let mut conts = rpc::cont_list_remote(
            self.transport.as_ref(),
            &shard_ranks,
            ContListIn {
                gen,
                rank: ins.rank,
                pool: pool.uuid,
            },
        )
        .await?;
        conts.sort_unstable();
        conts.dedup();
        if pool.stop() {
            return Ok(());
        }

        if pool.bk.lock().await.phase < CheckPhase::ContCleanup {
            let snapshot = {
                let mut bk = pool.bk.lock().await;
                bk.advance(CheckPhase::ContCleanup);
                bk.clone()
            };
            ins.store.update_pool(pool.uuid, &snapshot).await?;
            self.pool_notify(pool).await;
            if pool.stop() {
                return Ok(());
            }
        }

        self.cont_cleanup(pool, &conts).await?;
        if pool.stop() {
            return Ok(());
        }

        // Membership may have changed during the cleanup; let the pool
        // service reconcile it in the background.
        self.pool_store.schedule_reconf(pool.uuid).await?;
        Ok(())
    }

    /// Cross-check one member's targets against the pool map.
    async fn pool_mbs_one(
        &self,
        pool: &Arc<PoolRec>,
        map: &mut PoolMap,
        member: &scour_core::rpc::PoolMember,
    ) -> Result<()> {
        let mut targets = member.targets.clone();

        let Some(dom_idx) = map.domains.iter().position(|dom| dom.rank == member.rank) else {
            // The whole rank is unknown to the map.
            return self.pm_orphan(pool, member.rank, None).await;
        };

        let target_count = map.domains[dom_idx].targets.len();
        for tgt_idx in 0..target_count {
            let (state, index) = {
                let tgt = &map.domains[dom_idx].targets[tgt_idx];
                (tgt.state, tgt.index)
            };
            let local = targets.get(index as usize).copied();

            match state {
                MapEntryState::Down | MapEntryState::DownOut => {
                    if matches!(local, Some(TargetState::Normal) | Some(TargetState::Empty)) {
                        self.pm_orphan(pool, member.rank, Some(index)).await?;
                    }
                }
                MapEntryState::New => {
                    if matches!(local, None | Some(TargetState::Nonexist) | Some(TargetState::Empty))
                    {
                        // Dangling new entry: it never held data.
                        self.pm_dangling(pool, map, dom_idx, Some(tgt_idx), MapEntryState::DownOut)
                            .await?;
                    }
                }
                MapEntryState::Up | MapEntryState::UpIn | MapEntryState::Drain => {
                    if matches!(local, None | Some(TargetState::Nonexist) | Some(TargetState::Empty))
                    {
                        // Data may have lived there: mark DOWN and leave the
                        // rest to the rebuild subsystem.
                        self.pm_dangling(pool, map, dom_idx, Some(tgt_idx), MapEntryState::Down)
                            .await?;
                    }
                }
                MapEntryState::Unknown => {
                    self.pm_unknown_target(pool, member.rank, index).await?;
                }
            }

            if pool.skip() || pool.stop() {
                return Ok(());
            }
            if let Some(slot) = targets.get_mut(index as usize) {
                // Consume the pairing so the leftover scan below only sees
                // genuinely orphan targets.
                *slot = TargetState::Nonexist;
            }
            map.domains[dom_idx].targets[tgt_idx].checked = true;
        }
        map.domains[dom_idx].checked = true;

        for (index, state) in targets.iter().enumerate() {
            if matches!(state, TargetState::Normal | TargetState::Empty) {
                self.pm_orphan(pool, member.rank, Some(index as u32)).await?;
                if pool.skip() || pool.stop() {
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    /// Scan pool-map entries that no member claimed: dangling subtrees.
    async fn find_dangling_map_entries(&self, pool: &Arc<PoolRec>, map: &mut PoolMap) -> Result<()> {
        let dom_count = map.domains.len();
        for dom_idx in 0..dom_count {
            {
                let dom = &map.domains[dom_idx];
                if dom.checked || dom.state.is_down() {
                    continue;
                }
            }

            let mut down = false;
            let target_count = map.domains[dom_idx].targets.len();
            for tgt_idx in 0..target_count {
                let state = map.domains[dom_idx].targets[tgt_idx].state;
                match state {
                    MapEntryState::Down => down = true,
                    MapEntryState::DownOut => {}
                    MapEntryState::New => {
                        self.pm_dangling(pool, map, dom_idx, Some(tgt_idx), MapEntryState::DownOut)
                            .await?;
                    }
                    _ => {
                        down = true;
                        self.pm_dangling(pool, map, dom_idx, Some(tgt_idx), MapEntryState::Down)
                            .await?;
                    }
                }
                if pool.skip() || pool.stop() {
                    return Ok(());
                }
                map.domains[dom_idx].targets[tgt_idx].checked = true;
            }

            // The parent domain dangles with its targets.
            self.pm_dangling(
                pool,
                map,
                dom_idx,
                None,
                if down {
                    MapEntryState::Down
                } else {
                    MapEntryState::DownOut
                },
            )
            .await?;
            if pool.skip() || pool.stop() {
                return Ok(());
            }
            map.domains[dom_idx].checked = true;
        }
        Ok(())
    }

    /// A target (or a whole rank) holds storage the pool map does not know
    /// about. Default discards the orphan shard to release space.
    async fn pm_orphan(&self, pool: &Arc<PoolRec>, rank: Rank, index: Option<u32>) -> Result<()> {
        let class = match index {
            None => InconsistClass::EngineNonexistInMap,
            Some(_) => InconsistClass::EngineDownInMap,
        };
        let (policy, dryrun, auto) = self.prop_snapshot(class).await;
        let gen = self.ins.gen().await;
        let label = pool.state.lock().await.label.clone();
        self.tally_total(pool).await;

        let mut action = policy;
        loop {
            let mut unit = ReportUnit::new(gen, class, RepairAction::Interact, self.ins.rank);
            unit.pool = Some(pool.uuid);
            unit.pool_label = label.clone();
            unit.target = index;
            unit.msg = format!(
                "Check engine detects orphan {} entry in pool map for {}, rank {}, index {:?}",
                if index.is_none() { "rank" } else { "target" },
                pool.uuid,
                rank,
                index
            );

            match action {
                RepairAction::Default | RepairAction::TrustPs | RepairAction::Discard => {
                    unit.action = RepairAction::Discard;
                    let result = if dryrun {
                        self.tally(pool, Outcome::Repaired).await;
                        Ok(())
                    } else {
                        match self.pool_store.destroy_shard(pool.uuid, rank, index).await {
                            Ok(()) => {
                                self.tally(pool, Outcome::Repaired).await;
                                Ok(())
                            }
                            Err(err) => {
                                self.tally(pool, Outcome::Failed).await;
                                Err(err)
                            }
                        }
                    };
                    unit.result = result.as_ref().err().map(|err| err.to_string());
                    self.report(&mut unit).await?;
                    // Later checks never touch the orphan entry, so failing
                    // to repair it does not poison the pool.
                    return self.post_repair(pool, result).await;
                }
                RepairAction::Ignore => {
                    unit.action = RepairAction::Ignore;
                    self.tally(pool, Outcome::Ignored).await;
                    self.report(&mut unit).await?;
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
                        "Discard the orphan pool shard to release space [suggested].".into(),
                        "Keep the orphan pool shard on engine, repair nothing.".into(),
                    ];
                    match self.report(&mut unit).await {
                        Ok(Some(decision)) => {
                            action = match decision {
                                RepairAction::Discard => RepairAction::Discard,
                                _ => RepairAction::Ignore,
                            };
                        }
                        Ok(None) => return Ok(()),
                        Err(CheckError::Interrupted) => return Err(CheckError::Interrupted),
                        Err(err) => {
                            self.tally(pool, Outcome::Failed).await;
                            return self.post_repair(pool, Err(err)).await;
                        }
                    }
                }
            }
        }
    }

    /// A pool-map entry claims storage that no target actually has. Default
    /// trusts the targets and marks the entry down in the map.
    async fn pm_dangling(
        &self,
        pool: &Arc<PoolRec>,
        map: &mut PoolMap,
        dom_idx: usize,
        tgt_idx: Option<usize>,
        mark: MapEntryState,
    ) -> Result<()> {
        let class = InconsistClass::EngineHasNoStorage;
        let (policy, _dryrun, auto) = self.prop_snapshot(class).await;
        let gen = self.ins.gen().await;
        let label = pool.state.lock().await.label.clone();
        let (rank, index) = {
            let dom = &map.domains[dom_idx];
            (
                dom.rank,
                tgt_idx.map(|idx| dom.targets[idx].index),
            )
        };
        self.tally_total(pool).await;

        let mut action = policy;
        loop {
            let mut unit = ReportUnit::new(gen, class, RepairAction::Interact, self.ins.rank);
            unit.pool = Some(pool.uuid);
            unit.pool_label = label.clone();
            unit.target = index;
            unit.msg = format!(
                "Check engine detects dangling {} entry in pool map for pool {}, rank {}, index {:?}, (want) mark as {:?}",
                if tgt_idx.is_none() { "rank" } else { "target" },
                pool.uuid,
                rank,
                index,
                mark
            );

            match action {
                RepairAction::Default | RepairAction::TrustTarget => {
                    unit.action = RepairAction::TrustTarget;
                    // Dryrun repairs stay in memory only; the flush step is
                    // what would have made them durable.
                    pool.set_map_refreshed(true);
                    let version = map.bump_version();
                    match tgt_idx {
                        Some(idx) => {
                            let tgt = &mut map.domains[dom_idx].targets[idx];
                            tgt.state = mark;
                            tgt.fseq = version;
                        }
                        None => map.domains[dom_idx].state = mark,
                    }
                    self.tally(pool, Outcome::Repaired).await;
                    self.report(&mut unit).await?;
                    return Ok(());
                }
                RepairAction::Ignore => {
                    unit.action = RepairAction::Ignore;
                    self.tally(pool, Outcome::Ignored).await;
                    // An unrepaired dangling entry poisons every later
                    // map-based check; skip the pool.
                    pool.set_skip(true);
                    self.report(&mut unit).await?;
                    return Ok(());
                }
                _ => {
                    if auto {
                        action = RepairAction::Ignore;
                        continue;
                    }
                    unit.action = RepairAction::Interact;
                    unit.options = vec![RepairAction::TrustTarget, RepairAction::Ignore];
                    unit.details = vec![
                        format!("Change pool map for the dangling map entry as {mark:?} [suggested]."),
                        "Keep the dangling map entry in pool map, repair nothing.".into(),
                    ];
                    match self.report(&mut unit).await {
                        Ok(Some(decision)) => {
                            action = match decision {
                                RepairAction::TrustTarget => RepairAction::TrustTarget,
                                _ => RepairAction::Ignore,
                            };
                        }
                        Ok(None) => return Ok(()),
                        Err(CheckError::Interrupted) => return Err(CheckError::Interrupted),
                        Err(err) => {
                            self.tally(pool, Outcome::Failed).await;
                            pool.set_skip(true);
                            return self.post_repair(pool, Err(err)).await;
                        }
                    }
                }
            }
        }
    }

    /// A pool-map entry whose status the checker does not recognise, maybe
    /// a downgrade artefact. Report it and leave the pool alone.
    async fn pm_unknown_target(&self, pool: &Arc<PoolRec>, rank: Rank, index: u32) -> Result<()> {
        let gen = self.ins.gen().await;
        self.tally_total(pool).await;
        self.tally(pool, Outcome::Ignored).await;
        pool.set_skip(true);

        let mut unit = ReportUnit::new(
            gen,
            InconsistClass::Unknown,
            RepairAction::Ignore,
            self.ins.rank,
        );
        unit.pool = Some(pool.uuid);
        unit.pool_label = pool.state.lock().await.label.clone();
        unit.target = Some(index);
        unit.msg = format!(
            "Check engine detects unknown target entry in pool map for pool {}, rank {rank}, index {index}, skip it.",
            pool.uuid
        );
        self.report(&mut unit).await?;
        Ok(())
    }

    /// Deferred pool-label repair: write the MS label into the PS copy.
    async fn bad_pool_label(&self, pool: &Arc<PoolRec>) -> Result<()> {
        let class = InconsistClass::PoolBadLabel;
        let (_, dryrun, _) = self.prop_snapshot(class).await;
        let gen = self.ins.gen().await;
        let (ms_label, label_seq) = {
            let state = pool.state.lock().await;
            (state.label.clone(), state.label_seq)
        };
        let ps_label = self.pool_store.ps_label(pool.uuid).await.unwrap_or(None);
        self.tally_total(pool).await;

        let result = if dryrun {
            self.tally(pool, Outcome::Repaired).await;
            Ok(())
        } else {
            match self
                .pool_store
                .update_ps_label(pool.uuid, ms_label.as_deref())
                .await
            {
                Ok(()) => {
                    self.tally(pool, Outcome::Repaired).await;
                    Ok(())
                }
                Err(err) => {
                    self.tally(pool, Outcome::Failed).await;
                    Err(err)
                }
            }
        };

        let mut unit = ReportUnit::new(gen, class, RepairAction::TrustMs, self.ins.rank);
        unit.seq = label_seq;
        unit.pool = Some(pool.uuid);
        unit.pool_label = ms_label.clone();
        unit.result = result.as_ref().err().map(|err| err.to_string());
        unit.msg = format!(
            "Check engine detects corrupted pool label: {} (MS) vs {} (PS).",
            ms_label.as_deref().unwrap_or("(null)"),
            ps_label.as_deref().unwrap_or("(null)")
        );
        self.report(&mut unit).await?;

        // Label trouble is not fatal for the rest of the check.
        let _ = self.post_repair(pool, result).await;
        Ok(())
    }

    // ── container cleanup ─────────────────────────────────────────

    async fn cont_cleanup(&self, pool: &Arc<PoolRec>, conts: &[Uuid]) -> Result<()> {
        let ps_known = self.pool_store.ps_containers(pool.uuid).await?;
        for &cont in conts {
            if pool.stop() {
                return Ok(());
            }
            if !ps_known.contains(&cont) {
                self.cont_orphan(pool, cont).await?;
                continue;
            }

            let ps_label = self.pool_store.cont_ps_label(pool.uuid, cont).await?;
            let target_label = self.pool_store.cont_target_label(pool.uuid, cont).await?;
            match (&ps_label, &target_label) {
                (None, None) => {}
                (both_ps, both_target) if both_ps == both_target => {}
                _ => {
                    self.cont_bad_label(pool, cont, ps_label, target_label)
                        .await?;
                }
            }
        }
        Ok(())
    }

    /// A container present on pool shards but unknown to the pool service.
    /// Default destroys it to release space.
    async fn cont_orphan(&self, pool: &Arc<PoolRec>, cont: Uuid) -> Result<()> {
        let class = InconsistClass::ContNonexistOnPs;
        let (policy, dryrun, auto) = self.prop_snapshot(class).await;
        let gen = self.ins.gen().await;
        self.tally_total(pool).await;

        let mut action = policy;
        loop {
            let mut unit = ReportUnit::new(gen, class, RepairAction::Interact, self.ins.rank);
            unit.pool = Some(pool.uuid);
            unit.cont = Some(cont);
            unit.msg = format!(
                "Check engine detects orphan container {}/{}",
                pool.uuid, cont
            );

            match action {
                RepairAction::Default | RepairAction::TrustPs | RepairAction::Discard => {
                    unit.action = RepairAction::Discard;
                    let result = if dryrun {
                        self.tally(pool, Outcome::Repaired).await;
                        Ok(())
                    } else {
                        match self.pool_store.destroy_cont(pool.uuid, cont).await {
                            Ok(()) => {
                                self.tally(pool, Outcome::Repaired).await;
                                Ok(())
                            }
                            Err(err) => {
                                self.tally(pool, Outcome::Failed).await;
                                Err(err)
                            }
                        }
                    };
                    unit.result = result.as_ref().err().map(|err| err.to_string());
                    self.report(&mut unit).await?;
                    return self.post_repair(pool, result).await;
                }
                RepairAction::Ignore => {
                    unit.action = RepairAction::Ignore;
                    self.tally(pool, Outcome::Ignored).await;
                    self.report(&mut unit).await?;
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
                        "Destroy the orphan container to release space [suggested].".into(),
                        "Keep the orphan container on engines, repair nothing.".into(),
                    ];
                    match self.report(&mut unit).await {
                        Ok(Some(decision)) => {
                            action = match decision {
                                RepairAction::Discard => RepairAction::Discard,
                                _ => RepairAction::Ignore,
                            };
                        }
                        Ok(None) => return Ok(()),
                        Err(CheckError::Interrupted) => return Err(CheckError::Interrupted),
                        Err(err) => {
                            self.tally(pool, Outcome::Failed).await;
                            return self.post_repair(pool, Err(err)).await;
                        }
                    }
                }
            }
        }
    }

    /// The pool service and the container property disagree on the label.
    /// A one-sided label is copied toward the empty side; a true mismatch
    /// asks the operator.
    async fn cont_bad_label(
        &self,
        pool: &Arc<PoolRec>,
        cont: Uuid,
        ps_label: Option<String>,
        target_label: Option<String>,
    ) -> Result<()> {
        let class = InconsistClass::ContBadLabel;
        let (policy, dryrun, auto) = self.prop_snapshot(class).await;
        let gen = self.ins.gen().await;
        self.tally_total(pool).await;

        let mut action = match policy {
            RepairAction::Default => match (&ps_label, &target_label) {
                (Some(_), None) => RepairAction::TrustPs,
                (None, Some(_)) => RepairAction::TrustTarget,
                // Both sides carry a label and they disagree: interact.
                _ => RepairAction::Interact,
            },
            other => other,
        };

        loop {
            let mut unit = ReportUnit::new(gen, class, RepairAction::Interact, self.ins.rank);
            unit.pool = Some(pool.uuid);
            unit.cont = Some(cont);
            unit.cont_label = ps_label.clone().or_else(|| target_label.clone());
            unit.msg = format!(
                "Check engine detects corrupted container label for {}/{}: {} (PS) vs {} (target)",
                pool.uuid,
                cont,
                ps_label.as_deref().unwrap_or("(null)"),
                target_label.as_deref().unwrap_or("(null)")
            );

            match action {
                RepairAction::TrustPs => {
                    unit.action = RepairAction::TrustPs;
                    let result = if dryrun {
                        self.tally(pool, Outcome::Repaired).await;
                        Ok(())
                    } else {
                        match self
                            .pool_store
                            .set_cont_label(pool.uuid, cont, ps_label.as_deref(), true)
                            .await
                        {
                            Ok(()) => {
                                self.tally(pool, Outcome::Repaired).await;
                                Ok(())
                            }
                            Err(err) => {
                                self.tally(pool, Outcome::Failed).await;
                                Err(err)
                            }
                        }
                    };
                    unit.result = result.as_ref().err().map(|err| err.to_string());
                    self.report(&mut unit).await?;
                    return self.post_repair(pool, result).await;
                }
                RepairAction::TrustTarget => {
                    unit.action = RepairAction::TrustTarget;
                    let result = if dryrun {
                        self.tally(pool, Outcome::Repaired).await;
                        Ok(())
                    } else {
                        match self
                            .pool_store
                            .set_cont_label(pool.uuid, cont, target_label.as_deref(), false)
                            .await
                        {
                            Ok(()) => {
                                self.tally(pool, Outcome::Repaired).await;
                                Ok(())
                            }
                            Err(err) => {
                                self.tally(pool, Outcome::Failed).await;
                                Err(err)
                            }
                        }
                    };
                    unit.result = result.as_ref().err().map(|err| err.to_string());
                    self.report(&mut unit).await?;
                    return self.post_repair(pool, result).await;
                }
                RepairAction::Ignore => {
                    unit.action = RepairAction::Ignore;
                    self.tally(pool, Outcome::Ignored).await;
                    self.report(&mut unit).await?;
                    return Ok(());
                }
                _ => {
                    if auto {
                        action = RepairAction::Ignore;
                        continue;
                    }
                    unit.action = RepairAction::Interact;
                    unit.options = vec![
                        RepairAction::TrustPs,
                        RepairAction::TrustTarget,
                        RepairAction::Ignore,
                    ];
                    unit.details = vec![
                        format!(
                            "Trust the PS container label: {}.",
                            ps_label.as_deref().unwrap_or("(null)")
                        ),
                        format!(
                            "Trust the target container label: {}.",
                            target_label.as_deref().unwrap_or("(null)")
                        ),
                        "Keep the inconsistent container label, repair nothing.".into(),
                    ];
                    match self.report(&mut unit).await {
                        Ok(Some(decision)) => {
                            action = match decision {
                                RepairAction::TrustPs => RepairAction::TrustPs,
                                RepairAction::TrustTarget => RepairAction::TrustTarget,
                                _ => RepairAction::Ignore,
                            };
                        }
                        Ok(None) => return Ok(()),
                        Err(CheckError::Interrupted) => return Err(CheckError::Interrupted),
                        Err(err) => {
                            self.tally(pool, Outcome::Failed).await;
                            return self.post_repair(pool, Err(err)).await;
                        }
                    }
                }
            }
        }
    }

    /// Repair epilogue: under failout a failed repair fails the pool,
    /// otherwise the error is swallowed after being reported.
    async fn post_repair(&self, pool: &Arc<PoolRec>, result: Result<()>) -> Result<()> {
        let Err(err) = result else {
            let bk = pool.bk.lock().await.clone();
            self.ins.store.update_pool(pool.uuid, &bk).await?;
            return Ok(());
        };
        let phase = pool.bk.lock().await.phase;
        self.ins.set_fail_phase(phase);
        if self.ins.prop.lock().await.flags.failout {
            let mut bk = pool.bk.lock().await;
            bk.mark_stopped(PoolStatus::Failed);
            let snapshot = bk.clone();
            drop(bk);
            self.ins.store.update_pool(pool.uuid, &snapshot).await?;
            return Err(err);
        }
        let bk = pool.bk.lock().await.clone();
        self.ins.store.update_pool(pool.uuid, &bk).await?;
        Ok(())
    }

    // ── IV notifications (leader → engine) ────────────────────────

    pub async fn notify(&self, iv: &IvMessage) -> Result<()> {
        match self.notify_inner(iv).await {
            Err(CheckError::NotApplicable) => {
                tracing::debug!(
                    rank = self.ins.rank,
                    gen = iv.gen,
                    "stale IV refresh dropped"
                );
                Ok(())
            }
            other => other,
        }
    }

    async fn notify_inner(&self, iv: &IvMessage) -> Result<()> {
        let ins = &self.ins;
        {
            let bk = ins.bk.lock().await;
            if bk.gen != iv.gen || bk.status != InstanceStatus::Running {
                return Err(CheckError::NotApplicable);
            }
        }

        if let Some(uuid) = iv.pool {
            if iv.pool_destroyed {
                if let Some(pool) = ins
                    .pool_stop_one(uuid, PoolStatus::Checked, Some(CheckPhase::Done))
                    .await?
                {
                    let _ = self.pool_store.stop_svc(pool.uuid).await;
                    let _ = self.pool_store.stop_shard(pool.uuid).await;
                }
                let _ = ins.store.delete_pool(uuid).await;
                return Ok(());
            }
            let finished = ins.pool_handle_notify(iv).await?;
            if let Some(pool) = finished {
                let status = pool.bk.lock().await.status;
                if status == PoolStatus::Checked && !pool.not_export_ps() {
                    if let Err(err) = self.pool_store.export_svc(pool.uuid).await {
                        tracing::warn!(pool = %pool.uuid, %err, "cannot export pool service");
                    } else {
                        pool.set_started(true);
                        pool.set_start_post(true);
                    }
                } else if ins.sched_alive() {
                    ins.queue_shutdown(pool);
                }
            }
            return Ok(());
        }

        // PS leaders always address a specific pool.
        if iv.from_ps_leader {
            return Err(CheckError::Invalid("PS-leader refresh without pool".into()));
        }

        if iv.phase >= CheckPhase::PoolMbs {
            if !ins.orphan_done() {
                tracing::info!(rank = ins.rank, "leader finished orphan-pool processing");
            }
            ins.set_orphan_done(true);
        }

        match iv.ins_status {
            Some(InstanceStatus::Running) => {
                let mut bk = ins.bk.lock().await;
                if iv.phase < bk.phase {
                    return Err(CheckError::NotApplicable);
                }
                if iv.phase != bk.phase {
                    bk.advance(iv.phase);
                    let snapshot = bk.clone();
                    drop(bk);
                    ins.store.update_engine(&snapshot).await?;
                    ins.update_pools_bk(iv.phase).await?;
                }
                Ok(())
            }
            Some(InstanceStatus::Failed) | Some(InstanceStatus::Implicated) => {
                ins.set_implicated(true);
                // The refresh may arrive on a call chain that started inside
                // one of our own pool workers; joining the scheduler (and
                // through it the workers) here would wait on ourselves.
                if let Some(this) = self.self_ref.lock().unwrap().upgrade() {
                    tokio::spawn(async move { this.stop_sched().await });
                }
                Ok(())
            }
            Some(InstanceStatus::Completed) => {
                let pools = ins.pools.read().await.snapshot();
                for pool in pools {
                    if !pool.done() && !pool.skip() && !pool.stop() {
                        return Err(CheckError::Internal(format!(
                            "pool {} still in progress but the leader completed",
                            pool.uuid
                        )));
                    }
                }
                Ok(())
            }
            _ => Err(CheckError::NotApplicable),
        }
    }

    // ── scheduler ─────────────────────────────────────────────────

    async fn sched(self: Arc<Self>) {
        let ins = &self.ins;
        tracing::info!(
            rank = ins.rank,
            phase = %ins.bk.lock().await.phase,
            "engine scheduler enters"
        );

        let rc = loop {
            tokio::time::sleep(SCHED_TICK).await;
            if ins.sched_exiting() || ins.pause() {
                break 0;
            }

            match ins.sweep().await {
                SweepProgress::Done => break 1,
                SweepProgress::Stopped => break 0,
                SweepProgress::AwaitOrphans => {}
                SweepProgress::Running(min_phase) => {
                    let mut bk = ins.bk.lock().await;
                    if bk.phase < min_phase {
                        tracing::info!(
                            rank = ins.rank,
                            from = %bk.phase,
                            to = %min_phase,
                            "engine advances phase"
                        );
                        bk.advance(min_phase);
                        let snapshot = bk.clone();
                        drop(bk);
                        if ins.store.update_engine(&snapshot).await.is_err() {
                            break -1;
                        }
                    }
                }
            }

            for pool in ins.drain_shutdown() {
                let _ = self.pool_store.stop_svc(pool.uuid).await;
                let _ = self.pool_store.stop_shard(pool.uuid).await;
                pool.set_started(false);
                pool.set_start_post(false);
            }
        };

        self.sched_exit(rc).await;
    }

    async fn sched_exit(&self, rc: i32) {
        let ins = &self.ins;
        let failout = ins.prop.lock().await.flags.failout;
        let (ins_phase, ins_status, pool_status) = if rc > 0 {
            match ins.fail_phase() {
                Some(phase) if failout => {
                    (Some(phase), InstanceStatus::Failed, PoolStatus::Implicated)
                }
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

        for pool in ins.drain_shutdown() {
            let _ = self.pool_store.stop_svc(pool.uuid).await;
            let _ = self.pool_store.stop_shard(pool.uuid).await;
        }
        match ins.pool_stop_all(pool_status).await {
            Ok(stopped) => {
                for pool in stopped {
                    self.shutdown_pool(&pool).await;
                }
            }
            Err(err) => tracing::warn!(%err, "failed to stop pools at engine exit"),
        }

        ins.destroy_trees().await;

        let gen;
        {
            let mut bk = ins.bk.lock().await;
            gen = bk.gen;
            if bk.status == InstanceStatus::Running {
                if let Some(phase) = ins_phase {
                    bk.phase = phase;
                }
                bk.mark_stopped(ins_status);
                if let Err(err) = ins.store.update_engine(&bk).await {
                    tracing::warn!(%err, "failed to persist engine exit");
                }
            }
        }

        if ins_status == InstanceStatus::Paused {
            let _ = ins.pause_all_pools(gen).await;
        }

        // Stop/pause/implicated are either initiated by the leader or
        // observable through its own teardown; everything else is told.
        if !matches!(
            ins_status,
            InstanceStatus::Paused | InstanceStatus::Stopped | InstanceStatus::Implicated
        ) {
            let phase = ins.bk.lock().await.phase;
            let mut msg = IvMessage::instance(gen, phase, ins_status);
            msg.to_leader = true;
            let _ = self.iv.update(msg, IvSync::Lazy, || true).await;
        }

        tracing::info!(rank = ins.rank, status = %ins_status, rc, "engine scheduler exits");
        ins.set_sched_exiting(false);
        ins.set_sched_running(false);
        ins.set_started(false);
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

    /// The process is shutting down.
    pub async fn pause(&self) {
        self.stop_sched().await;
    }

    // ── rejoin ────────────────────────────────────────────────────

    /// Resume a prior instance after a restart. Retries transient leader
    /// trouble with a 1 s back-off until the process pauses; a refusal
    /// because the rank was evicted is final.
    pub async fn rejoin(self: &Arc<Self>) -> Result<()> {
        let ins = &self.ins;
        let bk = ins.bk.lock().await.clone();
        if bk.magic != BK_MAGIC_ENGINE
            || !matches!(
                bk.status,
                InstanceStatus::Running | InstanceStatus::Paused
            )
        {
            return Ok(());
        }
        let leader = ins.prop.lock().await.leader;
        if leader == ins.rank {
            // The leader does not rejoin its own former instance.
            return Ok(());
        }
        if ins.ranks.lock().await.is_empty() {
            return Ok(());
        }

        ins.set_rejoining(true);
        ins.set_starting(true);
        let result = self.rejoin_inner(&bk, leader).await;
        ins.set_starting(false);
        ins.set_rejoining(false);

        match &result {
            Ok(()) => tracing::info!(rank = ins.rank, gen = bk.gen, "engine rejoined"),
            Err(CheckError::NoPerm) => {
                tracing::info!(rank = ins.rank, gen = bk.gen, "rejoin refused: rank evicted");
                return Ok(());
            }
            Err(err) => {
                tracing::error!(rank = ins.rank, gen = bk.gen, %err, "rejoin failed")
            }
        }
        result
    }

    async fn rejoin_inner(self: &Arc<Self>, bk: &InstanceBookmark, leader: Rank) -> Result<()> {
        let ins = &self.ins;

        let out = loop {
            let sent = self
                .transport
                .unicast(
                    leader,
                    CheckRequest::Rejoin(RejoinIn {
                        gen: bk.gen,
                        rank: ins.rank,
                        iv_uuid: bk.iv_uuid,
                    }),
                )
                .await;
            match sent {
                Ok(CheckReply::Rejoin(out)) => break out,
                Ok(other) => {
                    return Err(CheckError::Internal(format!(
                        "unexpected rejoin reply: {other:?}"
                    )))
                }
                Err(err) if err.is_transient() => {
                    if ins.pause() {
                        return Err(CheckError::Interrupted);
                    }
                    tracing::info!(rank = ins.rank, %err, "leader not ready, rejoin in 1 sec");
                    tokio::time::sleep(REJOIN_RETRY).await;
                    if ins.pause() {
                        return Err(CheckError::Interrupted);
                    }
                }
                Err(err) => return Err(err),
            }
        };

        if out.pools.is_empty() {
            return Ok(());
        }

        let result = async {
            self.load_pool_list(bk.gen, &out.pools, false, false).await?;
            self.start_post().await?;
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                // The pending table starts empty on rejoin; undelivered
                // decisions were lost with the process.
                ins.set_sched_running(true);
                let this = Arc::clone(self);
                ins.attach_sched(tokio::spawn(async move { this.sched().await }));
                if out.orphan_done {
                    ins.set_orphan_done(true);
                }
                ins.set_started(true);

                // Pools this rank leads that are already past the
                // membership phase can resume on their own; earlier ones
                // wait for the leader to drive them again.
                let pools = ins.pools.read().await.snapshot();
                for pool in pools {
                    if pool.done() || pool.bk.lock().await.phase < CheckPhase::ContList {
                        continue;
                    }
                    match self.pool_store.svc_leader(pool.uuid).await? {
                        Some(rank) if rank == ins.rank => {}
                        Some(_) => continue,
                        None => {
                            // The service died with the process; bring it
                            // back so this rank can keep driving the pool.
                            let _ = self.pool_store.start_shard(pool.uuid).await;
                            if self
                                .pool_store
                                .start_svc(pool.uuid, SvcStartMode::Normal)
                                .await
                                .is_err()
                            {
                                continue;
                            }
                        }
                    }
                    pool.set_started(true);
                    let this = Arc::clone(self);
                    let pool_clone = Arc::clone(&pool);
                    pool.attach_worker(tokio::spawn(async move {
                        this.pool_worker(pool_clone).await;
                    }));
                }
                Ok(())
            }
            Err(err) => {
                if let Ok(stopped) = ins.pool_stop_all(PoolStatus::Implicated).await {
                    for pool in stopped {
                        self.shutdown_pool(&pool).await;
                    }
                }
                {
                    let mut cur = ins.bk.lock().await;
                    if cur.status == InstanceStatus::Running {
                        cur.mark_stopped(InstanceStatus::Failed);
                        let _ = ins.store.update_engine(&cur).await;
                    }
                }
                let mut msg = IvMessage::instance(bk.gen, bk.phase, InstanceStatus::Failed);
                msg.to_leader = true;
                let _ = self.iv.update(msg, IvSync::Lazy, || true).await;
                Err(err)
            }
        }
    }
}

#[async_trait]
impl CheckHandler for CheckEngine {
    async fn handle(&self, req: CheckRequest) -> Result<CheckReply> {
        // Start and pool-mbs spawn tasks that outlive the call, so they
        // need the owning Arc back.
        let this = self
            .self_ref
            .lock()
            .unwrap()
            .upgrade()
            .ok_or(CheckError::Shutdown)?;
        match req {
            CheckRequest::Start(body) => Ok(CheckReply::Start(this.engine_start(body).await?)),
            CheckRequest::Stop(body) => Ok(CheckReply::Stop(this.engine_stop(body).await?)),
            CheckRequest::Query(body) => Ok(CheckReply::Query(this.engine_query(body).await?)),
            CheckRequest::Mark(body) => {
                this.engine_mark(body).await?;
                Ok(CheckReply::Mark)
            }
            CheckRequest::Act(body) => {
                this.engine_act(body).await?;
                Ok(CheckReply::Act)
            }
            CheckRequest::ContList(body) => {
                Ok(CheckReply::ContList(this.engine_cont_list(body).await?))
            }
            CheckRequest::PoolStart(body) => {
                this.engine_pool_start(body).await?;
                Ok(CheckReply::PoolStart)
            }
            CheckRequest::PoolMbs(body) => {
                Ok(CheckReply::PoolMbs(this.engine_pool_mbs(body).await?))
            }
            other => Err(CheckError::Invalid(format!(
                "engine does not serve {}",
                other.opcode()
            ))),
        }
    }

    async fn iv_refresh(&self, iv: IvMessage) -> Result<()> {
        self.notify(&iv).await
    }

    async fn iv_update(&self, _iv: IvMessage) -> Result<()> {
        Err(CheckError::Invalid(
            "engine is not the root of the IV tree".into(),
        ))
    }
}
