//! Port traits: the seams to every external collaborator.
//!
//! Core logic depends only on these traits; the harness provides in-memory
//! implementations, a real deployment wires the production services behind
//! the same interfaces.

use async_trait::async_trait;
use uuid::Uuid;

use crate::clue::PoolClue;
use crate::error::Result;
use crate::iv::{IvMessage, IvSync};
use crate::poolmap::PoolMap;
use crate::report::CheckReport;
use crate::rpc::{CheckReply, CheckRequest};
use crate::types::{CheckPhase, Rank, SvcStartMode, TargetState};

/// Sys-level KV with transactional updates over a single table.
///
/// Keys are ASCII strings; values are opaque records. `upsert_many` commits
/// all entries in one transaction or none of them.
#[async_trait]
pub trait SysDb: Send + Sync {
    async fn fetch(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn upsert(&self, key: &str, value: Vec<u8>) -> Result<()>;
    async fn upsert_many(&self, entries: Vec<(String, Vec<u8>)>) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
    /// Snapshot of all keys in the table, for traversal.
    async fn keys(&self) -> Result<Vec<String>>;
}

/// A pool identity as known to the management service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MsPoolEntry {
    pub uuid: Uuid,
    pub label: Option<String>,
}

/// Management-service registry operations (leader side).
#[async_trait]
pub trait MgmtStore: Send + Sync {
    async fn list_pools(&self) -> Result<Vec<MsPoolEntry>>;
    /// Re-register an orphan pool, seeding its service with `replicas`.
    async fn register_pool(
        &self,
        seq: u64,
        uuid: Uuid,
        label: Option<&str>,
        replicas: &[Rank],
    ) -> Result<()>;
    /// Drop a dangling pool entry.
    async fn deregister_pool(&self, seq: u64, uuid: Uuid) -> Result<()>;
    /// Destroy the pool's storage on the given ranks.
    async fn destroy_pool(&self, seq: u64, uuid: Uuid, ranks: &[Rank]) -> Result<()>;
    /// Destroy every pool-service replica except the chosen one, so the
    /// service can be restarted with a dictated quorum.
    async fn reset_svc(&self, uuid: Uuid, keep: Rank, evict: &[Rank]) -> Result<()>;
    /// Fix the MS copy of a pool label.
    async fn update_label(&self, seq: u64, uuid: Uuid, label: Option<&str>) -> Result<()>;
}

/// The engine-local storage and pool-service surface.
#[async_trait]
pub trait PoolStore: Send + Sync {
    /// Does this rank hold any shard of the pool?
    async fn pool_exists(&self, uuid: Uuid) -> Result<bool>;
    /// All pools found in the local directory sets (normal, newborn,
    /// zombie), for the reset path.
    async fn local_pools(&self) -> Result<Vec<Uuid>>;
    /// Build this rank's clue for the pool. `phase` is the phase recorded by
    /// a prior instance, `None` when the pool is only an orphan candidate.
    async fn collect_clue(&self, uuid: Uuid, phase: Option<CheckPhase>) -> Result<PoolClue>;

    /// Bring the local pool shard up / tear it down.
    async fn start_shard(&self, uuid: Uuid) -> Result<()>;
    async fn stop_shard(&self, uuid: Uuid) -> Result<()>;

    async fn start_svc(&self, uuid: Uuid, mode: SvcStartMode) -> Result<()>;
    async fn stop_svc(&self, uuid: Uuid) -> Result<()>;
    /// Restart the pool with the full (exported) pool service after check.
    async fn export_svc(&self, uuid: Uuid) -> Result<()>;
    /// Which rank currently leads the pool service, if any.
    async fn svc_leader(&self, uuid: Uuid) -> Result<Option<Rank>>;

    /// Destroy one shard (or the whole rank's storage when `index` is None).
    async fn destroy_shard(&self, uuid: Uuid, rank: Rank, index: Option<u32>) -> Result<()>;

    async fn load_map(&self, uuid: Uuid) -> Result<PoolMap>;
    async fn flush_map(&self, uuid: Uuid, map: &PoolMap) -> Result<()>;
    /// Local per-target states, index-aligned with the pool map.
    async fn target_states(&self, uuid: Uuid) -> Result<Vec<TargetState>>;

    async fn ps_label(&self, uuid: Uuid) -> Result<Option<String>>;
    async fn update_ps_label(&self, uuid: Uuid, label: Option<&str>) -> Result<()>;

    /// Containers present on this rank's shards of the pool.
    async fn shard_containers(&self, uuid: Uuid) -> Result<Vec<Uuid>>;
    /// Containers registered in the pool service.
    async fn ps_containers(&self, uuid: Uuid) -> Result<Vec<Uuid>>;
    async fn cont_ps_label(&self, pool: Uuid, cont: Uuid) -> Result<Option<String>>;
    async fn cont_target_label(&self, pool: Uuid, cont: Uuid) -> Result<Option<String>>;
    /// Write the label on the PS side or the target-property side.
    async fn set_cont_label(
        &self,
        pool: Uuid,
        cont: Uuid,
        label: Option<&str>,
        on_target: bool,
    ) -> Result<()>;
    async fn destroy_cont(&self, pool: Uuid, cont: Uuid) -> Result<()>;

    async fn evict_connections(&self, uuid: Uuid) -> Result<()>;
    async fn schedule_reconf(&self, uuid: Uuid) -> Result<()>;
}

/// Cluster transport: point-to-point and collective RPC plus the IV bus.
#[async_trait]
pub trait ClusterTransport: Send + Sync {
    async fn unicast(&self, rank: Rank, req: CheckRequest) -> Result<CheckReply>;
    /// Send to every rank; per-rank results, no early abort.
    async fn collective(
        &self,
        ranks: &[Rank],
        req: CheckRequest,
    ) -> Vec<(Rank, Result<CheckReply>)>;
    /// Publish on the IV bus. `to_leader` messages climb to the root;
    /// refreshes fan out to every engine.
    async fn iv_update(&self, origin: Rank, msg: IvMessage, sync: IvSync) -> Result<()>;
    /// Tell the transport the instance's secondary group membership changed.
    async fn update_group(&self, ranks: &[Rank], version: u32) -> Result<()>;
}

/// Handler surface a role exposes to the transport.
#[async_trait]
pub trait CheckHandler: Send + Sync {
    async fn handle(&self, req: CheckRequest) -> Result<CheckReply>;
    /// Leader-originated refresh arriving at an engine.
    async fn iv_refresh(&self, iv: IvMessage) -> Result<()>;
    /// Engine-originated update arriving at the root.
    async fn iv_update(&self, iv: IvMessage) -> Result<()>;
}

/// Upcall surface toward the controller.
#[async_trait]
pub trait ReportSink: Send + Sync {
    async fn report(&self, report: CheckReport) -> Result<()>;
}
