//! Wire bodies for the cluster RPCs.
//!
//! The transport itself is an external collaborator; these are the typed
//! request/reply payloads it carries. Every request carries the instance
//! `gen`; a receiver holding a different generation answers "not
//! applicable" and the message is dropped.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clue::PoolClue;
use crate::policy::PolicyEntry;
use crate::report::ReportUnit;
use crate::types::{
    CheckPhase, InconsistClass, InstanceStatus, PoolStatus, Rank, StartFlags, Statistics,
    SvcStartMode, TargetState, TimeInfo,
};

/// Start the check instance on the receiving engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartIn {
    pub gen: u64,
    pub flags: StartFlags,
    /// Internal reset/orphan disposition bits resolved by the leader.
    pub reset_all: bool,
    pub reset_noncomp: bool,
    pub orphan_pool: bool,
    pub phase_limit: Option<CheckPhase>,
    pub leader: Rank,
    pub ranks: Vec<Rank>,
    pub policies: Vec<PolicyEntry>,
    pub pools: Vec<Uuid>,
    pub iv_uuid: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartOut {
    /// The rank has nothing to check for this instance.
    pub nothing_to_do: bool,
    pub clues: Vec<PoolClue>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopIn {
    /// 0 means "whichever instance is current".
    pub gen: u64,
    pub pools: Vec<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopOut {
    /// At least one pool was actually transitioned to STOPPED on this rank.
    pub pool_stopped: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryIn {
    pub gen: u64,
    pub pools: Vec<Uuid>,
}

/// Per-pool, per-rank query detail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolShardInfo {
    pub pool: Uuid,
    pub rank: Rank,
    pub status: PoolStatus,
    pub phase: CheckPhase,
    pub statistics: Statistics,
    pub time: TimeInfo,
    /// Local target states, when the rank still holds shards of the pool.
    pub targets: Vec<TargetState>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryOut {
    pub gen: u64,
    pub status: InstanceStatus,
    pub phase: CheckPhase,
    pub shards: Vec<PoolShardInfo>,
}

/// Mark a rank dead on the surviving engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkIn {
    pub gen: u64,
    pub rank: Rank,
    pub group_version: u32,
}

/// Deliver an operator decision to the engine that originated the report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActIn {
    pub gen: u64,
    pub seq: u64,
    pub class: InconsistClass,
    pub action: crate::types::RepairAction,
    pub for_all: bool,
}

/// PS leader collecting container uuids from all pool shards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContListIn {
    pub gen: u64,
    pub rank: Rank,
    pub pool: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContListOut {
    pub conts: Vec<Uuid>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStartFlags {
    /// The pool is processed as a potential orphan, outside the check list.
    pub for_orphan: bool,
    /// Do not export the pool service when the check finishes.
    pub not_export_ps: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStartIn {
    pub gen: u64,
    pub pool: Uuid,
    pub phase: CheckPhase,
    pub flags: PoolStartFlags,
    /// When set, ranks listed in `svc_ranks` also bring the pool service up.
    pub svc_mode: Option<SvcStartMode>,
    pub svc_ranks: Vec<Rank>,
}

/// One rank's membership entry shipped with POOL_MBS.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolMember {
    pub rank: Rank,
    pub targets: Vec<TargetState>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolMbsIn {
    pub gen: u64,
    pub pool: Uuid,
    pub phase: CheckPhase,
    /// MS and PS labels disagreed; the PS leader repairs the PS copy during
    /// container cleanup.
    pub repair_label: bool,
    pub label: Option<String>,
    pub label_seq: u64,
    pub members: Vec<PoolMember>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolMbsOut {
    /// Redirect hint when the receiving rank is not the PS leader.
    pub svc_hint: Option<Rank>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportIn {
    pub unit: ReportUnit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejoinIn {
    pub gen: u64,
    pub rank: Rank,
    pub iv_uuid: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejoinOut {
    /// Orphan-pool processing already finished; the engine scheduler may
    /// treat the pool set as final.
    pub orphan_done: bool,
    pub pools: Vec<Uuid>,
}

/// All cluster requests, one variant per opcode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CheckRequest {
    Start(StartIn),
    Stop(StopIn),
    Query(QueryIn),
    Mark(MarkIn),
    Act(ActIn),
    ContList(ContListIn),
    PoolStart(PoolStartIn),
    PoolMbs(PoolMbsIn),
    Report(ReportIn),
    Rejoin(RejoinIn),
}

impl CheckRequest {
    pub fn opcode(&self) -> &'static str {
        match self {
            Self::Start(_) => "start",
            Self::Stop(_) => "stop",
            Self::Query(_) => "query",
            Self::Mark(_) => "mark",
            Self::Act(_) => "act",
            Self::ContList(_) => "cont_list",
            Self::PoolStart(_) => "pool_start",
            Self::PoolMbs(_) => "pool_mbs",
            Self::Report(_) => "report",
            Self::Rejoin(_) => "rejoin",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CheckReply {
    Start(StartOut),
    Stop(StopOut),
    Query(QueryOut),
    Mark,
    Act,
    ContList(ContListOut),
    PoolStart,
    PoolMbs(PoolMbsOut),
    Report,
    Rejoin(RejoinOut),
}
