//! Core identifiers, phases, statuses, and flag sets shared by every role.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter};

/// One storage process in the cluster.
pub type Rank = u32;

/// Sentinel rank used by the check leader when it originates reports itself.
pub const LEADER_RANK: Rank = u32::MAX;

/// Ordered scan pipeline. Within one instance a pool's phase never goes
/// backwards; a new generation (RESET) starts over from `Prepare`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display,
    EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CheckPhase {
    Prepare,
    PoolList,
    PoolMbs,
    PoolCleanup,
    ContList,
    ContCleanup,
    Done,
}

impl CheckPhase {
    /// Rough "work remaining" estimate used for the bookmark's left-time field.
    pub fn phases_left(self) -> u32 {
        CheckPhase::Done as u32 - self as u32
    }
}

/// Status of a whole check instance (leader or engine bookmark).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum InstanceStatus {
    Init,
    Running,
    Completed,
    Stopped,
    Failed,
    Paused,
    Implicated,
}

/// Status of one pool's check (pool bookmark).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PoolStatus {
    Unchecked,
    Checking,
    Checked,
    Failed,
    Paused,
    /// Blocked on an operator decision.
    Pending,
    Stopped,
    Implicated,
}

/// Inconsistency classes the checker can detect.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display,
    EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum InconsistClass {
    EngineNonexistInMap,
    EngineDownInMap,
    EngineHasNoStorage,
    PoolNonexistOnEngine,
    PoolNonexistOnMs,
    PoolBadLabel,
    PoolLessSvcWithoutQuorum,
    ContNonexistOnPs,
    ContBadLabel,
    Unknown,
}

/// Repair actions. `Default` resolves per class; `Interact` parks the report
/// on a pending record until the operator answers.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display,
    EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RepairAction {
    Default,
    Interact,
    Ignore,
    Discard,
    Readd,
    TrustMs,
    TrustPs,
    TrustTarget,
    TrustMajority,
    TrustLatest,
    TrustOldest,
    TrustEcParity,
    TrustEcData,
}

impl RepairAction {
    /// Canonical one-line description, rendered into interactive reports.
    pub fn describe(self) -> &'static str {
        match self {
            Self::Default => "Default action, depends on the detailed inconsistency class.",
            Self::Interact => "Interact with administrator for further action.",
            Self::Ignore => "Ignore but log the inconsistency.",
            Self::Discard => {
                "Discard the unrecognized element: pool service, pool itself, container, and so on."
            }
            Self::Readd => "Re-add the missing element: pool to MS, target to pool map, and so on.",
            Self::TrustMs => "Trust the information recorded in MS DB.",
            Self::TrustPs => "Trust the information recorded in PS DB.",
            Self::TrustTarget => "Trust the information recorded by target(s).",
            Self::TrustMajority => "Trust the majority parts (if have).",
            Self::TrustLatest => "Trust the one with latest information. Keep the latest data.",
            Self::TrustOldest => "Trust the one with oldest information. Rollback to old version.",
            Self::TrustEcParity => "Trust EC parity shard.",
            Self::TrustEcData => "Trust EC data shard.",
        }
    }
}

/// Operator-facing start flags (per instance, never persisted as-is).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartFlags {
    /// Rescan from scratch, dropping every pool bookmark.
    pub reset: bool,
    /// Classify and report only; no persistent repair.
    pub dryrun: bool,
    /// Any pool failure terminates the whole instance.
    pub failout: bool,
    /// Clear a persisted failout.
    pub no_failout: bool,
    /// Resolve every would-be interaction as Ignore.
    pub auto: bool,
    /// Clear a persisted auto.
    pub no_auto: bool,
    /// Compare engine-known pools against MS even for a partial pool list.
    pub orphan_pool: bool,
}

/// The subset of flags that survives in the persisted property record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyFlags {
    pub dryrun: bool,
    pub failout: bool,
    pub auto: bool,
}

/// Internal start disposition derived from the operator flags plus the
/// persisted state (see the start contract).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StartDisposition {
    /// Drop all bookmarks, reload pools from the authoritative source.
    pub reset_all: bool,
    /// Previous instance ran dryrun: non-completed pools restart from scratch.
    pub reset_noncomp: bool,
    /// Orphan-pool comparison requested (explicitly or implied).
    pub orphan_pool: bool,
}

/// Aggregated inconsistency statistics carried by every bookmark.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statistics {
    pub total: u64,
    pub repaired: u64,
    pub ignored: u64,
    pub failed: u64,
}

/// Wall-clock bookkeeping carried by every bookmark. Times are unix seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeInfo {
    pub start_time: i64,
    pub stop_time: i64,
    /// Crude remaining-work estimate (phases left to run).
    pub left: u32,
}

/// How a pool service is brought up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SvcStartMode {
    /// Normal start with the recorded replica cohort.
    Normal,
    /// Dictated quorum: restart from the single chosen replica.
    Dictate,
}

/// A target's local state as reported by the owning rank for pool-map
/// cross-checking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TargetState {
    /// Storage present and initialised.
    Normal,
    /// Storage allocated but empty.
    Empty,
    /// No storage for this index at all.
    Nonexist,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_order_is_the_pipeline_order() {
        assert!(CheckPhase::Prepare < CheckPhase::PoolList);
        assert!(CheckPhase::PoolList < CheckPhase::PoolMbs);
        assert!(CheckPhase::PoolMbs < CheckPhase::PoolCleanup);
        assert!(CheckPhase::PoolCleanup < CheckPhase::ContList);
        assert!(CheckPhase::ContList < CheckPhase::ContCleanup);
        assert!(CheckPhase::ContCleanup < CheckPhase::Done);
    }

    #[test]
    fn phases_left_counts_down_to_done() {
        assert_eq!(CheckPhase::Prepare.phases_left(), 6);
        assert_eq!(CheckPhase::ContCleanup.phases_left(), 1);
        assert_eq!(CheckPhase::Done.phases_left(), 0);
    }

    #[test]
    fn action_description_exists_for_every_action() {
        use strum::IntoEnumIterator;

        for act in RepairAction::iter() {
            assert!(!act.describe().is_empty());
        }
    }
}
