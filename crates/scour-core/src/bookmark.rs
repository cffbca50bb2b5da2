//! Persisted bookmarks.
//!
//! Three record families live in the sys-level KV table: one `leader`
//! bookmark (on the leader rank only), one `engine` bookmark per rank, and
//! one bookmark per pool keyed by the pool uuid in canonical lowercase form.
//! Each record carries a magic so that a key collision or a torn write is
//! detected at load time.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{CheckPhase, InstanceStatus, PoolStatus, Statistics, TimeInfo};

pub const BK_MAGIC_LEADER: u32 = 0x5c0a_bd01;
pub const BK_MAGIC_ENGINE: u32 = 0x5c0a_bd02;
pub const BK_MAGIC_POOL: u32 = 0x5c0a_bd03;

/// Record-format version, bumped on incompatible layout changes.
pub const BK_VERSION: u32 = 1;

/// Bookmark for a whole instance (leader or engine role).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceBookmark {
    pub magic: u32,
    pub version: u32,
    pub gen: u64,
    pub iv_uuid: Uuid,
    pub phase: CheckPhase,
    pub status: InstanceStatus,
    pub statistics: Statistics,
    pub time: TimeInfo,
}

impl InstanceBookmark {
    pub fn new(magic: u32, gen: u64, iv_uuid: Uuid) -> Self {
        Self {
            magic,
            version: BK_VERSION,
            gen,
            iv_uuid,
            phase: CheckPhase::Prepare,
            status: InstanceStatus::Init,
            statistics: Statistics::default(),
            time: TimeInfo::default(),
        }
    }

    pub fn mark_running(&mut self) {
        self.status = InstanceStatus::Running;
        self.time.start_time = Utc::now().timestamp();
        self.time.left = self.phase.phases_left();
    }

    pub fn mark_stopped(&mut self, status: InstanceStatus) {
        self.status = status;
        self.time.stop_time = Utc::now().timestamp();
    }
}

/// Bookmark for one pool's check progress on one rank.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolBookmark {
    pub magic: u32,
    pub version: u32,
    pub gen: u64,
    pub phase: CheckPhase,
    pub status: PoolStatus,
    pub statistics: Statistics,
    pub time: TimeInfo,
}

impl PoolBookmark {
    pub fn new(gen: u64) -> Self {
        Self {
            magic: BK_MAGIC_POOL,
            version: BK_VERSION,
            gen,
            phase: CheckPhase::Prepare,
            status: PoolStatus::Unchecked,
            statistics: Statistics::default(),
            time: TimeInfo::default(),
        }
    }

    pub fn mark_checking(&mut self) {
        self.status = PoolStatus::Checking;
        self.time.start_time = Utc::now().timestamp();
        self.time.left = self.phase.phases_left();
    }

    pub fn mark_stopped(&mut self, status: PoolStatus) {
        self.status = status;
        self.time.stop_time = Utc::now().timestamp();
    }

    /// Raise the phase; phases never go backwards within one instance.
    pub fn advance(&mut self, phase: CheckPhase) {
        if phase > self.phase {
            self.phase = phase;
            self.time.left = phase.phases_left();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_bookmark_never_goes_backwards() {
        let mut bk = PoolBookmark::new(7);
        bk.advance(CheckPhase::PoolMbs);
        assert_eq!(bk.phase, CheckPhase::PoolMbs);
        bk.advance(CheckPhase::PoolList);
        assert_eq!(bk.phase, CheckPhase::PoolMbs);
        bk.advance(CheckPhase::Done);
        assert_eq!(bk.phase, CheckPhase::Done);
        assert_eq!(bk.time.left, 0);
    }

    #[test]
    fn instance_bookmark_round_trips_through_json() {
        let bk = InstanceBookmark::new(BK_MAGIC_LEADER, 42, Uuid::new_v4());
        let raw = serde_json::to_vec(&bk).unwrap();
        let back: InstanceBookmark = serde_json::from_slice(&raw).unwrap();
        assert_eq!(bk, back);
    }
}
