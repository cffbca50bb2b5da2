//! Messages carried by the cluster IV (invalidation/propagation) bus.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{CheckPhase, InstanceStatus, PoolStatus, Rank};

/// Delivery discipline requested by the publisher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IvSync {
    /// Deliver before the update call returns.
    Eager,
    /// Deliver in the background.
    Lazy,
}

/// One IV event. `to_leader` updates climb toward the root; refreshes fan
/// out from the leader to every engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IvMessage {
    pub gen: u64,
    pub seq: u64,
    pub rank: Rank,
    /// Pool the event concerns; `None` for instance-level events.
    pub pool: Option<Uuid>,
    pub phase: CheckPhase,
    pub ins_status: Option<InstanceStatus>,
    pub pool_status: Option<PoolStatus>,
    pub to_leader: bool,
    pub pool_destroyed: bool,
    pub from_ps_leader: bool,
}

impl IvMessage {
    pub fn instance(gen: u64, phase: CheckPhase, status: InstanceStatus) -> Self {
        Self {
            gen,
            seq: 0,
            rank: 0,
            pool: None,
            phase,
            ins_status: Some(status),
            pool_status: None,
            to_leader: false,
            pool_destroyed: false,
            from_ps_leader: false,
        }
    }

    pub fn pool(gen: u64, pool: Uuid, phase: CheckPhase, status: PoolStatus) -> Self {
        Self {
            gen,
            seq: 0,
            rank: 0,
            pool: Some(pool),
            phase,
            ins_status: None,
            pool_status: Some(status),
            to_leader: false,
            pool_destroyed: false,
            from_ps_leader: false,
        }
    }
}
