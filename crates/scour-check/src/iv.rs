//! IV-bus publication.
//!
//! Engines publish `to_leader` updates that climb to the root; the leader
//! publishes refreshes that fan out to every engine. When the engine and
//! the leader share a rank, a `to_leader` update bypasses the bus and calls
//! the leader's notify entry directly.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use scour_core::iv::{IvMessage, IvSync};
use scour_core::ports::{CheckHandler, ClusterTransport};
use scour_core::types::Rank;
use scour_core::{CheckError, Result};

const OOG_POLL: Duration = Duration::from_millis(500);

pub struct IvPublisher {
    transport: Arc<dyn ClusterTransport>,
    rank: Rank,
    /// Co-resident leader, when this rank hosts it.
    local_leader: StdMutex<Option<Arc<dyn CheckHandler>>>,
}

impl IvPublisher {
    pub fn new(transport: Arc<dyn ClusterTransport>, rank: Rank) -> Self {
        Self {
            transport,
            rank,
            local_leader: StdMutex::new(None),
        }
    }

    pub fn set_local_leader(&self, leader: Arc<dyn CheckHandler>) {
        *self.local_leader.lock().unwrap() = Some(leader);
    }

    pub fn clear_local_leader(&self) {
        *self.local_leader.lock().unwrap() = None;
    }

    /// Publish one IV event. Out-of-group failures wait for the group to be
    /// re-synced (dead-rank processing) and retry, bounded by `keep_going`.
    pub async fn update(
        &self,
        mut msg: IvMessage,
        sync: IvSync,
        keep_going: impl Fn() -> bool,
    ) -> Result<()> {
        msg.rank = self.rank;
        msg.seq = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);

        if msg.to_leader {
            let local = self.local_leader.lock().unwrap().clone();
            if let Some(leader) = local {
                return leader.iv_update(msg).await;
            }
        }

        let mut tries = 0u32;
        loop {
            match self.transport.iv_update(self.rank, msg.clone(), sync).await {
                Err(CheckError::OutOfGroup) => {
                    if !keep_going() {
                        return Err(CheckError::OutOfGroup);
                    }
                    tries += 1;
                    if tries % 10 == 0 {
                        tracing::warn!(
                            gen = msg.gen,
                            seq = msg.seq,
                            tries,
                            "IV update keeps hitting out-of-group"
                        );
                    }
                    tokio::time::sleep(OOG_POLL).await;
                }
                other => {
                    if let Err(err) = &other {
                        tracing::warn!(
                            gen = msg.gen,
                            seq = msg.seq,
                            rank = msg.rank,
                            %err,
                            "IV update failed"
                        );
                    } else {
                        tracing::debug!(
                            gen = msg.gen,
                            seq = msg.seq,
                            rank = msg.rank,
                            phase = %msg.phase,
                            to_leader = msg.to_leader,
                            from_ps_leader = msg.from_ps_leader,
                            "IV update"
                        );
                    }
                    return other;
                }
            }
        }
    }
}
