//! Loopback cluster transport.
//!
//! Routes RPCs to the registered per-rank handlers: report and rejoin go to
//! the leader, everything else to the addressed engine. The IV bus is
//! modelled directly: `to_leader` updates climb to the root handler,
//! refreshes fan out to every live engine (skipping the origin shard for
//! PS-leader notifications, as the real bus does).

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use scour_core::iv::{IvMessage, IvSync};
use scour_core::ports::{CheckHandler, ClusterTransport};
use scour_core::rpc::{CheckReply, CheckRequest};
use scour_core::types::Rank;
use scour_core::{CheckError, Result};

#[derive(Default)]
pub struct MemCluster {
    engines: Mutex<BTreeMap<Rank, Arc<dyn CheckHandler>>>,
    leader: Mutex<Option<Arc<dyn CheckHandler>>>,
    dead: Mutex<BTreeSet<Rank>>,
    group: Mutex<(Vec<Rank>, u32)>,
}

impl MemCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register_engine(&self, rank: Rank, handler: Arc<dyn CheckHandler>) {
        self.engines.lock().unwrap().insert(rank, handler);
    }

    pub fn register_leader(&self, handler: Arc<dyn CheckHandler>) {
        *self.leader.lock().unwrap() = Some(handler);
    }

    /// Simulate a rank death: RPCs to it fail hard from now on.
    pub fn kill(&self, rank: Rank) {
        self.dead.lock().unwrap().insert(rank);
    }

    pub fn revive(&self, rank: Rank) {
        self.dead.lock().unwrap().remove(&rank);
    }

    pub fn group_version(&self) -> u32 {
        self.group.lock().unwrap().1
    }

    fn engine(&self, rank: Rank) -> Result<Arc<dyn CheckHandler>> {
        if self.dead.lock().unwrap().contains(&rank) {
            return Err(CheckError::Shutdown);
        }
        self.engines
            .lock()
            .unwrap()
            .get(&rank)
            .cloned()
            .ok_or(CheckError::NoHandle)
    }

    fn root(&self) -> Result<Arc<dyn CheckHandler>> {
        self.leader.lock().unwrap().clone().ok_or(CheckError::NoHandle)
    }
}

#[async_trait]
impl ClusterTransport for MemCluster {
    async fn unicast(&self, rank: Rank, req: CheckRequest) -> Result<CheckReply> {
        match &req {
            CheckRequest::Report(_) | CheckRequest::Rejoin(_) => {
                self.root()?.handle(req).await
            }
            _ => self.engine(rank)?.handle(req).await,
        }
    }

    async fn collective(
        &self,
        ranks: &[Rank],
        req: CheckRequest,
    ) -> Vec<(Rank, Result<CheckReply>)> {
        let mut replies = Vec::with_capacity(ranks.len());
        for &rank in ranks {
            let reply = match self.engine(rank) {
                Ok(handler) => handler.handle(req.clone()).await,
                Err(err) => Err(err),
            };
            replies.push((rank, reply));
        }
        replies
    }

    async fn iv_update(&self, origin: Rank, msg: IvMessage, _sync: IvSync) -> Result<()> {
        if msg.to_leader {
            return self.root()?.iv_update(msg).await;
        }

        let engines: Vec<(Rank, Arc<dyn CheckHandler>)> = self
            .engines
            .lock()
            .unwrap()
            .iter()
            .map(|(&rank, handler)| (rank, Arc::clone(handler)))
            .collect();
        for (rank, handler) in engines {
            if self.dead.lock().unwrap().contains(&rank) {
                continue;
            }
            // The PS leader already handled its own shard.
            if msg.from_ps_leader && rank == origin {
                continue;
            }
            handler.iv_refresh(msg.clone()).await?;
        }
        Ok(())
    }

    async fn update_group(&self, ranks: &[Rank], version: u32) -> Result<()> {
        *self.group.lock().unwrap() = (ranks.to_vec(), version);
        Ok(())
    }
}
