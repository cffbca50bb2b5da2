//! Whole-cluster simulation: one leader plus N engines over the loopback
//! transport, each rank with its own sys DB and a pool-store view of the
//! shared world.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use scour_check::{CheckEngine, CheckLeader, StartRequest};
use scour_core::ports::CheckHandler;
use scour_core::types::{InstanceStatus, Rank, StartFlags};
use scour_core::Result;

use crate::memdb::MemSysDb;
use crate::sink::CapturingSink;
use crate::transport::MemCluster;
use crate::world::{SimMgmt, SimPoolStore, SimWorld};

pub struct SimCluster {
    pub ranks: Vec<Rank>,
    pub world: Arc<SimWorld>,
    pub transport: Arc<MemCluster>,
    pub sink: Arc<CapturingSink>,
    pub leader: Arc<CheckLeader>,
    pub engines: BTreeMap<Rank, Arc<CheckEngine>>,
    pub dbs: BTreeMap<Rank, Arc<MemSysDb>>,
}

impl SimCluster {
    /// Build a cluster; the leader runs on the first rank and shares that
    /// rank's sys DB with its co-resident engine.
    pub async fn new(ranks: &[Rank], world: Arc<SimWorld>) -> Result<Self> {
        let transport = MemCluster::new();
        let sink = Arc::new(CapturingSink::default());

        let mut dbs = BTreeMap::new();
        for &rank in ranks {
            dbs.insert(rank, Arc::new(MemSysDb::default()));
        }

        let leader_rank = ranks[0];
        let leader = CheckLeader::new(
            leader_rank,
            Arc::clone(&dbs[&leader_rank]) as _,
            Arc::clone(&transport) as _,
            Arc::new(SimMgmt {
                world: Arc::clone(&world),
            }),
            Arc::clone(&sink) as _,
        )
        .await?;
        transport.register_leader(Arc::clone(&leader) as Arc<dyn CheckHandler>);

        let mut engines = BTreeMap::new();
        for &rank in ranks {
            let engine = CheckEngine::new(
                rank,
                Arc::clone(&dbs[&rank]) as _,
                Arc::clone(&transport) as _,
                Arc::new(SimPoolStore {
                    rank,
                    world: Arc::clone(&world),
                }),
            )
            .await?;
            transport.register_engine(rank, Arc::clone(&engine) as Arc<dyn CheckHandler>);
            if rank == leader_rank {
                engine.set_local_leader(Arc::clone(&leader) as Arc<dyn CheckHandler>);
            }
            engines.insert(rank, engine);
        }

        Ok(Self {
            ranks: ranks.to_vec(),
            world,
            transport,
            sink,
            leader,
            engines,
            dbs,
        })
    }

    pub async fn start(&self, flags: StartFlags) -> Result<()> {
        self.leader
            .start(StartRequest {
                ranks: self.ranks.clone(),
                policies: Vec::new(),
                pools: Vec::new(),
                flags,
                phase_limit: None,
            })
            .await
    }

    /// Simulate an engine process crash and restart: the handler is swapped
    /// for a fresh instance built over the surviving sys DB.
    pub async fn restart_engine(&mut self, rank: Rank) -> Result<Arc<CheckEngine>> {
        let engine = CheckEngine::new(
            rank,
            Arc::clone(&self.dbs[&rank]) as _,
            Arc::clone(&self.transport) as _,
            Arc::new(SimPoolStore {
                rank,
                world: Arc::clone(&self.world),
            }),
        )
        .await?;
        self.transport
            .register_engine(rank, Arc::clone(&engine) as Arc<dyn CheckHandler>);
        self.engines.insert(rank, Arc::clone(&engine));
        Ok(engine)
    }

    /// Kill a rank: the transport fails its RPCs and the leader learns of
    /// the death through the event upcall.
    pub fn kill(&self, rank: Rank) {
        self.transport.kill(rank);
        self.leader.rank_dead(rank);
    }

    pub async fn leader_status(&self) -> InstanceStatus {
        self.leader.instance().bk.lock().await.status
    }

    /// Poll the leader bookmark until it reaches `status` or the timeout
    /// elapses; returns whether it got there.
    pub async fn wait_leader_status(&self, status: InstanceStatus, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.leader_status().await == status {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}
