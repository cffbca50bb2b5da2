//! The simulated storage world: pools, shards, services, containers.
//!
//! One shared `SimWorld` backs every rank's pool store and the management
//! service, so repairs made through one port are observable through the
//! others, the way the real cluster behaves.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use scour_core::clue::{PoolClue, PoolDir, SvcClue};
use scour_core::poolmap::{MapDomain, MapEntryState, MapTarget, PoolMap};
use scour_core::ports::{MgmtStore, MsPoolEntry, PoolStore};
use scour_core::types::{CheckPhase, Rank, SvcStartMode, TargetState};
use scour_core::{CheckError, Result};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct SimShard {
    pub dir: PoolDir,
    pub targets: Vec<TargetState>,
    pub containers: BTreeSet<Uuid>,
    /// (term, last_index) when this shard hosts a PS replica.
    pub svc: Option<(u64, u64)>,
    pub started: bool,
}

impl Default for SimShard {
    fn default() -> Self {
        Self {
            dir: PoolDir::Normal,
            targets: vec![TargetState::Normal],
            containers: BTreeSet::new(),
            svc: None,
            started: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SimPool {
    pub shards: BTreeMap<Rank, SimShard>,
    pub svc_replicas: Vec<Rank>,
    pub svc_leader: Option<Rank>,
    pub ps_label: Option<String>,
    pub label_seq: u64,
    pub ps_containers: BTreeSet<Uuid>,
    pub cont_ps_labels: BTreeMap<Uuid, Option<String>>,
    pub cont_target_labels: BTreeMap<Uuid, Option<String>>,
    pub map: PoolMap,
    pub exported: bool,
    pub map_flushes: u32,
    pub evictions: u32,
    pub reconfs: u32,
}

#[derive(Default)]
pub struct SimWorld {
    pub pools: Mutex<BTreeMap<Uuid, SimPool>>,
    /// The management-service registry.
    pub ms: Mutex<BTreeMap<Uuid, Option<String>>>,
    pub ms_registered: Mutex<Vec<Uuid>>,
    pub ms_deregistered: Mutex<Vec<Uuid>>,
}

impl SimWorld {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create a pool whose shards, map, and PS replicas all agree: one
    /// target per rank, every replica at the same term.
    pub fn add_healthy_pool(
        &self,
        uuid: Uuid,
        ranks: &[Rank],
        replicas: &[Rank],
        ps_label: Option<&str>,
    ) {
        let mut pool = SimPool {
            svc_replicas: replicas.to_vec(),
            ps_label: ps_label.map(str::to_string),
            ..Default::default()
        };
        for &rank in ranks {
            pool.shards.insert(
                rank,
                SimShard {
                    svc: replicas.contains(&rank).then_some((2, 10)),
                    ..Default::default()
                },
            );
            pool.map.domains.push(MapDomain {
                rank,
                state: MapEntryState::UpIn,
                targets: vec![MapTarget {
                    index: 0,
                    state: MapEntryState::UpIn,
                    fseq: 0,
                    checked: false,
                }],
                checked: false,
            });
        }
        pool.map.version = 1;
        self.pools.lock().unwrap().insert(uuid, pool);
    }

    /// Register the pool on the MS, the way a healthy cluster would have it.
    pub fn register_on_ms(&self, uuid: Uuid, label: Option<&str>) {
        self.ms
            .lock()
            .unwrap()
            .insert(uuid, label.map(str::to_string));
    }

    pub fn add_container(&self, pool: Uuid, cont: Uuid, on_ps: bool) {
        let mut pools = self.pools.lock().unwrap();
        let rec = pools.get_mut(&pool).expect("pool exists");
        for shard in rec.shards.values_mut() {
            shard.containers.insert(cont);
        }
        if on_ps {
            rec.ps_containers.insert(cont);
        }
    }

    pub fn pool(&self, uuid: Uuid) -> Option<SimPool> {
        self.pools.lock().unwrap().get(&uuid).cloned()
    }
}

/// One rank's view of the world through the pool-store port.
pub struct SimPoolStore {
    pub rank: Rank,
    pub world: Arc<SimWorld>,
}

#[async_trait]
impl PoolStore for SimPoolStore {
    async fn pool_exists(&self, uuid: Uuid) -> Result<bool> {
        Ok(self
            .world
            .pools
            .lock()
            .unwrap()
            .get(&uuid)
            .is_some_and(|pool| pool.shards.contains_key(&self.rank)))
    }

    async fn local_pools(&self) -> Result<Vec<Uuid>> {
        Ok(self
            .world
            .pools
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, pool)| pool.shards.contains_key(&self.rank))
            .map(|(&uuid, _)| uuid)
            .collect())
    }

    async fn collect_clue(&self, uuid: Uuid, phase: Option<CheckPhase>) -> Result<PoolClue> {
        let pools = self.world.pools.lock().unwrap();
        let pool = pools
            .get(&uuid)
            .ok_or_else(|| CheckError::NotFound(format!("pool {uuid}")))?;
        let shard = pool
            .shards
            .get(&self.rank)
            .ok_or_else(|| CheckError::NotFound(format!("shard {uuid} on rank {}", self.rank)))?;
        Ok(PoolClue {
            pool: uuid,
            rank: self.rank,
            dir: shard.dir,
            phase,
            label: pool.ps_label.clone(),
            label_seq: pool.label_seq,
            svc: shard.svc.map(|(term, last_index)| SvcClue {
                term,
                last_index,
                replicas: pool.svc_replicas.clone(),
            }),
            svc_busy: false,
            targets: shard.targets.clone(),
        })
    }

    async fn start_shard(&self, uuid: Uuid) -> Result<()> {
        let mut pools = self.world.pools.lock().unwrap();
        let pool = pools
            .get_mut(&uuid)
            .ok_or_else(|| CheckError::NotFound(format!("pool {uuid}")))?;
        let shard = pool
            .shards
            .get_mut(&self.rank)
            .ok_or_else(|| CheckError::NotFound(format!("shard {uuid} on rank {}", self.rank)))?;
        shard.started = true;
        Ok(())
    }

    async fn stop_shard(&self, uuid: Uuid) -> Result<()> {
        let mut pools = self.world.pools.lock().unwrap();
        if let Some(pool) = pools.get_mut(&uuid) {
            if let Some(shard) = pool.shards.get_mut(&self.rank) {
                shard.started = false;
            }
        }
        Ok(())
    }

    async fn start_svc(&self, uuid: Uuid, mode: SvcStartMode) -> Result<()> {
        let mut pools = self.world.pools.lock().unwrap();
        let pool = pools
            .get_mut(&uuid)
            .ok_or_else(|| CheckError::NotFound(format!("pool {uuid}")))?;
        if mode == SvcStartMode::Dictate {
            pool.svc_replicas = vec![self.rank];
        }
        pool.svc_leader = Some(self.rank);
        Ok(())
    }

    async fn stop_svc(&self, uuid: Uuid) -> Result<()> {
        let mut pools = self.world.pools.lock().unwrap();
        if let Some(pool) = pools.get_mut(&uuid) {
            if pool.svc_leader == Some(self.rank) {
                pool.svc_leader = None;
            }
        }
        Ok(())
    }

    async fn export_svc(&self, uuid: Uuid) -> Result<()> {
        let mut pools = self.world.pools.lock().unwrap();
        let pool = pools
            .get_mut(&uuid)
            .ok_or_else(|| CheckError::NotFound(format!("pool {uuid}")))?;
        pool.exported = true;
        Ok(())
    }

    async fn svc_leader(&self, uuid: Uuid) -> Result<Option<Rank>> {
        Ok(self
            .world
            .pools
            .lock()
            .unwrap()
            .get(&uuid)
            .and_then(|pool| pool.svc_leader))
    }

    async fn destroy_shard(&self, uuid: Uuid, rank: Rank, index: Option<u32>) -> Result<()> {
        let mut pools = self.world.pools.lock().unwrap();
        let pool = pools
            .get_mut(&uuid)
            .ok_or_else(|| CheckError::NotFound(format!("pool {uuid}")))?;
        match index {
            None => {
                pool.shards.remove(&rank);
            }
            Some(index) => {
                if let Some(shard) = pool.shards.get_mut(&rank) {
                    if let Some(slot) = shard.targets.get_mut(index as usize) {
                        *slot = TargetState::Nonexist;
                    }
                }
            }
        }
        Ok(())
    }

    async fn load_map(&self, uuid: Uuid) -> Result<PoolMap> {
        self.world
            .pools
            .lock()
            .unwrap()
            .get(&uuid)
            .map(|pool| pool.map.clone())
            .ok_or_else(|| CheckError::NotFound(format!("pool {uuid}")))
    }

    async fn flush_map(&self, uuid: Uuid, map: &PoolMap) -> Result<()> {
        let mut pools = self.world.pools.lock().unwrap();
        let pool = pools
            .get_mut(&uuid)
            .ok_or_else(|| CheckError::NotFound(format!("pool {uuid}")))?;
        pool.map = map.clone();
        pool.map_flushes += 1;
        Ok(())
    }

    async fn target_states(&self, uuid: Uuid) -> Result<Vec<TargetState>> {
        Ok(self
            .world
            .pools
            .lock()
            .unwrap()
            .get(&uuid)
            .and_then(|pool| pool.shards.get(&self.rank))
            .map(|shard| shard.targets.clone())
            .unwrap_or_default())
    }

    async fn ps_label(&self, uuid: Uuid) -> Result<Option<String>> {
        Ok(self
            .world
            .pools
            .lock()
            .unwrap()
            .get(&uuid)
            .and_then(|pool| pool.ps_label.clone()))
    }

    async fn update_ps_label(&self, uuid: Uuid, label: Option<&str>) -> Result<()> {
        let mut pools = self.world.pools.lock().unwrap();
        let pool = pools
            .get_mut(&uuid)
            .ok_or_else(|| CheckError::NotFound(format!("pool {uuid}")))?;
        pool.ps_label = label.map(str::to_string);
        Ok(())
    }

    async fn shard_containers(&self, uuid: Uuid) -> Result<Vec<Uuid>> {
        Ok(self
            .world
            .pools
            .lock()
            .unwrap()
            .get(&uuid)
            .and_then(|pool| pool.shards.get(&self.rank))
            .map(|shard| shard.containers.iter().copied().collect())
            .unwrap_or_default())
    }

    async fn ps_containers(&self, uuid: Uuid) -> Result<Vec<Uuid>> {
        Ok(self
            .world
            .pools
            .lock()
            .unwrap()
            .get(&uuid)
            .map(|pool| pool.ps_containers.iter().copied().collect())
            .unwrap_or_default())
    }

    async fn cont_ps_label(&self, pool: Uuid, cont: Uuid) -> Result<Option<String>> {
        Ok(self
            .world
            .pools
            .lock()
            .unwrap()
            .get(&pool)
            .and_then(|rec| rec.cont_ps_labels.get(&cont).cloned())
            .flatten())
    }

    async fn cont_target_label(&self, pool: Uuid, cont: Uuid) -> Result<Option<String>> {
        Ok(self
            .world
            .pools
            .lock()
            .unwrap()
            .get(&pool)
            .and_then(|rec| rec.cont_target_labels.get(&cont).cloned())
            .flatten())
    }

    async fn set_cont_label(
        &self,
        pool: Uuid,
        cont: Uuid,
        label: Option<&str>,
        on_target: bool,
    ) -> Result<()> {
        let mut pools = self.world.pools.lock().unwrap();
        let rec = pools
            .get_mut(&pool)
            .ok_or_else(|| CheckError::NotFound(format!("pool {pool}")))?;
        let table = if on_target {
            &mut rec.cont_target_labels
        } else {
            &mut rec.cont_ps_labels
        };
        table.insert(cont, label.map(str::to_string));
        Ok(())
    }

    async fn destroy_cont(&self, pool: Uuid, cont: Uuid) -> Result<()> {
        let mut pools = self.world.pools.lock().unwrap();
        let rec = pools
            .get_mut(&pool)
            .ok_or_else(|| CheckError::NotFound(format!("pool {pool}")))?;
        for shard in rec.shards.values_mut() {
            shard.containers.remove(&cont);
        }
        rec.cont_target_labels.remove(&cont);
        Ok(())
    }

    async fn evict_connections(&self, uuid: Uuid) -> Result<()> {
        if let Some(pool) = self.world.pools.lock().unwrap().get_mut(&uuid) {
            pool.evictions += 1;
        }
        Ok(())
    }

    async fn schedule_reconf(&self, uuid: Uuid) -> Result<()> {
        if let Some(pool) = self.world.pools.lock().unwrap().get_mut(&uuid) {
            pool.reconfs += 1;
        }
        Ok(())
    }
}

/// The management service over the same world.
pub struct SimMgmt {
    pub world: Arc<SimWorld>,
}

#[async_trait]
impl MgmtStore for SimMgmt {
    async fn list_pools(&self) -> Result<Vec<MsPoolEntry>> {
        Ok(self
            .world
            .ms
            .lock()
            .unwrap()
            .iter()
            .map(|(&uuid, label)| MsPoolEntry {
                uuid,
                label: label.clone(),
            })
            .collect())
    }

    async fn register_pool(
        &self,
        _seq: u64,
        uuid: Uuid,
        label: Option<&str>,
        _replicas: &[Rank],
    ) -> Result<()> {
        self.world
            .ms
            .lock()
            .unwrap()
            .insert(uuid, label.map(str::to_string));
        self.world.ms_registered.lock().unwrap().push(uuid);
        Ok(())
    }

    async fn deregister_pool(&self, _seq: u64, uuid: Uuid) -> Result<()> {
        if self.world.ms.lock().unwrap().remove(&uuid).is_none() {
            return Err(CheckError::NotFound(format!("pool {uuid}")));
        }
        self.world.ms_deregistered.lock().unwrap().push(uuid);
        Ok(())
    }

    async fn destroy_pool(&self, _seq: u64, uuid: Uuid, ranks: &[Rank]) -> Result<()> {
        let mut pools = self.world.pools.lock().unwrap();
        if let Some(pool) = pools.get_mut(&uuid) {
            for rank in ranks {
                pool.shards.remove(rank);
            }
            if pool.shards.is_empty() {
                pools.remove(&uuid);
            }
        }
        Ok(())
    }

    async fn reset_svc(&self, uuid: Uuid, keep: Rank, evict: &[Rank]) -> Result<()> {
        let mut pools = self.world.pools.lock().unwrap();
        let pool = pools
            .get_mut(&uuid)
            .ok_or_else(|| CheckError::NotFound(format!("pool {uuid}")))?;
        for rank in evict {
            if let Some(shard) = pool.shards.get_mut(rank) {
                shard.svc = None;
            }
        }
        pool.svc_replicas = vec![keep];
        Ok(())
    }

    async fn update_label(&self, _seq: u64, uuid: Uuid, label: Option<&str>) -> Result<()> {
        let mut ms = self.world.ms.lock().unwrap();
        match ms.get_mut(&uuid) {
            Some(slot) => {
                *slot = label.map(str::to_string);
                Ok(())
            }
            None => Err(CheckError::NotFound(format!("pool {uuid}"))),
        }
    }
}
