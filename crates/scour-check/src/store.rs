//! Typed wrappers over the sys-level KV table (the bookmark & property
//! store). Wrappers log at WARN and hand the store's error back verbatim;
//! retry is the caller's business.

use std::sync::Arc;

use scour_core::bookmark::{InstanceBookmark, PoolBookmark, BK_MAGIC_POOL};
use scour_core::policy::Property;
use scour_core::ports::SysDb;
use scour_core::types::Rank;
use scour_core::{CheckError, Result};
use uuid::Uuid;

pub const KEY_LEADER: &str = "leader";
pub const KEY_ENGINE: &str = "engine";
pub const KEY_PROPERTY: &str = "property";
pub const KEY_RANKS: &str = "ranks";

/// The bookmark & property store for one rank.
#[derive(Clone)]
pub struct CheckStore {
    db: Arc<dyn SysDb>,
}

impl CheckStore {
    pub fn new(db: Arc<dyn SysDb>) -> Self {
        Self { db }
    }

    async fn fetch_json<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let Some(raw) = self.db.fetch(key).await.inspect_err(|err| {
            tracing::warn!(key, %err, "failed to fetch record");
        })?
        else {
            return Ok(None);
        };
        let value = serde_json::from_slice(&raw)
            .map_err(|err| CheckError::Io(format!("corrupt record under {key}: {err}")))?;
        Ok(Some(value))
    }

    async fn upsert_json<T: serde::Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let raw = serde_json::to_vec(value)
            .map_err(|err| CheckError::Internal(format!("encode {key}: {err}")))?;
        self.db.upsert(key, raw).await.inspect_err(|err| {
            tracing::warn!(key, %err, "failed to update record");
        })
    }

    pub async fn fetch_leader(&self) -> Result<Option<InstanceBookmark>> {
        self.fetch_json(KEY_LEADER).await
    }

    pub async fn update_leader(&self, bk: &InstanceBookmark) -> Result<()> {
        self.upsert_json(KEY_LEADER, bk).await
    }

    pub async fn delete_leader(&self) -> Result<()> {
        self.db.delete(KEY_LEADER).await.inspect_err(|err| {
            tracing::warn!(%err, "failed to delete leader bookmark");
        })
    }

    pub async fn fetch_engine(&self) -> Result<Option<InstanceBookmark>> {
        self.fetch_json(KEY_ENGINE).await
    }

    pub async fn update_engine(&self, bk: &InstanceBookmark) -> Result<()> {
        self.upsert_json(KEY_ENGINE, bk).await
    }

    pub async fn delete_engine(&self) -> Result<()> {
        self.db.delete(KEY_ENGINE).await.inspect_err(|err| {
            tracing::warn!(%err, "failed to delete engine bookmark");
        })
    }

    pub async fn fetch_pool(&self, uuid: Uuid) -> Result<Option<PoolBookmark>> {
        let bk: Option<PoolBookmark> = self.fetch_json(&pool_key(uuid)).await?;
        if let Some(bk) = &bk {
            if bk.magic != BK_MAGIC_POOL {
                return Err(CheckError::Io(format!(
                    "pool bookmark magic mismatch for {uuid}: {:#x}",
                    bk.magic
                )));
            }
        }
        Ok(bk)
    }

    pub async fn update_pool(&self, uuid: Uuid, bk: &PoolBookmark) -> Result<()> {
        self.upsert_json(&pool_key(uuid), bk).await
    }

    pub async fn delete_pool(&self, uuid: Uuid) -> Result<()> {
        let key = pool_key(uuid);
        self.db.delete(&key).await.inspect_err(|err| {
            tracing::warn!(key, %err, "failed to delete pool bookmark");
        })
    }

    /// Fetch the property record and its ranks list. The two keys exist
    /// together or not at all; seeing one without the other is local
    /// corruption reported as an IO error.
    pub async fn fetch_property(&self) -> Result<Option<(Property, Vec<Rank>)>> {
        let Some(prop) = self.fetch_json::<Property>(KEY_PROPERTY).await? else {
            return Ok(None);
        };
        let ranks: Option<Vec<Rank>> = self.fetch_json(KEY_RANKS).await?;
        match ranks {
            Some(ranks) => Ok(Some((prop, ranks))),
            None => {
                tracing::warn!("property exists without ranks list; store is corrupt");
                Err(CheckError::Io("property without ranks list".into()))
            }
        }
    }

    /// Write property and ranks in one transaction.
    pub async fn update_property(&self, prop: &Property, ranks: &[Rank]) -> Result<()> {
        let prop_raw = serde_json::to_vec(prop)
            .map_err(|err| CheckError::Internal(format!("encode property: {err}")))?;
        let ranks_raw = serde_json::to_vec(&ranks)
            .map_err(|err| CheckError::Internal(format!("encode ranks: {err}")))?;
        self.db
            .upsert_many(vec![
                (KEY_PROPERTY.to_string(), prop_raw),
                (KEY_RANKS.to_string(), ranks_raw),
            ])
            .await
            .inspect_err(|err| {
                tracing::warn!(%err, "failed to update property and ranks");
            })
    }

    /// All pool uuids that currently have a bookmark.
    pub async fn pool_keys(&self) -> Result<Vec<Uuid>> {
        let keys = self.db.keys().await.inspect_err(|err| {
            tracing::warn!(%err, "failed to traverse store");
        })?;
        Ok(keys
            .iter()
            .filter_map(|key| Uuid::parse_str(key).ok())
            .collect())
    }
}

fn pool_key(uuid: Uuid) -> String {
    // Canonical lowercase hyphenated form.
    uuid.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MemSysDb;

    #[tokio::test]
    async fn property_without_ranks_is_io_error() {
        let store = CheckStore::new(Arc::new(MemSysDb::default()));
        let prop = Property::new(0);
        store
            .upsert_json(KEY_PROPERTY, &prop)
            .await
            .expect("raw write");
        assert!(matches!(
            store.fetch_property().await,
            Err(CheckError::Io(_))
        ));
    }

    #[tokio::test]
    async fn property_and_ranks_round_trip() {
        let store = CheckStore::new(Arc::new(MemSysDb::default()));
        let prop = Property::new(2);
        store.update_property(&prop, &[0, 1, 2]).await.unwrap();
        let (back, ranks) = store.fetch_property().await.unwrap().unwrap();
        assert_eq!(back, prop);
        assert_eq!(ranks, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn pool_keys_only_sees_uuid_keys() {
        let store = CheckStore::new(Arc::new(MemSysDb::default()));
        let uuid = Uuid::new_v4();
        store
            .update_pool(uuid, &PoolBookmark::new(1))
            .await
            .unwrap();
        let prop = Property::new(0);
        store.update_property(&prop, &[0]).await.unwrap();
        assert_eq!(store.pool_keys().await.unwrap(), vec![uuid]);
    }
}
