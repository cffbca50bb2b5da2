//! In-memory sys-level KV with transactional multi-key updates.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use scour_core::ports::SysDb;
use scour_core::{CheckError, Result};

/// One rank's sys DB. Values survive a simulated process restart because
/// the harness keeps the `Arc` alive across engine rebuilds.
#[derive(Default)]
pub struct MemSysDb {
    table: Mutex<BTreeMap<String, Vec<u8>>>,
    fail_writes: Mutex<bool>,
}

impl MemSysDb {
    /// Make every write fail, for error-path tests.
    pub fn fail_writes(&self, fail: bool) {
        *self.fail_writes.lock().unwrap() = fail;
    }

    pub fn dump(&self) -> BTreeMap<String, Vec<u8>> {
        self.table.lock().unwrap().clone()
    }
}

#[async_trait]
impl SysDb for MemSysDb {
    async fn fetch(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.table.lock().unwrap().get(key).cloned())
    }

    async fn upsert(&self, key: &str, value: Vec<u8>) -> Result<()> {
        if *self.fail_writes.lock().unwrap() {
            return Err(CheckError::Io("simulated write failure".into()));
        }
        self.table.lock().unwrap().insert(key.to_string(), value);
        Ok(())
    }

    async fn upsert_many(&self, entries: Vec<(String, Vec<u8>)>) -> Result<()> {
        if *self.fail_writes.lock().unwrap() {
            return Err(CheckError::Io("simulated write failure".into()));
        }
        let mut table = self.table.lock().unwrap();
        for (key, value) in entries {
            table.insert(key, value);
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match self.table.lock().unwrap().remove(key) {
            Some(_) => Ok(()),
            None => Err(CheckError::NotFound(key.to_string())),
        }
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Ok(self.table.lock().unwrap().keys().cloned().collect())
    }
}
