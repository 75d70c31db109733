//! The persistent-store interface the core consumes.
//!
//! The real store is a host concern (SQLite, IndexedDB, files); the core
//! only needs a key/value blob store for serialized payloads plus a few
//! reserved metadata keys. An in-memory implementation ships for tests
//! and hosts without a database.

use crate::payload::RawPayload;
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;

/// Reserved key: the server sync token of the last completed round.
pub const LAST_SYNC_TOKEN_KEY: &str = "LAST_SYNC_TOKEN";

/// Reserved key: the pagination cursor of an interrupted multi-round sync.
pub const PAGINATION_TOKEN_KEY: &str = "PAGINATION_TOKEN";

/// Reserved key: the local copy of the account's root key params.
pub const ROOT_KEY_PARAMS_KEY: &str = "ROOT_KEY_PARAMS";

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Lock poisoned: {0}")]
    LockPoisoned(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Key/value blob store for serialized payloads and sync metadata.
pub trait PersistentStore: Send + Sync {
    fn get_all_raw_payloads(&self) -> Result<Vec<RawPayload>>;
    fn save_payloads(&self, payloads: &[RawPayload]) -> Result<()>;
    fn delete_payloads(&self, uuids: &[String]) -> Result<()>;
    fn get_value(&self, key: &str) -> Result<Option<serde_json::Value>>;
    fn set_value(&self, key: &str, value: serde_json::Value) -> Result<()>;
    fn remove_value(&self, key: &str) -> Result<()>;
}

/// In-memory store.
#[derive(Default)]
pub struct MemoryStore {
    payloads: Mutex<HashMap<String, RawPayload>>,
    values: Mutex<HashMap<String, serde_json::Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MemoryStore {
    fn lock_payloads(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, RawPayload>>> {
        self.payloads
            .lock()
            .map_err(|_| StorageError::LockPoisoned("payloads".to_string()))
    }

    fn lock_values(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, serde_json::Value>>> {
        self.values
            .lock()
            .map_err(|_| StorageError::LockPoisoned("values".to_string()))
    }
}

impl PersistentStore for MemoryStore {
    fn get_all_raw_payloads(&self) -> Result<Vec<RawPayload>> {
        let payloads = self.lock_payloads()?;
        Ok(payloads.values().cloned().collect())
    }

    fn save_payloads(&self, incoming: &[RawPayload]) -> Result<()> {
        let mut payloads = self.lock_payloads()?;
        for payload in incoming {
            payloads.insert(payload.uuid.clone(), payload.clone());
        }
        Ok(())
    }

    fn delete_payloads(&self, uuids: &[String]) -> Result<()> {
        let mut payloads = self.lock_payloads()?;
        for uuid in uuids {
            payloads.remove(uuid);
        }
        Ok(())
    }

    fn get_value(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let values = self.lock_values()?;
        Ok(values.get(key).cloned())
    }

    fn set_value(&self, key: &str, value: serde_json::Value) -> Result<()> {
        let mut values = self.lock_values()?;
        values.insert(key.to_string(), value);
        Ok(())
    }

    fn remove_value(&self, key: &str) -> Result<()> {
        let mut values = self.lock_values()?;
        values.remove(key);
        Ok(())
    }
}
