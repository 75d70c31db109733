//! Sync event notifications.

use crate::{CoreError, Result};
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// The local database finished loading into the item graph.
    DatabaseLoaded,
    /// A full multi-round sync completed.
    FullSyncCompleted,
    /// A completed sync involved at least the major-change threshold of
    /// items; hosts typically do a hard UI reload.
    MajorDataChange,
    /// Integrity checks diverged for too many consecutive rounds.
    EnterOutOfSync,
    /// Out-of-sync recovery completed and integrity matches again.
    ExitOutOfSync,
    /// The server rejected the session (401); syncing stops until re-auth.
    InvalidSession,
    /// A transport or server failure suspended the sync round.
    SyncError(String),
}

type Observer = Box<dyn Fn(&SyncEvent) + Send + Sync>;

/// Multi-listener registry keyed by a stable name.
#[derive(Default)]
pub struct EventRegistry {
    observers: Mutex<Vec<(String, Observer)>>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_observer(
        &self,
        name: impl Into<String>,
        observer: impl Fn(&SyncEvent) + Send + Sync + 'static,
    ) -> Result<()> {
        self.observers
            .lock()
            .map_err(|_| CoreError::Lock("event registry".to_string()))?
            .push((name.into(), Box::new(observer)));
        Ok(())
    }

    pub fn remove_observer(&self, name: &str) -> Result<()> {
        self.observers
            .lock()
            .map_err(|_| CoreError::Lock("event registry".to_string()))?
            .retain(|(n, _)| n != name);
        Ok(())
    }

    pub fn notify(&self, event: &SyncEvent) -> Result<()> {
        let observers = self
            .observers
            .lock()
            .map_err(|_| CoreError::Lock("event registry".to_string()))?;
        for (_, observer) in observers.iter() {
            observer(event);
        }
        Ok(())
    }
}
