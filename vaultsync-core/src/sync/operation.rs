//! A single multi-round sync operation.

use crate::api::SYNC_UP_LIMIT;
use crate::payload::Payload;
use std::collections::VecDeque;

/// Whether the operation talks to the server or saves locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationMode {
    Account,
    Offline,
}

/// Holds the payloads pending upload and the per-operation cancellation
/// state. Popped in rounds of at most [`SYNC_UP_LIMIT`] payloads.
#[derive(Debug)]
pub struct SyncOperation {
    mode: OperationMode,
    pending: VecDeque<Payload>,
    saved_or_saving: Vec<String>,
    check_integrity: bool,
    up_limit: usize,
    cancel_locked: bool,
    cancelled: bool,
    items_involved: usize,
}

impl SyncOperation {
    pub fn new(mode: OperationMode, payloads: Vec<Payload>, check_integrity: bool) -> Self {
        let saved_or_saving = payloads.iter().map(|p| p.uuid().to_string()).collect();
        Self {
            mode,
            pending: payloads.into(),
            saved_or_saving,
            check_integrity,
            up_limit: SYNC_UP_LIMIT,
            cancel_locked: false,
            cancelled: false,
            items_involved: 0,
        }
    }

    pub fn mode(&self) -> OperationMode {
        self.mode
    }

    pub fn check_integrity(&self) -> bool {
        self.check_integrity
    }

    /// Uuids of every payload this operation uploads, used by the response
    /// resolver to keep the retrieved category from clobbering in-flight
    /// saves.
    pub fn saved_or_saving(&self) -> &[String] {
        &self.saved_or_saving
    }

    /// Take the next round's batch.
    pub fn pop_payloads(&mut self) -> Vec<Payload> {
        let take = self.pending.len().min(self.up_limit);
        self.pending.drain(..take).collect()
    }

    pub fn pending_upload_count(&self) -> usize {
        self.pending.len()
    }

    pub fn record_items_involved(&mut self, count: usize) {
        self.items_involved += count;
    }

    pub fn items_involved(&self) -> usize {
        self.items_involved
    }

    // --- Cancellation ---
    //
    // Cancellation is honored between rounds only; the lock brackets a
    // single HTTP round.

    pub fn lock_cancelation(&mut self) {
        self.cancel_locked = true;
    }

    pub fn unlock_cancelation(&mut self) {
        self.cancel_locked = false;
    }

    /// Request cancellation; returns whether it took effect.
    pub fn try_cancel(&mut self) -> bool {
        if self.cancel_locked {
            return false;
        }
        self.cancelled = true;
        true
    }

    pub fn cancelled(&self) -> bool {
        self.cancelled
    }
}
