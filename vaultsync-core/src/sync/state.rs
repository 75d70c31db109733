//! Integrity tracking and out-of-sync state.

use crate::crypto::sha256_hex;

/// Consecutive mismatched integrity checks tolerated before entering the
/// out-of-sync state.
pub const MAX_DISCORDANCE: u32 = 5;

/// SHA-256 hex digest over the comma-joined update timestamps. The server
/// computes the same digest over the same set.
pub fn compute_integrity_hash(timestamps_desc: &[i64]) -> String {
    let joined = timestamps_desc
        .iter()
        .map(i64::to_string)
        .collect::<Vec<_>>()
        .join(",");
    sha256_hex(&joined)
}

/// Outcome of recording one integrity check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrityOutcome {
    InSync,
    /// Mismatch recorded, still under the discordance limit.
    Discordant,
    EnteredOutOfSync,
    ExitedOutOfSync,
}

#[derive(Debug, Default)]
pub struct SyncState {
    discordance: u32,
    out_of_sync: bool,
}

impl SyncState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn out_of_sync(&self) -> bool {
        self.out_of_sync
    }

    pub fn discordance(&self) -> u32 {
        self.discordance
    }

    /// Record an integrity comparison and report the resulting transition.
    pub fn record_integrity_check(&mut self, hashes_match: bool) -> IntegrityOutcome {
        if hashes_match {
            self.discordance = 0;
            if self.out_of_sync {
                self.out_of_sync = false;
                IntegrityOutcome::ExitedOutOfSync
            } else {
                IntegrityOutcome::InSync
            }
        } else {
            self.discordance += 1;
            if self.discordance >= MAX_DISCORDANCE && !self.out_of_sync {
                self.out_of_sync = true;
                IntegrityOutcome::EnteredOutOfSync
            } else {
                IntegrityOutcome::Discordant
            }
        }
    }

    pub fn reset(&mut self) {
        self.discordance = 0;
        self.out_of_sync = false;
    }
}
