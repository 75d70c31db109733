//! Resolves a sync response into one payload collection per category.

use crate::payload::delta::{delta_remote_conflict, delta_remote_retrieved, delta_remote_saved};
use crate::payload::{Payload, PayloadCollection, PayloadSource};

/// Built per response from the decrypted response categories and a
/// snapshot of the local state taken at response time, before any payload
/// of this response is processed. All three deltas resolve against the
/// same snapshot so cascading updates inside one response cannot trigger
/// false conflicts.
pub struct ResponseResolver {
    base: PayloadCollection,
    retrieved: PayloadCollection,
    saved: PayloadCollection,
    conflicts: PayloadCollection,
    saved_or_saving: Vec<String>,
}

impl ResponseResolver {
    pub fn new(
        base: PayloadCollection,
        retrieved: Vec<Payload>,
        saved: Vec<Payload>,
        conflicts: Vec<Payload>,
        saved_or_saving: Vec<String>,
    ) -> Self {
        Self {
            base,
            retrieved: PayloadCollection::new(retrieved, PayloadSource::RemoteRetrieved),
            saved: PayloadCollection::new(saved, PayloadSource::RemoteSaved),
            conflicts: PayloadCollection::new(conflicts, PayloadSource::RemoteConflict),
            saved_or_saving,
        }
    }

    /// One resulting payload list per category, in mapping order. Item
    /// state changes are applied per category, not per payload, so the
    /// inverse indexes stay internally consistent between categories.
    pub fn resolved_collections(&self) -> Vec<(PayloadSource, Vec<Payload>)> {
        vec![
            (
                PayloadSource::RemoteRetrieved,
                delta_remote_retrieved(&self.base, &self.retrieved, &self.saved_or_saving),
            ),
            (
                PayloadSource::RemoteSaved,
                delta_remote_saved(&self.base, &self.saved),
            ),
            (
                PayloadSource::RemoteConflict,
                delta_remote_conflict(&self.base, &self.conflicts),
            ),
        ]
    }
}
