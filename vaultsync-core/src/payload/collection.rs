//! Grouped payloads tagged by source.

use crate::payload::{Payload, PayloadSource};
use std::collections::HashMap;

/// An immutable set of payloads with a single source tag, uuid-indexed
/// with O(1) lookup and preserved insertion order. Derivation returns a
/// new collection.
#[derive(Debug, Clone)]
pub struct PayloadCollection {
    payloads: Vec<Payload>,
    index: HashMap<String, usize>,
    source: PayloadSource,
}

impl PayloadCollection {
    pub fn new(payloads: Vec<Payload>, source: PayloadSource) -> Self {
        let mut index = HashMap::with_capacity(payloads.len());
        for (position, payload) in payloads.iter().enumerate() {
            index.insert(payload.uuid().to_string(), position);
        }
        Self {
            payloads,
            index,
            source,
        }
    }

    pub fn empty(source: PayloadSource) -> Self {
        Self::new(Vec::new(), source)
    }

    pub fn source(&self) -> PayloadSource {
        self.source
    }

    pub fn find(&self, uuid: &str) -> Option<&Payload> {
        self.index.get(uuid).map(|&position| &self.payloads[position])
    }

    pub fn all(&self) -> &[Payload] {
        &self.payloads
    }

    pub fn uuids(&self) -> Vec<String> {
        self.payloads.iter().map(|p| p.uuid().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.payloads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payloads.is_empty()
    }

    /// Derive a new collection with `payload` added or replacing its uuid's
    /// existing entry.
    pub fn merged_with_payload(&self, payload: Payload) -> Self {
        let mut payloads = self.payloads.clone();
        match self.index.get(payload.uuid()) {
            Some(&position) => payloads[position] = payload,
            None => payloads.push(payload),
        }
        Self::new(payloads, self.source)
    }

    /// Payloads referencing the given uuid through their decrypted content.
    pub fn payloads_referencing(&self, uuid: &str) -> Vec<&Payload> {
        self.payloads
            .iter()
            .filter(|p| {
                p.decrypted_content()
                    .map(|c| c.references_uuid(uuid))
                    .unwrap_or(false)
            })
            .collect()
    }
}
