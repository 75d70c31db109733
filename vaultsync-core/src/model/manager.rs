//! The model manager: authoritative owner of the item graph.
//!
//! Maintains the uuid-indexed items map, the inverse reference index,
//! and the dirty set. All item mutation funnels through payload mapping
//! so every state change is traceable to a payload and its source.

use crate::model::Item;
use crate::payload::{
    contents_equal, ContentReference, ContentType, Payload, PayloadCollection, PayloadContent,
    PayloadOverride, PayloadSource,
};
use chrono::Utc;
use std::collections::{BTreeSet, HashMap};
use tracing::debug;
use uuid::Uuid;

type MappingObserver = Box<dyn Fn(&[String], PayloadSource) + Send + Sync>;

#[derive(Default)]
pub struct ModelManager {
    items: HashMap<String, Item>,
    insertion_order: Vec<String>,
    inverse_references: HashMap<String, BTreeSet<String>>,
    dirty: BTreeSet<String>,
    observers: Vec<(String, MappingObserver)>,
}

impl ModelManager {
    pub fn new() -> Self {
        Self::default()
    }

    // --- Mapping ---

    /// Create or update items from payloads, maintaining the inverse
    /// reference index and the dirty set. Placeholder items are created
    /// for referenced uuids that have no payload yet, and promoted when
    /// the real payload arrives. Returns the mapped uuids.
    pub fn map_payloads_to_local_items(
        &mut self,
        payloads: &[Payload],
        source: PayloadSource,
    ) -> Vec<String> {
        let mut mapped = Vec::with_capacity(payloads.len());
        for payload in payloads {
            if payload.uuid().is_empty() {
                continue;
            }
            let uuid = payload.uuid().to_string();

            if payload.discardable() {
                self.remove_item(&uuid);
                mapped.push(uuid);
                continue;
            }

            let old_references: Vec<String> = self
                .items
                .get(&uuid)
                .map(|item| item.references().iter().map(|r| r.uuid.clone()).collect())
                .unwrap_or_default();

            if let Some(existing) = self.items.get_mut(&uuid) {
                existing.update_from_payload(payload);
            } else {
                self.insertion_order.push(uuid.clone());
                self.items.insert(uuid.clone(), Item::from_payload(payload));
            }

            let (new_references, is_dirty) = {
                let item = &self.items[&uuid];
                (item.references().to_vec(), item.dirty())
            };

            self.reindex_references(&uuid, &old_references, &new_references);
            for reference in &new_references {
                if !self.items.contains_key(&reference.uuid) {
                    self.insertion_order.push(reference.uuid.clone());
                    self.items.insert(
                        reference.uuid.clone(),
                        Item::dummy(&reference.uuid, ContentType::parse(&reference.content_type)),
                    );
                }
            }

            if is_dirty {
                self.dirty.insert(uuid.clone());
            } else {
                self.dirty.remove(&uuid);
            }
            mapped.push(uuid);
        }

        if !mapped.is_empty() {
            debug!(count = mapped.len(), ?source, "mapped payloads");
            for (_, observer) in &self.observers {
                observer(&mapped, source);
            }
        }
        mapped
    }

    fn remove_item(&mut self, uuid: &str) {
        if let Some(item) = self.items.remove(uuid) {
            let targets: Vec<String> = item.references().iter().map(|r| r.uuid.clone()).collect();
            for target in targets {
                if let Some(referrers) = self.inverse_references.get_mut(&target) {
                    referrers.remove(uuid);
                }
            }
        }
        self.insertion_order.retain(|u| u != uuid);
        self.dirty.remove(uuid);
    }

    fn reindex_references(
        &mut self,
        uuid: &str,
        old_targets: &[String],
        new_references: &[ContentReference],
    ) {
        for target in old_targets {
            if !new_references.iter().any(|r| &r.uuid == target) {
                if let Some(referrers) = self.inverse_references.get_mut(target) {
                    referrers.remove(uuid);
                }
            }
        }
        for reference in new_references {
            self.inverse_references
                .entry(reference.uuid.clone())
                .or_default()
                .insert(uuid.to_string());
        }
    }

    // --- Import ---

    /// Import a batch of external decrypted payloads.
    ///
    /// Per payload: unknown uuid maps as new; a structurally equal local
    /// copy is a no-op; a divergent local copy survives and the incoming
    /// payload is imported as a new-uuid duplicate with no reference
    /// rewriting. All comparisons use the local snapshot taken before any
    /// payload in the batch is mapped, so cascading updates cannot trigger
    /// false duplicates. Returns the uuids that became new items.
    pub fn import_items_from_raw(&mut self, payloads: &[Payload]) -> Vec<String> {
        let snapshot: HashMap<String, Option<PayloadContent>> = self
            .items
            .iter()
            .filter(|(_, item)| !item.is_dummy())
            .map(|(uuid, item)| {
                (
                    uuid.clone(),
                    item.content().cloned().map(PayloadContent::Decrypted),
                )
            })
            .collect();

        let mut created = Vec::new();
        let mut duplicated_contents: Vec<Option<PayloadContent>> = Vec::new();

        for payload in payloads {
            let incoming_content = payload.content().cloned();
            match snapshot.get(payload.uuid()) {
                None => {
                    let imported = payload.merged_with(&PayloadOverride {
                        dirty: Some(true),
                        dirtied_date: Some(Utc::now()),
                        source: Some(PayloadSource::FileImport),
                        ..Default::default()
                    });
                    self.map_payloads_to_local_items(&[imported], PayloadSource::FileImport);
                    created.push(payload.uuid().to_string());
                }
                Some(local_content) => {
                    if contents_equal(local_content.as_ref(), incoming_content.as_ref()) {
                        continue;
                    }
                    // A duplicate already exists locally, or was created
                    // earlier in this batch; importing again is a no-op.
                    let already_duplicated = snapshot.values().chain(duplicated_contents.iter()).any(
                        |content| {
                            contents_equal(content.as_ref(), incoming_content.as_ref())
                        },
                    );
                    if already_duplicated {
                        continue;
                    }

                    let new_uuid = Uuid::new_v4().to_string();
                    let duplicate = payload.merged_with(&PayloadOverride {
                        uuid: Some(new_uuid.clone()),
                        dirty: Some(true),
                        dirtied_date: Some(Utc::now()),
                        source: Some(PayloadSource::FileImport),
                        ..Default::default()
                    });
                    duplicated_contents.push(incoming_content);
                    self.map_payloads_to_local_items(&[duplicate], PayloadSource::FileImport);
                    created.push(new_uuid);
                }
            }
        }
        created
    }

    // --- Uuid alternation ---

    /// Assign a fresh uuid to an item, rewrite every referrer's reference
    /// to point at the new uuid, and mark the old item deleted and dirty.
    /// Used when local data must be re-uploaded without overwriting server
    /// data. Returns the new uuid.
    pub fn alternate_uuid_for_item(&mut self, uuid: &str) -> Option<String> {
        let item = self.items.get(uuid)?.clone();
        let new_uuid = Uuid::new_v4().to_string();

        let mut renamed = item.clone_with_uuid(&new_uuid);
        renamed.set_dirty(true);
        self.insertion_order.push(new_uuid.clone());
        for reference in renamed.references() {
            self.inverse_references
                .entry(reference.uuid.clone())
                .or_default()
                .insert(new_uuid.clone());
        }
        self.items.insert(new_uuid.clone(), renamed);
        self.dirty.insert(new_uuid.clone());

        // Rewrite referrers from the old uuid to the new one.
        let referrers: Vec<String> = self
            .inverse_references
            .get(uuid)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        for referrer_uuid in &referrers {
            if let Some(referrer) = self.items.get_mut(referrer_uuid) {
                if let Some(content) = referrer.content() {
                    let mut updated = content.clone();
                    for reference in &mut updated.references {
                        if reference.uuid == uuid {
                            reference.uuid = new_uuid.clone();
                        }
                    }
                    referrer.set_content(Some(updated));
                    referrer.set_dirty(true);
                    self.dirty.insert(referrer_uuid.clone());
                }
            }
            self.inverse_references
                .entry(new_uuid.clone())
                .or_default()
                .insert(referrer_uuid.clone());
        }
        self.inverse_references.remove(uuid);

        if let Some(old) = self.items.get_mut(uuid) {
            old.set_deleted(true);
            old.set_dirty(true);
        }
        self.dirty.insert(uuid.to_string());

        Some(new_uuid)
    }

    // --- Dirty tracking ---

    pub fn set_items_dirty(&mut self, uuids: &[String], dirty: bool) {
        for uuid in uuids {
            if let Some(item) = self.items.get_mut(uuid) {
                item.set_dirty(dirty);
                if dirty {
                    self.dirty.insert(uuid.clone());
                } else {
                    self.dirty.remove(uuid);
                }
            }
        }
    }

    pub fn mark_all_items_as_needing_sync(&mut self) {
        let uuids: Vec<String> = self
            .items
            .iter()
            .filter(|(_, item)| !item.is_dummy())
            .map(|(uuid, _)| uuid.clone())
            .collect();
        self.set_items_dirty(&uuids, true);
    }

    pub fn dirty_items(&self) -> Vec<&Item> {
        self.ordered_uuids()
            .filter_map(|uuid| self.items.get(uuid))
            .filter(|item| item.dirty())
            .collect()
    }

    pub fn mark_items_sync_began(&mut self, uuids: &[String]) {
        let now = Utc::now();
        for uuid in uuids {
            if let Some(item) = self.items.get_mut(uuid) {
                item.set_last_sync_began(now);
            }
        }
    }

    // --- Queries ---

    pub fn find(&self, uuid: &str) -> Option<&Item> {
        self.items.get(uuid)
    }

    fn ordered_uuids(&self) -> impl Iterator<Item = &String> {
        self.insertion_order
            .iter()
            .filter(|uuid| self.items.contains_key(*uuid))
    }

    pub fn all_items(&self) -> Vec<&Item> {
        self.ordered_uuids()
            .filter_map(|uuid| self.items.get(uuid))
            .collect()
    }

    pub fn items_of_type(&self, content_type: &ContentType) -> Vec<&Item> {
        self.all_items()
            .into_iter()
            .filter(|item| item.content_type() == content_type)
            .collect()
    }

    /// Number of live items referencing the given uuid.
    pub fn referencing_items_count(&self, uuid: &str) -> usize {
        self.inverse_references
            .get(uuid)
            .map(|set| set.iter().filter(|u| self.items.contains_key(*u)).count())
            .unwrap_or(0)
    }

    /// A decrypted snapshot of the item graph as a payload collection.
    pub fn payload_snapshot(&self, source: PayloadSource) -> PayloadCollection {
        let payloads: Vec<Payload> = self
            .all_items()
            .into_iter()
            .filter(|item| !item.is_dummy())
            .map(|item| item.payload_representation(source))
            .collect();
        PayloadCollection::new(payloads, source)
    }

    /// Update timestamps feeding the integrity hash: all non-deleted,
    /// non-dummy items, sorted by `updated_at` descending.
    pub fn integrity_timestamps(&self) -> Vec<i64> {
        let mut timestamps: Vec<i64> = self
            .items
            .values()
            .filter(|item| !item.deleted() && !item.is_dummy())
            .map(Item::updated_at_timestamp)
            .collect();
        timestamps.sort_unstable_by(|a, b| b.cmp(a));
        timestamps
    }

    // --- Observers ---

    pub fn add_observer(
        &mut self,
        name: impl Into<String>,
        observer: impl Fn(&[String], PayloadSource) + Send + Sync + 'static,
    ) {
        self.observers.push((name.into(), Box::new(observer)));
    }

    pub fn remove_observer(&mut self, name: &str) {
        self.observers.retain(|(n, _)| n != name);
    }
}
