//! A mutable object view of a decrypted payload.

use crate::payload::{
    storage_payload_fields, ContentReference, ContentType, ItemContent, Payload, PayloadContent,
    PayloadField, PayloadOverride, PayloadSource, RawPayload,
};
use chrono::{DateTime, Utc};

#[derive(Debug, Clone)]
pub struct Item {
    uuid: String,
    content_type: ContentType,
    content: Option<ItemContent>,
    deleted: bool,
    dirty: bool,
    dirtied_date: Option<DateTime<Utc>>,
    created_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
    error_decrypting: bool,
    waiting_for_key: bool,
    dummy: bool,
    last_sync_began: Option<DateTime<Utc>>,
    last_sync_end: Option<DateTime<Utc>>,
}

impl Item {
    pub fn from_payload(payload: &Payload) -> Item {
        let mut item = Item {
            uuid: payload.uuid().to_string(),
            content_type: payload.content_type().clone(),
            content: None,
            deleted: false,
            dirty: false,
            dirtied_date: None,
            created_at: None,
            updated_at: None,
            error_decrypting: false,
            waiting_for_key: false,
            dummy: false,
            last_sync_began: None,
            last_sync_end: None,
        };
        item.update_from_payload(payload);
        item
    }

    /// A placeholder for a referenced item whose payload has not arrived.
    pub fn dummy(uuid: &str, content_type: ContentType) -> Item {
        Item {
            uuid: uuid.to_string(),
            content_type,
            content: None,
            deleted: false,
            dirty: false,
            dirtied_date: None,
            created_at: None,
            updated_at: None,
            error_decrypting: false,
            waiting_for_key: false,
            dummy: true,
            last_sync_began: None,
            last_sync_end: None,
        }
    }

    /// Apply a payload onto this item, honoring the payload's field mask
    /// so absent fields are left untouched.
    pub fn update_from_payload(&mut self, payload: &Payload) {
        let has = |f: PayloadField| payload.fields().contains(&f);

        if has(PayloadField::Content) {
            match payload.content() {
                Some(PayloadContent::Decrypted(content)) => {
                    self.content = Some(content.clone());
                }
                // Encrypted content never overwrites a decrypted view; the
                // decrypt-state flags below describe it instead.
                _ => {}
            }
        }
        if has(PayloadField::Deleted) {
            self.deleted = payload.deleted();
        }
        if has(PayloadField::CreatedAt) {
            self.created_at = payload.created_at().or(self.created_at);
        }
        if has(PayloadField::UpdatedAt) {
            self.updated_at = payload.updated_at().or(self.updated_at);
        }
        if has(PayloadField::Dirty) {
            self.dirty = payload.dirty();
        }
        if has(PayloadField::DirtiedDate) {
            self.dirtied_date = payload.dirtied_date().or(self.dirtied_date);
        }
        if has(PayloadField::ErrorDecrypting) {
            self.error_decrypting = payload.error_decrypting();
        }
        if has(PayloadField::WaitingForKey) {
            self.waiting_for_key = payload.waiting_for_key();
        }
        if has(PayloadField::LastSyncBegan) {
            self.last_sync_began = payload.last_sync_began().or(self.last_sync_began);
        }
        if has(PayloadField::LastSyncEnd) {
            self.last_sync_end = payload.last_sync_end().or(self.last_sync_end);
        }
        self.dummy = false;
    }

    /// Snapshot this item as a payload.
    pub fn payload_representation(&self, source: PayloadSource) -> Payload {
        let raw = RawPayload {
            uuid: self.uuid.clone(),
            content_type: self.content_type.as_str().to_string(),
            content: self
                .content
                .as_ref()
                .and_then(|c| serde_json::to_value(c).ok()),
            deleted: if self.deleted { Some(true) } else { None },
            created_at: self.created_at,
            updated_at: self.updated_at,
            dirty: Some(self.dirty),
            ..Default::default()
        };
        let payload = Payload::from_raw(&raw, storage_payload_fields(), source);
        payload.merged_with(&PayloadOverride {
            dirtied_date: self.dirtied_date,
            error_decrypting: Some(self.error_decrypting),
            last_sync_began: self.last_sync_began,
            last_sync_end: self.last_sync_end,
            ..Default::default()
        })
    }

    pub(crate) fn clone_with_uuid(&self, uuid: &str) -> Item {
        let mut cloned = self.clone();
        cloned.uuid = uuid.to_string();
        cloned
    }

    pub fn references(&self) -> &[ContentReference] {
        self.content
            .as_ref()
            .map(|c| c.references.as_slice())
            .unwrap_or(&[])
    }

    /// Milliseconds since epoch of the server-assigned update instant, as
    /// fed into the integrity hash.
    pub fn updated_at_timestamp(&self) -> i64 {
        self.updated_at.map(|d| d.timestamp_millis()).unwrap_or(0)
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn content_type(&self) -> &ContentType {
        &self.content_type
    }

    pub fn content(&self) -> Option<&ItemContent> {
        self.content.as_ref()
    }

    pub(crate) fn set_content(&mut self, content: Option<ItemContent>) {
        self.content = content;
    }

    pub fn deleted(&self) -> bool {
        self.deleted
    }

    pub(crate) fn set_deleted(&mut self, deleted: bool) {
        self.deleted = deleted;
    }

    pub fn dirty(&self) -> bool {
        self.dirty
    }

    pub(crate) fn set_dirty(&mut self, dirty: bool) {
        self.dirty = dirty;
        if dirty {
            self.dirtied_date = Some(Utc::now());
        }
    }

    pub fn dirtied_date(&self) -> Option<DateTime<Utc>> {
        self.dirtied_date
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    pub fn error_decrypting(&self) -> bool {
        self.error_decrypting
    }

    pub fn waiting_for_key(&self) -> bool {
        self.waiting_for_key
    }

    pub fn is_dummy(&self) -> bool {
        self.dummy
    }

    pub fn last_sync_began(&self) -> Option<DateTime<Utc>> {
        self.last_sync_began
    }

    pub(crate) fn set_last_sync_began(&mut self, instant: DateTime<Utc>) {
        self.last_sync_began = Some(instant);
    }

    pub fn last_sync_end(&self) -> Option<DateTime<Utc>> {
        self.last_sync_end
    }
}
