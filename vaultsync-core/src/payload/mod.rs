//! The immutable payload model.
//!
//! A [`Payload`] is the vehicle records travel in between the server, the
//! persistent store, the crypto pipeline, and the item graph. Payloads are
//! immutable once constructed; every "change" is a builder-style derivation
//! that produces a new payload. The legacy subclass hierarchy is modeled as
//! a single record plus a field-presence mask ([`PayloadField`]) chosen by
//! the factory per use case, so consumers can distinguish "unset" from
//! "omitted by this payload class".

pub mod collection;
pub mod delta;

pub use collection::PayloadCollection;

use crate::protocol::{ProtocolVersion, BASE64_CONTENT_PREFIX};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Content type discriminator.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ContentType {
    Note,
    Tag,
    ItemsKey,
    Privileges,
    UserPreferences,
    Component,
    Other(String),
}

impl ContentType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Note => "Note",
            Self::Tag => "Tag",
            Self::ItemsKey => "SN|ItemsKey",
            Self::Privileges => "SN|Privileges",
            Self::UserPreferences => "SN|UserPreferences",
            Self::Component => "SN|Component",
            Self::Other(s) => s,
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "Note" => Self::Note,
            "Tag" => Self::Tag,
            "SN|ItemsKey" => Self::ItemsKey,
            "SN|Privileges" => Self::Privileges,
            "SN|UserPreferences" => Self::UserPreferences,
            "SN|Component" => Self::Component,
            other => Self::Other(other.to_string()),
        }
    }

    /// Content types required to have exactly one non-deleted instance.
    pub fn is_singleton(&self) -> bool {
        matches!(self, Self::Privileges | Self::UserPreferences)
    }

    /// Load priority during database load. Items keys must load before
    /// everything else so subsequent payloads can be decrypted.
    pub fn load_priority(&self) -> u8 {
        match self {
            Self::ItemsKey => 0,
            _ => 1,
        }
    }
}

impl std::fmt::Display for ContentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A directed reference from one item's content to another item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentReference {
    pub uuid: String,
    pub content_type: String,
}

/// Decrypted item content: a well-formed references list plus free-form
/// application data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemContent {
    #[serde(default)]
    pub references: Vec<ContentReference>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duplicate_of: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ItemContent {
    pub fn with_field(mut self, key: &str, value: serde_json::Value) -> Self {
        self.extra.insert(key.to_string(), value);
        self
    }

    pub fn field(&self, key: &str) -> Option<&serde_json::Value> {
        self.extra.get(key)
    }

    pub fn references_uuid(&self, uuid: &str) -> bool {
        self.references.iter().any(|r| r.uuid == uuid)
    }
}

/// The shape content takes inside a payload.
#[derive(Debug, Clone, PartialEq)]
pub enum PayloadContent {
    /// Version-tag-prefixed encrypted string (e.g. `"004:..."`).
    Encrypted(String),
    /// Decrypted bare object.
    Decrypted(ItemContent),
    /// Base64-encoded decrypted string, prefixed with the reserved `"000"` tag.
    Base64(String),
}

impl PayloadContent {
    /// Classify a raw JSON content value by shape and prefix.
    pub fn classify(value: &serde_json::Value) -> Option<PayloadContent> {
        match value {
            serde_json::Value::String(s) => {
                if s.starts_with(BASE64_CONTENT_PREFIX) {
                    Some(PayloadContent::Base64(s.clone()))
                } else {
                    Some(PayloadContent::Encrypted(s.clone()))
                }
            }
            serde_json::Value::Object(_) => serde_json::from_value(value.clone())
                .ok()
                .map(PayloadContent::Decrypted),
            _ => None,
        }
    }

    pub fn as_json_value(&self) -> serde_json::Value {
        match self {
            Self::Encrypted(s) | Self::Base64(s) => serde_json::Value::String(s.clone()),
            Self::Decrypted(content) => {
                serde_json::to_value(content).unwrap_or(serde_json::Value::Null)
            }
        }
    }

    pub fn as_decrypted(&self) -> Option<&ItemContent> {
        match self {
            Self::Decrypted(content) => Some(content),
            _ => None,
        }
    }
}

/// Structural equality of two optional contents, as used by the merge
/// deltas. Decrypted objects compare by deep value equality; encrypted
/// strings compare byte-wise; mixed shapes never compare equal.
pub fn contents_equal(a: Option<&PayloadContent>, b: Option<&PayloadContent>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(PayloadContent::Decrypted(a)), Some(PayloadContent::Decrypted(b))) => a == b,
        (Some(PayloadContent::Encrypted(a)), Some(PayloadContent::Encrypted(b))) => a == b,
        (Some(PayloadContent::Base64(a)), Some(PayloadContent::Base64(b))) => a == b,
        _ => false,
    }
}

/// Derived payload format, per content shape and prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadFormat {
    EncryptedString,
    DecryptedBareObject,
    DecryptedBase64String,
    Deleted,
}

/// Provenance of a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadSource {
    Constructor,
    LocalRetrieved,
    LocalSaved,
    LocalDirtied,
    RemoteRetrieved,
    RemoteSaved,
    RemoteConflict,
    ComponentRetrieved,
    FileImport,
}

/// Names of payload fields, used as presence masks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PayloadField {
    Uuid,
    ContentType,
    Content,
    EncItemKey,
    ItemsKeyId,
    Deleted,
    AuthHash,
    CreatedAt,
    UpdatedAt,
    Dirty,
    DirtiedDate,
    ErrorDecrypting,
    ErrorDecryptingChanged,
    WaitingForKey,
    LastSyncBegan,
    LastSyncEnd,
}

impl PayloadField {
    /// Fields never written to the persistent store or the wire.
    pub fn is_persistable(&self) -> bool {
        !matches!(
            self,
            Self::DirtiedDate
                | Self::ErrorDecrypting
                | Self::ErrorDecryptingChanged
                | Self::WaitingForKey
                | Self::LastSyncBegan
                | Self::LastSyncEnd
        )
    }
}

/// All fields.
pub fn max_payload_fields() -> BTreeSet<PayloadField> {
    use PayloadField::*;
    [
        Uuid, ContentType, Content, EncItemKey, ItemsKeyId, Deleted, AuthHash, CreatedAt,
        UpdatedAt, Dirty, DirtiedDate, ErrorDecrypting, ErrorDecryptingChanged, WaitingForKey,
        LastSyncBegan, LastSyncEnd,
    ]
    .into_iter()
    .collect()
}

/// Fields a server record carries.
pub fn server_payload_fields() -> BTreeSet<PayloadField> {
    use PayloadField::*;
    [
        Uuid, ContentType, Content, EncItemKey, ItemsKeyId, Deleted, AuthHash, CreatedAt,
        UpdatedAt,
    ]
    .into_iter()
    .collect()
}

/// Fields a locally stored record carries.
pub fn storage_payload_fields() -> BTreeSet<PayloadField> {
    use PayloadField::*;
    let mut fields = server_payload_fields();
    fields.extend([Dirty, DirtiedDate, ErrorDecrypting, WaitingForKey]);
    fields
}

/// Fields produced by an encryption or decryption operation.
pub fn encryption_parameters_fields() -> BTreeSet<PayloadField> {
    use PayloadField::*;
    [
        Content, EncItemKey, ItemsKeyId, AuthHash, ErrorDecrypting, ErrorDecryptingChanged,
        WaitingForKey,
    ]
    .into_iter()
    .collect()
}

/// The wire/storage projection of a payload.
///
/// `content` stays a raw JSON value here; [`Payload`] construction
/// classifies it into a [`PayloadContent`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawPayload {
    pub uuid: String,
    pub content_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enc_item_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub items_key_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dirty: Option<bool>,
}

/// Builder-style override for payload derivation. `None` keeps the base
/// payload's value; `Some` replaces it and adds the field to the mask.
#[derive(Debug, Clone, Default)]
pub struct PayloadOverride {
    pub uuid: Option<String>,
    pub content: Option<PayloadContent>,
    pub deleted: Option<bool>,
    pub dirty: Option<bool>,
    pub dirtied_date: Option<DateTime<Utc>>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub error_decrypting: Option<bool>,
    pub last_sync_began: Option<DateTime<Utc>>,
    pub last_sync_end: Option<DateTime<Utc>>,
    pub source: Option<PayloadSource>,
}

/// Immutable typed record flowing through encrypt/decrypt/merge
/// transformations.
#[derive(Debug, Clone)]
pub struct Payload {
    uuid: String,
    content_type: ContentType,
    content: Option<PayloadContent>,
    enc_item_key: Option<String>,
    items_key_id: Option<String>,
    deleted: bool,
    auth_hash: Option<String>,
    created_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
    dirty: bool,
    dirtied_date: Option<DateTime<Utc>>,
    error_decrypting: bool,
    error_decrypting_changed: bool,
    waiting_for_key: bool,
    last_sync_began: Option<DateTime<Utc>>,
    last_sync_end: Option<DateTime<Utc>>,
    format: PayloadFormat,
    source: PayloadSource,
    fields: BTreeSet<PayloadField>,
}

fn derive_format(content: Option<&PayloadContent>) -> PayloadFormat {
    match content {
        None => PayloadFormat::Deleted,
        Some(PayloadContent::Encrypted(_)) => PayloadFormat::EncryptedString,
        Some(PayloadContent::Decrypted(_)) => PayloadFormat::DecryptedBareObject,
        Some(PayloadContent::Base64(_)) => PayloadFormat::DecryptedBase64String,
    }
}

impl Payload {
    /// Construct a payload from a raw record with the given field mask.
    ///
    /// Panics if the mask requires a uuid and the record has none; that is
    /// a programmer error, not recoverable input.
    pub fn from_raw(
        raw: &RawPayload,
        fields: BTreeSet<PayloadField>,
        source: PayloadSource,
    ) -> Payload {
        if fields.contains(&PayloadField::Uuid) && raw.uuid.is_empty() {
            panic!("payload constructed without a uuid");
        }
        let content = raw.content.as_ref().and_then(PayloadContent::classify);
        let format = derive_format(content.as_ref());
        Payload {
            uuid: raw.uuid.clone(),
            content_type: ContentType::parse(&raw.content_type),
            content,
            enc_item_key: raw.enc_item_key.clone(),
            items_key_id: raw.items_key_id.clone(),
            deleted: raw.deleted.unwrap_or(false),
            auth_hash: raw.auth_hash.clone(),
            created_at: raw.created_at,
            updated_at: raw.updated_at,
            dirty: raw.dirty.unwrap_or(false),
            dirtied_date: None,
            error_decrypting: false,
            error_decrypting_changed: false,
            waiting_for_key: false,
            last_sync_began: None,
            last_sync_end: None,
            format,
            source,
            fields,
        }
    }

    /// A server-shaped payload (e.g. from a sync response).
    pub fn from_server(raw: &RawPayload, source: PayloadSource) -> Payload {
        Self::from_raw(raw, server_payload_fields(), source)
    }

    /// A storage-shaped payload (from the persistent store).
    pub fn from_storage(raw: &RawPayload) -> Payload {
        Self::from_raw(raw, storage_payload_fields(), PayloadSource::LocalRetrieved)
    }

    /// Derive a new payload, overriding the given fields. The resulting
    /// `fields` set is the union of the base mask and the overridden fields.
    pub fn merged_with(&self, ovr: &PayloadOverride) -> Payload {
        let mut next = self.clone();
        if let Some(uuid) = &ovr.uuid {
            next.uuid = uuid.clone();
            next.fields.insert(PayloadField::Uuid);
        }
        if let Some(content) = &ovr.content {
            next.content = Some(content.clone());
            next.fields.insert(PayloadField::Content);
        }
        if let Some(deleted) = ovr.deleted {
            next.deleted = deleted;
            next.fields.insert(PayloadField::Deleted);
        }
        if let Some(dirty) = ovr.dirty {
            next.dirty = dirty;
            next.fields.insert(PayloadField::Dirty);
        }
        if let Some(date) = ovr.dirtied_date {
            next.dirtied_date = Some(date);
            next.fields.insert(PayloadField::DirtiedDate);
        }
        if let Some(date) = ovr.created_at {
            next.created_at = Some(date);
            next.fields.insert(PayloadField::CreatedAt);
        }
        if let Some(date) = ovr.updated_at {
            next.updated_at = Some(date);
            next.fields.insert(PayloadField::UpdatedAt);
        }
        if let Some(err) = ovr.error_decrypting {
            next.error_decrypting = err;
            next.fields.insert(PayloadField::ErrorDecrypting);
        }
        if let Some(date) = ovr.last_sync_began {
            next.last_sync_began = Some(date);
            next.fields.insert(PayloadField::LastSyncBegan);
        }
        if let Some(date) = ovr.last_sync_end {
            next.last_sync_end = Some(date);
            next.fields.insert(PayloadField::LastSyncEnd);
        }
        if let Some(source) = ovr.source {
            next.source = source;
        }
        next.format = derive_format(next.content.as_ref());
        next
    }

    /// Derive a payload carrying the result of an encryption operation.
    pub fn with_encryption_parameters(
        &self,
        content: PayloadContent,
        enc_item_key: Option<String>,
        items_key_id: Option<String>,
        auth_hash: Option<String>,
    ) -> Payload {
        let mut next = self.clone();
        next.content = Some(content);
        next.enc_item_key = enc_item_key;
        next.items_key_id = items_key_id;
        next.auth_hash = auth_hash;
        next.error_decrypting = false;
        next.error_decrypting_changed = false;
        next.waiting_for_key = false;
        next.fields.extend(encryption_parameters_fields());
        next.format = derive_format(next.content.as_ref());
        next
    }

    /// Derive a payload carrying the result of a decryption operation.
    ///
    /// A successful decrypt replaces the content; a failed one marks
    /// `error_decrypting` and leaves the encrypted content in place so it
    /// can be retried. `error_decrypting_changed` records transitions in
    /// either direction so listeners can refresh.
    pub fn with_decrypted_parameters(
        &self,
        content: Option<ItemContent>,
        error_decrypting: bool,
        waiting_for_key: bool,
    ) -> Payload {
        let mut next = self.clone();
        if let Some(content) = content {
            next.content = Some(PayloadContent::Decrypted(content));
        }
        next.error_decrypting_changed = self.error_decrypting != error_decrypting;
        next.error_decrypting = error_decrypting;
        next.waiting_for_key = waiting_for_key;
        next.fields.extend(encryption_parameters_fields());
        next.format = derive_format(next.content.as_ref());
        next
    }

    /// The wire/storage projection: every field in the mask except the
    /// non-persistable set, with null optionals omitted.
    pub fn ejected(&self) -> RawPayload {
        let mut raw = RawPayload {
            uuid: self.uuid.clone(),
            content_type: self.content_type.as_str().to_string(),
            ..Default::default()
        };
        let has = |f: PayloadField| self.fields.contains(&f) && f.is_persistable();
        if has(PayloadField::Content) {
            raw.content = self.content.as_ref().map(PayloadContent::as_json_value);
        }
        if has(PayloadField::EncItemKey) {
            raw.enc_item_key = self.enc_item_key.clone();
        }
        if has(PayloadField::ItemsKeyId) {
            raw.items_key_id = self.items_key_id.clone();
        }
        if has(PayloadField::Deleted) && self.deleted {
            raw.deleted = Some(true);
        }
        if has(PayloadField::AuthHash) {
            raw.auth_hash = self.auth_hash.clone();
        }
        if has(PayloadField::CreatedAt) {
            raw.created_at = self.created_at;
        }
        if has(PayloadField::UpdatedAt) {
            raw.updated_at = self.updated_at;
        }
        if has(PayloadField::Dirty) {
            raw.dirty = Some(self.dirty);
        }
        raw
    }

    /// Safe to evict from the persistent store.
    pub fn discardable(&self) -> bool {
        self.deleted && !self.dirty
    }

    /// Protocol version derived from the encrypted content's 3-char tag.
    pub fn version(&self) -> Option<ProtocolVersion> {
        match &self.content {
            Some(PayloadContent::Encrypted(s)) => ProtocolVersion::from_content_string(s),
            _ => None,
        }
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn content_type(&self) -> &ContentType {
        &self.content_type
    }

    pub fn content(&self) -> Option<&PayloadContent> {
        self.content.as_ref()
    }

    pub fn decrypted_content(&self) -> Option<&ItemContent> {
        self.content.as_ref().and_then(PayloadContent::as_decrypted)
    }

    pub fn enc_item_key(&self) -> Option<&str> {
        self.enc_item_key.as_deref()
    }

    pub fn items_key_id(&self) -> Option<&str> {
        self.items_key_id.as_deref()
    }

    pub fn deleted(&self) -> bool {
        self.deleted
    }

    pub fn auth_hash(&self) -> Option<&str> {
        self.auth_hash.as_deref()
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    pub fn dirty(&self) -> bool {
        self.dirty
    }

    pub fn dirtied_date(&self) -> Option<DateTime<Utc>> {
        self.dirtied_date
    }

    pub fn error_decrypting(&self) -> bool {
        self.error_decrypting
    }

    pub fn error_decrypting_changed(&self) -> bool {
        self.error_decrypting_changed
    }

    pub fn waiting_for_key(&self) -> bool {
        self.waiting_for_key
    }

    pub fn last_sync_began(&self) -> Option<DateTime<Utc>> {
        self.last_sync_began
    }

    pub fn last_sync_end(&self) -> Option<DateTime<Utc>> {
        self.last_sync_end
    }

    pub fn format(&self) -> PayloadFormat {
        self.format
    }

    pub fn source(&self) -> PayloadSource {
        self.source
    }

    pub fn fields(&self) -> &BTreeSet<PayloadField> {
        &self.fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn note_raw(uuid: &str) -> RawPayload {
        RawPayload {
            uuid: uuid.to_string(),
            content_type: "Note".to_string(),
            content: Some(json!({
                "references": [],
                "title": "hello",
            })),
            ..Default::default()
        }
    }

    #[test]
    fn decrypted_object_content_is_classified() {
        let payload = Payload::from_server(&note_raw("n-1"), PayloadSource::RemoteRetrieved);

        assert_eq!(payload.format(), PayloadFormat::DecryptedBareObject);
        assert_eq!(payload.version(), None);
        assert_eq!(
            payload.decrypted_content().unwrap().field("title"),
            Some(&json!("hello"))
        );
    }

    #[test]
    fn encrypted_string_content_derives_version() {
        let mut raw = note_raw("n-1");
        raw.content = Some(json!("004:abc:def:ghi"));
        let payload = Payload::from_server(&raw, PayloadSource::RemoteRetrieved);

        assert_eq!(payload.format(), PayloadFormat::EncryptedString);
        assert_eq!(payload.version(), Some(ProtocolVersion::V004));
    }

    #[test]
    fn base64_prefix_is_reserved() {
        let mut raw = note_raw("n-1");
        raw.content = Some(json!("000eyJmb28iOiJiYXIifQ=="));
        let payload = Payload::from_server(&raw, PayloadSource::RemoteRetrieved);

        assert_eq!(payload.format(), PayloadFormat::DecryptedBase64String);
    }

    #[test]
    fn absent_content_is_deleted_format() {
        let mut raw = note_raw("n-1");
        raw.content = None;
        raw.deleted = Some(true);
        let payload = Payload::from_server(&raw, PayloadSource::RemoteRetrieved);

        assert_eq!(payload.format(), PayloadFormat::Deleted);
        assert!(payload.discardable());
    }

    #[test]
    #[should_panic(expected = "without a uuid")]
    fn missing_uuid_panics() {
        let raw = RawPayload {
            content_type: "Note".to_string(),
            ..Default::default()
        };
        Payload::from_server(&raw, PayloadSource::Constructor);
    }

    #[test]
    fn merged_with_unions_fields_and_keeps_base() {
        let base = Payload::from_server(&note_raw("n-1"), PayloadSource::RemoteRetrieved);
        assert!(!base.fields().contains(&PayloadField::Dirty));

        let derived = base.merged_with(&PayloadOverride {
            dirty: Some(true),
            dirtied_date: Some(Utc::now()),
            ..Default::default()
        });

        assert!(derived.dirty());
        assert!(derived.fields().contains(&PayloadField::Dirty));
        assert!(derived.fields().contains(&PayloadField::DirtiedDate));
        // The base payload is untouched.
        assert!(!base.dirty());
        assert_eq!(derived.uuid(), base.uuid());
    }

    #[test]
    fn ejected_excludes_non_persistable_fields() {
        let base = Payload::from_raw(
            &note_raw("n-1"),
            max_payload_fields(),
            PayloadSource::Constructor,
        );
        let derived = base.merged_with(&PayloadOverride {
            dirty: Some(true),
            dirtied_date: Some(Utc::now()),
            last_sync_end: Some(Utc::now()),
            ..Default::default()
        });

        let ejected = derived.ejected();
        let value = serde_json::to_value(&ejected).unwrap();

        assert_eq!(value["dirty"], json!(true));
        assert!(value.get("dirtied_date").is_none());
        assert!(value.get("last_sync_end").is_none());
        assert!(value.get("deleted").is_none());
        assert!(value.get("auth_hash").is_none());
    }

    #[test]
    fn decrypted_parameters_track_error_transitions() {
        let base = Payload::from_server(&note_raw("n-1"), PayloadSource::RemoteRetrieved);

        let errored = base.with_decrypted_parameters(None, true, false);
        assert!(errored.error_decrypting());
        assert!(errored.error_decrypting_changed());

        let errored_again = errored.with_decrypted_parameters(None, true, false);
        assert!(!errored_again.error_decrypting_changed());

        let recovered = errored.with_decrypted_parameters(Some(ItemContent::default()), false, false);
        assert!(!recovered.error_decrypting());
        assert!(recovered.error_decrypting_changed());
    }

    #[test]
    fn contents_compare_structurally() {
        let a = PayloadContent::classify(&json!({"title": "x", "references": []})).unwrap();
        let b = PayloadContent::classify(&json!({"references": [], "title": "x"})).unwrap();
        let c = PayloadContent::classify(&json!({"references": [], "title": "y"})).unwrap();

        assert!(contents_equal(Some(&a), Some(&b)));
        assert!(!contents_equal(Some(&a), Some(&c)));
        assert!(!contents_equal(Some(&a), None));
    }
}
