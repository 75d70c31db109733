//! Items keys: symmetric keys that are themselves stored as encrypted
//! items.
//!
//! An items key wraps per-item content keys (protocol 004) and is in turn
//! encrypted with the root key. Multiple items keys may coexist; one is
//! the default for new encryptions.

use crate::keys::EncryptionKey;
use crate::payload::{
    storage_payload_fields, ContentType, ItemContent, Payload, PayloadSource, RawPayload,
};
use crate::protocol::ProtocolVersion;
use chrono::{DateTime, Utc};
use serde_json::json;
use uuid::Uuid;
use zeroize::{Zeroize, ZeroizeOnDrop};

#[derive(Debug, Clone, Zeroize, ZeroizeOnDrop)]
pub struct ItemsKey {
    #[zeroize(skip)]
    uuid: String,
    #[zeroize(skip)]
    version: ProtocolVersion,
    items_key: String,
    data_authentication_key: Option<String>,
    #[zeroize(skip)]
    is_default: bool,
    #[zeroize(skip)]
    created_at: Option<DateTime<Utc>>,
}

impl ItemsKey {
    pub fn new(
        version: ProtocolVersion,
        items_key: String,
        data_authentication_key: Option<String>,
    ) -> Self {
        Self {
            uuid: Uuid::new_v4().to_string(),
            version,
            items_key,
            data_authentication_key,
            is_default: false,
            created_at: Some(Utc::now()),
        }
    }

    /// Rebuild an items key from a decrypted `SN|ItemsKey` payload.
    pub fn from_payload(payload: &Payload) -> Option<ItemsKey> {
        if *payload.content_type() != ContentType::ItemsKey || payload.deleted() {
            return None;
        }
        let content = payload.decrypted_content()?;
        let items_key = content.field("itemsKey")?.as_str()?.to_string();
        let version = content
            .field("version")
            .and_then(|v| v.as_str())
            .and_then(ProtocolVersion::parse)
            .unwrap_or(ProtocolVersion::CURRENT);
        let data_authentication_key = content
            .field("dataAuthenticationKey")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let is_default = content
            .field("isDefault")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        Some(ItemsKey {
            uuid: payload.uuid().to_string(),
            version,
            items_key,
            data_authentication_key,
            is_default,
            created_at: payload.created_at(),
        })
    }

    /// The decrypted content this key serializes to inside its item.
    pub fn to_content(&self) -> ItemContent {
        let mut content = ItemContent::default()
            .with_field("itemsKey", json!(self.items_key))
            .with_field("version", json!(self.version.as_str()))
            .with_field("isDefault", json!(self.is_default));
        if let Some(auth_key) = &self.data_authentication_key {
            content = content.with_field("dataAuthenticationKey", json!(auth_key));
        }
        content
    }

    /// A dirty storage payload for this key, ready to encrypt and sync.
    pub fn to_payload(&self) -> Payload {
        let raw = RawPayload {
            uuid: self.uuid.clone(),
            content_type: ContentType::ItemsKey.as_str().to_string(),
            content: Some(serde_json::to_value(self.to_content()).unwrap_or(json!({}))),
            created_at: self.created_at,
            dirty: Some(true),
            ..Default::default()
        };
        Payload::from_raw(&raw, storage_payload_fields(), PayloadSource::Constructor)
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    pub fn items_key(&self) -> &str {
        &self.items_key
    }

    pub fn is_default(&self) -> bool {
        self.is_default
    }

    pub fn set_default(&mut self, is_default: bool) {
        self.is_default = is_default;
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }

    pub fn as_encryption_key(&self) -> EncryptionKey {
        EncryptionKey::new(
            self.version,
            self.items_key.clone(),
            self.data_authentication_key.clone(),
            Some(self.uuid.clone()),
        )
    }
}
