//! The key manager: owns the root key and the items keys, and chooses
//! the key for encrypting or decrypting any given payload.

use crate::keys::{EncryptionKey, ItemsKey, KeyParams, RootKey};
use crate::payload::{ContentType, ItemContent, Payload, PayloadContent, RawPayload};
use crate::protocol::{ProtocolOperator, ProtocolVersion};
use crate::{CoreError, Result};
use serde_json::json;
use tracing::debug;
use uuid::Uuid;

/// Minimum password length accepted at root key creation.
pub const MIN_PASSWORD_LENGTH: usize = 8;

/// Which keys are present and how the root key is protected at rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyMode {
    /// No account and no passcode.
    RootKeyNone,
    /// Account root key, stored unwrapped.
    RootKeyOnly,
    /// No account; a local passcode wrapper only.
    WrapperOnly,
    /// Account root key, wrapped under a local passcode.
    RootKeyPlusWrapper,
}

/// Notifications fired to registered observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyManagerEvent {
    RootKeyChanged,
    ItemsKeysChanged,
}

/// Outcome of selecting a decryption key for a payload.
#[derive(Debug, Clone)]
pub enum KeyLookup {
    Found(EncryptionKey),
    /// The required key is not present locally (e.g. the items key has not
    /// been downloaded yet). The payload should be marked waiting-for-key.
    Missing,
}

type Observer = Box<dyn Fn(KeyManagerEvent) + Send + Sync>;

#[derive(Default)]
pub struct KeyManager {
    root_key: Option<RootKey>,
    key_params: Option<KeyParams>,
    wrapper_params: Option<KeyParams>,
    items_keys: Vec<ItemsKey>,
    observers: Vec<(String, Observer)>,
}

impl KeyManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn key_mode(&self) -> KeyMode {
        match (&self.root_key, &self.wrapper_params) {
            (None, None) => KeyMode::RootKeyNone,
            (Some(_), None) => KeyMode::RootKeyOnly,
            (None, Some(_)) => KeyMode::WrapperOnly,
            (Some(_), Some(_)) => KeyMode::RootKeyPlusWrapper,
        }
    }

    // --- Root key lifecycle ---

    /// Generate a fresh root key and its public params. Validates input;
    /// does not install the key.
    pub fn create_root_key(
        &self,
        identifier: &str,
        password: &str,
        version: ProtocolVersion,
    ) -> Result<(RootKey, KeyParams)> {
        if identifier.is_empty() {
            return Err(CoreError::Validation("identifier must not be empty".to_string()));
        }
        if password.len() < MIN_PASSWORD_LENGTH {
            return Err(CoreError::Validation(format!(
                "password must be at least {} characters",
                MIN_PASSWORD_LENGTH
            )));
        }
        let operator = ProtocolOperator::for_version(version);
        Ok(operator.create_root_key(identifier, password)?)
    }

    /// Deterministically rederive the root key from a password and params.
    pub fn compute_root_key(&self, password: &str, params: &KeyParams) -> Result<RootKey> {
        let operator = ProtocolOperator::for_version(params.version());
        Ok(operator.compute_root_key(password, params)?)
    }

    pub fn set_root_key(&mut self, key: RootKey, params: Option<KeyParams>) {
        debug!(version = %key.version(), "installing root key");
        self.root_key = Some(key);
        if params.is_some() {
            self.key_params = params;
        }
        self.notify(KeyManagerEvent::RootKeyChanged);
    }

    pub fn root_key(&self) -> Option<&RootKey> {
        self.root_key.as_ref()
    }

    pub fn key_params(&self) -> Option<&KeyParams> {
        self.key_params.as_ref()
    }

    pub fn has_root_key(&self) -> bool {
        self.root_key.is_some()
    }

    /// Clear all key material. Key bytes are zeroized on drop.
    pub fn sign_out(&mut self) {
        self.root_key = None;
        self.key_params = None;
        self.items_keys.clear();
        self.notify(KeyManagerEvent::RootKeyChanged);
        self.notify(KeyManagerEvent::ItemsKeysChanged);
    }

    // --- Passcode wrapper ---

    /// Wrap the installed root key under a passcode-derived key, producing
    /// a storable record and the wrapper params needed to unwrap it.
    pub fn wrap_root_key(&mut self, passcode: &str) -> Result<(RawPayload, KeyParams)> {
        let root = self
            .root_key
            .as_ref()
            .ok_or_else(|| CoreError::MissingKey("no root key to wrap".to_string()))?;

        let operator = ProtocolOperator::for_version(ProtocolVersion::CURRENT);
        let (wrapping_key, wrapper_params) = operator.create_root_key("local", passcode)?;

        let content = ItemContent::default()
            .with_field("masterKey", json!(root.master_key()))
            .with_field("serverPassword", json!(root.server_password()))
            .with_field("dataAuthenticationKey", json!(root.data_authentication_key()))
            .with_field("version", json!(root.version().as_str()));
        let payload = Payload::from_server(
            &RawPayload {
                uuid: Uuid::new_v4().to_string(),
                content_type: ContentType::Other("SN|RootKey|Wrapped".to_string())
                    .as_str()
                    .to_string(),
                content: Some(serde_json::to_value(content)?),
                ..Default::default()
            },
            crate::payload::PayloadSource::Constructor,
        );

        let params =
            operator.generate_encryption_parameters(&payload, &wrapping_key.as_encryption_key())?;
        let wrapped = payload
            .with_encryption_parameters(
                PayloadContent::Encrypted(params.content),
                Some(params.enc_item_key),
                None,
                None,
            )
            .ejected();

        self.wrapper_params = Some(wrapper_params.clone());
        Ok((wrapped, wrapper_params))
    }

    /// Unwrap a wrapped root key record with a passcode and install it.
    pub fn unwrap_root_key(
        &mut self,
        passcode: &str,
        wrapped: &RawPayload,
        wrapper_params: &KeyParams,
    ) -> Result<()> {
        let operator = ProtocolOperator::for_version(wrapper_params.version());
        let wrapping_key = operator.compute_root_key(passcode, wrapper_params)?;

        let payload = Payload::from_server(wrapped, crate::payload::PayloadSource::LocalRetrieved);
        let content =
            operator.decrypt_content(&payload, &wrapping_key.as_encryption_key())?;

        let master_key = content
            .field("masterKey")
            .and_then(|v| v.as_str())
            .ok_or_else(|| CoreError::Validation("wrapped root key is malformed".to_string()))?
            .to_string();
        let version = content
            .field("version")
            .and_then(|v| v.as_str())
            .and_then(ProtocolVersion::parse)
            .ok_or_else(|| CoreError::Validation("wrapped root key is malformed".to_string()))?;
        let server_password = content
            .field("serverPassword")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let data_authentication_key = content
            .field("dataAuthenticationKey")
            .and_then(|v| v.as_str())
            .map(str::to_string);

        self.wrapper_params = Some(wrapper_params.clone());
        self.set_root_key(
            RootKey::new(version, master_key, server_password, data_authentication_key),
            None,
        );
        Ok(())
    }

    pub fn remove_wrapper(&mut self) {
        self.wrapper_params = None;
    }

    // --- Items keys ---

    pub fn items_keys(&self) -> &[ItemsKey] {
        &self.items_keys
    }

    pub fn items_key_for_id(&self, id: &str) -> Option<&ItemsKey> {
        self.items_keys.iter().find(|k| k.uuid() == id)
    }

    /// The key new encryptions use: the flagged default, falling back to
    /// the most recently created.
    pub fn default_items_key(&self) -> Option<&ItemsKey> {
        self.items_keys
            .iter()
            .find(|k| k.is_default())
            .or_else(|| self.items_keys.iter().max_by_key(|k| k.created_at()))
    }

    /// Upsert an items key parsed from a decrypted `SN|ItemsKey` payload.
    /// Fires observers so waiting payloads can be retried.
    pub fn add_items_key_from_payload(&mut self, payload: &Payload) -> bool {
        let Some(key) = ItemsKey::from_payload(payload) else {
            return false;
        };
        debug!(uuid = key.uuid(), "items key available");
        match self.items_keys.iter_mut().find(|k| k.uuid() == key.uuid()) {
            Some(existing) => *existing = key,
            None => self.items_keys.push(key),
        }
        self.notify(KeyManagerEvent::ItemsKeysChanged);
        true
    }

    /// Create a fresh items key and make it the default. Returns a clone;
    /// the caller maps its payload into the model for syncing.
    pub fn create_new_default_items_key(&mut self) -> Result<ItemsKey> {
        let operator = ProtocolOperator::for_version(ProtocolVersion::CURRENT);
        let mut key = operator.create_items_key()?;
        key.set_default(true);
        for existing in &mut self.items_keys {
            existing.set_default(false);
        }
        self.items_keys.push(key.clone());
        self.notify(KeyManagerEvent::ItemsKeysChanged);
        Ok(key)
    }

    // --- Key selection ---

    /// The key for encrypting a payload of the given content type. Items
    /// keys are themselves encrypted with the root key; everything else
    /// uses the default items key, or the root key on legacy accounts.
    /// `None` means the caller falls back to the intent's keyless format.
    pub fn key_to_use_for_encryption(&self, content_type: &ContentType) -> Option<EncryptionKey> {
        if *content_type == ContentType::ItemsKey {
            return self.root_key.as_ref().map(RootKey::as_encryption_key);
        }
        if let Some(items_key) = self.default_items_key() {
            return Some(items_key.as_encryption_key());
        }
        self.root_key.as_ref().map(RootKey::as_encryption_key)
    }

    /// The key for decrypting a payload, by its `items_key_id` or version.
    pub fn key_to_use_for_decryption(&self, payload: &Payload) -> KeyLookup {
        if *payload.content_type() == ContentType::ItemsKey {
            return match &self.root_key {
                Some(root) => KeyLookup::Found(root.as_encryption_key()),
                None => KeyLookup::Missing,
            };
        }
        if let Some(id) = payload.items_key_id() {
            return match self.items_key_for_id(id) {
                Some(key) => KeyLookup::Found(key.as_encryption_key()),
                None => KeyLookup::Missing,
            };
        }
        match payload.version() {
            Some(version) if !version.uses_items_keys() => match &self.root_key {
                Some(root) => KeyLookup::Found(root.as_encryption_key()),
                None => KeyLookup::Missing,
            },
            _ => match self.default_items_key() {
                Some(key) => KeyLookup::Found(key.as_encryption_key()),
                None => KeyLookup::Missing,
            },
        }
    }

    // --- Observers ---

    pub fn add_observer(
        &mut self,
        name: impl Into<String>,
        observer: impl Fn(KeyManagerEvent) + Send + Sync + 'static,
    ) {
        self.observers.push((name.into(), Box::new(observer)));
    }

    pub fn remove_observer(&mut self, name: &str) {
        self.observers.retain(|(n, _)| n != name);
    }

    fn notify(&self, event: KeyManagerEvent) {
        for (_, observer) in &self.observers {
            observer(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn password_length_is_validated() {
        let manager = KeyManager::new();
        let result = manager.create_root_key("hello@test.com", "short", ProtocolVersion::V004);
        assert!(matches!(result, Err(CoreError::Validation(_))));
    }

    #[test]
    fn key_mode_transitions() {
        let mut manager = KeyManager::new();
        assert_eq!(manager.key_mode(), KeyMode::RootKeyNone);

        let (key, params) = manager
            .create_root_key("hello@test.com", "password", ProtocolVersion::V004)
            .unwrap();
        manager.set_root_key(key, Some(params));
        assert_eq!(manager.key_mode(), KeyMode::RootKeyOnly);

        manager.wrap_root_key("passcode1").unwrap();
        assert_eq!(manager.key_mode(), KeyMode::RootKeyPlusWrapper);

        manager.sign_out();
        assert_eq!(manager.key_mode(), KeyMode::WrapperOnly);

        manager.remove_wrapper();
        assert_eq!(manager.key_mode(), KeyMode::RootKeyNone);
    }

    #[test]
    fn wrap_and_unwrap_root_key() {
        let mut manager = KeyManager::new();
        let (key, params) = manager
            .create_root_key("hello@test.com", "password", ProtocolVersion::V004)
            .unwrap();
        manager.set_root_key(key.clone(), Some(params));

        let (wrapped, wrapper_params) = manager.wrap_root_key("passcode1").unwrap();

        let mut restored = KeyManager::new();
        restored
            .unwrap_root_key("passcode1", &wrapped, &wrapper_params)
            .unwrap();
        assert_eq!(restored.root_key().unwrap(), &key);

        let mut wrong = KeyManager::new();
        assert!(wrong
            .unwrap_root_key("wrong-pass", &wrapped, &wrapper_params)
            .is_err());
    }

    #[test]
    fn default_items_key_selection() {
        let mut manager = KeyManager::new();
        let first = manager.create_new_default_items_key().unwrap();
        assert_eq!(
            manager.default_items_key().unwrap().uuid(),
            first.uuid()
        );

        let second = manager.create_new_default_items_key().unwrap();
        assert_eq!(manager.default_items_key().unwrap().uuid(), second.uuid());
        // The previous default was demoted, not removed.
        assert_eq!(manager.items_keys().len(), 2);
        assert!(!manager.items_key_for_id(first.uuid()).unwrap().is_default());
    }

    #[test]
    fn items_key_content_encrypts_under_root_key() {
        let mut manager = KeyManager::new();
        let (key, params) = manager
            .create_root_key("hello@test.com", "password", ProtocolVersion::V004)
            .unwrap();
        manager.set_root_key(key, Some(params));
        manager.create_new_default_items_key().unwrap();

        let for_items_key = manager
            .key_to_use_for_encryption(&ContentType::ItemsKey)
            .unwrap();
        assert!(for_items_key.items_key_id().is_none());

        let for_note = manager.key_to_use_for_encryption(&ContentType::Note).unwrap();
        assert!(for_note.items_key_id().is_some());
    }

    #[test]
    fn decryption_key_missing_until_items_key_arrives() {
        let mut manager = KeyManager::new();
        let items_key = ItemsKey::new(ProtocolVersion::V004, "ab".repeat(32), None);
        let payload = items_key.to_payload();

        let mut note_raw = RawPayload {
            uuid: "note-1".to_string(),
            content_type: "Note".to_string(),
            content: Some(json!("004:n:c:a")),
            ..Default::default()
        };
        note_raw.items_key_id = Some(items_key.uuid().to_string());
        let note =
            Payload::from_server(&note_raw, crate::payload::PayloadSource::RemoteRetrieved);

        assert!(matches!(
            manager.key_to_use_for_decryption(&note),
            KeyLookup::Missing
        ));

        manager.add_items_key_from_payload(&payload);
        assert!(matches!(
            manager.key_to_use_for_decryption(&note),
            KeyLookup::Found(_)
        ));
    }

    #[test]
    fn observers_fire_on_items_key_changes() {
        let mut manager = KeyManager::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        manager.add_observer("test", move |event| {
            if event == KeyManagerEvent::ItemsKeysChanged {
                fired_clone.fetch_add(1, Ordering::SeqCst);
            }
        });

        manager.create_new_default_items_key().unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        manager.remove_observer("test");
        manager.create_new_default_items_key().unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
