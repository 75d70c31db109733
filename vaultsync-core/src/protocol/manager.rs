//! Façade over the versioned operators: routes payloads by version and
//! intent to the right operator, consulting the key manager for key
//! selection.

use crate::crypto::CryptoError;
use crate::keys::{EncryptionKey, KeyLookup, KeyManager};
use crate::payload::{ItemContent, Payload, PayloadContent, PayloadFormat};
use crate::protocol::{
    EncryptionIntent, ProtocolOperator, ProtocolVersion, BASE64_CONTENT_PREFIX,
};
use crate::{CoreError, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub struct ProtocolManager {
    operators: Mutex<HashMap<ProtocolVersion, Arc<ProtocolOperator>>>,
    key_manager: Arc<Mutex<KeyManager>>,
}

impl ProtocolManager {
    pub fn new(key_manager: Arc<Mutex<KeyManager>>) -> Self {
        Self {
            operators: Mutex::new(HashMap::new()),
            key_manager,
        }
    }

    /// One operator per version, created on first use.
    pub fn operator_for_version(&self, version: ProtocolVersion) -> Result<Arc<ProtocolOperator>> {
        let mut operators = self
            .operators
            .lock()
            .map_err(|_| CoreError::Lock("operator cache".to_string()))?;
        Ok(operators
            .entry(version)
            .or_insert_with(|| Arc::new(ProtocolOperator::for_version(version)))
            .clone())
    }

    pub fn default_operator(&self) -> Result<Arc<ProtocolOperator>> {
        self.operator_for_version(ProtocolVersion::CURRENT)
    }

    /// Select the operator version from the payload's encrypted content
    /// tag. Decrypted payloads have no version.
    pub fn version_for_payload(&self, payload: &Payload) -> Option<ProtocolVersion> {
        payload.version()
    }

    // --- Encryption ---

    /// Produce the payload projection the given intent requires, selecting
    /// a key through the key manager when none is supplied.
    pub fn payload_by_encrypting_payload(
        &self,
        payload: &Payload,
        intent: EncryptionIntent,
        key: Option<&EncryptionKey>,
    ) -> Result<Payload> {
        if !intent.requires_encryption() {
            return Ok(payload.clone());
        }

        let selected = match key {
            Some(key) => Some(key.clone()),
            None => {
                let manager = self
                    .key_manager
                    .lock()
                    .map_err(|_| CoreError::Lock("key manager".to_string()))?;
                manager.key_to_use_for_encryption(payload.content_type())
            }
        };

        match selected {
            Some(key) => {
                let operator = self.operator_for_version(key.version())?;
                let params = operator.generate_encryption_parameters(payload, &key)?;
                Ok(payload.with_encryption_parameters(
                    PayloadContent::Encrypted(params.content),
                    Some(params.enc_item_key),
                    params.items_key_id,
                    None,
                ))
            }
            // Keyless fallbacks are intent-specific: syncing without an
            // account sends base64-tagged decrypted content; prefer-encrypted
            // local storage degrades to the bare object.
            None => match intent {
                EncryptionIntent::Sync => Ok(self.base64_payload(payload)?),
                EncryptionIntent::LocalStoragePreferEncrypted => Ok(payload.clone()),
                _ => Err(CoreError::MissingKey(format!(
                    "no key available for intent {:?}",
                    intent
                ))),
            },
        }
    }

    fn base64_payload(&self, payload: &Payload) -> Result<Payload> {
        let content = payload.decrypted_content().ok_or_else(|| {
            CoreError::Serialization("payload content is not decrypted".to_string())
        })?;
        let json = serde_json::to_string(content)?;
        let encoded = format!("{}{}", BASE64_CONTENT_PREFIX, BASE64.encode(json));
        Ok(payload.with_encryption_parameters(PayloadContent::Base64(encoded), None, None, None))
    }

    // --- Decryption ---

    /// Decrypt a payload, containing crypto failures as error-marked
    /// payloads. A payload whose items key has not arrived yet is marked
    /// waiting-for-key, not errored. Infrastructure failures (a poisoned
    /// lock) still propagate.
    pub fn payload_by_decrypting_payload(
        &self,
        payload: &Payload,
        key: Option<&EncryptionKey>,
    ) -> Result<Payload> {
        match self.decrypt_inner(payload, key) {
            Ok(decrypted) => Ok(decrypted),
            Err(CoreError::Crypto(_)) => {
                Ok(payload.with_decrypted_parameters(None, true, false))
            }
            Err(other) => Err(other),
        }
    }

    /// Bulk decrypt, preserving input order and length. With `throws`,
    /// the first crypto failure is returned for caller-driven recovery
    /// instead of being contained.
    pub fn payloads_by_decrypting_payloads(
        &self,
        payloads: &[Payload],
        throws: bool,
    ) -> Result<Vec<Payload>> {
        let mut results = Vec::with_capacity(payloads.len());
        for payload in payloads {
            if throws {
                results.push(self.decrypt_inner(payload, None)?);
            } else {
                results.push(self.payload_by_decrypting_payload(payload, None)?);
            }
        }
        Ok(results)
    }

    fn decrypt_inner(&self, payload: &Payload, key: Option<&EncryptionKey>) -> Result<Payload> {
        match payload.format() {
            PayloadFormat::DecryptedBareObject | PayloadFormat::Deleted => Ok(payload.clone()),
            PayloadFormat::DecryptedBase64String => {
                let content = decode_base64_content(payload)?;
                Ok(payload.with_decrypted_parameters(Some(content), false, false))
            }
            PayloadFormat::EncryptedString => {
                let selected = match key {
                    Some(key) => Some(key.clone()),
                    None => {
                        let manager = self
                            .key_manager
                            .lock()
                            .map_err(|_| CoreError::Lock("key manager".to_string()))?;
                        match manager.key_to_use_for_decryption(payload) {
                            KeyLookup::Found(key) => Some(key),
                            KeyLookup::Missing => None,
                        }
                    }
                };
                let Some(selected) = selected else {
                    return Ok(payload.with_decrypted_parameters(None, false, true));
                };

                let version = payload.version().ok_or_else(|| {
                    CryptoError::MalformedCiphertext("content has no version tag".to_string())
                })?;
                let operator = self.operator_for_version(version)?;
                let content = operator.decrypt_content(payload, &selected)?;
                Ok(payload.with_decrypted_parameters(Some(content), false, false))
            }
        }
    }
}

fn decode_base64_content(payload: &Payload) -> std::result::Result<ItemContent, CryptoError> {
    let string = match payload.content() {
        Some(PayloadContent::Base64(s)) => s,
        _ => {
            return Err(CryptoError::MalformedCiphertext(
                "payload content is not a base64 string".to_string(),
            ))
        }
    };
    let encoded = &string[BASE64_CONTENT_PREFIX.len()..];
    let bytes = BASE64
        .decode(encoded)
        .map_err(|_| CryptoError::MalformedCiphertext("invalid base64 content".to_string()))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))
}
