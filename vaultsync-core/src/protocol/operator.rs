//! Version-agnostic operator surface and shared legacy helpers.

use crate::crypto::{self, CryptoError};
use crate::keys::{EncryptionKey, ItemsKey, KeyParams, RootKey};
use crate::payload::{ItemContent, Payload};
use crate::protocol::{
    cost_minimum_for_version, v001::Operator001, v002::Operator002, v003::Operator003,
    v004::Operator004, ProtocolVersion,
};
use subtle::ConstantTimeEq;

/// The encrypted projection of a payload, produced without mutating it.
#[derive(Debug, Clone)]
pub struct EncryptedParameters {
    pub content: String,
    pub enc_item_key: String,
    pub items_key_id: Option<String>,
}

/// The decrypted projection of a payload, or an error-marked record.
#[derive(Debug, Clone)]
pub struct DecryptedParameters {
    pub content: Option<ItemContent>,
    pub error_decrypting: bool,
    pub waiting_for_key: bool,
}

impl DecryptedParameters {
    pub fn success(content: ItemContent) -> Self {
        Self {
            content: Some(content),
            error_decrypting: false,
            waiting_for_key: false,
        }
    }

    pub fn error() -> Self {
        Self {
            content: None,
            error_decrypting: true,
            waiting_for_key: false,
        }
    }

    pub fn waiting_for_key() -> Self {
        Self {
            content: None,
            error_decrypting: false,
            waiting_for_key: true,
        }
    }
}

/// Version-specific realization of the cryptographic protocol. A sum of
/// the four versioned implementations; the protocol manager memoizes one
/// instance per version.
#[derive(Debug)]
pub enum ProtocolOperator {
    V001(Operator001),
    V002(Operator002),
    V003(Operator003),
    V004(Operator004),
}

impl ProtocolOperator {
    pub fn for_version(version: ProtocolVersion) -> ProtocolOperator {
        match version {
            ProtocolVersion::V001 => Self::V001(Operator001),
            ProtocolVersion::V002 => Self::V002(Operator002),
            ProtocolVersion::V003 => Self::V003(Operator003),
            ProtocolVersion::V004 => Self::V004(Operator004),
        }
    }

    pub fn version(&self) -> ProtocolVersion {
        match self {
            Self::V001(_) => ProtocolVersion::V001,
            Self::V002(_) => ProtocolVersion::V002,
            Self::V003(_) => ProtocolVersion::V003,
            Self::V004(_) => ProtocolVersion::V004,
        }
    }

    /// Static KDF cost floor for this operator's version.
    pub fn kdf_iterations(&self) -> u32 {
        cost_minimum_for_version(self.version())
    }

    /// Generate a fresh seed, derive key material, and return both the key
    /// and the public params needed to rederive it.
    pub fn create_root_key(
        &self,
        identifier: &str,
        password: &str,
    ) -> Result<(RootKey, KeyParams), CryptoError> {
        match self {
            Self::V001(op) => op.create_root_key(identifier, password),
            Self::V002(op) => op.create_root_key(identifier, password),
            Self::V003(op) => op.create_root_key(identifier, password),
            Self::V004(op) => op.create_root_key(identifier, password),
        }
    }

    /// Deterministic re-derivation from public params.
    pub fn compute_root_key(
        &self,
        password: &str,
        params: &KeyParams,
    ) -> Result<RootKey, CryptoError> {
        if params.version() != self.version() {
            return Err(CryptoError::KdfFailed(format!(
                "key params are version {}, operator is {}",
                params.version(),
                self.version()
            )));
        }
        match self {
            Self::V001(op) => op.compute_root_key(password, params),
            Self::V002(op) => op.compute_root_key(password, params),
            Self::V003(op) => op.compute_root_key(password, params),
            Self::V004(op) => op.compute_root_key(password, params),
        }
    }

    /// Create a fresh items key. Only protocol 004 stores keys as items.
    pub fn create_items_key(&self) -> Result<ItemsKey, CryptoError> {
        match self {
            Self::V004(op) => Ok(op.create_items_key()),
            _ => Err(CryptoError::InvalidKey(format!(
                "protocol {} has no items keys",
                self.version()
            ))),
        }
    }

    /// The encrypted projection of `payload` under `key`.
    pub fn generate_encryption_parameters(
        &self,
        payload: &Payload,
        key: &EncryptionKey,
    ) -> Result<EncryptedParameters, CryptoError> {
        match self {
            Self::V001(op) => op.generate_encryption_parameters(payload, key),
            Self::V002(op) => op.generate_encryption_parameters(payload, key),
            Self::V003(op) => op.generate_encryption_parameters(payload, key),
            Self::V004(op) => op.generate_encryption_parameters(payload, key),
        }
    }

    /// Decrypt `payload`'s content under `key`, or fail with the
    /// underlying crypto error. Most callers want
    /// [`Self::generate_decrypted_parameters`], which contains failures.
    pub fn decrypt_content(
        &self,
        payload: &Payload,
        key: &EncryptionKey,
    ) -> Result<ItemContent, CryptoError> {
        match self {
            Self::V001(op) => op.decrypt_content(payload, key),
            Self::V002(op) => op.decrypt_content(payload, key),
            Self::V003(op) => op.decrypt_content(payload, key),
            Self::V004(op) => op.decrypt_content(payload, key),
        }
    }

    /// The decrypted projection of `payload`, with any failure contained
    /// as an error-marked record. Never panics into the sync loop.
    pub fn generate_decrypted_parameters(
        &self,
        payload: &Payload,
        key: &EncryptionKey,
    ) -> DecryptedParameters {
        match self.decrypt_content(payload, key) {
            Ok(content) => DecryptedParameters::success(content),
            Err(_) => DecryptedParameters::error(),
        }
    }
}

// --- Legacy composition (001-003) ---
//
// Wire format: `<ver>:<auth_hash>:<uuid>:<iv_hex>:<ct_b64>`, where
// auth_hash is HMAC-SHA256 over `<ver>:<uuid>:<iv_hex>:<ct_b64>`.

pub(crate) fn legacy_encrypt_string(
    version: ProtocolVersion,
    plaintext: &str,
    encryption_key_hex: &str,
    authentication_key_hex: &str,
    uuid: &str,
) -> Result<String, CryptoError> {
    let iv = crypto::generate_iv();
    let iv_hex = hex::encode(iv);
    let ciphertext = crypto::aes_cbc_encrypt(plaintext, encryption_key_hex, &iv)?;
    let string_to_auth = format!("{}:{}:{}:{}", version, uuid, iv_hex, ciphertext);
    let auth_hash = crypto::hmac_sha256_hex(&string_to_auth, authentication_key_hex)?;
    Ok(format!(
        "{}:{}:{}:{}:{}",
        version, auth_hash, uuid, iv_hex, ciphertext
    ))
}

pub(crate) fn legacy_decrypt_string(
    version: ProtocolVersion,
    string: &str,
    encryption_key_hex: &str,
    authentication_key_hex: &str,
    expected_uuid: &str,
) -> Result<String, CryptoError> {
    let components: Vec<&str> = string.split(':').collect();
    if components.len() != 5 {
        return Err(CryptoError::MalformedCiphertext(format!(
            "expected 5 components, got {}",
            components.len()
        )));
    }
    let (tag, auth_hash, uuid, iv_hex, ciphertext) = (
        components[0],
        components[1],
        components[2],
        components[3],
        components[4],
    );
    if tag != version.as_str() || uuid != expected_uuid {
        return Err(CryptoError::AuthenticationFailed);
    }
    let string_to_auth = format!("{}:{}:{}:{}", tag, uuid, iv_hex, ciphertext);
    let local_hash = crypto::hmac_sha256_hex(&string_to_auth, authentication_key_hex)?;
    let matches: bool = local_hash.as_bytes().ct_eq(auth_hash.as_bytes()).into();
    if !matches {
        return Err(CryptoError::AuthenticationFailed);
    }
    crypto::aes_cbc_decrypt(ciphertext, encryption_key_hex, iv_hex)
}

/// Shared legacy item encryption: a 512-bit random content key whose
/// first half encrypts and second half authenticates.
pub(crate) fn legacy_generate_encryption_parameters(
    version: ProtocolVersion,
    payload: &Payload,
    key: &EncryptionKey,
) -> Result<EncryptedParameters, CryptoError> {
    let content = payload.decrypted_content().ok_or_else(|| {
        CryptoError::EncryptionFailed("payload content is not decrypted".to_string())
    })?;
    let content_json = serde_json::to_string(content)
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

    let item_key = crypto::generate_random_key(64);
    let (item_ek, item_ak) = item_key.split_at(64);

    let content_string =
        legacy_encrypt_string(version, &content_json, item_ek, item_ak, payload.uuid())?;
    let wrapping_ak = key.authentication_key().unwrap_or_else(|| key.key());
    let enc_item_key =
        legacy_encrypt_string(version, &item_key, key.key(), wrapping_ak, payload.uuid())?;

    Ok(EncryptedParameters {
        content: content_string,
        enc_item_key,
        items_key_id: None,
    })
}

pub(crate) fn legacy_decrypt_content(
    version: ProtocolVersion,
    payload: &Payload,
    key: &EncryptionKey,
) -> Result<ItemContent, CryptoError> {
    let enc_item_key = payload.enc_item_key().ok_or_else(|| {
        CryptoError::MalformedCiphertext("payload has no enc_item_key".to_string())
    })?;
    let content_string = match payload.content() {
        Some(crate::payload::PayloadContent::Encrypted(s)) => s,
        _ => {
            return Err(CryptoError::MalformedCiphertext(
                "payload content is not an encrypted string".to_string(),
            ))
        }
    };

    let wrapping_ak = key.authentication_key().unwrap_or_else(|| key.key());
    let item_key =
        legacy_decrypt_string(version, enc_item_key, key.key(), wrapping_ak, payload.uuid())?;
    if item_key.len() != 128 {
        return Err(CryptoError::DecryptionFailed(
            "unwrapped item key has invalid length".to_string(),
        ));
    }
    let (item_ek, item_ak) = item_key.split_at(64);

    let plaintext =
        legacy_decrypt_string(version, content_string, item_ek, item_ak, payload.uuid())?;
    serde_json::from_str(&plaintext).map_err(|e| CryptoError::DecryptionFailed(e.to_string()))
}
