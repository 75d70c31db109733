//! Protocol 004: Argon2id root key derivation and AES-256-GCM item
//! encryption with per-item content keys wrapped by items keys.

use crate::crypto::{self, kdf, CryptoError};
use crate::keys::{EncryptionKey, ItemsKey, KeyParams, RootKey};
use crate::payload::{ItemContent, Payload, PayloadContent};
use crate::protocol::operator::EncryptedParameters;
use crate::protocol::ProtocolVersion;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};

const VERSION: ProtocolVersion = ProtocolVersion::V004;

/// Associated data authenticated alongside every 004 ciphertext, binding
/// it to the owning item so ciphertexts cannot be swapped across items.
#[derive(Debug, Serialize, Deserialize)]
struct AuthenticatedData {
    u: String,
    v: String,
}

fn encode_authenticated_data(uuid: &str) -> Result<String, CryptoError> {
    let data = AuthenticatedData {
        u: uuid.to_string(),
        v: VERSION.as_str().to_string(),
    };
    let json = serde_json::to_string(&data)
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;
    Ok(BASE64.encode(json))
}

/// Encrypt to the 004 wire format:
/// `004:<b64 nonce24>:<b64 ciphertext||tag>:<b64 aad json>`.
fn encrypt_string_004(plaintext: &str, key_hex: &str, uuid: &str) -> Result<String, CryptoError> {
    let nonce = crypto::generate_nonce();
    let aad = encode_authenticated_data(uuid)?;
    let ciphertext = crypto::aes_gcm_encrypt(plaintext, key_hex, &nonce, &aad)?;
    Ok(format!(
        "{}:{}:{}:{}",
        VERSION,
        BASE64.encode(nonce),
        ciphertext,
        aad
    ))
}

fn decrypt_string_004(
    string: &str,
    key_hex: &str,
    expected_uuid: &str,
) -> Result<String, CryptoError> {
    let components: Vec<&str> = string.split(':').collect();
    if components.len() != 4 {
        return Err(CryptoError::MalformedCiphertext(format!(
            "expected 4 components, got {}",
            components.len()
        )));
    }
    let (tag, nonce_b64, ciphertext, aad) =
        (components[0], components[1], components[2], components[3]);
    if tag != VERSION.as_str() {
        return Err(CryptoError::MalformedCiphertext(format!(
            "unexpected version tag {}",
            tag
        )));
    }

    let nonce_bytes = BASE64
        .decode(nonce_b64)
        .map_err(|_| CryptoError::MalformedCiphertext("invalid nonce base64".to_string()))?;
    let nonce: [u8; crypto::cipher::AES_GCM_NONCE_LENGTH] = nonce_bytes
        .try_into()
        .map_err(|_| CryptoError::MalformedCiphertext("invalid nonce length".to_string()))?;

    // The payload the AAD was authenticated for must be the payload we are
    // decrypting.
    let aad_json = BASE64
        .decode(aad)
        .map_err(|_| CryptoError::MalformedCiphertext("invalid aad base64".to_string()))?;
    let authenticated: AuthenticatedData = serde_json::from_slice(&aad_json)
        .map_err(|_| CryptoError::MalformedCiphertext("invalid aad json".to_string()))?;
    if authenticated.u != expected_uuid || authenticated.v != VERSION.as_str() {
        return Err(CryptoError::AuthenticationFailed);
    }

    crypto::aes_gcm_decrypt(ciphertext, key_hex, &nonce, aad)
}

#[derive(Debug)]
pub struct Operator004;

impl Operator004 {
    pub fn create_root_key(
        &self,
        identifier: &str,
        password: &str,
    ) -> Result<(RootKey, KeyParams), CryptoError> {
        let pw_nonce = crypto::generate_random_key(32);
        let key = derive_root_key(identifier, password, &pw_nonce)?;
        let params = KeyParams::V004 {
            identifier: identifier.to_string(),
            pw_nonce,
        };
        Ok((key, params))
    }

    pub fn compute_root_key(
        &self,
        password: &str,
        params: &KeyParams,
    ) -> Result<RootKey, CryptoError> {
        match params {
            KeyParams::V004 {
                identifier,
                pw_nonce,
            } => derive_root_key(identifier, password, pw_nonce),
            _ => Err(CryptoError::KdfFailed("expected 004 key params".to_string())),
        }
    }

    pub fn create_items_key(&self) -> ItemsKey {
        ItemsKey::new(VERSION, crypto::generate_random_key(32), None)
    }

    pub fn generate_encryption_parameters(
        &self,
        payload: &Payload,
        key: &EncryptionKey,
    ) -> Result<EncryptedParameters, CryptoError> {
        let content = payload.decrypted_content().ok_or_else(|| {
            CryptoError::EncryptionFailed("payload content is not decrypted".to_string())
        })?;
        let content_json = serde_json::to_string(content)
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

        let item_key = crypto::generate_random_key(32);
        let content_string = encrypt_string_004(&content_json, &item_key, payload.uuid())?;
        let enc_item_key = encrypt_string_004(&item_key, key.key(), payload.uuid())?;

        Ok(EncryptedParameters {
            content: content_string,
            enc_item_key,
            items_key_id: key.items_key_id().map(str::to_string),
        })
    }

    pub fn decrypt_content(
        &self,
        payload: &Payload,
        key: &EncryptionKey,
    ) -> Result<ItemContent, CryptoError> {
        let enc_item_key = payload.enc_item_key().ok_or_else(|| {
            CryptoError::MalformedCiphertext("payload has no enc_item_key".to_string())
        })?;
        let content_string = match payload.content() {
            Some(PayloadContent::Encrypted(s)) => s,
            _ => {
                return Err(CryptoError::MalformedCiphertext(
                    "payload content is not an encrypted string".to_string(),
                ))
            }
        };

        let item_key = decrypt_string_004(enc_item_key, key.key(), payload.uuid())?;
        let plaintext = decrypt_string_004(content_string, &item_key, payload.uuid())?;
        serde_json::from_str(&plaintext).map_err(|e| CryptoError::DecryptionFailed(e.to_string()))
    }
}

/// Argon2id over `(password, salt = sha256(identifier:seed))`, the 64-byte
/// output split into master key and server password.
fn derive_root_key(
    identifier: &str,
    password: &str,
    pw_nonce: &str,
) -> Result<RootKey, CryptoError> {
    let salt = kdf::argon2id_salt(identifier, pw_nonce)?;
    let derived = kdf::argon2id_derive(password, &salt)?;
    let master_key = hex::encode(&derived[..32]);
    let server_password = hex::encode(&derived[32..]);
    Ok(RootKey::new(
        VERSION,
        master_key,
        Some(server_password),
        None,
    ))
}
