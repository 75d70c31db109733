//! Protocol 003: PBKDF2-HMAC-SHA512 root key derivation with a separate
//! data authentication key, AES-CBC + HMAC item encryption. Read path for
//! historical data.

use crate::crypto::{self, kdf, CryptoError};
use crate::keys::{EncryptionKey, KeyParams, RootKey};
use crate::payload::{ItemContent, Payload};
use crate::protocol::operator::{
    legacy_decrypt_content, legacy_generate_encryption_parameters, EncryptedParameters,
};
use crate::protocol::{cost_minimum_for_version, ProtocolVersion};

const VERSION: ProtocolVersion = ProtocolVersion::V003;

#[derive(Debug)]
pub struct Operator003;

impl Operator003 {
    pub fn create_root_key(
        &self,
        identifier: &str,
        password: &str,
    ) -> Result<(RootKey, KeyParams), CryptoError> {
        let pw_nonce = crypto::generate_random_key(32);
        let pw_cost = cost_minimum_for_version(VERSION);
        let key = derive_root_key(identifier, password, &pw_nonce, pw_cost)?;
        let params = KeyParams::V003 {
            identifier: identifier.to_string(),
            pw_nonce,
            pw_cost,
        };
        Ok((key, params))
    }

    pub fn compute_root_key(
        &self,
        password: &str,
        params: &KeyParams,
    ) -> Result<RootKey, CryptoError> {
        match params {
            KeyParams::V003 {
                identifier,
                pw_nonce,
                pw_cost,
            } => derive_root_key(identifier, password, pw_nonce, *pw_cost),
            _ => Err(CryptoError::KdfFailed("expected 003 key params".to_string())),
        }
    }

    pub fn generate_encryption_parameters(
        &self,
        payload: &Payload,
        key: &EncryptionKey,
    ) -> Result<EncryptedParameters, CryptoError> {
        legacy_generate_encryption_parameters(VERSION, payload, key)
    }

    pub fn decrypt_content(
        &self,
        payload: &Payload,
        key: &EncryptionKey,
    ) -> Result<ItemContent, CryptoError> {
        legacy_decrypt_content(VERSION, payload, key)
    }
}

/// 96 bytes of PBKDF2 output split three ways: server password, master
/// key, data authentication key.
fn derive_root_key(
    identifier: &str,
    password: &str,
    pw_nonce: &str,
    pw_cost: u32,
) -> Result<RootKey, CryptoError> {
    let salt = crypto::sha256_hex(&format!(
        "{}:SF:{}:{}:{}",
        identifier, VERSION, pw_cost, pw_nonce
    ));
    let derived = kdf::pbkdf2_sha512(password, &salt, pw_cost, 96)?;
    let hex = hex::encode(derived);
    let server_password = hex[..64].to_string();
    let master_key = hex[64..128].to_string();
    let data_authentication_key = hex[128..].to_string();
    Ok(RootKey::new(
        VERSION,
        master_key,
        Some(server_password),
        Some(data_authentication_key),
    ))
}
