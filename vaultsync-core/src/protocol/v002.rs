//! Protocol 002: PBKDF2-HMAC-SHA512 root key derivation, AES-CBC + HMAC
//! item encryption authenticated by the master key. Read path for
//! historical data.

use crate::crypto::{self, kdf, CryptoError};
use crate::keys::{EncryptionKey, KeyParams, RootKey};
use crate::payload::{ItemContent, Payload};
use crate::protocol::operator::{
    legacy_decrypt_content, legacy_generate_encryption_parameters, EncryptedParameters,
};
use crate::protocol::{cost_minimum_for_version, ProtocolVersion};

const VERSION: ProtocolVersion = ProtocolVersion::V002;

#[derive(Debug)]
pub struct Operator002;

impl Operator002 {
    pub fn create_root_key(
        &self,
        identifier: &str,
        password: &str,
    ) -> Result<(RootKey, KeyParams), CryptoError> {
        let pw_cost = cost_minimum_for_version(VERSION);
        let nonce = crypto::generate_random_key(32);
        let pw_salt = crypto::sha256_hex(&format!("{}:{}", identifier, nonce));
        let key = derive_root_key(password, &pw_salt, pw_cost)?;
        let params = KeyParams::V002 {
            identifier: identifier.to_string(),
            pw_salt,
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
            KeyParams::V002 {
                pw_salt, pw_cost, ..
            } => derive_root_key(password, pw_salt, *pw_cost),
            _ => Err(CryptoError::KdfFailed("expected 002 key params".to_string())),
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

/// 64 bytes of PBKDF2 output split into server password and master key.
/// No separate data authentication key on this version; the master key
/// doubles as the HMAC key for key wrapping.
fn derive_root_key(password: &str, pw_salt: &str, pw_cost: u32) -> Result<RootKey, CryptoError> {
    let derived = kdf::pbkdf2_sha512(password, pw_salt, pw_cost, 64)?;
    let hex = hex::encode(derived);
    let server_password = hex[..64].to_string();
    let master_key = hex[64..].to_string();
    Ok(RootKey::new(VERSION, master_key, Some(server_password), None))
}
