//! Symmetric encryption primitives shared by the protocol operators.
//!
//! Protocol 004 uses AES-256-GCM with:
//! - 256-bit keys (hex-encoded at rest)
//! - 192-bit (24 byte) nonces
//! - 128-bit authentication tags appended to the ciphertext
//! - Associated data binding the ciphertext to the owning item
//!
//! Protocols 001-003 use an AES-256-CBC + HMAC-SHA256 composition.

use crate::crypto::{CryptoError, Result};
use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes::cipher::consts::U24;
use aes::Aes256;
use aes_gcm::aead::{Aead, KeyInit, Payload as AeadPayload};
use aes_gcm::{AesGcm, Nonce};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

/// AES-256-GCM parameterized with the 192-bit nonce the 004 wire format carries.
type Aes256Gcm24 = AesGcm<Aes256, U24>;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

type HmacSha256 = Hmac<Sha256>;

/// Nonce length for AES-256-GCM (24 bytes / 192 bits)
pub const AES_GCM_NONCE_LENGTH: usize = 24;

/// IV length for legacy AES-256-CBC (16 bytes)
pub const AES_CBC_IV_LENGTH: usize = 16;

/// Symmetric key length (32 bytes / 256 bits)
pub const SYMMETRIC_KEY_LENGTH: usize = 32;

/// Generate `bytes` random bytes and return them hex-encoded.
pub fn generate_random_key(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    OsRng.fill_bytes(&mut buf);
    hex::encode(buf)
}

/// Generate a random 192-bit GCM nonce.
pub fn generate_nonce() -> [u8; AES_GCM_NONCE_LENGTH] {
    let mut nonce = [0u8; AES_GCM_NONCE_LENGTH];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Generate a random 128-bit CBC IV.
pub fn generate_iv() -> [u8; AES_CBC_IV_LENGTH] {
    let mut iv = [0u8; AES_CBC_IV_LENGTH];
    OsRng.fill_bytes(&mut iv);
    iv
}

/// SHA-256 digest of a UTF-8 string, hex-encoded.
pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

fn decode_hex_key(key_hex: &str) -> Result<Vec<u8>> {
    let key = hex::decode(key_hex)
        .map_err(|_| CryptoError::InvalidKey("key is not valid hex".to_string()))?;
    if key.len() != SYMMETRIC_KEY_LENGTH {
        return Err(CryptoError::InvalidKey(format!(
            "expected {} byte key, got {}",
            SYMMETRIC_KEY_LENGTH,
            key.len()
        )));
    }
    Ok(key)
}

/// Encrypt with AES-256-GCM, binding `aad` as associated data.
///
/// Returns base64 of `ciphertext || tag(16)`.
pub fn aes_gcm_encrypt(
    plaintext: &str,
    key_hex: &str,
    nonce: &[u8; AES_GCM_NONCE_LENGTH],
    aad: &str,
) -> Result<String> {
    let key = decode_hex_key(key_hex)?;
    let cipher = Aes256Gcm24::new_from_slice(&key)
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;

    let nonce = Nonce::from(*nonce);
    let ciphertext = cipher
        .encrypt(
            &nonce,
            AeadPayload {
                msg: plaintext.as_bytes(),
                aad: aad.as_bytes(),
            },
        )
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

    Ok(BASE64.encode(ciphertext))
}

/// Decrypt AES-256-GCM output produced by [`aes_gcm_encrypt`].
///
/// Fails with [`CryptoError::AuthenticationFailed`] when the key, nonce,
/// associated data, or ciphertext differ in any byte from encryption time.
pub fn aes_gcm_decrypt(
    ciphertext_b64: &str,
    key_hex: &str,
    nonce: &[u8; AES_GCM_NONCE_LENGTH],
    aad: &str,
) -> Result<String> {
    let key = decode_hex_key(key_hex)?;
    let ciphertext = BASE64
        .decode(ciphertext_b64)
        .map_err(|_| CryptoError::MalformedCiphertext("invalid base64".to_string()))?;

    let cipher = Aes256Gcm24::new_from_slice(&key)
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;

    let nonce = Nonce::from(*nonce);
    let plaintext = cipher
        .decrypt(
            &nonce,
            AeadPayload {
                msg: ciphertext.as_slice(),
                aad: aad.as_bytes(),
            },
        )
        .map_err(|_| CryptoError::AuthenticationFailed)?;

    String::from_utf8(plaintext)
        .map_err(|_| CryptoError::DecryptionFailed("plaintext is not valid UTF-8".to_string()))
}

/// Encrypt with AES-256-CBC / PKCS7 (legacy protocols). Returns base64.
pub fn aes_cbc_encrypt(
    plaintext: &str,
    key_hex: &str,
    iv: &[u8; AES_CBC_IV_LENGTH],
) -> Result<String> {
    let key = decode_hex_key(key_hex)?;
    let cipher = Aes256CbcEnc::new_from_slices(&key, iv)
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());
    Ok(BASE64.encode(ciphertext))
}

/// Decrypt AES-256-CBC / PKCS7 output produced by [`aes_cbc_encrypt`].
pub fn aes_cbc_decrypt(ciphertext_b64: &str, key_hex: &str, iv_hex: &str) -> Result<String> {
    let key = decode_hex_key(key_hex)?;
    let iv = hex::decode(iv_hex)
        .map_err(|_| CryptoError::MalformedCiphertext("invalid iv hex".to_string()))?;
    if iv.len() != AES_CBC_IV_LENGTH {
        return Err(CryptoError::MalformedCiphertext("invalid iv length".to_string()));
    }
    let ciphertext = BASE64
        .decode(ciphertext_b64)
        .map_err(|_| CryptoError::MalformedCiphertext("invalid base64".to_string()))?;

    let cipher = Aes256CbcDec::new_from_slices(&key, &iv)
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    let plaintext = cipher
        .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
        .map_err(|_| CryptoError::AuthenticationFailed)?;

    String::from_utf8(plaintext)
        .map_err(|_| CryptoError::DecryptionFailed("plaintext is not valid UTF-8".to_string()))
}

/// HMAC-SHA256 over a UTF-8 message with a hex-encoded key, hex-encoded output.
///
/// Authenticates the legacy CBC composition; the message covers
/// `version:uuid:iv:ciphertext` so segments cannot be transplanted.
pub fn hmac_sha256_hex(message: &str, key_hex: &str) -> Result<String> {
    let key = hex::decode(key_hex)
        .map_err(|_| CryptoError::InvalidKey("auth key is not valid hex".to_string()))?;
    let mut mac = <HmacSha256 as Mac>::new_from_slice(&key)
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    mac.update(message.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gcm_roundtrip_with_aad() {
        let key = generate_random_key(32);
        let nonce = generate_nonce();
        let aad = r#"{"foo":"bar"}"#;

        let encrypted = aes_gcm_encrypt("hello world", &key, &nonce, aad).unwrap();
        let decrypted = aes_gcm_decrypt(&encrypted, &key, &nonce, aad).unwrap();

        assert_eq!(decrypted, "hello world");
    }

    #[test]
    fn gcm_aad_mismatch_fails() {
        let key = generate_random_key(32);
        let nonce = generate_nonce();

        let encrypted = aes_gcm_encrypt("hello world", &key, &nonce, r#"{"foo":"bar"}"#).unwrap();
        let result = aes_gcm_decrypt(&encrypted, &key, &nonce, r#"{"foo":"rab"}"#);

        assert!(matches!(result, Err(CryptoError::AuthenticationFailed)));
    }

    #[test]
    fn gcm_wrong_key_fails() {
        let key = generate_random_key(32);
        let other = generate_random_key(32);
        let nonce = generate_nonce();

        let encrypted = aes_gcm_encrypt("secret", &key, &nonce, "aad").unwrap();
        assert!(aes_gcm_decrypt(&encrypted, &other, &nonce, "aad").is_err());
    }

    #[test]
    fn gcm_tampered_ciphertext_fails() {
        let key = generate_random_key(32);
        let nonce = generate_nonce();

        let encrypted = aes_gcm_encrypt("secret", &key, &nonce, "aad").unwrap();
        let mut bytes = BASE64.decode(&encrypted).unwrap();
        bytes[0] ^= 0xFF;
        let tampered = BASE64.encode(bytes);

        assert!(aes_gcm_decrypt(&tampered, &key, &nonce, "aad").is_err());
    }

    #[test]
    fn gcm_nonces_are_unique() {
        assert_ne!(generate_nonce(), generate_nonce());
    }

    #[test]
    fn cbc_roundtrip() {
        let key = generate_random_key(32);
        let iv = generate_iv();

        let encrypted = aes_cbc_encrypt("legacy content", &key, &iv).unwrap();
        let decrypted = aes_cbc_decrypt(&encrypted, &key, &hex::encode(iv)).unwrap();

        assert_eq!(decrypted, "legacy content");
    }

    #[test]
    fn cbc_wrong_key_fails() {
        let key = generate_random_key(32);
        let other = generate_random_key(32);
        let iv = generate_iv();

        let encrypted = aes_cbc_encrypt("legacy content", &key, &iv).unwrap();
        assert!(aes_cbc_decrypt(&encrypted, &other, &hex::encode(iv)).is_err());
    }

    #[test]
    fn hmac_is_deterministic_and_keyed() {
        let key = generate_random_key(32);
        let other = generate_random_key(32);

        let a = hmac_sha256_hex("002:uuid:iv:ct", &key).unwrap();
        let b = hmac_sha256_hex("002:uuid:iv:ct", &key).unwrap();
        let c = hmac_sha256_hex("002:uuid:iv:ct", &other).unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn sha256_hex_known_vector() {
        assert_eq!(
            sha256_hex("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
