//! Cryptographic primitives for the sync client core.
//!
//! This module provides:
//! - Argon2id and PBKDF2-HMAC-SHA512 key derivation
//! - AES-256-GCM authenticated encryption (192-bit nonces)
//! - AES-256-CBC + HMAC-SHA256 composition for legacy protocol versions
//! - SHA-256 digests and random key/nonce generation

pub mod cipher;
pub mod kdf;

pub use cipher::{
    aes_cbc_decrypt, aes_cbc_encrypt, aes_gcm_decrypt, aes_gcm_encrypt, generate_iv,
    generate_nonce, generate_random_key, hmac_sha256_hex, sha256_hex,
};
pub use kdf::{argon2id_derive, argon2id_salt, pbkdf2_sha512};

use thiserror::Error;

/// Errors that can occur in cryptographic operations
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Key derivation failed: {0}")]
    KdfFailed(String),

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Malformed ciphertext: {0}")]
    MalformedCiphertext(String),

    #[error("Authentication failed - data may have been tampered with")]
    AuthenticationFailed,
}

/// Result type for crypto operations
pub type Result<T> = std::result::Result<T, CryptoError>;
