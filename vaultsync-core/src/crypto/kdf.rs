//! Key derivation functions for root key computation.
//!
//! Protocol 004 uses Argon2id with:
//! - Memory cost: 64 MiB (65,536 KiB)
//! - Iterations: 5
//! - Parallelism: 1 lane
//! - Output length: 64 bytes, split into master key and server password
//! - Salt: 16 bytes derived from `sha256(identifier:seed)`
//!
//! Protocols 001-003 use PBKDF2-HMAC-SHA512.

use crate::crypto::{CryptoError, Result};
use argon2::{Algorithm, Argon2, Params, Version};
use sha2::Sha512;

/// Argon2id memory cost in KiB (64 MiB)
pub const ARGON2_MEMORY_KIB: u32 = 65_536;

/// Argon2id iteration count; also the 004 cost floor reported to callers
pub const ARGON2_ITERATIONS: u32 = 5;

/// Argon2id lane count
pub const ARGON2_PARALLELISM: u32 = 1;

/// Argon2id output length: 32 bytes master key + 32 bytes server password
pub const ARGON2_OUTPUT_LENGTH: usize = 64;

/// Argon2id salt length in bytes
pub const ARGON2_SALT_LENGTH: usize = 16;

/// Derive 64 bytes of root key material with Argon2id.
pub fn argon2id_derive(password: &str, salt: &[u8; ARGON2_SALT_LENGTH]) -> Result<[u8; 64]> {
    let params = Params::new(
        ARGON2_MEMORY_KIB,
        ARGON2_ITERATIONS,
        ARGON2_PARALLELISM,
        Some(ARGON2_OUTPUT_LENGTH),
    )
    .map_err(|e| CryptoError::KdfFailed(format!("invalid parameters: {}", e)))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut output = [0u8; ARGON2_OUTPUT_LENGTH];
    argon2
        .hash_password_into(password.as_bytes(), salt, &mut output)
        .map_err(|e| CryptoError::KdfFailed(format!("hashing failed: {}", e)))?;

    Ok(output)
}

/// Derive the 16-byte Argon2id salt from `(identifier, seed)`.
///
/// The salt is the first half of `sha256_hex(identifier:seed)`, hex-decoded,
/// so the server only needs to store the public seed.
pub fn argon2id_salt(identifier: &str, seed: &str) -> Result<[u8; ARGON2_SALT_LENGTH]> {
    let digest = super::sha256_hex(&format!("{}:{}", identifier, seed));
    let bytes = hex::decode(&digest[..ARGON2_SALT_LENGTH * 2])
        .map_err(|e| CryptoError::KdfFailed(format!("salt derivation failed: {}", e)))?;
    let mut salt = [0u8; ARGON2_SALT_LENGTH];
    salt.copy_from_slice(&bytes);
    Ok(salt)
}

/// PBKDF2-HMAC-SHA512 for legacy protocol versions.
///
/// The salt is the UTF-8 bytes of the salt string carried in the key params.
pub fn pbkdf2_sha512(
    password: &str,
    salt: &str,
    iterations: u32,
    output_length: usize,
) -> Result<Vec<u8>> {
    if iterations == 0 {
        return Err(CryptoError::KdfFailed("iteration count is zero".to_string()));
    }
    let mut output = vec![0u8; output_length];
    pbkdf2::pbkdf2_hmac::<Sha512>(password.as_bytes(), salt.as_bytes(), iterations, &mut output);
    Ok(output)
}
