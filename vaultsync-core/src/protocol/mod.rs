//! Versioned cryptographic protocol.
//!
//! Each protocol version realizes root key derivation, item-level
//! authenticated encryption, and key wrapping. 004 is the current target;
//! older versions are kept to read historical data.

pub mod manager;
pub mod operator;
mod v001;
mod v002;
mod v003;
mod v004;

pub use manager::ProtocolManager;
pub use operator::{DecryptedParameters, EncryptedParameters, ProtocolOperator};

use serde::{Deserialize, Serialize};

/// Reserved prefix tagging base64-encoded decrypted content strings.
pub const BASE64_CONTENT_PREFIX: &str = "000";

/// 3-char protocol version tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ProtocolVersion {
    #[serde(rename = "001")]
    V001,
    #[serde(rename = "002")]
    V002,
    #[serde(rename = "003")]
    V003,
    #[serde(rename = "004")]
    V004,
}

impl ProtocolVersion {
    /// The version new accounts and new encryptions target.
    pub const CURRENT: ProtocolVersion = ProtocolVersion::V004;

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::V001 => "001",
            Self::V002 => "002",
            Self::V003 => "003",
            Self::V004 => "004",
        }
    }

    pub fn parse(tag: &str) -> Option<ProtocolVersion> {
        match tag {
            "001" => Some(Self::V001),
            "002" => Some(Self::V002),
            "003" => Some(Self::V003),
            "004" => Some(Self::V004),
            _ => None,
        }
    }

    /// Derive the version from an encrypted content string's first 3 bytes.
    pub fn from_content_string(content: &str) -> Option<ProtocolVersion> {
        content.get(..3).and_then(Self::parse)
    }

    /// Whether items are wrapped by items keys rather than the root key.
    pub fn uses_items_keys(&self) -> bool {
        matches!(self, Self::V004)
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Static KDF cost floor per version. For 004 the value is the Argon2id
/// iteration count; for earlier versions it is the PBKDF2 round count.
pub fn cost_minimum_for_version(version: ProtocolVersion) -> u32 {
    match version {
        ProtocolVersion::V001 => 3_000,
        ProtocolVersion::V002 => 3_000,
        ProtocolVersion::V003 => 110_000,
        ProtocolVersion::V004 => 5,
    }
}

/// The purpose an encryption or decryption call serves; governs the output
/// format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionIntent {
    Sync,
    LocalStorageEncrypted,
    LocalStorageDecrypted,
    LocalStoragePreferEncrypted,
    FileEncrypted,
    FileDecrypted,
}

impl EncryptionIntent {
    pub fn requires_encryption(&self) -> bool {
        matches!(
            self,
            Self::Sync
                | Self::LocalStorageEncrypted
                | Self::FileEncrypted
                | Self::LocalStoragePreferEncrypted
        )
    }
}
