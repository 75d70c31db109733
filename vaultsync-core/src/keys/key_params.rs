//! Public parameters needed to rederive the root key from a password.
//!
//! The server stores these; the client keeps a local copy. Each version
//! guards its own field names, so a 004 params record cannot be fed to a
//! legacy derivation by accident.

use crate::protocol::ProtocolVersion;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "version")]
pub enum KeyParams {
    #[serde(rename = "001")]
    V001 {
        identifier: String,
        pw_salt: String,
        pw_cost: u32,
    },
    #[serde(rename = "002")]
    V002 {
        identifier: String,
        pw_salt: String,
        pw_cost: u32,
    },
    #[serde(rename = "003")]
    V003 {
        identifier: String,
        pw_nonce: String,
        pw_cost: u32,
    },
    #[serde(rename = "004")]
    V004 { identifier: String, pw_nonce: String },
}

impl KeyParams {
    pub fn version(&self) -> ProtocolVersion {
        match self {
            Self::V001 { .. } => ProtocolVersion::V001,
            Self::V002 { .. } => ProtocolVersion::V002,
            Self::V003 { .. } => ProtocolVersion::V003,
            Self::V004 { .. } => ProtocolVersion::V004,
        }
    }

    pub fn identifier(&self) -> &str {
        match self {
            Self::V001 { identifier, .. }
            | Self::V002 { identifier, .. }
            | Self::V003 { identifier, .. }
            | Self::V004 { identifier, .. } => identifier,
        }
    }

    /// The KDF cost these params pin: PBKDF2 rounds for legacy versions,
    /// the Argon2id iteration count for 004.
    pub fn kdf_cost(&self) -> u32 {
        match self {
            Self::V001 { pw_cost, .. } | Self::V002 { pw_cost, .. } | Self::V003 { pw_cost, .. } => {
                *pw_cost
            }
            Self::V004 { .. } => crate::crypto::kdf::ARGON2_ITERATIONS,
        }
    }
}
