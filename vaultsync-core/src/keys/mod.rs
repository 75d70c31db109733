//! Key material: the root key, items keys, public key params, and the
//! key manager that owns them.

pub mod items_key;
pub mod key_params;
pub mod manager;
pub mod root_key;

pub use items_key::ItemsKey;
pub use key_params::KeyParams;
pub use manager::{KeyLookup, KeyManager, KeyManagerEvent, KeyMode};
pub use root_key::RootKey;

use crate::protocol::ProtocolVersion;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// A key selected for a single encrypt or decrypt call: either a root key
/// or an items key, flattened to the material the operators need.
#[derive(Debug, Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey {
    #[zeroize(skip)]
    version: ProtocolVersion,
    key: String,
    authentication_key: Option<String>,
    #[zeroize(skip)]
    items_key_id: Option<String>,
}

impl EncryptionKey {
    pub fn new(
        version: ProtocolVersion,
        key: String,
        authentication_key: Option<String>,
        items_key_id: Option<String>,
    ) -> Self {
        Self {
            version,
            key,
            authentication_key,
            items_key_id,
        }
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    /// The hex key that wraps per-item content keys (or encrypts content
    /// directly where the version has no item keys).
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The hex key authenticating the legacy CBC composition, where the
    /// version separates one.
    pub fn authentication_key(&self) -> Option<&str> {
        self.authentication_key.as_deref()
    }

    /// Set when this key is an items key; recorded on encrypted payloads.
    pub fn items_key_id(&self) -> Option<&str> {
        self.items_key_id.as_deref()
    }
}
