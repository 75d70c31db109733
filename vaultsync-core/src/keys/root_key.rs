//! The root key derived from the account password.
//!
//! Never sent to the server. The master key encrypts items keys (and, on
//! legacy versions, item content directly); the server password is the
//! authentication secret presented to the server.

use crate::keys::EncryptionKey;
use crate::protocol::ProtocolVersion;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

#[derive(Debug, Clone, Zeroize, ZeroizeOnDrop)]
pub struct RootKey {
    #[zeroize(skip)]
    version: ProtocolVersion,
    master_key: String,
    server_password: Option<String>,
    data_authentication_key: Option<String>,
}

impl RootKey {
    pub fn new(
        version: ProtocolVersion,
        master_key: String,
        server_password: Option<String>,
        data_authentication_key: Option<String>,
    ) -> Self {
        Self {
            version,
            master_key,
            server_password,
            data_authentication_key,
        }
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    pub fn master_key(&self) -> &str {
        &self.master_key
    }

    pub fn server_password(&self) -> Option<&str> {
        self.server_password.as_deref()
    }

    /// Present on version 003 only.
    pub fn data_authentication_key(&self) -> Option<&str> {
        self.data_authentication_key.as_deref()
    }

    pub fn as_encryption_key(&self) -> EncryptionKey {
        EncryptionKey::new(
            self.version,
            self.master_key.clone(),
            self.data_authentication_key.clone(),
            None,
        )
    }
}

fn option_ct_eq(a: Option<&str>, b: Option<&str>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => a.as_bytes().ct_eq(b.as_bytes()).into(),
        _ => false,
    }
}

impl PartialEq for RootKey {
    /// Structural comparison in constant time.
    fn eq(&self, other: &Self) -> bool {
        let master: bool = self
            .master_key
            .as_bytes()
            .ct_eq(other.master_key.as_bytes())
            .into();
        self.version == other.version
            && master
            && option_ct_eq(self.server_password(), other.server_password())
            && option_ct_eq(
                self.data_authentication_key(),
                other.data_authentication_key(),
            )
    }
}

impl Eq for RootKey {}
