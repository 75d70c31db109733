//! VaultSync Core Library
//!
//! Client-side core of the VaultSync end-to-end encrypted sync client:
//! versioned cryptographic protocol operators, the immutable payload
//! pipeline, the live item graph, and the multi-round sync engine.
//!
//! The server never sees plaintext nor the root key. Items are encrypted
//! locally under per-item content keys, which are themselves wrapped by an
//! items key (protocol 004) or the root key (legacy protocols).

pub mod api;
pub mod crypto;
pub mod keys;
pub mod model;
pub mod payload;
pub mod protocol;
pub mod storage;
pub mod sync;

pub use api::{ApiError, HttpSyncApi, SyncApi, SyncRequest, SyncResponse};
pub use keys::{EncryptionKey, ItemsKey, KeyManager, KeyMode, KeyParams, RootKey};
pub use model::{Item, ModelManager};
pub use payload::{
    ContentType, ItemContent, Payload, PayloadCollection, PayloadContent, PayloadField,
    PayloadFormat, PayloadSource,
};
pub use protocol::{EncryptionIntent, ProtocolManager, ProtocolOperator, ProtocolVersion};
pub use storage::{MemoryStore, PersistentStore, StorageError};
pub use sync::{SyncEngine, SyncEvent, SyncOptions, SyncTimingStrategy};

use thiserror::Error;

/// Result type for core operations
pub type Result<T> = std::result::Result<T, CoreError>;

/// General error type for core operations
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Crypto error: {0}")]
    Crypto(#[from] crypto::CryptoError),

    #[error("Storage error: {0}")]
    Storage(#[from] storage::StorageError),

    #[error("Api error: {0}")]
    Api(#[from] api::ApiError),

    #[error("Lock poisoned: {0}")]
    Lock(String),

    #[error("Missing encryption key: {0}")]
    MissingKey(String),

    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::Serialization(e.to_string())
    }
}
