//! The live item graph: mutable object views of decrypted payloads,
//! inverse reference indexing, and singleton enforcement.

pub mod item;
pub mod manager;
pub mod singleton;

pub use item::Item;
pub use manager::ModelManager;
pub use singleton::find_or_create_singleton;
