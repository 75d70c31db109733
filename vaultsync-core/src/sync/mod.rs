//! The sync engine: operation state machine, queue serialization,
//! response resolution, integrity tracking, and out-of-sync recovery.

pub mod engine;
pub mod events;
pub mod operation;
pub mod resolver;
pub mod state;

pub use engine::{SyncEngine, SyncOptions, SyncTimingStrategy, MAJOR_CHANGE_THRESHOLD};
pub use events::{EventRegistry, SyncEvent};
pub use operation::{OperationMode, SyncOperation};
pub use resolver::ResponseResolver;
pub use state::{compute_integrity_hash, IntegrityOutcome, SyncState, MAX_DISCORDANCE};
