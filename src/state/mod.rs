//! Persisted pipeline state.
//!
//! | Module    | Concern                                             |
//! |-----------|-----------------------------------------------------|
//! | `schema`  | Typed document, status enum, aggregation, validation |
//! | `lock`    | Cross-process exclusive lock over the document       |
//! | `atomic`  | Temp-file + fsync + rename replacement               |
//! | `backup`  | Timestamped pre-write copies and rotation            |
//! | `txlog`   | Append-only transaction log                          |
//! | `store`   | The transaction protocol tying the above together    |

pub mod atomic;
pub mod backup;
pub mod lock;
pub mod schema;
pub mod store;
pub mod txlog;

pub use backup::BackupRef;
pub use lock::{FileLock, LockGuard};
pub use schema::{
    ErrorEntry, FileRecord, Metadata, PhaseBlock, SCHEMA_VERSION, StateDocument, Status,
    Timestamps, Unit, Validation,
};
pub use store::{StateStore, StoreOptions, Transaction};
pub use txlog::TransactionLogEntry;
