//! Game state snapshots for rollback
//!
//! The [`BackupStore`] keeps a bounded, oldest-first-evicted ring of
//! [`StateSnapshot`]s. Snapshots are only reclaimed by capacity eviction or
//! explicit removal after a rollback.
//!
//! # Usage
//!
//! ```ignore
//! use game_coordination::state::{BackupConfig, BackupStore};
//!
//! let store = BackupStore::new(BackupConfig { max_backups: 10 }).shared();
//! let id = store.create_backup(fen, moves, aux, "orchestrator", "make_move");
//! let snapshot = store.get_backup(&id).expect("just created");
//! ```

pub mod backup;

// Re-export core types
pub use backup::{
    BackupConfig, BackupId, BackupStats, BackupStore, SharedBackupStore, SnapshotMetadata,
    StateSnapshot,
};
