//! In-memory snapshot store for rollback
//!
//! Snapshots are immutable once created and kept in creation order. The store
//! never holds more than `max_backups` entries: immediately after an insert
//! pushes it over the bound, the oldest snapshots are evicted.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Shared reference to BackupStore
pub type SharedBackupStore = Arc<BackupStore>;

/// Snapshot identifier.
pub type BackupId = String;

/// Store tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    pub max_backups: usize,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self { max_backups: 10 }
    }
}

/// Who created a snapshot and why.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub component: String,
    pub operation: String,
    pub timestamp: DateTime<Utc>,
}

/// Immutable capture of game state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub id: BackupId,
    /// Position in the rules engine's serialization (FEN for chess).
    pub serialized_position: String,
    /// Copy of the move history at capture time.
    pub move_list: Vec<serde_json::Value>,
    /// Any other component state needed to restore derived views.
    pub auxiliary_state: serde_json::Value,
    pub metadata: SnapshotMetadata,
    /// Approximate serialized size of the snapshot payload.
    pub size_bytes: usize,
}

impl StateSnapshot {
    fn payload_size(
        position: &str,
        move_list: &[serde_json::Value],
        aux: &serde_json::Value,
    ) -> usize {
        let moves: usize = move_list.iter().map(|m| m.to_string().len()).sum();
        position.len() + moves + aux.to_string().len()
    }
}

/// Store statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BackupStats {
    pub count: usize,
    pub max_backups: usize,
    pub total_size_bytes: usize,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}

/// Bounded ring of snapshots.
pub struct BackupStore {
    snapshots: Mutex<VecDeque<StateSnapshot>>,
    config: BackupConfig,
}

impl BackupStore {
    pub fn new(config: BackupConfig) -> Self {
        Self {
            snapshots: Mutex::new(VecDeque::new()),
            config,
        }
    }

    /// Create a shared reference to this store
    pub fn shared(self) -> SharedBackupStore {
        Arc::new(self)
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<StateSnapshot>> {
        self.snapshots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Capture a snapshot and return its id.
    pub fn create_backup(
        &self,
        serialized_position: impl Into<String>,
        move_list: Vec<serde_json::Value>,
        auxiliary_state: serde_json::Value,
        component: &str,
        operation: &str,
    ) -> BackupId {
        let serialized_position = serialized_position.into();
        let size_bytes =
            StateSnapshot::payload_size(&serialized_position, &move_list, &auxiliary_state);
        let snapshot = StateSnapshot {
            id: uuid::Uuid::new_v4().to_string(),
            serialized_position,
            move_list,
            auxiliary_state,
            metadata: SnapshotMetadata {
                component: component.to_string(),
                operation: operation.to_string(),
                timestamp: Utc::now(),
            },
            size_bytes,
        };
        let id = snapshot.id.clone();

        let mut snapshots = self.lock();
        snapshots.push_back(snapshot);
        while snapshots.len() > self.config.max_backups {
            if let Some(evicted) = snapshots.pop_front() {
                debug!(id = %evicted.id, "Evicted oldest backup");
            }
        }
        debug!(id = %id, component, operation, count = snapshots.len(), "Backup created");
        id
    }

    pub fn get_backup(&self, id: &str) -> Option<StateSnapshot> {
        self.lock().iter().find(|s| s.id == id).cloned()
    }

    /// Most recently created snapshot still retained.
    pub fn latest(&self) -> Option<StateSnapshot> {
        self.lock().back().cloned()
    }

    pub fn remove_backup(&self, id: &str) -> bool {
        let mut snapshots = self.lock();
        let before = snapshots.len();
        snapshots.retain(|s| s.id != id);
        snapshots.len() != before
    }

    /// All retained snapshots, oldest first.
    pub fn list(&self) -> Vec<StateSnapshot> {
        self.lock().iter().cloned().collect()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn stats(&self) -> BackupStats {
        let snapshots = self.lock();
        BackupStats {
            count: snapshots.len(),
            max_backups: self.config.max_backups,
            total_size_bytes: snapshots.iter().map(|s| s.size_bytes).sum(),
            oldest: snapshots.front().map(|s| s.metadata.timestamp),
            newest: snapshots.back().map(|s| s.metadata.timestamp),
        }
    }
}

impl Default for BackupStore {
    fn default() -> Self {
        Self::new(BackupConfig::default())
    }
}
