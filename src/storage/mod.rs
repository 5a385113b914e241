//! Persisted container and backup snapshots.
//!
//! The store only ever needs whole-container reads and writes plus the
//! ability to snapshot the current container before overwriting it. Keeping
//! the seam that small lets the same reconciliation logic run on a plain JSON
//! file or inside an LMDB environment.

mod file_storage;
mod lmdb_storage;

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;

pub use self::file_storage::FileStorage;
pub use self::lmdb_storage::LmdbStorage;

/// Contents written when a container is created from scratch.
pub const EMPTY_CONTAINER: &[u8] = b"[]";

/// Reference to one immutable backup snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupHandle {
    /// Sortable identifier: lexical order is creation order.
    pub id: String,
    /// Where the snapshot lives (a file path or an LMDB key).
    pub location: String,
}

pub trait Storage: Send + Sync {
    /// Current container bytes, or `None` if it was never created.
    fn load(&self) -> Result<Option<Vec<u8>>, StorageError>;

    /// Replaces the container. Must be all-or-nothing.
    fn save(&self, bytes: &[u8]) -> Result<(), StorageError>;

    /// Copies the current container into a new backup snapshot.
    fn snapshot(&self) -> Result<BackupHandle, StorageError>;

    /// All retained snapshots, oldest first.
    fn backups(&self) -> Result<Vec<BackupHandle>, StorageError>;

    /// Deletes all but the `keep` most recent snapshots. Returns how many
    /// were removed.
    fn prune(&self, keep: usize) -> Result<usize, StorageError>;

    /// Flushes and releases the medium.
    fn close(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

/// Generates backup ids that sort in creation order within one process,
/// even when several snapshots land in the same microsecond.
#[derive(Debug, Default)]
pub(crate) struct BackupClock {
    sequence: AtomicU64,
}

impl BackupClock {
    pub(crate) fn next_id(&self, now: DateTime<Utc>) -> String {
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        format!("{}-{seq:06}", now.format("%Y%m%dT%H%M%S%.6fZ"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn backup_ids_sort_in_creation_order() {
        let clock = BackupClock::default();
        let t = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let a = clock.next_id(t);
        let b = clock.next_id(t);
        let c = clock.next_id(t + chrono::Duration::milliseconds(1));
        assert!(a < b && b < c, "{a} {b} {c}");
        assert!(a.starts_with("20260301T120000.000000Z"));
    }
}
