use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use lmdb::{Database, DatabaseFlags, Environment, Error as LmdbError, Transaction, WriteFlags};
use log::{debug, info};

use super::{BackupClock, BackupHandle, Storage, EMPTY_CONTAINER};
use crate::error::StorageError;

const ENV_DIR: &str = "supplements.lmdb";
const RECORDS_KEY: &str = "records";
/// Key in the backups database holding the ordered list of snapshot ids.
const INDEX_KEY: &str = "index";

/// Container and snapshots stored inside one LMDB environment.
///
/// Snapshot and index updates share a single write transaction, so the
/// snapshot list can never reference a missing entry.
pub struct LmdbStorage {
    env: Environment,
    container: Database,
    backups: Database,
    clock: BackupClock,
    path: PathBuf,
}

impl LmdbStorage {
    pub fn open(root: impl AsRef<Path>, map_size: usize) -> Result<Self, StorageError> {
        let path = root.as_ref().join(ENV_DIR);
        fs::create_dir_all(&path)?;

        let env = Environment::new()
            .set_max_dbs(2)
            .set_map_size(map_size)
            .open(&path)?;
        let container = env.create_db(Some("container"), DatabaseFlags::empty())?;
        let backups = env.create_db(Some("backups"), DatabaseFlags::empty())?;

        info!("Opened LMDB storage at {}", path.display());
        Ok(LmdbStorage {
            env,
            container,
            backups,
            clock: BackupClock::default(),
            path,
        })
    }

    fn location(&self, id: &str) -> String {
        format!("{}#backups/{id}", self.path.display())
    }
}

fn read_index<T: Transaction>(txn: &T, db: Database) -> Result<Vec<String>, StorageError> {
    match txn.get(db, &INDEX_KEY) {
        Ok(bytes) => Ok(serde_json::from_slice(bytes)?),
        Err(LmdbError::NotFound) => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

impl Storage for LmdbStorage {
    fn load(&self) -> Result<Option<Vec<u8>>, StorageError> {
        let txn = self.env.begin_ro_txn()?;
        match txn.get(self.container, &RECORDS_KEY) {
            Ok(bytes) => Ok(Some(bytes.to_vec())),
            Err(LmdbError::NotFound) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, bytes: &[u8]) -> Result<(), StorageError> {
        let mut txn = self.env.begin_rw_txn()?;
        txn.put(self.container, &RECORDS_KEY, &bytes, WriteFlags::empty())?;
        txn.commit()?;
        Ok(())
    }

    fn snapshot(&self) -> Result<BackupHandle, StorageError> {
        let mut txn = self.env.begin_rw_txn()?;
        let current = match txn.get(self.container, &RECORDS_KEY) {
            Ok(bytes) => bytes.to_vec(),
            Err(LmdbError::NotFound) => EMPTY_CONTAINER.to_vec(),
            Err(e) => return Err(e.into()),
        };
        let mut index = read_index(&txn, self.backups)?;

        let id = self.clock.next_id(Utc::now());
        txn.put(self.backups, &id, &current, WriteFlags::empty())?;
        index.push(id.clone());
        let encoded = serde_json::to_vec(&index)?;
        txn.put(self.backups, &INDEX_KEY, &encoded, WriteFlags::empty())?;
        txn.commit()?;

        debug!("Backup {id} written to LMDB");
        Ok(BackupHandle {
            location: self.location(&id),
            id,
        })
    }

    fn backups(&self) -> Result<Vec<BackupHandle>, StorageError> {
        let txn = self.env.begin_ro_txn()?;
        let mut index = read_index(&txn, self.backups)?;
        index.sort();
        Ok(index
            .into_iter()
            .map(|id| BackupHandle {
                location: self.location(&id),
                id,
            })
            .collect())
    }

    fn prune(&self, keep: usize) -> Result<usize, StorageError> {
        let mut txn = self.env.begin_rw_txn()?;
        let mut index = read_index(&txn, self.backups)?;
        index.sort();
        let excess = index.len().saturating_sub(keep);
        if excess == 0 {
            return Ok(0);
        }
        for id in index.drain(..excess) {
            match txn.del(self.backups, &id, None) {
                Ok(()) | Err(LmdbError::NotFound) => debug!("Pruned backup {id}"),
                Err(e) => return Err(e.into()),
            }
        }
        let encoded = serde_json::to_vec(&index)?;
        txn.put(self.backups, &INDEX_KEY, &encoded, WriteFlags::empty())?;
        txn.commit()?;
        Ok(excess)
    }

    fn close(&self) -> Result<(), StorageError> {
        self.env.sync(true)?;
        info!("LMDB environment at {} synced", self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAP_SIZE: usize = 10 * 1024 * 1024;

    #[test]
    fn container_round_trips_through_lmdb() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LmdbStorage::open(dir.path(), MAP_SIZE).unwrap();
        assert!(storage.load().unwrap().is_none());

        storage.save(br#"[{"a":1}]"#).unwrap();
        assert_eq!(storage.load().unwrap().unwrap(), br#"[{"a":1}]"#);
    }

    #[test]
    fn snapshots_are_listed_and_pruned_oldest_first() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LmdbStorage::open(dir.path(), MAP_SIZE).unwrap();

        let mut ids = Vec::new();
        for i in 0..4 {
            storage.save(format!("[{i}]").as_bytes()).unwrap();
            ids.push(storage.snapshot().unwrap().id);
        }
        assert_eq!(storage.prune(2).unwrap(), 2);
        assert_eq!(storage.prune(2).unwrap(), 0);

        let remaining: Vec<String> = storage.backups().unwrap().into_iter().map(|h| h.id).collect();
        assert_eq!(remaining, ids[2..].to_vec());
    }

    #[test]
    fn data_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let storage = LmdbStorage::open(dir.path(), MAP_SIZE).unwrap();
            storage.save(b"[42]").unwrap();
            storage.close().unwrap();
        }
        let reopened = LmdbStorage::open(dir.path(), MAP_SIZE).unwrap();
        assert_eq!(reopened.load().unwrap().unwrap(), b"[42]");
    }
}
