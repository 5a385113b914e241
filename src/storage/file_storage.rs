use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use log::{debug, info};

use super::{BackupClock, BackupHandle, Storage, EMPTY_CONTAINER};
use crate::error::StorageError;

const CONTAINER_FILE: &str = "supplements.json";
const BACKUP_DIR: &str = "backups";
const BACKUP_PREFIX: &str = "supplements-";
const BACKUP_SUFFIX: &str = ".json";

/// JSON container on disk with a sibling `backups/` directory.
///
/// Writes go to a temporary file that is synced and then renamed over the
/// container, so a crash mid-write leaves the previous container intact.
#[derive(Debug)]
pub struct FileStorage {
    container: PathBuf,
    backup_dir: PathBuf,
    clock: BackupClock,
}

impl FileStorage {
    pub fn open(root: impl AsRef<Path>) -> Result<Self, StorageError> {
        let root = root.as_ref();
        let backup_dir = root.join(BACKUP_DIR);
        fs::create_dir_all(&backup_dir)?;
        info!("Opened file storage at {}", root.display());
        Ok(FileStorage {
            container: root.join(CONTAINER_FILE),
            backup_dir,
            clock: BackupClock::default(),
        })
    }
}

impl Storage for FileStorage {
    fn load(&self) -> Result<Option<Vec<u8>>, StorageError> {
        match fs::read(&self.container) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, bytes: &[u8]) -> Result<(), StorageError> {
        write_atomically(&self.container, bytes)
    }

    fn snapshot(&self) -> Result<BackupHandle, StorageError> {
        let bytes = self.load()?.unwrap_or_else(|| EMPTY_CONTAINER.to_vec());
        let id = self.clock.next_id(Utc::now());
        let path = self.backup_dir.join(format!("{BACKUP_PREFIX}{id}{BACKUP_SUFFIX}"));
        write_atomically(&path, &bytes)?;
        debug!("Backup written to {}", path.display());
        Ok(BackupHandle {
            id,
            location: path.display().to_string(),
        })
    }

    fn backups(&self) -> Result<Vec<BackupHandle>, StorageError> {
        let mut handles = Vec::new();
        for entry in fs::read_dir(&self.backup_dir)? {
            let entry = entry?;
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            let Some(id) = name
                .strip_prefix(BACKUP_PREFIX)
                .and_then(|rest| rest.strip_suffix(BACKUP_SUFFIX))
            else {
                continue;
            };
            handles.push(BackupHandle {
                id: id.to_string(),
                location: entry.path().display().to_string(),
            });
        }
        handles.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(handles)
    }

    fn prune(&self, keep: usize) -> Result<usize, StorageError> {
        let handles = self.backups()?;
        let excess = handles.len().saturating_sub(keep);
        for handle in &handles[..excess] {
            fs::remove_file(&handle.location)?;
            debug!("Pruned backup {}", handle.location);
        }
        Ok(excess)
    }
}

fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let mut file = File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_container_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::open(dir.path()).unwrap();
        assert!(storage.load().unwrap().is_none());
    }

    #[test]
    fn save_replaces_container() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::open(dir.path()).unwrap();
        storage.save(b"[1]").unwrap();
        storage.save(b"[2]").unwrap();
        assert_eq!(storage.load().unwrap().unwrap(), b"[2]");
        assert!(!dir.path().join("supplements.json.tmp").exists());
    }

    #[test]
    fn snapshots_copy_current_container_and_prune_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::open(dir.path()).unwrap();

        let mut ids = Vec::new();
        for i in 0..5 {
            storage.save(format!("[{i}]").as_bytes()).unwrap();
            ids.push(storage.snapshot().unwrap().id);
        }
        assert_eq!(storage.prune(3).unwrap(), 2);

        let remaining = storage.backups().unwrap();
        assert_eq!(
            remaining.iter().map(|h| h.id.clone()).collect::<Vec<_>>(),
            ids[2..].to_vec()
        );
        assert_eq!(fs::read(&remaining[0].location).unwrap(), b"[2]");
    }
}
