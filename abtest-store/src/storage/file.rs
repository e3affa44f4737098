use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tokio::{fs, io::AsyncWriteExt};
use tracing::debug;

use super::{slot_name, CounterStorage, StorageError, StorageFuture};

const RECORD_EXTENSION: &str = "json";
const TEMP_EXTENSION: &str = "json.tmp";

#[derive(Debug, Deserialize, Serialize)]
struct CounterRecord {
    key: String,
    value: u64,
}

/// File-backed counter storage.
///
/// Each counter is persisted as a small JSON record in its own file under a root directory, named
/// after the counter's [slot][crate::slot_name]. Writes go to a temporary file that is synced to
/// disk and then atomically renamed over the previous record, so a reader only ever sees a
/// complete record.
#[derive(Debug, Clone)]
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    /// Opens file storage rooted at `root`, creating the directory if it does not exist.
    ///
    /// # Errors
    ///
    /// If the directory cannot be created, an error variant will be returned describing the error.
    pub fn open<P>(root: P) -> Result<Self, StorageError>
    where
        P: Into<PathBuf>,
    {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .map_err(|source| StorageError::Io { slot: root.display().to_string(), source })?;
        Ok(Self { root })
    }

    /// Gets the path of the record file for `key`.
    pub fn record_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.{RECORD_EXTENSION}", slot_name(key)))
    }

    async fn read_record(&self, key: &str) -> Result<Option<u64>, StorageError> {
        let slot = slot_name(key);
        let path = self.record_path(key);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(StorageError::Io { slot, source }),
        };
        if bytes.is_empty() {
            return Ok(None);
        }

        let record = serde_json::from_slice::<CounterRecord>(&bytes)
            .map_err(|e| StorageError::Corrupt { slot: slot.clone(), reason: e.to_string() })?;
        if record.key != key {
            return Err(StorageError::KeyMismatch {
                slot,
                expected: key.to_owned(),
                found: record.key,
            });
        }

        debug!(key, value = record.value, path = %path.display(), "loaded counter record");
        Ok(Some(record.value))
    }

    async fn write_record(&self, key: &str, value: u64) -> Result<(), StorageError> {
        let slot = slot_name(key);
        let path = self.record_path(key);
        let tmp_path = path.with_extension(TEMP_EXTENSION);

        let record = CounterRecord { key: key.to_owned(), value };
        let bytes = serde_json::to_vec(&record)
            .map_err(|e| StorageError::Corrupt { slot: slot.clone(), reason: e.to_string() })?;

        write_synced(&tmp_path, &bytes).await.map_err(|source| StorageError::Io {
            slot: slot.clone(),
            source,
        })?;
        fs::rename(&tmp_path, &path)
            .await
            .map_err(|source| StorageError::Io { slot: slot.clone(), source })?;
        sync_dir(&self.root).await.map_err(|source| StorageError::Io { slot, source })?;

        Ok(())
    }
}

impl CounterStorage for FileStorage {
    fn load<'a>(&'a self, key: &'a str) -> StorageFuture<'a, Option<u64>> {
        Box::pin(self.read_record(key))
    }

    fn store<'a>(&'a self, key: &'a str, value: u64) -> StorageFuture<'a, ()> {
        Box::pin(self.write_record(key, value))
    }
}

async fn write_synced(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = fs::File::create(path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await
}

#[cfg(unix)]
async fn sync_dir(dir: &Path) -> io::Result<()> {
    fs::File::open(dir).await?.sync_all().await
}

#[cfg(not(unix))]
async fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}
