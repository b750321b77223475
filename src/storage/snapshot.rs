//! Persisted loop state.
//!
//! A snapshot file is the codec header followed by exactly one framed
//! record holding the whole [`Snapshot`]. Files are replaced atomically,
//! so a crash mid-write leaves the previous snapshot intact.

use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::control::LoopState;
use crate::error::StorageError;
use crate::storage::codec::{self, CODEC_VERSION};
use crate::storage::write_atomic;

/// Everything needed to resume a population run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Codec version the snapshot was written with.
    pub version: u8,
    /// Run the state belongs to.
    pub run_id: Uuid,
    /// When the snapshot was taken.
    pub saved_at: DateTime<Utc>,
    /// Loop state between two targets.
    pub state: LoopState,
}

impl Snapshot {
    /// Captures `state` now.
    #[must_use]
    pub fn new(run_id: Uuid, state: LoopState) -> Self {
        Self {
            version: CODEC_VERSION,
            run_id,
            saved_at: Utc::now(),
            state,
        }
    }

    /// Writes header and record.
    pub fn write_to(&self, writer: &mut impl Write) -> Result<(), StorageError> {
        codec::write_header(writer)?;
        writer.write_all(&codec::encode(self)?)?;
        writer.flush()?;
        Ok(())
    }

    /// Reads a snapshot written by [`Snapshot::write_to`].
    ///
    /// # Errors
    /// `Corrupted` on bad magic, unknown version or checksum mismatch.
    pub fn read_from(reader: &mut impl Read) -> Result<Self, StorageError> {
        let version = codec::read_header(reader)?;
        if version != CODEC_VERSION {
            return Err(StorageError::Corrupted {
                message: format!("unsupported snapshot version {version} (expected {CODEC_VERSION})"),
            });
        }
        let snapshot: Self = codec::decode(reader)?;
        Ok(snapshot)
    }

    /// Atomically replaces the file at `path`.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), StorageError> {
        let path = path.as_ref();
        write_atomic(path, |w| self.write_to(w))?;
        info!(
            path = %path.display(),
            run_id = %self.run_id,
            entities = self.state.pkb.entity_count(),
            situations = self.state.pkb.situation_count(),
            queued = self.state.queue.len(),
            "snapshot saved"
        );
        Ok(())
    }

    /// Loads the snapshot at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        let mut reader = BufReader::new(File::open(path)?);
        let snapshot = Self::read_from(&mut reader)?;
        info!(
            path = %path.display(),
            run_id = %snapshot.run_id,
            saved_at = %snapshot.saved_at,
            "snapshot loaded"
        );
        Ok(snapshot)
    }
}

/// A snapshot directory owned by one writer.
///
/// With the `persistent` feature the directory is locked for the lifetime
/// of the store.
#[derive(Debug)]
pub struct SnapshotStore {
    dir: PathBuf,
    #[cfg(feature = "persistent")]
    _lock: crate::storage::FileLock,
}

impl SnapshotStore {
    /// File name of the current snapshot inside the directory.
    pub const FILE_NAME: &'static str = "pkb.snapshot";

    /// Opens (creating if needed) a snapshot directory.
    ///
    /// # Errors
    /// `Locked` if another store holds the directory.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        Self::open_with(dir.as_ref(), None)
    }

    /// Opens a snapshot directory on behalf of population run `run_id`,
    /// which is recorded as the lock holder.
    ///
    /// # Errors
    /// `Locked` if another store holds the directory.
    pub fn open_for_run(dir: impl AsRef<Path>, run_id: Uuid) -> Result<Self, StorageError> {
        Self::open_with(dir.as_ref(), Some(run_id))
    }

    #[cfg_attr(not(feature = "persistent"), allow(unused_variables))]
    fn open_with(dir: &Path, run_id: Option<Uuid>) -> Result<Self, StorageError> {
        let dir = dir.to_path_buf();
        std::fs::create_dir_all(&dir)?;
        #[cfg(feature = "persistent")]
        let lock = {
            use crate::storage::file_lock::{FileLock, LockHolder};

            FileLock::acquire(&dir, LockHolder::current(run_id)).map_err(|e| {
                if e.kind() == std::io::ErrorKind::WouldBlock {
                    StorageError::Locked {
                        path: dir.display().to_string(),
                        holder: FileLock::read_holder(&dir)
                            .map_or_else(|| "unknown holder".to_string(), |h| h.to_string()),
                    }
                } else {
                    StorageError::Io(e)
                }
            })?
        };
        Ok(Self {
            dir,
            #[cfg(feature = "persistent")]
            _lock: lock,
        })
    }

    /// Path of the current snapshot file.
    #[must_use]
    pub fn path(&self) -> PathBuf {
        self.dir.join(Self::FILE_NAME)
    }

    /// Replaces the current snapshot.
    pub fn save(&self, snapshot: &Snapshot) -> Result<(), StorageError> {
        snapshot.save(self.path())
    }

    /// Loads the current snapshot, `None` if nothing was saved yet.
    pub fn load(&self) -> Result<Option<Snapshot>, StorageError> {
        let path = self.path();
        if !path.exists() {
            return Ok(None);
        }
        Snapshot::load(path).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::collab::SentenceRef;
    use crate::control::SearchTarget;
    use crate::entity::EntityId;

    fn state() -> LoopState {
        let mut state = LoopState::new(9001);
        state.seen.insert(SentenceRef::new("D1", 0));
        state.queue.push_back(SearchTarget::new([EntityId::new(0), EntityId::new(1)]));
        state.known_pairs.insert((EntityId::new(0), EntityId::new(1)));
        state
    }

    #[test]
    fn test_roundtrip_in_memory() {
        let snapshot = Snapshot::new(Uuid::new_v4(), state());
        let mut buf = Vec::new();
        snapshot.write_to(&mut buf).unwrap();
        assert_eq!(&buf[..4], b"PKBP");
        let back = Snapshot::read_from(&mut Cursor::new(buf)).unwrap();
        assert_eq!(back, snapshot);
    }

    #[test]
    fn test_corruption_detected() {
        let snapshot = Snapshot::new(Uuid::new_v4(), state());
        let mut buf = Vec::new();
        snapshot.write_to(&mut buf).unwrap();
        let mid = buf.len() / 2;
        buf[mid] ^= 0x5A;
        let err = Snapshot::read_from(&mut Cursor::new(buf)).unwrap_err();
        assert!(matches!(err, StorageError::Corrupted { .. } | StorageError::Serialization { .. }));
    }

    #[test]
    fn test_save_replaces_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.snapshot");
        let first = Snapshot::new(Uuid::new_v4(), LoopState::new(1));
        first.save(&path).unwrap();
        let second = Snapshot::new(Uuid::new_v4(), state());
        second.save(&path).unwrap();
        assert_eq!(Snapshot::load(&path).unwrap(), second);

        // No temp files are left behind.
        let names: Vec<_> = std::fs::read_dir(dir.path()).unwrap().map(|e| e.unwrap().file_name()).collect();
        assert_eq!(names.len(), 1);
    }

    #[test]
    fn test_store_load_empty_then_saved() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::open(dir.path().join("snapshots")).unwrap();
        assert!(store.load().unwrap().is_none());
        let snapshot = Snapshot::new(Uuid::new_v4(), state());
        store.save(&snapshot).unwrap();
        assert_eq!(store.load().unwrap(), Some(snapshot));
    }
}
