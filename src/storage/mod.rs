//! Persistence of loop snapshots.

pub mod codec;
#[cfg(feature = "persistent")]
pub mod file_lock;
pub mod snapshot;

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use uuid::Uuid;

use crate::error::StorageError;

#[cfg(feature = "persistent")]
pub use file_lock::{FileLock, LockHolder};
pub use snapshot::{Snapshot, SnapshotStore};

/// Writes `path` through a uniquely named temp file that is synced and
/// then renamed over the target. On unix the parent directory is synced
/// too, so the rename itself survives a crash.
pub(crate) fn write_atomic(
    path: &Path,
    write: impl FnOnce(&mut BufWriter<File>) -> Result<(), StorageError>,
) -> Result<(), StorageError> {
    let extension = path
        .extension()
        .map_or_else(String::new, |e| format!("{}.", e.to_string_lossy()));
    let temp_path = path.with_extension(format!("{extension}tmp.{}", Uuid::new_v4()));
    let result = (|| {
        let mut writer = BufWriter::new(File::create(&temp_path)?);
        write(&mut writer)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok::<(), StorageError>(())
    })();
    if let Err(e) = result {
        let _ = fs::remove_file(&temp_path);
        return Err(e);
    }
    fs::rename(&temp_path, path)?;
    sync_parent_dir(path)?;
    Ok(())
}

#[cfg(unix)]
fn sync_parent_dir(path: &Path) -> Result<(), StorageError> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    File::open(parent)?.sync_all()?;
    Ok(())
}

// Directories cannot be opened for syncing here; the rename is as
// durable as the platform makes it.
#[cfg(not(unix))]
fn sync_parent_dir(_path: &Path) -> Result<(), StorageError> {
    Ok(())
}
