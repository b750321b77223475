//! Single-writer lock on a snapshot directory.
//!
//! The lock is an OS-level exclusive lock on `<dir>/.lock`, released when
//! the [`FileLock`] is dropped. The holder records who it is (process id,
//! run id, acquisition time) in the file body so a refused writer can say
//! which run is in the way.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{Error as IoError, ErrorKind, Result as IoResult, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Name of the lock file inside a snapshot directory.
pub const LOCK_FILE_NAME: &str = ".lock";

/// Identity of the process holding a snapshot directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockHolder {
    /// Operating system process id.
    pub pid: u32,
    /// Population run writing into the directory, if known.
    pub run_id: Option<Uuid>,
    /// When the lock was taken.
    pub acquired_at: DateTime<Utc>,
}

impl LockHolder {
    /// The current process, optionally tagged with its run.
    #[must_use]
    pub fn current(run_id: Option<Uuid>) -> Self {
        Self {
            pid: std::process::id(),
            run_id,
            acquired_at: Utc::now(),
        }
    }
}

impl fmt::Display for LockHolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pid {}", self.pid)?;
        if let Some(run) = self.run_id {
            write!(f, ", run {run}")?;
        }
        write!(f, ", since {}", self.acquired_at.to_rfc3339())
    }
}

/// Exclusive lock on a snapshot directory.
#[derive(Debug)]
pub struct FileLock {
    _file: File,
    path: PathBuf,
    holder: LockHolder,
}

impl FileLock {
    /// Takes the lock of `dir` for `holder` and records it in the lock file.
    ///
    /// # Errors
    /// - `ErrorKind::WouldBlock` if another holder has the lock
    /// - any I/O error opening or writing the lock file
    pub fn acquire(dir: &Path, holder: LockHolder) -> IoResult<Self> {
        let path = dir.join(LOCK_FILE_NAME);
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        lock_exclusive(&file)?;

        // Only the holder rewrites the body.
        let body = serde_json::to_vec(&holder).map_err(|e| IoError::new(ErrorKind::InvalidData, e))?;
        file.set_len(0)?;
        file.write_all(&body)?;
        file.sync_data()?;
        tracing::debug!(path = %path.display(), %holder, "snapshot directory locked");

        Ok(Self {
            _file: file,
            path,
            holder,
        })
    }

    /// Reads the holder recorded in `dir`'s lock file.
    ///
    /// Returns `None` if there is no lock file or its body is not a holder
    /// record. The record of a released lock stays until the next holder
    /// overwrites it.
    #[must_use]
    pub fn read_holder(dir: &Path) -> Option<LockHolder> {
        let body = fs::read(dir.join(LOCK_FILE_NAME)).ok()?;
        serde_json::from_slice(&body).ok()
    }

    /// Path of the lock file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Who holds the lock.
    #[must_use]
    pub const fn holder(&self) -> &LockHolder {
        &self.holder
    }
}

#[cfg(unix)]
fn lock_exclusive(file: &File) -> IoResult<()> {
    use std::os::unix::io::AsRawFd;

    // SAFETY: the descriptor is owned by `file` and valid for this call.
    if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) } == 0 {
        return Ok(());
    }
    let err = IoError::last_os_error();
    match err.raw_os_error() {
        Some(code) if code == libc::EWOULDBLOCK => Err(IoError::new(ErrorKind::WouldBlock, err)),
        _ => Err(err),
    }
}

#[cfg(windows)]
fn lock_exclusive(file: &File) -> IoResult<()> {
    use std::os::windows::io::AsRawHandle;
    use windows_sys::Win32::Foundation::{ERROR_LOCK_VIOLATION, HANDLE};
    use windows_sys::Win32::Storage::FileSystem::{
        LockFileEx, LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY,
    };
    use windows_sys::Win32::System::IO::OVERLAPPED;

    // Lock one byte at offset 2^32, past any holder record, so other
    // processes can still read the record.
    // SAFETY: the handle belongs to `file`; OVERLAPPED is plain data.
    let locked = unsafe {
        let mut overlapped = std::mem::zeroed::<OVERLAPPED>();
        overlapped.Anonymous.Anonymous.OffsetHigh = 1;
        LockFileEx(
            file.as_raw_handle() as HANDLE,
            LOCKFILE_EXCLUSIVE_LOCK | LOCKFILE_FAIL_IMMEDIATELY,
            0,
            1,
            0,
            &mut overlapped,
        )
    };
    if locked != 0 {
        return Ok(());
    }
    let err = IoError::last_os_error();
    match err.raw_os_error() {
        #[allow(clippy::cast_possible_wrap)]
        Some(code) if code == ERROR_LOCK_VIOLATION as i32 => Err(IoError::new(ErrorKind::WouldBlock, err)),
        _ => Err(err),
    }
}

#[cfg(not(any(unix, windows)))]
fn lock_exclusive(_file: &File) -> IoResult<()> {
    Err(IoError::new(
        ErrorKind::Unsupported,
        "snapshot directory locking is not supported on this platform",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_holder_recorded_and_released() {
        let dir = tempdir().unwrap();
        let run = Uuid::new_v4();
        {
            let lock = FileLock::acquire(dir.path(), LockHolder::current(Some(run))).unwrap();
            assert!(lock.path().exists());
            assert_eq!(FileLock::read_holder(dir.path()).as_ref(), Some(lock.holder()));
        }
        // Released on drop; the next holder replaces the record.
        let lock = FileLock::acquire(dir.path(), LockHolder::current(None)).unwrap();
        let recorded = FileLock::read_holder(dir.path()).unwrap();
        assert_eq!(recorded.run_id, None);
        assert_eq!(recorded.pid, std::process::id());
        assert_eq!(&recorded, lock.holder());
    }

    #[test]
    fn test_second_holder_refused() {
        let dir = tempdir().unwrap();
        let run = Uuid::new_v4();
        let _lock = FileLock::acquire(dir.path(), LockHolder::current(Some(run))).unwrap();
        let err = FileLock::acquire(dir.path(), LockHolder::current(None)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WouldBlock);
        // The refused attempt must not clobber the record.
        assert_eq!(FileLock::read_holder(dir.path()).unwrap().run_id, Some(run));
    }

    #[test]
    fn test_holder_display() {
        let holder = LockHolder::current(Some(Uuid::nil()));
        let text = holder.to_string();
        assert!(text.starts_with(&format!("pid {}", std::process::id())));
        assert!(text.contains("run 00000000-0000-0000-0000-000000000000"));
        assert!(FileLock::read_holder(Path::new("/nonexistent/pkbp")).is_none());
    }
}
