//! Named, system-wide advisory lock that arbitrates exclusive access to a
//! camera device across independent tinycam processes.
//!
//! The lock file's name is derived from a SHA-256 hash of the device
//! identifier rather than the identifier itself, so arbitrary device ids
//! (which may contain path separators or other awkward characters on some
//! platforms) always produce a safe, short filename.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::error::{TinycamError, TinycamResult};

/// Holds a device's advisory lock for as long as it is alive. Best-effort
/// release on `Drop`; the OS also releases the underlying file lock if the
/// process dies without running destructors.
pub struct DeviceLock {
    _file: File,
    path: PathBuf,
}

impl DeviceLock {
    /// Attempts to acquire the advisory lock for `device_id`, placing the
    /// lock file under `lock_dir`. Fails immediately (non-blocking) if
    /// another live process already holds it.
    pub fn acquire(lock_dir: &Path, device_id: &str) -> TinycamResult<Self> {
        fs::create_dir_all(lock_dir).map_err(|e| {
            TinycamError::ResourceFailure(format!("cannot create lock directory: {e}"))
        })?;

        let path = lock_dir.join(format!("{}.lock", lock_file_stem(device_id)));
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| TinycamError::ResourceFailure(format!("cannot open lock file: {e}")))?;

        lock_exclusive_nonblocking(&file).map_err(|_| {
            TinycamError::ResourceFailure(format!(
                "device '{device_id}' is already in use by another process"
            ))
        })?;

        Ok(Self { _file: file, path })
    }

    /// Path of the underlying lock file, for diagnostics.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Derives a filesystem-safe lock file stem from a device identifier: the
/// first 16 hex characters of its SHA-256 digest.
fn lock_file_stem(device_id: &str) -> String {
    let digest = Sha256::digest(device_id.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    hex[..16].to_string()
}

#[cfg(unix)]
fn lock_exclusive_nonblocking(file: &File) -> std::io::Result<()> {
    use std::os::unix::io::AsRawFd;

    let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if ret == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(windows)]
fn lock_exclusive_nonblocking(file: &File) -> std::io::Result<()> {
    use std::os::windows::io::AsRawHandle;
    use windows_sys::Win32::Foundation::HANDLE;
    use windows_sys::Win32::Storage::FileSystem::{
        LockFileEx, LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY,
    };

    let handle = file.as_raw_handle() as HANDLE;
    let mut overlapped: windows_sys::Win32::System::IO::OVERLAPPED = unsafe { std::mem::zeroed() };
    let ok = unsafe {
        LockFileEx(
            handle,
            LOCKFILE_EXCLUSIVE_LOCK | LOCKFILE_FAIL_IMMEDIATELY,
            0,
            !0,
            !0,
            &mut overlapped,
        )
    };
    if ok == 0 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(())
    }
}
