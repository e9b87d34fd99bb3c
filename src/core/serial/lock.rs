//! Exclusive ownership of a serial device across processes
//!
//! An advisory `flock(2)` on `<lock dir>/LCK..<device name>`. Acquisition
//! never blocks: a second daemon for the same device fails immediately.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

/// Lock acquisition errors
#[derive(Error, Debug)]
pub enum LockError {
    /// Another process holds the lock
    #[error("Device {device} is locked by another process ({})", lock_path.display())]
    AlreadyHeld {
        /// Device path
        device: String,
        /// Lock file
        lock_path: PathBuf,
    },

    /// Lock file could not be created or locked
    #[error("Lock file {}: {source}", path.display())]
    Io {
        /// Lock file
        path: PathBuf,
        /// Cause
        source: io::Error,
    },
}

/// Held lock on one device
///
/// Released by [`release`](Self::release); dropping the value releases it too.
#[derive(Debug)]
pub struct SerialPortLock {
    device: String,
    path: PathBuf,
    file: Option<File>,
}

impl SerialPortLock {
    /// Lock file used for `device` inside `lock_dir`
    pub fn lock_path(lock_dir: &Path, device: &str) -> PathBuf {
        let name = Path::new(device)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| device.replace(['/', '\\'], "_"));
        lock_dir.join(format!("LCK..{name}"))
    }

    /// Try to take the lock without waiting
    pub fn acquire(lock_dir: &Path, device: &str) -> Result<Self, LockError> {
        let path = Self::lock_path(lock_dir, device);
        let io_err = |source| LockError::Io {
            path: path.clone(),
            source,
        };

        std::fs::create_dir_all(lock_dir).map_err(io_err)?;
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(io_err)?;

        match try_lock_exclusive(&file) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                return Err(LockError::AlreadyHeld {
                    device: device.to_string(),
                    lock_path: path,
                });
            }
            Err(err) => return Err(io_err(err)),
        }

        file.set_len(0).map_err(io_err)?;
        writeln!(file, "{:>10}", std::process::id()).map_err(io_err)?;
        debug!(device, lock = %path.display(), "Device lock acquired");

        Ok(Self {
            device: device.to_string(),
            path,
            file: Some(file),
        })
    }

    /// Device this lock protects
    pub fn device(&self) -> &str {
        &self.device
    }

    /// Lock file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release the lock now
    pub fn release(mut self) {
        self.unlock();
    }

    fn unlock(&mut self) {
        let Some(file) = self.file.take() else {
            return;
        };
        if let Err(err) = file.set_len(0) {
            warn!(lock = %self.path.display(), %err, "Could not clear lock file");
        }
        unlock_file(&file, &self.path);
        debug!(device = %self.device, "Device lock released");
    }
}

impl Drop for SerialPortLock {
    fn drop(&mut self) {
        self.unlock();
    }
}

#[cfg(unix)]
fn try_lock_exclusive(file: &File) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;

    let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if result == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(unix)]
fn unlock_file(file: &File, _path: &Path) {
    use std::os::unix::io::AsRawFd;

    unsafe {
        libc::flock(file.as_raw_fd(), libc::LOCK_UN);
    }
}

#[cfg(not(unix))]
fn try_lock_exclusive(file: &File) -> io::Result<()> {
    // No flock: a non-empty lock file means somebody holds it
    if file.metadata()?.len() > 0 {
        return Err(io::ErrorKind::WouldBlock.into());
    }
    Ok(())
}

#[cfg(not(unix))]
fn unlock_file(_file: &File, _path: &Path) {}
