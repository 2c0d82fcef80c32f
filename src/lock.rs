// src/lock.rs

//! Single-instance lock file for the daemon
//!
//! The daemon holds this lock for its entire lifetime so that only one
//! process ever owns the pool and repository state under a base directory.
//! The file carries the PID of its owner:
//!
//! - held via `flock` by another process -> [`Error::OwnedLockFile`]
//! - not held, but recording a PID that is still alive -> [`Error::OwnedLockFile`]
//! - not held, recording a PID that is gone -> stale, taken over
//! - unreadable or not a PID -> [`Error::DeadLockFile`]

use crate::error::{Error, Result};
use fs2::FileExt;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Exclusive daemon lock, released on drop
pub struct LockFile {
    /// The lock file handle (kept open to maintain lock)
    file: File,
    /// Path to the lock file
    path: PathBuf,
}

impl LockFile {
    /// Acquire the lock without blocking
    pub fn acquire<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        match file.try_lock_exclusive() {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                return Err(match read_pid(&mut file) {
                    Ok(Some(pid)) => Error::OwnedLockFile {
                        path: path.display().to_string(),
                        pid,
                    },
                    Ok(None) => Error::OwnedLockFile {
                        path: path.display().to_string(),
                        pid: 0,
                    },
                    Err(reason) => Error::DeadLockFile {
                        path: path.display().to_string(),
                        reason,
                    },
                });
            }
            Err(e) => {
                return Err(Error::IoError(format!(
                    "Failed to lock {}: {}",
                    path.display(),
                    e
                )));
            }
        }

        // We hold the flock; now make sure the recorded owner is really gone.
        let ours = std::process::id() as i32;
        match read_pid(&mut file) {
            Ok(Some(pid)) if pid != ours && process_alive(pid) => {
                let _ = file.unlock();
                return Err(Error::OwnedLockFile {
                    path: path.display().to_string(),
                    pid,
                });
            }
            Ok(Some(pid)) if pid != ours => {
                warn!("Taking over stale lock file {:?} left by PID {}", path, pid);
            }
            Ok(_) => {}
            Err(reason) => {
                let _ = file.unlock();
                return Err(Error::DeadLockFile {
                    path: path.display().to_string(),
                    reason,
                });
            }
        }

        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        write!(file, "{}", ours)?;
        file.sync_all()?;

        info!("Acquired daemon lock at {:?}", path);
        Ok(Self { file, path })
    }

    /// Get the path to the lock file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            debug!("Failed to remove lock file {:?}: {}", self.path, e);
        }
        let _ = self.file.unlock();
        info!("Released daemon lock at {:?}", self.path);
    }
}

/// Read the PID recorded in the lock file; `Ok(None)` for an empty file
fn read_pid(file: &mut File) -> std::result::Result<Option<i32>, String> {
    let mut content = String::new();
    file.seek(SeekFrom::Start(0))
        .and_then(|_| file.read_to_string(&mut content))
        .map_err(|e| e.to_string())?;

    let content = content.trim();
    if content.is_empty() {
        return Ok(None);
    }
    content
        .parse::<i32>()
        .ok()
        .filter(|pid| *pid > 0)
        .map(Some)
        .ok_or_else(|| format!("invalid PID {:?}", content))
}

/// Signal 0 checks for existence without delivering anything
fn process_alive(pid: i32) -> bool {
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(nix::errno::Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_acquire_writes_pid_and_releases() {
        let temp_dir = TempDir::new().unwrap();
        let lock_path = temp_dir.path().join("ferryd.lock");

        let lock = LockFile::acquire(&lock_path).unwrap();
        let content = fs::read_to_string(&lock_path).unwrap();
        assert_eq!(content, std::process::id().to_string());
        assert_eq!(lock.path(), lock_path.as_path());

        drop(lock);
        assert!(!lock_path.exists());
    }

    #[test]
    fn test_second_acquire_is_owned() {
        let temp_dir = TempDir::new().unwrap();
        let lock_path = temp_dir.path().join("ferryd.lock");

        let _lock = LockFile::acquire(&lock_path).unwrap();
        let second = LockFile::acquire(&lock_path);
        assert!(matches!(second, Err(Error::OwnedLockFile { .. })));
    }

    #[test]
    fn test_live_pid_is_owned() {
        let temp_dir = TempDir::new().unwrap();
        let lock_path = temp_dir.path().join("ferryd.lock");

        // PID 1 always exists
        fs::write(&lock_path, "1").unwrap();
        match LockFile::acquire(&lock_path) {
            Err(Error::OwnedLockFile { pid, .. }) => assert_eq!(pid, 1),
            other => panic!("expected OwnedLockFile, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_corrupt_file_is_dead() {
        let temp_dir = TempDir::new().unwrap();
        let lock_path = temp_dir.path().join("ferryd.lock");

        fs::write(&lock_path, "not-a-pid").unwrap();
        assert!(matches!(
            LockFile::acquire(&lock_path),
            Err(Error::DeadLockFile { .. })
        ));
    }

    #[test]
    fn test_stale_pid_is_taken_over() {
        let temp_dir = TempDir::new().unwrap();
        let lock_path = temp_dir.path().join("ferryd.lock");

        // Larger than any default pid_max
        fs::write(&lock_path, "2147483000").unwrap();
        let _lock = LockFile::acquire(&lock_path).unwrap();
        assert_eq!(
            fs::read_to_string(&lock_path).unwrap(),
            std::process::id().to_string()
        );
    }

    #[test]
    fn test_creates_parent_dirs() {
        let temp_dir = TempDir::new().unwrap();
        let lock_path = temp_dir.path().join("subdir/deep/ferryd.lock");

        let _lock = LockFile::acquire(&lock_path).unwrap();
        assert!(lock_path.exists());
    }
}
