//! Exclusive operation lock keyed by the sandbox root path.

use std::io::Write;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Lock file held for the duration of a lifecycle operation.
///
/// Acquisition never waits: if the file already exists and the process that
/// wrote it is still alive, the sandbox is busy. A lock left behind by a dead
/// process is taken over.
#[derive(Debug)]
pub struct SandboxLock {
    path: PathBuf,
    released: bool,
}

/// Lock file path for a sandbox root inside `state_dir`.
pub fn lock_path(state_dir: &Path, root_path: &Path) -> PathBuf {
    let digest = Sha256::digest(root_path.to_string_lossy().as_bytes());
    let key = hex::encode(digest);
    state_dir.join(format!("{}.lock", &key[..16]))
}

impl SandboxLock {
    pub fn acquire(state_dir: &Path, root_path: &Path) -> Result<Self> {
        std::fs::create_dir_all(state_dir)?;
        let path = lock_path(state_dir, root_path);

        let mut file = match Self::create(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let Some(pid) = stale_owner(&path) else {
                    return Err(Error::SandboxBusy(path));
                };
                tracing::warn!(
                    lock = %path.display(),
                    pid,
                    "taking over lock left by a process that is no longer running"
                );
                match std::fs::remove_file(&path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
                // someone else may have won the takeover
                match Self::create(&path) {
                    Ok(file) => file,
                    Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                        return Err(Error::SandboxBusy(path));
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            Err(e) => return Err(e.into()),
        };
        writeln!(file, "{}", std::process::id())?;

        tracing::debug!(lock = %path.display(), root = %root_path.display(), "acquired sandbox lock");
        Ok(Self {
            path,
            released: false,
        })
    }

    fn create(path: &Path) -> std::io::Result<std::fs::File> {
        std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn release(mut self) -> Result<()> {
        self.remove()
    }

    fn remove(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.released = true;
        tracing::debug!(lock = %self.path.display(), "released sandbox lock");
        Ok(())
    }
}

/// PID recorded in an existing lock file, if that process is gone.
///
/// A lock whose owner cannot be read is treated as held.
fn stale_owner(path: &Path) -> Option<u32> {
    let text = std::fs::read_to_string(path).ok()?;
    let pid = text.trim().parse::<u32>().ok()?;
    (!process_alive(pid)).then_some(pid)
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    match i32::try_from(pid) {
        // signal 0 checks existence; EPERM still means the process exists
        Ok(raw) if raw > 0 => !matches!(kill(Pid::from_raw(raw), None), Err(Errno::ESRCH)),
        _ => false,
    }
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    true
}

impl Drop for SandboxLock {
    fn drop(&mut self) {
        if let Err(e) = self.remove() {
            tracing::error!(error = %e, lock = ?self.path, "failed to release sandbox lock on drop");
        }
    }
}
