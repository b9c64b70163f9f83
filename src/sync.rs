//! File synchronization between the host project tree and the sandbox.
//!
//! Covers pushing and pulling single files, content fingerprints on either
//! side, diffing, and the versioned backups taken before teardown.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{NaiveDateTime, Timelike};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;

use crate::config::SandboxIdentity;
use crate::error::{Error, Result};
use crate::path::FileMapping;
use crate::sandbox::SandboxBackend;

/// Timestamp format embedded in backup file names.
pub const BACKUP_TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Which copy of a file to look at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Host,
    Sandbox,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Host => "host",
            Side::Sandbox => "sandbox",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// SHA-256 digest of a file's contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn of(contents: &[u8]) -> Self {
        let digest = Sha256::digest(contents);
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&digest);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// A versioned copy of a sandbox file kept on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupRecord {
    /// Base name of the file that was backed up.
    pub original_name: String,
    /// When the backup was taken, to the second.
    pub timestamp: NaiveDateTime,
    /// Where the backup was written.
    pub backup_path: PathBuf,
}

impl BackupRecord {
    /// Recovers a record from a backup file name: `<marker>-<basename>-d<timestamp>[_n]`.
    ///
    /// Returns `None` for names that do not follow the layout.
    pub fn parse(path: &Path, marker: &str) -> Option<Self> {
        let name = path.file_name()?.to_str()?;
        let rest = name.strip_prefix(marker)?.strip_prefix('-')?;
        let (original_name, stamp) = rest.rsplit_once("-d")?;
        if original_name.is_empty() {
            return None;
        }

        // YYYYMMDD_HHMMSS, optionally followed by _<counter>
        let (timestamp, counter) = match stamp.get(15..) {
            Some("") => (stamp, None),
            Some(suffix) => (&stamp[..15], Some(suffix.strip_prefix('_')?)),
            None => return None,
        };
        if let Some(counter) = counter {
            if counter.is_empty() || !counter.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
        }

        let timestamp = NaiveDateTime::parse_from_str(timestamp, BACKUP_TIMESTAMP_FORMAT).ok()?;
        Some(Self {
            original_name: original_name.to_string(),
            timestamp,
            backup_path: path.to_path_buf(),
        })
    }
}

/// Builds a backup file name. `attempt` 1 has no counter suffix.
pub fn backup_file_name(
    marker: &str,
    original_name: &str,
    timestamp: &NaiveDateTime,
    attempt: u32,
) -> String {
    let stamp = timestamp.format(BACKUP_TIMESTAMP_FORMAT);
    if attempt <= 1 {
        format!("{}-{}-d{}", marker, original_name, stamp)
    } else {
        format!("{}-{}-d{}_{}", marker, original_name, stamp, attempt)
    }
}

/// Lists the backups in `dir`, oldest first. A missing directory has none.
pub fn list_backups(dir: &Path, marker: &str) -> Result<Vec<BackupRecord>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
        Err(e) => return Err(e.into()),
    };

    let mut records = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        if let Some(record) = BackupRecord::parse(&entry.path(), marker) {
            records.push(record);
        }
    }

    records.sort_by(|a, b| {
        a.timestamp
            .cmp(&b.timestamp)
            .then_with(|| a.backup_path.cmp(&b.backup_path))
    });
    Ok(records)
}

/// Current local time truncated to whole seconds.
pub(crate) fn backup_timestamp() -> NaiveDateTime {
    let now = chrono::Local::now().naive_local();
    now.with_nanosecond(0).unwrap_or(now)
}

/// Moves files between the host and one sandbox.
pub struct FileSync<'a> {
    backend: &'a dyn SandboxBackend,
    identity: &'a SandboxIdentity,
    backup_dir: PathBuf,
    marker: String,
}

impl<'a> FileSync<'a> {
    pub fn new(
        backend: &'a dyn SandboxBackend,
        identity: &'a SandboxIdentity,
        backup_dir: impl Into<PathBuf>,
        marker: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            identity,
            backup_dir: backup_dir.into(),
            marker: marker.into(),
        }
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    async fn read_host(&self, path: &Path) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_side(&self, mapping: &FileMapping, side: Side) -> Result<Option<Vec<u8>>> {
        match side {
            Side::Host => self.read_host(&mapping.host_path).await,
            Side::Sandbox => {
                self.backend
                    .read_file(self.identity, &mapping.sandbox_path)
                    .await
            }
        }
    }

    /// Copies the host file into the sandbox, replacing any existing copy.
    pub async fn push(&self, mapping: &FileMapping) -> Result<()> {
        let contents = self
            .read_host(&mapping.host_path)
            .await?
            .ok_or_else(|| Error::NotFound {
                side: "host",
                path: mapping.host_path.clone(),
            })?;

        self.backend
            .write_file(self.identity, &mapping.sandbox_path, &contents)
            .await?;

        tracing::info!(
            host = %mapping.host_path.display(),
            sandbox = %mapping.sandbox_path.display(),
            bytes = contents.len(),
            "pushed file"
        );
        Ok(())
    }

    /// Copies the sandbox file back over its host counterpart.
    pub async fn pull(&self, mapping: &FileMapping) -> Result<()> {
        let contents = self
            .backend
            .read_file(self.identity, &mapping.sandbox_path)
            .await?
            .ok_or_else(|| Error::NotFound {
                side: "sandbox",
                path: mapping.sandbox_path.clone(),
            })?;

        if let Some(parent) = mapping.host_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&mapping.host_path, &contents).await?;

        tracing::info!(
            sandbox = %mapping.sandbox_path.display(),
            host = %mapping.host_path.display(),
            bytes = contents.len(),
            "pulled file"
        );
        Ok(())
    }

    /// Hashes one side of a mapping. Fails with `NotFound` if that side is absent.
    pub async fn fingerprint(&self, mapping: &FileMapping, side: Side) -> Result<Fingerprint> {
        let path = match side {
            Side::Host => &mapping.host_path,
            Side::Sandbox => &mapping.sandbox_path,
        };
        self.read_side(mapping, side)
            .await?
            .map(|bytes| Fingerprint::of(&bytes))
            .ok_or_else(|| Error::NotFound {
                side: side.as_str(),
                path: path.clone(),
            })
    }

    async fn fingerprint_if_present(
        &self,
        mapping: &FileMapping,
        side: Side,
    ) -> Result<Option<Fingerprint>> {
        match self.fingerprint(mapping, side).await {
            Ok(fp) => Ok(Some(fp)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// True unless both sides exist with identical content. Two missing sides do not differ.
    pub async fn contents_differ(&self, mapping: &FileMapping) -> Result<bool> {
        let host = self.fingerprint_if_present(mapping, Side::Host).await?;
        let sandbox = self.fingerprint_if_present(mapping, Side::Sandbox).await?;
        Ok(host != sandbox)
    }

    /// Copies the sandbox file into the backup directory.
    ///
    /// Every failure, including a vanished source, is a `BackupWriteError`.
    pub async fn backup(&self, mapping: &FileMapping) -> Result<BackupRecord> {
        let original_name = mapping.file_name();
        let timestamp = backup_timestamp();
        let failed = |backup_path: PathBuf, cause: String| Error::BackupWriteError {
            source_path: mapping.sandbox_path.clone(),
            backup_path,
            cause,
        };

        let contents = match self
            .backend
            .read_file(self.identity, &mapping.sandbox_path)
            .await
        {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                return Err(failed(
                    self.backup_dir.clone(),
                    "sandbox file disappeared".to_string(),
                ))
            }
            Err(e) => return Err(failed(self.backup_dir.clone(), e.to_string())),
        };

        tokio::fs::create_dir_all(&self.backup_dir)
            .await
            .map_err(|e| failed(self.backup_dir.clone(), e.to_string()))?;

        let (backup_path, mut file) = self
            .claim_backup_path(&mapping.sandbox_path, &original_name, &timestamp)
            .await?;
        let written = match file.write_all(&contents).await {
            Ok(()) => file.sync_all().await,
            Err(e) => Err(e),
        };
        written.map_err(|e| failed(backup_path.clone(), e.to_string()))?;

        tracing::info!(
            source = %mapping.sandbox_path.display(),
            backup = %backup_path.display(),
            bytes = contents.len(),
            "backed up sandbox file"
        );
        Ok(BackupRecord {
            original_name,
            timestamp,
            backup_path,
        })
    }

    /// Creates the first free backup name, appending a counter on collision.
    async fn claim_backup_path(
        &self,
        source: &Path,
        original_name: &str,
        timestamp: &NaiveDateTime,
    ) -> Result<(PathBuf, tokio::fs::File)> {
        let mut attempt = 1;
        loop {
            let path = self.backup_dir.join(backup_file_name(
                &self.marker,
                original_name,
                timestamp,
                attempt,
            ));
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(file) => return Ok((path, file)),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => attempt += 1,
                Err(e) => {
                    return Err(Error::BackupWriteError {
                        source_path: source.to_path_buf(),
                        backup_path: path,
                        cause: e.to_string(),
                    })
                }
            }
        }
    }
}
