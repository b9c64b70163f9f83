//! Host-directory sandbox backend.
//!
//! The sandbox root is a plain directory on the host. Suspension is recorded
//! by a marker file inside it, so probing stays a matter of observing the
//! filesystem.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::config::SandboxIdentity;
use crate::error::Result;

use super::backend::{BackendProbe, ExecOutput, ExecRequest, SandboxBackend};
use super::shell::GuestShell;

/// Marker file present while the sandbox is suspended.
pub const SUSPENDED_MARKER: &str = ".sandbox-suspended";

/// Backend that uses a host directory as the sandbox.
#[derive(Debug, Clone)]
pub struct LocalBackend {
    shell: GuestShell,
}

impl Default for LocalBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalBackend {
    pub fn new() -> Self {
        Self {
            shell: GuestShell::local(),
        }
    }

    fn marker(identity: &SandboxIdentity) -> PathBuf {
        identity.root_path.join(SUSPENDED_MARKER)
    }
}

#[async_trait]
impl SandboxBackend for LocalBackend {
    fn name(&self) -> &str {
        "local"
    }

    async fn probe(&self, identity: &SandboxIdentity) -> Result<BackendProbe> {
        let workspace_present = tokio::fs::metadata(&identity.root_path)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false);
        let suspended = tokio::fs::try_exists(Self::marker(identity))
            .await
            .unwrap_or(false);

        Ok(BackendProbe {
            installed: true,
            running: workspace_present && !suspended,
            workspace_present,
        })
    }

    async fn install(&self, _identity: &SandboxIdentity) -> Result<()> {
        // The host is always present
        Ok(())
    }

    async fn provision(&self, identity: &SandboxIdentity) -> Result<bool> {
        let existed = tokio::fs::try_exists(&identity.root_path).await?;
        tokio::fs::create_dir_all(&identity.root_path).await?;
        Ok(!existed)
    }

    async fn start(&self, identity: &SandboxIdentity) -> Result<()> {
        match tokio::fs::remove_file(Self::marker(identity)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn stop(&self, identity: &SandboxIdentity) -> Result<()> {
        tokio::fs::write(Self::marker(identity), b"").await?;
        Ok(())
    }

    async fn exec(&self, _identity: &SandboxIdentity, request: ExecRequest) -> Result<ExecOutput> {
        self.shell
            .exec(
                &request.command,
                request.working_dir.as_deref(),
                request.timeout,
            )
            .await
    }

    async fn read_file(&self, _identity: &SandboxIdentity, path: &Path) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_file(
        &self,
        _identity: &SandboxIdentity,
        path: &Path,
        contents: &[u8],
    ) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, contents).await?;
        Ok(())
    }

    async fn list_files(&self, _identity: &SandboxIdentity, root: &Path) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        if !tokio::fs::try_exists(root).await? {
            return Ok(files);
        }

        let mut pending = vec![root.to_path_buf()];
        while let Some(dir) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    pending.push(entry.path());
                } else if file_type.is_file() {
                    files.push(entry.path());
                }
            }
        }

        files.sort();
        Ok(files)
    }

    async fn remove(&self, identity: &SandboxIdentity) -> Result<()> {
        match tokio::fs::remove_dir_all(&identity.root_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
