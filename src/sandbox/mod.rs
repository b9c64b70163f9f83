//! Sandbox backends.
//!
//! This module provides the [`SandboxBackend`] capability trait and its
//! implementations: [`SubsystemBackend`] for WSL distributions,
//! [`ContainerBackend`] for compose-managed containers, and [`LocalBackend`]
//! for a plain host directory.

mod backend;
mod container;
mod local;
mod shell;
mod subsystem;

pub use backend::{BackendProbe, ExecOutput, ExecRequest, SandboxBackend};
pub use container::ContainerBackend;
pub use local::{LocalBackend, SUSPENDED_MARKER};
pub use shell::shell_quote;
pub use subsystem::SubsystemBackend;

use crate::config::{BackendKind, ComposeConfig, SandboxConfig};

/// Builds the backend selected by the configuration, or implied by its
/// distribution id when none is named.
pub fn backend_for(config: &SandboxConfig) -> Box<dyn SandboxBackend> {
    match config.backend_kind() {
        BackendKind::Subsystem => Box::new(SubsystemBackend::new()),
        BackendKind::Local => Box::new(LocalBackend::new()),
        BackendKind::Container => {
            let compose = ComposeConfig {
                primary_template: config.resolve(&config.compose.primary_template),
                fallback_template: config.resolve(&config.compose.fallback_template),
                ..config.compose.clone()
            };
            Box::new(ContainerBackend::new(compose, config.state_dir()))
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Backend wrapper that counts calls and can inject failures.

    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;

    use super::*;
    use crate::config::SandboxIdentity;
    use crate::error::{Error, Result};

    #[derive(Debug, Default)]
    pub struct Calls {
        pub exec: AtomicUsize,
        pub write: AtomicUsize,
        pub remove: AtomicUsize,
        pub stop: AtomicUsize,
    }

    /// Wraps a [`LocalBackend`] and records calls.
    pub struct RecordingBackend {
        inner: LocalBackend,
        pub calls: Arc<Calls>,
        pub fail_reads_of: Option<PathBuf>,
        /// Makes `start` succeed without resuming anything.
        pub ignore_start: bool,
    }

    impl RecordingBackend {
        pub fn new() -> Self {
            Self {
                inner: LocalBackend::new(),
                calls: Arc::new(Calls::default()),
                fail_reads_of: None,
                ignore_start: false,
            }
        }

        pub fn count(counter: &AtomicUsize) -> usize {
            counter.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SandboxBackend for RecordingBackend {
        fn name(&self) -> &str {
            "recording"
        }

        async fn probe(&self, identity: &SandboxIdentity) -> Result<BackendProbe> {
            self.inner.probe(identity).await
        }

        async fn install(&self, identity: &SandboxIdentity) -> Result<()> {
            self.inner.install(identity).await
        }

        async fn provision(&self, identity: &SandboxIdentity) -> Result<bool> {
            self.inner.provision(identity).await
        }

        async fn start(&self, identity: &SandboxIdentity) -> Result<()> {
            if self.ignore_start {
                return Ok(());
            }
            self.inner.start(identity).await
        }

        async fn stop(&self, identity: &SandboxIdentity) -> Result<()> {
            self.calls.stop.fetch_add(1, Ordering::SeqCst);
            self.inner.stop(identity).await
        }

        async fn exec(
            &self,
            identity: &SandboxIdentity,
            request: ExecRequest,
        ) -> Result<ExecOutput> {
            self.calls.exec.fetch_add(1, Ordering::SeqCst);
            self.inner.exec(identity, request).await
        }

        async fn read_file(
            &self,
            identity: &SandboxIdentity,
            path: &Path,
        ) -> Result<Option<Vec<u8>>> {
            if self.fail_reads_of.as_deref() == Some(path) {
                return Err(Error::BackendCommandFailed {
                    operation: format!("read {}", path.display()),
                    exit_code: 1,
                    stderr: "injected failure".to_string(),
                });
            }
            self.inner.read_file(identity, path).await
        }

        async fn write_file(
            &self,
            identity: &SandboxIdentity,
            path: &Path,
            contents: &[u8],
        ) -> Result<()> {
            self.calls.write.fetch_add(1, Ordering::SeqCst);
            self.inner.write_file(identity, path, contents).await
        }

        async fn list_files(
            &self,
            identity: &SandboxIdentity,
            root: &Path,
        ) -> Result<Vec<PathBuf>> {
            self.inner.list_files(identity, root).await
        }

        async fn remove(&self, identity: &SandboxIdentity) -> Result<()> {
            self.calls.remove.fetch_add(1, Ordering::SeqCst);
            self.inner.remove(identity).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn backend_for_follows_config() {
        let mut config = SandboxConfig::default();
        config.project_root = PathBuf::from("/work/project");
        assert_eq!(backend_for(&config).name(), "subsystem");

        // container images get the container backend without being told
        config.distribution_id = "win11".to_string();
        assert_eq!(backend_for(&config).name(), "container");

        config.backend = Some(BackendKind::Local);
        assert_eq!(backend_for(&config).name(), "local");

        config.backend = Some(BackendKind::Subsystem);
        assert_eq!(backend_for(&config).name(), "subsystem");

        config.distribution_id = "Ubuntu-22.04".to_string();
        config.backend = Some(BackendKind::Container);
        assert_eq!(backend_for(&config).name(), "container");
    }
}
