//! Sandbox lifecycle state machine.
//!
//! State is never stored: every operation probes the backend and derives the
//! current [`SandboxState`] from what it observes. Mutating operations hold
//! the sandbox lock for their whole duration.
//!
//! `destroy` runs the teardown protocol before releasing anything: every
//! sandbox file that differs from its host counterpart is backed up, and the
//! backend is only removed once all backups are confirmed. A failed backup
//! aborts the destroy and leaves the sandbox as it was.

use std::fmt;
use std::path::{Component, Path};
use std::time::Duration;

use crate::config::{CommandTable, SandboxConfig, SandboxIdentity};
use crate::dispatch::{resolve_command, DispatchMode, DispatchOutcome, Dispatcher};
use crate::error::{Error, Result};
use crate::lock::SandboxLock;
use crate::path::{FileMapping, PathMapper};
use crate::sandbox::{backend_for, BackendProbe, SandboxBackend};
use crate::sync::{list_backups, BackupRecord, FileSync};

/// Lifecycle state of a sandbox, derived from a backend probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SandboxState {
    Uninitialized,
    Installing,
    Ready,
    Stopped,
    Destroying,
    Destroyed,
}

impl SandboxState {
    /// Derives the state from probe results.
    ///
    /// Only the stable states come out of a probe; the transient ones exist
    /// while an operation is in flight.
    pub fn from_probe(probe: &BackendProbe) -> Self {
        if !probe.installed || !probe.workspace_present {
            SandboxState::Uninitialized
        } else if probe.running {
            SandboxState::Ready
        } else {
            SandboxState::Stopped
        }
    }

    /// True if sandbox paths can be reached in this state.
    pub fn is_reachable(&self) -> bool {
        matches!(self, SandboxState::Ready | SandboxState::Stopped)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SandboxState::Uninitialized => "uninitialized",
            SandboxState::Installing => "installing",
            SandboxState::Ready => "ready",
            SandboxState::Stopped => "stopped",
            SandboxState::Destroying => "destroying",
            SandboxState::Destroyed => "destroyed",
        }
    }
}

impl fmt::Display for SandboxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of `create`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateReport {
    /// The backend was installed by this call.
    pub installed: bool,
    /// The sandbox account was created by this call.
    pub account_created: bool,
    pub state: SandboxState,
}

/// Outcome of a completed `destroy`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestroyReport {
    /// Backups taken before teardown.
    pub backups: Vec<BackupRecord>,
    /// Files compared against the host.
    pub scanned: usize,
    /// Dotfiles and files under dot-directories that were not compared.
    pub skipped: usize,
    pub state: SandboxState,
}

#[derive(Debug, Default)]
struct TeardownScan {
    backups: Vec<BackupRecord>,
    scanned: usize,
    skipped: usize,
}

fn log_transition(from: SandboxState, to: SandboxState, operation: &str) {
    tracing::info!(from = %from, to = %to, operation = %operation, "sandbox state transition");
}

/// True if any component of a relative path is hidden.
fn is_hidden(relative: &Path) -> bool {
    relative.components().any(|c| match c {
        Component::Normal(part) => part.to_string_lossy().starts_with('.'),
        _ => false,
    })
}

/// Drives one sandbox through its lifecycle.
pub struct SandboxManager {
    config: SandboxConfig,
    identity: SandboxIdentity,
    backend: Box<dyn SandboxBackend>,
    mapper: PathMapper,
    commands: CommandTable,
    timeout: Option<Duration>,
}

impl SandboxManager {
    pub fn new(config: SandboxConfig, backend: Box<dyn SandboxBackend>) -> Self {
        let identity = config.identity();
        let mapper = PathMapper::new(&config.project_root, &identity.root_path);
        let commands = config.command_table();
        let timeout = config.dispatch_timeout();
        Self {
            config,
            identity,
            backend,
            mapper,
            commands,
            timeout,
        }
    }

    /// Creates a manager with the backend named in the configuration.
    pub fn from_config(config: SandboxConfig) -> Self {
        let backend = backend_for(&config);
        Self::new(config, backend)
    }

    /// Overrides the configured dispatch timeout when `timeout` is set.
    pub fn with_dispatch_timeout(mut self, timeout: Option<Duration>) -> Self {
        if timeout.is_some() {
            self.timeout = timeout;
        }
        self
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub fn identity(&self) -> &SandboxIdentity {
        &self.identity
    }

    pub fn mapper(&self) -> &PathMapper {
        &self.mapper
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    fn lock(&self) -> Result<SandboxLock> {
        SandboxLock::acquire(&self.config.state_dir(), &self.identity.root_path)
    }

    fn file_sync(&self) -> FileSync<'_> {
        FileSync::new(
            self.backend.as_ref(),
            &self.identity,
            self.config.backup_dir(),
            self.config.backup_marker.clone(),
        )
    }

    async fn probe(&self) -> Result<BackendProbe> {
        let probe = self.backend.probe(&self.identity).await?;
        tracing::debug!(
            backend = %self.backend.name(),
            installed = probe.installed,
            running = probe.running,
            workspace_present = probe.workspace_present,
            "probed backend"
        );
        Ok(probe)
    }

    /// Probes the backend and reports the derived state.
    pub async fn status(&self) -> Result<SandboxState> {
        Ok(SandboxState::from_probe(&self.probe().await?))
    }

    /// Fails with `SandboxUnreachable` unless the sandbox is in one of `allowed`.
    async fn require_state(
        &self,
        operation: &'static str,
        allowed: &[SandboxState],
    ) -> Result<SandboxState> {
        let state = self.status().await?;
        if allowed.contains(&state) {
            Ok(state)
        } else {
            Err(Error::SandboxUnreachable { operation, state })
        }
    }

    /// Re-probes after a start and fails unless the sandbox came up.
    async fn ensure_ready(&self, operation: &'static str) -> Result<SandboxState> {
        self.require_state(operation, &[SandboxState::Ready]).await
    }

    /// Installs the backend if needed, resumes it, and provisions the account.
    ///
    /// Safe to repeat: an existing installation is reused and an existing
    /// account and workspace are left as they are.
    pub async fn create(&self) -> Result<CreateReport> {
        let _lock = self.lock()?;
        let probe = self.probe().await?;
        let before = SandboxState::from_probe(&probe);

        let installed = if probe.installed {
            tracing::info!(
                distribution = %self.identity.distribution_id,
                state = %before,
                "backend already installed, skipping install"
            );
            false
        } else {
            log_transition(before, SandboxState::Installing, "create");
            self.backend.install(&self.identity).await?;
            true
        };

        if !self.probe().await?.running {
            self.backend.start(&self.identity).await?;
        }

        let account_created = self.backend.provision(&self.identity).await?;
        let state = self.ensure_ready("create").await?;
        log_transition(before, state, "create");

        tracing::info!(
            username = %self.identity.username,
            root = %self.identity.root_path.display(),
            installed,
            account_created,
            "sandbox ready"
        );
        Ok(CreateReport {
            installed,
            account_created,
            state,
        })
    }

    /// Suspends a running sandbox. Stopping a stopped sandbox does nothing.
    pub async fn stop(&self) -> Result<SandboxState> {
        let _lock = self.lock()?;
        let state = self
            .require_state("stop", &[SandboxState::Ready, SandboxState::Stopped])
            .await?;

        if state == SandboxState::Stopped {
            tracing::info!("sandbox already stopped");
            return Ok(state);
        }

        self.backend.stop(&self.identity).await?;
        log_transition(state, SandboxState::Stopped, "stop");
        Ok(SandboxState::Stopped)
    }

    /// Stops the sandbox if running, resumes it, and re-probes readiness.
    pub async fn restart(&self) -> Result<SandboxState> {
        let _lock = self.lock()?;
        let state = self
            .require_state("restart", &[SandboxState::Ready, SandboxState::Stopped])
            .await?;

        if state == SandboxState::Ready {
            self.backend.stop(&self.identity).await?;
            log_transition(state, SandboxState::Stopped, "restart");
        }
        self.backend.start(&self.identity).await?;

        let state = self.ensure_ready("restart").await?;
        log_transition(SandboxState::Stopped, state, "restart");
        Ok(state)
    }

    /// Backs up every differing sandbox file, then removes the sandbox.
    pub async fn destroy(&self) -> Result<DestroyReport> {
        let _lock = self.lock()?;
        let prior = self
            .require_state("destroy", &[SandboxState::Ready, SandboxState::Stopped])
            .await?;
        log_transition(prior, SandboxState::Destroying, "destroy");

        let resumed = prior == SandboxState::Stopped;
        if resumed {
            self.backend.start(&self.identity).await?;
        }

        let scan = match self.backup_differing_files().await {
            Ok(scan) => scan,
            Err(e) => {
                tracing::error!(error = %e, "teardown backup failed, aborting destroy");
                if resumed {
                    if let Err(stop_err) = self.backend.stop(&self.identity).await {
                        tracing::warn!(error = %stop_err, "failed to suspend sandbox after aborted destroy");
                    }
                }
                log_transition(SandboxState::Destroying, prior, "destroy aborted");
                return Err(e);
            }
        };

        tracing::info!(
            backups = scan.backups.len(),
            scanned = scan.scanned,
            skipped = scan.skipped,
            "all backups confirmed, removing sandbox"
        );
        self.backend.remove(&self.identity).await?;
        log_transition(SandboxState::Destroying, SandboxState::Destroyed, "destroy");

        Ok(DestroyReport {
            backups: scan.backups,
            scanned: scan.scanned,
            skipped: scan.skipped,
            state: SandboxState::Destroyed,
        })
    }

    async fn backup_differing_files(&self) -> Result<TeardownScan> {
        let sync = self.file_sync();
        let files = self
            .backend
            .list_files(&self.identity, &self.identity.root_path)
            .await?;

        let mut scan = TeardownScan::default();
        for sandbox_path in files {
            let relative = self.mapper.unmap(&sandbox_path)?;
            if is_hidden(&relative) {
                tracing::debug!(file = %relative.display(), "skipping hidden file");
                scan.skipped += 1;
                continue;
            }

            scan.scanned += 1;
            let mapping = self.mapper.map(&relative)?;
            if sync.contents_differ(&mapping).await? {
                scan.backups.push(sync.backup(&mapping).await?);
            }
        }
        Ok(scan)
    }

    fn mapping_for(&self, host_path: &Path) -> Result<FileMapping> {
        let relative = self.mapper.relativize(host_path)?;
        self.mapper.map(&relative)
    }

    /// Copies a host file into the running sandbox.
    pub async fn push(&self, host_path: &Path) -> Result<FileMapping> {
        let mapping = self.mapping_for(host_path)?;

        let extension = mapping
            .relative
            .extension()
            .map(|e| e.to_string_lossy().into_owned())
            .unwrap_or_default();
        if !self.config.should_sync(&extension) {
            return Err(Error::UnsupportedExtension {
                path: mapping.host_path,
                extension,
                purpose: "sync rule",
            });
        }

        if !mapping.host_path.is_file() {
            return Err(Error::NotFound {
                side: "host",
                path: mapping.host_path,
            });
        }

        self.require_state("copy", &[SandboxState::Ready]).await?;
        self.file_sync().push(&mapping).await?;
        Ok(mapping)
    }

    /// Copies a sandbox file back to its host counterpart.
    pub async fn pull(&self, host_path: &Path) -> Result<FileMapping> {
        let mapping = self.mapping_for(host_path)?;
        self.require_state("pull", &[SandboxState::Ready, SandboxState::Stopped])
            .await?;
        self.file_sync().pull(&mapping).await?;
        Ok(mapping)
    }

    pub async fn compile(&self, host_path: &Path) -> Result<DispatchOutcome> {
        self.dispatch(host_path, DispatchMode::Compile).await
    }

    pub async fn debug(&self, host_path: &Path) -> Result<DispatchOutcome> {
        self.dispatch(host_path, DispatchMode::Debug).await
    }

    async fn dispatch(&self, host_path: &Path, mode: DispatchMode) -> Result<DispatchOutcome> {
        let mapping = self.mapping_for(host_path)?;
        resolve_command(&self.commands, &mapping.sandbox_path, mode)?;

        let operation = match mode {
            DispatchMode::Compile => "compile",
            DispatchMode::Debug => "debug",
        };
        self.require_state(operation, &[SandboxState::Ready]).await?;

        if self.config.auto_copy {
            self.file_sync().push(&mapping).await?;
        }

        Dispatcher::new(self.backend.as_ref(), &self.identity, &self.commands)
            .with_timeout(self.timeout)
            .dispatch(&mapping.sandbox_path, mode)
            .await
    }

    /// Lists the teardown backups on the host, oldest first.
    pub fn backups(&self) -> Result<Vec<BackupRecord>> {
        list_backups(&self.config.backup_dir(), &self.config.backup_marker)
    }
}
