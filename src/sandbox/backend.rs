//! Backend capability trait and types.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;

use crate::config::SandboxIdentity;
use crate::error::Result;

/// Facts observed by probing a backend. Sandbox state is derived from these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BackendProbe {
    /// The distribution, image, or container resources exist.
    pub installed: bool,
    /// The backend is currently running.
    pub running: bool,
    /// The sandbox working directory exists.
    pub workspace_present: bool,
}

/// A shell command to run inside the sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecRequest {
    /// Shell command line.
    pub command: String,
    /// Directory inside the sandbox to run from.
    pub working_dir: Option<PathBuf>,
    /// Kill the command and fail with `Timeout` after this long.
    pub timeout: Option<Duration>,
}

impl ExecRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            working_dir: None,
            timeout: None,
        }
    }

    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Captured result of a command run inside the sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Capability interface over a sandbox host.
///
/// Implementations translate each capability into their own invocation
/// syntax; the lifecycle state machine and the teardown protocol only talk
/// to this trait. Every method blocks (awaits) until the backend reports
/// completion.
#[async_trait]
pub trait SandboxBackend: Send + Sync {
    /// Short backend name used in logs.
    fn name(&self) -> &str;

    /// Observes the backend without changing it.
    async fn probe(&self, identity: &SandboxIdentity) -> Result<BackendProbe>;

    /// Installs the distribution or brings up the backing resources.
    async fn install(&self, identity: &SandboxIdentity) -> Result<()>;

    /// Ensures the account and working directory exist.
    ///
    /// Returns true if the account was created by this call.
    async fn provision(&self, identity: &SandboxIdentity) -> Result<bool>;

    /// Resumes a suspended backend.
    async fn start(&self, identity: &SandboxIdentity) -> Result<()>;

    /// Suspends the backend, keeping its data.
    async fn stop(&self, identity: &SandboxIdentity) -> Result<()>;

    /// Runs a command as the sandbox account. A non-zero exit is returned, not raised.
    async fn exec(&self, identity: &SandboxIdentity, request: ExecRequest) -> Result<ExecOutput>;

    /// Reads a sandbox file. Returns `None` if it does not exist.
    async fn read_file(&self, identity: &SandboxIdentity, path: &Path) -> Result<Option<Vec<u8>>>;

    /// Writes a sandbox file, creating parent directories and replacing any existing file.
    async fn write_file(&self, identity: &SandboxIdentity, path: &Path, contents: &[u8])
        -> Result<()>;

    /// Lists every regular file below `root`, recursively, as absolute sandbox paths.
    async fn list_files(&self, identity: &SandboxIdentity, root: &Path) -> Result<Vec<PathBuf>>;

    /// Removes the account and releases every backend resource.
    async fn remove(&self, identity: &SandboxIdentity) -> Result<()>;
}
