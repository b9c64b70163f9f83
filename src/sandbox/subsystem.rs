//! Virtual-subsystem (WSL distribution) sandbox backend.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::config::SandboxIdentity;
use crate::error::Result;

use super::backend::{BackendProbe, ExecOutput, ExecRequest, SandboxBackend};
use super::shell::{run_command, GuestShell};

/// Backend that hosts the sandbox in a WSL distribution.
#[derive(Debug, Clone)]
pub struct SubsystemBackend {
    /// Path to the wsl CLI binary.
    cli_path: String,
}

impl Default for SubsystemBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SubsystemBackend {
    /// Creates a backend using the default `wsl` command.
    pub fn new() -> Self {
        Self {
            cli_path: "wsl".to_string(),
        }
    }

    /// Creates a backend with a custom CLI path.
    pub fn with_cli_path(cli_path: impl Into<String>) -> Self {
        Self {
            cli_path: cli_path.into(),
        }
    }

    fn shell_as(&self, identity: &SandboxIdentity, user: &str) -> GuestShell {
        GuestShell::new(vec![
            self.cli_path.clone(),
            "-d".to_string(),
            identity.distribution_id.clone(),
            "-u".to_string(),
            user.to_string(),
            "--".to_string(),
        ])
    }

    fn root_shell(&self, identity: &SandboxIdentity) -> GuestShell {
        self.shell_as(identity, "root")
    }

    fn user_shell(&self, identity: &SandboxIdentity) -> GuestShell {
        self.shell_as(identity, &identity.username)
    }

    async fn list_distributions(&self, running_only: bool) -> Result<Vec<String>> {
        let mut args = vec!["--list".to_string()];
        if running_only {
            args.push("--running".to_string());
        }
        args.push("--quiet".to_string());

        let output = run_command(&self.cli_path, &args, None, None).await?;
        if !output.success() {
            // `wsl --list --running` exits non-zero when nothing is running
            return Ok(vec![]);
        }
        Ok(parse_distribution_list(&decode_cli_output(&output.stdout)))
    }

    async fn cli(&self, args: &[&str], operation: &str) -> Result<()> {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        run_command(&self.cli_path, &args, None, None)
            .await?
            .check(operation)?;
        Ok(())
    }
}

#[async_trait]
impl SandboxBackend for SubsystemBackend {
    fn name(&self) -> &str {
        "subsystem"
    }

    async fn probe(&self, identity: &SandboxIdentity) -> Result<BackendProbe> {
        let installed = self
            .list_distributions(false)
            .await?
            .iter()
            .any(|d| d == &identity.distribution_id);
        if !installed {
            return Ok(BackendProbe::default());
        }

        let running = self
            .list_distributions(true)
            .await?
            .iter()
            .any(|d| d == &identity.distribution_id);

        let workspace_present = self
            .root_shell(identity)
            .dir_exists(&identity.root_path)
            .await;
        if !running {
            // the check booted the distribution; put it back to sleep
            if let Err(e) = self.stop(identity).await {
                tracing::warn!(
                    distribution = %identity.distribution_id,
                    error = %e,
                    "failed to terminate distribution after checking its workspace"
                );
            }
        }
        let workspace_present = workspace_present?;

        Ok(BackendProbe {
            installed,
            running,
            workspace_present,
        })
    }

    async fn install(&self, identity: &SandboxIdentity) -> Result<()> {
        tracing::info!(distribution = %identity.distribution_id, "installing distribution");
        self.cli(
            &["--install", "-d", &identity.distribution_id],
            "install distribution",
        )
        .await
    }

    async fn provision(&self, identity: &SandboxIdentity) -> Result<bool> {
        self.root_shell(identity).provision(identity).await
    }

    async fn start(&self, identity: &SandboxIdentity) -> Result<()> {
        self.cli(
            &["-d", &identity.distribution_id, "--", "true"],
            "start distribution",
        )
        .await
    }

    async fn stop(&self, identity: &SandboxIdentity) -> Result<()> {
        self.cli(
            &["--terminate", &identity.distribution_id],
            "terminate distribution",
        )
        .await
    }

    async fn exec(&self, identity: &SandboxIdentity, request: ExecRequest) -> Result<ExecOutput> {
        self.user_shell(identity)
            .exec(
                &request.command,
                request.working_dir.as_deref(),
                request.timeout,
            )
            .await
    }

    async fn read_file(&self, identity: &SandboxIdentity, path: &Path) -> Result<Option<Vec<u8>>> {
        self.root_shell(identity).read_file(path).await
    }

    async fn write_file(
        &self,
        identity: &SandboxIdentity,
        path: &Path,
        contents: &[u8],
    ) -> Result<()> {
        self.user_shell(identity).write_file(path, contents).await
    }

    async fn list_files(&self, identity: &SandboxIdentity, root: &Path) -> Result<Vec<PathBuf>> {
        self.root_shell(identity).list_files(root).await
    }

    async fn remove(&self, identity: &SandboxIdentity) -> Result<()> {
        self.root_shell(identity).remove_account(identity).await
    }
}

/// Decodes wsl.exe output, which is UTF-16LE on Windows hosts.
fn decode_cli_output(bytes: &[u8]) -> String {
    let looks_utf16 = bytes.len() >= 2 && bytes.iter().skip(1).step_by(2).all(|b| *b == 0);
    let text = if looks_utf16 {
        let units: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        String::from_utf16_lossy(&units)
    } else {
        String::from_utf8_lossy(bytes).into_owned()
    };
    text.replace(['\u{feff}', '\0'], "")
}

fn parse_distribution_list(text: &str) -> Vec<String> {
    text.lines()
        .map(|line| line.trim().trim_end_matches("(Default)").trim())
        .filter(|line| !line.is_empty())
        .map(String::from)
        .collect()
}
