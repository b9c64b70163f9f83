//! Container sandbox backend driven by a compose orchestrator.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::compose::{self, ComposeParameters};
use crate::config::{ComposeConfig, SandboxIdentity};
use crate::error::{Error, Result};

use super::backend::{BackendProbe, ExecOutput, ExecRequest, SandboxBackend};
use super::shell::{run_command, GuestShell};

/// File under the state directory holding the current run id.
const RUN_ID_FILE: &str = "container_run_id";

/// Backend that hosts the sandbox in a full-OS container.
///
/// Each instantiation gets a fresh run id, which names the container, its
/// volumes, and the generated compose document.
#[derive(Debug, Clone)]
pub struct ContainerBackend {
    compose: ComposeConfig,
    state_dir: PathBuf,
}

impl ContainerBackend {
    /// `compose` template paths must already be resolved against the project root.
    pub fn new(compose: ComposeConfig, state_dir: impl Into<PathBuf>) -> Self {
        Self {
            compose,
            state_dir: state_dir.into(),
        }
    }

    fn run_id_path(&self) -> PathBuf {
        self.state_dir.join(RUN_ID_FILE)
    }

    fn compose_file(&self, run_id: &str) -> PathBuf {
        self.state_dir.join(format!("compose-{}.yml", run_id))
    }

    /// Parameters of the live run, if one was started.
    pub fn current_run(&self, identity: &SandboxIdentity) -> Result<Option<ComposeParameters>> {
        match std::fs::read_to_string(self.run_id_path()) {
            Ok(text) if !text.trim().is_empty() => {
                Ok(Some(ComposeParameters::for_run(text.trim(), identity)))
            }
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn container_name(&self, params: &ComposeParameters) -> String {
        params.render(&self.compose.container_name)
    }

    fn require_run(&self, identity: &SandboxIdentity) -> Result<ComposeParameters> {
        self.current_run(identity)?.ok_or_else(|| Error::BackendCommandFailed {
            operation: "locate container run".to_string(),
            exit_code: -1,
            stderr: format!("no run id recorded in {}", self.run_id_path().display()),
        })
    }

    fn shell_as(&self, container: &str, user: &str) -> GuestShell {
        GuestShell::new(vec![
            self.compose.engine.clone(),
            "exec".to_string(),
            "-i".to_string(),
            "-u".to_string(),
            user.to_string(),
            container.to_string(),
        ])
    }

    fn root_shell(&self, identity: &SandboxIdentity) -> Result<GuestShell> {
        let params = self.require_run(identity)?;
        Ok(self.shell_as(&self.container_name(&params), "root"))
    }

    fn user_shell(&self, identity: &SandboxIdentity) -> Result<GuestShell> {
        let params = self.require_run(identity)?;
        Ok(self.shell_as(&self.container_name(&params), &identity.username))
    }

    async fn engine(&self, args: &[&str], operation: &str) -> Result<()> {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        run_command(&self.compose.engine, &args, None, None)
            .await?
            .check(operation)?;
        Ok(())
    }

    /// Writes the compose document for a new run and records the run id.
    pub fn prepare_run(&self, identity: &SandboxIdentity) -> Result<(ComposeParameters, PathBuf)> {
        let template_path = compose::locate_template(
            &self.compose.primary_template,
            &self.compose.fallback_template,
        )?;
        let template = std::fs::read_to_string(&template_path)?;
        let params = ComposeParameters::generate(identity);
        let document = compose::generate(&template, &params)?;

        std::fs::create_dir_all(&self.state_dir)?;
        let compose_file = self.compose_file(&params.run_id);
        std::fs::write(&compose_file, document)?;
        std::fs::write(self.run_id_path(), &params.run_id)?;

        tracing::info!(
            run_id = %params.run_id,
            template = %template_path.display(),
            compose_file = %compose_file.display(),
            "generated compose document"
        );
        Ok((params, compose_file))
    }

    fn forget_run(&self, run_id: &str) {
        for path in [self.compose_file(run_id), self.run_id_path()] {
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %path.display(), error = %e, "failed to remove run file");
                }
            }
        }
    }
}

#[async_trait]
impl SandboxBackend for ContainerBackend {
    fn name(&self) -> &str {
        "container"
    }

    async fn probe(&self, identity: &SandboxIdentity) -> Result<BackendProbe> {
        let Some(params) = self.current_run(identity)? else {
            return Ok(BackendProbe::default());
        };
        let container = self.container_name(&params);

        let args = vec![
            "container".to_string(),
            "inspect".to_string(),
            "--format".to_string(),
            "{{.State.Running}}".to_string(),
            container.clone(),
        ];
        let output = run_command(&self.compose.engine, &args, None, None).await?;
        if !output.success() {
            tracing::debug!(container = %container, "recorded container no longer exists");
            return Ok(BackendProbe::default());
        }

        let running = String::from_utf8_lossy(&output.stdout).trim() == "true";
        // Volumes outlive a stopped container
        let workspace_present = if running {
            self.shell_as(&container, "root")
                .dir_exists(&identity.root_path)
                .await?
        } else {
            true
        };

        Ok(BackendProbe {
            installed: true,
            running,
            workspace_present,
        })
    }

    async fn install(&self, identity: &SandboxIdentity) -> Result<()> {
        let (params, compose_file) = self.prepare_run(identity)?;

        let args = vec![
            "-f".to_string(),
            compose_file.to_string_lossy().into_owned(),
            "up".to_string(),
            "-d".to_string(),
        ];
        let output = run_command(&self.compose.compose_command, &args, None, None).await?;
        if !output.success() {
            self.forget_run(&params.run_id);
            return Err(Error::BackendCommandFailed {
                operation: format!("{} up", self.compose.compose_command),
                exit_code: output.exit_code,
                stderr: output.stderr_lossy(),
            });
        }

        tracing::info!(
            container = %self.container_name(&params),
            run_id = %params.run_id,
            "container started"
        );
        Ok(())
    }

    async fn provision(&self, identity: &SandboxIdentity) -> Result<bool> {
        self.root_shell(identity)?.provision(identity).await
    }

    async fn start(&self, identity: &SandboxIdentity) -> Result<()> {
        let params = self.require_run(identity)?;
        self.engine(&["start", &self.container_name(&params)], "start container")
            .await
    }

    async fn stop(&self, identity: &SandboxIdentity) -> Result<()> {
        let params = self.require_run(identity)?;
        self.engine(&["stop", &self.container_name(&params)], "stop container")
            .await
    }

    async fn exec(&self, identity: &SandboxIdentity, request: ExecRequest) -> Result<ExecOutput> {
        self.user_shell(identity)?
            .exec(
                &request.command,
                request.working_dir.as_deref(),
                request.timeout,
            )
            .await
    }

    async fn read_file(&self, identity: &SandboxIdentity, path: &Path) -> Result<Option<Vec<u8>>> {
        self.root_shell(identity)?.read_file(path).await
    }

    async fn write_file(
        &self,
        identity: &SandboxIdentity,
        path: &Path,
        contents: &[u8],
    ) -> Result<()> {
        self.user_shell(identity)?.write_file(path, contents).await
    }

    async fn list_files(&self, identity: &SandboxIdentity, root: &Path) -> Result<Vec<PathBuf>> {
        self.root_shell(identity)?.list_files(root).await
    }

    /// Tears down the compose project, the container, and both volumes.
    ///
    /// Every step runs even if an earlier one fails; failures are reported together.
    async fn remove(&self, identity: &SandboxIdentity) -> Result<()> {
        let Some(params) = self.current_run(identity)? else {
            tracing::warn!("no container run recorded, nothing to remove");
            return Ok(());
        };
        let container = self.container_name(&params);
        let compose_file = self.compose_file(&params.run_id);
        let [storage, data] = params.volume_names();

        let mut steps: Vec<(String, Vec<String>)> = Vec::new();
        if compose_file.exists() {
            steps.push((
                self.compose.compose_command.clone(),
                vec![
                    "-f".to_string(),
                    compose_file.to_string_lossy().into_owned(),
                    "down".to_string(),
                ],
            ));
        }
        steps.push((
            self.compose.engine.clone(),
            vec!["rm".to_string(), "-f".to_string(), container.clone()],
        ));
        steps.push((
            self.compose.engine.clone(),
            vec!["volume".to_string(), "rm".to_string(), storage, data],
        ));

        let mut failures = Vec::new();
        let mut last_code = 0;
        for (program, args) in steps {
            let output = run_command(&program, &args, None, None).await?;
            if !output.success() {
                tracing::warn!(
                    program = %program,
                    args = ?args,
                    exit_code = output.exit_code,
                    "teardown step failed"
                );
                last_code = output.exit_code;
                failures.push(format!("{} {}: {}", program, args.join(" "), output.stderr_lossy()));
            }
        }

        if failures.is_empty() {
            self.forget_run(&params.run_id);
            tracing::info!(container = %container, "container resources released");
            Ok(())
        } else {
            Err(Error::BackendCommandFailed {
                operation: format!("remove container {}", container),
                exit_code: last_code,
                stderr: failures.join("; "),
            })
        }
    }
}
