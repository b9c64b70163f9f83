//! Compile/debug dispatch into the sandbox.
//!
//! A file's extension selects a command template; the sandbox path and the
//! derived output path are substituted in and the command runs inside the
//! sandbox from the file's directory. A failing command is a normal outcome
//! and is returned as data.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::{
    normalize_extension, CommandTable, SandboxIdentity, FILE_PLACEHOLDER, OUTPUT_PLACEHOLDER,
};
use crate::error::{Error, Result};
use crate::sandbox::{shell_quote, ExecRequest, SandboxBackend};

/// Which template to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    Compile,
    Debug,
}

impl DispatchMode {
    fn purpose(&self) -> &'static str {
        match self {
            DispatchMode::Compile => "compile command",
            DispatchMode::Debug => "debug command",
        }
    }
}

impl fmt::Display for DispatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchMode::Compile => write!(f, "compile"),
            DispatchMode::Debug => write!(f, "debug"),
        }
    }
}

/// Result of a dispatched command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchOutcome {
    /// The rendered command line.
    pub command: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl DispatchOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Output path for a source file: same directory, extension stripped.
pub fn output_path(sandbox_path: &Path) -> PathBuf {
    sandbox_path.with_extension("")
}

/// Substitutes `{file}` and `{output}` into a template, shell-quoting both.
pub fn render_command(template: &str, file: &Path, output: &Path) -> String {
    template
        .replace(FILE_PLACEHOLDER, &shell_quote(&file.to_string_lossy()))
        .replace(OUTPUT_PLACEHOLDER, &shell_quote(&output.to_string_lossy()))
}

/// Runs compile and debug templates inside a sandbox.
pub struct Dispatcher<'a> {
    backend: &'a dyn SandboxBackend,
    identity: &'a SandboxIdentity,
    commands: &'a CommandTable,
    timeout: Option<Duration>,
}

impl<'a> Dispatcher<'a> {
    pub fn new(
        backend: &'a dyn SandboxBackend,
        identity: &'a SandboxIdentity,
        commands: &'a CommandTable,
    ) -> Self {
        Self {
            backend,
            identity,
            commands,
            timeout: None,
        }
    }

    /// Kills the command and fails with `Timeout` once this elapses.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Renders the command for a file without running it.
    pub fn resolve(&self, sandbox_path: &Path, mode: DispatchMode) -> Result<String> {
        resolve_command(self.commands, sandbox_path, mode)
    }

    /// Runs the template for `sandbox_path` and relays its result.
    pub async fn dispatch(&self, sandbox_path: &Path, mode: DispatchMode) -> Result<DispatchOutcome> {
        let command = self.resolve(sandbox_path, mode)?;
        let working_dir = sandbox_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.identity.root_path.clone());

        tracing::info!(
            mode = %mode,
            file = %sandbox_path.display(),
            command = %command,
            "dispatching into sandbox"
        );

        let request = ExecRequest::new(&command)
            .in_dir(working_dir)
            .with_timeout(self.timeout);
        let output = self.backend.exec(self.identity, request).await?;

        if output.success() {
            tracing::info!(mode = %mode, file = %sandbox_path.display(), "command succeeded");
        } else {
            tracing::warn!(
                mode = %mode,
                file = %sandbox_path.display(),
                exit_code = output.exit_code,
                "command exited with non-zero status"
            );
        }

        Ok(DispatchOutcome {
            command,
            exit_code: output.exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

/// Looks up and renders the template for a file. Fails before anything runs.
pub fn resolve_command(
    commands: &CommandTable,
    sandbox_path: &Path,
    mode: DispatchMode,
) -> Result<String> {
    let extension = sandbox_path
        .extension()
        .map(|e| normalize_extension(&e.to_string_lossy()))
        .unwrap_or_default();

    let template = commands.get(&extension).and_then(|t| match mode {
        DispatchMode::Compile => t.compile.as_deref(),
        DispatchMode::Debug => t.debug.as_deref(),
    });

    match template {
        Some(template) if !extension.is_empty() => Ok(render_command(
            template,
            sandbox_path,
            &output_path(sandbox_path),
        )),
        _ => Err(Error::UnsupportedExtension {
            path: sandbox_path.to_path_buf(),
            extension,
            purpose: mode.purpose(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SandboxConfig;
    use crate::sandbox::testing::RecordingBackend;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn identity(dir: &TempDir) -> SandboxIdentity {
        SandboxIdentity {
            distribution_id: "local".to_string(),
            username: "devman".to_string(),
            credential: "devman".to_string(),
            root_path: dir.path().to_path_buf(),
        }
    }

    fn table(compile: &[(&str, &str)]) -> CommandTable {
        let config = SandboxConfig {
            compile_commands: compile
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            debug_commands: BTreeMap::new(),
            ..Default::default()
        };
        config.command_table()
    }

    #[test]
    fn output_path_strips_extension_only() {
        assert_eq!(
            output_path(Path::new("/home/devman/dev/src/main.c")),
            PathBuf::from("/home/devman/dev/src/main")
        );
        assert_eq!(
            output_path(Path::new("/home/devman/dev/archive.tar.gz")),
            PathBuf::from("/home/devman/dev/archive.tar")
        );
    }

    #[test]
    fn render_command_substitutes_and_quotes() {
        let rendered = render_command(
            "gcc -g -o {output} {file}",
            Path::new("/home/devman/dev/my prog.c"),
            Path::new("/home/devman/dev/my prog"),
        );
        assert_eq!(
            rendered,
            "gcc -g -o '/home/devman/dev/my prog' '/home/devman/dev/my prog.c'"
        );
    }

    #[test]
    fn resolve_uses_default_templates() {
        let commands = SandboxConfig::default().command_table();
        let cmd = resolve_command(&commands, Path::new("/w/main.C"), DispatchMode::Compile).unwrap();
        assert_eq!(cmd, "gcc -g -o /w/main /w/main.C");

        let debug = resolve_command(&commands, Path::new("/w/app.py"), DispatchMode::Debug).unwrap();
        assert_eq!(debug, "python3 -m pdb /w/app.py");
    }

    #[test]
    fn resolve_rejects_unknown_or_missing_extension() {
        let commands = SandboxConfig::default().command_table();
        for path in ["/w/notes.txt", "/w/Makefile"] {
            let err = resolve_command(&commands, Path::new(path), DispatchMode::Compile).unwrap_err();
            assert!(matches!(err, Error::UnsupportedExtension { .. }), "{}", path);
        }

        // .go has a compile template but no debug template
        let err = resolve_command(&commands, Path::new("/w/main.go"), DispatchMode::Debug).unwrap_err();
        assert!(matches!(
            err,
            Error::UnsupportedExtension {
                purpose: "debug command",
                ..
            }
        ));
    }

    #[tokio::test]
    async fn unsupported_extension_starts_no_subprocess() {
        let dir = TempDir::new().unwrap();
        let identity = identity(&dir);
        let backend = RecordingBackend::new();
        let commands = table(&[(".py", "python3 {file}")]);

        let err = Dispatcher::new(&backend, &identity, &commands)
            .dispatch(&dir.path().join("main.zig"), DispatchMode::Compile)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::UnsupportedExtension { .. }));
        assert_eq!(RecordingBackend::count(&backend.calls.exec), 0);
    }

    #[tokio::test]
    async fn non_zero_exit_is_relayed_as_data() {
        let dir = TempDir::new().unwrap();
        let identity = identity(&dir);
        let backend = RecordingBackend::new();
        let commands = table(&[(".sh", "echo built {file}; echo broken >&2; exit 4")]);
        let file = dir.path().join("job.sh");

        let outcome = Dispatcher::new(&backend, &identity, &commands)
            .dispatch(&file, DispatchMode::Compile)
            .await
            .unwrap();

        assert_eq!(outcome.exit_code, 4);
        assert!(!outcome.success());
        assert!(outcome.stdout.contains("built"));
        assert_eq!(outcome.stderr.trim(), "broken");
        assert_eq!(RecordingBackend::count(&backend.calls.exec), 1);
    }

    #[tokio::test]
    async fn runs_from_the_files_directory() {
        let dir = TempDir::new().unwrap();
        let identity = identity(&dir);
        let backend = RecordingBackend::new();
        let commands = table(&[(".sh", "pwd")]);
        let nested = dir.path().join("pkg");
        std::fs::create_dir_all(&nested).unwrap();

        let outcome = Dispatcher::new(&backend, &identity, &commands)
            .dispatch(&nested.join("x.sh"), DispatchMode::Compile)
            .await
            .unwrap();

        assert!(outcome.success());
        assert!(outcome.stdout.trim().ends_with("pkg"));
    }

    #[tokio::test]
    async fn timeout_is_distinct_from_failure() {
        let dir = TempDir::new().unwrap();
        let identity = identity(&dir);
        let backend = RecordingBackend::new();
        let commands = table(&[(".sh", "sleep 5")]);

        let err = Dispatcher::new(&backend, &identity, &commands)
            .with_timeout(Some(Duration::from_millis(200)))
            .dispatch(&dir.path().join("slow.sh"), DispatchMode::Compile)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Timeout { .. }));
    }
}
