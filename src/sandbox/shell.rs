//! Shell plumbing shared by the subprocess-driven backends.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::config::SandboxIdentity;
use crate::error::{Error, Result};

use super::backend::ExecOutput;

/// Exit code the read script uses for "no such file".
const MISSING_FILE_EXIT: i32 = 3;

/// Raw output of a subprocess.
#[derive(Debug, Clone)]
pub(crate) struct RawOutput {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl RawOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }

    pub fn into_exec_output(self) -> ExecOutput {
        ExecOutput {
            exit_code: self.exit_code,
            stdout: String::from_utf8_lossy(&self.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&self.stderr).into_owned(),
        }
    }

    /// Turns a non-zero exit into `BackendCommandFailed`.
    pub fn check(self, operation: impl Into<String>) -> Result<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(Error::BackendCommandFailed {
                operation: operation.into(),
                exit_code: self.exit_code,
                stderr: self.stderr_lossy(),
            })
        }
    }
}

/// Runs a program to completion, optionally feeding stdin and enforcing a timeout.
pub(crate) async fn run_command(
    program: &str,
    args: &[String],
    stdin: Option<&[u8]>,
    timeout: Option<Duration>,
) -> Result<RawOutput> {
    tracing::debug!(program = %program, args = ?args, "running backend command");

    let mut child = Command::new(program)
        .args(args)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let writer = match (stdin, child.stdin.take()) {
        (Some(input), Some(mut pipe)) => {
            let input = input.to_vec();
            Some(tokio::spawn(async move {
                let result = pipe.write_all(&input).await;
                drop(pipe);
                result
            }))
        }
        _ => None,
    };

    let wait = child.wait_with_output();
    let output = match timeout {
        Some(limit) => match tokio::time::timeout(limit, wait).await {
            Ok(output) => output?,
            Err(_) => {
                return Err(Error::Timeout {
                    command: format!("{} {}", program, args.join(" ")),
                    after: limit,
                });
            }
        },
        None => wait.await?,
    };

    if let Some(writer) = writer {
        match writer.await {
            Ok(Ok(())) => {}
            // The child may exit without reading all of its input
            Ok(Err(e)) => tracing::debug!(error = %e, "stdin write ended early"),
            Err(e) => tracing::warn!(error = %e, "stdin writer task failed"),
        }
    }

    Ok(RawOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: output.stdout,
        stderr: output.stderr,
    })
}

/// A `sh -c` entry point into a sandbox: `prefix... sh -c <script>`.
///
/// An empty prefix runs the shell directly on the host.
#[derive(Debug, Clone)]
pub(crate) struct GuestShell {
    prefix: Vec<String>,
}

impl GuestShell {
    pub fn new(prefix: Vec<String>) -> Self {
        Self { prefix }
    }

    pub fn local() -> Self {
        Self { prefix: vec![] }
    }

    pub async fn run(
        &self,
        script: &str,
        stdin: Option<&[u8]>,
        timeout: Option<Duration>,
    ) -> Result<RawOutput> {
        let mut argv: Vec<String> = self.prefix.clone();
        argv.extend(["sh".to_string(), "-c".to_string(), script.to_string()]);
        let program = argv.remove(0);
        run_command(&program, &argv, stdin, timeout).await
    }

    /// Runs a user command from `working_dir`.
    pub async fn exec(
        &self,
        command: &str,
        working_dir: Option<&Path>,
        timeout: Option<Duration>,
    ) -> Result<ExecOutput> {
        let script = match working_dir {
            Some(dir) => format!("cd {} && {}", shell_quote(&dir.to_string_lossy()), command),
            None => command.to_string(),
        };
        Ok(self.run(&script, None, timeout).await?.into_exec_output())
    }

    pub async fn read_file(&self, path: &Path) -> Result<Option<Vec<u8>>> {
        let quoted = shell_quote(&path.to_string_lossy());
        let script = format!(
            "[ -f {q} ] || exit {code}; cat -- {q}",
            q = quoted,
            code = MISSING_FILE_EXIT
        );
        let output = self.run(&script, None, None).await?;
        if output.exit_code == MISSING_FILE_EXIT {
            return Ok(None);
        }
        Ok(Some(output.check(format!("read {}", path.display()))?.stdout))
    }

    pub async fn write_file(&self, path: &Path, contents: &[u8]) -> Result<()> {
        let parent = path.parent().unwrap_or_else(|| Path::new("/"));
        let script = format!(
            "mkdir -p -- {} && cat > {}",
            shell_quote(&parent.to_string_lossy()),
            shell_quote(&path.to_string_lossy())
        );
        self.run(&script, Some(contents), None)
            .await?
            .check(format!("write {}", path.display()))?;
        Ok(())
    }

    pub async fn list_files(&self, root: &Path) -> Result<Vec<PathBuf>> {
        let quoted = shell_quote(&root.to_string_lossy());
        let script = format!(
            "[ -d {q} ] || exit 0; cd {q} && find . -type f -print0",
            q = quoted
        );
        let output = self
            .run(&script, None, None)
            .await?
            .check(format!("list {}", root.display()))?;
        Ok(parse_find_output(root, &output.stdout))
    }

    pub async fn dir_exists(&self, dir: &Path) -> Result<bool> {
        let script = format!("[ -d {} ]", shell_quote(&dir.to_string_lossy()));
        Ok(self.run(&script, None, None).await?.success())
    }

    /// Creates the account if missing and ensures the working directory is owned by it.
    ///
    /// The credential travels over stdin to `chpasswd`, never on a command line.
    pub async fn provision(&self, identity: &SandboxIdentity) -> Result<bool> {
        let script = provision_script(identity);
        let stdin = format!("{}:{}\n", identity.username, identity.credential);
        let output = self
            .run(&script, Some(stdin.as_bytes()), None)
            .await?
            .check(format!("provision account {}", identity.username))?;
        Ok(String::from_utf8_lossy(&output.stdout).contains("account=created"))
    }

    /// Deletes the account with its home, then any leftover working directory.
    pub async fn remove_account(&self, identity: &SandboxIdentity) -> Result<()> {
        let user = shell_quote(&identity.username);
        let script = format!(
            "if id -u {u} >/dev/null 2>&1; then userdel -r {u} || exit $?; fi; rm -rf -- {r}",
            u = user,
            r = shell_quote(&identity.root_path.to_string_lossy())
        );
        self.run(&script, None, None)
            .await?
            .check(format!("remove account {}", identity.username))?;
        Ok(())
    }
}

fn provision_script(identity: &SandboxIdentity) -> String {
    let user = shell_quote(&identity.username);
    let root = shell_quote(&identity.root_path.to_string_lossy());
    format!(
        "if id -u {u} >/dev/null 2>&1; then state=existing; \
         else useradd -m -s /bin/bash {u} && chpasswd && state=created || exit 1; fi; \
         mkdir -p -- {r} && chown {u}:{u} {r} && echo \"account=$state\"",
        u = user,
        r = root
    )
}

fn parse_find_output(root: &Path, stdout: &[u8]) -> Vec<PathBuf> {
    stdout
        .split(|b| *b == 0)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let entry = String::from_utf8_lossy(entry);
            let relative = entry.strip_prefix("./").unwrap_or(&entry);
            root.join(relative)
        })
        .collect()
}

/// Quotes a value for safe interpolation into a POSIX shell command.
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/._-+=:@,".contains(c))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', "'\\''"))
}
