//! Sandbox configuration store.
//!
//! Loads the sandbox identity and the per-extension command table from a
//! TOML (or JSON) file, falling back to defaults when no file is present.
//! Configuration is validated before use to catch errors early.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Placeholder for the sandbox-side source file in command templates.
pub const FILE_PLACEHOLDER: &str = "{file}";

/// Placeholder for the derived output path in compile templates.
pub const OUTPUT_PLACEHOLDER: &str = "{output}";

/// Which backend hosts the sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// A lightweight virtual subsystem distribution (WSL).
    #[default]
    Subsystem,
    /// A full-OS container started from a compose document.
    Container,
    /// A plain host directory.
    Local,
}

/// Identity of a sandbox: where it lives and who owns it.
#[derive(Clone, PartialEq, Eq)]
pub struct SandboxIdentity {
    /// Distribution or image identifier.
    pub distribution_id: String,
    /// Account that owns the working directory.
    pub username: String,
    /// Account credential. Never logged.
    pub credential: String,
    /// Absolute path of the working directory inside the sandbox.
    pub root_path: PathBuf,
}

impl fmt::Debug for SandboxIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SandboxIdentity")
            .field("distribution_id", &self.distribution_id)
            .field("username", &self.username)
            .field("credential", &"[REDACTED]")
            .field("root_path", &self.root_path)
            .finish()
    }
}

/// Compile and debug templates registered for one file extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate {
    /// Normalized extension, e.g. `.py`.
    pub extension: String,
    /// Template with `{file}` and optionally `{output}`.
    pub compile: Option<String>,
    /// Template with `{file}` or `{output}`.
    pub debug: Option<String>,
}

/// Extension-keyed command templates.
#[derive(Debug, Clone, Default)]
pub struct CommandTable {
    templates: BTreeMap<String, CommandTemplate>,
}

impl CommandTable {
    /// Looks up the templates for an extension (case-insensitive, dot optional).
    pub fn get(&self, extension: &str) -> Option<&CommandTemplate> {
        self.templates.get(&normalize_extension(extension))
    }

    /// Returns the registered extensions.
    pub fn extensions(&self) -> impl Iterator<Item = &str> {
        self.templates.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

/// Settings for container-backed sandboxes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComposeConfig {
    /// Preferred template, either a complete document or a services-only fragment.
    #[serde(default = "default_primary_template")]
    pub primary_template: PathBuf,
    /// Template used when the primary one is absent.
    #[serde(default = "default_fallback_template")]
    pub fallback_template: PathBuf,
    /// Container engine binary.
    #[serde(default = "default_engine")]
    pub engine: String,
    /// Compose orchestrator binary.
    #[serde(default = "default_compose_command")]
    pub compose_command: String,
    /// Container name pattern, rendered with the compose parameters.
    #[serde(default = "default_container_name")]
    pub container_name: String,
}

fn default_primary_template() -> PathBuf {
    PathBuf::from("podman-sandbox")
}

fn default_fallback_template() -> PathBuf {
    PathBuf::from("podman-sandbox-compose.yml")
}

fn default_engine() -> String {
    "podman".to_string()
}

fn default_compose_command() -> String {
    "podman-compose".to_string()
}

fn default_container_name() -> String {
    "${run_id}-sandbox-${distribution}".to_string()
}

impl Default for ComposeConfig {
    fn default() -> Self {
        Self {
            primary_template: default_primary_template(),
            fallback_template: default_fallback_template(),
            engine: default_engine(),
            compose_command: default_compose_command(),
            container_name: default_container_name(),
        }
    }
}

/// Full sandbox configuration as read from the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    #[serde(default = "default_distribution")]
    pub distribution_id: String,

    #[serde(default = "default_username")]
    pub username: String,

    #[serde(default = "default_credential")]
    pub credential: String,

    /// Working directory inside the sandbox. Defaults to `/home/<username>/dev`.
    #[serde(default)]
    pub root_path: Option<PathBuf>,

    /// Backend to use. When unset it follows `distribution_id`: container
    /// images listed in `container_distributions` run as containers, anything
    /// else as a WSL distribution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<BackendKind>,

    /// Distribution ids that name full-OS container images.
    #[serde(default = "default_container_distributions")]
    pub container_distributions: BTreeSet<String>,

    /// Host project tree mirrored into the sandbox.
    #[serde(default = "default_project_root")]
    pub project_root: PathBuf,

    /// Where teardown backups land (relative paths resolve against `project_root`).
    #[serde(default = "default_backup_dir")]
    pub backup_dir: PathBuf,

    /// Prefix of every backup file name.
    #[serde(default = "default_backup_marker")]
    pub backup_marker: String,

    /// Host-side directory for lock files and generated compose documents.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Extensions `copy` accepts. Empty accepts everything.
    #[serde(default = "default_sync_extensions")]
    pub sync_extensions: BTreeSet<String>,

    /// Push the host file before compiling or debugging it.
    #[serde(default = "default_auto_copy")]
    pub auto_copy: bool,

    /// Time budget for compile/debug commands.
    #[serde(default)]
    pub dispatch_timeout_secs: Option<u64>,

    #[serde(default = "default_compile_commands")]
    pub compile_commands: BTreeMap<String, String>,

    #[serde(default = "default_debug_commands")]
    pub debug_commands: BTreeMap<String, String>,

    #[serde(default)]
    pub compose: ComposeConfig,
}

fn default_distribution() -> String {
    "Ubuntu-22.04".to_string()
}

fn default_username() -> String {
    "devman".to_string()
}

fn default_credential() -> String {
    "devman".to_string()
}

fn default_container_distributions() -> BTreeSet<String> {
    ["win11", "win11l", "win7u", "win2025"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_project_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_backup_dir() -> PathBuf {
    PathBuf::from("sandbox_backups")
}

fn default_backup_marker() -> String {
    "backup".to_string()
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".sandbox")
}

fn default_sync_extensions() -> BTreeSet<String> {
    [".py", ".js", ".ts", ".cpp", ".c", ".h", ".rs", ".go"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_auto_copy() -> bool {
    true
}

fn default_compile_commands() -> BTreeMap<String, String> {
    BTreeMap::from([
        (".py".to_string(), "python3 -m py_compile {file}".to_string()),
        (".c".to_string(), "gcc -g -o {output} {file}".to_string()),
        (".cpp".to_string(), "g++ -g -o {output} {file}".to_string()),
        (".rs".to_string(), "rustc -g -o {output} {file}".to_string()),
        (".go".to_string(), "go build -o {output} {file}".to_string()),
    ])
}

fn default_debug_commands() -> BTreeMap<String, String> {
    BTreeMap::from([
        (".py".to_string(), "python3 -m pdb {file}".to_string()),
        (".c".to_string(), "gdb {output}".to_string()),
        (".cpp".to_string(), "gdb {output}".to_string()),
        (".rs".to_string(), "rust-gdb {output}".to_string()),
    ])
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            distribution_id: default_distribution(),
            username: default_username(),
            credential: default_credential(),
            root_path: None,
            backend: None,
            container_distributions: default_container_distributions(),
            project_root: default_project_root(),
            backup_dir: default_backup_dir(),
            backup_marker: default_backup_marker(),
            state_dir: default_state_dir(),
            sync_extensions: default_sync_extensions(),
            auto_copy: default_auto_copy(),
            dispatch_timeout_secs: None,
            compile_commands: default_compile_commands(),
            debug_commands: default_debug_commands(),
            compose: ComposeConfig::default(),
        }
    }
}

impl SandboxConfig {
    /// Parses configuration text. `.json` paths are read as JSON, anything else as TOML.
    pub fn parse(text: &str, path: &Path) -> Result<Self> {
        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

        if is_json {
            serde_json::from_str(text)
                .map_err(|e| Error::Config(format!("failed to parse {}: {}", path.display(), e)))
        } else {
            toml::from_str(text)
                .map_err(|e| Error::Config(format!("failed to parse {}: {}", path.display(), e)))
        }
    }

    /// Loads and validates the config file, using defaults if it does not exist.
    ///
    /// Validation warnings are logged; validation errors abort.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        let config = if path.exists() {
            let text = std::fs::read_to_string(path)?;
            let config = Self::parse(&text, path)?;
            tracing::debug!(path = %path.display(), "loaded sandbox config");
            config
        } else {
            tracing::warn!(path = %path.display(), "config file not found, using defaults");
            Self::default()
        };

        for warning in config.validate().into_result()? {
            tracing::warn!(warning = %warning, "config validation");
        }

        Ok(config)
    }

    /// Returns the sandbox identity with the root path resolved.
    pub fn identity(&self) -> SandboxIdentity {
        let root_path = self
            .root_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(format!("/home/{}/dev", self.username)));

        SandboxIdentity {
            distribution_id: self.distribution_id.clone(),
            username: self.username.clone(),
            credential: self.credential.clone(),
            root_path,
        }
    }

    /// Builds the extension-keyed command table.
    pub fn command_table(&self) -> CommandTable {
        let mut templates: BTreeMap<String, CommandTemplate> = BTreeMap::new();

        for (ext, template) in &self.compile_commands {
            let extension = normalize_extension(ext);
            templates
                .entry(extension.clone())
                .or_insert_with(|| CommandTemplate {
                    extension,
                    compile: None,
                    debug: None,
                })
                .compile = Some(template.clone());
        }

        for (ext, template) in &self.debug_commands {
            let extension = normalize_extension(ext);
            templates
                .entry(extension.clone())
                .or_insert_with(|| CommandTemplate {
                    extension,
                    compile: None,
                    debug: None,
                })
                .debug = Some(template.clone());
        }

        CommandTable { templates }
    }

    /// Resolves a configured path against the project root.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.project_root.join(path)
        }
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.resolve(&self.backup_dir)
    }

    /// The configured backend, or the one implied by `distribution_id`.
    pub fn backend_kind(&self) -> BackendKind {
        match self.backend {
            Some(kind) => kind,
            None if self.container_distributions.contains(&self.distribution_id) => {
                BackendKind::Container
            }
            None => BackendKind::default(),
        }
    }

    pub fn state_dir(&self) -> PathBuf {
        self.resolve(&self.state_dir)
    }

    pub fn dispatch_timeout(&self) -> Option<Duration> {
        self.dispatch_timeout_secs.map(Duration::from_secs)
    }

    /// Returns true if `copy` should accept a file with this extension.
    pub fn should_sync(&self, extension: &str) -> bool {
        self.sync_extensions.is_empty()
            || self
                .sync_extensions
                .iter()
                .any(|allowed| normalize_extension(allowed) == normalize_extension(extension))
    }
}

/// Lowercases an extension and ensures it starts with a dot.
pub fn normalize_extension(extension: &str) -> String {
    let lower = extension.trim().to_ascii_lowercase();
    if lower.starts_with('.') {
        lower
    } else {
        format!(".{}", lower)
    }
}

/// Validation result containing all found issues.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    /// List of validation errors (fatal).
    pub errors: Vec<String>,
    /// List of validation warnings (non-fatal).
    pub warnings: Vec<String>,
}

impl ValidationResult {
    /// Returns true if validation passed (no errors).
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn add_error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    pub fn add_warning(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    /// Converts to a Result, failing if there are errors.
    pub fn into_result(self) -> Result<Vec<String>> {
        if self.is_valid() {
            Ok(self.warnings)
        } else {
            Err(Error::Config(self.errors.join("; ")))
        }
    }
}

/// Trait for validatable configuration types.
pub trait Validate {
    /// Validates the configuration and returns any issues found.
    fn validate(&self) -> ValidationResult;
}

fn is_valid_account_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
        && !name.starts_with('-')
}

impl Validate for SandboxConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.distribution_id.trim().is_empty() {
            result.add_error("distribution_id cannot be empty");
        }

        // The username ends up in useradd/chown invocations
        if !is_valid_account_name(&self.username) {
            result.add_error(format!(
                "username '{}' must be lowercase letters, digits, '_' or '-'",
                self.username
            ));
        }

        if self.credential.is_empty() {
            result.add_warning("credential is empty - the sandbox account will have no password");
        } else if self.credential == self.username {
            result.add_warning("credential equals username - consider a stronger credential");
        }

        if let Some(root) = &self.root_path {
            if !root.to_string_lossy().starts_with('/') {
                result.add_error(format!("root_path '{}' must be absolute", root.display()));
            }
        }

        if self.backup_marker.is_empty() || self.backup_marker.contains(['/', '\\']) {
            result.add_error(format!(
                "backup_marker '{}' must be a non-empty file name fragment",
                self.backup_marker
            ));
        }

        for (ext, template) in &self.compile_commands {
            if normalize_extension(ext) == "." {
                result.add_error("compile_commands contains an empty extension");
            }
            if !template.contains(FILE_PLACEHOLDER) {
                result.add_error(format!(
                    "compile template for '{}' must contain {}",
                    ext, FILE_PLACEHOLDER
                ));
            }
        }

        for (ext, template) in &self.debug_commands {
            if normalize_extension(ext) == "." {
                result.add_error("debug_commands contains an empty extension");
            }
            if !template.contains(FILE_PLACEHOLDER) && !template.contains(OUTPUT_PLACEHOLDER) {
                result.add_error(format!(
                    "debug template for '{}' must contain {} or {}",
                    ext, FILE_PLACEHOLDER, OUTPUT_PLACEHOLDER
                ));
            }
            if !self
                .compile_commands
                .keys()
                .any(|c| normalize_extension(c) == normalize_extension(ext))
                && template.contains(OUTPUT_PLACEHOLDER)
            {
                result.add_warning(format!(
                    "debug template for '{}' uses {} but no compile template produces it",
                    ext, OUTPUT_PLACEHOLDER
                ));
            }
        }

        if self.dispatch_timeout_secs == Some(0) {
            result.add_warning("dispatch_timeout_secs = 0 will time out every command");
        }

        if self.backend_kind() == BackendKind::Container && self.compose.container_name.is_empty() {
            result.add_error("compose.container_name cannot be empty");
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = SandboxConfig::default();
        let result = config.validate();
        assert!(result.is_valid(), "errors: {:?}", result.errors);
        // devman/devman default credential triggers a warning
        assert!(result.warnings.iter().any(|w| w.contains("credential")));
    }

    #[test]
    fn identity_defaults_root_to_home_dev() {
        let config = SandboxConfig::default();
        let identity = config.identity();
        assert_eq!(identity.root_path, PathBuf::from("/home/devman/dev"));
        assert_eq!(identity.distribution_id, "Ubuntu-22.04");
    }

    #[test]
    fn identity_debug_redacts_credential() {
        let config = SandboxConfig {
            credential: "hunter2".to_string(),
            ..Default::default()
        };
        let debug = format!("{:?}", config.identity());
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("REDACTED"));
    }

    #[test]
    fn parses_toml_with_partial_fields() {
        let text = r#"
            distribution_id = "Debian"
            username = "builder"
            credential = "s3cret"
            backend = "local"
            sync_extensions = [".py"]

            [compile_commands]
            ".py" = "python3 -m py_compile {file}"
            ".zig" = "zig build-exe {file} -femit-bin={output}"

            [compose]
            engine = "docker"
        "#;
        let config = SandboxConfig::parse(text, Path::new("sandbox.toml")).unwrap();

        assert_eq!(config.distribution_id, "Debian");
        assert_eq!(config.backend, Some(BackendKind::Local));
        assert_eq!(config.backend_kind(), BackendKind::Local);
        assert_eq!(config.compile_commands.len(), 2);
        assert_eq!(config.compose.engine, "docker");
        assert_eq!(config.compose.compose_command, "podman-compose");
        assert!(config.validate().is_valid());
    }

    #[test]
    fn backend_follows_distribution_when_unset() {
        let mut config = SandboxConfig::default();
        assert_eq!(config.backend, None);
        assert_eq!(config.backend_kind(), BackendKind::Subsystem);

        for image in ["win11", "win11l", "win7u", "win2025"] {
            config.distribution_id = image.to_string();
            assert_eq!(config.backend_kind(), BackendKind::Container, "{image}");
        }

        // an explicit choice wins
        config.backend = Some(BackendKind::Subsystem);
        assert_eq!(config.backend_kind(), BackendKind::Subsystem);
    }

    #[test]
    fn container_distributions_are_configurable() {
        let text = r#"
            distribution_id = "fedora-40"
            container_distributions = ["fedora-40"]
        "#;
        let config = SandboxConfig::parse(text, Path::new("sandbox.toml")).unwrap();
        assert_eq!(config.backend_kind(), BackendKind::Container);

        let config = SandboxConfig::parse(
            r#"distribution_id = "win11""#,
            Path::new("sandbox.toml"),
        )
        .unwrap();
        assert_eq!(config.backend_kind(), BackendKind::Container);

        let config = SandboxConfig::parse(
            "distribution_id = \"win11\"\ncontainer_distributions = []\n",
            Path::new("sandbox.toml"),
        )
        .unwrap();
        assert_eq!(config.backend_kind(), BackendKind::Subsystem);
    }

    #[test]
    fn empty_container_name_fails_for_implied_container() {
        let mut config = SandboxConfig {
            distribution_id: "win2025".to_string(),
            ..Default::default()
        };
        config.compose.container_name = String::new();
        assert!(!config.validate().is_valid());
    }

    #[test]
    fn parses_json_config() {
        let text = r#"{
            "distribution_id": "Ubuntu-24.04",
            "username": "devman",
            "credential": "pw",
            "sync_extensions": [".py", ".rs"]
        }"#;
        let config = SandboxConfig::parse(text, Path::new("wsl_config.json")).unwrap();
        assert_eq!(config.distribution_id, "Ubuntu-24.04");
        assert_eq!(config.sync_extensions.len(), 2);
        assert!(!config.compile_commands.is_empty());
    }

    #[test]
    fn malformed_config_is_config_error() {
        let err = SandboxConfig::parse("username = [", Path::new("sandbox.toml")).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn empty_distribution_fails() {
        let config = SandboxConfig {
            distribution_id: "  ".to_string(),
            ..Default::default()
        };
        let result = config.validate();
        assert!(!result.is_valid());
        assert!(result.errors.iter().any(|e| e.contains("distribution_id")));
    }

    #[test]
    fn shell_unsafe_username_fails() {
        let config = SandboxConfig {
            username: "dev; rm -rf /".to_string(),
            ..Default::default()
        };
        assert!(!config.validate().is_valid());
    }

    #[test]
    fn relative_root_path_fails() {
        let config = SandboxConfig {
            root_path: Some(PathBuf::from("home/devman")),
            ..Default::default()
        };
        let result = config.validate();
        assert!(result.errors.iter().any(|e| e.contains("absolute")));
    }

    #[test]
    fn compile_template_without_file_placeholder_fails() {
        let mut config = SandboxConfig::default();
        config
            .compile_commands
            .insert(".java".to_string(), "javac Main.java".to_string());
        let result = config.validate();
        assert!(!result.is_valid());
        assert!(result.errors.iter().any(|e| e.contains(".java")));
    }

    #[test]
    fn zero_timeout_warns() {
        let config = SandboxConfig {
            dispatch_timeout_secs: Some(0),
            ..Default::default()
        };
        let result = config.validate();
        assert!(result.is_valid());
        assert!(result.warnings.iter().any(|w| w.contains("timeout")));
    }

    #[test]
    fn command_table_merges_compile_and_debug() {
        let config = SandboxConfig::default();
        let table = config.command_table();

        let py = table.get("PY").unwrap();
        assert_eq!(py.extension, ".py");
        assert!(py.compile.is_some());
        assert!(py.debug.is_some());

        let go = table.get(".go").unwrap();
        assert!(go.compile.is_some());
        assert!(go.debug.is_none());

        assert!(table.get(".java").is_none());
    }

    #[test]
    fn command_table_normalizes_keys() {
        let config = SandboxConfig {
            compile_commands: BTreeMap::from([("CPP".to_string(), "g++ {file}".to_string())]),
            debug_commands: BTreeMap::new(),
            ..Default::default()
        };
        let table = config.command_table();
        assert_eq!(table.len(), 1);
        assert_eq!(table.extensions().collect::<Vec<_>>(), vec![".cpp"]);
    }

    #[test]
    fn should_sync_respects_extension_set() {
        let config = SandboxConfig::default();
        assert!(config.should_sync(".py"));
        assert!(config.should_sync("RS"));
        assert!(!config.should_sync(".exe"));

        let open = SandboxConfig {
            sync_extensions: BTreeSet::new(),
            ..Default::default()
        };
        assert!(open.should_sync(".anything"));
    }

    #[test]
    fn resolve_keeps_absolute_paths() {
        let config = SandboxConfig {
            project_root: PathBuf::from("/work/project"),
            ..Default::default()
        };
        assert_eq!(
            config.backup_dir(),
            PathBuf::from("/work/project/sandbox_backups")
        );
        assert_eq!(config.resolve(Path::new("/tmp/x")), PathBuf::from("/tmp/x"));
    }

    #[test]
    fn load_or_default_without_file_uses_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = SandboxConfig::load_or_default(&dir.path().join("missing.toml")).unwrap();
        assert_eq!(config.username, "devman");
    }

    #[test]
    fn load_or_default_rejects_invalid_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("sandbox.toml");
        std::fs::write(&path, "distribution_id = \"\"\n").unwrap();
        let err = SandboxConfig::load_or_default(&path).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
