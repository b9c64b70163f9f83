//! Mapping between host-relative paths and sandbox paths.

use std::path::{Component, Path, PathBuf};

use crate::error::{Error, Result};

/// A host file and its sandbox counterpart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMapping {
    /// Path relative to the project root (and to the sandbox root).
    pub relative: PathBuf,
    /// Absolute or project-rooted path on the host.
    pub host_path: PathBuf,
    /// Absolute path inside the sandbox.
    pub sandbox_path: PathBuf,
}

impl FileMapping {
    /// Returns the file's base name.
    pub fn file_name(&self) -> String {
        self.relative
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Converts paths between the host project tree and the sandbox working directory.
#[derive(Debug, Clone)]
pub struct PathMapper {
    project_root: PathBuf,
    sandbox_root: PathBuf,
}

impl PathMapper {
    pub fn new(project_root: impl Into<PathBuf>, sandbox_root: impl Into<PathBuf>) -> Self {
        Self {
            project_root: project_root.into(),
            sandbox_root: sandbox_root.into(),
        }
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    pub fn sandbox_root(&self) -> &Path {
        &self.sandbox_root
    }

    /// Maps a project-relative path to its host and sandbox locations.
    pub fn map(&self, relative: &Path) -> Result<FileMapping> {
        let relative = normalize_relative(relative)?;
        Ok(FileMapping {
            host_path: self.project_root.join(&relative),
            sandbox_path: self.sandbox_root.join(&relative),
            relative,
        })
    }

    /// Maps a sandbox path back to its project-relative path.
    pub fn unmap(&self, sandbox_path: &Path) -> Result<PathBuf> {
        let rest = sandbox_path.strip_prefix(&self.sandbox_root).map_err(|_| {
            Error::invalid_path(
                sandbox_path,
                format!("outside sandbox root {}", self.sandbox_root.display()),
            )
        })?;
        normalize_relative(rest)
    }

    /// Turns a host path (project-relative, or absolute under the project root)
    /// into a project-relative path.
    pub fn relativize(&self, host_path: &Path) -> Result<PathBuf> {
        if host_path.is_absolute() {
            let root = canonicalize_existing(&self.project_root);
            let candidate = canonicalize_existing(host_path);
            let rest = candidate.strip_prefix(&root).map_err(|_| {
                Error::invalid_path(
                    host_path,
                    format!("outside project root {}", self.project_root.display()),
                )
            })?;
            normalize_relative(rest)
        } else {
            normalize_relative(host_path)
        }
    }
}

/// Resolves symlinks in the longest existing prefix of `path` and appends the
/// rest unchanged, so a file that does not exist yet still compares against a
/// canonical root.
fn canonicalize_existing(path: &Path) -> PathBuf {
    let mut existing = path;
    let mut missing = Vec::new();
    loop {
        if let Ok(mut resolved) = existing.canonicalize() {
            resolved.extend(missing.iter().rev());
            return resolved;
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                missing.push(name);
                existing = parent;
            }
            _ => return path.to_path_buf(),
        }
    }
}

/// Drops `.` segments and rejects empty, absolute, or traversing paths.
fn normalize_relative(path: &Path) -> Result<PathBuf> {
    let mut normalized = PathBuf::new();

    for component in path.components() {
        match component {
            Component::Normal(part) => normalized.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                return Err(Error::invalid_path(path, "contains a '..' segment"));
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(Error::invalid_path(path, "must be relative"));
            }
        }
    }

    if normalized.as_os_str().is_empty() {
        return Err(Error::invalid_path(path, "path is empty"));
    }

    Ok(normalized)
}
