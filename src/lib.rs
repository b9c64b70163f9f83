//! devsandbox - lifecycle manager for disposable development sandboxes
//!
//! This library creates a sandbox next to a host project tree, copies files
//! into it, runs per-language compile and debug commands inside it, and on
//! teardown backs up any sandbox file that differs from the host before the
//! sandbox is removed.

pub mod compose;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod lifecycle;
pub mod lock;
pub mod path;
pub mod sandbox;
pub mod sync;

pub use error::{Error, Result};

pub use compose::{ComposeParameters, COMPOSE_VERSION, DEFAULT_SUBNET};
pub use config::{
    BackendKind, CommandTable, CommandTemplate, ComposeConfig, SandboxConfig, SandboxIdentity,
    Validate, ValidationResult,
};
pub use dispatch::{DispatchMode, DispatchOutcome, Dispatcher};
pub use lifecycle::{CreateReport, DestroyReport, SandboxManager, SandboxState};
pub use lock::SandboxLock;
pub use path::{FileMapping, PathMapper};
pub use sandbox::{
    backend_for, BackendProbe, ContainerBackend, ExecOutput, ExecRequest, LocalBackend,
    SandboxBackend, SubsystemBackend,
};
pub use sync::{BackupRecord, FileSync, Fingerprint, Side};
