//! Error taxonomy shared by every component.
//!
//! Each failure carries enough context (which step, which resource) to act on,
//! and [`SupervisorError::kind`] always maps it to one of the fixed
//! [`ErrorKind`] values that shells present to the user.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

use crate::config::BridgeMode;
use crate::switcher::SwitchStep;

pub type Result<T, E = SupervisorError> = std::result::Result<T, E>;

/// Coarse failure category, stable across releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ConfigCorrupt,
    ConfigWriteError,
    ExecutableNotFound,
    UnresolvedTransport,
    ValidationError,
    SpawnError,
    StopTimeout,
    AlreadyRunning,
    SwitchInProgress,
    ProbeUnreachable,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ConfigCorrupt => "config corrupt",
            Self::ConfigWriteError => "config write error",
            Self::ExecutableNotFound => "executable not found",
            Self::UnresolvedTransport => "unresolved transport",
            Self::ValidationError => "validation error",
            Self::SpawnError => "spawn error",
            Self::StopTimeout => "stop timeout",
            Self::AlreadyRunning => "already running",
            Self::SwitchInProgress => "switch in progress",
            Self::ProbeUnreachable => "probe unreachable",
        };
        f.write_str(name)
    }
}

/// Errors raised by the supervisor core.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("config file {path:?} is corrupt: {reason}")]
    ConfigCorrupt { path: PathBuf, reason: String },
    #[error("failed to write {path:?}: {source}")]
    ConfigWrite {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("executable '{name}' not found (tried {tried:?} and the search path)")]
    ExecutableNotFound { name: String, tried: Vec<PathBuf> },
    #[error("bridge mode '{mode}' needs the '{helper}' helper but no executable was found")]
    UnresolvedTransport { mode: BridgeMode, helper: String },
    #[error("invalid settings: {0}")]
    Validation(String),
    #[error("failed to start {process}: {reason}")]
    Spawn { process: String, reason: String },
    #[error("{process} did not exit within {timeout_ms} ms, even after a forced kill")]
    StopTimeout { process: String, timeout_ms: u64 },
    #[error("{process} is already running")]
    AlreadyRunning { process: String },
    #[error("a bridge switch is already in progress")]
    SwitchInProgress,
    #[error("control port {addr} unreachable: {source}")]
    ProbeUnreachable {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("bridge switch failed while {step}: {source}")]
    SwitchFailed {
        step: SwitchStep,
        #[source]
        source: Box<SupervisorError>,
    },
}

impl SupervisorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ConfigCorrupt { .. } => ErrorKind::ConfigCorrupt,
            Self::ConfigWrite { .. } => ErrorKind::ConfigWriteError,
            Self::ExecutableNotFound { .. } => ErrorKind::ExecutableNotFound,
            Self::UnresolvedTransport { .. } => ErrorKind::UnresolvedTransport,
            Self::Validation(_) => ErrorKind::ValidationError,
            Self::Spawn { .. } => ErrorKind::SpawnError,
            Self::StopTimeout { .. } => ErrorKind::StopTimeout,
            Self::AlreadyRunning { .. } => ErrorKind::AlreadyRunning,
            Self::SwitchInProgress => ErrorKind::SwitchInProgress,
            Self::ProbeUnreachable { .. } => ErrorKind::ProbeUnreachable,
            Self::SwitchFailed { source, .. } => source.kind(),
        }
    }

    pub(crate) fn spawn(process: impl fmt::Display, reason: impl Into<String>) -> Self {
        Self::Spawn {
            process: process.to_string(),
            reason: reason.into(),
        }
    }
}
