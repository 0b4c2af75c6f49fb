//! Platform detection and command execution errors

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("empty binary path")]
    EmptyPath,

    #[error("path contains directory traversal: {}", .0.display())]
    DirectoryTraversal(PathBuf),

    #[error("failed to inspect binary {}: {source}", path.display())]
    Inspect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("binary path is not a regular file: {}", .0.display())]
    NotRegularFile(PathBuf),

    #[error("binary file is empty: {}", .0.display())]
    EmptyBinary(PathBuf),

    #[error("binary is not executable: {}", .0.display())]
    NotExecutable(PathBuf),

    #[error("could not determine parent process executable: {0}")]
    ParentProcess(String),

    #[error("binary {0:?} not found on PATH")]
    NotOnPath(String),

    #[error("no arguments provided")]
    NoArguments,

    #[error("command {0:?} is not allowed")]
    CommandNotAllowed(String),

    #[error("cannot execute platform command against debug server")]
    DebugServer,

    #[error("no platform binary available, command execution is disabled")]
    Unavailable,

    #[error("failed to run {}: {source}", path.display())]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("command timed out after {0:?}")]
    Timeout(Duration),

    #[error("command cancelled")]
    Cancelled,
}

pub type PlatformResult<T> = Result<T, PlatformError>;
