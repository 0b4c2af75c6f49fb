//! Allow-listed command execution against the platform binary

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use log::info;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::binary::verify_binary;
use crate::error::{PlatformError, PlatformResult};

/// Subcommands the provider may run against `terraform` / `tofu`
pub const ALLOWED_COMMANDS: &[&str] = &[
    "init",
    "plan",
    "apply",
    "destroy",
    "validate",
    "output",
    "show",
    "state",
    "import",
    "version",
    "fmt",
    "force-unlock",
    "providers",
    "login",
    "logout",
    "refresh",
    "graph",
    "taint",
    "untaint",
    "workspace",
    "metadata",
    "test",
    "console",
];

/// Captured result of a finished command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// Process exit code, `-1` when terminated by a signal
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// A single leading `-` is tolerated (`-version`).
pub fn is_allowed_command(command: &str) -> bool {
    let command = command.strip_prefix('-').unwrap_or(command);
    ALLOWED_COMMANDS.contains(&command)
}

pub fn validate_command_args<S: AsRef<str>>(args: &[S]) -> PlatformResult<()> {
    let command = args.first().ok_or(PlatformError::NoArguments)?.as_ref();
    if !is_allowed_command(command) {
        return Err(PlatformError::CommandNotAllowed(command.to_string()));
    }
    Ok(())
}

/// Run `binary` with `args`, capturing stdout and stderr.
///
/// Arguments and the binary are validated before anything is spawned. The
/// child is killed if `timeout` elapses or `cancel` fires first.
pub async fn execute_platform_command<S: AsRef<str>>(
    binary: &Path,
    args: &[S],
    timeout: Duration,
    cancel: &CancellationToken,
) -> PlatformResult<CommandOutput> {
    validate_command_args(args)?;
    verify_binary(binary)?;

    if cancel.is_cancelled() {
        return Err(PlatformError::Cancelled);
    }

    let args: Vec<&str> = args.iter().map(AsRef::as_ref).collect();
    info!(
        "Running command against platform binary: {} {}",
        binary.display(),
        args.join(" ")
    );

    let child = Command::new(binary)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| PlatformError::Spawn {
            path: binary.to_path_buf(),
            source,
        })?;

    let output = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(PlatformError::Cancelled),
        _ = tokio::time::sleep(timeout) => return Err(PlatformError::Timeout(timeout)),
        output = child.wait_with_output() => output.map_err(|source| PlatformError::Spawn {
            path: binary.to_path_buf(),
            source,
        })?,
    };

    Ok(CommandOutput {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        exit_code: output.status.code().unwrap_or(-1),
    })
}
