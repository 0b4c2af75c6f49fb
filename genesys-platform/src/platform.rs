//! Platform classification and detection
//!
//! The detector resolves the host binary once per process. A successful
//! detection is cached; failed detections may be retried up to
//! [`MAX_DETECTION_ATTEMPTS`] times before the detector settles on
//! [`Platform::Unknown`].

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{info, warn};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::binary::{lookup_on_path, parent_executable, validate_binary_path, verify_binary};
use crate::command::{CommandOutput, execute_platform_command};
use crate::error::{PlatformError, PlatformResult};

pub const MAX_DETECTION_ATTEMPTS: u32 = 3;

/// Timeout for the `version` check run during detection
pub const VERSION_TIMEOUT: Duration = Duration::from_secs(10);

/// Substrings of a binary path that indicate a development harness
const DEBUG_PATTERNS: &[&str] = &[
    "dlv",       // Delve debugger
    "debug",     // debug server
    "test2json", // go test output converter
];

/// The host tool driving this provider process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Platform {
    #[default]
    Unknown,
    Terraform,
    OpenTofu,
    DebugServer,
    GoLang,
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Platform::Terraform => "terraform",
            Platform::OpenTofu => "tofu",
            Platform::DebugServer => "debug-server",
            Platform::GoLang => "go",
            Platform::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

impl Platform {
    pub fn is_valid(&self) -> bool {
        !matches!(self, Platform::Unknown)
    }

    pub fn is_development_platform(&self) -> bool {
        matches!(self, Platform::DebugServer | Platform::GoLang)
    }

    /// Registry that provider source addresses resolve against
    pub fn provider_registry(&self) -> &'static str {
        match self {
            Platform::OpenTofu => "registry.opentofu.org",
            _ => "registry.terraform.io",
        }
    }

    /// Classify from the binary path alone, without executing it.
    pub fn from_binary_path(path: &Path) -> Option<Platform> {
        let path = path.to_string_lossy();
        DEBUG_PATTERNS
            .iter()
            .any(|pattern| path.contains(pattern))
            .then_some(Platform::DebugServer)
    }

    /// Classify from the output of `<binary> version`.
    pub fn from_version_output(stdout: &str) -> Platform {
        let stdout = stdout.to_lowercase();
        if stdout.contains("go ") {
            Platform::GoLang
        } else if stdout.contains("tofu") {
            Platform::OpenTofu
        } else {
            Platform::Terraform
        }
    }
}

/// Result of platform detection
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PlatformInfo {
    pub platform: Platform,
    /// Resolved host binary, if one was found
    pub binary_path: Option<PathBuf>,
}

impl PlatformInfo {
    pub fn unknown() -> Self {
        Self::default()
    }

    /// File name of the host binary, `terraform` when none was found
    pub fn binary(&self) -> String {
        self.binary_path
            .as_deref()
            .and_then(Path::file_name)
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "terraform".to_string())
    }

    pub fn provider_registry(&self) -> &'static str {
        self.platform.provider_registry()
    }

    /// Run an allow-listed subcommand against the host binary.
    pub async fn execute<S: AsRef<str>>(
        &self,
        args: &[S],
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> PlatformResult<CommandOutput> {
        if self.platform == Platform::DebugServer {
            return Err(PlatformError::DebugServer);
        }
        if !self.platform.is_valid() {
            return Err(PlatformError::Unavailable);
        }
        let binary = self.binary_path.as_deref().ok_or(PlatformError::EmptyPath)?;
        execute_platform_command(binary, args, timeout, cancel).await
    }
}

/// Where the detector looks for the host binary first
#[derive(Debug, Clone)]
enum BinarySource {
    ParentProcess,
    Fixed(PathBuf),
    SearchPathOnly,
}

#[derive(Debug, Default)]
struct DetectorState {
    attempts: u32,
    detected: Option<PlatformInfo>,
    last: PlatformInfo,
}

/// Cached, at-most-once platform detection
#[derive(Debug)]
pub struct PlatformDetector {
    source: BinarySource,
    search_path: Option<OsString>,
    version_timeout: Duration,
    state: Mutex<DetectorState>,
}

impl Default for PlatformDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl PlatformDetector {
    /// Detect from the parent process, falling back to `PATH`
    pub fn new() -> Self {
        Self {
            source: BinarySource::ParentProcess,
            search_path: std::env::var_os("PATH"),
            version_timeout: VERSION_TIMEOUT,
            state: Mutex::new(DetectorState::default()),
        }
    }

    /// Use `path` instead of inspecting the parent process
    pub fn with_binary(path: impl Into<PathBuf>) -> Self {
        Self {
            source: BinarySource::Fixed(path.into()),
            ..Self::new()
        }
    }

    /// Skip the parent process and search only `search_path`
    pub fn from_search_path(search_path: impl Into<OsString>) -> Self {
        Self {
            source: BinarySource::SearchPathOnly,
            ..Self::new()
        }
        .with_search_path(search_path)
    }

    /// Override the directories searched when the primary source fails
    pub fn with_search_path(mut self, search_path: impl Into<OsString>) -> Self {
        self.search_path = Some(search_path.into());
        self
    }

    pub fn with_version_timeout(mut self, timeout: Duration) -> Self {
        self.version_timeout = timeout;
        self
    }

    /// Number of detection attempts made so far
    pub async fn attempts(&self) -> u32 {
        self.state.lock().await.attempts
    }

    /// Detected platform, running detection if it has not yet succeeded.
    ///
    /// Concurrent callers wait for a single in-flight detection.
    pub async fn get(&self) -> PlatformInfo {
        let mut state = self.state.lock().await;
        if let Some(info) = &state.detected {
            return info.clone();
        }
        if state.attempts >= MAX_DETECTION_ATTEMPTS {
            info!(
                "Reached max attempts {} of platform detection",
                MAX_DETECTION_ATTEMPTS
            );
            return state.last.clone();
        }
        state.attempts += 1;

        let (info, conclusive) = self.detect().await;
        info!("Detected executing platform is: {}", info.platform);
        if conclusive {
            state.detected = Some(info.clone());
        }
        state.last = info.clone();
        info
    }

    /// One detection pass; the flag reports whether the result is final.
    async fn detect(&self) -> (PlatformInfo, bool) {
        let path = match self.locate_binary() {
            Some(path) => path,
            None => {
                warn!("No valid platform binary found");
                return (PlatformInfo::unknown(), false);
            }
        };

        let path = match validate_binary_path(&path) {
            Ok(path) => path,
            Err(e) => {
                warn!("Invalid binary path: {}", e);
                return (PlatformInfo::unknown(), false);
            }
        };

        let mut info = PlatformInfo {
            platform: Platform::Unknown,
            binary_path: Some(path.clone()),
        };

        if let Err(e) = verify_binary(&path) {
            warn!("Binary verification failed: {}", e);
            return (info, false);
        }

        if let Some(platform) = Platform::from_binary_path(&path) {
            info.platform = platform;
            return (info, true);
        }

        let cancel = CancellationToken::new();
        match execute_platform_command(&path, &["version"], self.version_timeout, &cancel).await {
            Ok(output) if output.success() => {
                info.platform = Platform::from_version_output(&output.stdout);
                (info, true)
            }
            Ok(output) => {
                warn!(
                    "Version command exited with {}: {}",
                    output.exit_code,
                    output.stderr.trim()
                );
                (info, false)
            }
            Err(e) => {
                warn!("Failed to execute version command: {}", e);
                (info, false)
            }
        }
    }

    fn locate_binary(&self) -> Option<PathBuf> {
        let primary = match &self.source {
            BinarySource::ParentProcess => Some(parent_executable()),
            BinarySource::Fixed(path) => Some(Ok(path.clone())),
            BinarySource::SearchPathOnly => None,
        };

        match primary {
            Some(Ok(path)) => return Some(path),
            Some(Err(e)) => warn!(
                "Could not detect binary from parent process: {}, falling back to PATH lookup",
                e
            ),
            None => {}
        }

        let search_path = self.search_path.as_deref()?;
        ["terraform", "tofu"]
            .into_iter()
            .find_map(|name| match lookup_on_path(name, search_path) {
                Ok(path) => Some(path),
                Err(e) => {
                    warn!("Failed to look up platform binary: {}", e);
                    None
                }
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names() {
        assert_eq!(Platform::Terraform.to_string(), "terraform");
        assert_eq!(Platform::OpenTofu.to_string(), "tofu");
        assert_eq!(Platform::DebugServer.to_string(), "debug-server");
        assert_eq!(Platform::GoLang.to_string(), "go");
        assert_eq!(Platform::Unknown.to_string(), "unknown");
    }

    #[test]
    fn registries() {
        assert_eq!(Platform::OpenTofu.provider_registry(), "registry.opentofu.org");
        assert_eq!(Platform::Terraform.provider_registry(), "registry.terraform.io");
        assert_eq!(Platform::Unknown.provider_registry(), "registry.terraform.io");
    }

    #[test]
    fn development_platforms() {
        assert!(Platform::DebugServer.is_development_platform());
        assert!(Platform::GoLang.is_development_platform());
        assert!(!Platform::Terraform.is_development_platform());
        assert!(!Platform::Unknown.is_valid());
    }

    #[test]
    fn debug_paths_classify_without_execution() {
        assert_eq!(
            Platform::from_binary_path(Path::new("/home/dev/go/bin/dlv")),
            Some(Platform::DebugServer)
        );
        assert_eq!(
            Platform::from_binary_path(Path::new("/usr/local/go/pkg/tool/test2json")),
            Some(Platform::DebugServer)
        );
        assert_eq!(
            Platform::from_binary_path(Path::new("/usr/bin/terraform")),
            None
        );
    }

    #[test]
    fn version_output_classification() {
        assert_eq!(
            Platform::from_version_output("OpenTofu v1.8.0\non linux_amd64"),
            Platform::OpenTofu
        );
        assert_eq!(
            Platform::from_version_output("Terraform v1.9.5"),
            Platform::Terraform
        );
        assert_eq!(
            Platform::from_version_output("go version go1.22.1 linux/amd64"),
            Platform::GoLang
        );
    }

    #[test]
    fn binary_name_defaults_to_terraform() {
        assert_eq!(PlatformInfo::unknown().binary(), "terraform");
        let info = PlatformInfo {
            platform: Platform::OpenTofu,
            binary_path: Some(PathBuf::from("/opt/tofu/bin/tofu")),
        };
        assert_eq!(info.binary(), "tofu");
    }

    #[tokio::test]
    async fn unknown_platform_cannot_execute() {
        let result = PlatformInfo::unknown()
            .execute(&["version"], Duration::from_secs(1), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(PlatformError::Unavailable)));

        let debug = PlatformInfo {
            platform: Platform::DebugServer,
            binary_path: Some(PathBuf::from("/usr/bin/dlv")),
        };
        let result = debug
            .execute(&["version"], Duration::from_secs(1), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(PlatformError::DebugServer)));
    }

    #[tokio::test]
    async fn attempts_are_capped() {
        let detector = PlatformDetector::with_binary("/nonexistent/terraform")
            .with_search_path(OsString::new());

        for _ in 0..5 {
            assert_eq!(detector.get().await.platform, Platform::Unknown);
        }
        assert_eq!(detector.attempts().await, MAX_DETECTION_ATTEMPTS);
    }

    #[cfg(unix)]
    mod unix {
        use super::*;
        use std::os::unix::fs::PermissionsExt;
        use tempfile::TempDir;

        fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
            let path = dir.join(name);
            std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path
        }

        #[tokio::test]
        async fn debug_binary_is_not_executed() {
            let dir = TempDir::new().unwrap();
            // Exits non-zero: running it would make detection inconclusive.
            let bin = script(dir.path(), "dlv", "exit 1");

            let detector = PlatformDetector::with_binary(&bin);
            let info = detector.get().await;
            assert_eq!(info.platform, Platform::DebugServer);
            assert_eq!(info.binary_path.as_deref(), Some(bin.as_path()));
        }

        #[tokio::test]
        async fn detects_tofu_from_version_output() {
            let dir = TempDir::new().unwrap();
            let bin = script(dir.path(), "tofu", "echo 'OpenTofu v1.8.0'");

            let detector = PlatformDetector::with_binary(&bin);
            let info = detector.get().await;
            assert_eq!(info.platform, Platform::OpenTofu);
            assert_eq!(info.provider_registry(), "registry.opentofu.org");

            // Cached: a second call does not consume another attempt.
            detector.get().await;
            assert_eq!(detector.attempts().await, 1);
        }

        #[tokio::test]
        async fn falls_back_to_path_lookup() {
            let bin_dir = TempDir::new().unwrap();
            let bin = script(bin_dir.path(), "terraform", "echo 'Terraform v1.9.5'");

            let detector = PlatformDetector::from_search_path(bin_dir.path().as_os_str());
            let info = detector.get().await;
            assert_eq!(info.platform, Platform::Terraform);
            assert_eq!(info.binary_path.as_deref(), Some(bin.as_path()));
        }

        #[tokio::test]
        async fn empty_search_path_yields_unknown() {
            let detector = PlatformDetector::from_search_path(OsString::new());
            let info = detector.get().await;
            assert_eq!(info.platform, Platform::Unknown);
            assert!(info.binary_path.is_none());
        }
    }
}
