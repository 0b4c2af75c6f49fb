//! Genesys Platform
//!
//! Identifies which host binary is driving the provider process
//! (Terraform, OpenTofu, a debugger, or a Go test harness) and runs
//! allow-listed commands against it.
//!
//! ## Module Structure
//!
//! - `platform` - Platform classification and the cached detector
//! - `binary` - Locating and vetting host binaries
//! - `command` - Allow-listed command execution
//! - `error` - Error types

pub mod binary;
pub mod command;
pub mod error;
pub mod platform;

pub use command::{ALLOWED_COMMANDS, CommandOutput, execute_platform_command};
pub use error::{PlatformError, PlatformResult};
pub use platform::{Platform, PlatformDetector, PlatformInfo};
