//! Locating and vetting host binaries

use std::ffi::OsStr;
use std::path::{Component, Path, PathBuf};

use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};

use crate::error::{PlatformError, PlatformResult};

/// Executable path of the process that launched this one.
///
/// Terraform and OpenTofu start providers as child processes, so the parent
/// is normally the host binary.
pub fn parent_executable() -> PlatformResult<PathBuf> {
    let pid = sysinfo::get_current_pid().map_err(|e| PlatformError::ParentProcess(e.to_string()))?;
    let kind = ProcessRefreshKind::nothing().with_exe(UpdateKind::OnlyIfNotSet);

    let mut system = System::new();
    system.refresh_processes_specifics(ProcessesToUpdate::Some(&[pid]), true, kind);
    let parent = system
        .process(pid)
        .and_then(|p| p.parent())
        .ok_or_else(|| PlatformError::ParentProcess("process has no parent".to_string()))?;

    system.refresh_processes_specifics(ProcessesToUpdate::Some(&[parent]), true, kind);
    system
        .process(parent)
        .and_then(|p| p.exe())
        .map(Path::to_path_buf)
        .ok_or_else(|| {
            PlatformError::ParentProcess(format!("no executable path for parent pid {}", parent))
        })
}

/// Find `name` in the directories of a `PATH`-style list.
pub fn lookup_on_path(name: &str, search_path: &OsStr) -> PlatformResult<PathBuf> {
    let file_name = if cfg!(windows) {
        format!("{}.exe", name)
    } else {
        name.to_string()
    };

    std::env::split_paths(search_path)
        .map(|dir| dir.join(&file_name))
        .find(|candidate| candidate.is_file())
        .ok_or_else(|| PlatformError::NotOnPath(name.to_string()))
}

/// Reject empty paths and paths that walk up the directory tree.
pub fn validate_binary_path(path: &Path) -> PlatformResult<PathBuf> {
    if path.as_os_str().is_empty() {
        return Err(PlatformError::EmptyPath);
    }

    let absolute = std::path::absolute(path).map_err(|source| PlatformError::Inspect {
        path: path.to_path_buf(),
        source,
    })?;

    if absolute.components().any(|c| c == Component::ParentDir) {
        return Err(PlatformError::DirectoryTraversal(absolute));
    }
    Ok(absolute)
}

/// Check that `path` is a non-empty regular file we are allowed to execute.
///
/// Symlinks are followed; the target must satisfy the checks.
pub fn verify_binary(path: &Path) -> PlatformResult<()> {
    let metadata = std::fs::metadata(path).map_err(|source| PlatformError::Inspect {
        path: path.to_path_buf(),
        source,
    })?;

    if !metadata.is_file() {
        return Err(PlatformError::NotRegularFile(path.to_path_buf()));
    }
    if metadata.len() == 0 {
        return Err(PlatformError::EmptyBinary(path.to_path_buf()));
    }
    if !is_executable(path, &metadata) {
        return Err(PlatformError::NotExecutable(path.to_path_buf()));
    }
    Ok(())
}

#[cfg(unix)]
fn is_executable(_path: &Path, metadata: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(path: &Path, _metadata: &std::fs::Metadata) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            matches!(
                ext.to_ascii_lowercase().as_str(),
                "exe" | "com" | "bat" | "cmd"
            )
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn empty_path_is_rejected() {
        assert!(matches!(
            validate_binary_path(Path::new("")),
            Err(PlatformError::EmptyPath)
        ));
    }

    #[test]
    fn traversal_is_rejected() {
        let result = validate_binary_path(Path::new("/usr/local/../bin/terraform"));
        assert!(matches!(result, Err(PlatformError::DirectoryTraversal(_))));
    }

    #[test]
    fn relative_path_becomes_absolute() {
        let path = validate_binary_path(Path::new("bin/terraform")).unwrap();
        assert!(path.is_absolute());
        assert!(path.ends_with("bin/terraform"));
    }

    #[test]
    fn directory_is_not_a_binary() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            verify_binary(dir.path()),
            Err(PlatformError::NotRegularFile(_))
        ));
    }

    #[test]
    fn missing_binary_fails_inspection() {
        let dir = tempdir().unwrap();
        let result = verify_binary(&dir.path().join("terraform"));
        assert!(matches!(result, Err(PlatformError::Inspect { .. })));
    }

    #[cfg(unix)]
    #[test]
    fn empty_and_non_executable_files_are_rejected() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let empty = dir.path().join("empty");
        std::fs::write(&empty, b"").unwrap();
        std::fs::set_permissions(&empty, std::fs::Permissions::from_mode(0o755)).unwrap();
        assert!(matches!(
            verify_binary(&empty),
            Err(PlatformError::EmptyBinary(_))
        ));

        let plain = dir.path().join("plain");
        std::fs::write(&plain, b"data").unwrap();
        std::fs::set_permissions(&plain, std::fs::Permissions::from_mode(0o644)).unwrap();
        assert!(matches!(
            verify_binary(&plain),
            Err(PlatformError::NotExecutable(_))
        ));

        std::fs::set_permissions(&plain, std::fs::Permissions::from_mode(0o755)).unwrap();
        assert!(verify_binary(&plain).is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn lookup_finds_first_match() {
        let first = tempdir().unwrap();
        let second = tempdir().unwrap();
        std::fs::write(second.path().join("tofu"), b"#!/bin/sh\n").unwrap();

        let search = std::env::join_paths([first.path(), second.path()]).unwrap();
        assert_eq!(
            lookup_on_path("tofu", &search).unwrap(),
            second.path().join("tofu")
        );
        assert!(matches!(
            lookup_on_path("terraform", &search),
            Err(PlatformError::NotOnPath(_))
        ));
    }
}
