//! Plugin discovery: enumerate executable files in a directory.

use std::path::{Path, PathBuf};

use globset::Glob;
use tracing::debug;

use crate::error::{Result, SkiffError};

/// Find plugin binaries under `dir` whose file name matches `glob`.
///
/// Only plain files with at least one executable bit set qualify. Entries
/// that cannot be read are skipped, not reported. Returned paths are
/// absolute and sorted.
pub fn discover(dir: impl AsRef<Path>, glob: &str) -> Result<Vec<PathBuf>> {
    let dir = dir.as_ref();
    let dir = if dir.is_absolute() {
        dir.to_path_buf()
    } else {
        std::env::current_dir()?.join(dir)
    };

    let matcher = Glob::new(glob)
        .map_err(|e| SkiffError::config(format!("invalid plugin glob {glob:?}: {e}")))?
        .compile_matcher();

    let entries = match std::fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!(dir = %dir.display(), error = %e, "could not read plugin directory");
            return Ok(Vec::new());
        }
    };

    let mut plugins = Vec::new();
    for entry in entries {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                debug!(error = %e, "skipping unreadable directory entry");
                continue;
            }
        };
        let name = entry.file_name();
        if !matcher.is_match(&name) {
            continue;
        }
        let path = entry.path();
        let metadata = match entry.metadata() {
            Ok(m) => m,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "could not stat plugin candidate");
                continue;
            }
        };
        if metadata.is_dir() {
            debug!(path = %path.display(), "skipping directory");
            continue;
        }
        if !is_executable(&metadata) {
            debug!(path = %path.display(), "skipping non-executable plugin candidate");
            continue;
        }
        plugins.push(path);
    }

    plugins.sort();
    Ok(plugins)
}

#[cfg(unix)]
fn is_executable(metadata: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_metadata: &std::fs::Metadata) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[cfg(unix)]
    fn make_executable(path: &Path) {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn test_discover_filters_by_glob_and_mode() {
        let dir = tempfile::tempdir().unwrap();

        let exec = dir.path().join("plugin-alpha");
        fs::write(&exec, "#!/bin/sh\n").unwrap();
        make_executable(&exec);

        let plain = dir.path().join("plugin-beta");
        fs::write(&plain, "not executable").unwrap();

        let unrelated = dir.path().join("README");
        fs::write(&unrelated, "docs").unwrap();

        let subdir = dir.path().join("plugin-dir");
        fs::create_dir(&subdir).unwrap();
        make_executable(&subdir);

        let found = discover(dir.path(), "plugin-*").unwrap();
        assert_eq!(found, vec![exec]);
    }

    #[test]
    fn test_discover_missing_dir_is_empty() {
        let found = discover("/nonexistent/plugins", "*").unwrap();
        assert!(found.is_empty());
    }

    #[test]
    fn test_discover_bad_glob() {
        let err = discover("/tmp", "plugin-[").unwrap_err();
        assert!(matches!(err, SkiffError::Config { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn test_discover_returns_absolute_sorted_paths() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["zz-plugin", "aa-plugin"] {
            let path = dir.path().join(name);
            fs::write(&path, "x").unwrap();
            make_executable(&path);
        }
        let found = discover(dir.path(), "*-plugin").unwrap();
        assert_eq!(found.len(), 2);
        assert!(found.iter().all(|p| p.is_absolute()));
        assert!(found[0] < found[1]);
    }
}
