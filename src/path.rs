// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Path resolution utilities.
//!
//! Determine default locations for the files kable owns on the user's
//! machine: the configuration file, the local registry file, and the root of
//! the repository cache.

use fslock::LockFile;
use std::path::{Path, PathBuf};

/// Name of kable's directory inside the XDG base directories.
pub const KABLE_DIR_NAME: &str = "kable";

/// File name of the configuration file.
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// File name of the local registry document.
pub const REGISTRY_FILE_NAME: &str = "registry.json";

/// Environment variable that overrides the configuration file location.
pub const CONFIG_ENV: &str = "KABLE_CONFIG";

/// Determine default absolute path to kable's configuration directory.
///
/// Uses `$XDG_CONFIG_HOME/kable`. Does not check if the path exists.
///
/// # Errors
///
/// - Return [`NoWayHome`] if the configuration directory cannot be determined.
pub fn default_config_dir() -> Result<PathBuf> {
    dirs::config_dir()
        .map(|path| path.join(KABLE_DIR_NAME))
        .ok_or(NoWayHome)
}

/// Determine path of the configuration file.
///
/// Honors `$KABLE_CONFIG` before falling back to
/// `$XDG_CONFIG_HOME/kable/config.toml`.
///
/// # Errors
///
/// - Return [`NoWayHome`] if the configuration directory cannot be determined.
pub fn default_config_file() -> Result<PathBuf> {
    match std::env::var_os(CONFIG_ENV) {
        Some(path) if !path.is_empty() => Ok(PathBuf::from(path)),
        _ => Ok(default_config_dir()?.join(CONFIG_FILE_NAME)),
    }
}

/// Determine default path of the local registry document.
///
/// # Errors
///
/// - Return [`NoWayHome`] if the configuration directory cannot be determined.
pub fn default_registry_file() -> Result<PathBuf> {
    Ok(default_config_dir()?.join(REGISTRY_FILE_NAME))
}

/// Determine default root of the repository cache.
///
/// Uses XDG Base Directory path `$XDG_CACHE_HOME/kable`. Every registered
/// repository is checked out into its own directory below this root.
///
/// # Errors
///
/// - Return [`NoWayHome`] if the cache directory cannot be determined.
///
/// # See Also
///
/// - [XDG Base Directory](https://wiki.archlinux.org/title/XDG_Base_Directory)
pub fn default_cache_dir() -> Result<PathBuf> {
    dirs::cache_dir()
        .map(|path| path.join(KABLE_DIR_NAME))
        .ok_or(NoWayHome)
}

/// Determine path of the lock file guarding target path.
///
/// The lock file is a hidden sibling of the target, e.g., `cache/demo`
/// is guarded by `cache/.demo.lock`.
pub fn lock_file_for(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    target.with_file_name(format!(".{name}.lock"))
}

/// Acquire exclusive lock on target lock file.
///
/// Blocks until the lock is available. The lock is released when the
/// returned [`LockFile`] is dropped. Creates missing parent directories.
pub fn lock_exclusive(lock_path: &Path) -> std::io::Result<LockFile> {
    if let Some(parent) = lock_path.parent() {
        mkdirp::mkdirp(parent)?;
    }

    let mut lock = LockFile::open(lock_path)?;
    lock.lock()?;
    Ok(lock)
}

/// No way to determine user's home directory.
///
/// # See Also
///
/// - [`dirs::home_dir`](https://docs.rs/dirs/latest/dirs/fn.home_dir.html)
#[derive(Clone, Debug, thiserror::Error)]
#[error("cannot determine absolute path to user's home directory")]
pub struct NoWayHome;

/// Friendly result alias :3
pub type Result<T, E = NoWayHome> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use sealed_test::prelude::*;

    #[sealed_test(env = [("KABLE_CONFIG", "/tmp/kable/elsewhere.toml")])]
    fn config_file_honors_environment() -> anyhow::Result<()> {
        assert_eq!(
            default_config_file()?,
            PathBuf::from("/tmp/kable/elsewhere.toml")
        );
        Ok(())
    }

    #[test]
    fn lock_file_is_hidden_sibling() {
        assert_eq!(
            lock_file_for(Path::new("/var/cache/kable/demo-concepts")),
            PathBuf::from("/var/cache/kable/.demo-concepts.lock")
        );
    }

    #[test]
    fn lock_exclusive_creates_parent_directories() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let lock_path = dir.path().join("nested").join(".registry.json.lock");
        let lock = lock_exclusive(&lock_path)?;
        assert!(lock_path.exists());
        drop(lock);
        Ok(())
    }

    #[sealed_test(env = [("KABLE_CONFIG", "")])]
    fn config_file_ignores_empty_environment() -> anyhow::Result<()> {
        assert!(default_config_file()?.ends_with("kable/config.toml"));
        Ok(())
    }
}
