// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Configuration layout.
//!
//! Specify the layout of kable's configuration file. The configuration file
//! decides where the repository cache lives, and which backing store holds
//! the repository registry. A missing configuration file is equivalent to an
//! empty one: a local registry file plus the default cache directory.
//!
//! # General Layout
//!
//! ```toml
//! cache_dir = "$HOME/.cache/kable"
//!
//! [store]
//! type = "etcd"
//! endpoints = ["http://127.0.0.1:2379"]
//! timeout_ms = 5000
//! ```

use crate::path::{default_cache_dir, default_registry_file, NoWayHome};

use serde::{Deserialize, Serialize};
use std::{
    fmt::{Display, Error as FmtError, Formatter, Result as FmtResult},
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

/// Default timeout of a single distributed store call.
pub const DEFAULT_STORE_TIMEOUT_MS: u64 = 5000;

/// Default key the registry document is stored under in etcd.
pub const DEFAULT_ETCD_KEY: &str = "/kable/registry";

/// Kable configuration file layout.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct KableConfig {
    /// Root directory of the repository cache.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<PathBuf>,

    /// Backing store of the repository registry.
    #[serde(default)]
    pub store: StoreConfig,
}

impl KableConfig {
    /// Load configuration from target path.
    ///
    /// A missing file yields the default configuration.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::Read`] if the file exists but cannot be read.
    /// - Return [`ConfigError::Deserialize`] if the file is malformed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        match std::fs::read_to_string(path.as_ref()) {
            Ok(data) => data.parse(),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => Err(ConfigError::Read {
                source: err,
                path: path.as_ref().to_path_buf(),
            }),
        }
    }

    /// Resolve cache root, falling back to the XDG default.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::NoWayHome`] if no default can be determined.
    pub fn resolved_cache_dir(&self) -> Result<PathBuf> {
        match &self.cache_dir {
            Some(path) => Ok(path.clone()),
            None => Ok(default_cache_dir()?),
        }
    }
}

impl FromStr for KableConfig {
    type Err = ConfigError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        let mut config: KableConfig = toml::de::from_str(data).map_err(ConfigError::Deserialize)?;

        // INVARIANT: Perform shell expansion on every path-valued field.
        if let Some(cache_dir) = config.cache_dir.take() {
            config.cache_dir = Some(expand_path(&cache_dir)?);
        }
        if let StoreConfig::Local { path: Some(path) } = &mut config.store {
            *path = expand_path(path)?;
        }

        Ok(config)
    }
}

impl Display for KableConfig {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(
            toml::ser::to_string_pretty(self)
                .map_err(ConfigError::Serialize)?
                .as_str(),
        )
    }
}

/// Registry store selection.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StoreConfig {
    /// Registry kept as a JSON file on the local file system.
    Local {
        /// Location of registry file, defaults to the XDG config directory.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<PathBuf>,
    },

    /// Registry kept as a single JSON value in etcd.
    Etcd {
        /// Base URLs of etcd's HTTP gateway, tried in order.
        endpoints: Vec<String>,

        /// Timeout of a single store call in milliseconds.
        #[serde(default = "default_timeout_ms")]
        timeout_ms: u64,

        /// Key holding the registry document.
        #[serde(default = "default_etcd_key")]
        key: String,
    },
}

impl StoreConfig {
    /// Resolve local registry path, falling back to the XDG default.
    ///
    /// Returns `None` for non-local stores.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::NoWayHome`] if no default can be determined.
    pub fn local_path(&self) -> Result<Option<PathBuf>> {
        match self {
            Self::Local { path: Some(path) } => Ok(Some(path.clone())),
            Self::Local { path: None } => Ok(Some(default_registry_file()?)),
            Self::Etcd { .. } => Ok(None),
        }
    }

    /// Per-call timeout of the store, if it is a remote one.
    pub fn timeout(&self) -> Option<Duration> {
        match self {
            Self::Local { .. } => None,
            Self::Etcd { timeout_ms, .. } => Some(Duration::from_millis(*timeout_ms)),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::Local { path: None }
    }
}

fn default_timeout_ms() -> u64 {
    DEFAULT_STORE_TIMEOUT_MS
}

fn default_etcd_key() -> String {
    DEFAULT_ETCD_KEY.into()
}

fn expand_path(path: &Path) -> Result<PathBuf> {
    Ok(PathBuf::from(
        shellexpand::full(path.to_string_lossy().as_ref())
            .map_err(ConfigError::ShellExpansion)?
            .into_owned(),
    ))
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read configuration at {:?}", path.display())]
    Read {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Failed to deserialize configuration.
    #[error(transparent)]
    Deserialize(#[from] toml::de::Error),

    /// Failed to serialize configuration.
    #[error(transparent)]
    Serialize(#[from] toml::ser::Error),

    /// Failed to perform shell expansion on configuration.
    #[error(transparent)]
    ShellExpansion(#[from] shellexpand::LookupError<std::env::VarError>),

    /// Default locations cannot be determined.
    #[error(transparent)]
    NoWayHome(#[from] NoWayHome),
}

impl From<ConfigError> for FmtError {
    fn from(_: ConfigError) -> Self {
        FmtError
    }
}

/// Friendly result alias :3
type Result<T, E = ConfigError> = std::result::Result<T, E>;
