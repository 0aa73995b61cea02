// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Registry backing stores.
//!
//! A backing store persists the whole registry as one document. It is only
//! ever read and written wholesale, never patched.
//!
//! # Revisions
//!
//! Every read hands out a [`Revision`] token alongside the registry. A
//! conditional write through [`RegistryStore::compare_and_write`] only
//! succeeds while the stored document still carries that revision, which is
//! what lets [`Registry::update`](crate::registry::Registry::update) detect
//! that it raced another writer.
//!
//! # Bootstrapping
//!
//! A store that holds no registry yet is not an error. Reading it writes an
//! empty registry first, and then reads that back.

use crate::{
    config::{ConfigError, StoreConfig},
    path::{lock_exclusive, lock_file_for},
    registry::{
        etcd::{EtcdGateway, EtcdStore},
        RepoRegistry,
    },
};

use std::{
    fs::{read, rename, write},
    hash::{DefaultHasher, Hasher},
    io::ErrorKind,
    path::{Path, PathBuf},
};
use tracing::{debug, info, instrument};

/// Opaque version token of a stored registry document.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Revision(u64);

impl Revision {
    /// Revision of a store that holds no registry yet.
    pub const ABSENT: Revision = Revision(0);

    /// Construct revision from raw token.
    pub fn new(token: u64) -> Self {
        Self(token)
    }

    /// Derive revision from stored document bytes.
    pub fn of_bytes(bytes: &[u8]) -> Self {
        let mut hasher = DefaultHasher::new();
        hasher.write(bytes);

        // INVARIANT: Existing documents never collide with ABSENT.
        Self(hasher.finish().max(1))
    }

    /// Raw token.
    pub fn get(&self) -> u64 {
        self.0
    }
}

/// Registry together with the revision it was read at.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub registry: RepoRegistry,
    pub revision: Revision,
}

/// Persist the registry document.
pub trait RegistryStore: Send + Sync {
    /// Read current registry, bootstrapping an empty one if needed.
    fn read_registry(&self) -> Result<Snapshot>;

    /// Overwrite stored registry unconditionally.
    fn write_registry(&self, registry: &RepoRegistry) -> Result<()>;

    /// Overwrite stored registry only if it is still at expected revision.
    ///
    /// Fails with [`StoreError::StaleRegistry`] otherwise.
    fn compare_and_write(&self, registry: &RepoRegistry, expected: Revision) -> Result<()>;
}

/// Registry persisted as indented JSON on the local file system.
///
/// Writes go through a sibling lock file and an atomic rename, so readers
/// never see a half-written document, and conditional writes from several
/// processes cannot interleave.
#[derive(Debug, Clone)]
pub struct LocalStore {
    path: PathBuf,
}

impl LocalStore {
    /// Construct new local store at target path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Location of registry document.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_document(&self) -> Result<Option<Vec<u8>>> {
        match read(&self.path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(StoreError::Read {
                source: err,
                path: self.path.clone(),
            }),
        }
    }

    fn current_revision(&self) -> Result<Revision> {
        Ok(self
            .read_document()?
            .map(|bytes| Revision::of_bytes(&bytes))
            .unwrap_or(Revision::ABSENT))
    }

    fn write_document(&self, registry: &RepoRegistry) -> Result<()> {
        let write_err = |source| StoreError::Write {
            source,
            path: self.path.clone(),
        };

        if let Some(parent) = self.path.parent() {
            mkdirp::mkdirp(parent).map_err(write_err)?;
        }

        // INVARIANT: Replace document atomically through a temporary sibling.
        let bytes = serde_json::to_vec_pretty(registry)?;
        let tmp_path = self.path.with_extension("json.tmp");
        write(&tmp_path, &bytes).map_err(write_err)?;
        rename(&tmp_path, &self.path).map_err(write_err)?;

        Ok(())
    }

    fn lock(&self) -> Result<fslock::LockFile> {
        let lock_path = lock_file_for(&self.path);
        lock_exclusive(&lock_path).map_err(|source| StoreError::Lock {
            source,
            path: lock_path,
        })
    }
}

impl RegistryStore for LocalStore {
    #[instrument(skip(self), level = "debug")]
    fn read_registry(&self) -> Result<Snapshot> {
        let bytes = match self.read_document()? {
            Some(bytes) => bytes,
            None => {
                info!("initialize empty registry at {:?}", self.path.display());
                match self.compare_and_write(&RepoRegistry::default(), Revision::ABSENT) {
                    Ok(()) | Err(StoreError::StaleRegistry) => {}
                    Err(err) => return Err(err),
                }
                self.read_document()?.ok_or_else(|| StoreError::Read {
                    source: ErrorKind::NotFound.into(),
                    path: self.path.clone(),
                })?
            }
        };

        Ok(Snapshot {
            registry: serde_json::from_slice(&bytes)?,
            revision: Revision::of_bytes(&bytes),
        })
    }

    #[instrument(skip(self, registry), level = "debug")]
    fn write_registry(&self, registry: &RepoRegistry) -> Result<()> {
        let _lock = self.lock()?;
        self.write_document(registry)?;
        debug!("wrote registry to {:?}", self.path.display());
        Ok(())
    }

    #[instrument(skip(self, registry), level = "debug")]
    fn compare_and_write(&self, registry: &RepoRegistry, expected: Revision) -> Result<()> {
        let _lock = self.lock()?;
        let current = self.current_revision()?;
        if current != expected {
            debug!("registry revision moved from {expected:?} to {current:?}");
            return Err(StoreError::StaleRegistry);
        }

        self.write_document(registry)?;
        debug!("wrote registry to {:?}", self.path.display());
        Ok(())
    }
}

/// Store selected by configuration.
#[derive(Debug, Clone)]
pub enum AnyStore {
    Local(LocalStore),
    Etcd(EtcdStore<EtcdGateway>),
}

impl AnyStore {
    /// Construct store described by configuration.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::NoWayHome`] if the default local registry
    ///   path cannot be determined.
    pub fn from_config(config: &StoreConfig) -> Result<Self, ConfigError> {
        match config {
            StoreConfig::Local { .. } => {
                let path = config.local_path()?.unwrap_or_default();
                Ok(Self::Local(LocalStore::new(path)))
            }
            StoreConfig::Etcd { endpoints, key, .. } => Ok(Self::Etcd(EtcdStore::new(
                EtcdGateway::new(endpoints.clone(), config.timeout().unwrap_or_default()),
                key.clone(),
            ))),
        }
    }
}

impl RegistryStore for AnyStore {
    fn read_registry(&self) -> Result<Snapshot> {
        match self {
            Self::Local(store) => store.read_registry(),
            Self::Etcd(store) => store.read_registry(),
        }
    }

    fn write_registry(&self, registry: &RepoRegistry) -> Result<()> {
        match self {
            Self::Local(store) => store.write_registry(registry),
            Self::Etcd(store) => store.write_registry(registry),
        }
    }

    fn compare_and_write(&self, registry: &RepoRegistry, expected: Revision) -> Result<()> {
        match self {
            Self::Local(store) => store.compare_and_write(registry, expected),
            Self::Etcd(store) => store.compare_and_write(registry, expected),
        }
    }
}

/// All possible error types for backing store interaction.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Registry document cannot be read.
    #[error("failed to read registry at {:?}", path.display())]
    Read {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Registry document cannot be written.
    #[error("failed to write registry at {:?}", path.display())]
    Write {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Registry lock file cannot be acquired.
    #[error("failed to lock registry through {:?}", path.display())]
    Lock {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Stored registry changed since it was read.
    #[error("registry changed since it was read")]
    StaleRegistry,

    /// More than one registry document found under the registry key.
    #[error("detected {count} registries in store under key {key:?}")]
    MultipleRegistriesInStore { key: String, count: usize },

    /// Distributed store call exceeded its timeout.
    #[error("store call to {endpoint} timed out")]
    Timeout { endpoint: String },

    /// Distributed store call failed.
    #[error("store call to {endpoint} failed")]
    Http {
        endpoint: String,
        #[source]
        source: Box<ureq::Error>,
    },

    /// Distributed store answered with something unexpected.
    #[error("unexpected response from {endpoint}: {reason}")]
    Response { endpoint: String, reason: String },

    /// No distributed store endpoint is configured.
    #[error("no store endpoints configured")]
    NoEndpoints,

    /// Registry document is not valid JSON.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    /// Whether retrying the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::StaleRegistry)
    }
}

/// Friendly result alias :3
pub(crate) type Result<T, E = StoreError> = std::result::Result<T, E>;
