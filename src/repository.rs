// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Repository resolution.
//!
//! Turn a registered repository name into a working copy on disk. The
//! [`RepositoryResolver`] is the single place that joins the registry, the
//! cache root, and git access together: it looks the name up, computes the
//! cache directory from the remote URL, and makes sure the working copy
//! exists, using stored credentials of the remote if there are any.

use crate::{
    git::{CheckoutOutcome, CheckoutRequest, Git2Cache, GitAccess, GitError, REPO_INDEX_FILE},
    registry::{
        store::{AnyStore, RegistryStore},
        AuthPair, Registry, RegistryError, Repository,
    },
};

use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeSet,
    fs::{read, read_dir, remove_dir_all},
    path::{Path, PathBuf},
};
use tracing::{debug, info, instrument};

/// Repository index, i.e., the concepts a repository publishes.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct RepoIndex {
    #[serde(default)]
    pub version: u32,

    /// Concept directories relative to repository root.
    #[serde(default)]
    pub concepts: Vec<String>,
}

impl RepoIndex {
    /// Load repository index from top-level of working copy.
    ///
    /// # Errors
    ///
    /// - Return [`RepositoryError::IndexRead`] if the index cannot be read.
    /// - Return [`RepositoryError::IndexParse`] if the index is malformed.
    pub fn load(repo_path: impl AsRef<Path>) -> Result<Self> {
        let path = repo_path.as_ref().join(REPO_INDEX_FILE);
        let data = read(&path).map_err(|source| RepositoryError::IndexRead {
            source,
            path: path.clone(),
        })?;
        serde_json::from_slice(&data).map_err(|source| RepositoryError::IndexParse { source, path })
    }
}

/// Registered repository with its materialized working copy.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct ResolvedRepository {
    pub repository: Repository,
    pub path: PathBuf,
}

impl ResolvedRepository {
    /// Absolute path to working copy.
    pub fn absolute_path(&self) -> &Path {
        &self.path
    }

    /// Load repository index of working copy.
    ///
    /// # Errors
    ///
    /// - Return [`RepositoryError`] if the index cannot be loaded.
    pub fn repo_index(&self) -> Result<RepoIndex> {
        RepoIndex::load(&self.path)
    }
}

/// Registered repository together with local cache state.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct RepositoryStatus {
    pub repository: Repository,
    pub path: PathBuf,

    /// Whether the working copy has been materialized.
    pub initialized: bool,
}

/// Resolve repository names into working copies.
#[derive(Debug)]
pub struct RepositoryResolver<S = AnyStore, G = Git2Cache>
where
    S: RegistryStore,
    G: GitAccess,
{
    registry: Registry<S>,
    git: G,
    cache_dir: PathBuf,
}

impl<S, G> RepositoryResolver<S, G>
where
    S: RegistryStore,
    G: GitAccess,
{
    /// Construct new resolver with cache rooted at target directory.
    pub fn new(registry: Registry<S>, git: G, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            registry,
            git,
            cache_dir: cache_dir.into(),
        }
    }

    /// Registry this resolver reads from.
    pub fn registry(&self) -> &Registry<S> {
        &self.registry
    }

    /// Root of repository cache.
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Determine cache location of repository.
    ///
    /// Only depends on the repository URL.
    ///
    /// # Errors
    ///
    /// - Return [`RegistryError::InvalidUrl`] if the URL has no usable path
    ///   segment.
    pub fn cache_path(&self, repository: &Repository) -> Result<PathBuf> {
        let name = repository
            .cache_dir_name()
            .ok_or_else(|| RegistryError::InvalidUrl(repository.url.clone()))?;
        Ok(self.cache_dir.join(name))
    }

    /// Look up registered repository.
    ///
    /// # Errors
    ///
    /// - Return [`RegistryError::RepositoryUnknown`] if not registered.
    pub fn get_repository(&self, name: &str) -> Result<Repository> {
        Ok(self.registry.get_repository(name)?)
    }

    /// Resolve repository, cloning its working copy if needed.
    ///
    /// # Errors
    ///
    /// - Return [`RegistryError::RepositoryUnknown`] if not registered.
    /// - Return [`GitError`] if the working copy cannot be materialized.
    #[instrument(skip(self), level = "debug")]
    pub fn resolve(&self, name: &str) -> Result<ResolvedRepository> {
        self.materialize(name, false).map(|(resolved, _)| resolved)
    }

    /// Absolute path to working copy of repository, cloning it if needed.
    ///
    /// # Errors
    ///
    /// - Return [`RepositoryError`] if the repository cannot be resolved.
    pub fn absolute_path(&self, name: &str) -> Result<PathBuf> {
        Ok(self.resolve(name)?.path)
    }

    /// Repository index of repository, cloning it if needed.
    ///
    /// # Errors
    ///
    /// - Return [`RepositoryError`] if the repository cannot be resolved, or
    ///   its index cannot be loaded.
    pub fn repo_index(&self, name: &str) -> Result<RepoIndex> {
        self.resolve(name)?.repo_index()
    }

    /// Path to working copy of repository without cloning it.
    ///
    /// # Errors
    ///
    /// - Return [`RepositoryError::NotInitialized`] if the working copy has
    ///   never been materialized.
    pub fn local_path(&self, name: &str) -> Result<PathBuf> {
        let repository = self.get_repository(name)?;
        let path = self.cache_path(&repository)?;
        if !is_initialized(&path) {
            return Err(RepositoryError::NotInitialized(name.to_string()));
        }
        Ok(path)
    }

    /// List all registered repositories with their cache state.
    ///
    /// # Errors
    ///
    /// - Return [`RegistryError`] if the registry cannot be read.
    pub fn list_repositories(&self) -> Result<Vec<RepositoryStatus>> {
        self.registry
            .list_repositories()?
            .into_iter()
            .map(|repository| -> Result<RepositoryStatus> {
                let path = self.cache_path(&repository)?;
                Ok(RepositoryStatus {
                    initialized: is_initialized(&path),
                    repository,
                    path,
                })
            })
            .collect()
    }

    /// Pull latest changes of repository, cloning it if needed.
    ///
    /// # Errors
    ///
    /// - Return [`RepositoryError`] if the repository cannot be resolved.
    #[instrument(skip(self), level = "debug")]
    pub fn update_repository(&self, name: &str) -> Result<CheckoutOutcome> {
        self.materialize(name, true).map(|(_, outcome)| outcome)
    }

    /// Pull latest changes of every registered repository.
    ///
    /// Stops at the first repository that fails.
    ///
    /// # Errors
    ///
    /// - Return first [`RepositoryError`] encountered.
    #[instrument(skip(self), level = "debug")]
    pub fn update_repositories(&self) -> Result<Vec<(String, CheckoutOutcome)>> {
        self.registry
            .list_repositories()?
            .into_iter()
            .map(|repository| -> Result<(String, CheckoutOutcome)> {
                let outcome = self.update_repository(&repository.name)?;
                Ok((repository.name, outcome))
            })
            .collect()
    }

    /// Materialize working copy of a repository that is not registered yet.
    ///
    /// Used to validate a repository before adding it to the registry.
    ///
    /// # Errors
    ///
    /// - Return [`GitError`] if the working copy cannot be materialized.
    #[instrument(skip(self, auth), level = "debug")]
    pub fn checkout(&self, repository: &Repository, auth: Option<&AuthPair>) -> Result<PathBuf> {
        let path = self.cache_path(repository)?;
        self.git.ensure_checkout(&CheckoutRequest {
            url: &repository.url,
            git_ref: &repository.git_ref,
            path: &path,
            auth,
            pull: false,
        })?;
        Ok(path)
    }

    /// Remove cache directories no registered repository maps to.
    ///
    /// Returns names of removed directories in order.
    ///
    /// # Errors
    ///
    /// - Return [`RepositoryError::CacheRead`] if the cache cannot be listed.
    /// - Return [`RepositoryError::CacheRemove`] if a directory cannot be
    ///   removed.
    #[instrument(skip(self), level = "debug")]
    pub fn tidy_cache(&self) -> Result<Vec<String>> {
        if !self.cache_dir.exists() {
            return Ok(Vec::new());
        }

        let wanted = self
            .registry
            .list_repositories()?
            .iter()
            .filter_map(Repository::cache_dir_name)
            .collect::<BTreeSet<_>>();

        let cache_read = |source| RepositoryError::CacheRead {
            source,
            path: self.cache_dir.clone(),
        };
        let mut stale = Vec::new();
        for entry in read_dir(&self.cache_dir).map_err(cache_read)? {
            let entry = entry.map_err(cache_read)?;
            let name = entry.file_name().to_string_lossy().into_owned();

            // INVARIANT: Hidden entries are lock files, never working copies.
            if name.starts_with('.') || !entry.path().is_dir() || wanted.contains(&name) {
                continue;
            }
            stale.push(name);
        }
        stale.sort();

        for name in &stale {
            let path = self.cache_dir.join(name);
            info!("remove stale cache directory {:?}", path.display());
            remove_dir_all(&path).map_err(|source| RepositoryError::CacheRemove { source, path })?;
        }

        Ok(stale)
    }

    fn materialize(&self, name: &str, pull: bool) -> Result<(ResolvedRepository, CheckoutOutcome)> {
        // INVARIANT: Entry and credentials come from one registry snapshot.
        let registry = self.registry.read()?;
        let repository = registry.get(name)?.clone();
        let auth = registry.auth_for(&repository.url)?;
        let path = self.cache_path(&repository)?;

        let outcome = self.git.ensure_checkout(&CheckoutRequest {
            url: &repository.url,
            git_ref: &repository.git_ref,
            path: &path,
            auth: auth.as_ref(),
            pull,
        })?;
        debug!("repository {name} at {:?}: {outcome:?}", path.display());

        Ok((ResolvedRepository { repository, path }, outcome))
    }
}

fn is_initialized(path: &Path) -> bool {
    path.join(".git").exists()
}

/// All possible error types for repository resolution.
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    /// Working copy has never been materialized.
    #[error("repository {0:?} is not initialized in the local cache")]
    NotInitialized(String),

    /// Repository index cannot be read.
    #[error("failed to read repository index at {:?}", path.display())]
    IndexRead {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Repository index is malformed.
    #[error("malformed repository index at {:?}", path.display())]
    IndexParse {
        #[source]
        source: serde_json::Error,
        path: PathBuf,
    },

    /// Cache root cannot be listed.
    #[error("failed to list cache at {:?}", path.display())]
    CacheRead {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Stale cache directory cannot be removed.
    #[error("failed to remove cache directory {:?}", path.display())]
    CacheRemove {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Registry lookup fails.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Git cache access fails.
    #[error(transparent)]
    Git(#[from] GitError),
}

/// Friendly result alias :3
type Result<T, E = RepositoryError> = std::result::Result<T, E>;
