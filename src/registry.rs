// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Repository registry.
//!
//! The __registry__ is the persisted source of truth about which concept
//! repositories kable knows. It maps a unique repository name to the git
//! remote and ref the repository is fetched from, and keeps basic
//! credentials for remotes that need them.
//!
//! # Updating the Registry
//!
//! The registry is never edited field by field. Callers build a list of
//! [`RegistryModification`]s, and hand them to [`Registry::update`], which
//! reads one snapshot from the backing store, applies every modification in
//! order on top of it, and commits the result with a single conditional
//! write. If another writer got in between, the whole sequence is re-applied
//! to a fresh snapshot. Thus, modifications submitted together always observe
//! one consistent base state and commit once, and concurrent writers never
//! silently lose each other's updates.
//!
//! Modification constructors like [`add_repository`] validate their input
//! eagerly, so an invalid name is rejected before the store is touched.
//!
//! # See Also
//!
//! - [`store`] for the backing store contract.
//! - [`etcd`] for the distributed backing store.

pub mod etcd;
pub mod store;

use crate::registry::store::{AnyStore, RegistryStore, StoreError};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fmt::{Debug, Display, Formatter, Result as FmtResult},
    sync::LazyLock,
};
use tracing::{debug, info, instrument, warn};

/// Ref used when a repository is added without one.
pub const MASTER_GIT_REF: &str = "refs/heads/master";

/// Pattern every repository name must match.
pub const REPOSITORY_NAME_PATTERN: &str = r"^[a-z\-]+$";

/// Number of times [`Registry::update`] re-applies modifications after
/// losing a race against another writer.
pub const MAX_UPDATE_ATTEMPTS: usize = 8;

static REPOSITORY_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(REPOSITORY_NAME_PATTERN).expect("repository name pattern is valid")
});

/// Check repository name against [`REPOSITORY_NAME_PATTERN`].
pub fn is_valid_repository_name(name: impl AsRef<str>) -> bool {
    REPOSITORY_NAME.is_match(name.as_ref())
}

/// Normalize git remote URL.
///
/// Strips trailing slashes and the `.git` suffix so that the same remote
/// written two different ways maps to the same registry and cache entry.
pub fn normalize_url(url: impl AsRef<str>) -> String {
    let url = url.as_ref().trim().trim_end_matches('/');
    url.strip_suffix(".git").unwrap_or(url).to_string()
}

/// Determine cache directory name of a remote.
///
/// Takes the last path segment of the normalized URL. SCP-like remotes such
/// as `git@host:org/repo.git` are split on `:` as well.
pub fn cache_dir_name(url: impl AsRef<str>) -> Option<String> {
    normalize_url(url)
        .rsplit(|c: char| c == '/' || c == ':')
        .next()
        .filter(|segment| !segment.is_empty() && *segment != "." && *segment != "..")
        .map(ToString::to_string)
}

/// Persisted repository registry.
///
/// # Invariant
///
/// - Every key of `repositories` is a valid repository name, and equals the
///   `name` of its value.
/// - Every URL, both in `repositories` and as key of `auths`, is normalized.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(try_from = "RegistryDocument")]
pub struct RepoRegistry {
    /// Configured repositories by name.
    pub repositories: BTreeMap<String, Repository>,

    /// Stored credentials by normalized remote URL.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub auths: BTreeMap<String, Auth>,
}

impl RepoRegistry {
    /// Look up repository by name.
    ///
    /// # Errors
    ///
    /// - Return [`RegistryError::RepositoryUnknown`] if no such repository
    ///   is registered.
    pub fn get(&self, name: &str) -> Result<&Repository> {
        self.repositories
            .get(name)
            .ok_or_else(|| RegistryError::RepositoryUnknown(name.to_string()))
    }

    /// List all repositories ordered by name.
    pub fn list(&self) -> Vec<Repository> {
        self.repositories.values().cloned().collect()
    }

    /// Decode stored credentials of a remote, if any.
    ///
    /// # Errors
    ///
    /// - Return [`RegistryError::MalformedAuth`] if the stored credentials
    ///   cannot be decoded.
    pub fn auth_for(&self, url: &str) -> Result<Option<AuthPair>> {
        let url = normalize_url(url);
        self.auths
            .get(&url)
            .map(|auth| auth.decode(&url))
            .transpose()
    }
}

impl Display for RepoRegistry {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        let repos = self
            .repositories
            .values()
            .map(|repo| format!("'{} => {}@{}'", repo.name, repo.git_ref, repo.url))
            .collect::<Vec<_>>()
            .join(", ");
        write!(fmt, "Registry[Repos: {repos}, Auths: {}]", self.auths.len())
    }
}

// Wire shape of the registry. Repository names only live in the map keys.
#[derive(Deserialize)]
struct RegistryDocument {
    #[serde(default)]
    repositories: BTreeMap<String, Repository>,

    #[serde(default)]
    auths: BTreeMap<String, Auth>,
}

impl TryFrom<RegistryDocument> for RepoRegistry {
    type Error = RegistryError;

    fn try_from(document: RegistryDocument) -> Result<Self> {
        let repositories = document
            .repositories
            .into_iter()
            .map(|(name, mut repo)| {
                if !is_valid_repository_name(&name) {
                    return Err(RegistryError::InvalidRepositoryName(name));
                }
                repo.name = name.clone();
                Ok((name, repo))
            })
            .collect::<Result<_>>()?;

        Ok(Self {
            repositories,
            auths: document.auths,
        })
    }
}

/// One configured concept repository.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct Repository {
    /// Unique name of repository inside the registry.
    #[serde(skip)]
    pub name: String,

    /// Normalized git remote URL.
    pub url: String,

    /// Git ref to check out.
    #[serde(rename = "gitRef")]
    pub git_ref: String,
}

impl Repository {
    /// Construct new repository tracking [`MASTER_GIT_REF`].
    pub fn new(name: impl Into<String>, url: impl AsRef<str>) -> Self {
        Self {
            name: name.into(),
            url: normalize_url(url),
            git_ref: MASTER_GIT_REF.into(),
        }
    }

    /// Track a specific ref instead.
    ///
    /// Short branch names are expanded to `refs/heads/<branch>`.
    pub fn with_ref(mut self, git_ref: impl AsRef<str>) -> Self {
        let git_ref = git_ref.as_ref();
        self.git_ref = if git_ref.starts_with("refs/") {
            git_ref.to_string()
        } else {
            format!("refs/heads/{git_ref}")
        };
        self
    }

    /// Name of this repository's directory in the cache.
    pub fn cache_dir_name(&self) -> Option<String> {
        cache_dir_name(&self.url)
    }
}

/// Stored credentials of one remote.
#[derive(Default, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct Auth {
    /// Base64 encoded JSON of an [`AuthPair`].
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub basic: String,
}

impl Auth {
    /// Encode credentials for storage.
    ///
    /// # Errors
    ///
    /// - Return [`RegistryError::Json`] if credentials cannot be serialized.
    pub fn encode(pair: &AuthPair) -> Result<Self> {
        Ok(Self {
            basic: BASE64.encode(serde_json::to_vec(pair)?),
        })
    }

    fn decode(&self, url: &str) -> Result<AuthPair> {
        let malformed = |reason: String| RegistryError::MalformedAuth {
            url: url.to_string(),
            reason,
        };
        let bytes = BASE64
            .decode(self.basic.as_bytes())
            .map_err(|err| malformed(err.to_string()))?;
        serde_json::from_slice(&bytes).map_err(|err| malformed(err.to_string()))
    }
}

impl Debug for Auth {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.debug_struct("Auth").field("basic", &"<redacted>").finish()
    }
}

/// Basic authentication credentials.
#[derive(Default, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct AuthPair {
    pub username: String,
    pub password: String,
}

impl AuthPair {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl Debug for AuthPair {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.debug_struct("AuthPair")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Transformation of a registry snapshot.
///
/// Must not perform I/O. May be applied more than once when an update has to
/// be retried against a newer snapshot.
pub type RegistryModification = Box<dyn Fn(RepoRegistry) -> Result<RepoRegistry> + Send + Sync>;

/// Add repository to registry.
///
/// The URL is normalized, and an empty ref defaults to [`MASTER_GIT_REF`].
/// Adding a name that is already registered fails unless `overwrite` is set.
///
/// # Errors
///
/// - Return [`RegistryError::InvalidRepositoryName`] for a malformed name.
/// - Return [`RegistryError::InvalidUrl`] for an empty or unusable URL.
/// - The returned modification fails with
///   [`RegistryError::RepositoryAlreadyExists`] on a name collision.
pub fn add_repository(repo: Repository, overwrite: bool) -> Result<RegistryModification> {
    if !is_valid_repository_name(&repo.name) {
        return Err(RegistryError::InvalidRepositoryName(repo.name));
    }
    if cache_dir_name(&repo.url).is_none() {
        return Err(RegistryError::InvalidUrl(repo.url));
    }

    let mut repo = repo;
    repo.url = normalize_url(&repo.url);
    if repo.git_ref.is_empty() {
        repo.git_ref = MASTER_GIT_REF.into();
    }

    Ok(Box::new(move |mut registry: RepoRegistry| {
        if !overwrite && registry.repositories.contains_key(&repo.name) {
            return Err(RegistryError::RepositoryAlreadyExists(repo.name.clone()));
        }
        registry.repositories.insert(repo.name.clone(), repo.clone());
        Ok(registry)
    }))
}

/// Remove repository from registry.
///
/// # Errors
///
/// - Return [`RegistryError::InvalidRepositoryName`] for a malformed name.
/// - The returned modification fails with
///   [`RegistryError::RepositoryUnknown`] if the name is not registered.
pub fn remove_repository(name: impl Into<String>) -> Result<RegistryModification> {
    let name = name.into();
    if !is_valid_repository_name(&name) {
        return Err(RegistryError::InvalidRepositoryName(name));
    }

    Ok(Box::new(move |mut registry: RepoRegistry| {
        if registry.repositories.remove(&name).is_none() {
            return Err(RegistryError::RepositoryUnknown(name.clone()));
        }
        Ok(registry)
    }))
}

/// Store basic credentials for a remote.
///
/// # Errors
///
/// - Return [`RegistryError::InvalidUrl`] for an empty URL.
/// - Return [`RegistryError::Json`] if credentials cannot be serialized.
pub fn store_repo_auth(url: impl AsRef<str>, pair: &AuthPair) -> Result<RegistryModification> {
    let url = normalize_url(url);
    if url.is_empty() {
        return Err(RegistryError::InvalidUrl(url));
    }
    let auth = Auth::encode(pair)?;

    Ok(Box::new(move |mut registry: RepoRegistry| {
        registry.auths.insert(url.clone(), auth.clone());
        Ok(registry)
    }))
}

/// Registry access through a backing store.
#[derive(Debug, Clone)]
pub struct Registry<S = AnyStore>
where
    S: RegistryStore,
{
    store: S,
}

impl<S> Registry<S>
where
    S: RegistryStore,
{
    /// Construct new registry on top of a backing store.
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Backing store of this registry.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Read current registry.
    ///
    /// # Errors
    ///
    /// - Return [`RegistryError::Store`] if the store cannot be read.
    pub fn read(&self) -> Result<RepoRegistry> {
        Ok(self.store.read_registry()?.registry)
    }

    /// Apply modifications in order and commit them in one write.
    ///
    /// Skips the write entirely if the modifications leave the registry
    /// unchanged. Returns the committed registry.
    ///
    /// # Errors
    ///
    /// - Return the first error raised by a modification; nothing is written.
    /// - Return [`RegistryError::Contention`] if the registry kept changing
    ///   underneath for [`MAX_UPDATE_ATTEMPTS`] attempts.
    /// - Return [`RegistryError::Store`] if the store fails otherwise.
    #[instrument(skip(self, modifications), level = "debug")]
    pub fn update(
        &self,
        modifications: impl IntoIterator<Item = RegistryModification>,
    ) -> Result<RepoRegistry> {
        let modifications = modifications.into_iter().collect::<Vec<_>>();

        for attempt in 1..=MAX_UPDATE_ATTEMPTS {
            let snapshot = self.store.read_registry()?;
            let mut registry = snapshot.registry.clone();
            for modification in &modifications {
                registry = modification(registry)?;
            }

            if registry == snapshot.registry {
                debug!("registry unchanged, skipping write");
                return Ok(registry);
            }

            match self.store.compare_and_write(&registry, snapshot.revision) {
                Ok(()) => {
                    info!("updated registry");
                    debug!("new registry: {registry}");
                    return Ok(registry);
                }
                Err(StoreError::StaleRegistry) => {
                    warn!("registry changed during update, retrying (attempt {attempt})");
                }
                Err(err) => return Err(err.into()),
            }
        }

        Err(RegistryError::Contention {
            attempts: MAX_UPDATE_ATTEMPTS,
        })
    }

    /// Look up repository by name.
    ///
    /// # Errors
    ///
    /// - Return [`RegistryError::RepositoryUnknown`] if not registered.
    pub fn get_repository(&self, name: &str) -> Result<Repository> {
        Ok(self.read()?.get(name)?.clone())
    }

    /// List all registered repositories ordered by name.
    ///
    /// # Errors
    ///
    /// - Return [`RegistryError::Store`] if the store cannot be read.
    pub fn list_repositories(&self) -> Result<Vec<Repository>> {
        Ok(self.read()?.list())
    }

    /// Check whether credentials are stored for a remote.
    ///
    /// # Errors
    ///
    /// - Return [`RegistryError::Store`] if the store cannot be read.
    pub fn repo_auth_exists(&self, url: &str) -> Result<bool> {
        Ok(self.read()?.auths.contains_key(&normalize_url(url)))
    }
}

/// All possible error types for registry interaction.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Repository name does not match [`REPOSITORY_NAME_PATTERN`].
    #[error("invalid repository name {0:?}: only lowercase letters (a-z) and '-' are allowed")]
    InvalidRepositoryName(String),

    /// Repository URL is empty or has no usable path segment.
    #[error("repository must have a valid url, got {0:?}")]
    InvalidUrl(String),

    /// Repository name is not registered.
    #[error("repository {0:?} is unknown")]
    RepositoryUnknown(String),

    /// Repository name is already registered.
    #[error("repository {0:?} is already configured")]
    RepositoryAlreadyExists(String),

    /// Stored credentials cannot be decoded.
    #[error("stored credentials for {url:?} are malformed: {reason}")]
    MalformedAuth { url: String, reason: String },

    /// Registry kept changing concurrently.
    #[error("registry update lost to concurrent writers {attempts} times in a row")]
    Contention { attempts: usize },

    /// Credentials cannot be serialized.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Backing store fails.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Friendly result alias :3
type Result<T, E = RegistryError> = std::result::Result<T, E>;
