// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Git cache.
//!
//! Materialize concept repositories inside the local cache. Each repository
//! lives in its own working copy below the cache root, and is kept current
//! through single-branch clones and fast-forward pulls.
//!
//! # Validity
//!
//! A freshly cloned working copy must carry a repository index file named
//! [`REPO_INDEX_FILE`] at its top-level. Clones without a readable index are
//! not concept repositories, so they are removed again right away.
//!
//! # Locking
//!
//! Clone and pull of one working copy are serialized across processes
//! through a hidden lock file next to it, e.g., `.demo-concepts.lock`.
//!
//! # Ownership
//!
//! An existing working copy is only reused when its `origin` points at the
//! requested remote and it reflects the requested ref. A working copy of
//! another remote is a [`GitError::CacheConflict`]. A working copy of the
//! same remote at another ref is cloned again.

use crate::{
    path::{lock_exclusive, lock_file_for},
    registry::{normalize_url, AuthPair},
    repository::RepoIndex,
};

use auth_git2::GitAuthenticator;
use git2::{
    build::{CheckoutBuilder, RepoBuilder},
    Config, ErrorCode, FetchOptions, RemoteCallbacks, Repository,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::{
    fs::{read, remove_dir_all},
    path::{Path, PathBuf},
    time,
};
use tracing::{debug, info, instrument, warn};

/// File name of the repository index at a repository's top-level.
pub const REPO_INDEX_FILE: &str = "kable.json";

/// Remote name of every cached working copy.
const ORIGIN: &str = "origin";

/// Local git configuration entry recording the ref a working copy tracks.
const TRACKED_REF_KEY: &str = "kable.ref";

/// Describe one working copy that should exist.
#[derive(Debug, Clone, Copy)]
pub struct CheckoutRequest<'a> {
    /// Git remote URL.
    pub url: &'a str,

    /// Ref to check out, e.g., `refs/heads/master`.
    pub git_ref: &'a str,

    /// Location of working copy.
    pub path: &'a Path,

    /// Basic credentials for the remote.
    pub auth: Option<&'a AuthPair>,

    /// Pull latest changes if working copy already exists.
    pub pull: bool,
}

/// What [`GitAccess::ensure_checkout`] had to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckoutOutcome {
    /// Working copy did not exist, and was cloned.
    Cloned,

    /// Working copy existed, and was fast-forwarded.
    Pulled,

    /// Working copy existed, and remote had no new changes.
    UpToDate,

    /// Working copy existed, and was left untouched.
    Present,
}

/// Layer of indirection for git cache access.
pub trait GitAccess: Send + Sync {
    /// Clone working copy if absent, optionally pull it if present.
    fn ensure_checkout(&self, request: &CheckoutRequest<'_>) -> Result<CheckoutOutcome>;
}

/// Git cache access through libgit2.
#[derive(Debug, Default, Clone)]
pub struct Git2Cache {
    progress: bool,
}

impl Git2Cache {
    /// Construct new git cache access without progress output.
    pub fn new() -> Self {
        Self::default()
    }

    /// Display transfer progress of clones and pulls on the terminal.
    pub fn with_progress(mut self) -> Self {
        self.progress = true;
        self
    }

    fn progress_bar(&self, url: &str) -> Result<ProgressBar> {
        if !self.progress {
            return Ok(ProgressBar::hidden());
        }

        let bar = ProgressBar::no_length();
        let style = ProgressStyle::with_template(
            "{elapsed_precise:.green}  {msg:<50}  [{wide_bar:.yellow/blue}]",
        )?
        .progress_chars("-Cco.");
        bar.set_style(style);
        bar.set_message(url.to_string());
        bar.enable_steady_tick(time::Duration::from_millis(100));
        Ok(bar)
    }

    #[instrument(skip(self, request), level = "debug")]
    fn clone_fresh(&self, request: &CheckoutRequest<'_>) -> Result<()> {
        info!("clone {} into {:?}", request.url, request.path.display());
        let bar = self.progress_bar(request.url)?;
        let authenticator = authenticator(request.auth);
        let config = git_config()?;

        let mut fo = FetchOptions::new();
        fo.remote_callbacks(remote_callbacks(&authenticator, &config, &bar));

        let mut builder = RepoBuilder::new();
        builder.fetch_options(fo);
        if let Some(branch) = request.git_ref.strip_prefix("refs/heads/") {
            let refspec = format!("+refs/heads/{branch}:refs/remotes/{ORIGIN}/{branch}");
            builder.branch(branch);
            builder.remote_create(move |repo, name, url| repo.remote_with_fetch(name, url, &refspec));
        }

        let result = builder.clone(request.url, request.path);
        bar.finish_and_clear();
        let repository = match result {
            Ok(repository) => repository,
            Err(err) => {
                discard(request.path);
                return Err(classify(request.url, err, GitOperation::Clone));
            }
        };

        if let Err(err) = track_ref(&repository, request.git_ref) {
            discard(request.path);
            return Err(err);
        }

        if let Err(reason) = validate_index(request.path) {
            warn!(
                "{} is not a concept repository, removing clone at {:?}",
                request.url,
                request.path.display()
            );
            discard(request.path);
            return Err(GitError::RepositoryInvalid {
                url: request.url.to_string(),
                reason,
            });
        }

        Ok(())
    }

    #[instrument(skip(self, request), level = "debug")]
    fn pull(&self, request: &CheckoutRequest<'_>) -> Result<CheckoutOutcome> {
        debug!("pull {} into {:?}", request.git_ref, request.path.display());
        let repository = Repository::open(request.path).map_err(|_| GitError::PathOccupied {
            path: request.path.to_path_buf(),
        })?;

        let bar = self.progress_bar(request.url)?;
        let authenticator = authenticator(request.auth);
        let config = git_config()?;
        let mut fo = FetchOptions::new();
        fo.remote_callbacks(remote_callbacks(&authenticator, &config, &bar));

        let mut remote = repository.find_remote(ORIGIN)?;
        let result = remote.fetch(&[request.git_ref], Some(&mut fo), None);
        bar.finish_and_clear();
        result.map_err(|err| classify(request.url, err, GitOperation::Pull))?;

        let fetch_head = repository.find_reference("FETCH_HEAD")?;
        let commit = repository.reference_to_annotated_commit(&fetch_head)?;
        let (analysis, _) = repository.merge_analysis(&[&commit])?;

        if analysis.is_up_to_date() {
            debug!("{} is up to date", request.url);
            return Ok(CheckoutOutcome::UpToDate);
        }

        if !analysis.is_fast_forward() {
            return Err(GitError::NonFastForward {
                url: request.url.to_string(),
                git_ref: request.git_ref.to_string(),
            });
        }

        if request.git_ref.starts_with("refs/heads/") {
            let mut reference = repository.find_reference(request.git_ref)?;
            reference.set_target(commit.id(), "kable: fast-forward")?;
            repository.set_head(request.git_ref)?;
        } else {
            repository.set_head_detached(commit.id())?;
        }
        repository.checkout_head(Some(CheckoutBuilder::default().force()))?;
        info!("fast-forwarded {} to {}", request.url, commit.id());

        Ok(CheckoutOutcome::Pulled)
    }
}

impl GitAccess for Git2Cache {
    #[instrument(skip(self, request), level = "debug")]
    fn ensure_checkout(&self, request: &CheckoutRequest<'_>) -> Result<CheckoutOutcome> {
        let lock_path = lock_file_for(request.path);
        let _lock = lock_exclusive(&lock_path).map_err(|source| GitError::Lock {
            source,
            path: lock_path.clone(),
        })?;

        // INVARIANT: Only an existing directory with content counts as present.
        let present = request
            .path
            .read_dir()
            .map(|mut entries| entries.next().is_some())
            .unwrap_or(false);

        if !present {
            self.clone_fresh(request)?;
            return Ok(CheckoutOutcome::Cloned);
        }

        if request.path.join(".git").exists() {
            let repository = Repository::open(request.path).map_err(|_| GitError::PathOccupied {
                path: request.path.to_path_buf(),
            })?;

            let found = origin_url(&repository)?;
            if normalize_url(&found) != normalize_url(request.url) {
                return Err(GitError::CacheConflict {
                    path: request.path.to_path_buf(),
                    url: request.url.to_string(),
                    found,
                });
            }

            let tracked = tracked_ref(&repository)?;
            if tracked.as_deref() != Some(request.git_ref) {
                info!(
                    "working copy at {:?} tracks {tracked:?} instead of {}, cloning again",
                    request.path.display(),
                    request.git_ref
                );
                drop(repository);
                discard(request.path);
                self.clone_fresh(request)?;
                return Ok(CheckoutOutcome::Cloned);
            }

            if request.pull {
                return self.pull(request);
            }
            return Ok(CheckoutOutcome::Present);
        }

        Err(GitError::PathOccupied {
            path: request.path.to_path_buf(),
        })
    }
}

fn authenticator(auth: Option<&AuthPair>) -> GitAuthenticator {
    // Credential prompts are left to callers, who see GitError::Authentication.
    let authenticator = GitAuthenticator::default().try_password_prompt(0);
    match auth {
        Some(pair) => authenticator.add_plaintext_credentials("*", &pair.username, &pair.password),
        None => authenticator,
    }
}

fn git_config() -> Result<Config> {
    Ok(Config::open_default().or_else(|_| Config::new())?)
}

fn remote_callbacks<'a>(
    authenticator: &'a GitAuthenticator,
    config: &'a Config,
    bar: &'a ProgressBar,
) -> RemoteCallbacks<'a> {
    let mut throttle = time::Instant::now();
    let mut rc = RemoteCallbacks::new();
    rc.credentials(authenticator.credentials(config));
    rc.transfer_progress(move |progress| {
        if throttle.elapsed() > time::Duration::from_millis(10) {
            throttle = time::Instant::now();
            bar.set_length(progress.total_objects() as u64);
            bar.set_position(progress.received_objects() as u64);
        }
        true
    });
    rc
}

fn track_ref(repository: &Repository, git_ref: &str) -> Result<()> {
    if !git_ref.starts_with("refs/heads/") {
        detach_at(repository, git_ref)?;
    }
    repository.config()?.set_str(TRACKED_REF_KEY, git_ref)?;
    Ok(())
}

fn origin_url(repository: &Repository) -> Result<String> {
    match repository.find_remote(ORIGIN) {
        Ok(remote) => Ok(remote.url().unwrap_or_default().to_string()),
        Err(err) if err.code() == ErrorCode::NotFound => Ok(String::new()),
        Err(err) => Err(err.into()),
    }
}

/// Ref the working copy reflects: the checked out branch, or the recorded
/// ref of a detached head.
fn tracked_ref(repository: &Repository) -> Result<Option<String>> {
    let head = match repository.head() {
        Ok(head) => head,
        Err(err) if err.code() == ErrorCode::UnbornBranch => return Ok(None),
        Err(err) => return Err(err.into()),
    };

    if head.is_branch() {
        return Ok(head.name().map(ToString::to_string));
    }

    match repository.config()?.get_string(TRACKED_REF_KEY) {
        Ok(git_ref) => Ok(Some(git_ref)),
        Err(err) if err.code() == ErrorCode::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn detach_at(repository: &Repository, git_ref: &str) -> Result<()> {
    let object = repository.revparse_single(git_ref)?;
    let commit = object.peel_to_commit()?;
    repository.checkout_tree(commit.as_object(), Some(CheckoutBuilder::default().force()))?;
    repository.set_head_detached(commit.id())?;
    Ok(())
}

fn validate_index(path: &Path) -> std::result::Result<(), String> {
    let index_path = path.join(REPO_INDEX_FILE);
    let data = read(&index_path).map_err(|err| format!("cannot read {REPO_INDEX_FILE}: {err}"))?;
    serde_json::from_slice::<RepoIndex>(&data)
        .map(|_| ())
        .map_err(|err| format!("malformed {REPO_INDEX_FILE}: {err}"))
}

fn discard(path: &Path) {
    if path.exists() {
        if let Err(err) = remove_dir_all(path) {
            warn!("failed to remove {:?}: {err}", path.display());
        }
    }
}

enum GitOperation {
    Clone,
    Pull,
}

fn classify(url: &str, err: git2::Error, operation: GitOperation) -> GitError {
    let message = err.message().to_lowercase();
    let auth_related = err.code() == ErrorCode::Auth
        || ["auth", "credential", "status code: 401", "status code: 403"]
            .iter()
            .any(|needle| message.contains(needle));

    let url = url.to_string();
    match (auth_related, operation) {
        (true, _) => GitError::Authentication { url, source: err },
        (false, GitOperation::Clone) => GitError::Clone { url, source: err },
        (false, GitOperation::Pull) => GitError::Pull { url, source: err },
    }
}

/// All possible error types for git cache interaction.
#[derive(Debug, thiserror::Error)]
pub enum GitError {
    /// Remote rejected or asked for credentials.
    #[error("authentication failed for {url}")]
    Authentication {
        url: String,
        #[source]
        source: git2::Error,
    },

    /// Remote cannot be cloned.
    #[error("failed to clone {url}")]
    Clone {
        url: String,
        #[source]
        source: git2::Error,
    },

    /// Remote cannot be fetched.
    #[error("failed to pull {url}")]
    Pull {
        url: String,
        #[source]
        source: git2::Error,
    },

    /// Local history diverged from remote ref.
    #[error("cannot fast-forward {git_ref} of {url}")]
    NonFastForward { url: String, git_ref: String },

    /// Cloned content is not a concept repository.
    #[error("{url} is not a valid concept repository: {reason}")]
    RepositoryInvalid { url: String, reason: String },

    /// Cache path holds a working copy of another remote.
    #[error("cache path {:?} holds {found:?}, not {url}", path.display())]
    CacheConflict {
        path: PathBuf,
        url: String,
        found: String,
    },

    /// Cache path holds something that is not a git working copy.
    #[error("cache path {:?} holds unrelated content", path.display())]
    PathOccupied { path: PathBuf },

    /// Cache lock cannot be acquired.
    #[error("failed to lock cache through {:?}", path.display())]
    Lock {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Style template cannot be set for progress bars.
    #[error(transparent)]
    IndicatifStyleTemplate(#[from] indicatif::style::TemplateError),

    /// Operations from libgit2 fail.
    #[error(transparent)]
    Git2(#[from] git2::Error),
}

/// Friendly result alias :3
type Result<T, E = GitError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use git2::ErrorClass;
    use simple_test_case::test_case;

    #[test_case(ErrorCode::Auth, "remote rejected", true; "auth code")]
    #[test_case(ErrorCode::GenericError, "too many redirects or authentication replays", true; "auth message")]
    #[test_case(ErrorCode::GenericError, "unexpected http status code: 401", true; "unauthorized status")]
    #[test_case(ErrorCode::GenericError, "failed to resolve address", false; "network")]
    #[test]
    fn authentication_failures_are_distinct(code: ErrorCode, message: &str, expect: bool) {
        let err = git2::Error::new(code, ErrorClass::Http, message);
        let result = classify("https://github.com/org/private", err, GitOperation::Clone);
        assert_eq!(matches!(result, GitError::Authentication { .. }), expect);
    }

    #[test]
    fn occupied_cache_path_is_rejected() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("demo-concepts");
        std::fs::create_dir_all(&path)?;
        std::fs::write(path.join("notes.txt"), "not a repository")?;

        let result = Git2Cache::new().ensure_checkout(&CheckoutRequest {
            url: "file:///nowhere/demo-concepts",
            git_ref: "refs/heads/master",
            path: &path,
            auth: None,
            pull: false,
        });
        assert!(matches!(result, Err(GitError::PathOccupied { .. })));
        assert!(path.join("notes.txt").exists());

        Ok(())
    }

    #[test]
    fn failed_clone_leaves_no_directory() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("missing");

        let result = Git2Cache::new().ensure_checkout(&CheckoutRequest {
            url: &format!("file://{}", dir.path().join("no-such-remote").display()),
            git_ref: "refs/heads/master",
            path: &path,
            auth: None,
            pull: false,
        });
        assert!(matches!(result, Err(GitError::Clone { .. })));
        assert!(!path.exists());

        Ok(())
    }
}
