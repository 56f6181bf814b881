//! Background clone workers, one per cached URL.
//!
//! Each `CloneEntry` owns exactly one clone attempt. The attempt runs on the
//! blocking pool and moves the entry from `Pending` to `Ready` or `Failed`
//! exactly once; the state lives in a `watch` channel whose only sender is
//! the worker, so every `CloneSignal` observes the same terminal state.
//!
//! Every successful clone is normalized before it is published:
//! 1. HEAD is detached at the commit it pointed to
//! 2. local branches and their `branch.<name>.*` config are deleted
//! 3. any remaining `refs/heads/*` reference is deleted
//!
//! Without this, a local `master` shadows `refs/remotes/origin/master` and
//! later checkouts of `master` would bind to the stale clone-time tip.

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use git2::build::RepoBuilder;
use git2::{AutotagOption, BranchType, ConfigLevel, ErrorCode, FetchOptions, Repository};
use tokio::sync::watch;

use crate::auth::{Credential, RemoteOptions, remote_callbacks};
use crate::error::{Result, StoreError};
use crate::snapshot::{Snapshot, Workdir, fetch_origin, force_checkout};

use super::cache_key;

const LOCAL_BRANCH_PREFIX: &str = "refs/heads/";
const BRANCH_CONFIG_KEYS: [&str; 4] = ["remote", "merge", "rebase", "pushRemote"];

/// Where a clone is written.
#[derive(Debug, Clone)]
pub(crate) enum Destination {
    /// A temporary directory removed with the snapshot.
    Ephemeral,
    /// A caller-chosen directory, reused if it already holds this clone.
    Directory(PathBuf),
}

#[derive(Debug, Clone)]
pub enum CloneState {
    Pending,
    Ready(Arc<Snapshot>),
    Failed(Arc<StoreError>),
}

impl CloneState {
    pub fn is_pending(&self) -> bool {
        matches!(self, CloneState::Pending)
    }
}

pub type CloneOutcome = std::result::Result<Arc<Snapshot>, Arc<StoreError>>;

/// Completion signal for one clone attempt. Cheap to clone; every copy
/// resolves to the same outcome.
#[derive(Debug, Clone)]
pub struct CloneSignal {
    state: watch::Receiver<CloneState>,
}

impl CloneSignal {
    /// Waits until the clone has reached a terminal state.
    pub async fn wait(mut self) -> CloneOutcome {
        let terminal = self
            .state
            .wait_for(|state| !state.is_pending())
            .await
            .map(|state| state.clone());

        match terminal {
            Ok(CloneState::Ready(snapshot)) => Ok(snapshot),
            Ok(CloneState::Failed(error)) => Err(error),
            // The worker never leaves `Pending` behind unless it panicked.
            Ok(CloneState::Pending) | Err(_) => Err(Arc::new(StoreError::Internal(
                "clone worker exited before completing".to_string(),
            ))),
        }
    }
}

#[derive(Debug)]
pub struct CloneEntry {
    url: String,
    key: String,
    credential: Arc<RwLock<Credential>>,
    state: watch::Receiver<CloneState>,
}

impl CloneEntry {
    /// Registers a new entry and starts its clone on the blocking pool.
    /// Must be called from within a tokio runtime.
    pub(crate) fn spawn(
        url: String,
        key: String,
        credential: Credential,
        destination: Destination,
        options: RemoteOptions,
    ) -> Arc<Self> {
        let (sender, state) = watch::channel(CloneState::Pending);
        let credential = Arc::new(RwLock::new(credential));

        let job = CloneJob {
            url: url.clone(),
            credential: Arc::clone(&credential),
            destination,
            options,
        };
        tokio::task::spawn_blocking(move || {
            sender.send_replace(job.run());
        });

        Arc::new(Self {
            url,
            key,
            credential,
            state,
        })
    }

    /// Locator of the request that started the clone.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Normalized locator the entry is cached under.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Current state, without waiting.
    pub fn state(&self) -> CloneState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> CloneSignal {
        CloneSignal {
            state: self.state.clone(),
        }
    }

    /// Swaps the credential used by the clone and by later fetches.
    pub(crate) fn set_credential(&self, credential: Credential) -> Result<()> {
        let mut current = self.credential.write().map_err(|_| StoreError::poisoned())?;
        if *current != credential {
            tracing::debug!(url = %self.url, "refreshing repository credential");
            *current = credential;
        }
        Ok(())
    }
}

struct CloneJob {
    url: String,
    credential: Arc<RwLock<Credential>>,
    destination: Destination,
    options: RemoteOptions,
}

impl CloneJob {
    fn run(self) -> CloneState {
        let start = Instant::now();
        let url = self.url.clone();
        tracing::info!(%url, "cloning repository");

        match self.clone_and_normalize() {
            Ok(snapshot) => {
                tracing::info!(%url, "repository ready in {:?}", start.elapsed());
                CloneState::Ready(Arc::new(snapshot))
            }
            Err(e) => {
                tracing::warn!(%url, "clone failed after {:?}: {e}", start.elapsed());
                CloneState::Failed(Arc::new(e))
            }
        }
    }

    fn clone_and_normalize(self) -> Result<Snapshot> {
        let credential = self
            .credential
            .read()
            .map_err(|_| StoreError::poisoned())?
            .clone();

        let (repo, workdir) = match &self.destination {
            Destination::Ephemeral => {
                let dir = tempfile::Builder::new().prefix("repo-cache-").tempdir()?;
                let repo = clone_into(&self.url, dir.path(), credential, self.options)?;
                (repo, Workdir::ephemeral(dir))
            }
            Destination::Directory(path) if path.join(".git").exists() => {
                let repo = reopen(&self.url, path, credential, self.options)?;
                (repo, Workdir::persistent(path.clone()))
            }
            Destination::Directory(path) => {
                std::fs::create_dir_all(path)?;
                let repo = clone_into(&self.url, path, credential, self.options)?;
                (repo, Workdir::persistent(path.clone()))
            }
        };

        normalize(&repo).map_err(|source| StoreError::Normalize {
            url: self.url.clone(),
            source,
        })?;

        Ok(Snapshot::new(self.url, workdir, self.credential, self.options))
    }
}

fn clone_into(url: &str, path: &Path, credential: Credential, options: RemoteOptions) -> Result<Repository> {
    let mut fetch_options = FetchOptions::new();
    fetch_options.remote_callbacks(remote_callbacks(credential, options));
    fetch_options.download_tags(AutotagOption::All);

    RepoBuilder::new()
        .fetch_options(fetch_options)
        .clone(url, path)
        .map_err(|source| StoreError::Clone {
            url: url.to_string(),
            source,
        })
}

/// Reuses a clone left in `path` by an earlier store, provided its origin
/// normalizes to the same key as `url`.
fn reopen(url: &str, path: &Path, credential: Credential, options: RemoteOptions) -> Result<Repository> {
    let clone_error = |source| StoreError::Clone {
        url: url.to_string(),
        source,
    };

    let repo = Repository::open(path).map_err(clone_error)?;
    let origin_url = repo
        .find_remote("origin")
        .map_err(clone_error)?
        .url()
        .map(str::to_string);
    if origin_url.as_deref().map(cache_key) != Some(cache_key(url)) {
        return Err(clone_error(git2::Error::from_str(&format!(
            "{} already holds a clone of {}",
            path.display(),
            origin_url.as_deref().unwrap_or("an unknown remote"),
        ))));
    }

    tracing::debug!(url, path = %path.display(), "reusing existing clone");
    fetch_origin(&repo, url, credential, options)?;
    Ok(repo)
}

pub(crate) fn normalize(repo: &Repository) -> std::result::Result<(), git2::Error> {
    checkout_head_hash(repo)?;
    clean_local_branches(repo)?;
    clean_local_references(repo)
}

fn checkout_head_hash(repo: &Repository) -> std::result::Result<(), git2::Error> {
    let head = repo.head()?.peel_to_commit()?.id();
    force_checkout(repo, head)
}

fn clean_local_branches(repo: &Repository) -> std::result::Result<(), git2::Error> {
    let mut config = repo.config()?.open_level(ConfigLevel::Local)?;
    let branches = repo
        .branches(Some(BranchType::Local))?
        .map(|branch| branch.map(|(branch, _)| branch))
        .collect::<std::result::Result<Vec<_>, _>>()?;

    for mut branch in branches {
        if let Some(name) = branch.name()?.map(str::to_string) {
            for key in BRANCH_CONFIG_KEYS {
                match config.remove(&format!("branch.{name}.{key}")) {
                    Ok(()) => {}
                    Err(e) if e.code() == ErrorCode::NotFound => {}
                    Err(e) => return Err(e),
                }
            }
        }
        branch.delete()?;
    }
    Ok(())
}

fn clean_local_references(repo: &Repository) -> std::result::Result<(), git2::Error> {
    let names = repo
        .references()?
        .names()
        .map(|name| name.map(str::to_string))
        .collect::<std::result::Result<Vec<_>, _>>()?;

    for name in names.iter().filter(|name| name.starts_with(LOCAL_BRANCH_PREFIX)) {
        repo.find_reference(name)?.delete()?;
    }
    Ok(())
}
