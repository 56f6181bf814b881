//! Snapshot accessor over one cloned repository.
//!
//! A `Snapshot` is shared by every caller that asked the store for the same
//! URL. It always sits in a detached state and is moved around with
//! `checkout`, which fetches first and then resolves the revision:
//! 1. as written (hashes, tags, fully qualified ref names)
//! 2. as `refs/remotes/origin/<revision>` (bare branch names)
//!
//! Locking: `fetch` and `checkout` hold the write lock for their whole
//! duration; queries hold the read lock while they resolve HEAD. Handles
//! returned by queries read from the object database afterwards and need no
//! lock.

mod file;
mod pattern;

pub use file::{FileHandle, FileLog};

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

use chrono::{DateTime, FixedOffset};
use git2::build::CheckoutBuilder;
use git2::{
    AutotagOption, Commit, FetchOptions, FileMode, ObjectType, Oid, Repository, TreeWalkMode,
    TreeWalkResult,
};

use crate::auth::{Credential, RemoteOptions, remote_callbacks};
use crate::error::{Result, StoreError};
use pattern::PathMatcher;

const ORIGIN: &str = "origin";
const REMOTE_BRANCH_PREFIX: &str = "refs/remotes/origin/";
const FETCH_REFSPECS: [&str; 2] = ["+refs/heads/*:refs/remotes/origin/*", "+refs/tags/*:refs/tags/*"];

/// Location of a clone on disk. An ephemeral clone owns its temporary
/// directory, which is removed once the last snapshot or file handle using
/// it is dropped.
#[derive(Debug)]
pub(crate) struct Workdir {
    path: PathBuf,
    _ephemeral: Option<tempfile::TempDir>,
}

impl Workdir {
    pub fn persistent(path: PathBuf) -> Self {
        Self {
            path,
            _ephemeral: None,
        }
    }

    pub fn ephemeral(dir: tempfile::TempDir) -> Self {
        Self {
            path: dir.path().to_path_buf(),
            _ephemeral: Some(dir),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn open(&self) -> Result<Repository> {
        Ok(Repository::open(&self.path)?)
    }
}

pub struct Snapshot {
    url: String,
    workdir: RwLock<Arc<Workdir>>,
    credential: Arc<RwLock<Credential>>,
    options: RemoteOptions,
}

impl Snapshot {
    pub(crate) fn new(
        url: String,
        workdir: Workdir,
        credential: Arc<RwLock<Credential>>,
        options: RemoteOptions,
    ) -> Self {
        Self {
            url,
            workdir: RwLock::new(Arc::new(workdir)),
            credential,
            options,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Directory holding the working tree.
    pub fn path(&self) -> Result<PathBuf> {
        Ok(self.read()?.path().to_path_buf())
    }

    /// Fetches all branches and tags from origin, force-updating refs.
    /// Does not move HEAD.
    pub fn fetch(&self) -> Result<()> {
        let workdir = self.write()?;
        self.fetch_locked(&workdir, None)
    }

    /// `fetch`, aborting the transfer once `deadline` has passed.
    ///
    /// A deadline already in the past fails without contacting the remote.
    /// Otherwise it is checked whenever libgit2 reports progress, which it
    /// does not do while connecting or negotiating refs; a remote that stalls
    /// there is not interrupted.
    pub fn fetch_with_deadline(&self, deadline: Instant) -> Result<()> {
        let workdir = self.write()?;
        self.fetch_locked(&workdir, Some(deadline))
    }

    /// Fetches, then force-checks-out `revision` in a detached state,
    /// discarding local modifications. Returns the commit now at HEAD.
    pub fn checkout(&self, revision: &str) -> Result<Oid> {
        self.checkout_inner(revision, None)
    }

    /// `checkout` whose implicit fetch is bounded by `deadline` as in
    /// `fetch_with_deadline`. HEAD does not move when the fetch fails.
    pub fn checkout_with_deadline(&self, revision: &str, deadline: Instant) -> Result<Oid> {
        self.checkout_inner(revision, Some(deadline))
    }

    fn checkout_inner(&self, revision: &str, deadline: Option<Instant>) -> Result<Oid> {
        let workdir = self.write()?;
        self.fetch_locked(&workdir, deadline)?;

        let repo = workdir.open()?;
        let id = resolve_revision(&repo, revision)?;
        force_checkout(&repo, id).map_err(|source| StoreError::Checkout {
            revision: revision.to_string(),
            source,
        })?;

        tracing::debug!(url = %self.url, revision, commit = %id, "checked out");
        Ok(id)
    }

    /// Resolves `revision` the same way `checkout` does, without fetching.
    pub fn resolve(&self, revision: &str) -> Result<Oid> {
        let workdir = self.read()?;
        resolve_revision(&workdir.open()?, revision)
    }

    pub fn head(&self) -> Result<Oid> {
        let workdir = self.read()?;
        Ok(head_commit(&workdir.open()?)?.id())
    }

    pub fn get_file(&self, path: &str) -> Result<FileHandle> {
        let workdir = self.read()?;
        let repo = workdir.open()?;
        let commit = head_commit(&repo)?;
        let tree = commit.tree()?;

        let entry = tree
            .get_path(Path::new(path))
            .map_err(|_| path_not_found(path))?;
        if entry.kind() != Some(ObjectType::Blob) {
            return Err(path_not_found(path));
        }

        Ok(FileHandle::new(
            path.to_string(),
            entry.id(),
            entry.filemode(),
            commit.id(),
            Arc::clone(&*workdir),
        ))
    }

    /// Every file reachable from HEAD, keyed by repository-relative path.
    ///
    /// A non-empty `sub_path` keeps only paths matching it as a glob.
    pub fn get_all_files(&self, sub_path: &str, ignore_symlinks: bool) -> Result<BTreeMap<String, FileHandle>> {
        let matcher = if sub_path.is_empty() {
            None
        } else {
            Some(PathMatcher::compile(sub_path)?)
        };

        let workdir = self.read()?;
        let repo = workdir.open()?;
        let commit = head_commit(&repo)?;
        let commit_id = commit.id();
        let tree = commit.tree()?;

        let mut files = BTreeMap::new();
        tree.walk(TreeWalkMode::PreOrder, |root, entry| {
            if entry.kind() != Some(ObjectType::Blob) {
                return TreeWalkResult::Ok;
            }
            let Some(name) = entry.name() else {
                return TreeWalkResult::Ok;
            };
            if ignore_symlinks && entry.filemode() == i32::from(FileMode::Link) {
                return TreeWalkResult::Ok;
            }

            let path = format!("{root}{name}");
            if matcher.as_ref().is_some_and(|m| !m.matches(&path)) {
                return TreeWalkResult::Ok;
            }

            let handle = FileHandle::new(
                path.clone(),
                entry.id(),
                entry.filemode(),
                commit_id,
                Arc::clone(&*workdir),
            );
            files.insert(path, handle);
            TreeWalkResult::Ok
        })?;

        Ok(files)
    }

    pub fn is_directory(&self, path: &str) -> Result<bool> {
        Ok(self.entry_mode(path)? == i32::from(FileMode::Tree))
    }

    /// True only for regular, non-executable files.
    pub fn is_file(&self, path: &str) -> Result<bool> {
        Ok(self.entry_mode(path)? == i32::from(FileMode::Blob))
    }

    /// Committer timestamp of the commit at HEAD.
    pub fn last_updated(&self) -> Result<DateTime<FixedOffset>> {
        let workdir = self.read()?;
        let repo = workdir.open()?;
        let commit = head_commit(&repo)?;
        git_time(commit.committer().when())
    }

    fn entry_mode(&self, path: &str) -> Result<i32> {
        let workdir = self.read()?;
        let repo = workdir.open()?;
        let tree = head_commit(&repo)?.tree()?;
        let entry = tree
            .get_path(Path::new(path))
            .map_err(|_| path_not_found(path))?;
        Ok(entry.filemode())
    }

    fn fetch_locked(&self, workdir: &Workdir, deadline: Option<Instant>) -> Result<()> {
        let credential = self
            .credential
            .read()
            .map_err(|_| StoreError::poisoned())?
            .clone();
        let options = RemoteOptions {
            deadline,
            ..self.options
        };
        fetch_origin(&workdir.open()?, &self.url, credential, options)
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Arc<Workdir>>> {
        self.workdir.read().map_err(|_| StoreError::poisoned())
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Arc<Workdir>>> {
        self.workdir.write().map_err(|_| StoreError::poisoned())
    }
}

impl std::fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Snapshot").field("url", &self.url).finish_non_exhaustive()
    }
}

/// Fetches every branch and tag from origin. An up-to-date remote is not an
/// error.
pub(crate) fn fetch_origin(
    repo: &Repository,
    url: &str,
    credential: Credential,
    options: RemoteOptions,
) -> Result<()> {
    let fetch_error = |source| StoreError::Fetch {
        url: url.to_string(),
        source,
    };

    if options.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
        return Err(fetch_error(git2::Error::from_str("deadline exceeded before fetch")));
    }

    let mut remote = repo.find_remote(ORIGIN).map_err(fetch_error)?;
    let mut fetch_options = FetchOptions::new();
    fetch_options.remote_callbacks(remote_callbacks(credential, options));
    fetch_options.download_tags(AutotagOption::All);

    remote
        .fetch(&FETCH_REFSPECS, Some(&mut fetch_options), None)
        .map_err(fetch_error)
}

/// Moves the working tree and HEAD to `id`, detached.
pub(crate) fn force_checkout(repo: &Repository, id: Oid) -> std::result::Result<(), git2::Error> {
    let commit = repo.find_commit(id)?;
    let mut builder = CheckoutBuilder::new();
    builder.force();
    repo.checkout_tree(commit.as_object(), Some(&mut builder))?;
    repo.set_head_detached(id)
}

fn resolve_revision(repo: &Repository, revision: &str) -> Result<Oid> {
    let peel = |revspec: &str| {
        repo.revparse_single(revspec)
            .and_then(|object| object.peel_to_commit())
            .map(|commit| commit.id())
    };

    peel(revision)
        .or_else(|_| peel(&format!("{REMOTE_BRANCH_PREFIX}{revision}")))
        .map_err(|source| StoreError::RefResolution {
            revision: revision.to_string(),
            source,
        })
}

fn head_commit(repo: &Repository) -> Result<Commit<'_>> {
    Ok(repo.head()?.peel_to_commit()?)
}

fn path_not_found(path: &str) -> StoreError {
    StoreError::PathNotFound {
        path: path.to_string(),
    }
}

pub(crate) fn git_time(time: git2::Time) -> Result<DateTime<FixedOffset>> {
    let offset = FixedOffset::east_opt(time.offset_minutes() * 60)
        .ok_or_else(|| StoreError::Internal(format!("invalid timezone offset {}", time.offset_minutes())))?;
    DateTime::from_timestamp(time.seconds(), 0)
        .map(|utc| utc.with_timezone(&offset))
        .ok_or_else(|| StoreError::Internal(format!("invalid timestamp {}", time.seconds())))
}
