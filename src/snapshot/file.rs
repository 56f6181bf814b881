//! File handles returned by snapshot queries.
//!
//! A `FileHandle` pins one path at the commit it was resolved against. It
//! never changes afterwards, even if the snapshot is checked out elsewhere:
//! contents are read from the object database by blob id, and the history
//! summary is anchored at the pinned commit.

use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, FixedOffset};
use git2::{BlameOptions, FileMode, Oid};
use serde::Serialize;

use crate::error::{Result, StoreError};
use crate::snapshot::{Workdir, git_time};

/// Metadata of the most recently dated line of a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileLog {
    pub date: DateTime<FixedOffset>,
    pub hash: String,
    pub author: String,
    pub email: String,
    pub message: String,
}

#[derive(Clone)]
pub struct FileHandle {
    path: String,
    id: Oid,
    mode: i32,
    commit: Oid,
    workdir: Arc<Workdir>,
    log: Arc<OnceLock<Option<FileLog>>>,
}

impl FileHandle {
    pub(crate) fn new(path: String, id: Oid, mode: i32, commit: Oid, workdir: Arc<Workdir>) -> Self {
        Self {
            path,
            id,
            mode,
            commit,
            workdir,
            log: Arc::new(OnceLock::new()),
        }
    }

    /// Repository-relative path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Blob id of the contents.
    pub fn id(&self) -> Oid {
        self.id
    }

    /// Commit the handle was resolved against.
    pub fn commit(&self) -> Oid {
        self.commit
    }

    /// Raw git file mode, e.g. `0o100644`.
    pub fn mode(&self) -> i32 {
        self.mode
    }

    pub fn is_symlink(&self) -> bool {
        self.mode == i32::from(FileMode::Link)
    }

    pub fn bytes(&self) -> Result<Vec<u8>> {
        let repo = self.workdir.open()?;
        let blob = repo.find_blob(self.id)?;
        Ok(blob.content().to_vec())
    }

    /// Contents decoded as UTF-8, failing with `StoreError::Content` when the
    /// blob is not text.
    pub fn try_contents(&self) -> Result<String> {
        String::from_utf8(self.bytes()?).map_err(|source| StoreError::Content {
            path: self.path.clone(),
            source,
        })
    }

    /// Best-effort text contents.
    ///
    /// Returns an empty string when the blob cannot be read or is not valid
    /// UTF-8, so binary files and empty files look the same here. Use
    /// `try_contents` to tell them apart.
    pub fn contents(&self) -> String {
        match self.try_contents() {
            Ok(contents) => contents,
            Err(e) => {
                tracing::debug!(path = %self.path, "returning empty contents: {e}");
                String::new()
            }
        }
    }

    /// Who last touched this file, as of the pinned commit.
    ///
    /// Computed once per handle. A blame failure is logged and yields `None`,
    /// the same as a file with no lines.
    pub fn file_log(&self) -> Option<FileLog> {
        self.log
            .get_or_init(|| match self.newest_line() {
                Ok(log) => log,
                Err(e) => {
                    tracing::warn!(path = %self.path, commit = %self.commit, "failed to fetch git blame: {e}");
                    None
                }
            })
            .clone()
    }

    fn newest_line(&self) -> Result<Option<FileLog>> {
        let repo = self.workdir.open()?;
        let mut options = BlameOptions::new();
        options.newest_commit(self.commit);
        let blame = repo.blame_file(Path::new(&self.path), Some(&mut options))?;

        let mut seen = HashSet::new();
        let mut newest: Option<FileLog> = None;
        for hunk in blame.iter() {
            // libgit2 reports a single zero-line hunk for an empty blob.
            if hunk.lines_in_hunk() == 0 {
                continue;
            }
            let id = hunk.final_commit_id();
            if !seen.insert(id) {
                continue;
            }

            let commit = repo.find_commit(id)?;
            let author = commit.author();
            let date = git_time(author.when())?;
            if newest.as_ref().is_some_and(|log| log.date >= date) {
                continue;
            }

            newest = Some(FileLog {
                date,
                hash: id.to_string(),
                author: author.name().unwrap_or("Unknown").to_string(),
                email: author.email().unwrap_or("").to_string(),
                message: commit.message().unwrap_or("").trim().to_string(),
            });
        }
        Ok(newest)
    }
}

impl fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileHandle")
            .field("path", &self.path)
            .field("id", &self.id)
            .field("mode", &format_args!("{:o}", self.mode))
            .field("commit", &self.commit)
            .finish()
    }
}
