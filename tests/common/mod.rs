//! Common test utilities: origin repositories built with git2 in temporary
//! directories and served over `file://`.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use git2::{ObjectType, Oid, Repository, RepositoryInitOptions, Signature, Time, TreeWalkMode, TreeWalkResult};
use repo_cache::{RepoRef, RepoStore, Snapshot, StoreConfig};
use tempfile::TempDir;

pub const AUTHOR: &str = "Fixture Author";
pub const EMAIL: &str = "author@example.com";
/// Commit timezone for every fixture commit, +02:00.
pub const OFFSET_MINUTES: i32 = 120;

pub const FIRST_COMMIT_TIME: i64 = 1_600_000_000;
pub const SECOND_COMMIT_TIME: i64 = 1_700_000_000;
pub const FEATURE_COMMIT_TIME: i64 = 1_650_000_000;

const MODE_FILE: i32 = 0o100644;
const MODE_EXECUTABLE: i32 = 0o100755;
const MODE_SYMLINK: i32 = 0o120000;
const MODE_TREE: i32 = 0o040000;

/// One change applied by `Fixture::commit`.
pub enum Change<'a> {
    Write(&'a str, &'a str),
    Executable(&'a str, &'a str),
    Symlink(&'a str, &'a str),
    Bytes(&'a str, &'a [u8]),
    Delete(&'a str),
}

/// A bare origin repository.
pub struct Fixture {
    repo: Repository,
    path: PathBuf,
    _dir: Option<TempDir>,
}

impl Fixture {
    /// Creates an empty origin in a fresh temporary directory.
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("origin.git");
        let mut fixture = Self::init_at(&path);
        fixture._dir = Some(dir);
        fixture
    }

    /// Creates an empty origin at `path`, owned by the caller.
    pub fn init_at(path: &Path) -> Self {
        let mut options = RepositoryInitOptions::new();
        options.bare(true).initial_head("master");
        let repo = Repository::init_opts(path, &options).unwrap();
        Self {
            repo,
            path: path.to_path_buf(),
            _dir: None,
        }
    }

    /// Origin holding the standard history:
    ///
    /// ```text
    /// master:  first ── second (adds helper, php/crappy.php)
    ///            │ └── v1.0.0 (annotated tag)
    ///            └── feature (adds feature.txt)
    /// ```
    pub fn standard() -> (Self, History) {
        let fixture = Self::new();
        let first = fixture.commit(
            "master",
            "Initial commit",
            FIRST_COMMIT_TIME,
            &[
                Change::Write("README.md", "# fixture\n"),
                Change::Write("LICENSE", "MIT\n"),
                Change::Write("go/example.go", "package main\n\nfunc main() {}\n"),
                Change::Write("vendor/foo.go", "package vendor\n"),
                Change::Write("json/short.json", "{\"short\": true}\n"),
                Change::Executable("scripts/run.sh", "#!/bin/sh\necho run\n"),
                Change::Symlink("link-to-readme", "README.md"),
            ],
        );
        let second = fixture.commit(
            "master",
            "Add helper",
            SECOND_COMMIT_TIME,
            &[
                Change::Write(
                    "go/example.go",
                    "package main\n\nfunc main() {}\n\nfunc helper() {}\n",
                ),
                Change::Write("php/crappy.php", "<?php echo 'hi';\n"),
            ],
        );
        fixture.tag("v1.0.0", first);
        fixture.branch("feature", first);
        let feature = fixture.commit(
            "feature",
            "Add feature",
            FEATURE_COMMIT_TIME,
            &[Change::Write("feature.txt", "feature\n")],
        );

        (
            fixture,
            History {
                first,
                second,
                feature,
            },
        )
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn url(&self) -> String {
        file_url(&self.path)
    }

    pub fn reference(&self) -> RepoRef {
        RepoRef::new(self.url())
    }

    /// Commits `changes` on top of `branch`, creating the branch if needed.
    pub fn commit(&self, branch: &str, message: &str, seconds: i64, changes: &[Change<'_>]) -> Oid {
        let refname = format!("refs/heads/{branch}");
        let parent = self
            .repo
            .find_reference(&refname)
            .ok()
            .map(|reference| reference.peel_to_commit().unwrap());

        let mut files = BTreeMap::new();
        if let Some(parent) = &parent {
            parent
                .tree()
                .unwrap()
                .walk(TreeWalkMode::PreOrder, |root, entry| {
                    if entry.kind() == Some(ObjectType::Blob) {
                        let path = format!("{root}{}", entry.name().unwrap());
                        files.insert(path, (entry.filemode(), entry.id()));
                    }
                    TreeWalkResult::Ok
                })
                .unwrap();
        }

        for change in changes {
            match change {
                Change::Write(path, contents) => self.put(&mut files, path, MODE_FILE, contents.as_bytes()),
                Change::Executable(path, contents) => {
                    self.put(&mut files, path, MODE_EXECUTABLE, contents.as_bytes())
                }
                Change::Symlink(path, target) => self.put(&mut files, path, MODE_SYMLINK, target.as_bytes()),
                Change::Bytes(path, contents) => self.put(&mut files, path, MODE_FILE, contents),
                Change::Delete(path) => {
                    files.remove(*path);
                }
            }
        }

        let tree = self.repo.find_tree(self.write_tree(&files)).unwrap();
        let signature = Signature::new(AUTHOR, EMAIL, &Time::new(seconds, OFFSET_MINUTES)).unwrap();
        let parents: Vec<_> = parent.iter().collect();
        self.repo
            .commit(Some(&refname), &signature, &signature, message, &tree, &parents)
            .unwrap()
    }

    pub fn branch(&self, name: &str, target: Oid) {
        self.repo
            .reference(&format!("refs/heads/{name}"), target, true, "fixture branch")
            .unwrap();
    }

    /// Annotated tag.
    pub fn tag(&self, name: &str, target: Oid) {
        let object = self.repo.find_object(target, None).unwrap();
        let signature = Signature::new(AUTHOR, EMAIL, &Time::new(FIRST_COMMIT_TIME, OFFSET_MINUTES)).unwrap();
        self.repo
            .tag(name, &object, &signature, &format!("Release {name}"), true)
            .unwrap();
    }

    fn put(&self, files: &mut BTreeMap<String, (i32, Oid)>, path: &str, mode: i32, contents: &[u8]) {
        let id = self.repo.blob(contents).unwrap();
        files.insert(path.to_string(), (mode, id));
    }

    fn write_tree(&self, files: &BTreeMap<String, (i32, Oid)>) -> Oid {
        let mut builder = self.repo.treebuilder(None).unwrap();
        let mut subdirs: BTreeMap<&str, BTreeMap<String, (i32, Oid)>> = BTreeMap::new();

        for (path, (mode, id)) in files {
            match path.split_once('/') {
                Some((dir, rest)) => {
                    subdirs.entry(dir).or_default().insert(rest.to_string(), (*mode, *id));
                }
                None => {
                    builder.insert(path.as_str(), *id, *mode).unwrap();
                }
            }
        }
        for (dir, children) in &subdirs {
            let id = self.write_tree(children);
            builder.insert(*dir, id, MODE_TREE).unwrap();
        }

        builder.write().unwrap()
    }
}

/// Commit ids of `Fixture::standard`.
pub struct History {
    pub first: Oid,
    pub second: Oid,
    pub feature: Oid,
}

pub fn file_url(path: &Path) -> String {
    format!("file://{}", path.display())
}

/// Clones `fixture` through a fresh ephemeral store.
pub async fn snapshot(fixture: &Fixture) -> Arc<Snapshot> {
    RepoStore::new(StoreConfig::default())
        .get(&fixture.reference())
        .await
        .unwrap()
}

/// Store rooted at a caller-owned cache directory.
pub fn disk_store(cache_dir: &Path) -> RepoStore {
    RepoStore::new(StoreConfig {
        cache_dir: Some(cache_dir.to_path_buf()),
        ..StoreConfig::default()
    })
}
