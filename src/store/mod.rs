//! Process-wide cache of cloned repositories, keyed by normalized locator.
//!
//! Spellings of one locator that differ only in userinfo, separators or a
//! trailing `/` share a key (see `cache_key`), and therefore one entry and
//! one on-disk clone. The first request for a key registers a `CloneEntry` and starts its clone
//! in the background; every later request for the same URL gets that entry,
//! whatever state it is in. Lookups take the read lock first and only fall
//! back to the write lock to insert, re-checking under it so concurrent first
//! requests still start a single clone.
//!
//! A failed entry is dropped by the first `get` that observes the failure,
//! so the next request retries. Entries are otherwise kept for the life of
//! the store.

mod cloner;

pub use cloner::{CloneEntry, CloneOutcome, CloneSignal, CloneState};

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use serde::Deserialize;

use crate::auth::{RemoteOptions, resolve_credential};
use crate::error::{Result, StoreError};
use crate::reference::RepoRef;
use crate::secrets::SecretStore;
use crate::snapshot::Snapshot;
use cloner::Destination;

const DEFAULT_SECRET_KEY_FIELD: &str = "key";
const SEPARATORS: [char; 3] = ['/', ':', '\\'];
const FALLBACK_KEY: &str = "repository";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Root for on-disk clones. `None` clones into temporary directories
    /// that disappear with their snapshot.
    pub cache_dir: Option<PathBuf>,
    /// Accept any host key or TLS certificate presented by a remote.
    pub insecure_skip_host_key_verification: bool,
    /// Secret field holding the PEM private key.
    pub secret_key_field: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            cache_dir: None,
            insecure_skip_host_key_verification: false,
            secret_key_field: DEFAULT_SECRET_KEY_FIELD.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
    pub cached_repositories: usize,
    pub clones_started: usize,
}

pub struct RepoStore {
    config: StoreConfig,
    secrets: Option<Arc<dyn SecretStore>>,
    repositories: RwLock<HashMap<String, Arc<CloneEntry>>>,
    clones_started: AtomicUsize,
}

impl RepoStore {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config,
            secrets: None,
            repositories: RwLock::new(HashMap::new()),
            clones_started: AtomicUsize::new(0),
        }
    }

    pub fn with_secret_store(mut self, secrets: Arc<dyn SecretStore>) -> Self {
        self.secrets = Some(secrets);
        self
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Returns the entry for `reference`, starting its clone if this is the
    /// first request for the URL, together with a signal that resolves when
    /// the clone finishes.
    ///
    /// Only the secret lookup is awaited; the clone itself never is. Invalid
    /// locators and unusable credentials fail here and leave the cache
    /// untouched. For an existing entry the freshly derived credential
    /// replaces the stored one.
    pub async fn get_async(&self, reference: &RepoRef) -> Result<(Arc<CloneEntry>, CloneSignal)> {
        let classification = reference.classify()?;
        let credential = resolve_credential(
            reference,
            &classification,
            self.secrets.as_deref(),
            &self.config.secret_key_field,
        )
        .await
        .map_err(|source| StoreError::Auth {
            url: reference.url.clone(),
            source,
        })?;

        let key = cache_key(&reference.url);
        if let Some(entry) = self.lookup(&key)? {
            entry.set_credential(credential)?;
            let signal = entry.subscribe();
            return Ok((entry, signal));
        }

        let mut repositories = self.repositories.write().map_err(|_| StoreError::poisoned())?;
        let entry = match repositories.entry(key) {
            Entry::Occupied(occupied) => {
                let entry = Arc::clone(occupied.get());
                entry.set_credential(credential)?;
                entry
            }
            Entry::Vacant(vacant) => {
                tracing::debug!(url = %reference.url, key = %vacant.key(), kind = %classification.url_type, "registering repository");
                self.clones_started.fetch_add(1, Ordering::SeqCst);
                let entry = CloneEntry::spawn(
                    reference.url.clone(),
                    vacant.key().clone(),
                    credential,
                    self.destination(vacant.key()),
                    self.remote_options(),
                );
                Arc::clone(vacant.insert(entry))
            }
        };

        let signal = entry.subscribe();
        Ok((entry, signal))
    }

    /// Returns the ready snapshot for `reference`, waiting for its clone.
    ///
    /// A clone failure is returned to every caller that waited on it, and the
    /// failed entry is evicted so the next call clones again.
    pub async fn get(&self, reference: &RepoRef) -> Result<Arc<Snapshot>> {
        let (entry, signal) = self.get_async(reference).await?;
        match signal.wait().await {
            Ok(snapshot) => Ok(snapshot),
            Err(error) => {
                self.evict_failed(&entry)?;
                Err(StoreError::Shared(error))
            }
        }
    }

    /// Drops the entry for `url`. Snapshots already handed out stay usable.
    pub fn evict(&self, url: &str) -> Result<bool> {
        let mut repositories = self.repositories.write().map_err(|_| StoreError::poisoned())?;
        Ok(repositories.remove(&cache_key(url)).is_some())
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let repositories = self.repositories.read().map_err(|_| StoreError::poisoned())?;
        Ok(StoreStats {
            cached_repositories: repositories.len(),
            clones_started: self.clones_started.load(Ordering::SeqCst),
        })
    }

    fn lookup(&self, key: &str) -> Result<Option<Arc<CloneEntry>>> {
        let repositories = self.repositories.read().map_err(|_| StoreError::poisoned())?;
        Ok(repositories.get(key).cloned())
    }

    /// Removes `entry` only if the table still maps its key to it; a retry
    /// may already have replaced it.
    fn evict_failed(&self, entry: &Arc<CloneEntry>) -> Result<()> {
        let mut repositories = self.repositories.write().map_err(|_| StoreError::poisoned())?;
        if repositories
            .get(entry.key())
            .is_some_and(|current| Arc::ptr_eq(current, entry))
        {
            repositories.remove(entry.key());
            tracing::warn!(url = %entry.url(), "evicted failed clone");
        }
        Ok(())
    }

    fn destination(&self, key: &str) -> Destination {
        match &self.config.cache_dir {
            Some(root) => Destination::Directory(root.join(key.split('/').collect::<PathBuf>())),
            None => Destination::Ephemeral,
        }
    }

    fn remote_options(&self) -> RemoteOptions {
        RemoteOptions {
            insecure_skip_host_key_verification: self.config.insecure_skip_host_key_verification,
            deadline: None,
        }
    }
}

impl std::fmt::Debug for RepoStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepoStore")
            .field("config", &self.config)
            .field("secrets", &self.secrets.is_some())
            .finish_non_exhaustive()
    }
}

/// Normalized form of `url`: `<scheme>/<host>/<path segments>`.
///
/// scp-style locators count as `ssh`. The userinfo is dropped, `:` and `\`
/// act as separators, and empty, `.` and `..` segments are removed. The key
/// doubles as the clone's path under the cache root, so it never escapes it.
pub(crate) fn cache_key(url: &str) -> String {
    let (scheme, rest) = url.split_once("://").unwrap_or(("ssh", url));
    let rest = match rest.split_once('@') {
        Some((userinfo, host)) if !userinfo.contains('/') => host,
        _ => rest,
    };

    let scheme = scheme.to_ascii_lowercase();
    let segments: Vec<&str> = scheme
        .split(SEPARATORS)
        .chain(rest.split(SEPARATORS))
        .filter(|segment| !matches!(*segment, "" | "." | ".."))
        .collect();
    if segments.is_empty() {
        return FALLBACK_KEY.to_string();
    }
    segments.join("/")
}
