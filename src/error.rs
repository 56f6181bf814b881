//! Error types for the repository cache.
//!
//! Defines `StoreError` for every failure the cache, the clone workers and
//! the snapshot accessors can report. Each variant carries the locator,
//! revision or path it concerns so a failure can be traced back to the input
//! that caused it.
//!
//! Propagation:
//! - `Validation`, `Auth` → returned synchronously, cache untouched
//! - `Clone`, `Normalize` → recorded on the cache entry, seen by every waiter
//!   wrapped in `Shared`
//! - everything else → returned directly to the calling operation

use std::sync::Arc;

use thiserror::Error;

use crate::secrets::SecretError;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("invalid repository reference {url}: {reason}")]
    Validation { url: String, reason: String },

    #[error("unable to construct authentication for {url}: {source}")]
    Auth {
        url: String,
        #[source]
        source: AuthError,
    },

    #[error("unable to clone {url}: {source}")]
    Clone {
        url: String,
        #[source]
        source: git2::Error,
    },

    #[error("unable to clean newly cloned {url}: {source}")]
    Normalize {
        url: String,
        #[source]
        source: git2::Error,
    },

    #[error("unable to fetch {url}: {source}")]
    Fetch {
        url: String,
        #[source]
        source: git2::Error,
    },

    #[error("unable to checkout {revision}: {source}")]
    Checkout {
        revision: String,
        #[source]
        source: git2::Error,
    },

    #[error("unable to resolve reference {revision}: {source}")]
    RefResolution {
        revision: String,
        #[source]
        source: git2::Error,
    },

    #[error("path not found: {path}")]
    PathNotFound { path: String },

    #[error("unable to compile subPath matcher {pattern}: {reason}")]
    Glob { pattern: String, reason: String },

    #[error("unable to decode contents of {path} as text")]
    Content {
        path: String,
        #[source]
        source: std::string::FromUtf8Error,
    },

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    /// A clone failure recorded once on a cache entry and handed to every
    /// caller that waited on it.
    #[error(transparent)]
    Shared(Arc<StoreError>),
}

impl StoreError {
    /// Strips any `Shared` wrapping and returns the error that actually occurred.
    pub fn root(&self) -> &StoreError {
        match self {
            StoreError::Shared(inner) => inner.root(),
            other => other,
        }
    }

    pub(crate) fn poisoned() -> Self {
        StoreError::Internal("Lock poisoned".to_string())
    }
}

/// Reasons a credential could not be derived for a reference.
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("no private key supplied for ssh repository")]
    MissingKey,

    #[error("unable to parse private key: {0}")]
    MalformedKey(String),

    #[error("secret {namespace}/{name} requested but no secret store is configured")]
    NoSecretStore { name: String, namespace: String },

    #[error("secret {namespace}/{name} has no field {field}")]
    MissingSecretField {
        name: String,
        namespace: String,
        field: String,
    },

    #[error(transparent)]
    Secret(#[from] SecretError),
}

pub type Result<T> = std::result::Result<T, StoreError>;
