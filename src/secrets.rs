//! Secret-store seam used to resolve ssh private keys by name.
//!
//! References that carry secret coordinates instead of an inline key are
//! resolved through a `SecretStore`. The store itself is supplied by whoever
//! composes the `RepoStore`; `MemorySecretStore` is the in-process
//! implementation used for tests and the command-line tool.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("secret not found: {namespace}/{name}")]
    NotFound { name: String, namespace: String },

    #[error("secret backend error: {0}")]
    Backend(String),
}

/// A named collection of opaque fields, e.g. `key` holding a PEM blob.
#[derive(Clone, Default)]
pub struct Secret {
    data: HashMap<String, Vec<u8>>,
}

impl Secret {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_field(mut self, field: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.data.insert(field.into(), value.into());
        self
    }

    pub fn field(&self, field: &str) -> Option<&[u8]> {
        self.data.get(field).map(Vec::as_slice)
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut fields: Vec<&str> = self.data.keys().map(String::as_str).collect();
        fields.sort_unstable();
        f.debug_struct("Secret").field("fields", &fields).finish()
    }
}

#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Looks up the secret `name` in `namespace`.
    async fn lookup(&self, name: &str, namespace: &str) -> Result<Secret, SecretError>;
}

/// In-memory secret store. Not persisted.
#[derive(Debug, Clone, Default)]
pub struct MemorySecretStore {
    secrets: Arc<RwLock<HashMap<(String, String), Secret>>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, name: impl Into<String>, namespace: impl Into<String>, secret: Secret) {
        self.secrets
            .write()
            .await
            .insert((namespace.into(), name.into()), secret);
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn lookup(&self, name: &str, namespace: &str) -> Result<Secret, SecretError> {
        self.secrets
            .read()
            .await
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| SecretError::NotFound {
                name: name.to_string(),
                namespace: namespace.to_string(),
            })
    }
}
