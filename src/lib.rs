//! Concurrency-safe cache of cloned git repositories.
//!
//! ```no_run
//! # async fn demo() -> repo_cache::Result<()> {
//! use repo_cache::{RepoRef, RepoStore, StoreConfig};
//!
//! let store = RepoStore::new(StoreConfig::default());
//! let snapshot = store.get(&RepoRef::new("https://github.com/git-fixtures/basic.git")).await?;
//! snapshot.checkout("master")?;
//! for (path, file) in snapshot.get_all_files("**/*.go", true)? {
//!     println!("{path}: {} bytes", file.contents().len());
//! }
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod error;
pub mod reference;
pub mod secrets;
pub mod snapshot;
pub mod store;

pub use auth::Credential;
pub use error::{AuthError, Result, StoreError};
pub use reference::{Classification, RepoRef, UrlType};
pub use secrets::{MemorySecretStore, Secret, SecretError, SecretStore};
pub use snapshot::{FileHandle, FileLog, Snapshot};
pub use store::{CloneEntry, CloneOutcome, CloneSignal, CloneState, RepoStore, StoreConfig, StoreStats};
