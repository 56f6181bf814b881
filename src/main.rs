//! repo-cache - clone a repository through the cache and list its files
//!
//! # Usage
//! ```bash
//! repo-cache https://github.com/git-fixtures/basic.git               # List files at the default branch
//! repo-cache https://github.com/git-fixtures/basic.git -r v1.0.0     # List files at a tag
//! repo-cache git@github.com:org/repo.git --ssh-key-file ~/.ssh/id_ed25519 --glob '**/*.yaml' --log
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, FixedOffset};
use clap::Parser;
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use repo_cache::{FileLog, MemorySecretStore, RepoRef, RepoStore, Secret, Snapshot, StoreConfig};

/// Clone a git repository through the cache and print its files as JSON
#[derive(Parser)]
#[command(name = "repo-cache")]
#[command(about = "Clone a git repository and list its files", long_about = None)]
struct Cli {
    /// Repository locator (https, ssh, scp-style, git, rsync or file)
    #[arg(value_name = "URL")]
    url: String,

    /// Revision to check out: branch, tag, commit hash or full ref name
    #[arg(short, long)]
    revision: Option<String>,

    /// Keep clones under this directory instead of a temporary one
    #[arg(long, value_name = "DIR")]
    cache_dir: Option<PathBuf>,

    /// Only list paths matching this glob, e.g. '{**/*,*}.{yaml,yml}'
    #[arg(short, long, default_value = "")]
    glob: String,

    /// List symbolic links too
    #[arg(long)]
    include_symlinks: bool,

    /// Username for http(s) remotes
    #[arg(long)]
    username: Option<String>,

    /// Password for http(s) remotes, or the private key passphrase for ssh
    #[arg(long)]
    password: Option<String>,

    /// PEM private key for ssh remotes
    #[arg(long, value_name = "FILE")]
    ssh_key_file: Option<PathBuf>,

    /// Accept any host key or certificate
    #[arg(long)]
    insecure_skip_host_key_verification: bool,

    /// Include who last touched each file
    #[arg(long)]
    log: bool,
}

#[derive(Serialize)]
struct Listing {
    url: String,
    head: String,
    last_updated: DateTime<FixedOffset>,
    files: Vec<FileEntry>,
}

#[derive(Serialize)]
struct FileEntry {
    path: String,
    size: usize,
    symlink: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    log: Option<FileLog>,
}

const KEY_SECRET_NAME: &str = "ssh-key";
const KEY_SECRET_NAMESPACE: &str = "cli";

/// Builds the reference, registering `--ssh-key-file` in `secrets` so the
/// key is resolved the same way a deployed store resolves named secrets.
async fn reference(cli: &Cli, secrets: &MemorySecretStore, key_field: &str) -> anyhow::Result<RepoRef> {
    let mut reference = RepoRef::new(cli.url.clone());
    reference.username = cli.username.clone();
    reference.password = cli.password.clone();

    if let Some(path) = &cli.ssh_key_file {
        let key = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        secrets
            .insert(KEY_SECRET_NAME, KEY_SECRET_NAMESPACE, Secret::new().with_field(key_field, key))
            .await;
        reference = reference.with_secret(KEY_SECRET_NAME, KEY_SECRET_NAMESPACE);
    }
    Ok(reference)
}

fn list(snapshot: &Snapshot, cli: &Cli) -> anyhow::Result<Listing> {
    if let Some(revision) = &cli.revision {
        snapshot.checkout(revision)?;
    }

    let files = snapshot
        .get_all_files(&cli.glob, !cli.include_symlinks)?
        .into_values()
        .map(|file| {
            let size = file.bytes().map(|bytes| bytes.len()).unwrap_or(0);
            FileEntry {
                path: file.path().to_string(),
                size,
                symlink: file.is_symlink(),
                log: if cli.log { file.file_log() } else { None },
            }
        })
        .collect();

    Ok(Listing {
        url: snapshot.url().to_string(),
        head: snapshot.head()?.to_string(),
        last_updated: snapshot.last_updated()?,
        files,
    })
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = StoreConfig {
        cache_dir: cli.cache_dir.clone(),
        insecure_skip_host_key_verification: cli.insecure_skip_host_key_verification,
        ..StoreConfig::default()
    };
    let secrets = MemorySecretStore::new();
    let reference = reference(&cli, &secrets, &config.secret_key_field).await?;
    let store = RepoStore::new(config).with_secret_store(Arc::new(secrets));

    let snapshot = store
        .get(&reference)
        .await
        .with_context(|| format!("cloning {}", cli.url))?;

    let listing = tokio::task::spawn_blocking(move || list(&snapshot, &cli)).await??;

    println!("{}", serde_json::to_string_pretty(&listing)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing (quiet unless RUST_LOG says otherwise)
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "warn".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    tokio::select! {
        result = run(cli) => result,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("Interrupted");
            std::process::exit(130);
        }
    }
}
