//! Repository references and locator classification.
//!
//! A `RepoRef` is what callers hand to the store: a locator string plus
//! optional explicit credentials or secret-store coordinates. Before anything
//! else consumes it, the locator is classified into a transport and any
//! `user[:pass]@` fragment embedded in it is extracted.
//!
//! Accepted shapes:
//! - `ssh://[user@]host.xz[:port]/path/to/repo.git/`
//! - `[user[:pass]@]host.xz:path/to/repo.git` (scp-style, implies ssh)
//! - `http[s]://[user[:pass]@]host.xz/path/to/repo.git/`
//! - `git://host.xz/path/to/repo.git/`
//! - `rsync://host.xz/path/to/repo.git/`
//! - `file:///path/to/repo.git/`

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

use crate::error::{Result, StoreError};

/// Word characters are ASCII-only (`(?-u)`), matching the classic git URL
/// grammar; non-ASCII hosts and paths are not recognised.
const GIT_URL_PATTERN: &str = r"(?-u)((git|ssh|file|rsync|http(s)?)|((\w+[:\w]+?@)?[\w.]+))(:(//)?)(\w+[:\w]+?@)?([\w.:/~-]+)(\.git)?(/)?";

/// Capture groups produced by `GIT_URL_PATTERN`, including the whole match.
const EXPECTED_GROUPS: usize = 12;

const DEFAULT_SSH_USER: &str = "git";

fn git_url_regex() -> Result<&'static Regex> {
    static REGEX: OnceLock<std::result::Result<Regex, regex::Error>> = OnceLock::new();
    REGEX
        .get_or_init(|| Regex::new(GIT_URL_PATTERN))
        .as_ref()
        .map_err(|e| StoreError::Internal(format!("unable to compile regex: {e}")))
}

/// Transport a locator resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UrlType {
    Ssh,
    Http,
    File,
    Git,
    Rsync,
}

impl fmt::Display for UrlType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UrlType::Ssh => "ssh",
            UrlType::Http => "http",
            UrlType::File => "file",
            UrlType::Git => "git",
            UrlType::Rsync => "rsync",
        };
        f.write_str(name)
    }
}

/// Fields derived from a locator by classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub url_type: UrlType,
    pub user: String,
    pub pass: String,
}

/// A caller-supplied locator identifying a remote repository to cache.
#[derive(Clone, Default)]
pub struct RepoRef {
    pub url: String,
    /// Explicit username, overriding any embedded in the URL.
    pub username: Option<String>,
    /// Explicit password. For ssh references this is the key passphrase.
    pub password: Option<String>,
    /// Inline PEM-encoded private key for ssh references.
    pub private_key: Option<Vec<u8>>,
    pub secret_name: Option<String>,
    pub secret_namespace: Option<String>,
}

impl RepoRef {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn with_basic_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_private_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.private_key = Some(key.into());
        self
    }

    pub fn with_secret(mut self, name: impl Into<String>, namespace: impl Into<String>) -> Self {
        self.secret_name = Some(name.into());
        self.secret_namespace = Some(namespace.into());
        self
    }

    /// Classifies the locator. Pure and repeatable: the same reference always
    /// yields the same classification.
    pub fn classify(&self) -> Result<Classification> {
        let invalid = |reason: String| StoreError::Validation {
            url: self.url.clone(),
            reason,
        };

        let regex = git_url_regex()?;
        let captures = regex
            .captures(&self.url)
            .ok_or_else(|| invalid("invalid git url".to_string()))?;
        if captures.len() != EXPECTED_GROUPS {
            return Err(invalid(format!(
                "should have matched {EXPECTED_GROUPS} capture groups, matched {}",
                captures.len()
            )));
        }

        let group = |i: usize| captures.get(i).map_or("", |m| m.as_str());
        let (mut user, pass) = split_user_pass(group(5), group(8));

        let url_type = match group(1) {
            "ssh" => UrlType::Ssh,
            "http" | "https" => UrlType::Http,
            "file" => UrlType::File,
            "rsync" => UrlType::Rsync,
            "git" => UrlType::Git,
            // scp-style, with or without a user: x@y.com:foo/bar, y.com:foo/bar
            _ if group(0).contains('@') || group(6) == ":" => UrlType::Ssh,
            _ => return Err(invalid("unable to determine repository type".to_string())),
        };

        if user.is_empty() && matches!(url_type, UrlType::Ssh | UrlType::Git) {
            user = DEFAULT_SSH_USER.to_string();
        }

        Ok(Classification {
            url_type,
            user,
            pass,
        })
    }
}

impl fmt::Debug for RepoRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RepoRef")
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("private_key", &self.private_key.as_ref().map(|_| "<redacted>"))
            .field("secret_name", &self.secret_name)
            .field("secret_namespace", &self.secret_namespace)
            .finish()
    }
}

/// Splits whichever `user[:pass]@` fragment was captured. The fragment after
/// the scheme wins over the scp-style one.
fn split_user_pass(scp_fragment: &str, scheme_fragment: &str) -> (String, String) {
    let fragment = if scheme_fragment.is_empty() {
        scp_fragment
    } else {
        scheme_fragment
    };
    let fragment = fragment.trim_end_matches('@');

    match fragment.split_once(':') {
        Some((user, pass)) => (user.to_string(), pass.to_string()),
        None => (fragment.to_string(), String::new()),
    }
}
