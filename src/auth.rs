//! Credential derivation and libgit2 authentication callbacks.
//!
//! `resolve_credential` turns a classified reference into a `Credential`:
//! - ssh   → private key (inline or from the secret store), user defaults to `git`
//! - http  → basic auth from explicit or URL-embedded user/password, else anonymous
//! - other → anonymous
//!
//! `remote_callbacks` wires a credential into the callbacks used by clone and
//! fetch.

use std::collections::HashSet;
use std::fmt;
use std::time::Instant;

use git2::{CertificateCheckStatus, Cred, CredentialType, RemoteCallbacks};

use crate::error::AuthError;
use crate::reference::{Classification, RepoRef, UrlType};
use crate::secrets::SecretStore;

/// Authentication used to reach a remote.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    Anonymous,
    UserPass {
        username: String,
        password: String,
    },
    SshKey {
        username: String,
        private_key: String,
        passphrase: Option<String>,
    },
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Anonymous => f.write_str("Anonymous"),
            Credential::UserPass { username, .. } => f
                .debug_struct("UserPass")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            Credential::SshKey {
                username,
                passphrase,
                ..
            } => f
                .debug_struct("SshKey")
                .field("username", username)
                .field("private_key", &"<redacted>")
                .field("passphrase", &passphrase.as_ref().map(|_| "<redacted>"))
                .finish(),
        }
    }
}

/// Options shared by every remote operation of a store.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct RemoteOptions {
    pub insecure_skip_host_key_verification: bool,
    /// Abort the transfer once this instant has passed. Only checked from
    /// progress callbacks, so a stalled connect or ref negotiation runs on.
    pub deadline: Option<Instant>,
}

pub async fn resolve_credential(
    reference: &RepoRef,
    classification: &Classification,
    secrets: Option<&dyn SecretStore>,
    key_field: &str,
) -> Result<Credential, AuthError> {
    match classification.url_type {
        UrlType::Ssh => {
            let key = match &reference.private_key {
                Some(key) => key.clone(),
                None => secret_key(reference, secrets, key_field).await?,
            };
            let private_key = parse_private_key(key)?;

            let username = non_empty(reference.username.as_deref())
                .unwrap_or(classification.user.as_str())
                .to_string();
            let passphrase = non_empty(reference.password.as_deref())
                .or_else(|| non_empty(Some(classification.pass.as_str())))
                .map(str::to_string);

            Ok(Credential::SshKey {
                username,
                private_key,
                passphrase,
            })
        }
        UrlType::Http => {
            let username = non_empty(reference.username.as_deref()).unwrap_or(classification.user.as_str());
            let password = non_empty(reference.password.as_deref()).unwrap_or(classification.pass.as_str());
            if username.is_empty() && password.is_empty() {
                return Ok(Credential::Anonymous);
            }
            Ok(Credential::UserPass {
                username: username.to_string(),
                password: password.to_string(),
            })
        }
        UrlType::File | UrlType::Git | UrlType::Rsync => Ok(Credential::Anonymous),
    }
}

async fn secret_key(
    reference: &RepoRef,
    secrets: Option<&dyn SecretStore>,
    key_field: &str,
) -> Result<Vec<u8>, AuthError> {
    let Some(name) = reference.secret_name.as_deref() else {
        return Err(AuthError::MissingKey);
    };
    let namespace = reference.secret_namespace.as_deref().unwrap_or_default();
    let Some(store) = secrets else {
        return Err(AuthError::NoSecretStore {
            name: name.to_string(),
            namespace: namespace.to_string(),
        });
    };

    let secret = store.lookup(name, namespace).await?;
    secret
        .field(key_field)
        .map(<[u8]>::to_vec)
        .ok_or_else(|| AuthError::MissingSecretField {
            name: name.to_string(),
            namespace: namespace.to_string(),
            field: key_field.to_string(),
        })
}

fn parse_private_key(key: Vec<u8>) -> Result<String, AuthError> {
    let key = String::from_utf8(key)
        .map_err(|_| AuthError::MalformedKey("key is not valid UTF-8".to_string()))?;
    let armored = key.contains("-----BEGIN ") && key.contains("PRIVATE KEY-----");
    if !armored {
        return Err(AuthError::MalformedKey(
            "no PEM private key block found".to_string(),
        ));
    }
    Ok(key)
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}

/// Builds the callbacks for one clone or fetch.
///
/// libgit2 re-invokes the credential callback after the server rejects a
/// credential; each credential kind is offered once, then the operation fails.
pub(crate) fn remote_callbacks<'a>(credential: Credential, options: RemoteOptions) -> RemoteCallbacks<'a> {
    let mut callbacks = RemoteCallbacks::new();
    let mut offered: HashSet<u32> = HashSet::new();

    callbacks.credentials(move |url, username_from_url, allowed| {
        let username_hint = username_from_url.unwrap_or("git");
        let (kind, cred) = match &credential {
            Credential::SshKey {
                username,
                private_key,
                passphrase,
            } if allowed.contains(CredentialType::SSH_MEMORY) || allowed.contains(CredentialType::SSH_KEY) => (
                CredentialType::SSH_MEMORY,
                Cred::ssh_key_from_memory(username, None, private_key, passphrase.as_deref()),
            ),
            Credential::SshKey { username, .. } if allowed.contains(CredentialType::USERNAME) => {
                (CredentialType::USERNAME, Cred::username(username))
            }
            Credential::UserPass { username, password }
                if allowed.contains(CredentialType::USER_PASS_PLAINTEXT) =>
            {
                (
                    CredentialType::USER_PASS_PLAINTEXT,
                    Cred::userpass_plaintext(username, password),
                )
            }
            _ if allowed.contains(CredentialType::USERNAME) => {
                (CredentialType::USERNAME, Cred::username(username_hint))
            }
            _ => {
                return Err(git2::Error::from_str(&format!(
                    "no usable credential for {url}"
                )));
            }
        };

        if !offered.insert(kind.bits()) {
            return Err(git2::Error::from_str(&format!(
                "authentication rejected by {url}"
            )));
        }
        cred
    });

    if options.insecure_skip_host_key_verification {
        callbacks.certificate_check(|_cert, _host| Ok(CertificateCheckStatus::CertificateOk));
    }

    if let Some(deadline) = options.deadline {
        // Returning false from either progress callback aborts the transfer.
        callbacks.transfer_progress(move |_progress| Instant::now() < deadline);
        callbacks.sideband_progress(move |_data| Instant::now() < deadline);
    }

    callbacks
}
