//! Who may open a session.
//!
//! Authentication is a policy decision separate from the transport: the SSH
//! handler extracts an identity and a credential and asks an [`AuthPolicy`].
//! The default policy rejects everyone; letting any identity in has to be
//! configured explicitly.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// What a client presented to prove its identity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Credential {
    /// A public key whose signature the transport already verified.
    PublicKey { fingerprint: String },
    Password(String),
}

impl Credential {
    pub fn method(&self) -> &'static str {
        match self {
            Credential::PublicKey { .. } => "publickey",
            Credential::Password(_) => "password",
        }
    }
}

pub trait AuthPolicy: Send + Sync {
    fn verify(&self, identity: &str, credential: &Credential) -> bool;
}

/// Rejects every credential.
#[derive(Clone, Copy, Debug, Default)]
pub struct DenyAll;

impl AuthPolicy for DenyAll {
    fn verify(&self, _identity: &str, _credential: &Credential) -> bool {
        false
    }
}

/// Accepts every credential.
#[derive(Clone, Copy, Debug, Default)]
pub struct AllowAny;

impl AuthPolicy for AllowAny {
    fn verify(&self, _identity: &str, _credential: &Credential) -> bool {
        true
    }
}

/// Accepts public keys listed in an OpenSSH `authorized_keys` file.
#[derive(Clone, Debug, Default)]
pub struct AuthorizedKeys {
    fingerprints: HashSet<String>,
}

impl AuthorizedKeys {
    /// Parse `authorized_keys` content.
    ///
    /// Blank lines and `#` comments are skipped. Each entry is
    /// `<type> <base64> [comment]`; option prefixes are not supported.
    pub fn parse(content: &str) -> Result<Self, AuthError> {
        let mut fingerprints = HashSet::new();
        for (idx, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields = line.split_whitespace();
            let (Some(_kind), Some(encoded)) = (fields.next(), fields.next()) else {
                return Err(AuthError::MalformedEntry { line: idx + 1 });
            };
            let key = russh_keys::parse_public_key_base64(encoded).map_err(|e| {
                AuthError::InvalidKey {
                    line: idx + 1,
                    reason: e.to_string(),
                }
            })?;
            fingerprints.insert(key.fingerprint());
        }
        Ok(Self { fingerprints })
    }

    pub fn load(path: &Path) -> Result<Self, AuthError> {
        let content = std::fs::read_to_string(path).map_err(|source| AuthError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let keys = Self::parse(&content)?;
        info!(path = %path.display(), keys = keys.key_count(), "loaded authorized keys");
        Ok(keys)
    }

    pub fn key_count(&self) -> usize {
        self.fingerprints.len()
    }
}

impl AuthPolicy for AuthorizedKeys {
    fn verify(&self, _identity: &str, credential: &Credential) -> bool {
        match credential {
            Credential::PublicKey { fingerprint } => self.fingerprints.contains(fingerprint),
            Credential::Password(_) => false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("authorized_keys line {line}: expected `<type> <base64-key>`")]
    MalformedEntry { line: usize },
    #[error("authorized_keys line {line}: {reason}")]
    InvalidKey { line: usize, reason: String },
    #[error("auth mode `authorized-keys` needs `auth.authorized_keys` to be set")]
    MissingAuthorizedKeys,
}

/// Which policy to build from configuration.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum AuthMode {
    #[default]
    Deny,
    AllowAny,
    AuthorizedKeys,
}

/// Auth tunables (lives under `[auth]` in the config file).
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthFileConfig {
    #[serde(default)]
    pub mode: AuthMode,
    #[serde(default)]
    pub authorized_keys: Option<PathBuf>,
}

impl AuthFileConfig {
    pub fn build_policy(&self) -> Result<Arc<dyn AuthPolicy>, AuthError> {
        match self.mode {
            AuthMode::Deny => {
                warn!("auth mode is `deny`: every login will be rejected");
                Ok(Arc::new(DenyAll))
            }
            AuthMode::AllowAny => {
                warn!("auth mode is `allow-any`: any credential is accepted");
                Ok(Arc::new(AllowAny))
            }
            AuthMode::AuthorizedKeys => {
                let path = self
                    .authorized_keys
                    .as_deref()
                    .ok_or(AuthError::MissingAuthorizedKeys)?;
                Ok(Arc::new(AuthorizedKeys::load(path)?))
            }
        }
    }
}
