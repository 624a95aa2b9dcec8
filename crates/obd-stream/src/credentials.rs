//! Bearer token sources.
//!
//! The session never caches a token: [`CredentialSource::bearer_token`] is
//! called once at the start of every connect attempt, including automatic
//! retries, so a token rotated by the owning application is picked up on the
//! next attempt.

use std::path::PathBuf;

/// Read-only access to an externally managed bearer token.
pub trait CredentialSource: Send + Sync {
    /// Current token, or `None` when the user is not signed in.
    fn bearer_token(&self) -> Option<String>;
}

impl<F> CredentialSource for F
where
    F: Fn() -> Option<String> + Send + Sync,
{
    fn bearer_token(&self) -> Option<String> {
        self()
    }
}

/// A fixed token.
#[derive(Debug, Clone)]
pub struct StaticToken(pub String);

impl CredentialSource for StaticToken {
    fn bearer_token(&self) -> Option<String> {
        non_empty(&self.0)
    }
}

/// Token read from an environment variable on each attempt.
#[derive(Debug, Clone)]
pub struct EnvToken {
    pub var: String,
}

impl CredentialSource for EnvToken {
    fn bearer_token(&self) -> Option<String> {
        std::env::var(&self.var).ok().as_deref().and_then(non_empty)
    }
}

/// Token read from a file on each attempt (e.g. written by a login helper).
#[derive(Debug, Clone)]
pub struct TokenFile {
    pub path: PathBuf,
}

impl CredentialSource for TokenFile {
    fn bearer_token(&self) -> Option<String> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => non_empty(&content),
            Err(e) => {
                tracing::debug!(path = %self.path.display(), "token file unreadable: {e}");
                None
            }
        }
    }
}

fn non_empty(s: &str) -> Option<String> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
