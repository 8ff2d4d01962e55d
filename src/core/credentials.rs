//! Ordered credential lookup for the deposit step.

use std::fmt::{self, Display};
use std::path::PathBuf;

use log::{debug, warn};

/// A place a deposit token may come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenSource {
    /// First line-trimmed content of a file
    File(PathBuf),
    /// Value of an environment variable
    Env(String),
}

impl Display for TokenSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenSource::File(path) => write!(f, "token file {}", path.display()),
            TokenSource::Env(name) => write!(f, "environment variable {}", name),
        }
    }
}

impl TokenSource {
    fn read<L>(&self, lookup_env: &L) -> Option<String>
    where
        L: Fn(&str) -> Option<String>,
    {
        let raw = match self {
            TokenSource::File(path) => {
                if !path.exists() {
                    return None;
                }
                match std::fs::read_to_string(path) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("Failed reading {}: {}", self, e);
                        return None;
                    }
                }
            }
            TokenSource::Env(name) => lookup_env(name)?,
        };

        let token = raw.trim();
        if token.is_empty() {
            None
        } else {
            Some(token.to_string())
        }
    }
}

/// Return the first non-empty token among `sources`, with the source it came from
pub fn resolve_token_with<'a, L>(sources: &'a [TokenSource], lookup_env: L) -> Option<(String, &'a TokenSource)>
where
    L: Fn(&str) -> Option<String>,
{
    for source in sources {
        if let Some(token) = source.read(&lookup_env) {
            debug!("Using deposit token from {}", source);
            return Some((token, source));
        }
    }
    None
}

/// Resolve against the process environment
pub fn resolve_token(sources: &[TokenSource]) -> Option<(String, &TokenSource)> {
    resolve_token_with(sources, |name| std::env::var(name).ok())
}
