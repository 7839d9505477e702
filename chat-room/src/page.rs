use std::{
    io,
    path::{Path, PathBuf},
};

use axum::http::uri::Authority;
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::info;

/// File name of the chat page inside the templates directory.
pub const PAGE_FILE: &str = "chat.html";

const HOST_PLACEHOLDER: &str = "{{host}}";

#[derive(Debug, Error)]
pub enum PageError {
    #[error("failed to read template {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("host {0:?} is not a valid authority")]
    InvalidHost(String),
}

/// The chat page, read from disk on first use and cached afterwards.
///
/// Concurrent first requests share a single load. A failed load is not
/// cached, so the next request tries again.
#[derive(Debug)]
pub struct PageTemplate {
    path: PathBuf,
    source: OnceCell<String>,
}

impl PageTemplate {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            source: OnceCell::new(),
        }
    }

    /// Template for [`PAGE_FILE`] inside `dir`.
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        Self::new(dir.as_ref().join(PAGE_FILE))
    }

    /// Renders the page for a request that arrived with the given `Host`.
    ///
    /// The host lands inside a script, so anything that is not a plain
    /// `host[:port]` is rejected before it reaches the page.
    pub async fn render(&self, host: &str) -> Result<String, PageError> {
        let host = parse_host(host)?;
        let source = self.source.get_or_try_init(|| self.load()).await?;
        Ok(source.replace(HOST_PLACEHOLDER, host.as_str()))
    }

    async fn load(&self) -> Result<String, PageError> {
        let source = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| PageError::Read {
                path: self.path.clone(),
                source,
            })?;
        info!(path = %self.path.display(), "page template loaded");
        Ok(source)
    }
}

/// Accepts a registered name, IPv4 or bracketed IPv6 address with an
/// optional port. Userinfo and anything needing escapes are refused.
fn parse_host(host: &str) -> Result<Authority, PageError> {
    let plain = host
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b':' | b'[' | b']'));
    match host.parse::<Authority>() {
        Ok(authority) if plain => Ok(authority),
        _ => Err(PageError::InvalidHost(host.to_owned())),
    }
}
