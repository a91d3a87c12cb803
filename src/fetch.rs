//! Cache-busting source fetch for autoreload.
//!
//! The content script polls its own URL to detect edits; the fetch has to
//! bypass every intermediate cache, so a throwaway `preventCache` query
//! parameter is appended to each request.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{Error, Result};

/// HTTP fetcher for the `autoreload` message.
#[derive(Debug, Clone, Default)]
pub struct Fetcher {
    client: reqwest::Client,
}

impl Fetcher {
    /// Fetcher with a default client.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch `location`, bypassing caches, and return the body text.
    pub async fn fetch_fresh(&self, location: &str) -> Result<String> {
        let separator = if location.contains('?') { '&' } else { '?' };
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        let url = format!("{location}{separator}preventCache={stamp}");

        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Platform(format!(
                "HTTP {status} fetching {location}"
            )));
        }
        Ok(response.text().await?)
    }
}
