//! Plain-URL fallback handler.

use std::path::Path;

use async_trait::async_trait;
use modferry_hashing::Hash;
use modferry_limiter::Job;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::handler::{SourceHandler, SourceState};
use crate::stream::fetch_to_file;
use crate::SourceError;

/// Fetches any `http(s)` URL as-is. Registered last: more specific
/// handlers get first claim on their own URL shapes.
pub struct DirectUrlHandler {
    client: reqwest::Client,
}

impl DirectUrlHandler {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SourceHandler for DirectUrlHandler {
    fn name(&self) -> &'static str {
        "direct"
    }

    fn matches(&self, url: &Url) -> Option<SourceState> {
        match url.scheme() {
            "http" | "https" => Some(SourceState::Direct { url: url.clone() }),
            _ => None,
        }
    }

    async fn download(
        &self,
        state: &SourceState,
        dest: &Path,
        job: &Job,
        token: &CancellationToken,
    ) -> Result<Hash, SourceError> {
        let SourceState::Direct { url } = state else {
            return Err(SourceError::Unrecognized(format!(
                "direct handler given {} state",
                state.family()
            )));
        };
        fetch_to_file(self.client.get(url.clone()), dest, job, token).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handler() -> DirectUrlHandler {
        DirectUrlHandler::new(reqwest::Client::new())
    }

    #[test]
    fn matches_http_and_https() {
        let h = handler();
        let url = Url::parse("https://files.example.com/pack.7z").unwrap();
        assert_eq!(
            h.matches(&url),
            Some(SourceState::Direct { url: url.clone() })
        );
        assert!(h.matches(&Url::parse("http://example.com/a").unwrap()).is_some());
    }

    #[test]
    fn rejects_other_schemes() {
        let h = handler();
        assert!(h.matches(&Url::parse("ftp://example.com/a").unwrap()).is_none());
        assert!(h.matches(&Url::parse("portal://skyrim/1/2").unwrap()).is_none());
    }
}
