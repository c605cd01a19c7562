//! CDN mirror handler.

use std::path::Path;

use async_trait::async_trait;
use modferry_hashing::Hash;
use modferry_limiter::Job;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::handler::{SourceHandler, SourceState};
use crate::stream::fetch_to_file;
use crate::SourceError;

/// Resolves `mirror://<machine_name>` locators against a configured
/// CDN base URL (`<base>/<machine_name>`).
pub struct MirrorHandler {
    client: reqwest::Client,
    base: Url,
}

impl MirrorHandler {
    /// `base` should end with a trailing slash so joins append rather
    /// than replace the last path segment.
    pub fn new(client: reqwest::Client, base: Url) -> Self {
        Self { client, base }
    }

    fn file_url(&self, machine_name: &str) -> Result<Url, SourceError> {
        self.base
            .join(machine_name)
            .map_err(|e| SourceError::Unrecognized(format!("bad mirror name {machine_name}: {e}")))
    }
}

#[async_trait]
impl SourceHandler for MirrorHandler {
    fn name(&self) -> &'static str {
        "mirror"
    }

    fn matches(&self, url: &Url) -> Option<SourceState> {
        if url.scheme() != "mirror" {
            return None;
        }
        let machine_name = url.host_str()?.to_string();
        Some(SourceState::Mirror { machine_name })
    }

    async fn download(
        &self,
        state: &SourceState,
        dest: &Path,
        job: &Job,
        token: &CancellationToken,
    ) -> Result<Hash, SourceError> {
        let SourceState::Mirror { machine_name } = state else {
            return Err(SourceError::Unrecognized(format!(
                "mirror handler given {} state",
                state.family()
            )));
        };
        let url = self.file_url(machine_name)?;
        fetch_to_file(self.client.get(url), dest, job, token).await
    }
}
