//! Mod-portal handler: API-resolved downloads plus chunked uploads.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use modferry_hashing::Hash;
use modferry_limiter::Job;
use modferry_upload::{
    ChunkedUploader, CredentialProvider, HttpUploadTransport, UploadAck, UploadDescriptor,
    UploadEndpoints,
};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use crate::handler::{SourceHandler, SourceState};
use crate::stream::fetch_to_file;
use crate::SourceError;

/// Portal connection settings.
#[derive(Debug, Clone)]
pub struct PortalConfig {
    /// API base, e.g. `https://api.portal.example.com/`.
    pub api_base: Url,
    /// Host of the portal's public site, e.g. `portal.example.com`,
    /// used to recognize pasted mod-page file links.
    pub site_host: String,
    /// Endpoints of the portal's resumable upload service.
    pub upload: UploadEndpoints,
}

/// One entry of the portal's download-link response.
#[derive(Debug, Deserialize)]
struct DownloadLink {
    #[serde(rename = "URI")]
    uri: Url,
}

/// Handles `portal://<game>/<mod_id>/<file_id>` locators and the
/// portal's own site URLs
/// (`https://<site_host>/<game>/mods/<mod_id>?file_id=<file_id>`).
///
/// Downloads resolve a short-lived link through the portal API first;
/// this is also the only source family with upload capability, exposed
/// as [`PortalHandler::upload`] outside the base handler contract.
pub struct PortalHandler {
    client: reqwest::Client,
    api_base: Url,
    site_host: String,
    credentials: Arc<dyn CredentialProvider>,
    uploader: ChunkedUploader<HttpUploadTransport>,
}

impl PortalHandler {
    pub fn new(
        client: reqwest::Client,
        config: PortalConfig,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Self {
        let transport =
            HttpUploadTransport::new(client.clone(), config.upload, Arc::clone(&credentials));
        Self {
            client,
            api_base: config.api_base,
            site_host: config.site_host,
            credentials,
            uploader: ChunkedUploader::new(transport),
        }
    }

    fn match_locator(url: &Url) -> Option<SourceState> {
        let game = url.host_str()?.to_string();
        let mut segments = url.path_segments()?;
        let mod_id = segments.next()?.parse().ok()?;
        let file_id = segments.next()?.parse().ok()?;
        Some(SourceState::Portal {
            game,
            mod_id,
            file_id,
        })
    }

    /// Recognizes a pasted mod-page link:
    /// `https://<site_host>/<game>/mods/<mod_id>?...&file_id=<file_id>`.
    fn match_site_url(&self, url: &Url) -> Option<SourceState> {
        if url.host_str()? != self.site_host {
            return None;
        }
        let mut segments = url.path_segments()?;
        let game = segments.next()?.to_string();
        if segments.next()? != "mods" {
            return None;
        }
        let mod_id = segments.next()?.parse().ok()?;
        let file_id = url
            .query_pairs()
            .find(|(k, _)| k == "file_id")?
            .1
            .parse()
            .ok()?;
        Some(SourceState::Portal {
            game,
            mod_id,
            file_id,
        })
    }

    /// Uploads a local file to the portal through the resumable chunked
    /// protocol, then attaches it to its mod. Safe to re-run after a
    /// failure; already-accepted chunks are skipped.
    pub async fn upload(
        &self,
        descriptor: &UploadDescriptor,
        job: &Job,
        token: &CancellationToken,
    ) -> Result<UploadAck, SourceError> {
        Ok(self.uploader.upload(descriptor, job, token).await?)
    }

    fn link_endpoint(&self, game: &str, mod_id: u64, file_id: u64) -> Result<Url, SourceError> {
        self.api_base
            .join(&format!(
                "v1/games/{game}/mods/{mod_id}/files/{file_id}/download_link.json"
            ))
            .map_err(|e| SourceError::Unrecognized(format!("bad portal locator: {e}")))
    }

    async fn resolve_link(
        &self,
        game: &str,
        mod_id: u64,
        file_id: u64,
    ) -> Result<Url, SourceError> {
        let endpoint = self.link_endpoint(game, mod_id, file_id)?;
        let mut req = self.client.get(endpoint);
        if let Some(key) = self.credentials.api_key() {
            req = req.header("apikey", key);
        }
        let response = req.send().await?;
        if !response.status().is_success() {
            return Err(SourceError::from_response(response).await);
        }

        let links: Vec<DownloadLink> = serde_json::from_str(&response.text().await?)
            .map_err(|e| SourceError::Protocol(format!("unexpected link response: {e}")))?;
        let link = links
            .into_iter()
            .next()
            .ok_or_else(|| SourceError::Protocol("portal returned no download links".into()))?;
        debug!(game, mod_id, file_id, "resolved portal download link");
        Ok(link.uri)
    }
}

#[async_trait]
impl SourceHandler for PortalHandler {
    fn name(&self) -> &'static str {
        "portal"
    }

    fn matches(&self, url: &Url) -> Option<SourceState> {
        match url.scheme() {
            "portal" => Self::match_locator(url),
            "http" | "https" => self.match_site_url(url),
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
        let SourceState::Portal {
            game,
            mod_id,
            file_id,
        } = state
        else {
            return Err(SourceError::Unrecognized(format!(
                "portal handler given {} state",
                state.family()
            )));
        };
        let url = self.resolve_link(game, *mod_id, *file_id).await?;
        fetch_to_file(self.client.get(url), dest, job, token).await
    }
}
