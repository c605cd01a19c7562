//! HTTP implementation of [`UploadTransport`] over reqwest.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::multipart::{Form, Part};
use tracing::debug;
use url::Url;

use crate::descriptor::{Chunk, UploadDescriptor};
use crate::uploader::UploadTransport;
use crate::wire::{AssemblyStatus, ChunkState, UploadAck};
use crate::{CHUNK_SIZE, UploadError};

/// Supplies per-request credentials. Acquisition and refresh are the
/// caller's concern; this layer only attaches what it is handed.
pub trait CredentialProvider: Send + Sync {
    /// API key header value, if the host uses one.
    fn api_key(&self) -> Option<String>;
    /// Session cookie header value, required by the finalize endpoint.
    fn session_cookie(&self) -> Option<String>;
}

/// Endpoint set for one artifact host.
#[derive(Debug, Clone)]
pub struct UploadEndpoints {
    /// Chunk status (GET) and chunk upload (POST) endpoint.
    pub chunk: Url,
    /// Assembly-status endpoint, polled with `?id=<uuid>`.
    pub check_status: Url,
    /// Finalize endpoint attaching the assembled blob to its target.
    pub finalize: Url,
}

/// [`UploadTransport`] speaking the resumable wire protocol over HTTPS.
pub struct HttpUploadTransport {
    client: reqwest::Client,
    endpoints: UploadEndpoints,
    credentials: Arc<dyn CredentialProvider>,
}

impl HttpUploadTransport {
    /// Creates a transport using a shared reqwest client.
    pub fn new(
        client: reqwest::Client,
        endpoints: UploadEndpoints,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Self {
        Self {
            client,
            endpoints,
            credentials,
        }
    }

    fn apply_credentials(&self, mut req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some(key) = self.credentials.api_key() {
            req = req.header("apikey", key);
        }
        if let Some(cookie) = self.credentials.session_cookie() {
            req = req.header(reqwest::header::COOKIE, cookie);
        }
        req
    }
}

/// The resumable.js-style field set shared by chunk status queries and
/// chunk uploads. Chunk numbers on the wire are 1-based.
fn resumable_fields(descriptor: &UploadDescriptor, chunk: Chunk) -> Vec<(&'static str, String)> {
    vec![
        ("resumableChunkNumber", (chunk.index + 1).to_string()),
        ("resumableChunkSize", CHUNK_SIZE.to_string()),
        ("resumableCurrentChunkSize", chunk.size.to_string()),
        ("resumableTotalSize", descriptor.file_size.to_string()),
        ("resumableType", String::new()),
        ("resumableIdentifier", descriptor.resumable_identifier()),
        ("resumableFilename", descriptor.file_name()),
        ("resumableRelativePath", descriptor.file_name()),
        ("resumableTotalChunks", descriptor.chunk_count().to_string()),
    ]
}

fn parse_json<T: serde::de::DeserializeOwned>(body: &str) -> Result<T, UploadError> {
    serde_json::from_str(body)
        .map_err(|e| UploadError::Protocol(format!("unexpected response shape: {e}")))
}

#[async_trait]
impl UploadTransport for HttpUploadTransport {
    async fn chunk_status(
        &self,
        descriptor: &UploadDescriptor,
        chunk: Chunk,
    ) -> Result<ChunkState, UploadError> {
        let req = self
            .client
            .get(self.endpoints.chunk.clone())
            .query(&resumable_fields(descriptor, chunk));
        let response = self.apply_credentials(req).send().await?;

        if response.status() == StatusCode::NO_CONTENT {
            return Ok(ChunkState::NotYetUploaded);
        }
        if !response.status().is_success() {
            return Err(UploadError::from_response(response).await);
        }

        // Only 204 means the chunk must be sent. A 200 body means the
        // server holds it, even while `status` is still false during
        // server-side processing; re-sending such a chunk would be a
        // duplicate transmission.
        let ack: UploadAck = parse_json(&response.text().await?)?;
        Ok(ChunkState::AlreadyUploaded(ack))
    }

    async fn upload_chunk(
        &self,
        descriptor: &UploadDescriptor,
        chunk: Chunk,
        payload: Vec<u8>,
    ) -> Result<UploadAck, UploadError> {
        let mut form = Form::new();
        for (name, value) in resumable_fields(descriptor, chunk) {
            form = form.text(name, value);
        }
        form = form.part("file", Part::bytes(payload).file_name("blob"));

        let req = self.client.post(self.endpoints.chunk.clone()).multipart(form);
        let response = self.apply_credentials(req).send().await?;

        if response.status() != StatusCode::OK {
            return Err(UploadError::from_response(response).await);
        }
        parse_json(&response.text().await?)
    }

    async fn assembly_status(&self, uuid: &str) -> Result<bool, UploadError> {
        let req = self
            .client
            .get(self.endpoints.check_status.clone())
            .query(&[("id", uuid)]);
        let response = self.apply_credentials(req).send().await?;

        if !response.status().is_success() {
            return Err(UploadError::from_response(response).await);
        }
        let status: AssemblyStatus = parse_json(&response.text().await?)?;
        debug!(uuid, assembled = status.file_chunks_assembled, "assembly status");
        Ok(status.file_chunks_assembled)
    }

    async fn finalize(
        &self,
        descriptor: &UploadDescriptor,
        ack: &UploadAck,
    ) -> Result<(), UploadError> {
        let form = Form::new()
            .text("game_id", descriptor.game_id.to_string())
            .text("name", descriptor.name.clone())
            .text("file-version", descriptor.version.clone())
            .text("update-version", bit(descriptor.remove_old_version))
            .text("category", descriptor.category.to_string())
            .text("new-existing", bit(descriptor.new_existing))
            .text("old_file_id", descriptor.old_file_id.to_string())
            .text("remove-old-version", bit(descriptor.remove_old_version))
            .text("brief-overview", descriptor.brief_overview.clone())
            .text("set_as_main", bit(descriptor.set_as_main))
            .text("file_uuid", ack.uuid.clone())
            .text("file_size", descriptor.file_size.to_string())
            .text("mod_id", descriptor.mod_id.to_string())
            .text("id", descriptor.mod_id.to_string())
            .text("action", "save")
            .text("uploaded_file", ack.filename.clone())
            .text("original_file", descriptor.file_name());

        let req = self.client.post(self.endpoints.finalize.clone()).multipart(form);
        let response = self.apply_credentials(req).send().await?;

        if !response.status().is_success() {
            return Err(UploadError::from_response(response).await);
        }
        Ok(())
    }
}

fn bit(flag: bool) -> String {
    if flag { "1".into() } else { "0".into() }
}
