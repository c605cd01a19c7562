//! Shared streaming download path used by every handler.
//!
//! Bytes go to a `.part` file next to the destination and are renamed
//! into place only once the stream completed, so a crashed download
//! never leaves a plausible-looking partial file at the target path.

use std::path::{Path, PathBuf};

use modferry_hashing::{Hash, Hasher};
use modferry_limiter::Job;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::SourceError;

/// Fetches `url` and streams the response body to `dest`, hashing
/// while writing and reporting every received chunk to `job`.
///
/// Updates the job's expected size from `Content-Length` when the size
/// was unknown at admission time.
pub(crate) async fn fetch_to_file(
    request: reqwest::RequestBuilder,
    dest: &Path,
    job: &Job,
    token: &CancellationToken,
) -> Result<Hash, SourceError> {
    let response = request.send().await?;
    if !response.status().is_success() {
        return Err(SourceError::from_response(response).await);
    }

    if job.size() == 0 {
        if let Some(len) = response.content_length() {
            job.set_size(len);
        }
    }

    let part = part_path(dest);
    let result = write_stream(response, &part, job, token).await;
    match result {
        Ok(hash) => {
            tokio::fs::rename(&part, dest).await?;
            debug!(dest = %dest.display(), %hash, "download complete");
            Ok(hash)
        }
        Err(e) => {
            if let Err(rm) = tokio::fs::remove_file(&part).await {
                if rm.kind() != std::io::ErrorKind::NotFound {
                    warn!(part = %part.display(), error = %rm, "failed to remove partial file");
                }
            }
            Err(e)
        }
    }
}

async fn write_stream(
    mut response: reqwest::Response,
    part: &Path,
    job: &Job,
    token: &CancellationToken,
) -> Result<Hash, SourceError> {
    if let Some(parent) = part.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::File::create(part).await?;
    let mut hasher = Hasher::new();

    while let Some(chunk) = response.chunk().await? {
        file.write_all(&chunk).await?;
        hasher.update(&chunk);
        // Report is also the cancellation and pacing point.
        job.report(chunk.len() as u64, token).await?;
    }

    file.flush().await?;
    Ok(hasher.finalize())
}

/// The temporary sibling a download streams into.
pub(crate) fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    dest.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use modferry_hashing::hash_bytes;
    use modferry_limiter::{Limiter, LimiterConfig};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn part_path_appends_suffix() {
        assert_eq!(
            part_path(Path::new("/downloads/pack.7z")),
            PathBuf::from("/downloads/pack.7z.part")
        );
    }

    #[test]
    fn part_path_keeps_directory() {
        let p = part_path(Path::new("/a/b/c.bin"));
        assert_eq!(p.parent(), Some(Path::new("/a/b")));
    }

    /// Serves one canned HTTP response, then closes. `advertised_len`
    /// may exceed the body to simulate a connection cut mid-stream.
    async fn serve(
        status_line: &'static str,
        body: &'static [u8],
        advertised_len: usize,
    ) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let _ = sock.read(&mut buf).await;
            let header = format!(
                "HTTP/1.1 {status_line}\r\ncontent-length: {advertised_len}\r\nconnection: close\r\n\r\n"
            );
            let _ = sock.write_all(header.as_bytes()).await;
            let _ = sock.write_all(body).await;
        });
        format!("http://{addr}/artifact")
    }

    async fn job() -> (Limiter, Job) {
        let lim = Limiter::new(LimiterConfig::concurrency("test", 2));
        let job = lim
            .begin("dl", 0, &CancellationToken::new())
            .await
            .unwrap();
        (lim, job)
    }

    #[tokio::test]
    async fn streams_hashes_and_renames_into_place() {
        const BODY: &[u8] = b"streamed artifact content";
        let url = serve("200 OK", BODY, BODY.len()).await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("downloads").join("pack.7z");
        let (_lim, job) = job().await;

        let hash = fetch_to_file(
            reqwest::Client::new().get(&url),
            &dest,
            &job,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(hash, hash_bytes(BODY));
        assert_eq!(std::fs::read(&dest).unwrap(), BODY);
        assert!(!part_path(&dest).exists(), "no .part left after success");

        // Size was unknown at admission and picked up from the headers.
        assert_eq!(job.size(), BODY.len() as u64);
        assert_eq!(job.transferred(), BODY.len() as u64);
    }

    #[tokio::test]
    async fn non_success_response_is_a_transport_error() {
        let url = serve("404 Not Found", b"gone", 4).await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("pack.7z");
        let (_lim, job) = job().await;

        let err = fetch_to_file(
            reqwest::Client::new().get(&url),
            &dest,
            &job,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, SourceError::Transport { status: 404, .. }));
        assert!(!dest.exists());
        assert!(!part_path(&dest).exists());
    }

    #[tokio::test]
    async fn truncated_stream_cleans_up_the_partial_file() {
        // The server promises 100 bytes but cuts the connection after 20.
        let url = serve("200 OK", &[7u8; 20], 100).await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("pack.7z");
        let (_lim, job) = job().await;

        let result = fetch_to_file(
            reqwest::Client::new().get(&url),
            &dest,
            &job,
            &CancellationToken::new(),
        )
        .await;

        assert!(result.is_err());
        assert!(!dest.exists(), "destination must not appear on failure");
        assert!(!part_path(&dest).exists(), "partial file must be removed");
    }
}
