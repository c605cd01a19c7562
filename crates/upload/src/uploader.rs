//! The resumable upload driver.

use std::io::SeekFrom;
use std::time::Duration;

use async_trait::async_trait;
use modferry_limiter::Job;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::UploadError;
use crate::descriptor::{Chunk, UploadDescriptor};
use crate::wire::{ChunkState, UploadAck};

/// Fixed interval between assembly-status polls.
const ASSEMBLY_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// The four remote operations the protocol needs.
///
/// Production uses [`HttpUploadTransport`](crate::HttpUploadTransport);
/// tests substitute a mock, keeping the driver independent of any real
/// host.
#[async_trait]
pub trait UploadTransport: Send + Sync {
    /// Queries whether the server already holds `chunk`.
    async fn chunk_status(
        &self,
        descriptor: &UploadDescriptor,
        chunk: Chunk,
    ) -> Result<ChunkState, UploadError>;

    /// Sends one chunk payload; the acknowledgement carries the
    /// assembly-tracking id.
    async fn upload_chunk(
        &self,
        descriptor: &UploadDescriptor,
        chunk: Chunk,
        payload: Vec<u8>,
    ) -> Result<UploadAck, UploadError>;

    /// Returns whether all chunks have been assembled server-side.
    async fn assembly_status(&self, uuid: &str) -> Result<bool, UploadError>;

    /// Attaches the assembled blob to its logical target. Non-idempotent.
    async fn finalize(
        &self,
        descriptor: &UploadDescriptor,
        ack: &UploadAck,
    ) -> Result<(), UploadError>;
}

/// Drives the chunk sequence for one logical upload.
pub struct ChunkedUploader<T> {
    transport: T,
    poll_interval: Duration,
}

impl<T: UploadTransport> ChunkedUploader<T> {
    /// Creates an uploader over the given transport.
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            poll_interval: ASSEMBLY_POLL_INTERVAL,
        }
    }

    /// Uploads the descriptor's file, resuming any server-side partial
    /// state, then finalizes it onto its target.
    ///
    /// Chunks are processed strictly in index order: each is queried
    /// first and sent only when the server reports it missing, so
    /// re-running this after a failure transmits zero duplicate
    /// payloads. Progress (including skipped chunks) is reported to
    /// `job`. The assembly poll has no intrinsic timeout; bound it
    /// through `token`.
    pub async fn upload(
        &self,
        descriptor: &UploadDescriptor,
        job: &Job,
        token: &CancellationToken,
    ) -> Result<UploadAck, UploadError> {
        let total = descriptor.chunk_count();
        if total == 0 {
            return Err(UploadError::Protocol("refusing to upload an empty file".into()));
        }

        let mut file = tokio::fs::File::open(&descriptor.path).await?;
        let mut ack: Option<UploadAck> = None;

        for chunk in descriptor.chunks() {
            if token.is_cancelled() {
                return Err(UploadError::Cancelled);
            }

            match self.transport.chunk_status(descriptor, chunk).await? {
                ChunkState::AlreadyUploaded(server_ack) => {
                    debug!(
                        chunk = chunk.index,
                        total,
                        file = %descriptor.file_name(),
                        "chunk already uploaded, skipping"
                    );
                    if !server_ack.uuid.is_empty() {
                        ack = Some(server_ack);
                    }
                }
                ChunkState::NotYetUploaded => {
                    debug!(
                        chunk = chunk.index,
                        total,
                        size = chunk.size,
                        file = %descriptor.file_name(),
                        "uploading chunk"
                    );
                    file.seek(SeekFrom::Start(chunk.offset)).await?;
                    let mut payload = vec![0u8; chunk.size as usize];
                    file.read_exact(&mut payload).await?;
                    ack = Some(self.transport.upload_chunk(descriptor, chunk, payload).await?);
                }
            }

            job.report(chunk.size, token).await?;
        }

        let ack = ack
            .filter(|a| !a.uuid.is_empty())
            .ok_or_else(|| {
                UploadError::Protocol("server never assigned an assembly id".into())
            })?;

        loop {
            if self.transport.assembly_status(&ack.uuid).await? {
                break;
            }
            debug!(uuid = %ack.uuid, "chunks not yet assembled, polling again");
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = token.cancelled() => return Err(UploadError::Cancelled),
            }
        }

        info!(
            file = %descriptor.file_name(),
            uuid = %ack.uuid,
            mod_id = descriptor.mod_id,
            "chunks assembled, finalizing upload"
        );
        self.transport.finalize(descriptor, &ack).await?;
        Ok(ack)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modferry_limiter::{Limiter, LimiterConfig};
    use std::collections::HashSet;
    use std::io::Write;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    const MIB: u64 = 1024 * 1024;

    /// Scripted transport recording every call.
    #[derive(Default)]
    struct MockTransport {
        /// Chunk indexes the "server" already holds.
        pre_uploaded: HashSet<u64>,
        /// Assembly reports false this many times before true.
        pending_polls: AtomicU32,
        /// Fail uploads of this chunk index with a transport error.
        fail_chunk: Option<u64>,
        /// Never report assembled (for cancellation tests).
        never_assembles: bool,
        /// uuid included in acks for pre-uploaded chunk statuses.
        status_uuid: String,

        status_queries: Mutex<Vec<u64>>,
        uploads: Mutex<Vec<(u64, Vec<u8>)>>,
        polls: AtomicU32,
        finalizes: AtomicU32,
    }

    #[async_trait]
    impl UploadTransport for MockTransport {
        async fn chunk_status(
            &self,
            _descriptor: &UploadDescriptor,
            chunk: Chunk,
        ) -> Result<ChunkState, UploadError> {
            self.status_queries.lock().unwrap().push(chunk.index);
            if self.pre_uploaded.contains(&chunk.index) {
                Ok(ChunkState::AlreadyUploaded(UploadAck {
                    status: true,
                    uuid: self.status_uuid.clone(),
                    filename: "blob_assembled".into(),
                }))
            } else {
                Ok(ChunkState::NotYetUploaded)
            }
        }

        async fn upload_chunk(
            &self,
            _descriptor: &UploadDescriptor,
            chunk: Chunk,
            payload: Vec<u8>,
        ) -> Result<UploadAck, UploadError> {
            if self.fail_chunk == Some(chunk.index) {
                return Err(UploadError::Transport {
                    status: 502,
                    body: "bad gateway".into(),
                });
            }
            self.uploads.lock().unwrap().push((chunk.index, payload));
            Ok(UploadAck {
                status: true,
                uuid: "mock-uuid".into(),
                filename: "blob_assembled".into(),
            })
        }

        async fn assembly_status(&self, _uuid: &str) -> Result<bool, UploadError> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            if self.never_assembles {
                return Ok(false);
            }
            if self.pending_polls.load(Ordering::SeqCst) > 0 {
                self.pending_polls.fetch_sub(1, Ordering::SeqCst);
                return Ok(false);
            }
            Ok(true)
        }

        async fn finalize(
            &self,
            _descriptor: &UploadDescriptor,
            _ack: &UploadAck,
        ) -> Result<(), UploadError> {
            self.finalizes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        descriptor: UploadDescriptor,
        content: Vec<u8>,
    }

    /// Writes a 12 MiB file (3 chunks at 5 MiB) with a position-derived
    /// byte pattern so payload ranges are verifiable.
    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("artifact.zip");
        let content: Vec<u8> = (0..12 * MIB).map(|i| (i % 251) as u8).collect();
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(&content).unwrap();

        let descriptor = UploadDescriptor {
            path,
            file_size: content.len() as u64,
            game_id: 1704,
            mod_id: 42,
            name: "Artifact".into(),
            version: "1.0".into(),
            category: 1,
            remove_old_version: false,
            new_existing: true,
            set_as_main: false,
            old_file_id: 0,
            brief_overview: String::new(),
        };
        Fixture {
            _dir: dir,
            descriptor,
            content,
        }
    }

    async fn job(size: u64) -> (Limiter, Job) {
        let lim = Limiter::new(LimiterConfig::concurrency("uploads", 4));
        let job = lim
            .begin("upload", size, &CancellationToken::new())
            .await
            .unwrap();
        (lim, job)
    }

    #[tokio::test]
    async fn full_upload_sends_every_chunk_in_order() {
        let fx = fixture();
        let uploader = ChunkedUploader::new(MockTransport::default());
        let (_lim, job) = job(fx.descriptor.file_size).await;
        let token = CancellationToken::new();

        let ack = uploader.upload(&fx.descriptor, &job, &token).await.unwrap();
        assert_eq!(ack.uuid, "mock-uuid");

        let uploads = uploader.transport.uploads.lock().unwrap();
        let indexes: Vec<u64> = uploads.iter().map(|(i, _)| *i).collect();
        assert_eq!(indexes, vec![0, 1, 2]);

        // Payloads are the exact byte ranges of the file.
        for (index, payload) in uploads.iter() {
            let start = (index * 5 * MIB) as usize;
            let end = (start + payload.len()).min(fx.content.len());
            assert_eq!(payload.as_slice(), &fx.content[start..end]);
        }

        assert_eq!(uploader.transport.finalizes.load(Ordering::SeqCst), 1);
        assert_eq!(job.transferred(), fx.descriptor.file_size);
    }

    #[tokio::test]
    async fn resume_sends_only_missing_chunks() {
        let fx = fixture();
        let transport = MockTransport {
            pre_uploaded: HashSet::from([0, 1]),
            status_uuid: "server-uuid".into(),
            ..Default::default()
        };
        let uploader = ChunkedUploader::new(transport);
        let (_lim, job) = job(fx.descriptor.file_size).await;
        let token = CancellationToken::new();

        uploader.upload(&fx.descriptor, &job, &token).await.unwrap();

        // Every chunk is queried, but only the missing one is sent:
        // zero duplicate payload transmissions.
        assert_eq!(*uploader.transport.status_queries.lock().unwrap(), vec![0, 1, 2]);
        let uploads = uploader.transport.uploads.lock().unwrap();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].0, 2);
        assert_eq!(uploader.transport.finalizes.load(Ordering::SeqCst), 1);

        // Skipped chunks still count toward progress.
        assert_eq!(job.transferred(), fx.descriptor.file_size);
    }

    #[tokio::test]
    async fn fully_uploaded_file_finalizes_without_sending_bytes() {
        let fx = fixture();
        let transport = MockTransport {
            pre_uploaded: HashSet::from([0, 1, 2]),
            status_uuid: "server-uuid".into(),
            ..Default::default()
        };
        let uploader = ChunkedUploader::new(transport);
        let (_lim, job) = job(fx.descriptor.file_size).await;
        let token = CancellationToken::new();

        let ack = uploader.upload(&fx.descriptor, &job, &token).await.unwrap();
        // The assembly id came from the status queries.
        assert_eq!(ack.uuid, "server-uuid");
        assert!(uploader.transport.uploads.lock().unwrap().is_empty());
        assert_eq!(uploader.transport.finalizes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transport_failure_fails_the_whole_operation() {
        let fx = fixture();
        let transport = MockTransport {
            fail_chunk: Some(1),
            ..Default::default()
        };
        let uploader = ChunkedUploader::new(transport);
        let (_lim, job) = job(fx.descriptor.file_size).await;
        let token = CancellationToken::new();

        let err = uploader
            .upload(&fx.descriptor, &job, &token)
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Transport { status: 502, .. }));
        // No retry, no finalize.
        assert_eq!(uploader.transport.finalizes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn assembly_is_polled_until_complete() {
        let fx = fixture();
        let transport = MockTransport {
            pending_polls: AtomicU32::new(3),
            ..Default::default()
        };
        let uploader = ChunkedUploader::new(transport);
        let (_lim, job) = job(fx.descriptor.file_size).await;
        let token = CancellationToken::new();

        uploader.upload(&fx.descriptor, &job, &token).await.unwrap();
        // Three "not yet" polls plus the final success.
        assert_eq!(uploader.transport.polls.load(Ordering::SeqCst), 4);
        assert_eq!(uploader.transport.finalizes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelling_the_assembly_poll_stops_the_upload() {
        let fx = fixture();
        let transport = MockTransport {
            never_assembles: true,
            ..Default::default()
        };
        let uploader = ChunkedUploader::new(transport);
        let (_lim, job) = job(fx.descriptor.file_size).await;
        let token = CancellationToken::new();

        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(12)).await;
            cancel.cancel();
        });

        let err = uploader
            .upload(&fx.descriptor, &job, &token)
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Cancelled));
        assert_eq!(uploader.transport.finalizes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn empty_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.zip");
        std::fs::write(&path, b"").unwrap();

        let fx = fixture();
        let descriptor = UploadDescriptor {
            path,
            file_size: 0,
            ..fx.descriptor
        };
        let uploader = ChunkedUploader::new(MockTransport::default());
        let (_lim, job) = job(0).await;
        let token = CancellationToken::new();

        let err = uploader.upload(&descriptor, &job, &token).await.unwrap_err();
        assert!(matches!(err, UploadError::Protocol(_)));
    }

    #[tokio::test]
    async fn missing_assembly_id_is_a_protocol_violation() {
        let fx = fixture();
        // Server claims everything is uploaded but never hands out a uuid.
        let transport = MockTransport {
            pre_uploaded: HashSet::from([0, 1, 2]),
            status_uuid: String::new(),
            ..Default::default()
        };
        let uploader = ChunkedUploader::new(transport);
        let (_lim, job) = job(fx.descriptor.file_size).await;
        let token = CancellationToken::new();

        let err = uploader
            .upload(&fx.descriptor, &job, &token)
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Protocol(_)));
    }
}
