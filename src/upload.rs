use crate::archive::ContentArchive;
use crate::engine::ProgressSender;
use crate::error::{PipelineError, PipelineResult};
use crate::progress::ProgressTracker;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

pub const DEFAULT_MAX_CHUNK_SIZE: usize = 100 * 1024 * 1024;
pub const CAR_CONTENT_TYPE: &str = "application/car";

// Request bodies are streamed in slices of this size so progress moves during a chunk.
// A slice counts as sent once the client asks for the next one, and the last
// slice only once the server has accepted the chunk.
const PROGRESS_SLICE: usize = 64 * 1024;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadChunk {
    pub index: usize,
    pub data: Bytes,
}

/// Split `data` into consecutive chunks of at most `max` bytes.
pub fn split_chunks(data: &Bytes, max: usize) -> Vec<UploadChunk> {
    let max = max.max(1);
    (0..data.len())
        .step_by(max)
        .enumerate()
        .map(|(index, start)| UploadChunk {
            index,
            data: data.slice(start..(start + max).min(data.len())),
        })
        .collect()
}

/// Sends one archive chunk to the storage service.
#[async_trait]
pub trait ChunkTransport: Send + Sync {
    /// Byte progress of this chunk (0.0..=1.0) goes to `progress`.
    async fn send_chunk(
        &self,
        chunk: UploadChunk,
        credential: &str,
        progress: ProgressSender,
    ) -> PipelineResult<()>;
}

/// `POST {base}/upload` over HTTP with a streamed body.
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpTransport {
    pub fn new(base_url: &str) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self {
            client,
            endpoint: format!("{}/upload", base_url.trim_end_matches('/')),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl ChunkTransport for HttpTransport {
    async fn send_chunk(
        &self,
        chunk: UploadChunk,
        credential: &str,
        progress: ProgressSender,
    ) -> PipelineResult<()> {
        let index = chunk.index;
        let total = chunk.data.len();
        let slices: Vec<Bytes> = (0..total)
            .step_by(PROGRESS_SLICE)
            .map(|start| chunk.data.slice(start..(start + PROGRESS_SLICE).min(total)))
            .collect();

        let mut handed_off = 0usize;
        let body_progress = progress.clone();
        let body = futures::stream::iter(slices).map(move |slice| {
            if handed_off > 0 {
                let _ = body_progress.send(handed_off as f64 / total as f64);
            }
            handed_off += slice.len();
            Ok::<Bytes, std::io::Error>(slice)
        });

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(credential)
            .header(CONTENT_TYPE, CAR_CONTENT_TYPE)
            .header(CONTENT_LENGTH, total)
            .body(reqwest::Body::wrap_stream(body))
            .send()
            .await
            .map_err(|e| PipelineError::Upload {
                chunk_index: index,
                reason: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(PipelineError::Upload {
                chunk_index: index,
                reason: format!("storage service responded {status}: {}", text.trim()),
            });
        }

        let _ = progress.send(1.0);
        debug!(chunk = index, bytes = total, %status, "Chunk accepted");
        Ok(())
    }
}

/// Uploads an archive as an ordered sequence of chunks, one in flight.
pub struct ChunkedUploader<T> {
    transport: T,
    max_chunk_size: usize,
    default_credential: String,
}

impl<T: ChunkTransport> ChunkedUploader<T> {
    pub fn new(transport: T, max_chunk_size: usize, default_credential: impl Into<String>) -> Self {
        Self {
            transport,
            max_chunk_size: max_chunk_size.max(1),
            default_credential: default_credential.into(),
        }
    }

    #[cfg(test)]
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// The caller's credential, or the configured one when absent or blank.
    pub fn credential_for(&self, credential: Option<&str>) -> String {
        match credential.map(str::trim) {
            Some(c) if !c.is_empty() => c.to_string(),
            _ => self.default_credential.clone(),
        }
    }

    /// Upload every chunk of `archive` and return its content id.
    ///
    /// `progress` receives the archive-level fraction after every update.
    /// The archive's block store is released whatever the outcome.
    pub async fn upload(
        &self,
        archive: ContentArchive,
        credential: Option<&str>,
        progress: ProgressSender,
    ) -> PipelineResult<String> {
        let content_id = archive.content_id();
        let credential = self.credential_for(credential);
        let chunks = split_chunks(archive.bytes(), self.max_chunk_size);

        info!(
            content_id = %content_id,
            bytes = archive.len(),
            blocks = archive.block_count(),
            chunks = chunks.len(),
            "Uploading archive"
        );

        let result = self.send_all(chunks, &credential, &progress).await;
        archive.release();

        match result {
            Ok(()) => {
                info!(content_id = %content_id, "Archive uploaded");
                Ok(content_id)
            }
            Err(e) => {
                error!(content_id = %content_id, error = %e, "Archive upload failed");
                Err(e)
            }
        }
    }

    async fn send_all(
        &self,
        chunks: Vec<UploadChunk>,
        credential: &str,
        progress: &ProgressSender,
    ) -> PipelineResult<()> {
        let mut tracker = ProgressTracker::new(chunks.len());

        for chunk in chunks {
            let index = chunk.index;
            let (tx, mut rx) = mpsc::unbounded_channel();
            let send = self.transport.send_chunk(chunk, credential, tx);
            tokio::pin!(send);

            let result = loop {
                tokio::select! {
                    result = &mut send => break result,
                    Some(fraction) = rx.recv() => {
                        tracker.record(index, fraction);
                        let _ = progress.send(tracker.fraction());
                    }
                }
            };
            while let Ok(fraction) = rx.try_recv() {
                tracker.record(index, fraction);
            }

            result?;
            tracker.record(index, 1.0);
            let _ = progress.send(tracker.fraction());
        }
        Ok(())
    }
}
