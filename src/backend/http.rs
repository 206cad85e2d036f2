//! Remote chunk server backend over HTTP.
//!
//! Talks to a chunk server exposing:
//!
//!   GET    {base}/status           session check used by `start`
//!   GET    {base}/objects/{id}     object body, read as a byte stream
//!   PUT    {base}/objects/{id}     store an object
//!   DELETE {base}/objects/{id}     remove an object
//!
//! Every request carries `Authorization: Bearer {token}` when a token is
//! configured.  Status mapping: 429 is rate limiting (wait taken from
//! `Retry-After`), 401/403 is an unauthorized session, 404 is not found.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::BytesMut;
use futures::StreamExt;
use md5::{Digest, Md5};
use reqwest::StatusCode;
use tracing::{debug, info};

use super::chunk::{
    new_remote_id, validate_remote_id, BackendError, BackendFuture, ChunkBackend, ChunkStream,
    ProgressFn, RemoteObject, UploadPayload,
};

/// Wait applied when a 429 carries no usable `Retry-After`.
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(1);

/// Chunk backend that proxies to a remote chunk server.
pub struct HttpChunkBackend {
    client: reqwest::Client,
    /// Base URL without trailing slash.
    base_url: String,
    token: Option<String>,
}

impl HttpChunkBackend {
    pub fn new(base_url: &str, token: Option<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {}", e))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn object_url(&self, remote_id: &str) -> Result<String, BackendError> {
        validate_remote_id(remote_id)?;
        Ok(format!("{}/objects/{}", self.base_url, remote_id))
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(
        &self,
        builder: reqwest::RequestBuilder,
        remote_id: &str,
    ) -> Result<reqwest::Response, BackendError> {
        let response = builder.send().await.map_err(transport_error)?;
        check_status(response, remote_id)
    }
}

/// Map a non-success status onto the backend error taxonomy.
fn check_status(response: reqwest::Response, remote_id: &str) -> Result<reqwest::Response, BackendError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    Err(match status {
        StatusCode::TOO_MANY_REQUESTS => BackendError::RateLimited {
            wait: retry_after(response.headers()),
        },
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            BackendError::Unauthorized(format!("chunk server answered {}", status))
        }
        StatusCode::NOT_FOUND => BackendError::NotFound(remote_id.to_string()),
        other => BackendError::Other(anyhow::anyhow!("chunk server answered {}", other)),
    })
}

/// Parse `Retry-After` as delta-seconds.
fn retry_after(headers: &reqwest::header::HeaderMap) -> Duration {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_RETRY_AFTER)
}

fn transport_error(err: reqwest::Error) -> BackendError {
    BackendError::Io(std::io::Error::new(std::io::ErrorKind::Other, err))
}

impl ChunkBackend for HttpChunkBackend {
    fn start(&self) -> BackendFuture<'_, ()> {
        Box::pin(async move {
            let url = format!("{}/status", self.base_url);
            self.send(self.request(reqwest::Method::GET, &url), "status")
                .await?;
            info!("Chunk server session ready at {}", self.base_url);
            Ok(())
        })
    }

    fn stop(&self) -> BackendFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }

    fn open_chunk_stream(&self, remote_id: &str, chunk_size: usize) -> BackendFuture<'_, ChunkStream> {
        let remote_id = remote_id.to_string();
        Box::pin(async move {
            let url = self.object_url(&remote_id)?;
            let response = self
                .send(self.request(reqwest::Method::GET, &url), &remote_id)
                .await?;
            let chunk_size = chunk_size.max(1);

            // Re-frame the transport's arbitrary frames into chunk_size pieces.
            let stream = async_stream::stream! {
                let mut body = response.bytes_stream();
                let mut pending = BytesMut::new();
                while let Some(frame) = body.next().await {
                    match frame {
                        Ok(frame) => {
                            pending.extend_from_slice(&frame);
                            while pending.len() >= chunk_size {
                                yield Ok(pending.split_to(chunk_size).freeze());
                            }
                        }
                        Err(err) => {
                            yield Err(transport_error(err));
                            return;
                        }
                    }
                }
                if !pending.is_empty() {
                    yield Ok(pending.freeze());
                }
            };
            let stream: ChunkStream = Box::pin(stream);
            Ok(stream)
        })
    }

    fn upload(&self, payload: UploadPayload, progress: ProgressFn) -> BackendFuture<'_, RemoteObject> {
        Box::pin(async move {
            let remote_id = new_remote_id();
            let url = self.object_url(&remote_id)?;
            let file = tokio::fs::File::open(&payload.path).await?;
            let total = payload.size;

            let hasher = Arc::new(Mutex::new(Md5::new()));
            let sent = Arc::new(AtomicU64::new(0));
            let body_hasher = hasher.clone();
            let body_sent = sent.clone();
            let body = tokio_util::io::ReaderStream::new(file).inspect(move |chunk| {
                if let Ok(chunk) = chunk {
                    if let Ok(mut h) = body_hasher.lock() {
                        h.update(chunk);
                    }
                    let len = chunk.len() as u64;
                    let now = body_sent.fetch_add(len, Ordering::SeqCst) + len;
                    progress(now, total.max(now));
                }
            });

            self.send(
                self.request(reqwest::Method::PUT, &url)
                    .header(reqwest::header::CONTENT_LENGTH, total)
                    .header("x-file-name", sanitize_header(&payload.file_name))
                    .header("x-media-kind", payload.kind.label())
                    .body(reqwest::Body::wrap_stream(body)),
                &remote_id,
            )
            .await?;

            let size = sent.load(Ordering::SeqCst);
            let checksum = hasher
                .lock()
                .map(|h| hex::encode(h.clone().finalize()))
                .map_err(|_| BackendError::Other(anyhow::anyhow!("checksum state poisoned")))?;
            debug!("Uploaded {} ({} bytes) as {}", payload.file_name, size, remote_id);
            Ok(RemoteObject {
                remote_id,
                size,
                checksum,
            })
        })
    }

    fn delete(&self, remote_id: &str) -> BackendFuture<'_, ()> {
        let remote_id = remote_id.to_string();
        Box::pin(async move {
            let url = self.object_url(&remote_id)?;
            match self
                .send(self.request(reqwest::Method::DELETE, &url), &remote_id)
                .await
            {
                Ok(_) | Err(BackendError::NotFound(_)) => Ok(()),
                Err(err) => Err(err),
            }
        })
    }
}

/// Keep a header value to visible ASCII.
fn sanitize_header(value: &str) -> String {
    value
        .chars()
        .map(|c| if c.is_ascii_graphic() || c == ' ' { c } else { '_' })
        .collect()
}
