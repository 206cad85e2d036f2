//! Range-aware streaming responses.
//!
//! [`ByteStreamer`] turns an object descriptor and an optional `Range`
//! header into one of three responses:
//!
//! - full content: 200 with the whole object,
//! - partial content: 206 with the requested window and `Content-Range`,
//! - download: full content plus `Content-Disposition: attachment`.
//!
//! An unsatisfiable range short-circuits to 416 before any backend work.
//! The backend connection is leased before the response head is built and
//! moved into the body stream, so it is released when the body finishes,
//! fails, or is dropped because the client went away.

use axum::body::Body;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use metrics::{counter, gauge};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use tracing::{debug, error, warn};

use crate::backend::{BackendError, ChunkStream};
use crate::errors::ApiError;
use crate::metadata::store::ObjectDescriptor;
use crate::metrics::{ACTIVE_STREAMS, BYTES_SENT_TOTAL, RATE_LIMIT_BACKOFFS_TOTAL};
use crate::pool::{BackendPool, Lease};
use crate::range::{self, ByteRange, RangeError, RangeRequest};
use crate::slicer::slice;

/// Characters left unescaped in an RFC 5987 `filename*` value.
const FILENAME_ATTR: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'.')
    .remove(b'-')
    .remove(b'_')
    .remove(b'~');

/// How the body is presented to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Served for playback; honors `Range`.
    Inline,
    /// Served as a file download; always the whole object.
    Attachment,
}

/// Status, window and length chosen for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Plan {
    status: StatusCode,
    /// `None` only for empty objects.
    window: Option<ByteRange>,
    content_length: u64,
}

/// Builds streaming responses over the backend pool.
#[derive(Clone)]
pub struct ByteStreamer {
    pool: BackendPool,
    chunk_size: usize,
}

impl ByteStreamer {
    pub fn new(pool: BackendPool, chunk_size: usize) -> Self {
        Self {
            pool,
            chunk_size: chunk_size.max(1),
        }
    }

    /// Response head for a `HEAD` request. Never touches the pool.
    pub fn head(
        &self,
        descriptor: &ObjectDescriptor,
        range_header: Option<&str>,
    ) -> Result<Response, ApiError> {
        let plan = plan(descriptor, range_header, Delivery::Inline)?;
        response_head(&plan, descriptor, Delivery::Inline)
            .body(Body::empty())
            .map_err(|e| ApiError::InternalError(e.into()))
    }

    /// Full, partial or download response for `descriptor`.
    pub async fn respond(
        &self,
        descriptor: &ObjectDescriptor,
        range_header: Option<&str>,
        delivery: Delivery,
    ) -> Result<Response, ApiError> {
        let plan = plan(descriptor, range_header, delivery)?;
        let head = response_head(&plan, descriptor, delivery);

        let Some(window) = plan.window else {
            return head
                .body(Body::empty())
                .map_err(|e| ApiError::InternalError(e.into()));
        };

        let lease = self.pool.acquire(true)?;
        debug!(
            "Streaming {} bytes {}-{} via '{}'",
            descriptor.remote_object_id,
            window.start(),
            window.end(),
            lease.identity()
        );

        let mut backoff_available = true;
        let chunks = self
            .open(&lease, &descriptor.remote_object_id, &mut backoff_available)
            .await
            .map_err(|e| open_failure(&lease, e))?;

        let body = body_stream(
            lease,
            descriptor.remote_object_id.clone(),
            chunks,
            window,
            backoff_available,
        );
        head.body(Body::from_stream(body))
            .map_err(|e| ApiError::InternalError(e.into()))
    }

    /// Open the chunk stream, spending the request's single backoff on a
    /// rate-limited open. A reopen always starts from offset 0.
    async fn open(
        &self,
        lease: &Lease,
        remote_id: &str,
        backoff_available: &mut bool,
    ) -> Result<ChunkStream, BackendError> {
        match lease.backend().open_chunk_stream(remote_id, self.chunk_size).await {
            Err(BackendError::RateLimited { wait }) if *backoff_available => {
                *backoff_available = false;
                warn!(
                    "Connection '{}' rate limited opening {}, backing off {:?}",
                    lease.identity(),
                    remote_id,
                    wait
                );
                counter!(RATE_LIMIT_BACKOFFS_TOTAL).increment(1);
                tokio::time::sleep(wait).await;
                lease.backend().open_chunk_stream(remote_id, self.chunk_size).await
            }
            other => other,
        }
    }
}

/// Choose the response shape before touching any backend.
fn plan(
    descriptor: &ObjectDescriptor,
    range_header: Option<&str>,
    delivery: Delivery,
) -> Result<Plan, ApiError> {
    let size = descriptor.size_bytes;
    let requested = match delivery {
        Delivery::Attachment => RangeRequest::Full,
        Delivery::Inline => match range::resolve(range_header, size) {
            Ok(requested) => requested,
            Err(RangeError::Malformed) => {
                debug!("Ignoring malformed range header {:?}", range_header);
                RangeRequest::Full
            }
            Err(RangeError::Unsatisfiable { size }) => {
                return Err(ApiError::UnsatisfiableRange { size })
            }
        },
    };
    Ok(match requested {
        RangeRequest::Full => Plan {
            status: StatusCode::OK,
            window: ByteRange::full(size),
            content_length: size,
        },
        RangeRequest::Partial(window) => Plan {
            status: StatusCode::PARTIAL_CONTENT,
            window: Some(window),
            content_length: window.len(),
        },
    })
}

fn response_head(
    plan: &Plan,
    descriptor: &ObjectDescriptor,
    delivery: Delivery,
) -> axum::http::response::Builder {
    let content_type = HeaderValue::from_str(&descriptor.content_type)
        .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream"));
    let mut builder = Response::builder()
        .status(plan.status)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CONTENT_LENGTH, plan.content_length)
        .header(header::ACCEPT_RANGES, "bytes");
    if plan.status == StatusCode::PARTIAL_CONTENT {
        if let Some(window) = plan.window {
            builder = builder.header(
                header::CONTENT_RANGE,
                window.content_range(descriptor.size_bytes),
            );
        }
    }
    if delivery == Delivery::Attachment {
        builder = builder.header(
            header::CONTENT_DISPOSITION,
            content_disposition(&descriptor.display_name),
        );
    }
    builder
}

/// `attachment` disposition with an ASCII fallback name and the exact
/// UTF-8 name in `filename*`.
pub fn content_disposition(display_name: &str) -> String {
    let name = if display_name.trim().is_empty() {
        "download"
    } else {
        display_name
    };
    let ascii: String = name
        .chars()
        .map(|c| match c {
            '"' | '\\' => '_',
            c if c.is_ascii() && !c.is_ascii_control() => c,
            _ => '_',
        })
        .collect();
    format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        ascii,
        utf8_percent_encode(name, FILENAME_ATTR)
    )
}

/// Map a failure to open the stream onto an HTTP error.
fn open_failure(lease: &Lease, err: BackendError) -> ApiError {
    match err {
        BackendError::Unauthorized(msg) => {
            error!("Connection '{}' rejected: {}", lease.identity(), msg);
            lease.evict();
            ApiError::NoBackendAvailable
        }
        BackendError::RateLimited { wait } => ApiError::InternalError(anyhow::anyhow!(
            "backend still rate limited after one backoff (retry after {:?})",
            wait
        )),
        other => other.into(),
    }
}

/// Absorb at most one mid-stream rate-limit signal by sleeping and then
/// pulling again from the same stream. Any further signal is passed on.
fn absorb_rate_limit(mut chunks: ChunkStream, backoff_available: bool) -> ChunkStream {
    Box::pin(async_stream::stream! {
        let mut backoff_available = backoff_available;
        while let Some(item) = chunks.next().await {
            match item {
                Err(BackendError::RateLimited { wait }) if backoff_available => {
                    backoff_available = false;
                    warn!("Rate limited mid-stream, backing off {:?}", wait);
                    counter!(RATE_LIMIT_BACKOFFS_TOTAL).increment(1);
                    tokio::time::sleep(wait).await;
                }
                other => yield other,
            }
        }
    })
}

/// Keeps the active-stream gauge in step with live bodies.
struct ActiveStream;

impl ActiveStream {
    fn start() -> Self {
        gauge!(ACTIVE_STREAMS).increment(1.0);
        ActiveStream
    }
}

impl Drop for ActiveStream {
    fn drop(&mut self) {
        gauge!(ACTIVE_STREAMS).decrement(1.0);
    }
}

/// The response body: sliced backend chunks, holding the lease until the
/// stream is finished or dropped.
fn body_stream(
    lease: Lease,
    remote_id: String,
    chunks: ChunkStream,
    window: ByteRange,
    backoff_available: bool,
) -> impl Stream<Item = Result<Bytes, std::io::Error>> + Send + 'static {
    async_stream::stream! {
        let lease = lease;
        let _active = ActiveStream::start();
        let mut sliced = slice(absorb_rate_limit(chunks, backoff_available), window);
        let mut sent: u64 = 0;

        while let Some(item) = sliced.next().await {
            match item {
                Ok(bytes) => {
                    sent += bytes.len() as u64;
                    counter!(BYTES_SENT_TOTAL).increment(bytes.len() as u64);
                    yield Ok(bytes);
                }
                Err(err) => {
                    if matches!(err, BackendError::Unauthorized(_)) {
                        lease.evict();
                    }
                    error!(
                        "Stream of {} via '{}' failed after {} of {} bytes: {}",
                        remote_id,
                        lease.identity(),
                        sent,
                        window.len(),
                        err
                    );
                    yield Err(std::io::Error::new(std::io::ErrorKind::Other, err.to_string()));
                    return;
                }
            }
        }

        if sent < window.len() {
            warn!(
                "Backend under-delivered {}: {} of {} bytes",
                remote_id,
                sent,
                window.len()
            );
        }
        debug!("Finished {} via '{}' ({} bytes)", remote_id, lease.identity(), sent);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::{Fault, MemoryChunkBackend};
    use crate::backend::ChunkBackend;
    use crate::config::{ConnectionClass, ConnectionConfig};
    use std::sync::Arc;
    use std::time::Duration;

    const OBJECT: &str = "obj1000";

    fn data(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn descriptor(size: u64) -> ObjectDescriptor {
        ObjectDescriptor {
            remote_object_id: OBJECT.to_string(),
            size_bytes: size,
            content_type: "video/mp4".to_string(),
            display_name: "clip.mp4".to_string(),
        }
    }

    async fn setup(
        len: usize,
        chunk_size: usize,
    ) -> (ByteStreamer, BackendPool, Arc<MemoryChunkBackend>) {
        let backend = Arc::new(MemoryChunkBackend::new());
        backend.insert(OBJECT, data(len)).await;
        let dyn_backend: Arc<dyn ChunkBackend> = backend.clone();
        let cfg = ConnectionConfig {
            identity: "primary".to_string(),
            class: ConnectionClass::Elevated,
            backend: "memory".to_string(),
            root_dir: String::new(),
            base_url: None,
            token: None,
        };
        let pool = BackendPool::initialize(vec![(cfg, dyn_backend)], 3)
            .await
            .unwrap();
        (ByteStreamer::new(pool.clone(), chunk_size), pool, backend)
    }

    async fn body_of(resp: Response) -> Result<Bytes, axum::Error> {
        axum::body::to_bytes(resp.into_body(), usize::MAX).await
    }

    fn in_flight(pool: &BackendPool) -> usize {
        pool.snapshot().iter().map(|s| s.in_flight).sum()
    }

    #[tokio::test]
    async fn test_full_content() {
        let (streamer, pool, _) = setup(1000, 64).await;
        let resp = streamer
            .respond(&descriptor(1000), None, Delivery::Inline)
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()["content-length"], "1000");
        assert_eq!(resp.headers()["accept-ranges"], "bytes");
        assert_eq!(resp.headers()["content-type"], "video/mp4");
        assert!(resp.headers().get("content-range").is_none());
        assert_eq!(in_flight(&pool), 1);
        assert_eq!(body_of(resp).await.unwrap(), data(1000));
        assert_eq!(in_flight(&pool), 0);
    }

    #[tokio::test]
    async fn test_open_ended_partial() {
        let (streamer, pool, _) = setup(1000, 64).await;
        let resp = streamer
            .respond(&descriptor(1000), Some("bytes=500-"), Delivery::Inline)
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(resp.headers()["content-range"], "bytes 500-999/1000");
        assert_eq!(resp.headers()["content-length"], "500");
        assert_eq!(body_of(resp).await.unwrap(), &data(1000)[500..]);
        assert_eq!(in_flight(&pool), 0);
    }

    #[tokio::test]
    async fn test_unsatisfiable_never_acquires() {
        let (streamer, pool, backend) = setup(1000, 64).await;
        let err = streamer
            .respond(&descriptor(1000), Some("bytes=1500-2000"), Delivery::Inline)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ApiError::UnsatisfiableRange { size: 1000 }));
        assert_eq!(in_flight(&pool), 0);
        assert_eq!(backend.chunks_served(), 0);
    }

    #[tokio::test]
    async fn test_malformed_range_serves_full() {
        let (streamer, _, _) = setup(100, 64).await;
        let resp = streamer
            .respond(&descriptor(100), Some("items=0-5"), Delivery::Inline)
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_of(resp).await.unwrap().len(), 100);
    }

    #[tokio::test]
    async fn test_download_ignores_range_and_sets_disposition() {
        let (streamer, _, _) = setup(300, 64).await;
        let resp = streamer
            .respond(&descriptor(300), Some("bytes=0-9"), Delivery::Attachment)
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()["content-disposition"],
            "attachment; filename=\"clip.mp4\"; filename*=UTF-8''clip.mp4"
        );
        assert_eq!(body_of(resp).await.unwrap().len(), 300);
    }

    #[tokio::test]
    async fn test_small_window_stops_pulling_early() {
        let (streamer, _, backend) = setup(10_000, 100).await;
        let resp = streamer
            .respond(&descriptor(10_000), Some("bytes=0-149"), Delivery::Inline)
            .await
            .unwrap();
        assert_eq!(body_of(resp).await.unwrap(), &data(10_000)[..150]);
        assert!(backend.chunks_served() <= 2);
    }

    #[tokio::test]
    async fn test_rate_limited_open_retries_once() {
        let (streamer, pool, backend) = setup(200, 64).await;
        backend.push_fault(Fault::RateLimitOnOpen(Duration::from_millis(5)));
        let resp = streamer
            .respond(&descriptor(200), None, Delivery::Inline)
            .await
            .unwrap();
        assert_eq!(body_of(resp).await.unwrap(), data(200));
        assert_eq!(in_flight(&pool), 0);
    }

    #[tokio::test]
    async fn test_rate_limited_open_twice_fails() {
        let (streamer, pool, backend) = setup(200, 64).await;
        backend.push_fault(Fault::RateLimitOnOpen(Duration::from_millis(1)));
        backend.push_fault(Fault::RateLimitOnOpen(Duration::from_millis(1)));
        let err = streamer
            .respond(&descriptor(200), None, Delivery::Inline)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ApiError::InternalError(_)));
        assert_eq!(in_flight(&pool), 0);
    }

    #[tokio::test]
    async fn test_mid_stream_rate_limit_resumes_same_stream() {
        let (streamer, _, backend) = setup(500, 100).await;
        backend.push_fault(Fault::RateLimitMidStream {
            after_chunks: 2,
            wait: Duration::from_millis(5),
        });
        let resp = streamer
            .respond(&descriptor(500), Some("bytes=150-449"), Delivery::Inline)
            .await
            .unwrap();
        assert_eq!(body_of(resp).await.unwrap(), &data(500)[150..450]);
    }

    #[tokio::test]
    async fn test_second_rate_limit_terminates_body() {
        let (streamer, pool, backend) = setup(500, 100).await;
        backend.push_fault(Fault::RateLimitOnOpen(Duration::from_millis(1)));
        backend.push_fault(Fault::RateLimitMidStream {
            after_chunks: 1,
            wait: Duration::from_millis(1),
        });
        let resp = streamer
            .respond(&descriptor(500), None, Delivery::Inline)
            .await
            .unwrap();
        assert!(body_of(resp).await.is_err());
        assert_eq!(in_flight(&pool), 0);
    }

    #[tokio::test]
    async fn test_mid_stream_failure_releases() {
        let (streamer, pool, backend) = setup(500, 100).await;
        backend.push_fault(Fault::FailMidStream { after_chunks: 2 });
        let resp = streamer
            .respond(&descriptor(500), None, Delivery::Inline)
            .await
            .unwrap();
        assert!(body_of(resp).await.is_err());
        assert_eq!(in_flight(&pool), 0);
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn test_revoked_session_evicts_connection() {
        let (streamer, pool, backend) = setup(500, 100).await;
        backend.push_fault(Fault::RevokedMidStream { after_chunks: 1 });
        let resp = streamer
            .respond(&descriptor(500), None, Delivery::Inline)
            .await
            .unwrap();
        assert!(body_of(resp).await.is_err());
        assert!(pool.is_empty());
        let err = streamer
            .respond(&descriptor(500), None, Delivery::Inline)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ApiError::NoBackendAvailable));
    }

    #[tokio::test]
    async fn test_dropped_body_releases_lease() {
        let (streamer, pool, _) = setup(1000, 10).await;
        let resp = streamer
            .respond(&descriptor(1000), None, Delivery::Inline)
            .await
            .unwrap();
        assert_eq!(in_flight(&pool), 1);
        drop(resp);
        assert_eq!(in_flight(&pool), 0);
    }

    #[tokio::test]
    async fn test_client_disconnect_mid_stream_releases_lease() {
        use futures::StreamExt;

        let (streamer, pool, backend) = setup(1000, 10).await;
        let resp = streamer
            .respond(&descriptor(1000), None, Delivery::Inline)
            .await
            .unwrap();
        let mut body = resp.into_body().into_data_stream();
        let first = body.next().await.unwrap().unwrap();
        assert_eq!(first.as_ref(), &data(10)[..]);
        assert_eq!(in_flight(&pool), 1);

        drop(body);
        assert_eq!(in_flight(&pool), 0);
        assert!(backend.chunks_served() <= 2);
    }

    #[tokio::test]
    async fn test_missing_backend_object_is_not_found() {
        let (streamer, pool, _) = setup(10, 10).await;
        let mut d = descriptor(10);
        d.remote_object_id = "gone".to_string();
        let err = streamer.respond(&d, None, Delivery::Inline).await.err().unwrap();
        assert!(matches!(err, ApiError::ObjectNotFound { .. }));
        assert_eq!(in_flight(&pool), 0);
    }

    #[tokio::test]
    async fn test_head_does_not_touch_pool() {
        let (streamer, pool, backend) = setup(1000, 64).await;
        let resp = streamer
            .head(&descriptor(1000), Some("bytes=-100"))
            .unwrap();
        assert_eq!(resp.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(resp.headers()["content-range"], "bytes 900-999/1000");
        assert_eq!(resp.headers()["content-length"], "100");
        assert_eq!(in_flight(&pool), 0);
        assert_eq!(backend.chunks_served(), 0);
    }

    #[tokio::test]
    async fn test_empty_object_full_response() {
        let (streamer, pool, _) = setup(0, 64).await;
        let resp = streamer
            .respond(&descriptor(0), None, Delivery::Inline)
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()["content-length"], "0");
        assert!(body_of(resp).await.unwrap().is_empty());
        assert_eq!(in_flight(&pool), 0);
    }

    #[test]
    fn test_content_disposition_non_ascii() {
        assert_eq!(
            content_disposition("résumé \"final\".pdf"),
            "attachment; filename=\"r_sum_ _final_.pdf\"; filename*=UTF-8''r%C3%A9sum%C3%A9%20%22final%22.pdf"
        );
        assert_eq!(
            content_disposition(""),
            "attachment; filename=\"download\"; filename*=UTF-8''download"
        );
    }
}
