use super::bucket::TokenBucket;
use axum::body::{Body, BodyDataStream};
use bytes::Bytes;
use futures::StreamExt;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Chunk size used below [`MEDIUM_RATE`]
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;
const MEDIUM_CHUNK_SIZE: usize = 256 * 1024;
const LARGE_CHUNK_SIZE: usize = 512 * 1024;

/// Rates from here up use 256 KiB chunks
pub const MEDIUM_RATE: u64 = 10 * 1024 * 1024;
/// Rates from here up use 512 KiB chunks
pub const LARGE_RATE: u64 = 50 * 1024 * 1024;

const MIN_WAIT: Duration = Duration::from_millis(1);
const FALLBACK_RATE: u64 = 1024;
const SLOW_WAIT: Duration = Duration::from_millis(100);

/// Chunk size for a rate in bytes per second
pub fn chunk_size_for_rate(rate: u64) -> usize {
    if rate >= LARGE_RATE {
        LARGE_CHUNK_SIZE
    } else if rate >= MEDIUM_RATE {
        MEDIUM_CHUNK_SIZE
    } else {
        DEFAULT_CHUNK_SIZE
    }
}

/// Chunk size for a bucket, never larger than what the bucket can hold
pub async fn chunk_size(bucket: &TokenBucket) -> usize {
    let rate = bucket.rate().await;
    chunk_size_for_rate(rate).min(capacity_bytes(bucket).await)
}

async fn capacity_bytes(bucket: &TokenBucket) -> usize {
    (bucket.capacity().await as usize).max(1)
}

/// Block until the bucket admits up to `want` bytes, returning how many were admitted.
///
/// The admitted amount only falls below `want` when the bucket's capacity shrank
/// below it (a lowered rate), so callers loop until their payload is drained.
pub async fn acquire(bucket: &TokenBucket, want: usize) -> usize {
    let mut waits: u64 = 0;

    loop {
        let count = want.min(capacity_bytes(bucket).await).max(1);
        if bucket.allow(count as u64).await {
            return count;
        }

        let tokens = bucket.tokens().await;
        let rate = match bucket.rate().await {
            0 => FALLBACK_RATE,
            rate => rate,
        };
        let deficit = (count as f64 - tokens).max(0.0);
        let wait = Duration::from_secs_f64(deficit / rate as f64).max(MIN_WAIT);

        waits += 1;
        crate::metrics::record_pacing_wait();

        if waits == 1 || waits % 10 == 0 || wait > SLOW_WAIT {
            debug!(
                user_id = bucket.user_id(),
                chunk_size = count,
                tokens,
                rate,
                wait_ms = wait.as_millis() as u64,
                waits,
                "Waiting for tokens"
            );
        }

        tokio::time::sleep(wait).await;
    }
}

/// Write failure partway through a paced write
#[derive(Error, Debug)]
#[error("paced write failed after {written} bytes: {source}")]
pub struct PacedWriteError {
    /// Bytes accepted by the sink before the failure
    pub written: usize,
    #[source]
    pub source: io::Error,
}

impl From<PacedWriteError> for io::Error {
    fn from(err: PacedWriteError) -> Self {
        io::Error::new(err.source.kind(), err)
    }
}

/// Byte sink whose writes are governed by a token bucket.
///
/// [`PacedWriter::write`] emits the whole buffer in rate-sized chunks, sleeping
/// between chunks until the bucket admits them. It returns early only when the
/// wrapped sink fails.
pub struct PacedWriter<W> {
    inner: W,
    bucket: Arc<TokenBucket>,
}

impl<W: AsyncWrite + Unpin> PacedWriter<W> {
    pub fn new(inner: W, bucket: Arc<TokenBucket>) -> Self {
        Self { inner, bucket }
    }

    /// Write all of `buf`, returning its length
    pub async fn write(&mut self, buf: &[u8]) -> Result<usize, PacedWriteError> {
        let mut written = 0;

        while written < buf.len() {
            let want = chunk_size(&self.bucket).await.min(buf.len() - written);
            let admitted = acquire(&self.bucket, want).await;
            let chunk = &buf[written..written + admitted];

            let mut sent = 0;
            while sent < chunk.len() {
                match self.inner.write(&chunk[sent..]).await {
                    Ok(0) => {
                        return Err(PacedWriteError {
                            written: written + sent,
                            source: io::Error::from(io::ErrorKind::WriteZero),
                        })
                    }
                    Ok(n) => sent += n,
                    Err(source) => {
                        return Err(PacedWriteError {
                            written: written + sent,
                            source,
                        })
                    }
                }
            }

            written += admitted;
            crate::metrics::record_paced_bytes(admitted as u64);
        }

        Ok(written)
    }

    /// Flush the wrapped sink
    pub async fn flush(&mut self) -> io::Result<()> {
        self.inner.flush().await
    }

    /// Flush and shut down the wrapped sink
    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.inner.shutdown().await
    }

    pub fn bucket(&self) -> &Arc<TokenBucket> {
        &self.bucket
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

struct PacedStream {
    data: BodyDataStream,
    bucket: Arc<TokenBucket>,
    pending: Bytes,
}

/// Re-chunk a response body so every emitted frame is admitted by `bucket` first.
///
/// Errors from the wrapped body end the stream immediately.
pub fn paced_body(body: Body, bucket: Arc<TokenBucket>) -> Body {
    let state = PacedStream {
        data: body.into_data_stream(),
        bucket,
        pending: Bytes::new(),
    };

    let stream = futures::stream::unfold(state, |mut state| async move {
        loop {
            if state.pending.is_empty() {
                match state.data.next().await {
                    Some(Ok(bytes)) => {
                        state.pending = bytes;
                        continue;
                    }
                    Some(Err(e)) => {
                        debug!(user_id = state.bucket.user_id(), error = %e, "Paced body source failed");
                        return Some((Err(e), state));
                    }
                    None => return None,
                }
            }

            let want = chunk_size(&state.bucket).await.min(state.pending.len());
            let admitted = acquire(&state.bucket, want).await;
            let chunk = state.pending.split_to(admitted);
            crate::metrics::record_paced_bytes(admitted as u64);

            return Some((Ok(chunk), state));
        }
    });

    Body::from_stream(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::types::BucketState;
    use http_body_util::BodyExt;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use std::time::{Instant, SystemTime};

    fn empty_bucket(rate: u64) -> Arc<TokenBucket> {
        Arc::new(TokenBucket::new("pacer-test", rate, 1.0, None))
    }

    fn full_bucket(rate: u64) -> Arc<TokenBucket> {
        Arc::new(TokenBucket::with_state(
            "pacer-test",
            rate,
            1.0,
            None,
            BucketState::new(rate as f64, SystemTime::now()),
        ))
    }

    /// Accepts `limit` bytes, then fails with a broken pipe
    struct FailingWriter {
        received: Vec<u8>,
        limit: usize,
    }

    impl AsyncWrite for FailingWriter {
        fn poll_write(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            let room = self.limit - self.received.len();
            if room == 0 {
                return Poll::Ready(Err(io::Error::from(io::ErrorKind::BrokenPipe)));
            }
            let n = room.min(buf.len());
            self.received.extend_from_slice(&buf[..n]);
            Poll::Ready(Ok(n))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[test]
    fn test_chunk_size_thresholds() {
        assert_eq!(chunk_size_for_rate(1), 64 * 1024);
        assert_eq!(chunk_size_for_rate(MEDIUM_RATE - 1), 64 * 1024);
        assert_eq!(chunk_size_for_rate(MEDIUM_RATE), 256 * 1024);
        assert_eq!(chunk_size_for_rate(LARGE_RATE - 1), 256 * 1024);
        assert_eq!(chunk_size_for_rate(LARGE_RATE), 512 * 1024);
        assert_eq!(chunk_size_for_rate(u64::MAX), 512 * 1024);
    }

    #[tokio::test]
    async fn test_chunk_size_capped_at_capacity() {
        assert_eq!(chunk_size(&empty_bucket(1000)).await, 1000);
        assert_eq!(chunk_size(&empty_bucket(1024 * 1024)).await, 64 * 1024);
    }

    #[tokio::test]
    async fn test_acquire_waits_for_deficit() {
        let bucket = empty_bucket(100_000);

        let start = Instant::now();
        let admitted = acquire(&bucket, 10_000).await;

        assert_eq!(admitted, 10_000);
        assert!(
            start.elapsed() >= Duration::from_millis(90),
            "admitted after {:?}",
            start.elapsed()
        );
    }

    #[tokio::test]
    async fn test_acquire_clamps_to_shrunk_capacity() {
        let bucket = full_bucket(10_000);
        bucket.set_rate(100).await;

        // Capacity is now 100 bytes, so a larger request is admitted in part
        let admitted = acquire(&bucket, 5_000).await;
        assert_eq!(admitted, 100);
    }

    #[tokio::test]
    async fn test_paced_writer_respects_rate() {
        let rate = 100_000;
        let payload = vec![7u8; 50_000];
        let mut writer = PacedWriter::new(Vec::new(), empty_bucket(rate));

        let start = Instant::now();
        let written = writer.write(&payload).await.unwrap();
        let elapsed = start.elapsed();

        assert_eq!(written, payload.len());
        assert_eq!(writer.get_ref().as_slice(), payload.as_slice());
        // S / R = 0.5s
        assert!(elapsed >= Duration::from_millis(450), "took {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(5), "took {:?}", elapsed);
    }

    #[tokio::test]
    async fn test_paced_writer_low_rate_completes() {
        // 64 KiB chunks would never fit a 10 KB bucket
        let rate = 10_000;
        let payload = vec![1u8; 12_000];
        let mut writer = PacedWriter::new(Vec::new(), empty_bucket(rate));

        let start = Instant::now();
        writer.write(&payload).await.unwrap();
        writer.flush().await.unwrap();

        assert_eq!(writer.into_inner().len(), 12_000);
        assert!(start.elapsed() >= Duration::from_millis(1100));
    }

    #[tokio::test]
    async fn test_paced_writer_stops_on_sink_error() {
        let rate = MEDIUM_RATE;
        let payload = vec![0u8; 600 * 1024];
        let sink = FailingWriter {
            received: Vec::new(),
            limit: 300 * 1024,
        };
        let mut writer = PacedWriter::new(sink, full_bucket(rate));

        let err = writer.write(&payload).await.unwrap_err();

        assert_eq!(err.written, 300 * 1024);
        assert_eq!(err.source.kind(), io::ErrorKind::BrokenPipe);
        assert_eq!(writer.get_ref().received.len(), 300 * 1024);

        let io_err: io::Error = err.into();
        assert_eq!(io_err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn test_paced_body_rechunks_and_paces() {
        let rate = 20_000;
        let payload: Vec<u8> = (0..30_000u32).map(|i| (i % 251) as u8).collect();
        let body = paced_body(Body::from(payload.clone()), empty_bucket(rate));

        let start = Instant::now();
        let mut frames = Vec::new();
        let mut stream = body.into_data_stream();
        while let Some(frame) = stream.next().await {
            frames.push(frame.unwrap());
        }

        assert!(start.elapsed() >= Duration::from_millis(1400));
        assert!(frames.iter().all(|f| f.len() <= rate as usize));
        assert_eq!(frames.concat(), payload);
    }

    #[tokio::test]
    async fn test_paced_body_empty() {
        let body = paced_body(Body::empty(), empty_bucket(1));
        let collected = body.collect().await.unwrap().to_bytes();
        assert!(collected.is_empty());
    }
}
