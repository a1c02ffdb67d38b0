//! In-memory sink for relay tests.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::download::{ChunkSink, SinkFuture, StreamEnd};

/// Everything a [`CollectSink`] has observed.
#[derive(Debug, Default, Clone)]
pub struct Collected {
    pub content_length: Option<u64>,
    pub data: Vec<u8>,
    pub writes: usize,
    pub finishes: usize,
    pub end: Option<StreamEnd>,
}

/// Records the response head, body and end marker of a download.
#[derive(Clone, Default)]
pub struct CollectSink {
    inner: Arc<Mutex<Collected>>,
    fail_after: Option<usize>,
    delay: Option<Duration>,
}

impl CollectSink {
    /// Fails every write after the first `writes` succeed.
    pub fn fail_after(mut self, writes: usize) -> Self {
        self.fail_after = Some(writes);
        self
    }

    /// Sleeps before every write, simulating a slow client.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn snapshot(&self) -> Collected {
        self.inner.lock().clone()
    }
}

impl ChunkSink for CollectSink {
    fn begin(&mut self, content_length: u64) -> SinkFuture<'_> {
        self.inner.lock().content_length = Some(content_length);
        Box::pin(async { Ok(()) })
    }

    fn write(&mut self, chunk: Bytes) -> SinkFuture<'_> {
        Box::pin(async move {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let mut got = self.inner.lock();
            if self.fail_after.is_some_and(|n| got.writes >= n) {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "client went away"));
            }
            got.writes += 1;
            got.data.extend_from_slice(&chunk);
            Ok(())
        })
    }

    fn finish(&mut self, end: StreamEnd) -> SinkFuture<'_> {
        let mut got = self.inner.lock();
        got.finishes += 1;
        got.end = Some(end);
        Box::pin(async { Ok(()) })
    }
}

/// Deterministic, non-repeating-per-chunk test payload.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}
