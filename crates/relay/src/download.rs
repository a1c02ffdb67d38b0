//! Outbound side of the relay: one task per downloading client.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::queue::{ChunkQueue, PushError};
use crate::{OverflowPolicy, QueuePolicy};

/// A boxed future returned by [`ChunkSink`] methods.
pub type SinkFuture<'a> = Pin<Box<dyn Future<Output = io::Result<()>> + Send + 'a>>;

/// How a relayed stream ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// The upload completed; every declared byte was delivered.
    Complete,
    /// The upload failed, was superseded, or this client fell behind.
    Aborted,
}

/// Destination of a download's bytes (usually an HTTP response body).
///
/// The send loop calls `begin` once, `write` for every chunk in order, and
/// `finish` once at end-of-stream. Any error ends the loop without retry.
pub trait ChunkSink: Send + 'static {
    /// Emits the response head with the declared content length.
    fn begin(&mut self, content_length: u64) -> SinkFuture<'_>;

    /// Emits one body fragment.
    fn write(&mut self, chunk: Bytes) -> SinkFuture<'_>;

    /// Terminates the body, cleanly or not depending on `end`.
    fn finish(&mut self, end: StreamEnd) -> SinkFuture<'_>;
}

/// Streams an upload's chunks to one client.
///
/// Created → Running on [`start`](Self::start); Running → Draining once the
/// queue is closed; Draining → Stopped when the final write completes. A
/// write error goes straight to Stopped.
pub struct DownloadTask {
    id: Uuid,
    content_length: u64,
    queue: ChunkQueue<Bytes>,
    overflow: OverflowPolicy,
    live: AtomicBool,
    started: AtomicBool,
    end: Mutex<Option<StreamEnd>>,
    done: CancellationToken,
}

impl DownloadTask {
    /// Creates a download that will declare `content_length` bytes.
    pub fn new(content_length: u64, policy: QueuePolicy) -> Arc<Self> {
        let (queue, overflow) = match policy {
            QueuePolicy::Unbounded => (ChunkQueue::new(), OverflowPolicy::Block),
            QueuePolicy::Bounded { capacity, overflow } => {
                (ChunkQueue::bounded(capacity), overflow)
            }
        };

        Arc::new(Self {
            id: Uuid::new_v4(),
            content_length,
            queue,
            overflow,
            live: AtomicBool::new(true),
            started: AtomicBool::new(false),
            end: Mutex::new(None),
            done: CancellationToken::new(),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Declared length of the response body.
    pub fn content_length(&self) -> u64 {
        self.content_length
    }

    /// `false` once the task has begun terminating.
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    /// Number of chunks waiting to be written.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// The recorded end of the stream, if termination has begun.
    pub fn end(&self) -> Option<StreamEnd> {
        *self.end.lock()
    }

    /// Spawns the send loop writing into `sink`. Only the first call has
    /// any effect.
    pub fn start<S: ChunkSink>(self: &Arc<Self>, sink: S) {
        if self.started.swap(true, Ordering::AcqRel) {
            warn!(download = %self.id, "download already started");
            return;
        }
        let task = Arc::clone(self);
        tokio::spawn(task.run(sink));
    }

    /// Queues a chunk for sending. Dropped silently once the task is no
    /// longer live.
    pub async fn send(&self, chunk: Bytes) {
        if !self.is_live() {
            return;
        }

        let result = match (self.queue.capacity(), self.overflow) {
            (None, _) => self.queue.push(chunk),
            (Some(_), OverflowPolicy::Block) => self.queue.push_wait(chunk).await,
            (Some(capacity), OverflowPolicy::Disconnect) => match self.queue.push(chunk) {
                Err(PushError::Full(_)) => {
                    warn!(download = %self.id, capacity, "client fell behind, disconnecting");
                    self.close(StreamEnd::Aborted);
                    return;
                }
                other => other,
            },
        };

        if result.is_err() {
            debug!(download = %self.id, "chunk dropped, download closed");
        }
    }

    /// Queues already-received chunks ahead of any live chunk, ignoring
    /// queue capacity.
    pub(crate) fn preload<I>(&self, chunks: I) -> usize
    where
        I: IntoIterator<Item = Bytes>,
    {
        self.queue.preload(chunks)
    }

    /// Begins termination without waiting. Idempotent; the first recorded
    /// end wins.
    pub fn close(&self, end: StreamEnd) {
        {
            let mut slot = self.end.lock();
            if slot.is_none() {
                *slot = Some(end);
            }
        }
        self.live.store(false, Ordering::Release);
        self.queue.close();
    }

    /// Terminates the stream and waits until the send loop has exited.
    ///
    /// Safe to call repeatedly and from several tasks at once.
    pub async fn stop(&self, end: StreamEnd) {
        self.close(end);
        self.wait_finished().await;
    }

    /// Waits for the send loop to exit. Returns at once if it never started.
    pub async fn wait_finished(&self) {
        if self.started.load(Ordering::Acquire) {
            self.done.cancelled().await;
        }
    }

    async fn run<S: ChunkSink>(self: Arc<Self>, mut sink: S) {
        match self.relay(&mut sink).await {
            Ok(sent) => debug!(download = %self.id, sent, "download finished"),
            Err(e) => {
                error!(download = %self.id, "download write failed: {e}");
                // The client saw a broken stream whatever the upload did.
                *self.end.lock() = Some(StreamEnd::Aborted);
                self.close(StreamEnd::Aborted);
            }
        }

        self.live.store(false, Ordering::Release);
        self.queue.close();
        self.done.cancel();
    }

    async fn relay<S: ChunkSink>(&self, sink: &mut S) -> io::Result<u64> {
        sink.begin(self.content_length).await?;

        let mut sent = 0u64;
        while let Some(chunk) = self.queue.pop().await {
            sent += chunk.len() as u64;
            sink.write(chunk).await?;
        }

        let mut end = self.end().unwrap_or(StreamEnd::Aborted);
        if end == StreamEnd::Complete && sent != self.content_length {
            warn!(
                download = %self.id,
                sent,
                declared = self.content_length,
                "relayed length differs from declared length"
            );
            end = StreamEnd::Aborted;
        }

        sink.finish(end).await?;
        Ok(sent)
    }
}
