//! Bridges a download's send loop to a hyper response body.

use std::io;

use bytes::Bytes;
use http_body_util::{BodyExt, StreamBody};
use hyper::body::Frame;
use liverelay_relay::{ChunkSink, SinkFuture, StreamEnd};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::{BODY_CHANNEL_SIZE, Body};

type FrameResult = Result<Frame<Bytes>, io::Error>;

/// [`ChunkSink`] that feeds a streaming response body.
///
/// Writes wait while hyper has [`BODY_CHANNEL_SIZE`] frames pending. An
/// aborted stream ends the body with an error so hyper tears down the
/// connection instead of sending a clean short response.
pub struct HttpSink {
    tx: mpsc::Sender<FrameResult>,
}

impl HttpSink {
    /// Creates a sink and the response body it writes into.
    pub fn channel() -> (Self, Body) {
        let (tx, rx) = mpsc::channel(BODY_CHANNEL_SIZE);
        let body = StreamBody::new(ReceiverStream::new(rx)).boxed_unsync();
        (Self { tx }, body)
    }

    async fn push(&self, frame: FrameResult) -> io::Result<()> {
        self.tx.send(frame).await.map_err(|_| client_gone())
    }
}

fn client_gone() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "client disconnected")
}

impl ChunkSink for HttpSink {
    fn begin(&mut self, _content_length: u64) -> SinkFuture<'_> {
        // The head is already built by the session.
        let result = if self.tx.is_closed() {
            Err(client_gone())
        } else {
            Ok(())
        };
        Box::pin(async move { result })
    }

    fn write(&mut self, chunk: Bytes) -> SinkFuture<'_> {
        Box::pin(self.push(Ok(Frame::data(chunk))))
    }

    fn finish(&mut self, end: StreamEnd) -> SinkFuture<'_> {
        Box::pin(async move {
            match end {
                StreamEnd::Complete => Ok(()),
                StreamEnd::Aborted => {
                    // Ignore a closed receiver: the client is gone already.
                    let _ = self
                        .tx
                        .send(Err(io::Error::other("upload aborted")))
                        .await;
                    Ok(())
                }
            }
        })
    }
}
