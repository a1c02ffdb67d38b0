//! Live upload/download relay.
//!
//! An [`UploadTask`] persists an in-flight upload to a temporary file and
//! fans every received chunk out to the [`DownloadTask`]s joined to it. A
//! joiner first receives the full chunk history, then every live chunk,
//! then an end-of-stream marker telling it whether the upload completed or
//! was aborted. The [`TransportRegistry`] keeps at most one active upload
//! per file path.

mod download;
mod error;
mod queue;
mod registry;
mod upload;

pub use download::{ChunkSink, DownloadTask, SinkFuture, StreamEnd};
pub use error::RelayError;
pub use queue::{ChunkQueue, PushError};
pub use registry::{ConflictPolicy, TransportRegistry};
pub use upload::{StopReason, UploadOptions, UploadTask};

use serde::{Deserialize, Serialize};

/// Suffix appended to the final path while an upload is in flight.
pub const TEMP_SUFFIX: &str = ".tmp";

/// What a bounded download queue does when the upload outpaces the client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    /// Suspend the upload's fan-out until the slow client catches up.
    #[default]
    Block,
    /// Abort the slow client and keep relaying to everyone else.
    Disconnect,
}

/// Per-download buffering policy.
///
/// The default is unbounded: a stalled client accumulates queued chunks
/// for as long as the upload keeps running.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum QueuePolicy {
    #[default]
    Unbounded,
    Bounded {
        capacity: usize,
        overflow: OverflowPolicy,
    },
}

impl QueuePolicy {
    /// Builds a policy from an optional capacity (`None` = unbounded).
    pub fn from_capacity(capacity: Option<usize>, overflow: OverflowPolicy) -> Self {
        match capacity {
            Some(capacity) if capacity > 0 => Self::Bounded { capacity, overflow },
            _ => Self::Unbounded,
        }
    }
}

#[cfg(test)]
pub(crate) mod testutil;
