//! HTTP front end for the live relay.
//!
//! `POST /{dir}/{name}` streams an upload into the relay; `GET` on the same
//! path serves the finished file, or joins the upload and relays it live
//! when it is still in flight.

mod mime;
mod server;
mod session;
mod sink;
mod target;

use bytes::Bytes;
use http_body_util::combinators::UnsyncBoxBody;

pub use mime::{content_type, mime_type};
pub use server::{RelayServer, ServerConfig};
pub use session::Session;
pub use sink::HttpSink;
pub use target::{FileTarget, TargetError};

/// Value of the `Server` header on every response.
pub const SERVER_NAME: &str = concat!("liverelay/", env!("CARGO_PKG_VERSION"));

/// Largest upload accepted by default (100 MiB).
pub const DEFAULT_BODY_LIMIT: u64 = 100 * 1024 * 1024;

/// Frames buffered between a download's send loop and hyper.
pub const BODY_CHANNEL_SIZE: usize = 16;

/// Response body type used by every handler.
pub type Body = UnsyncBoxBody<Bytes, std::io::Error>;

/// Errors produced by the relay server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Hyper(#[from] hyper::Error),

    #[error("server already running")]
    AlreadyRunning,
}
