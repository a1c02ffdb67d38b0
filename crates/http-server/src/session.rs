//! Per-request dispatch: static files, live downloads and uploads.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use futures_util::TryStreamExt;
use http::header::{ALLOW, CONTENT_LENGTH, CONTENT_TYPE, SERVER};
use http::{HeaderValue, Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Empty, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use liverelay_relay::{RelayError, StopReason, TransportRegistry, UploadOptions, UploadTask};
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use tracing::{debug, error, info, warn};

use crate::mime::content_type;
use crate::sink::HttpSink;
use crate::target::FileTarget;
use crate::{Body, SERVER_NAME};

/// How an upload body ended, as seen by the reader task.
enum PumpOutcome {
    Completed,
    Rejected(RelayError),
    ReadFailed(hyper::Error),
}

/// Routes requests against a root directory and the upload registry.
pub struct Session {
    root_dir: PathBuf,
    body_limit: u64,
    upload: UploadOptions,
    registry: Arc<TransportRegistry>,
}

impl Session {
    pub fn new(
        root_dir: impl Into<PathBuf>,
        body_limit: u64,
        upload: UploadOptions,
        registry: Arc<TransportRegistry>,
    ) -> Self {
        Self {
            root_dir: root_dir.into(),
            body_limit,
            upload,
            registry,
        }
    }

    pub fn registry(&self) -> &Arc<TransportRegistry> {
        &self.registry
    }

    /// Handles one request. Never fails: every error maps to a status code.
    pub async fn handle(&self, req: Request<Incoming>) -> Response<Body> {
        let raw = req
            .uri()
            .path_and_query()
            .map_or_else(|| req.uri().path(), |pq| pq.as_str())
            .to_string();

        let method = req.method().clone();
        let mut resp = if method == Method::GET || method == Method::POST {
            match FileTarget::parse(&raw) {
                Ok(target) if method == Method::GET => self.download(&target).await,
                Ok(target) => self.upload(&target, req).await,
                Err(e) => {
                    debug!(target = %raw, "bad target: {e}");
                    text(StatusCode::BAD_REQUEST, format!("bad target: {e}"))
                }
            }
        } else {
            debug!(%method, target = %raw, "method not allowed");
            let mut resp = empty(StatusCode::METHOD_NOT_ALLOWED);
            resp.headers_mut()
                .insert(ALLOW, HeaderValue::from_static("GET, POST"));
            resp
        };

        resp.headers_mut()
            .insert(SERVER, HeaderValue::from_static(SERVER_NAME));
        resp
    }

    async fn download(&self, target: &FileTarget) -> Response<Body> {
        let file_path = target.file_path(&self.root_dir);

        match serve_file(&file_path).await {
            Ok(Some(resp)) => return resp,
            Ok(None) => {}
            Err(e) => {
                error!(path = %file_path.display(), "cannot open file: {e}");
                return empty(StatusCode::INTERNAL_SERVER_ERROR);
            }
        }

        if let Some(task) = self.registry.lookup_upload(&file_path).await {
            let (sink, body) = HttpSink::channel();
            let download = task.join(sink).await;
            info!(
                path = %file_path.display(),
                download = %download.id(),
                "live download joined"
            );

            let mut resp = Response::new(body);
            let headers = resp.headers_mut();
            headers.insert(CONTENT_LENGTH, HeaderValue::from(task.declared_size()));
            headers.insert(CONTENT_TYPE, content_type(&file_path));
            return resp;
        }

        // The upload may have completed between the two checks.
        match serve_file(&file_path).await {
            Ok(Some(resp)) => resp,
            Ok(None) => text(StatusCode::NOT_FOUND, format!("{} not found", target_str(target))),
            Err(e) => {
                error!(path = %file_path.display(), "cannot open file: {e}");
                empty(StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    }

    async fn upload(&self, target: &FileTarget, req: Request<Incoming>) -> Response<Body> {
        let declared = match req.headers().get(CONTENT_LENGTH) {
            None => return text(StatusCode::LENGTH_REQUIRED, "Content-Length required"),
            Some(value) => match value.to_str().ok().and_then(|v| v.trim().parse::<u64>().ok()) {
                Some(n) if n > 0 => n,
                _ => return text(StatusCode::BAD_REQUEST, "invalid Content-Length"),
            },
        };
        if declared > self.body_limit {
            warn!(declared, limit = self.body_limit, "upload too large");
            return text(StatusCode::PAYLOAD_TOO_LARGE, "upload too large");
        }

        let file_path = target.file_path(&self.root_dir);
        let task = match UploadTask::new(
            target.file_dir(&self.root_dir),
            &file_path,
            declared,
            self.upload,
        ) {
            Ok(task) => task,
            Err(e) => return text(StatusCode::BAD_REQUEST, e.to_string()),
        };

        match self.registry.register_upload(&task).await {
            Ok(()) => {}
            Err(e @ RelayError::Conflict(_)) => return text(StatusCode::CONFLICT, e.to_string()),
            Err(e) => {
                error!(path = %file_path.display(), "cannot start upload: {e}");
                return empty(StatusCode::INTERNAL_SERVER_ERROR);
            }
        }

        // The body is read in its own task so a dropped connection cannot
        // interrupt the relay bookkeeping half way.
        let body = req.into_body();
        let registry = Arc::clone(&self.registry);
        let pump = tokio::spawn(async move {
            let outcome = pump_body(&task, body).await;
            let status = settle(&task, outcome).await;
            registry.unregister(task.file_path(), &task).await;
            status
        });

        match pump.await {
            Ok(Ok(())) => empty(StatusCode::OK),
            Ok(Err((status, msg))) => text(status, msg),
            Err(e) => {
                error!(path = %file_path.display(), "upload task panicked: {e}");
                empty(StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    }
}

/// Streams request body frames into the upload.
async fn pump_body(task: &UploadTask, mut body: Incoming) -> PumpOutcome {
    while let Some(frame) = body.frame().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => return PumpOutcome::ReadFailed(e),
        };
        let Ok(data) = frame.into_data() else {
            continue;
        };
        if let Err(e) = task.receive(data).await {
            return PumpOutcome::Rejected(e);
        }
    }
    PumpOutcome::Completed
}

/// Stops the upload according to how its body ended and picks the reply.
async fn settle(task: &UploadTask, outcome: PumpOutcome) -> Result<(), (StatusCode, String)> {
    let path = task.file_path().display().to_string();
    match outcome {
        PumpOutcome::Completed => match task.finish().await {
            Ok(()) => Ok(()),
            Err(RelayError::Stopped) => Err((StatusCode::CONFLICT, "upload superseded".into())),
            Err(e) => Err((StatusCode::BAD_REQUEST, e.to_string())),
        },
        PumpOutcome::Rejected(RelayError::Stopped) => {
            info!(%path, "upload superseded");
            Err((StatusCode::CONFLICT, "upload superseded".into()))
        }
        PumpOutcome::Rejected(e) => {
            warn!(%path, "upload rejected: {e}");
            task.stop(StopReason::Error).await;
            Err((StatusCode::BAD_REQUEST, e.to_string()))
        }
        PumpOutcome::ReadFailed(e) => {
            warn!(%path, "upload body read failed: {e}");
            task.stop(StopReason::Error).await;
            Err((StatusCode::BAD_REQUEST, format!("body read failed: {e}")))
        }
    }
}

/// Builds a static response for `path`, `None` if there is no such file.
async fn serve_file(path: &Path) -> io::Result<Option<Response<Body>>> {
    let file = match File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    let meta = file.metadata().await?;
    if !meta.is_file() {
        return Ok(None);
    }

    let body = StreamBody::new(ReaderStream::new(file).map_ok(Frame::data)).boxed_unsync();
    let mut resp = Response::new(body);
    let headers = resp.headers_mut();
    headers.insert(CONTENT_LENGTH, HeaderValue::from(meta.len()));
    headers.insert(CONTENT_TYPE, content_type(path));
    Ok(Some(resp))
}

fn target_str(target: &FileTarget) -> String {
    format!("/{}/{}", target.dir(), target.name())
}

fn empty(status: StatusCode) -> Response<Body> {
    let mut resp = Response::new(Empty::<Bytes>::new().map_err(|never| match never {}).boxed_unsync());
    *resp.status_mut() = status;
    resp
}

fn text(status: StatusCode, msg: impl Into<String>) -> Response<Body> {
    let body = Full::new(Bytes::from(msg.into()))
        .map_err(|never| match never {})
        .boxed_unsync();
    let mut resp = Response::new(body);
    *resp.status_mut() = status;
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    resp
}
