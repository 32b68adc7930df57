//! HTTP file server for media-relay
//!
//! Serves files under the configured root and runs the relay hook for each
//! one. Also exposes the process registries at `/_relay/status`.

use crate::admission::{extension_of, DisconnectFlag, TranscodeRequest};
use crate::relay::{Outcome, Relay, RelayStatus};
use axum::body::Body;
use axum::extract::{Path as UrlPath, RawQuery, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{routing::get, Json, Router};
use std::future::Future;
use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

/// Query string that asks for a transcode explicitly
pub const TRANSCODE_QUERY: &str = "ffmpeg";

/// Errors that can occur when running the relay server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Invalid bind address: {0}")]
    InvalidBind(String),

    #[error("Failed to bind to address: {0}")]
    BindError(#[from] std::io::Error),
}

/// Map a request path onto the served root, refusing anything that could
/// step outside it.
pub fn resolve_path(root: &Path, request_path: &str) -> Option<PathBuf> {
    let rel = Path::new(request_path.trim_start_matches('/'));
    let mut resolved = root.to_path_buf();
    let mut depth = 0;
    for component in rel.components() {
        match component {
            Component::Normal(part) => {
                resolved.push(part);
                depth += 1;
            }
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    if depth == 0 {
        return None;
    }
    Some(resolved)
}

/// Content type for a pass-through file
pub fn content_type_for(ext: &str) -> &'static str {
    match ext {
        "mp3" => "audio/mpeg",
        "flac" => "audio/flac",
        "wav" => "audio/wav",
        "m4a" | "alac" => "audio/mp4",
        "ogg" => "audio/ogg",
        "wma" => "audio/x-ms-wma",
        "aiff" | "aif" => "audio/aiff",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "mov" => "video/quicktime",
        "avi" => "video/x-msvideo",
        "wmv" => "video/x-ms-wmv",
        "mpg" => "video/mpeg",
        "ts" => "video/mp2t",
        "flv" => "video/x-flv",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "txt" => "text/plain; charset=utf-8",
        "html" => "text/html; charset=utf-8",
        _ => "application/octet-stream",
    }
}

async fn serve_plain(path: &Path) -> Response {
    match tokio::fs::File::open(path).await {
        Ok(file) => (
            [(header::CONTENT_TYPE, content_type_for(&extension_of(path)))],
            Body::from_stream(ReaderStream::new(file)),
        )
            .into_response(),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "Failed to open file");
            StatusCode::NOT_FOUND.into_response()
        }
    }
}

/// Handler for GET /*path
async fn serve_file(
    State(relay): State<Relay>,
    UrlPath(path): UrlPath<String>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Response {
    let cfg = relay.current_config().await;
    let Some(src) = resolve_path(&cfg.server.root, &path) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    match tokio::fs::metadata(&src).await {
        Ok(meta) if meta.is_file() => {}
        _ => return StatusCode::NOT_FOUND.into_response(),
    }

    let account = headers
        .get(cfg.server.account_header.as_str())
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let explicit = query.as_deref() == Some(TRANSCODE_QUERY);
    let req = TranscodeRequest::new(src.clone(), explicit, account);

    // The hook runs detached so it outlives this handler; dropping the
    // handler (client gone) flips the flag it polls.
    let flag = DisconnectFlag::new();
    let guard = flag.guard();
    let task = {
        let (relay, flag) = (relay.clone(), flag.clone());
        tokio::spawn(async move { relay.handle(req, &flag).await })
    };
    let joined = task.await;
    guard.disarm();

    let outcome = match joined {
        Ok(outcome) => outcome,
        Err(e) => {
            debug!(path = %src.display(), error = %e, "Relay hook task failed");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    match outcome {
        Outcome::PassThrough => serve_plain(&src).await,
        Outcome::Rejected(status) => status.into_response(),
        Outcome::Disconnected => StatusCode::REQUEST_TIMEOUT.into_response(),
        Outcome::Ended(content_type) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, content_type)],
            Body::empty(),
        )
            .into_response(),
        Outcome::Stream(stream) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, stream.content_type)],
            Body::from_stream(stream.body),
        )
            .into_response(),
    }
}

/// Handler for GET /_relay/status
async fn get_status(State(relay): State<Relay>) -> Json<RelayStatus> {
    Json(relay.status().await)
}

/// Creates the axum Router serving files and the status endpoint
pub fn create_router(relay: Relay) -> Router {
    Router::new()
        .route("/_relay/status", get(get_status))
        .route("/*path", get(serve_file))
        .with_state(relay)
}

/// Bind and serve until `shutdown` resolves
pub async fn run_server<F>(relay: Relay, bind: &str, shutdown: F) -> Result<(), ServerError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr: SocketAddr = bind
        .parse()
        .map_err(|_| ServerError::InvalidBind(bind.to_string()))?;
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "Media relay listening");

    serve_listener(relay, listener, shutdown).await
}

/// Serve on an already bound listener.
///
/// When `shutdown` resolves every tracked encoder is force-killed right away,
/// so open transcode streams end and graceful shutdown can drain.
pub async fn serve_listener<F>(relay: Relay, listener: TcpListener, shutdown: F) -> Result<(), ServerError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let unload = {
        let relay = relay.clone();
        async move {
            shutdown.await;
            let killed = relay.unload();
            info!(killed, "Shutdown requested, encoders stopped");
        }
    };

    axum::serve(listener, create_router(relay))
        .with_graceful_shutdown(unload)
        .await?;

    Ok(())
}
