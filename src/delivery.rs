//! Getting a finished artifact to the client.

use std::{
    fmt,
    io,
    pin::Pin,
    str::FromStr,
    task::{Context, Poll},
};

use axum::{
    body::{Body, Bytes},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use futures::Stream;
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use tracing::{debug, error, info, warn};

use crate::{
    config::Config,
    error::AppError,
    job::Artifact,
    models::ProcessedImageResponse,
    storage::TransientFile,
};

/// Public path prefix the processed-images directory is served under.
pub const PROCESSED_ROUTE: &str = "/processed_images";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Keep the artifact on disk and answer with a URL to it.
    Link,
    /// Send the artifact as the response body, then delete it.
    Stream,
}

impl FromStr for DeliveryMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "link" => Ok(DeliveryMode::Link),
            "stream" => Ok(DeliveryMode::Stream),
            other => Err(format!("unknown delivery mode `{other}` (expected link or stream)")),
        }
    }
}

impl fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryMode::Link => f.write_str("link"),
            DeliveryMode::Stream => f.write_str("stream"),
        }
    }
}

/// `scheme://host` of the server as the current request sees it.
///
/// Only the `Host` header is used unless `trust_proxy` is set, in which case
/// `X-Forwarded-Host` and `X-Forwarded-Proto` take precedence.
pub fn base_url(config: &Config, headers: &HeaderMap) -> Result<String, AppError> {
    if let Some(base) = &config.public_base_url {
        return Ok(base.clone());
    }

    let forwarded = |name: &str| {
        config
            .trust_proxy
            .then(|| header_value(headers, name))
            .flatten()
    };

    let host = forwarded("x-forwarded-host")
        .or_else(|| header_value(headers, header::HOST.as_str()))
        .filter(|host| is_authority(host))
        .ok_or_else(|| AppError::BadRequest("Missing or invalid Host header".to_string()))?;

    let scheme = forwarded("x-forwarded-proto")
        .filter(|scheme| matches!(*scheme, "http" | "https"))
        .unwrap_or("http");

    Ok(format!("{scheme}://{host}"))
}

/// First comma-separated entry of a header, trimmed.
fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

/// `host[:port]` with nothing that could turn the link into another URL.
fn is_authority(host: &str) -> bool {
    host.chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | ':' | '[' | ']'))
}

pub fn artifact_url(base: &str, filename: &str) -> String {
    format!("{base}{PROCESSED_ROUTE}/{filename}")
}

/// Persist-and-link: the artifact stays for static serving.
pub fn link(artifact: Artifact, base: &str) -> Response {
    let filename = artifact.persist();
    let url = artifact_url(base, &filename);
    info!(%url, "artifact ready");

    (
        StatusCode::OK,
        Json(ProcessedImageResponse {
            processed_image_url: url,
        }),
    )
        .into_response()
}

/// Stream-and-delete: the body owns the artifact and removes it once the
/// transfer ends, however it ends.
pub async fn stream(artifact: Artifact) -> Result<Response, AppError> {
    let (filename, file_guard) = artifact.into_parts();

    let file = match File::open(file_guard.path()).await {
        Ok(file) => file,
        Err(err) => {
            file_guard.release().await;
            return Err(AppError::Internal(format!("open artifact for download: {err}")));
        }
    };
    let length = file.metadata().await.ok().map(|meta| meta.len());

    let body = Body::from_stream(ArtifactStream {
        inner: ReaderStream::new(file),
        guard: Some(file_guard),
        filename: filename.clone(),
        sent: 0,
    });

    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("image/png"));
    if let Ok(disposition) = HeaderValue::from_str(&format!("attachment; filename=\"{filename}\"")) {
        headers.insert(header::CONTENT_DISPOSITION, disposition);
    }
    if let Some(length) = length {
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
    }

    Ok((StatusCode::OK, headers, body).into_response())
}

struct ArtifactStream<S = ReaderStream<File>> {
    inner: S,
    guard: Option<TransientFile>,
    filename: String,
    sent: u64,
}

impl<S> Stream for ArtifactStream<S>
where
    S: Stream<Item = io::Result<Bytes>> + Unpin,
{
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let polled = Pin::new(&mut this.inner).poll_next(cx);

        match &polled {
            Poll::Ready(Some(Ok(chunk))) => this.sent += chunk.len() as u64,
            Poll::Ready(Some(Err(err))) => {
                error!(filename = %this.filename, error = %err, "reading artifact failed mid-download");
                this.guard.take();
            }
            Poll::Ready(None) => {
                debug!(filename = %this.filename, bytes = this.sent, "download complete");
                this.guard.take();
            }
            Poll::Pending => (),
        }

        polled
    }
}

impl<S> Drop for ArtifactStream<S> {
    fn drop(&mut self) {
        if self.guard.is_some() {
            warn!(filename = %self.filename, bytes = self.sent, "download interrupted");
        }
    }
}
