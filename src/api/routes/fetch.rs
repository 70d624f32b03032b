//! Fetch handler: the `GET /` download endpoint.

use crate::api::AppState;
use crate::broker::Deliverable;
use crate::error::{Error, Result};
use crate::lifecycle::ArtifactLease;
use axum::{
    body::{Body, Bytes},
    extract::{RawQuery, State},
    http::{HeaderValue, StatusCode, header},
    response::Response,
};
use futures::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::fs::File;
use tokio_util::io::ReaderStream;

/// GET / - Fetch media and download the result
///
/// Repeat `url` for several items; several artifacts are returned as one archive.
/// Every artifact of the request is deleted once the response body is dropped,
/// whether or not it was fully transmitted.
#[utoipa::path(
    get,
    path = "/",
    tag = "fetch",
    params(
        ("url" = Vec<String>, Query, description = "Absolute media URL; repeat for several"),
        ("format" = Option<String>, Query, description = "audio (default) or video")
    ),
    responses(
        (status = 200, description = "The fetched file or an archive of all fetched files", content_type = "application/octet-stream"),
        (status = 400, description = "Missing or malformed url, or unsupported format", body = crate::error::ApiError),
        (status = 403, description = "Projected size exceeds the request budget", body = crate::error::ApiError),
        (status = 500, description = "Probe, fetch, or bundle failed", body = crate::error::ApiError),
        (status = 507, description = "Not enough free disk space", body = crate::error::ApiError)
    )
)]
pub async fn fetch_media(
    State(state): State<AppState>,
    RawQuery(query): RawQuery,
) -> Result<Response> {
    let (urls, format) = parse_query(query.as_deref().unwrap_or_default());
    let deliverable = state.broker.submit(urls, format.as_deref()).await?;
    deliverable_response(deliverable).await
}

/// Split a query string into every `url` value and the first `format` value
pub fn parse_query(query: &str) -> (Vec<String>, Option<String>) {
    let mut urls = Vec::new();
    let mut format = None;

    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        match key.as_ref() {
            "url" => urls.push(value.into_owned()),
            "format" if format.is_none() => format = Some(value.into_owned()),
            _ => {}
        }
    }

    (urls, format)
}

async fn deliverable_response(deliverable: Deliverable) -> Result<Response> {
    let Deliverable {
        id,
        path,
        file_name,
        size_bytes,
        lease,
    } = deliverable;

    let file = File::open(&path).await?;
    let body = Body::from_stream(LeasedStream {
        inner: ReaderStream::new(file),
        _lease: lease,
    });

    let disposition = HeaderValue::from_str(&content_disposition(&file_name))
        .map_err(|e| Error::Other(format!("invalid Content-Disposition: {}", e)))?;
    let request_id = HeaderValue::from_str(id.as_str())
        .map_err(|e| Error::Other(format!("invalid request id header: {}", e)))?;

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(header::CONTENT_LENGTH, size_bytes)
        .header(header::CONTENT_DISPOSITION, disposition)
        .header("x-request-id", request_id)
        .body(body)
        .map_err(|e| Error::ApiServerError(e.to_string()))
}

/// `attachment` disposition with an ASCII fallback and an RFC 5987 UTF-8 name
pub fn content_disposition(file_name: &str) -> String {
    let fallback: String = file_name
        .chars()
        .map(|c| match c {
            '"' | '\\' => '_',
            c if c == ' ' || c.is_ascii_graphic() => c,
            _ => '_',
        })
        .collect();

    format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        fallback,
        urlencoding::encode(file_name)
    )
}

/// File stream that keeps the request's artifacts alive until the body is dropped
struct LeasedStream {
    inner: ReaderStream<File>,
    _lease: ArtifactLease,
}

impl Stream for LeasedStream {
    type Item = std::io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}
