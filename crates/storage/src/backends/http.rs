//! Remote resumable-upload destination over HTTP.
//!
//! Protocol:
//! - `POST {endpoint}/upload?uploadType=resumable` with `X-Upload-Content-Length`
//!   and `X-Upload-Content-Type` opens a session; the session URL comes back in
//!   `Location`.
//! - `PUT {session}` with `Content-Range: bytes a-b/total` uploads a range.
//!   `308` means more bytes are expected, `200`/`201` returns `{"id": ...}`.
//! - `GET {endpoint}/files/{id}?alt=media` reads a completed object.
//!
//! Sessions only accept ranges in order.

use crate::error::{StorageError, StorageResult};
use crate::traits::{
    ByteStream, CompletedObject, OpenSessionRequest, RangeAck, ResumableStore, SessionHandle,
    StoreCapabilities, validate_range,
};
use async_trait::async_trait;
use bytes::Bytes;
use drivex_core::ByteRange;
use futures::StreamExt;
use reqwest::{Client, Response, StatusCode, header};
use serde::Deserialize;
use std::time::Duration;
use tracing::instrument;

/// Rate-limit reasons reported inside 403 bodies.
const RATE_LIMIT_REASONS: [&str; 2] = ["rateLimitExceeded", "userRateLimitExceeded"];

/// Longest error body kept in error messages.
const MAX_ERROR_BODY: usize = 512;

#[derive(Debug, Deserialize)]
struct CompletedBody {
    id: String,
}

/// HTTP resumable-upload destination.
pub struct HttpResumableBackend {
    client: Client,
    endpoint: String,
    access_token: Option<String>,
}

impl HttpResumableBackend {
    /// Create a backend for `endpoint`, with a per-request timeout.
    pub fn new(
        endpoint: impl Into<String>,
        access_token: Option<String>,
        timeout: Duration,
    ) -> StorageResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            // 308 is the "resume incomplete" status here, not a redirect.
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| StorageError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            access_token,
        })
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.access_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Map a non-success response to a storage error.
    async fn error_from_response(response: Response) -> StorageError {
        let status = response.status();
        let mut body = response.text().await.unwrap_or_default();
        truncate_at_char_boundary(&mut body, MAX_ERROR_BODY);

        if status == StatusCode::FORBIDDEN
            && RATE_LIMIT_REASONS.iter().any(|reason| body.contains(reason))
        {
            return StorageError::RateLimited(body);
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            return StorageError::RateLimited(body);
        }
        StorageError::Http {
            status: status.as_u16(),
            message: body,
        }
    }
}

/// Shorten `body` to at most `max` bytes without splitting a character.
fn truncate_at_char_boundary(body: &mut String, max: usize) {
    if body.len() <= max {
        return;
    }
    let cut = (0..=max)
        .rev()
        .find(|i| body.is_char_boundary(*i))
        .unwrap_or(0);
    body.truncate(cut);
}

#[async_trait]
impl ResumableStore for HttpResumableBackend {
    #[instrument(skip(self), fields(backend = "http"))]
    async fn open_session(&self, request: &OpenSessionRequest) -> StorageResult<SessionHandle> {
        let url = format!("{}/upload?uploadType=resumable", self.endpoint);
        let response = self
            .authorize(self.client.post(&url))
            .header("X-Upload-Content-Type", &request.content_type)
            .header("X-Upload-Content-Length", request.total_size.to_string())
            .json(&serde_json::json!({
                "name": request.name,
                "mimeType": request.content_type,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::error_from_response(response).await);
        }

        let location = response
            .headers()
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| StorageError::Protocol("session response missing Location".into()))?;

        Ok(SessionHandle {
            reference: location.to_string(),
            total_size: request.total_size,
        })
    }

    #[instrument(skip(self, session, data), fields(backend = "http", range = %range))]
    async fn upload_range(
        &self,
        session: &SessionHandle,
        range: ByteRange,
        data: Bytes,
    ) -> StorageResult<RangeAck> {
        validate_range(session, range, data.len())?;

        let response = self
            .authorize(self.client.put(&session.reference))
            .header(header::CONTENT_RANGE, range.content_range(session.total_size))
            .header(header::CONTENT_LENGTH, data.len())
            .body(data)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::PERMANENT_REDIRECT {
            if let Some(acked) = response
                .headers()
                .get(header::RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| ByteRange::parse_range_header(v).ok())
                && acked.end < range.end
            {
                // The destination kept fewer bytes than sent; retrying resends the range.
                return Err(StorageError::Transport(format!(
                    "destination acknowledged only {acked} of {range}"
                )));
            }
            return Ok(RangeAck::Partial);
        }

        if status == StatusCode::OK || status == StatusCode::CREATED {
            let body: CompletedBody = response.json().await?;
            return Ok(RangeAck::Complete(CompletedObject {
                reference: body.id,
                size: session.total_size,
            }));
        }

        if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
            return Err(StorageError::SessionNotFound(session.reference.clone()));
        }

        Err(Self::error_from_response(response).await)
    }

    #[instrument(skip(self), fields(backend = "http"))]
    async fn read_object(&self, reference: &str) -> StorageResult<ByteStream> {
        let url = format!("{}/files/{}?alt=media", self.endpoint, reference);
        let response = self.authorize(self.client.get(&url)).send().await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(StorageError::NotFound(reference.to_string()));
        }
        if !response.status().is_success() {
            return Err(Self::error_from_response(response).await);
        }

        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(StorageError::from));
        Ok(Box::pin(stream))
    }

    fn capabilities(&self) -> StoreCapabilities {
        StoreCapabilities {
            out_of_order_ranges: false,
        }
    }

    fn backend_name(&self) -> &'static str {
        "http"
    }
}
