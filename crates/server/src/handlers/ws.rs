//! WebSocket transport for the upload protocol.

use crate::error::{ApiError, ApiResult, UploadError};
use crate::processor::ByteSource;
use crate::session::{MessageSink, SinkClosed};
use crate::state::AppState;
use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use bytes::Bytes;
use drivex_core::wire::ChunkEnvelope;
use drivex_core::{FileId, ServerMessage, UploadStatus};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};

/// GET /ws/upload/{file_id} - Upgrade and run the upload session.
pub async fn upload_socket(
    State(state): State<AppState>,
    Path(file_id): Path<String>,
    ws: WebSocketUpgrade,
) -> ApiResult<Response> {
    let file_id = FileId::parse(&file_id)?;
    let session = state
        .metadata
        .get_session(*file_id.as_uuid())
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("upload {file_id}")))?
        .into_session()?;

    if session.status != UploadStatus::Pending {
        return Err(ApiError::BadRequest(format!(
            "upload {file_id} is {}, expected pending",
            session.status
        )));
    }

    let pipeline = state.pipeline.clone();
    Ok(ws.on_upgrade(move |socket| async move {
        let (sender, receiver) = socket.split();
        // The outcome is persisted and reported to the client by the pipeline.
        let _ = pipeline
            .run(&session, WsSource { receiver }, WsSink { sender })
            .await;
    }))
}

/// Client frames: binary frames carry raw bytes, text frames carry a
/// base64 JSON envelope.
struct WsSource {
    receiver: SplitStream<WebSocket>,
}

#[async_trait]
impl ByteSource for WsSource {
    async fn next_bytes(&mut self) -> Result<Option<Bytes>, UploadError> {
        loop {
            match self.receiver.next().await {
                Some(Ok(Message::Binary(data))) => return Ok(Some(data)),
                Some(Ok(Message::Text(text))) => {
                    return ChunkEnvelope::decode_frame(text.as_str())
                        .map(Some)
                        .map_err(|e| UploadError::Protocol(e.to_string()));
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Err(e)) => {
                    tracing::debug!(error = %e, "websocket read failed");
                    return Ok(None);
                }
            }
        }
    }
}

struct WsSink {
    sender: SplitSink<WebSocket, Message>,
}

#[async_trait]
impl MessageSink for WsSink {
    async fn send(&mut self, message: ServerMessage) -> Result<(), SinkClosed> {
        self.sender
            .send(Message::Text(message.to_json().into()))
            .await
            .map_err(|_| SinkClosed)
    }

    async fn close(&mut self) {
        if let Err(e) = self.sender.close().await {
            tracing::debug!(error = %e, "websocket close failed");
        }
    }
}
