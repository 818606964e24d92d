//! Server-Sent Events bridge for `stream: true` chat/completions requests
//! (spec.md §6: `data: {json}\n\n` frames, terminated by `data: [DONE]\n\n`).

use std::convert::Infallible;
use std::sync::Arc;

use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::error::Result;
use crate::types::{ChatCompletionRequest, Principal, StreamChunk};

use super::state::AppState;

/// Spawns the gateway's stream pipeline and bridges its chunk channel into
/// an SSE response. The gateway call runs to completion in the background
/// task regardless of whether the client disconnects early — axum/hyper
/// drop the response stream, which in turn drops `rx` and causes the
/// pipeline's `out.send(...)` calls to start failing, unwinding the router
/// loop naturally without an explicit cancellation signal (SPEC_FULL.md §5).
pub async fn chat_completions_stream(
    state: Arc<AppState>,
    principal: Arc<Principal>,
    request: ChatCompletionRequest,
) -> Response {
    let (tx, rx) = mpsc::channel::<Result<StreamChunk>>(64);

    tokio::spawn(async move {
        if let Err(e) = state
            .gateway
            .process_stream_request(&principal, request, "/v1/chat/completions", tx)
            .await
        {
            tracing::warn!("stream request failed before dispatch: {e}");
        }
    });

    let frames = ReceiverStream::new(rx).map(|item| -> std::result::Result<Event, Infallible> {
        match item {
            Ok(chunk) => Ok(Event::default().data(serde_json::to_string(&chunk).unwrap_or_default())),
            Err(e) => Ok(Event::default().data(
                serde_json::json!({"error": {"code": e.code(), "message": e.user_message()}}).to_string(),
            )),
        }
    });
    let events = frames.chain(futures::stream::once(async { Ok(Event::default().data("[DONE]")) }));

    Sse::new(events).keep_alive(KeepAlive::default()).into_response()
}
