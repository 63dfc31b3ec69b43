//! SSE (Server-Sent Events) streaming for token-by-token responses.
//!
//! Converts a prompt's event stream into an SSE stream compatible with the
//! OpenAI completions streaming format. Dropping the SSE stream (client
//! disconnect) cancels the prompt.

use std::sync::Arc;

use axum::response::sse::Event;
use futures::stream::Stream;
use serde::Serialize;
use tokio_stream::StreamExt;

use crate::inference::bridge::{PromptEvent, PromptHandle};
use crate::metrics::{BridgeMetrics, PromptTimer};
use crate::server::openai_api::{finish_reason_label, unix_now, ErrorBody};

/// Streaming completion chunk (OpenAI-compatible).
#[derive(Debug, Serialize)]
pub struct CompletionChunk {
    pub id: String,
    pub object: String,
    pub created: u64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
}

#[derive(Debug, Serialize)]
pub struct ChunkChoice {
    pub index: usize,
    pub text: String,
    pub logprobs: Option<f32>,
    pub finish_reason: Option<String>,
}

/// Convert a running prompt into an SSE stream ending with `[DONE]`.
pub fn prompt_to_sse_stream(
    handle: PromptHandle,
    request_id: String,
    model: String,
    n_predict: i32,
    metrics: Arc<BridgeMetrics>,
    timer: PromptTimer,
) -> impl Stream<Item = Result<Event, std::convert::Infallible>> {
    let cancel_on_drop = handle.cancellation_token().drop_guard();
    let mut timer = Some(timer);

    let chunk = move |text: String, finish_reason: Option<String>| CompletionChunk {
        id: format!("cmpl-{request_id}"),
        object: "text_completion".to_string(),
        created: unix_now(),
        model: model.clone(),
        choices: vec![ChunkChoice {
            index: 0,
            text,
            logprobs: None,
            finish_reason,
        }],
    };

    handle
        .into_stream()
        .map(move |event| {
            // Owned by the stream; fires when the client goes away.
            let _ = &cancel_on_drop;

            let event = match event {
                PromptEvent::Token(text) => {
                    metrics.tokens_streamed(1);
                    json_event(&chunk(text, None))
                }
                PromptEvent::Done(completion) => {
                    let reason = finish_reason_label(&completion, n_predict);
                    if let Some(timer) = timer.take() {
                        timer.finish(&Ok(completion));
                    }
                    json_event(&chunk(String::new(), Some(reason.to_string())))
                }
                PromptEvent::Error(e) => {
                    let body = ErrorBody::from_error(&e);
                    if let Some(timer) = timer.take() {
                        timer.finish(&Err(e));
                    }
                    json_event(&body).event("error")
                }
            };
            Ok(event)
        })
        // Append the [DONE] sentinel after all events.
        .chain(tokio_stream::once(Ok(Event::default().data("[DONE]"))))
}

fn json_event<T: Serialize>(body: &T) -> Event {
    Event::default().data(serde_json::to_string(body).unwrap_or_default())
}
