//! OpenAI-compatible HTTP API.
//!
//! Implements the subset of the OpenAI API a local model can serve:
//! - POST /v1/completions
//! - POST /v1/embeddings
//! - GET /v1/models
//! - GET /health
//! - GET /metrics (Prometheus)

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::sse::{KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::Error;
use crate::inference::bridge::{Completion, FinishReason, PromptRequest};
use crate::inference::model::LlModel;
use crate::inference::native::PromptOptions;
use crate::metrics::BridgeMetrics;
use crate::server::streaming::prompt_to_sse_stream;

/// Application state shared across handlers.
pub struct AppState {
    pub model: Arc<LlModel>,
    pub config: Arc<Config>,
    pub metrics: Arc<BridgeMetrics>,
    pub start_time: Instant,
}

/// Build the axum router with all API routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/completions", post(completions))
        .route("/v1/embeddings", post(embeddings))
        .route("/v1/models", get(list_models))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ─── Errors ────────────────────────────────────────────────────────────────

/// OpenAI-style error payload.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub message: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub code: Option<i32>,
}

impl ErrorBody {
    pub fn from_error(e: &Error) -> Self {
        let kind = match e {
            Error::LoadFailure(_) => "load_failure",
            Error::NotLoaded => "model_not_loaded",
            Error::Busy { .. } => "model_busy",
            Error::Validation(_) | Error::UnknownMethod(_) => "invalid_request_error",
            Error::Native(_) => "native_error",
            Error::GpuUnavailable(_) => "gpu_unavailable",
            Error::Cancelled => "cancelled",
            Error::Internal(_) => "internal_error",
        };
        Self {
            error: ErrorDetail {
                message: e.to_string(),
                kind: kind.to_string(),
                code: e.record().map(|r| r.code),
            },
        }
    }
}

/// Bridge error rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

pub fn status_for(e: &Error) -> StatusCode {
    match e {
        Error::Validation(_) | Error::UnknownMethod(_) => StatusCode::BAD_REQUEST,
        Error::NotLoaded | Error::GpuUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        Error::Busy { .. } => StatusCode::TOO_MANY_REQUESTS,
        Error::Cancelled => StatusCode::REQUEST_TIMEOUT,
        Error::LoadFailure(_) | Error::Native(_) | Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            warn!(status = status.as_u16(), "Request failed: {}", self.0);
        }
        (status, Json(ErrorBody::from_error(&self.0))).into_response()
    }
}

// ─── Request/Response Types ────────────────────────────────────────────────

/// A single prompt or a batch of prompts.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PromptInput {
    One(String),
    Many(Vec<String>),
}

impl PromptInput {
    fn into_vec(self) -> Vec<String> {
        match self {
            PromptInput::One(prompt) => vec![prompt],
            PromptInput::Many(prompts) => prompts,
        }
    }
}

/// Completion request (OpenAI-compatible). Absent sampling fields fall back
/// to the configured generation defaults.
#[derive(Debug, Deserialize)]
pub struct CompletionRequest {
    #[serde(default)]
    pub model: Option<String>,
    pub prompt: PromptInput,
    pub max_tokens: Option<i32>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub top_k: Option<i32>,
    pub repeat_penalty: Option<f32>,
    #[serde(default = "default_n")]
    pub n: usize,
    #[serde(default)]
    pub stream: bool,
}

fn default_n() -> usize {
    1
}

impl CompletionRequest {
    fn options(&self, defaults: &PromptOptions) -> PromptOptions {
        let mut options = defaults.clone();
        if let Some(max_tokens) = self.max_tokens {
            options.n_predict = max_tokens;
        }
        if let Some(temperature) = self.temperature {
            options.temp = temperature;
        }
        if let Some(top_p) = self.top_p {
            options.top_p = top_p;
        }
        if let Some(top_k) = self.top_k {
            options.top_k = top_k;
        }
        if let Some(repeat_penalty) = self.repeat_penalty {
            options.repeat_penalty = repeat_penalty;
        }
        options
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub id: String,
    pub object: String,
    pub created: u64,
    pub model: String,
    pub choices: Vec<CompletionChoice>,
    pub usage: Usage,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CompletionChoice {
    pub index: usize,
    pub text: String,
    pub logprobs: Option<f32>,
    pub finish_reason: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

#[derive(Debug, Deserialize)]
pub struct EmbeddingRequest {
    #[serde(default)]
    pub model: Option<String>,
    pub input: PromptInput,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EmbeddingResponse {
    pub object: String,
    pub data: Vec<EmbeddingData>,
    pub model: String,
    pub usage: Usage,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EmbeddingData {
    pub object: String,
    pub index: usize,
    pub embedding: Vec<f32>,
}

/// Model listing response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ModelList {
    pub object: String,
    pub data: Vec<ModelInfo>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub object: String,
    pub created: u64,
    pub owned_by: String,
    #[serde(rename = "type")]
    pub model_type: String,
    pub build_variant: String,
}

/// Health check response.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
    pub model: String,
    pub loaded: bool,
    pub pending_prompts: usize,
}

pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// OpenAI `finish_reason` for a completion generated with `n_predict`.
pub fn finish_reason_label(completion: &Completion, n_predict: i32) -> &'static str {
    match completion.finish_reason {
        FinishReason::Cancelled => "cancelled",
        FinishReason::Stop if completion.completion_tokens >= n_predict.max(0) as usize => "length",
        FinishReason::Stop => "stop",
    }
}

// ─── Route Handlers ────────────────────────────────────────────────────────

async fn completions(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CompletionRequest>,
) -> Result<Response, ApiError> {
    let request_id = Uuid::new_v4().to_string();
    let options = req.options(&state.config.generation);
    let model_name = req
        .model
        .clone()
        .unwrap_or_else(|| state.model.name().to_string());
    let n = req.n;
    let stream = req.stream;
    let prompts = req.prompt.into_vec();

    info!(
        request_id = request_id,
        prompts = prompts.len(),
        n,
        stream,
        "Completion request"
    );

    if prompts.is_empty() {
        return Err(Error::Validation("prompt list cannot be empty".into()).into());
    }
    if n == 0 || n > state.config.model.max_queued_prompts.max(1) {
        return Err(Error::Validation(format!(
            "n must be between 1 and {}",
            state.config.model.max_queued_prompts.max(1)
        ))
        .into());
    }

    if stream {
        if prompts.len() != 1 || n != 1 {
            return Err(Error::Validation("streaming supports a single prompt with n = 1".into()).into());
        }
        let n_predict = options.n_predict;
        let request = PromptRequest::new(prompts[0].clone()).with_options(options);
        let handle = state.model.prompt(request).inspect_err(|_| state.metrics.prompt_rejected())?;
        let timer = state.metrics.prompt_started();

        let stream = prompt_to_sse_stream(handle, request_id, model_name, n_predict, state.metrics.clone(), timer);
        return Ok(Sse::new(stream).keep_alive(KeepAlive::default()).into_response());
    }

    let timeout = Duration::from_secs(state.config.server.request_timeout_secs);
    let mut choices = Vec::with_capacity(prompts.len() * n);
    let mut completion_tokens = 0;

    for prompt in prompts {
        for _ in 0..n {
            let request = PromptRequest::new(prompt.clone()).with_options(options.clone());
            let completion = run_to_completion(&state, request, timeout).await?;
            completion_tokens += completion.completion_tokens;
            choices.push(CompletionChoice {
                index: choices.len(),
                finish_reason: finish_reason_label(&completion, options.n_predict).to_string(),
                text: completion.text,
                logprobs: None,
            });
        }
    }

    Ok(Json(CompletionResponse {
        id: format!("cmpl-{request_id}"),
        object: "text_completion".to_string(),
        created: unix_now(),
        model: model_name,
        choices,
        usage: Usage {
            prompt_tokens: 0,
            completion_tokens,
            total_tokens: completion_tokens,
        },
    })
    .into_response())
}

/// Submit one prompt and wait for it. The prompt is cancelled if the request
/// is dropped or the timeout expires.
async fn run_to_completion(
    state: &AppState,
    request: PromptRequest,
    timeout: Duration,
) -> Result<Completion, Error> {
    let handle = state
        .model
        .prompt(request)
        .inspect_err(|_| state.metrics.prompt_rejected())?;
    let timer = state.metrics.prompt_started();
    let cancel_on_drop = handle.cancellation_token().drop_guard();

    let outcome = match tokio::time::timeout(timeout, handle.finish()).await {
        Ok(outcome) => outcome,
        Err(_) => Err(Error::Cancelled),
    };
    if let Ok(completion) = &outcome {
        state.metrics.tokens_streamed(completion.completion_tokens);
    }
    timer.finish(&outcome);

    if outcome.is_ok() {
        cancel_on_drop.disarm();
    }
    outcome
}

async fn embeddings(
    State(state): State<Arc<AppState>>,
    Json(req): Json<EmbeddingRequest>,
) -> Result<Json<EmbeddingResponse>, ApiError> {
    let inputs = req.input.into_vec();
    if inputs.is_empty() {
        return Err(Error::Validation("input cannot be empty".into()).into());
    }

    let model = state.model.clone();
    let vectors = tokio::task::spawn_blocking(move || {
        inputs
            .iter()
            .map(|text| model.embed(text))
            .collect::<Result<Vec<_>, Error>>()
    })
    .await
    .map_err(|e| Error::Internal(format!("embedding worker failed: {e}")))??;

    let data = vectors
        .into_iter()
        .enumerate()
        .map(|(index, embedding)| {
            state.metrics.embedding_computed();
            EmbeddingData {
                object: "embedding".to_string(),
                index,
                embedding,
            }
        })
        .collect();

    Ok(Json(EmbeddingResponse {
        object: "list".to_string(),
        data,
        model: req.model.unwrap_or_else(|| state.model.name().to_string()),
        usage: Usage::default(),
    }))
}

async fn list_models(State(state): State<Arc<AppState>>) -> Json<ModelList> {
    Json(ModelList {
        object: "list".to_string(),
        data: vec![ModelInfo {
            id: state.model.name().to_string(),
            object: "model".to_string(),
            created: 0,
            owned_by: "local".to_string(),
            model_type: state.model.model_type().to_string(),
            build_variant: state.model.build_variant().to_string(),
        }],
    })
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let loaded = state.model.is_loaded();
    Json(HealthResponse {
        status: if loaded { "ok" } else { "unloaded" }.to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        model: state.model.name().to_string(),
        loaded,
        pending_prompts: state.model.pending_prompts(),
    })
}

async fn metrics(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    let body = state.metrics.render()?;
    Ok(([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for(&Error::NotLoaded), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(status_for(&Error::Busy { queued: 8 }), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(status_for(&Error::Validation("x".into())), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(&Error::Cancelled), StatusCode::REQUEST_TIMEOUT);
        assert_eq!(
            status_for(&Error::Native(crate::error::ErrorRecord::new(-1, "boom"))),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_error_body_keeps_native_code() {
        let body = ErrorBody::from_error(&Error::LoadFailure(crate::error::ErrorRecord::new(2, "no such file")));
        assert_eq!(body.error.kind, "load_failure");
        assert_eq!(body.error.code, Some(2));
        assert!(body.error.message.contains("no such file"));
    }

    #[test]
    fn test_prompt_input_forms() {
        let one: CompletionRequest = serde_json::from_str(r#"{"prompt": "hi"}"#).unwrap();
        assert_eq!(one.prompt.into_vec(), vec!["hi"]);
        let many: CompletionRequest = serde_json::from_str(r#"{"prompt": ["a", "b"], "n": 2}"#).unwrap();
        assert_eq!(many.n, 2);
        assert_eq!(many.prompt.into_vec().len(), 2);
    }

    #[test]
    fn test_request_overrides_defaults() {
        let req: CompletionRequest =
            serde_json::from_str(r#"{"prompt": "hi", "max_tokens": 7, "temperature": 0.0}"#).unwrap();
        let options = req.options(&PromptOptions::default());
        assert_eq!(options.n_predict, 7);
        assert_eq!(options.temp, 0.0);
        assert_eq!(options.top_k, PromptOptions::default().top_k);
    }

    #[test]
    fn test_finish_reason_labels() {
        let completion = |tokens, finish_reason| Completion {
            text: String::new(),
            completion_tokens: tokens,
            finish_reason,
        };
        assert_eq!(finish_reason_label(&completion(3, FinishReason::Stop), 10), "stop");
        assert_eq!(finish_reason_label(&completion(10, FinishReason::Stop), 10), "length");
        assert_eq!(finish_reason_label(&completion(2, FinishReason::Cancelled), 10), "cancelled");
    }
}
