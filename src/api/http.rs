//! Axum router: health check, one-shot turn, and the SSE streaming turn.

use crate::db::ResponseStatus;
use crate::orchestrator::{Orchestrator, TurnEvent, TurnRequest};
use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Orchestrator,
}

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/v1/turns", post(create_turn))
        .route("/v1/turns/stream", post(stream_turn))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

async fn health() -> &'static str {
    "ok"
}

#[derive(Debug, Deserialize)]
struct TurnRequestBody {
    thread_id: Option<String>,
    model: String,
    message: String,
    #[serde(default)]
    max_output_tokens: Option<u32>,
    #[serde(default)]
    tool_results_text: Option<String>,
    #[serde(default)]
    tool_results_tokens: Option<u32>,
}

impl From<TurnRequestBody> for TurnRequest {
    fn from(body: TurnRequestBody) -> Self {
        TurnRequest {
            thread_id: body.thread_id,
            model_id: body.model,
            user_text: body.message,
            requested_max_output_tokens: body.max_output_tokens,
            tool_results_text: body.tool_results_text,
            tool_results_tokens: body.tool_results_tokens,
        }
    }
}

#[derive(Debug, Serialize)]
struct TurnResponseBody {
    thread_id: String,
    content: String,
    status: &'static str,
    diagnostics: serde_json::Value,
}

fn status_str(status: ResponseStatus) -> &'static str {
    match status {
        ResponseStatus::Ok => "ok",
        ResponseStatus::Cancelled => "cancelled",
        ResponseStatus::Error => "error",
    }
}

async fn create_turn(
    State(state): State<AppState>,
    Json(body): Json<TurnRequestBody>,
) -> Result<Json<TurnResponseBody>, crate::error::GatewayError> {
    let outcome = state.orchestrator.run_turn(body.into()).await?;
    Ok(Json(TurnResponseBody {
        thread_id: outcome.thread_id,
        content: outcome.content,
        status: status_str(outcome.status),
        diagnostics: serde_json::to_value(&outcome.diagnostics).unwrap_or_default(),
    }))
}

/// SSE event shape sent to the client: content deltas, then exactly one
/// terminal `done`/`error` event (spec §6 diagnostic surface).
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum TurnSseEvent {
    Delta { content: String },
    Done { content: String, status: &'static str, diagnostics: serde_json::Value },
    Error { message: String },
}

async fn stream_turn(
    State(state): State<AppState>,
    Json(body): Json<TurnRequestBody>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut turn_events = state.orchestrator.stream_turn(body.into()).await;

    let stream = async_stream::stream! {
        use futures::StreamExt;
        while let Some(event) = turn_events.next().await {
            let sse_event = match event {
                TurnEvent::Delta(content) => TurnSseEvent::Delta { content },
                TurnEvent::Done(outcome) => TurnSseEvent::Done {
                    content: outcome.content,
                    status: status_str(outcome.status),
                    diagnostics: serde_json::to_value(&outcome.diagnostics).unwrap_or_default(),
                },
                TurnEvent::Error(message) => TurnSseEvent::Error { message },
            };
            let data = serde_json::to_string(&sse_event).unwrap_or_default();
            yield Ok(Event::default().data(data));
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}
