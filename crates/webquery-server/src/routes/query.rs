//! Query routes: run a query, stream its progress, or dry-run its plan.

use std::pin::Pin;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use futures::Stream;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{error, info};
use webquery_core::{Error, ErrorKind, Query};

use crate::state::AppState;

type SseStream = Pin<Box<dyn Stream<Item = Result<Event, axum::Error>> + Send>>;

#[derive(Debug, Deserialize)]
pub struct QueryRequest {
    pub query: String,
    #[serde(default, alias = "agentId")]
    pub agent_id: Option<String>,
    #[serde(default, alias = "sessionName")]
    pub session_name: Option<String>,
}

impl QueryRequest {
    fn into_query(self) -> Query {
        Query::new(self.query).with_agent(self.agent_id, self.session_name)
    }
}

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/query", post(run_query))
        .route("/query/stream", post(stream_query))
        .route("/plan", post(plan_query))
}

// ---------------------------------------------------------------
// Blocking query
// ---------------------------------------------------------------

async fn run_query(
    State(state): State<Arc<AppState>>,
    Json(req): Json<QueryRequest>,
) -> Response {
    let query = req.into_query();
    info!("Query {} received ({} chars)", query.id(), query.text().len());

    match state.orchestrator.run(&query, None).await {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(e) => error_response(&e),
    }
}

// ---------------------------------------------------------------
// Streaming query (SSE)
// ---------------------------------------------------------------

async fn stream_query(
    State(state): State<Arc<AppState>>,
    Json(req): Json<QueryRequest>,
) -> Response {
    let query = req.into_query();
    let plan = match state.orchestrator.planner().plan(&query) {
        Ok(plan) => plan,
        Err(e) => return error_response(&e),
    };
    info!("Streaming query {} ({} steps)", query.id(), plan.len());

    let (tx, mut rx) = mpsc::unbounded_channel();
    let runner = state.clone();
    // Runs to completion even if the client goes away; results still land in the cache.
    let handle = tokio::spawn(async move {
        runner.orchestrator.execute(&query, &plan, Some(&tx)).await
    });

    let stream: SseStream = Box::pin(async_stream::stream! {
        while let Some(event) = rx.recv().await {
            yield Event::default().event(event.name()).json_data(&event);
        }
        match handle.await {
            Ok(response) => {
                yield Event::default().event("result").json_data(&response);
            }
            Err(e) => {
                error!("Plan task failed: {}", e);
                yield Event::default().event("error").json_data(serde_json::json!({
                    "error": format!("plan task failed: {}", e),
                    "kind": ErrorKind::Internal,
                }));
            }
        }
    });

    Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response()
}

// ---------------------------------------------------------------
// Dry run
// ---------------------------------------------------------------

async fn plan_query(
    State(state): State<Arc<AppState>>,
    Json(req): Json<QueryRequest>,
) -> Response {
    let query = req.into_query();
    match state.orchestrator.planner().plan(&query) {
        Ok(plan) => (StatusCode::OK, Json(plan)).into_response(),
        Err(e) => error_response(&e),
    }
}

// ---------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------

fn error_response(e: &Error) -> Response {
    let status = match e.kind() {
        ErrorKind::UnplannableQuery => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::PoolExhausted => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::PlanTimeout | ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(serde_json::json!({
            "error": e.to_string(),
            "kind": e.kind(),
        })),
    )
        .into_response()
}
