use axum::http::StatusCode;
use axum::{Json, Router, routing::post};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::daemon::DaemonHandle;
use crate::error::VantageError;
use crate::persist::Cell;

#[derive(Deserialize)]
pub struct QueryRequest {
    pub sql: String,
}

#[derive(Serialize)]
pub struct QueryResponse {
    pub status: String,
    pub elapsed_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub columns: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows: Option<Vec<Vec<Cell>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl QueryResponse {
    fn failed(elapsed_ms: f64, error: String) -> Self {
        Self { status: "error".into(), elapsed_ms, columns: None, rows: None, row_count: None, error: Some(error) }
    }
}

pub fn router(daemon: DaemonHandle) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([axum::http::Method::POST])
        .allow_headers(Any);
    Router::new()
        .route(
            "/v1/query",
            post(move |Json(req): Json<QueryRequest>| {
                let daemon = daemon.clone();
                async move {
                    let started = std::time::Instant::now();
                    // the daemon answers synchronously over a channel
                    let outcome = tokio::task::spawn_blocking(move || daemon.query(&req.sql)).await;
                    let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
                    match outcome {
                        Ok(Ok(result)) => {
                            info!(ms = elapsed_ms, rows = result.len(), "query complete");
                            let body = QueryResponse {
                                status: "ok".into(),
                                elapsed_ms,
                                row_count: Some(result.len()),
                                columns: Some(result.columns),
                                rows: Some(result.rows),
                                error: None,
                            };
                            (StatusCode::OK, Json(body))
                        }
                        Ok(Err(e)) => {
                            let status = match e {
                                VantageError::QuerySyntax(_) => StatusCode::BAD_REQUEST,
                                _ => StatusCode::INTERNAL_SERVER_ERROR,
                            };
                            warn!(error = %e, code = %status.as_u16(), "query error");
                            (status, Json(QueryResponse::failed(elapsed_ms, e.to_string())))
                        }
                        Err(e) => {
                            warn!(error = %e, "join error");
                            (
                                StatusCode::INTERNAL_SERVER_ERROR,
                                Json(QueryResponse::failed(elapsed_ms, e.to_string())),
                            )
                        }
                    }
                }
            }),
        )
        .layer(cors)
}
