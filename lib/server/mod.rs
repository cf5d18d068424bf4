pub mod monitoring;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use prometheus_client::encoding::text::encode;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::backfill::{
    is_valid_listing_id, run_normalize_keywords, KeywordNormalizer, ListingPageSource,
};
use crate::logging::format_error_chain;
use crate::state::AppState;

async fn health_handler() -> String {
    "Healthy".to_string()
}

async fn expose_metrics(state: State<Arc<AppState>>) -> Response {
    let mut buffer = String::new();
    let registry = state.registry.read().await;
    match encode(&mut buffer, &registry) {
        Ok(()) => buffer.into_response(),
        Err(err) => {
            error!(event = "metrics_encode_failed", error = %err, "failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn normalize_keywords_all(State(state): State<Arc<AppState>>) -> Response {
    accept_normalize_keywords(state, None)
}

async fn normalize_keywords_single(
    State(state): State<Arc<AppState>>,
    Path(listing_id): Path<String>,
) -> Response {
    if !is_valid_listing_id(&listing_id) {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "invalidListingId" })),
        )
            .into_response();
    }
    accept_normalize_keywords(state, Some(listing_id))
}

/// Starts the sweep in the background and acknowledges immediately; the outcome is only
/// visible in logs and metrics.
fn accept_normalize_keywords(state: Arc<AppState>, listing_id: Option<String>) -> Response {
    let body = json!({
        "accepted": true,
        "listingId": listing_id,
        "message": "Normalize keywords script started",
    });
    spawn_normalize_keywords(state, listing_id);
    (StatusCode::OK, Json(body)).into_response()
}

pub fn spawn_normalize_keywords(
    state: Arc<AppState>,
    listing_id: Option<String>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let settings = state.normalize.clone();
        let source = ListingPageSource::new(Arc::clone(&state.client), &settings);
        let processor = KeywordNormalizer::new(
            Arc::clone(&state.client),
            settings.concurrency,
            settings.retry_policy,
        );

        info!(
            event = "normalize_keywords_accepted",
            listing_id = ?listing_id,
            "normalize keywords started"
        );
        let result = run_normalize_keywords(
            &source,
            &processor,
            &settings,
            listing_id.as_deref(),
            state.shutdown_token.child_token(),
        )
        .await;

        match result {
            Ok(report) => info!(
                event = "normalize_keywords_finished",
                listing_id = ?listing_id,
                processed = report.stats.processed,
                updated = report.stats.updated,
                skipped = report.stats.skipped,
                failed = report.stats.failed,
                halted_on_page = ?report.halted.as_ref().map(|halt| halt.page),
                "normalize keywords finished"
            ),
            Err(err) => error!(
                event = "normalize_keywords_failed",
                listing_id = ?listing_id,
                error = %format_error_chain(&err),
                "normalize keywords failed"
            ),
        }
    })
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(expose_metrics))
        .route("/scripts/normalize-keywords", post(normalize_keywords_all))
        .route(
            "/scripts/normalize-keywords/{listing_id}",
            post(normalize_keywords_single),
        )
        .with_state(state)
}

/// Registers metrics, then serves health, metrics and script triggers on `addr` until the
/// shutdown token fires.
pub async fn setup_server_with_addr(
    state: Arc<AppState>,
    addr: SocketAddr,
) -> Result<JoinHandle<()>, std::io::Error> {
    {
        let mut registry = state.registry.write().await;
        monitoring::register_all(&mut registry).await;
    }

    let shutdown_token = state.shutdown_token.clone();
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(
        event = "server_listening",
        addr = %listener.local_addr()?,
        "HTTP server listening"
    );
    let server_handle = tokio::spawn(async move {
        let served = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            shutdown_token.cancelled().await;
        })
        .await;
        if let Err(err) = served {
            error!(event = "server_failed", error = %err, "HTTP server failed");
        }
    });

    Ok(server_handle)
}
