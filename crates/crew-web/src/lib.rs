//! Axum HTTP surface for CREW: create jobs, trigger runs, poll status and
//! download the enriched output.
//!
//! Handlers stay thin. All orchestration lives in `crew-engine`; a triggered
//! run is spawned fire-and-forget under an [`ActiveRuns`] guard so a job can
//! never have two coordinators racing over its ledger.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path as AxumPath, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use tokio::net::TcpListener;
use tracing::{error, info};

use crew_core::JobId;
use crew_engine::{
    create_job, job_status, load_field_map, ActiveRuns, Coordinator, EngineConfig, EngineError,
    RowProcessor,
};
use crew_enrich::{HttpEnricher, RetryPolicy};
use crew_store::{decode_table, encode_table, JobStore, StoreError};

pub const CRATE_NAME: &str = "crew-web";

#[derive(Clone)]
pub struct AppState {
    pub store: JobStore,
    pub coordinator: Arc<Coordinator>,
    pub key_column: String,
    pub active_runs: ActiveRuns,
}

impl AppState {
    pub fn new(store: JobStore, coordinator: Arc<Coordinator>, key_column: impl Into<String>) -> Self {
        Self {
            store,
            coordinator,
            key_column: key_column.into(),
            active_runs: ActiveRuns::new(),
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/jobs", post(create_job_handler))
        .route("/jobs/{id}", get(job_status_handler))
        .route("/jobs/{id}/run", post(trigger_run_handler))
        .route("/jobs/{id}/download", get(download_handler))
        .route("/health", get(health_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("CREW_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);

    let config = EngineConfig::from_env();
    let store = JobStore::new(config.data_dir.clone());
    let enricher = Arc::new(HttpEnricher::new(config.enricher_config())?);
    let field_map = load_field_map(config.mapping_path.as_deref())?;
    let processor = Arc::new(RowProcessor::new(enricher, RetryPolicy::default(), field_map));
    let coordinator = Arc::new(Coordinator::new(
        store.clone(),
        processor,
        config.worker_cap,
        config.checkpoint_every,
    ));
    let state = AppState::new(store, coordinator, config.key_column);

    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "web server listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

/// Spawns a coordinator run for the job unless one is already active.
/// Returns whether a run was actually started.
fn spawn_run(state: &Arc<AppState>, id: JobId) -> bool {
    let Some(guard) = state.active_runs.try_begin(id) else {
        return false;
    };
    let coordinator = state.coordinator.clone();
    tokio::spawn(async move {
        let _guard = guard;
        match coordinator.run(&id).await {
            Ok(summary) => info!(
                job_id = %id,
                rows = summary.rows_processed,
                degraded = summary.degraded_rows,
                complete = summary.complete,
                "background run finished"
            ),
            Err(err) => error!(job_id = %id, error = %err, "background run failed"),
        }
    });
    true
}

async fn create_job_handler(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let input = match decode_table(&body) {
        Ok(table) => table,
        Err(err) => return bad_request(format!("invalid csv input: {err:#}")),
    };

    match create_job(&state.store, &input, &state.key_column).await {
        Ok(id) => {
            spawn_run(&state, id);
            match job_status(&state.store, &id).await {
                Ok(view) => (StatusCode::CREATED, Json(view)).into_response(),
                Err(err) => server_error(err),
            }
        }
        Err(EngineError::EmptyInput) => bad_request("input table has no rows".to_string()),
        Err(err) => server_error(err),
    }
}

async fn job_status_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Response {
    let Ok(id) = id.parse::<JobId>() else {
        return not_found("job not found".to_string());
    };
    match job_status(&state.store, &id).await {
        Ok(view) => Json(view).into_response(),
        Err(EngineError::Store(StoreError::NotFound(_))) => {
            not_found("job not found".to_string())
        }
        Err(err) => server_error(err),
    }
}

async fn trigger_run_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Response {
    let Ok(id) = id.parse::<JobId>() else {
        return not_found("job not found".to_string());
    };
    match state.store.job_exists(&id).await {
        Ok(true) => {
            let triggered = spawn_run(&state, id);
            (
                StatusCode::ACCEPTED,
                Json(serde_json::json!({ "triggered": triggered })),
            )
                .into_response()
        }
        Ok(false) => not_found("job not found".to_string()),
        Err(err) => server_error(err),
    }
}

async fn download_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Response {
    let Ok(id) = id.parse::<JobId>() else {
        return not_found("job not found".to_string());
    };
    match state.store.load_output(&id).await {
        Ok(output) => match encode_table(&output) {
            Ok(bytes) => (
                [
                    (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
                    (
                        header::CONTENT_DISPOSITION,
                        format!("attachment; filename=\"enriched-{id}.csv\""),
                    ),
                ],
                bytes,
            )
                .into_response(),
            Err(err) => server_error(err),
        },
        Err(StoreError::NotFound(_)) => {
            let detail = match state.store.job_exists(&id).await {
                Ok(true) => "output not ready",
                _ => "job not found",
            };
            not_found(detail.to_string())
        }
        Err(err) => server_error(err),
    }
}

async fn health_handler() -> Response {
    Json(serde_json::json!({ "status": "ok" })).into_response()
}

fn bad_request(detail: String) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({ "detail": detail })),
    )
        .into_response()
}

fn not_found(detail: String) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({ "detail": detail })),
    )
        .into_response()
}

fn server_error(err: impl std::fmt::Display) -> Response {
    error!(error = %err, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "detail": "internal server error" })),
    )
        .into_response()
}
