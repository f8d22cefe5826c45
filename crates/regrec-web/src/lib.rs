//! Axum JSON API over the local period tables: browsing, reviewer edits,
//! settings and on-demand passes.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use regrec_core::{Period, PeriodTable, ReportFamily};
use regrec_storage::{LocalStore, StoreError};
use regrec_sync::config::{setting_keys, validate_import_cut_date};
use regrec_sync::{EngineConfig, PassError, PassSummary, SyncPipeline};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "regrec-web";

#[derive(Clone)]
pub struct AppState {
    pub config: EngineConfig,
    pub store: LocalStore,
    /// Saved listing page used instead of the live portal.
    pub listing_file: Option<PathBuf>,
    pass_lock: Arc<Mutex<()>>,
}

impl AppState {
    pub fn new(config: EngineConfig, store: LocalStore) -> Self {
        Self {
            config,
            store,
            listing_file: None,
            pass_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn with_listing_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.listing_file = Some(path.into());
        self
    }

    fn family(&self, name: &str) -> Result<&ReportFamily, Response> {
        self.config
            .families
            .get(name)
            .ok_or_else(|| not_found(format!("unknown report family `{name}`")))
    }

    fn table(&self, family: &str, period: &str) -> Result<PeriodTable, Response> {
        let family = self.family(family)?;
        let period = Period::parse(period).map_err(bad_request)?;
        PeriodTable::new(&family.table_prefix, period).map_err(server_error)
    }
}

#[derive(Debug, Deserialize)]
pub struct ReviewerUpdate {
    #[serde(default)]
    pub reviewer_comment: String,
    #[serde(default)]
    pub reviewed_ok: bool,
}

#[derive(Debug, Deserialize)]
pub struct PassRequest {
    pub family: String,
    pub period: String,
}

#[derive(Debug, Serialize)]
pub struct PassResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<PassSummary>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/families", get(families_handler))
        .route("/api/periods/{family}", get(periods_handler))
        .route("/api/data/{family}/{period}", get(data_handler))
        .route(
            "/api/entry/{family}/{period}/{secondary_id}",
            get(entry_handler).put(entry_update_handler),
        )
        .route("/api/statistics/{family}/{period}", get(statistics_handler))
        .route("/api/update", post(pass_handler))
        .route("/api/settings", get(settings_handler).put(settings_update_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState) -> anyhow::Result<()> {
    let port = state.config.web_port;
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "dashboard api listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn families_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(&state.config.families.families).into_response()
}

async fn periods_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(family): AxumPath<String>,
) -> Response {
    let family = match state.family(&family) {
        Ok(family) => family,
        Err(resp) => return resp,
    };
    match state.store.list_period_tables(&family.table_prefix).await {
        Ok(tables) => Json(
            tables
                .iter()
                .map(|t| t.period().to_string())
                .collect::<Vec<_>>(),
        )
        .into_response(),
        Err(err) => store_error(err),
    }
}

async fn data_handler(
    State(state): State<Arc<AppState>>,
    AxumPath((family, period)): AxumPath<(String, String)>,
) -> Response {
    let table = match state.table(&family, &period) {
        Ok(table) => table,
        Err(resp) => return resp,
    };
    match state.store.fetch_rows(&table).await {
        Ok(rows) => Json(rows).into_response(),
        Err(err) => store_error(err),
    }
}

async fn entry_handler(
    State(state): State<Arc<AppState>>,
    AxumPath((family, period, secondary_id)): AxumPath<(String, String, String)>,
) -> Response {
    let table = match state.table(&family, &period) {
        Ok(table) => table,
        Err(resp) => return resp,
    };
    match state.store.fetch_row(&table, &secondary_id).await {
        Ok(Some(row)) => Json(row).into_response(),
        Ok(None) => not_found(format!("no entry {secondary_id} in {}", table.name())),
        Err(err) => store_error(err),
    }
}

async fn entry_update_handler(
    State(state): State<Arc<AppState>>,
    AxumPath((family, period, secondary_id)): AxumPath<(String, String, String)>,
    Json(update): Json<ReviewerUpdate>,
) -> Response {
    let table = match state.table(&family, &period) {
        Ok(table) => table,
        Err(resp) => return resp,
    };
    match state
        .store
        .update_reviewer_fields(&table, &secondary_id, &update.reviewer_comment, update.reviewed_ok)
        .await
    {
        Ok(true) => Json(serde_json::json!({ "success": true })).into_response(),
        Ok(false) => not_found(format!("no entry {secondary_id} in {}", table.name())),
        Err(err) => store_error(err),
    }
}

async fn statistics_handler(
    State(state): State<Arc<AppState>>,
    AxumPath((family, period)): AxumPath<(String, String)>,
) -> Response {
    let table = match state.table(&family, &period) {
        Ok(table) => table,
        Err(resp) => return resp,
    };
    match state.store.statistics(&table).await {
        Ok(stats) => Json(stats).into_response(),
        Err(err) => store_error(err),
    }
}

async fn pass_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<PassRequest>,
) -> Response {
    let period = match Period::parse(&request.period) {
        Ok(period) => period,
        Err(err) => return pass_failure(StatusCode::BAD_REQUEST, err.to_string(), None),
    };

    let _guard = state.pass_lock.lock().await;
    match run_pass(&state, &request.family, &period).await {
        Ok(summary) => Json(PassResponse {
            success: true,
            error: None,
            kind: None,
            summary: Some(summary),
        })
        .into_response(),
        Err(err) => {
            warn!(family = request.family.as_str(), %period, error = %err, "pass failed");
            let status = match err {
                PassError::Config(_) => StatusCode::BAD_REQUEST,
                PassError::NoEntries { .. } => StatusCode::UNPROCESSABLE_ENTITY,
                PassError::SourceUnavailable(_) | PassError::WarehouseUnavailable(_) => {
                    StatusCode::BAD_GATEWAY
                }
                PassError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            };
            pass_failure(status, err.to_string(), Some(err.kind()))
        }
    }
}

/// Settings are re-read for every pass so dashboard edits apply immediately.
async fn run_pass(state: &AppState, family: &str, period: &Period) -> Result<PassSummary, PassError> {
    let settings = state.store.settings().await?;
    let config = state.config.clone().with_settings(&settings)?;
    let pipeline =
        SyncPipeline::from_config(config, state.store.clone(), state.listing_file.clone()).await?;
    pipeline.run_pass(family, period).await
}

async fn settings_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.settings().await {
        Ok(settings) => Json(settings).into_response(),
        Err(err) => store_error(err),
    }
}

async fn settings_update_handler(
    State(state): State<Arc<AppState>>,
    Json(values): Json<BTreeMap<String, String>>,
) -> Response {
    if let Some(cut) = values.get(setting_keys::IMPORT_CUT_DATE) {
        if let Err(err) = validate_import_cut_date(cut.trim()) {
            return bad_request(err);
        }
    }
    match state.store.update_settings(&values).await {
        Ok(updated) => {
            Json(serde_json::json!({ "success": true, "updated": updated })).into_response()
        }
        Err(err) => store_error(err),
    }
}

fn pass_failure(status: StatusCode, error: String, kind: Option<&'static str>) -> Response {
    (
        status,
        Json(PassResponse {
            success: false,
            error: Some(error),
            kind,
            summary: None,
        }),
    )
        .into_response()
}

fn error_body(status: StatusCode, message: impl Display) -> Response {
    (status, Json(serde_json::json!({ "error": message.to_string() }))).into_response()
}

fn not_found(message: impl Display) -> Response {
    error_body(StatusCode::NOT_FOUND, message)
}

fn bad_request(message: impl Display) -> Response {
    error_body(StatusCode::BAD_REQUEST, message)
}

fn server_error(message: impl Display) -> Response {
    error_body(StatusCode::INTERNAL_SERVER_ERROR, message)
}

fn store_error(err: StoreError) -> Response {
    match err {
        StoreError::MissingTable(_) => not_found(err),
        other => server_error(other),
    }
}
