//! trophy-rails-issuance
//!
//! HTTP rail service in front of an [`IssuanceCoordinator`]. The game backend
//! posts win-count updates here; peer rails post relay messages here; operators
//! use the audit, reconcile and allowlist-reload routes.

pub mod transport;

use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use trophy_issuance::{
    config, CrossChainAudit, IssuanceCoordinator, IssuanceError, IssuanceOutcome,
    ReconcileReport, SupplyAudit, RAIL_ID_TROPHY_ISSUANCE,
};
use trophy_relay::{ChainId, RejectReason, RelayDispatch, UserId, PROTOCOL_VERSION};

pub use transport::{parse_peer_endpoints, HttpMinter, HttpTransport};

// ═══════════════════════════════════════════════════════════════════════════════
// ENVIRONMENT VARIABLES
// ═══════════════════════════════════════════════════════════════════════════════

pub const PORT_ENV: &str = "PORT";
pub const LOG_FORMAT_ENV: &str = "TROPHY_LOG_FORMAT";
pub const DEFAULT_PORT: u16 = 3010;
pub const DEFAULT_LOG_FILTER: &str =
    "trophy_rails_issuance=info,trophy_issuance=info,trophy_relay=info";

// ═══════════════════════════════════════════════════════════════════════════════
// STATE
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<IssuanceCoordinator>,
    /// Configuration file re-read by the allowlist reload route
    pub config_path: Option<PathBuf>,
}

impl AppState {
    pub fn new(coordinator: Arc<IssuanceCoordinator>) -> Self {
        Self {
            coordinator,
            config_path: None,
        }
    }

    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ROUTER
// ═══════════════════════════════════════════════════════════════════════════════

pub fn app_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/rails/trophy/info", get(info))
        .route("/rails/trophy/wins", post(report_wins))
        .route("/rails/trophy/relay/receive", post(receive_message))
        .route("/rails/trophy/supply/:chain", get(supply_audit))
        .route("/rails/trophy/audit/peer/:chain", get(peer_audit))
        .route("/rails/trophy/supply/report/:chain", post(send_supply_report))
        .route("/rails/trophy/reconcile", post(reconcile))
        .route("/rails/trophy/admin/allowlist/reload", post(reload_allowlist))
        .layer(cors)
        .with_state(state)
}

// ═══════════════════════════════════════════════════════════════════════════════
// HANDLERS - STATUS
// ═══════════════════════════════════════════════════════════════════════════════

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "rail_id": RAIL_ID_TROPHY_ISSUANCE,
        "chain_id": state.coordinator.chain_id(),
    }))
}

async fn info(State(state): State<AppState>) -> impl IntoResponse {
    let coordinator = &state.coordinator;
    let allowlist = coordinator.allowlist().snapshot();
    Json(serde_json::json!({
        "rail_id": RAIL_ID_TROPHY_ISSUANCE,
        "protocol_version": PROTOCOL_VERSION,
        "chain_id": coordinator.chain_id(),
        "remote_chains": coordinator.remote_chains(),
        "milestones": coordinator.milestones().len(),
        "router_key": coordinator.router_identity(),
        "allowlist_generation": allowlist.generation(),
        "trusted_chains": allowlist.chains(),
        "persistent_ledger": coordinator.ledger().is_persistent(),
    }))
}

// ═══════════════════════════════════════════════════════════════════════════════
// HANDLERS - ISSUANCE
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize)]
pub struct WinReportRequest {
    pub user_id: String,
    pub previous_wins: u64,
    pub new_wins: u64,
}

#[derive(Debug, Serialize)]
pub struct WinReportResponse {
    pub user_id: UserId,
    pub chain_id: ChainId,
    pub outcomes: Vec<IssuanceOutcome>,
}

async fn report_wins(
    State(state): State<AppState>,
    Json(req): Json<WinReportRequest>,
) -> Result<Json<WinReportResponse>, ApiError> {
    if req.user_id.trim().is_empty() {
        return Err(ApiError {
            status: StatusCode::BAD_REQUEST,
            message: "user_id must not be empty".into(),
            code: "INVALID_USER".into(),
        });
    }

    let user_id = UserId::new(req.user_id);
    let outcomes = state
        .coordinator
        .evaluate_and_issue(&user_id, req.previous_wins, req.new_wins)
        .await
        .map_err(ApiError::from_issuance_error)?;

    Ok(Json(WinReportResponse {
        user_id,
        chain_id: state.coordinator.chain_id().clone(),
        outcomes,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ReceiveRequest {
    /// Hex-encoded relay message, with or without `0x`
    pub payload: String,
}

/// Accepted messages and duplicates answer 200 with the outcome; every other
/// rejection is an error response so the sending rail sees the failure.
async fn receive_message(
    State(state): State<AppState>,
    Json(req): Json<ReceiveRequest>,
) -> Result<Json<IssuanceOutcome>, ApiError> {
    let bytes = parse_hex(&req.payload)?;
    let outcome = state
        .coordinator
        .handle_inbound_message(&bytes)
        .await
        .map_err(ApiError::from_issuance_error)?;

    match outcome {
        IssuanceOutcome::Rejected { reason } if !is_benign(&reason) => {
            Err(ApiError::from_reject_reason(&reason))
        }
        outcome => Ok(Json(outcome)),
    }
}

fn is_benign(reason: &RejectReason) -> bool {
    matches!(reason, RejectReason::DuplicateMessage { .. })
}

// ═══════════════════════════════════════════════════════════════════════════════
// HANDLERS - AUDIT
// ═══════════════════════════════════════════════════════════════════════════════

async fn supply_audit(
    State(state): State<AppState>,
    Path(chain): Path<String>,
) -> Result<Json<SupplyAudit>, ApiError> {
    let audit = state
        .coordinator
        .audit_supply(&ChainId::new(chain))
        .map_err(ApiError::from_issuance_error)?;
    Ok(Json(audit))
}

async fn peer_audit(
    State(state): State<AppState>,
    Path(chain): Path<String>,
) -> Result<Json<CrossChainAudit>, ApiError> {
    let peer = ChainId::new(chain);
    state
        .coordinator
        .cross_chain_audit(&peer)
        .map(Json)
        .ok_or_else(|| ApiError {
            status: StatusCode::NOT_FOUND,
            message: format!("No supply report received from {peer}"),
            code: "NO_PEER_REPORT".into(),
        })
}

async fn send_supply_report(
    State(state): State<AppState>,
    Path(chain): Path<String>,
) -> Result<Json<RelayDispatch>, ApiError> {
    let dispatch = state
        .coordinator
        .send_supply_report(&ChainId::new(chain))
        .await
        .map_err(ApiError::from_issuance_error)?;
    Ok(Json(dispatch))
}

async fn reconcile(State(state): State<AppState>) -> Result<Json<ReconcileReport>, ApiError> {
    let report = state
        .coordinator
        .reconcile()
        .await
        .map_err(ApiError::from_issuance_error)?;
    Ok(Json(report))
}

// ═══════════════════════════════════════════════════════════════════════════════
// HANDLERS - ADMIN
// ═══════════════════════════════════════════════════════════════════════════════

async fn reload_allowlist(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let path = state.config_path.as_ref().ok_or_else(|| ApiError {
        status: StatusCode::CONFLICT,
        message: "No configuration file to reload from".into(),
        code: "RELOAD_UNAVAILABLE".into(),
    })?;

    let entries = config::allowlist_from_file(path).map_err(|e| ApiError {
        status: StatusCode::BAD_REQUEST,
        message: e.to_string(),
        code: "INVALID_ALLOWLIST".into(),
    })?;
    let generation = state
        .coordinator
        .reload_allowlist(&entries)
        .map_err(|e| ApiError {
            status: StatusCode::BAD_REQUEST,
            message: e.to_string(),
            code: "INVALID_ALLOWLIST".into(),
        })?;

    Ok(Json(serde_json::json!({
        "success": true,
        "generation": generation,
        "trusted_chains": state.coordinator.allowlist().snapshot().chains(),
    })))
}

// ═══════════════════════════════════════════════════════════════════════════════
// ERROR HANDLING
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    pub code: String,
}

impl ApiError {
    fn from_issuance_error(err: IssuanceError) -> Self {
        let (status, code) = match &err {
            IssuanceError::InvalidRange { .. } => (StatusCode::BAD_REQUEST, "INVALID_RANGE"),
            IssuanceError::InvalidUser(_) => (StatusCode::BAD_REQUEST, "INVALID_USER"),
            IssuanceError::Config(_) => (StatusCode::BAD_REQUEST, "CONFIG_ERROR"),
            IssuanceError::Relay(_) => (StatusCode::BAD_REQUEST, "RELAY_ERROR"),
            IssuanceError::Storage(_)
            | IssuanceError::RecordNotFound(_)
            | IssuanceError::InvalidTransition { .. } => {
                (StatusCode::INTERNAL_SERVER_ERROR, "STORAGE_ERROR")
            }
        };
        Self {
            status,
            message: err.to_string(),
            code: code.into(),
        }
    }

    fn from_reject_reason(reason: &RejectReason) -> Self {
        let status = if reason.is_trust_violation() {
            StatusCode::FORBIDDEN
        } else {
            StatusCode::BAD_REQUEST
        };
        Self {
            status,
            message: reason.to_string(),
            code: reason.code().into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({
            "error": self.message,
            "error_code": self.code,
        });
        (self.status, Json(body)).into_response()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// HELPERS
// ═══════════════════════════════════════════════════════════════════════════════

fn parse_hex(hex: &str) -> Result<Vec<u8>, ApiError> {
    let hex = hex.strip_prefix("0x").unwrap_or(hex);
    let bytes = hex::decode(hex).map_err(|e| ApiError {
        status: StatusCode::BAD_REQUEST,
        message: format!("Invalid hex: {}", e),
        code: "INVALID_HEX".into(),
    })?;
    if bytes.is_empty() {
        return Err(ApiError {
            status: StatusCode::BAD_REQUEST,
            message: "Empty payload".into(),
            code: "INVALID_PAYLOAD".into(),
        });
    }
    Ok(bytes)
}

// ═══════════════════════════════════════════════════════════════════════════════
// MAIN ENTRY
// ═══════════════════════════════════════════════════════════════════════════════

pub mod main_entry {
    use super::*;
    use std::net::SocketAddr;

    use tracing::info;
    use tracing_subscriber::EnvFilter;
    use trophy_issuance::CoordinatorConfig;

    fn init_tracing() {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
        let json = env::var(LOG_FORMAT_ENV)
            .map(|v| v.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        if json {
            tracing_subscriber::fmt().with_env_filter(filter).json().init();
        } else {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }

    pub async fn run_server() -> anyhow::Result<()> {
        dotenvy::dotenv().ok();
        init_tracing();

        let config_path = config::config_path();
        let config = CoordinatorConfig::from_env()?;
        let router_key = config::router_key_from_env()?;

        let transport = Arc::new(HttpTransport::from_env(config.relay_timeout())?);
        for remote in &config.remote_chains {
            if transport.endpoint(remote).is_none() {
                tracing::warn!(
                    %remote,
                    "No peer endpoint configured; relays stay owed until one is set and reconcile runs"
                );
            }
        }
        let minter = Arc::new(HttpMinter::from_env(config.mint_timeout())?);

        let coordinator =
            IssuanceCoordinator::from_config(&config, router_key, minter, transport)?;
        let state = AppState::new(Arc::new(coordinator)).with_config_path(config_path);

        let port: u16 = env::var(PORT_ENV)
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_PORT);

        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        info!(chain = %config.chain_id, "Trophy issuance rail listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app_router(state)).await?;

        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════
