use anyhow::Result;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::dispatch::{Coordinator, DispatchOptions, DispatchOutcome, Intent};
use crate::profile::ServerProfile;
use crate::upgrade::UpgradeFlags;

/// Options accepted by every operation endpoint. All fields default so a
/// bare POST (or none at all) is a plain unconfirmed request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OperationRequest {
    #[serde(default)]
    pub confirmed: bool,
    #[serde(default)]
    pub override_validation: bool,
    #[serde(default)]
    pub update_server: Option<bool>,
    #[serde(default)]
    pub update_mods: Option<bool>,
    #[serde(default)]
    pub force: Option<bool>,
}

impl OperationRequest {
    fn into_options(self) -> DispatchOptions {
        let defaults = UpgradeFlags::default();
        DispatchOptions {
            confirmed: self.confirmed,
            override_validation: self.override_validation,
            upgrade_flags: UpgradeFlags {
                update_server: self.update_server.unwrap_or(defaults.update_server),
                update_mods: self.update_mods.unwrap_or(defaults.update_mods),
                force: self.force.unwrap_or(defaults.force),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OutcomeResponse {
    pub result: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recoverable: Option<bool>,
}

/// Map a dispatch outcome onto HTTP. Confirmation gates and rejections are
/// both 409: the request was understood but the current state refuses it.
fn respond(outcome: DispatchOutcome) -> axum::response::Response {
    let (code, body) = match outcome {
        DispatchOutcome::Completed { message } => (
            StatusCode::OK,
            OutcomeResponse { result: "completed", message, recoverable: None },
        ),
        DispatchOutcome::ConfirmRequired { reason } => (
            StatusCode::CONFLICT,
            OutcomeResponse { result: "confirm_required", message: reason, recoverable: None },
        ),
        DispatchOutcome::Rejected { reason } => (
            StatusCode::CONFLICT,
            OutcomeResponse { result: "rejected", message: reason, recoverable: None },
        ),
        DispatchOutcome::Cancelled => (
            StatusCode::OK,
            OutcomeResponse {
                result: "cancelled",
                message: "operation cancelled".to_string(),
                recoverable: None,
            },
        ),
        DispatchOutcome::Failed { message, recoverable } => (
            StatusCode::INTERNAL_SERVER_ERROR,
            OutcomeResponse { result: "failed", message, recoverable: Some(recoverable) },
        ),
    };
    (code, Json(body)).into_response()
}

/// IPC Server State
#[derive(Clone)]
pub struct IpcServer {
    pub coordinator: Arc<Coordinator>,
    pub listen_addr: String,
}

impl IpcServer {
    pub fn new(coordinator: Arc<Coordinator>, listen_addr: &str) -> Self {
        Self {
            coordinator,
            listen_addr: listen_addr.to_string(),
        }
    }

    pub fn router(coordinator: Arc<Coordinator>) -> Router {
        Router::new()
            .route("/api/servers", get(list_servers))
            .route("/api/server/:key/status", get(get_server_status))
            .route("/api/server/:key/start", post(start_handler))
            .route("/api/server/:key/stop", post(stop_handler))
            .route("/api/server/:key/upgrade", post(upgrade_handler))
            .route("/api/server/:key/upgrade/cancel", post(cancel_upgrade_handler))
            .route("/api/server/:key/backup", post(backup_handler))
            .route("/api/server/:key/reset", post(reset_handler))
            .route("/api/profiles", get(list_profiles).post(create_profile))
            .route(
                "/api/profile/:id",
                axum::routing::put(update_profile).delete(delete_profile),
            )
            .layer(TraceLayer::new_for_http())
            .with_state(coordinator)
    }

    pub async fn start(self) -> Result<()> {
        tracing::info!("IPC HTTP server starting on {}", self.listen_addr);

        let router = Self::router(self.coordinator.clone());
        let listener = tokio::net::TcpListener::bind(&self.listen_addr).await?;
        tracing::info!("IPC listening on http://{}", self.listen_addr);

        axum::serve(listener, router).await?;
        Ok(())
    }
}

/// GET /api/servers - all managed servers with live status
async fn list_servers(State(coordinator): State<Arc<Coordinator>>) -> impl IntoResponse {
    let servers = coordinator.overview().await;
    Json(json!({ "servers": servers }))
}

/// GET /api/server/:key/status
async fn get_server_status(
    Path(key): Path<String>,
    State(coordinator): State<Arc<Coordinator>>,
) -> impl IntoResponse {
    match coordinator.resolve_snapshot(&key) {
        Some(snapshot) => {
            let status = coordinator.status.get(&snapshot.identity.server_id);
            (
                StatusCode::OK,
                Json(json!({
                    "id": snapshot.identity.server_id,
                    "name": snapshot.identity.display_name,
                    "status": status,
                })),
            )
                .into_response()
        }
        None => {
            let error = json!({ "error": format!("Server '{}' not found", key) });
            (StatusCode::NOT_FOUND, Json(error)).into_response()
        }
    }
}

async fn dispatch_handler(
    coordinator: Arc<Coordinator>,
    key: String,
    intent: Intent,
    body: Option<Json<OperationRequest>>,
) -> axum::response::Response {
    let opts = body.map(|Json(b)| b).unwrap_or_default().into_options();
    respond(coordinator.dispatch(&key, intent, opts).await)
}

/// POST /api/server/:key/start
async fn start_handler(
    Path(key): Path<String>,
    State(coordinator): State<Arc<Coordinator>>,
    body: Option<Json<OperationRequest>>,
) -> impl IntoResponse {
    dispatch_handler(coordinator, key, Intent::Start, body).await
}

/// POST /api/server/:key/stop
async fn stop_handler(
    Path(key): Path<String>,
    State(coordinator): State<Arc<Coordinator>>,
    body: Option<Json<OperationRequest>>,
) -> impl IntoResponse {
    dispatch_handler(coordinator, key, Intent::Stop, body).await
}

/// POST /api/server/:key/upgrade
async fn upgrade_handler(
    Path(key): Path<String>,
    State(coordinator): State<Arc<Coordinator>>,
    body: Option<Json<OperationRequest>>,
) -> impl IntoResponse {
    dispatch_handler(coordinator, key, Intent::Upgrade, body).await
}

/// POST /api/server/:key/upgrade/cancel
async fn cancel_upgrade_handler(
    Path(_key): Path<String>,
    State(coordinator): State<Arc<Coordinator>>,
) -> impl IntoResponse {
    if coordinator.cancel_upgrade() {
        (
            StatusCode::OK,
            Json(json!({ "success": true, "message": "cancellation requested" })),
        )
            .into_response()
    } else {
        let error = json!({ "error": "no upgrade in progress" });
        (StatusCode::CONFLICT, Json(error)).into_response()
    }
}

/// POST /api/server/:key/backup
async fn backup_handler(
    Path(key): Path<String>,
    State(coordinator): State<Arc<Coordinator>>,
) -> impl IntoResponse {
    respond(
        coordinator
            .dispatch(&key, Intent::Backup, DispatchOptions::default())
            .await,
    )
}

/// POST /api/server/:key/reset
async fn reset_handler(
    Path(key): Path<String>,
    State(coordinator): State<Arc<Coordinator>>,
    body: Option<Json<OperationRequest>>,
) -> impl IntoResponse {
    dispatch_handler(coordinator, key, Intent::Reset, body).await
}

/// GET /api/profiles
async fn list_profiles(State(coordinator): State<Arc<Coordinator>>) -> impl IntoResponse {
    Json(json!({ "profiles": coordinator.list_profiles() }))
}

/// POST /api/profiles
async fn create_profile(
    State(coordinator): State<Arc<Coordinator>>,
    Json(profile): Json<ServerProfile>,
) -> impl IntoResponse {
    match coordinator.add_profile(profile) {
        Ok(id) => (StatusCode::CREATED, Json(json!({ "success": true, "id": id }))).into_response(),
        Err(e) => {
            let error = json!({ "error": format!("Failed to create profile: {}", e) });
            (StatusCode::INTERNAL_SERVER_ERROR, Json(error)).into_response()
        }
    }
}

/// PUT /api/profile/:id
async fn update_profile(
    Path(id): Path<String>,
    State(coordinator): State<Arc<Coordinator>>,
    Json(profile): Json<ServerProfile>,
) -> impl IntoResponse {
    match coordinator.update_profile(&id, profile) {
        Ok(()) => (StatusCode::OK, Json(json!({ "success": true }))).into_response(),
        Err(e) => {
            let error = json!({ "error": format!("Failed to update profile: {}", e) });
            (StatusCode::INTERNAL_SERVER_ERROR, Json(error)).into_response()
        }
    }
}

/// DELETE /api/profile/:id
async fn delete_profile(
    Path(id): Path<String>,
    State(coordinator): State<Arc<Coordinator>>,
) -> impl IntoResponse {
    match coordinator.remove_profile(&id) {
        Ok(()) => (StatusCode::OK, Json(json!({ "success": true }))).into_response(),
        Err(e) => {
            let error = json!({ "error": format!("Failed to delete profile: {}", e) });
            (StatusCode::INTERNAL_SERVER_ERROR, Json(error)).into_response()
        }
    }
}
