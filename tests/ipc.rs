//! HTTP surface tests: drive the router directly with tower's `oneshot`
//! instead of binding a socket.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;

use warden_core::config::GlobalConfig;
use warden_core::dispatch::Coordinator;
use warden_core::ipc::IpcServer;
use warden_core::preflight::NullHostServices;
use warden_core::profile::{ProfileSnapshot, ServerProfile};
use warden_core::upgrade::UpdateProvider;

struct OkProvider;

impl UpdateProvider for OkProvider {
    fn update_server(
        &self,
        _snapshot: &ProfileSnapshot,
        _force: bool,
        _progress: &dyn Fn(u8, &str),
    ) -> anyhow::Result<()> {
        Ok(())
    }

    fn update_mods(
        &self,
        _snapshot: &ProfileSnapshot,
        _force: bool,
        _progress: &dyn Fn(u8, &str),
    ) -> anyhow::Result<()> {
        Ok(())
    }

    fn validate_install(&self, _snapshot: &ProfileSnapshot) -> anyhow::Result<()> {
        Ok(())
    }
}

fn test_coordinator(dir: &TempDir) -> Arc<Coordinator> {
    let lock_dir = dir.path().join("locks");
    std::fs::create_dir_all(&lock_dir).unwrap();
    let config = GlobalConfig {
        profiles_path: dir
            .path()
            .join("profiles.json")
            .to_string_lossy()
            .to_string(),
        lock_dir: Some(lock_dir),
        backups_dir: dir.path().join("backups"),
        ..GlobalConfig::default()
    };
    let coordinator = Arc::new(Coordinator::new(
        config,
        Arc::new(NullHostServices),
        Arc::new(OkProvider),
    ));
    coordinator.initialize().unwrap();
    coordinator
}

fn seed_server(dir: &TempDir, coordinator: &Coordinator, name: &str) -> String {
    let install = dir.path().join(name);
    std::fs::create_dir_all(&install).unwrap();
    let mut profile = ServerProfile::new(name, &install);
    profile.installed = true;
    coordinator.add_profile(profile).unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_list_servers() {
    let dir = TempDir::new().unwrap();
    let coordinator = test_coordinator(&dir);
    seed_server(&dir, &coordinator, "alpha");
    let router = IpcServer::router(coordinator);

    let response = router
        .oneshot(
            Request::builder()
                .uri("/api/servers")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    let servers = json["servers"].as_array().unwrap();
    assert_eq!(servers.len(), 1);
    assert_eq!(servers[0]["name"], "alpha");
    assert_eq!(servers[0]["status"], "stopped");
}

#[tokio::test]
async fn test_status_endpoint_resolves_by_name() {
    let dir = TempDir::new().unwrap();
    let coordinator = test_coordinator(&dir);
    let id = seed_server(&dir, &coordinator, "alpha");
    let router = IpcServer::router(coordinator);

    let response = router
        .oneshot(
            Request::builder()
                .uri("/api/server/alpha/status")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["id"], id.as_str());
    assert_eq!(json["status"], "stopped");
}

#[tokio::test]
async fn test_status_endpoint_unknown_server() {
    let dir = TempDir::new().unwrap();
    let coordinator = test_coordinator(&dir);
    let router = IpcServer::router(coordinator);

    let response = router
        .oneshot(
            Request::builder()
                .uri("/api/server/ghost/status")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_stop_stopped_server_is_ok() {
    let dir = TempDir::new().unwrap();
    let coordinator = test_coordinator(&dir);
    seed_server(&dir, &coordinator, "alpha");
    let router = IpcServer::router(coordinator);

    let response = router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/server/alpha/stop")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["result"], "completed");
}

#[tokio::test]
async fn test_upgrade_endpoint_completes() {
    let dir = TempDir::new().unwrap();
    let coordinator = test_coordinator(&dir);
    seed_server(&dir, &coordinator, "alpha");
    let router = IpcServer::router(coordinator);

    let response = router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/server/alpha/upgrade")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"update_mods": false}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["result"], "completed");
}

#[tokio::test]
async fn test_start_without_executable_maps_to_conflict() {
    let dir = TempDir::new().unwrap();
    let coordinator = test_coordinator(&dir);
    seed_server(&dir, &coordinator, "alpha");
    let router = IpcServer::router(coordinator);

    // Strict validation fails (no executable); unconfirmed request gets the
    // confirmation gate, mapped to 409.
    let response = router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/server/alpha/start")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let json = body_json(response).await;
    assert_eq!(json["result"], "confirm_required");
}

#[tokio::test]
async fn test_cancel_without_upgrade_is_conflict() {
    let dir = TempDir::new().unwrap();
    let coordinator = test_coordinator(&dir);
    seed_server(&dir, &coordinator, "alpha");
    let router = IpcServer::router(coordinator);

    let response = router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/server/alpha/upgrade/cancel")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_profile_crud() {
    let dir = TempDir::new().unwrap();
    let coordinator = test_coordinator(&dir);
    let router = IpcServer::router(coordinator.clone());

    let install = dir.path().join("beta");
    std::fs::create_dir_all(&install).unwrap();
    let profile = ServerProfile::new("beta", &install);
    let body = serde_json::to_string(&profile).unwrap();

    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/profiles")
                .header("content-type", "application/json")
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let json = body_json(response).await;
    let id = json["id"].as_str().unwrap().to_string();

    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/profiles")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let json = body_json(response).await;
    assert_eq!(json["profiles"].as_array().unwrap().len(), 1);

    let response = router
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/api/profile/{}", id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(coordinator.list_profiles().is_empty());
}
