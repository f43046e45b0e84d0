mod common;

use axum::http::header::AUTHORIZATION;
use axum::http::StatusCode;
use axum_test::TestServer;
use relay_api::auth::tokens::Role;
use relay_api::gateway::session::Identity;

// ===========================================================================
// GET /health
// ===========================================================================

#[tokio::test]
async fn health_returns_ok() {
    let (app, _state) = common::test_app();
    let server = TestServer::new(app).unwrap();

    let resp = server.get("/health").await;
    resp.assert_status_ok();
    let body: serde_json::Value = resp.json();
    assert_eq!(body["status"], "ok");
}

// ===========================================================================
// POST /api/v1/events
// ===========================================================================

#[tokio::test]
async fn publish_requires_token() {
    let (app, _state) = common::test_app();
    let server = TestServer::new(app).unwrap();

    let resp = server
        .post("/api/v1/events")
        .json(&serde_json::json!({ "kind": "block", "topic": "blocks" }))
        .await;
    resp.assert_status(StatusCode::UNAUTHORIZED);
    let body: serde_json::Value = resp.json();
    assert_eq!(body["error"]["code"], "UNAUTHORIZED");
}

#[tokio::test]
async fn publish_rejects_bad_token() {
    let (app, _state) = common::test_app();
    let server = TestServer::new(app).unwrap();

    let resp = server
        .post("/api/v1/events")
        .add_header(AUTHORIZATION, "Bearer not-a-jwt")
        .json(&serde_json::json!({ "kind": "block", "topic": "blocks" }))
        .await;
    resp.assert_status(StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn publish_forbidden_for_viewer() {
    let (app, state) = common::test_app();
    let server = TestServer::new(app).unwrap();
    let token = common::mint_token(&state, "viewer@example.com", Role::Viewer);

    let resp = server
        .post("/api/v1/events")
        .add_header(AUTHORIZATION, format!("Bearer {token}"))
        .json(&serde_json::json!({ "kind": "block", "topic": "blocks" }))
        .await;
    resp.assert_status(StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn publish_validates_fields() {
    let (app, state) = common::test_app();
    let server = TestServer::new(app).unwrap();
    let token = common::mint_token(&state, "ops@example.com", Role::Operator);

    let resp = server
        .post("/api/v1/events")
        .add_header(AUTHORIZATION, format!("Bearer {token}"))
        .json(&serde_json::json!({ "kind": " ", "topic": "all" }))
        .await;
    resp.assert_status(StatusCode::BAD_REQUEST);
    let body: serde_json::Value = resp.json();
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
    let fields: Vec<&str> = body["error"]["details"]
        .as_array()
        .unwrap()
        .iter()
        .map(|d| d["field"].as_str().unwrap())
        .collect();
    assert_eq!(fields, vec!["kind", "topic"]);
}

#[tokio::test]
async fn publish_reaches_subscribed_session() {
    let (app, state) = common::test_app();
    let server = TestServer::new(app).unwrap();
    let token = common::mint_token(&state, "ops@example.com", Role::Operator);

    let (session, mut queue) = state.hub.new_session(Identity {
        subject: "watcher".to_string(),
        role: Role::Viewer,
    });
    session.subscribe(vec!["params".to_string()]);
    state.hub.register(session.clone()).await.unwrap();

    let resp = server
        .post("/api/v1/events")
        .add_header(AUTHORIZATION, format!("Bearer {token}"))
        .json(&serde_json::json!({
            "kind": "params_updated",
            "topic": "params",
            "payload": { "max_leverage": 20 }
        }))
        .await;
    resp.assert_status(StatusCode::ACCEPTED);
    let body: serde_json::Value = resp.json();
    assert_eq!(body["queued"], true);

    let item = tokio::time::timeout(std::time::Duration::from_secs(2), queue.recv())
        .await
        .unwrap()
        .unwrap();
    let relay_api::gateway::envelope::Outbound::Event(envelope) = item else {
        panic!("expected an event");
    };
    assert_eq!(envelope.kind(), "params_updated");
    assert_eq!(envelope.payload()["max_leverage"], 20);
}

#[tokio::test]
async fn publish_after_shutdown_is_unavailable() {
    let (app, state) = common::test_app();
    let server = TestServer::new(app).unwrap();
    let token = common::mint_token(&state, "admin@example.com", Role::Admin);

    state.hub.shutdown().await.unwrap();
    common::wait_until(|| state.hub.is_closed()).await;

    let resp = server
        .post("/api/v1/events")
        .add_header(AUTHORIZATION, format!("Bearer {token}"))
        .json(&serde_json::json!({ "kind": "block", "topic": "blocks" }))
        .await;
    resp.assert_status(StatusCode::SERVICE_UNAVAILABLE);
}

// ===========================================================================
// GET /api/v1/stats
// ===========================================================================

#[tokio::test]
async fn stats_report_connected_clients() {
    let (app, state) = common::test_app();
    let server = TestServer::new(app).unwrap();
    let token = common::mint_token(&state, "viewer@example.com", Role::Viewer);

    let (session, _queue) = state.hub.new_session(Identity {
        subject: "watcher".to_string(),
        role: Role::Viewer,
    });
    state.hub.register(session).await.unwrap();

    let resp = server
        .get("/api/v1/stats")
        .add_header(AUTHORIZATION, format!("Bearer {token}"))
        .await;
    resp.assert_status_ok();
    let body: serde_json::Value = resp.json();
    assert_eq!(body["connected_clients"], 1);
    assert_eq!(body["pending_broadcast_depth"], 0);
    assert_eq!(body["dropped_total"], 0);
}

#[tokio::test]
async fn stats_require_token() {
    let (app, _state) = common::test_app();
    let server = TestServer::new(app).unwrap();

    server
        .get("/api/v1/stats")
        .await
        .assert_status(StatusCode::UNAUTHORIZED);
}

// ===========================================================================
// /api/v1/sessions
// ===========================================================================

#[tokio::test]
async fn list_sessions_requires_admin() {
    let (app, state) = common::test_app();
    let server = TestServer::new(app).unwrap();
    let token = common::mint_token(&state, "ops@example.com", Role::Operator);

    server
        .get("/api/v1/sessions")
        .add_header(AUTHORIZATION, format!("Bearer {token}"))
        .await
        .assert_status(StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn list_and_disconnect_session() {
    let (app, state) = common::test_app();
    let server = TestServer::new(app).unwrap();
    let token = common::mint_token(&state, "root@example.com", Role::SuperAdmin);

    let (session, _queue) = state.hub.new_session(Identity {
        subject: "watcher".to_string(),
        role: Role::Viewer,
    });
    state.hub.register(session.clone()).await.unwrap();

    let resp = server
        .get("/api/v1/sessions")
        .add_header(AUTHORIZATION, format!("Bearer {token}"))
        .await;
    resp.assert_status_ok();
    let sessions: Vec<serde_json::Value> = resp.json();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0]["session_id"], session.id());
    assert_eq!(sessions[0]["subject"], "watcher");
    assert_eq!(sessions[0]["role"], "viewer");
    assert_eq!(sessions[0]["subscriptions"], serde_json::json!(["all"]));

    server
        .delete(&format!("/api/v1/sessions/{}", session.id()))
        .add_header(AUTHORIZATION, format!("Bearer {token}"))
        .await
        .assert_status(StatusCode::NO_CONTENT);
    assert!(session.is_closed());
    assert_eq!(state.hub.stats().connected_clients, 0);
}

#[tokio::test]
async fn disconnect_unknown_session_is_404() {
    let (app, state) = common::test_app();
    let server = TestServer::new(app).unwrap();
    let token = common::mint_token(&state, "admin@example.com", Role::Admin);

    let resp = server
        .delete("/api/v1/sessions/ses_missing")
        .add_header(AUTHORIZATION, format!("Bearer {token}"))
        .await;
    resp.assert_status(StatusCode::NOT_FOUND);
    let body: serde_json::Value = resp.json();
    assert_eq!(body["error"]["code"], "NOT_FOUND");
}
