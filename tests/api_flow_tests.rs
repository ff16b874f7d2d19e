// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! End-to-end MFA, app connection and device flows over HTTP.

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
};
use serde_json::{json, Value};
use totp_rs::{Algorithm, Secret, TOTP};

mod common;
use common::{
    access_token, bearer_request, body_json, create_test_app, json_request,
    register_and_login, send, TestApp, TEST_PASSWORD,
};

fn authed_json(method: &str, uri: &str, token: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {}", token))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn totp_code(secret: &str) -> String {
    TOTP::new(
        Algorithm::SHA1,
        6,
        1,
        30,
        Secret::Encoded(secret.to_string()).to_bytes().unwrap(),
        None,
        "test".to_string(),
    )
    .unwrap()
    .generate_current()
    .unwrap()
}

async fn body_text(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

async fn login(app: &TestApp, extra: Value) -> axum::response::Response {
    let mut body = json!({ "login": "alice@example.com", "password": TEST_PASSWORD });
    if let (Some(body), Some(extra)) = (body.as_object_mut(), extra.as_object()) {
        body.extend(extra.clone());
    }
    send(app, json_request("POST", "/auth/login", body)).await
}

#[tokio::test]
async fn test_mfa_enrollment_and_login() {
    let app = create_test_app();
    let first = register_and_login(&app, "alice@example.com", "alice").await;
    let token = access_token(&first);

    let response = send(&app, bearer_request("POST", "/api/mfa/setup", &token)).await;
    assert_eq!(response.status(), StatusCode::OK);
    let enrollment = body_json(response).await;
    let secret = enrollment["secret"].as_str().unwrap().to_string();
    let backup_code = enrollment["backup_codes"][0].as_str().unwrap().to_string();

    // Setup alone does not turn MFA on.
    let status = body_json(send(&app, bearer_request("GET", "/api/mfa", &token)).await).await;
    assert_eq!(status["configured"], true);
    assert_eq!(status["enabled"], false);

    let response = send(
        &app,
        authed_json("POST", "/api/mfa/enable", &token, json!({ "code": "000000" })),
    )
    .await;
    // A guessed code could be valid by chance; skip the check in that case.
    if totp_code(&secret) != "000000" {
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    let response = send(
        &app,
        authed_json("POST", "/api/mfa/enable", &token, json!({ "code": totp_code(&secret) })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let status = body_json(response).await;
    assert_eq!(status["enabled"], true);
    assert_eq!(status["remaining_codes"], 10);

    // Re-enrolling while enabled is refused.
    let response = send(&app, bearer_request("POST", "/api/mfa/setup", &token)).await;
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let response = login(&app, json!({})).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(response).await["error"], "mfa_required");

    let response = login(&app, json!({ "backup_code": "ZZZZ-ZZZZ" })).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(response).await["error"], "unauthorized");

    let response = login(&app, json!({ "backup_code": backup_code })).await;
    assert_eq!(response.status(), StatusCode::OK);

    // Each backup code works once.
    let response = login(&app, json!({ "backup_code": backup_code })).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = login(&app, json!({ "mfa_code": totp_code(&secret) })).await;
    assert_eq!(response.status(), StatusCode::OK);

    let remaining = body_json(
        send(&app, bearer_request("GET", "/api/mfa/backup-codes", &token)).await,
    )
    .await;
    assert_eq!(remaining["remaining"], 9);

    let events = body_json(
        send(&app, bearer_request("GET", "/api/security/events", &token)).await,
    )
    .await;
    let kinds: Vec<&str> = events
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|e| e["event_type"].as_str())
        .collect();
    assert!(kinds.contains(&"mfa_enabled"));
    assert!(kinds.contains(&"backup_code_used"));
    assert!(kinds.contains(&"failed_mfa"));
}

#[tokio::test]
async fn test_mfa_code_format_is_validated() {
    let app = create_test_app();
    let login = register_and_login(&app, "alice@example.com", "alice").await;
    let token = access_token(&login);
    send(&app, bearer_request("POST", "/api/mfa/setup", &token)).await;

    let response = send(
        &app,
        authed_json("POST", "/api/mfa/enable", &token, json!({ "code": "12" })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_connect_app_and_manage_connection() {
    let app = create_test_app();
    let login = register_and_login(&app, "alice@example.com", "alice").await;
    let token = access_token(&login);

    let apps = body_json(send(&app, bearer_request("GET", "/api/apps", &token)).await).await;
    assert_eq!(apps["apps"], json!(["github", "google"]));

    let response = send(&app, bearer_request("POST", "/api/apps/github/connect", &token)).await;
    assert_eq!(response.status(), StatusCode::OK);
    let start = body_json(response).await;
    let state = start["state"].as_str().unwrap().to_string();
    assert!(start["auth_url"].as_str().unwrap().contains("client_id=test_github_client"));

    let response = send(
        &app,
        authed_json(
            "POST",
            "/api/apps/github/complete",
            &token,
            json!({ "code": "code1", "state": state }),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let conn = body_json(response).await;
    assert_eq!(conn["status"], "connected");
    assert_eq!(conn["account_email"], "owner@example.com");
    assert!(conn.get("access_token").is_none());
    let id = conn["id"].as_str().unwrap().to_string();

    // The state was consumed.
    let response = send(
        &app,
        authed_json(
            "POST",
            "/api/apps/github/complete",
            &token,
            json!({ "code": "code1", "state": state }),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let response = send(
        &app,
        bearer_request("POST", &format!("/api/connections/{}/health", id), &token),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let health = body_json(response).await;
    assert_eq!(health["success"], true);
    assert_eq!(health["health_status"], "healthy");

    let metrics = body_json(
        send(
            &app,
            bearer_request("GET", &format!("/api/connections/{}/metrics", id), &token),
        )
        .await,
    )
    .await;
    assert!(!metrics.as_array().unwrap().is_empty());

    let response = send(
        &app,
        authed_json(
            "POST",
            &format!("/api/connections/{}/usage", id),
            &token,
            json!({ "bytes_transferred": 512 }),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let list = body_json(send(&app, bearer_request("GET", "/api/connections", &token)).await).await;
    assert_eq!(list.as_array().unwrap().len(), 1);

    let response = send(
        &app,
        bearer_request("DELETE", &format!("/api/connections/{}", id), &token),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "revoked");
}

#[tokio::test]
async fn test_connections_are_private() {
    let app = create_test_app();
    let alice = access_token(&register_and_login(&app, "alice@example.com", "alice").await);
    let bob = access_token(&register_and_login(&app, "bob@example.com", "bob").await);

    let start = body_json(
        send(&app, bearer_request("POST", "/api/apps/github/connect", &alice)).await,
    )
    .await;
    let conn = body_json(
        send(
            &app,
            authed_json(
                "POST",
                "/api/apps/github/complete",
                &alice,
                json!({ "code": "code1", "state": start["state"] }),
            ),
        )
        .await,
    )
    .await;
    let id = conn["id"].as_str().unwrap();

    let response = send(
        &app,
        bearer_request("DELETE", &format!("/api/connections/{}", id), &bob),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = send(
        &app,
        bearer_request("POST", &format!("/api/connections/{}/health", id), &bob),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_unknown_app_is_not_found() {
    let app = create_test_app();
    let token = access_token(&register_and_login(&app, "alice@example.com", "alice").await);
    let response = send(&app, bearer_request("POST", "/api/apps/myspace/connect", &token)).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_oauth_callback_page() {
    let app = create_test_app();
    let token = access_token(&register_and_login(&app, "alice@example.com", "alice").await);
    let start = body_json(
        send(&app, bearer_request("POST", "/api/apps/google/connect", &token)).await,
    )
    .await;
    let state = start["state"].as_str().unwrap();

    let response = send(
        &app,
        Request::builder()
            .uri(format!(
                "/oauth/callback?code=code9&state={}",
                urlencoding::encode(state)
            ))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    let csp = response
        .headers()
        .get(header::CONTENT_SECURITY_POLICY)
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(csp.contains("'nonce-"));
    assert!(!csp.contains("unsafe-inline"));

    let html = body_text(response).await;
    assert!(html.contains("\"success\":true"));
    assert!(html.contains("\"app_id\":\"google\""));
    assert!(html.contains("\"email\":\"owner@example.com\""));
    assert!(html.contains("postMessage(message, \"http://localhost:5173\")"));

    let list = body_json(send(&app, bearer_request("GET", "/api/connections", &token)).await).await;
    assert_eq!(list[0]["app_id"], "google");
}

#[tokio::test]
async fn test_oauth_callback_failures() {
    let app = create_test_app();

    let response = send(
        &app,
        Request::builder()
            .uri("/oauth/callback?code=code9&state=forged.deadbeef")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let html = body_text(response).await;
    assert!(html.contains("\"success\":false"));
    assert!(html.contains("\"error\":\"conflict\""));

    let response = send(
        &app,
        Request::builder()
            .uri("/oauth/callback?error=access_denied&app_id=github")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    let html = body_text(response).await;
    assert!(html.contains("\"error\":\"access_denied\""));

    let response = send(
        &app,
        Request::builder()
            .uri("/oauth/callback")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    let html = body_text(response).await;
    assert!(html.contains("\"error\":\"invalid_input\""));
}

#[tokio::test]
async fn test_device_trust_over_http() {
    let app = create_test_app();
    app.identity
        .add_account("alice@example.com", "alice", TEST_PASSWORD);

    let response = login(&app, json!({ "device_fingerprint": "fp-laptop-0001" })).await;
    let body = body_json(response).await;
    let token = access_token(&body);
    let device_id = body["device"]["device_id"].as_str().unwrap().to_string();

    let response = send(
        &app,
        bearer_request("POST", &format!("/api/devices/{}/trust", device_id), &token),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["trusted"], true);

    let response = login(&app, json!({ "device_fingerprint": "fp-laptop-0001" })).await;
    let body = body_json(response).await;
    assert_eq!(body["device"]["trusted"], true);
    assert_eq!(body["device"]["risk_score"], 0.0);

    let devices = body_json(send(&app, bearer_request("GET", "/api/devices", &token)).await).await;
    assert_eq!(devices.as_array().unwrap().len(), 1);

    let response = send(
        &app,
        bearer_request("DELETE", &format!("/api/devices/{}/trust", device_id), &token),
    )
    .await;
    assert_eq!(body_json(response).await["trusted"], false);
}

#[tokio::test]
async fn test_resolve_security_event() {
    let app = create_test_app();
    let token = access_token(&register_and_login(&app, "alice@example.com", "alice").await);

    let events = body_json(
        send(&app, bearer_request("GET", "/api/security/events?unresolved=true", &token)).await,
    )
    .await;
    let id = events[0]["id"].as_str().unwrap().to_string();

    let response = send(
        &app,
        bearer_request("POST", &format!("/api/security/events/{}/resolve", id), &token),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["resolved"], true);

    let open = body_json(
        send(&app, bearer_request("GET", "/api/security/events?unresolved=true", &token)).await,
    )
    .await;
    assert!(open.as_array().unwrap().iter().all(|e| e["id"] != id.as_str()));
}

#[tokio::test]
async fn test_revoke_other_session() {
    let app = create_test_app();
    let first = register_and_login(&app, "alice@example.com", "alice").await;
    let second = register_and_login(&app, "alice@example.com", "alice").await;
    let token = access_token(&second);

    let sessions = body_json(send(&app, bearer_request("GET", "/api/sessions", &token)).await).await;
    let other = sessions
        .as_array()
        .unwrap()
        .iter()
        .find(|s| s["current"] == false)
        .unwrap()["id"]
        .as_str()
        .unwrap()
        .to_string();

    let response = send(
        &app,
        bearer_request("DELETE", &format!("/api/sessions/{}", other), &token),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = send(&app, bearer_request("GET", "/api/me", &access_token(&first))).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let response = send(&app, bearer_request("GET", "/api/me", &token)).await;
    assert_eq!(response.status(), StatusCode::OK);
}
