// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! HTTP authentication tests.
//!
//! These tests verify that:
//! 1. Protected routes reject requests without a live session or token
//! 2. Login sets the session cookie and returns a token pair
//! 3. Refresh tokens rotate and cannot be replayed
//! 4. Logout ends the session for both cookie and bearer callers

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
};
use serde_json::json;

mod common;
use common::{
    access_token, bearer_request, body_json, create_test_app, json_request,
    register_and_login, send, TEST_PASSWORD,
};

fn set_cookie(response: &axum::response::Response) -> String {
    response
        .headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .map(|v| v.to_str().unwrap().to_string())
        .find(|v| v.starts_with("gateway_session="))
        .expect("missing session cookie")
}

#[tokio::test]
async fn test_health_is_public() {
    let app = create_test_app();
    let response = send(
        &app,
        Request::builder().uri("/health").body(Body::empty()).unwrap(),
    )
    .await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("X-Content-Type-Options").unwrap(),
        "nosniff"
    );
    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["apps"], json!(["github", "google"]));
}

#[tokio::test]
async fn test_protected_route_requires_auth() {
    let app = create_test_app();

    let response = send(
        &app,
        Request::builder().uri("/api/me").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = send(&app, bearer_request("GET", "/api/me", "garbage")).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(response).await["error"], "invalid_token");

    let response = send(
        &app,
        Request::builder()
            .uri("/api/me")
            .header(header::COOKIE, "gateway_session=unknown")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_register_then_duplicate() {
    let app = create_test_app();
    let body = json!({
        "email": "new@example.com",
        "username": "newbie",
        "password": "long enough password"
    });

    let response = send(&app, json_request("POST", "/auth/register", body.clone())).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let profile = body_json(response).await;
    assert_eq!(profile["email"], "new@example.com");
    assert_eq!(profile["mfa_enabled"], false);

    let response = send(&app, json_request("POST", "/auth/register", body)).await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_register_validates_input() {
    let app = create_test_app();
    let response = send(
        &app,
        json_request(
            "POST",
            "/auth/register",
            json!({ "email": "not-an-email", "username": "ab", "password": "short" }),
        ),
    )
    .await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["error"], "invalid_input");
}

#[tokio::test]
async fn test_login_sets_cookie_and_tokens() {
    let app = create_test_app();
    app.identity
        .add_account("alice@example.com", "alice", TEST_PASSWORD);

    let response = send(
        &app,
        json_request(
            "POST",
            "/auth/login",
            json!({
                "login": "alice@example.com",
                "password": TEST_PASSWORD,
                "device_fingerprint": "fp-laptop-0001"
            }),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    let cookie = set_cookie(&response);
    assert!(cookie.contains("HttpOnly"));
    assert!(cookie.contains("SameSite=Lax"));
    assert!(cookie.contains("Path=/"));
    assert!(!cookie.contains("Secure"));

    let body = body_json(response).await;
    assert_eq!(body["user"]["email"], "alice@example.com");
    assert_eq!(body["tokens"]["token_type"], "Bearer");
    assert_eq!(body["device"]["risk_score"], 4.0);

    // Both the bearer token and the cookie authenticate.
    let response = send(&app, bearer_request("GET", "/api/me", &access_token(&body))).await;
    assert_eq!(response.status(), StatusCode::OK);

    let session_value = cookie.split(';').next().unwrap().to_string();
    let response = send(
        &app,
        Request::builder()
            .uri("/api/me")
            .header(header::COOKIE, session_value)
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["username"], "alice");
}

#[tokio::test]
async fn test_stale_cookie_falls_back_to_bearer() {
    let app = create_test_app();
    let login = register_and_login(&app, "alice@example.com", "alice").await;

    let request = |with_bearer: bool| {
        let mut builder = Request::builder()
            .uri("/api/me")
            .header(header::COOKIE, "gateway_session=expired-session-token");
        if with_bearer {
            builder = builder.header(
                header::AUTHORIZATION,
                format!("Bearer {}", access_token(&login)),
            );
        }
        builder.body(Body::empty()).unwrap()
    };

    let response = send(&app, request(true)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["username"], "alice");

    // Without a bearer token the cookie's own rejection stands.
    let response = send(&app, request(false)).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_login_with_wrong_password() {
    let app = create_test_app();
    register_and_login(&app, "alice@example.com", "alice").await;

    let response = send(
        &app,
        json_request(
            "POST",
            "/auth/login",
            json!({ "login": "alice@example.com", "password": "wrong" }),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(response.headers().get(header::SET_COOKIE).is_none());

    // The failure is audited against the known local user.
    let login = register_and_login(&app, "alice@example.com", "alice").await;
    let response = send(
        &app,
        bearer_request("GET", "/api/security/events", &access_token(&login)),
    )
    .await;
    let events = body_json(response).await;
    assert!(events
        .as_array()
        .unwrap()
        .iter()
        .any(|e| e["event_type"] == "login_failed"));
}

#[tokio::test]
async fn test_failed_username_login_is_audited() {
    let app = create_test_app();
    let login = register_and_login(&app, "alice@example.com", "alice").await;

    let response = send(
        &app,
        json_request(
            "POST",
            "/auth/login",
            json!({ "login": "Alice", "password": "wrong" }),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = send(
        &app,
        bearer_request("GET", "/api/security/events", &access_token(&login)),
    )
    .await;
    let failures = body_json(response)
        .await
        .as_array()
        .unwrap()
        .iter()
        .filter(|e| e["event_type"] == "login_failed")
        .count();
    assert_eq!(failures, 1);
}

#[tokio::test]
async fn test_login_when_identity_provider_is_down() {
    let app = create_test_app();
    app.identity
        .add_account("alice@example.com", "alice", TEST_PASSWORD);
    app.identity
        .unavailable
        .store(true, std::sync::atomic::Ordering::SeqCst);

    let response = send(
        &app,
        json_request(
            "POST",
            "/auth/login",
            json!({ "login": "alice@example.com", "password": TEST_PASSWORD }),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_refresh_rotates_and_rejects_replay() {
    let app = create_test_app();
    let login = register_and_login(&app, "alice@example.com", "alice").await;
    let refresh_token = login["tokens"]["refresh_token"].as_str().unwrap();

    let response = send(
        &app,
        json_request("POST", "/auth/refresh", json!({ "refresh_token": refresh_token })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let rotated = body_json(response).await;
    assert_ne!(rotated["refresh_token"], login["tokens"]["refresh_token"]);

    let response = send(&app, bearer_request("GET", "/api/me", rotated["access_token"].as_str().unwrap())).await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = send(
        &app,
        json_request("POST", "/auth/refresh", json!({ "refresh_token": refresh_token })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_logout_ends_session() {
    let app = create_test_app();
    let login = register_and_login(&app, "alice@example.com", "alice").await;
    let token = access_token(&login);

    let response = send(&app, bearer_request("POST", "/auth/logout", &token)).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert!(set_cookie(&response).contains("Max-Age=0"));

    // The JWT is still well-formed but its session is gone.
    let response = send(&app, bearer_request("GET", "/api/me", &token)).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(response).await["error"], "inactive");

    let response = send(
        &app,
        json_request(
            "POST",
            "/auth/refresh",
            json!({ "refresh_token": login["tokens"]["refresh_token"] }),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_logout_all_and_session_listing() {
    let app = create_test_app();
    let first = register_and_login(&app, "alice@example.com", "alice").await;
    let second = register_and_login(&app, "alice@example.com", "alice").await;

    let response = send(&app, bearer_request("GET", "/api/sessions", &access_token(&second))).await;
    let sessions = body_json(response).await;
    let sessions = sessions.as_array().unwrap();
    assert_eq!(sessions.len(), 2);
    assert_eq!(sessions.iter().filter(|s| s["current"] == true).count(), 1);
    assert!(sessions.iter().all(|s| s.get("session_token").is_none()));

    let response = send(&app, bearer_request("POST", "/auth/logout-all", &access_token(&second))).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["sessions_revoked"], 2);

    let response = send(&app, bearer_request("GET", "/api/me", &access_token(&first))).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_introspection() {
    let app = create_test_app();
    let login = register_and_login(&app, "alice@example.com", "alice").await;
    let token = access_token(&login);

    let introspect = |token: String| {
        Request::builder()
            .method("POST")
            .uri("/auth/introspect")
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from(format!("token={}", token)))
            .unwrap()
    };

    let body = body_json(send(&app, introspect(token.clone())).await).await;
    assert_eq!(body["active"], true);
    assert_eq!(body["email"], "alice@example.com");

    // Refresh tokens are not bearer credentials.
    let refresh = login["tokens"]["refresh_token"].as_str().unwrap().to_string();
    let body = body_json(send(&app, introspect(refresh)).await).await;
    assert_eq!(body["active"], false);

    send(&app, bearer_request("POST", "/auth/logout", &token)).await;
    let body = body_json(send(&app, introspect(token)).await).await;
    assert_eq!(body["active"], false);
}
