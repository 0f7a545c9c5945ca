//! 认证 API 集成测试

use axum::http::{Method, StatusCode};
use serde_json::json;
use session_auth::{models::user::SessionUser, routes::create_router};
use uuid::Uuid;

mod common;
use common::{
    create_memory_state, create_test_config, create_test_user, send, send_with_headers,
    TEST_EMAIL, TEST_PASSWORD,
};

async fn login(app: &axum::Router, email: &str, password: &str) -> common::TestResponse {
    send(
        app,
        Method::POST,
        "/auth/login",
        Some(json!({ "email": email, "password": password })),
        None,
    )
    .await
}

#[tokio::test]
async fn test_login_success() {
    let (state, _) = create_memory_state(create_test_config());
    create_test_user(&state, TEST_EMAIL, TEST_PASSWORD).await;
    let app = create_router(state);

    let response = login(&app, TEST_EMAIL, TEST_PASSWORD).await;

    assert_eq!(response.status, StatusCode::OK);
    assert!(response.body["accessToken"].is_string());
    let refresh_token = response.body["refreshToken"].as_str().unwrap();
    assert_eq!(refresh_token.len(), 64);
    assert!(refresh_token.chars().all(|c| c.is_ascii_hexdigit()));
    assert_eq!(response.body["expiresIn"], 900);
    assert!(response.headers.contains_key("x-request-id"));
    assert!(response.headers.contains_key("x-trace-id"));
}

#[tokio::test]
async fn test_login_failures_are_indistinguishable() {
    let (state, _) = create_memory_state(create_test_config());
    create_test_user(&state, TEST_EMAIL, TEST_PASSWORD).await;
    let app = create_router(state);

    let wrong_password = login(&app, TEST_EMAIL, "wrong-password1").await;
    let unknown_email = login(&app, "nobody@b.com", TEST_PASSWORD).await;

    assert_eq!(wrong_password.status, StatusCode::UNAUTHORIZED);
    assert_eq!(unknown_email.status, StatusCode::UNAUTHORIZED);
    assert_eq!(wrong_password.body["error"]["message"], "Authentication failed");
    assert_eq!(
        wrong_password.body["error"]["message"],
        unknown_email.body["error"]["message"]
    );
}

#[tokio::test]
async fn test_error_body_carries_request_id_header() {
    let (state, _) = create_memory_state(create_test_config());
    let app = create_router(state);

    let response = login(&app, TEST_EMAIL, TEST_PASSWORD).await;

    let header_id = response.headers["x-request-id"].to_str().unwrap();
    assert_eq!(response.body["error"]["requestId"], header_id);
    assert_eq!(response.body["error"]["code"], 401);
}

#[tokio::test]
async fn test_login_empty_fields_rejected() {
    let (state, _) = create_memory_state(create_test_config());
    let app = create_router(state);

    let response = login(&app, "", "").await;

    assert_eq!(response.status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_login_whitespace_email_rejected() {
    let (state, _) = create_memory_state(create_test_config());
    let app = create_router(state);

    let response = login(&app, "   ", TEST_PASSWORD).await;

    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    assert_eq!(response.body["error"]["code"], 400);
}

#[tokio::test]
async fn test_login_email_is_trimmed() {
    let (state, _) = create_memory_state(create_test_config());
    create_test_user(&state, TEST_EMAIL, TEST_PASSWORD).await;
    let app = create_router(state);

    let response = login(&app, &format!("  {}  ", TEST_EMAIL), TEST_PASSWORD).await;

    assert_eq!(response.status, StatusCode::OK);
}

#[tokio::test]
async fn test_refresh_rotates_token() {
    let (state, _) = create_memory_state(create_test_config());
    create_test_user(&state, TEST_EMAIL, TEST_PASSWORD).await;
    let app = create_router(state);

    let first = login(&app, TEST_EMAIL, TEST_PASSWORD).await;
    let old_refresh = first.body["refreshToken"].as_str().unwrap().to_string();

    let refreshed = send(
        &app,
        Method::POST,
        "/auth/refresh",
        Some(json!({ "refreshToken": old_refresh })),
        None,
    )
    .await;
    assert_eq!(refreshed.status, StatusCode::OK);
    assert_ne!(refreshed.body["refreshToken"], first.body["refreshToken"]);
    assert!(refreshed.body["accessToken"].is_string());

    let replay = send(
        &app,
        Method::POST,
        "/auth/refresh",
        Some(json!({ "refreshToken": old_refresh })),
        None,
    )
    .await;
    assert_eq!(replay.status, StatusCode::UNAUTHORIZED);
    assert_eq!(replay.body["error"]["message"], "Authentication failed");
}

#[tokio::test]
async fn test_refresh_garbage_token() {
    let (state, _) = create_memory_state(create_test_config());
    let app = create_router(state);

    let response = send(
        &app,
        Method::POST,
        "/auth/refresh",
        Some(json!({ "refreshToken": "0123abcd" })),
        None,
    )
    .await;

    assert_eq!(response.status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_logout_revokes_refresh_tokens() {
    let (state, repo) = create_memory_state(create_test_config());
    let user = create_test_user(&state, TEST_EMAIL, TEST_PASSWORD).await;
    let app = create_router(state);

    let pair = login(&app, TEST_EMAIL, TEST_PASSWORD).await;
    let access_token = pair.body["accessToken"].as_str().unwrap();

    let response = send(&app, Method::POST, "/auth/logout", None, Some(access_token)).await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body["message"], "Logged out successfully");
    assert!(repo.refresh_tokens_for(user.id).await.is_empty());

    // 再次登出同样成功
    let again = send(&app, Method::POST, "/auth/logout", None, Some(access_token)).await;
    assert_eq!(again.status, StatusCode::OK);

    let refresh = send(
        &app,
        Method::POST,
        "/auth/refresh",
        Some(json!({ "refreshToken": pair.body["refreshToken"] })),
        None,
    )
    .await;
    assert_eq!(refresh.status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_protected_routes_require_bearer() {
    let (state, _) = create_memory_state(create_test_config());
    let app = create_router(state);

    let missing = send(&app, Method::GET, "/auth/me", None, None).await;
    assert_eq!(missing.status, StatusCode::UNAUTHORIZED);

    let invalid = send(&app, Method::GET, "/auth/me", None, Some("not.a.jwt")).await;
    assert_eq!(invalid.status, StatusCode::UNAUTHORIZED);
    assert_eq!(invalid.body["error"]["message"], "Authentication failed");

    let logout = send(&app, Method::POST, "/auth/logout", None, None).await;
    assert_eq!(logout.status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_get_me_returns_profile() {
    let (state, _) = create_memory_state(create_test_config());
    let user = create_test_user(&state, TEST_EMAIL, TEST_PASSWORD).await;
    let app = create_router(state);

    let pair = login(&app, TEST_EMAIL, TEST_PASSWORD).await;
    let access_token = pair.body["accessToken"].as_str().unwrap();

    let response = send(&app, Method::GET, "/auth/me", None, Some(access_token)).await;

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body["id"], user.id.to_string());
    assert_eq!(response.body["tenantId"], user.tenant_id.to_string());
    assert_eq!(response.body["email"], TEST_EMAIL);
    assert!(response.body["clients"].as_array().unwrap().is_empty());
    assert!(response.body.get("passwordHash").is_none());
}

#[tokio::test]
async fn test_get_me_for_vanished_user_is_null() {
    let (state, _) = create_memory_state(create_test_config());
    let ghost = SessionUser {
        id: Uuid::new_v4(),
        tenant_id: Uuid::new_v4(),
        email: "ghost@b.com".to_string(),
        name: "Ghost".to_string(),
        role: "member".to_string(),
    };
    let access_token = state.jwt_service.generate_access_token(&ghost).unwrap();
    let app = create_router(state);

    let response = send(&app, Method::GET, "/auth/me", None, Some(&access_token)).await;

    assert_eq!(response.status, StatusCode::OK);
    assert!(response.body.is_null());
}

#[tokio::test]
async fn test_update_me() {
    let (state, _) = create_memory_state(create_test_config());
    create_test_user(&state, TEST_EMAIL, TEST_PASSWORD).await;
    let app = create_router(state);

    let pair = login(&app, TEST_EMAIL, TEST_PASSWORD).await;
    let access_token = pair.body["accessToken"].as_str().unwrap();

    let renamed = send(
        &app,
        Method::PATCH,
        "/auth/me",
        Some(json!({ "name": "Alicia" })),
        Some(access_token),
    )
    .await;
    assert_eq!(renamed.status, StatusCode::OK);
    assert_eq!(renamed.body["name"], "Alicia");

    let missing_current = send(
        &app,
        Method::PATCH,
        "/auth/me",
        Some(json!({ "newPassword": "newsecret456" })),
        Some(access_token),
    )
    .await;
    assert_eq!(missing_current.status, StatusCode::BAD_REQUEST);

    let wrong_current = send(
        &app,
        Method::PATCH,
        "/auth/me",
        Some(json!({ "currentPassword": "wrong-pass1", "newPassword": "newsecret456" })),
        Some(access_token),
    )
    .await;
    assert_eq!(wrong_current.status, StatusCode::UNAUTHORIZED);

    let changed = send(
        &app,
        Method::PATCH,
        "/auth/me",
        Some(json!({ "currentPassword": TEST_PASSWORD, "newPassword": "newsecret456" })),
        Some(access_token),
    )
    .await;
    assert_eq!(changed.status, StatusCode::OK);

    assert_eq!(login(&app, TEST_EMAIL, "newsecret456").await.status, StatusCode::OK);
    assert_eq!(
        login(&app, TEST_EMAIL, TEST_PASSWORD).await.status,
        StatusCode::UNAUTHORIZED
    );
}

#[tokio::test]
async fn test_login_rate_limited_per_ip() {
    let mut config = create_test_config();
    config.security.login_rate_limit_max = 2;
    let (state, _) = create_memory_state(config);
    let app = create_router(state);

    for _ in 0..2 {
        let response = login(&app, TEST_EMAIL, TEST_PASSWORD).await;
        assert_eq!(response.status, StatusCode::UNAUTHORIZED);
    }

    let limited = login(&app, TEST_EMAIL, TEST_PASSWORD).await;
    assert_eq!(limited.status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(limited.body["error"]["code"], 429);
}

async fn login_via(app: &axum::Router, forwarded_for: &str) -> common::TestResponse {
    send_with_headers(
        app,
        Method::POST,
        "/auth/login",
        Some(json!({ "email": TEST_EMAIL, "password": TEST_PASSWORD })),
        None,
        &[("x-forwarded-for", forwarded_for)],
    )
    .await
}

#[tokio::test]
async fn test_forwarded_for_ignored_by_default() {
    let mut config = create_test_config();
    config.security.login_rate_limit_max = 1;
    let (state, _) = create_memory_state(config);
    let app = create_router(state);

    // 每次换一个伪造的来源地址，仍然按同一个连接计数
    let first = login_via(&app, "203.0.113.0").await;
    assert_eq!(first.status, StatusCode::UNAUTHORIZED);

    for i in 1..5 {
        let response = login_via(&app, &format!("203.0.113.{}", i)).await;
        assert_eq!(response.status, StatusCode::TOO_MANY_REQUESTS);
    }
}

#[tokio::test]
async fn test_forwarded_for_keys_limit_behind_trusted_proxy() {
    let mut config = create_test_config();
    config.security.login_rate_limit_max = 1;
    config.security.trust_proxy = true;
    let (state, _) = create_memory_state(config);
    let app = create_router(state);

    assert_eq!(login_via(&app, "203.0.113.1").await.status, StatusCode::UNAUTHORIZED);
    assert_eq!(login_via(&app, "203.0.113.2").await.status, StatusCode::UNAUTHORIZED);
    assert_eq!(
        login_via(&app, "203.0.113.1").await.status,
        StatusCode::TOO_MANY_REQUESTS
    );
}
