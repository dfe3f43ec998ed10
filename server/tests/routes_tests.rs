use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use fixtures::klaviyo::{self, KlaviyoFixture, FIXTURE_CLIENT_ID, FIXTURE_CLIENT_SECRET};
use http_body_util::BodyExt as _;
use klaviyo_oauth_demo::config::Config;
use klaviyo_oauth_demo::routes::routes;
use klaviyo_oauth_demo::state::AppState;
use klaviyo_oauth_demo::store::MemoryTokenStore;
use klaviyo_oauth_demo::traits::SystemClock;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use tower::ServiceExt as _;

const REDIRECT_URI: &str = "http://localhost:3000/callback";

struct TestApp {
    app: Router,
    fixture: KlaviyoFixture,
    _static_dir: tempfile::TempDir,
}

async fn test_app(extra: &[(&str, &str)]) -> TestApp {
    let fixture = klaviyo::spawn().await.unwrap();
    let static_dir = tempfile::tempdir().unwrap();
    std::fs::write(static_dir.path().join("index.html"), "<h1>dashboard</h1>").unwrap();
    std::fs::write(static_dir.path().join("app.js"), "console.log('hi')").unwrap();

    let mut vars: HashMap<String, String> = [
        ("CLIENT_ID", FIXTURE_CLIENT_ID),
        ("CLIENT_SECRET", FIXTURE_CLIENT_SECRET),
        ("REDIRECT_URI", REDIRECT_URI),
        ("SCOPE", "lists:read metrics:read profiles:read"),
        ("KLAVIYO_BASE_URL", fixture.base_url()),
        ("PAGINATION", "cursor"),
    ]
    .iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    vars.insert(
        "STATIC_DIR".to_string(),
        static_dir.path().display().to_string(),
    );
    for (k, v) in extra {
        vars.insert(k.to_string(), v.to_string());
    }

    let config = Config::from_lookup(|name| vars.get(name).cloned()).unwrap();
    let state = AppState::new(
        config,
        Arc::new(MemoryTokenStore::new()),
        Arc::new(SystemClock),
    )
    .await
    .unwrap();

    TestApp {
        app: routes(state),
        fixture,
        _static_dir: static_dir,
    }
}

async fn get(app: &Router, uri: &str) -> (StatusCode, axum::http::HeaderMap, Vec<u8>) {
    let response = app
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();

    let status = response.status();
    let headers = response.headers().clone();
    let body = response.into_body().collect().await.unwrap().to_bytes().to_vec();
    (status, headers, body)
}

async fn get_json(app: &Router, uri: &str) -> (StatusCode, Value) {
    let (status, _, body) = get(app, uri).await;
    (status, serde_json::from_slice(&body).unwrap())
}

/// Walk /login -> provider -> /callback like a browser would.
async fn log_in(test: &TestApp) {
    let (status, login) = get_json(&test.app, "/login").await;
    assert_eq!(status, StatusCode::OK);
    let authorize_url = login["redirect"].as_str().unwrap();
    assert!(authorize_url.starts_with(test.fixture.base_url()));

    let provider = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap()
        .get(authorize_url)
        .send()
        .await
        .unwrap();
    assert_eq!(provider.status(), reqwest::StatusCode::SEE_OTHER);

    let location = provider.headers()["location"].to_str().unwrap();
    let callback = location.strip_prefix("http://localhost:3000").unwrap();

    let (status, headers, _) = get(&test.app, callback).await;
    assert_eq!(status, StatusCode::SEE_OTHER);
    assert_eq!(headers[header::LOCATION], "/");
}

#[tokio::test]
async fn test_logged_out_session() {
    let test = test_app(&[]).await;

    let (status, body) = get_json(&test.app, "/logged-in").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "token": false }));

    // No token to send, no refresh token to recover with: the provider's 401 comes back
    let (status, body) = get_json(&test.app, "/get-lists").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["errors"][0]["code"], "not_authenticated");
    assert_eq!(test.fixture.token_requests(), 0);
}

#[tokio::test]
async fn test_login_and_proxy_collections() {
    let test = test_app(&[]).await;
    log_in(&test).await;

    let (_, body) = get_json(&test.app, "/logged-in").await;
    assert!(body["token"].as_str().unwrap().starts_with("fixture_access_"));

    let (status, lists) = get_json(&test.app, "/get-lists").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(lists.as_array().unwrap().len(), 5);

    let (status, metrics) = get_json(&test.app, "/get-metrics").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(metrics[0]["attributes"]["name"], "Opened Email");

    let (status, profiles) = get_json(&test.app, "/get-profiles").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(profiles.as_array().unwrap().len(), 3);

    assert_eq!(test.fixture.token_requests(), 1);
}

#[tokio::test]
async fn test_single_page_policy_reads_one_page() {
    let test = test_app(&[("PAGINATION", "single")]).await;
    log_in(&test).await;

    let (status, lists) = get_json(&test.app, "/get-lists").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(lists.as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_lists_summary() {
    let test = test_app(&[]).await;
    log_in(&test).await;

    let (status, summary) = get_json(&test.app, "/get-lists/summary").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        summary,
        json!({
            "name": {
                "name": "List Name",
                "data": [
                    { "name": "Newsletter", "count": 2 },
                    { "name": "FB leads", "count": 2 },
                    { "name": "TW followers", "count": 1 },
                ]
            }
        })
    );
}

#[tokio::test]
async fn test_revoked_access_token_is_refreshed_transparently() {
    let test = test_app(&[]).await;
    log_in(&test).await;
    let (_, before) = get_json(&test.app, "/logged-in").await;

    test.fixture.expire_access_tokens();

    let (status, metrics) = get_json(&test.app, "/get-metrics").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(metrics.as_array().unwrap().len(), 3);

    let (_, after) = get_json(&test.app, "/logged-in").await;
    assert_ne!(before["token"], after["token"]);
    assert_eq!(test.fixture.token_requests(), 2);
}

#[tokio::test]
async fn test_manual_refresh_redirects_home() {
    let test = test_app(&[]).await;
    log_in(&test).await;

    let (status, headers, _) = get(&test.app, "/refresh").await;
    assert_eq!(status, StatusCode::SEE_OTHER);
    assert_eq!(headers[header::LOCATION], "/");
    assert_eq!(test.fixture.token_requests(), 2);
}

#[tokio::test]
async fn test_callback_errors() {
    let test = test_app(&[]).await;

    let (status, body) = get_json(&test.app, "/callback?state=whatever").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_request");

    let (status, body) = get_json(&test.app, "/callback?code=abc&state=forged").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_state");

    let (status, body) = get_json(
        &test.app,
        "/callback?error=access_denied&error_description=User%20said%20no",
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "access_denied");
    assert_eq!(body["error_description"], "User said no");

    assert_eq!(test.fixture.token_requests(), 0);
}

#[tokio::test]
async fn test_login_without_scope_is_a_configuration_error() {
    let test = test_app(&[("SCOPE", "")]).await;

    let (status, body) = get_json(&test.app, "/login").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"], "configuration_error");
}

#[tokio::test]
async fn test_static_files() {
    let test = test_app(&[]).await;

    let (status, headers, body) = get(&test.app, "/").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"<h1>dashboard</h1>");
    assert_eq!(headers[header::CACHE_CONTROL], "no-cache");
    assert!(headers[header::CONTENT_TYPE]
        .to_str()
        .unwrap()
        .starts_with("text/html"));

    let (status, headers, _) = get(&test.app, "/app.js").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers[header::CACHE_CONTROL], "public, max-age=31536000");

    let (status, _, _) = get(&test.app, "/missing.css").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _, _) = get(&test.app, "/../Cargo.toml").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
