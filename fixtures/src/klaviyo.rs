//! A stand-in for the Klaviyo OAuth provider and the handful of API
//! endpoints the dashboard reads.
//!
//! Codes are single use, refresh tokens rotate on every refresh, and the
//! collection endpoints only answer to an access token this fixture issued.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Redirect, Response},
    routing::{get, post},
    Form, Json, Router,
};
use base64::{
    engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD},
    Engine as _,
};
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const FIXTURE_CLIENT_ID: &str = "fixture-client-id";
pub const FIXTURE_CLIENT_SECRET: &str = "fixture-client-secret";

#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Absolute base used for `links.next`.
    pub base_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub expires_in: i64,
    pub page_size: usize,
}

impl ProviderConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client_id: FIXTURE_CLIENT_ID.to_string(),
            client_secret: FIXTURE_CLIENT_SECRET.to_string(),
            expires_in: 3600,
            page_size: 2,
        }
    }
}

#[derive(Debug, Clone)]
struct PendingCode {
    redirect_uri: String,
    code_challenge: Option<String>,
}

#[derive(Debug, Default)]
struct Ledger {
    issued: u64,
    codes: HashMap<String, PendingCode>,
    access_tokens: HashSet<String>,
    refresh_tokens: HashSet<String>,
    token_requests: usize,
    api_requests: usize,
}

impl Ledger {
    fn mint_pair(&mut self) -> (String, String) {
        self.issued += 1;
        let access = format!("fixture_access_{}", self.issued);
        let refresh = format!("fixture_refresh_{}", self.issued);
        self.access_tokens.insert(access.clone());
        self.refresh_tokens.insert(refresh.clone());
        (access, refresh)
    }
}

#[derive(Clone)]
pub struct KlaviyoFixture {
    config: Arc<ProviderConfig>,
    ledger: Arc<Mutex<Ledger>>,
}

impl KlaviyoFixture {
    pub fn new(config: ProviderConfig) -> Self {
        Self {
            config: Arc::new(config),
            ledger: Arc::default(),
        }
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    pub fn base_url(&self) -> &str {
        &self.config.base_url
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/oauth/authorize", get(authorize))
            .route("/oauth/token", post(token))
            .route("/api/:collection", get(collection))
            .route("/_fixture/expire-tokens", post(expire_tokens))
            .with_state(self.clone())
    }

    /// Issue a token pair without going through the authorize flow.
    pub fn mint_tokens(&self) -> (String, String) {
        self.ledger().mint_pair()
    }

    /// Make every access token issued so far invalid. Refresh tokens keep
    /// working.
    pub fn expire_access_tokens(&self) {
        self.ledger().access_tokens.clear();
    }

    /// Calls made to `/oauth/token`, successful or not.
    pub fn token_requests(&self) -> usize {
        self.ledger().token_requests
    }

    pub fn api_requests(&self) -> usize {
        self.ledger().api_requests
    }

    fn ledger(&self) -> MutexGuard<'_, Ledger> {
        self.ledger
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Bind an ephemeral local port and serve a fresh fixture on it.
pub async fn spawn() -> anyhow::Result<KlaviyoFixture> {
    spawn_with(|_| {}).await
}

/// Like [`spawn`], with a hook to adjust the provider config first.
pub async fn spawn_with<F>(configure: F) -> anyhow::Result<KlaviyoFixture>
where
    F: FnOnce(&mut ProviderConfig),
{
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    let mut config = ProviderConfig::new(format!("http://{addr}"));
    configure(&mut config);

    let fixture = KlaviyoFixture::new(config);
    let app = fixture.router();
    tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            warn!("Klaviyo fixture stopped: {err}");
        }
    });

    Ok(fixture)
}

fn oauth_error(status: StatusCode, error: &str, description: &str) -> Response {
    (
        status,
        Json(json!({
            "error": error,
            "error_description": description,
        })),
    )
        .into_response()
}

fn api_error(status: StatusCode, code: &str, detail: &str) -> Response {
    (
        status,
        Json(json!({
            "errors": [{
                "status": status.as_u16(),
                "code": code,
                "title": status.canonical_reason().unwrap_or_default(),
                "detail": detail,
            }]
        })),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
struct AuthorizeQuery {
    client_id: Option<String>,
    response_type: Option<String>,
    redirect_uri: Option<String>,
    state: Option<String>,
    code_challenge: Option<String>,
    code_challenge_method: Option<String>,
}

/// Auto-approves the request and sends the browser straight back with a code.
async fn authorize(
    State(fixture): State<KlaviyoFixture>,
    Query(params): Query<AuthorizeQuery>,
) -> Response {
    if params.response_type.as_deref() != Some("code") {
        return oauth_error(
            StatusCode::BAD_REQUEST,
            "unsupported_response_type",
            "response_type must be code",
        );
    }
    if params.client_id.as_deref() != Some(fixture.config.client_id.as_str()) {
        return oauth_error(StatusCode::BAD_REQUEST, "invalid_client", "Unknown client_id");
    }
    let Some(redirect_uri) = params.redirect_uri else {
        return oauth_error(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            "redirect_uri is required",
        );
    };
    if let Some(method) = params.code_challenge_method.as_deref() {
        if method != "S256" {
            return oauth_error(
                StatusCode::BAD_REQUEST,
                "invalid_request",
                "Only S256 code challenges are supported",
            );
        }
    }

    let code = {
        let mut ledger = fixture.ledger();
        ledger.issued += 1;
        let code = format!("fixture_auth_code_{}", ledger.issued);
        ledger.codes.insert(
            code.clone(),
            PendingCode {
                redirect_uri: redirect_uri.clone(),
                code_challenge: params.code_challenge,
            },
        );
        code
    };

    let mut query = vec![("code", code)];
    if let Some(state) = params.state {
        query.push(("state", state));
    }
    let query = match serde_urlencoded::to_string(&query) {
        Ok(query) => query,
        Err(err) => {
            return oauth_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "server_error",
                &err.to_string(),
            )
        }
    };

    info!("Klaviyo fixture: authorized, redirecting to {redirect_uri}");
    Redirect::to(&format!("{redirect_uri}?{query}")).into_response()
}

#[derive(Debug, PartialEq, Eq)]
enum ClientAuth {
    /// Client id and secret, via Basic auth or the form body.
    Confidential,
    /// Client id only.
    Public,
    Invalid,
    Missing,
}

fn client_auth(
    config: &ProviderConfig,
    headers: &HeaderMap,
    form: &HashMap<String, String>,
) -> ClientAuth {
    if let Some(value) = headers.get(header::AUTHORIZATION) {
        let decoded = value
            .to_str()
            .ok()
            .and_then(|value| value.strip_prefix("Basic "))
            .and_then(|encoded| STANDARD.decode(encoded).ok())
            .and_then(|bytes| String::from_utf8(bytes).ok());

        return match decoded.as_deref().and_then(|pair| pair.split_once(':')) {
            Some((id, secret)) if id == config.client_id && secret == config.client_secret => {
                ClientAuth::Confidential
            }
            _ => ClientAuth::Invalid,
        };
    }

    match (form.get("client_id"), form.get("client_secret")) {
        (Some(id), Some(secret)) if *id == config.client_id && *secret == config.client_secret => {
            ClientAuth::Confidential
        }
        (Some(id), None) if *id == config.client_id => ClientAuth::Public,
        (None, None) => ClientAuth::Missing,
        _ => ClientAuth::Invalid,
    }
}

fn code_challenge(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

async fn token(
    State(fixture): State<KlaviyoFixture>,
    headers: HeaderMap,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    let auth = client_auth(&fixture.config, &headers, &form);
    let mut ledger = fixture.ledger();
    ledger.token_requests += 1;

    let grant_type = form.get("grant_type").map(String::as_str).unwrap_or_default();
    info!("Klaviyo fixture: token request, grant_type={grant_type}, client={auth:?}");

    match grant_type {
        "authorization_code" => {
            if matches!(auth, ClientAuth::Invalid | ClientAuth::Missing) {
                return oauth_error(
                    StatusCode::UNAUTHORIZED,
                    "invalid_client",
                    "Client authentication failed",
                );
            }

            let Some(pending) = form.get("code").and_then(|code| ledger.codes.remove(code)) else {
                return oauth_error(
                    StatusCode::BAD_REQUEST,
                    "invalid_grant",
                    "Authorization code is invalid or was already used",
                );
            };

            if form.get("redirect_uri") != Some(&pending.redirect_uri) {
                return oauth_error(
                    StatusCode::BAD_REQUEST,
                    "invalid_grant",
                    "redirect_uri does not match the authorization request",
                );
            }

            match (&pending.code_challenge, form.get("code_verifier")) {
                (Some(challenge), Some(verifier)) if code_challenge(verifier) == *challenge => {}
                (Some(_), _) => {
                    return oauth_error(
                        StatusCode::BAD_REQUEST,
                        "invalid_grant",
                        "code_verifier does not match the code challenge",
                    )
                }
                (None, _) if auth == ClientAuth::Public => {
                    return oauth_error(
                        StatusCode::UNAUTHORIZED,
                        "invalid_client",
                        "Public clients must use PKCE",
                    )
                }
                (None, _) => {}
            }
        }
        "refresh_token" => {
            if auth != ClientAuth::Confidential {
                return oauth_error(
                    StatusCode::UNAUTHORIZED,
                    "invalid_client",
                    "Client authentication failed",
                );
            }

            let presented = form.get("refresh_token").cloned().unwrap_or_default();
            if !ledger.refresh_tokens.remove(&presented) {
                return oauth_error(
                    StatusCode::BAD_REQUEST,
                    "invalid_grant",
                    "Refresh token is invalid or was already used",
                );
            }
        }
        _ => {
            return oauth_error(
                StatusCode::BAD_REQUEST,
                "unsupported_grant_type",
                "Unsupported grant_type",
            )
        }
    }

    let (access_token, refresh_token) = ledger.mint_pair();
    Json(json!({
        "token_type": "Bearer",
        "access_token": access_token,
        "refresh_token": refresh_token,
        "expires_in": fixture.config.expires_in,
        "scope": "lists:read metrics:read profiles:read",
    }))
    .into_response()
}

async fn collection(
    State(fixture): State<KlaviyoFixture>,
    Path(collection): Path<String>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let authorized = {
        let mut ledger = fixture.ledger();
        ledger.api_requests += 1;

        headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .is_some_and(|token| ledger.access_tokens.contains(token))
    };

    if !authorized {
        return api_error(
            StatusCode::UNAUTHORIZED,
            "not_authenticated",
            "Missing or invalid access token.",
        );
    }

    let Some(records) = sample_records(&collection) else {
        return api_error(StatusCode::NOT_FOUND, "not_found", "Unknown collection.");
    };

    let cursor = params
        .get("page[cursor]")
        .and_then(|cursor| cursor.parse::<usize>().ok())
        .unwrap_or(0)
        .min(records.len());
    let end = (cursor + fixture.config.page_size.max(1)).min(records.len());

    let base = format!("{}/api/{collection}", fixture.config.base_url);
    let next = (end < records.len()).then(|| format!("{base}?page%5Bcursor%5D={end}"));

    Json(json!({
        "data": &records[cursor..end],
        "links": {
            "self": format!("{base}?page%5Bcursor%5D={cursor}"),
            "next": next,
            "prev": Value::Null,
        }
    }))
    .into_response()
}

async fn expire_tokens(State(fixture): State<KlaviyoFixture>) -> StatusCode {
    fixture.expire_access_tokens();
    StatusCode::NO_CONTENT
}

fn sample_records(collection: &str) -> Option<Vec<Value>> {
    let records = match collection {
        "lists" => ["Newsletter", "fb-leads", "Newsletter", "tw_followers", "fb_leads"]
            .iter()
            .enumerate()
            .map(|(i, name)| {
                json!({
                    "type": "list",
                    "id": format!("LIST{i}"),
                    "attributes": { "name": name },
                })
            })
            .collect(),
        "metrics" => ["Opened Email", "Clicked Email", "Placed Order"]
            .iter()
            .enumerate()
            .map(|(i, name)| {
                json!({
                    "type": "metric",
                    "id": format!("METRIC{i}"),
                    "attributes": {
                        "name": name,
                        "integration": { "name": "Klaviyo" },
                    },
                })
            })
            .collect(),
        "profiles" => ["ada@example.com", "grace@example.com", "linus@example.com"]
            .iter()
            .enumerate()
            .map(|(i, email)| {
                json!({
                    "type": "profile",
                    "id": format!("PROFILE{i}"),
                    "attributes": { "email": email },
                })
            })
            .collect(),
        _ => return None,
    };

    Some(records)
}
