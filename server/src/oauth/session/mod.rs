use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::{FlowVariant, OAuthConfig};
use crate::errors::OAuthError;
use crate::oauth::pkce;
use crate::oauth::token::{Session, TokenGrant, TokenResponse};
use crate::store::{StoreKey, TokenStore};
use crate::traits::Clock;

/// Tokens this close to expiry report [`SessionState::ExpiringSoon`].
const EXPIRING_SOON_MARGIN_SECS: i64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    /// A code exchange is in flight.
    Authenticating,
    Authenticated,
    ExpiringSoon,
    /// The provider rejected the last refresh; a new login is needed.
    Revoked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshTrigger {
    Manual,
    Timer,
    Expiry,
    Unauthorized,
}

impl fmt::Display for RefreshTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RefreshTrigger::Manual => "manual",
            RefreshTrigger::Timer => "timer",
            RefreshTrigger::Expiry => "expiry",
            RefreshTrigger::Unauthorized => "unauthorized",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// New tokens were obtained by this call.
    Refreshed,
    /// Another caller refreshed while this one waited; no request was sent.
    Coalesced,
    /// Client credentials or the refresh token are missing; nothing was sent.
    Skipped,
}

/// Result of one background refresh tick. Errors are reported here instead
/// of being propagated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Refreshed,
    Skipped,
    Failed(String),
}

/// Owns the OAuth session: code exchange, refresh, and bearer-authorized
/// requests against the provider.
///
/// The token pair is only ever changed through [`SessionManager::complete_authorization`]
/// and [`SessionManager::refresh`]. Refreshes are single-flight: callers that
/// queue up behind a running refresh reuse its result instead of spending the
/// refresh token a second time.
pub struct SessionManager {
    config: OAuthConfig,
    http: reqwest::Client,
    store: Arc<dyn TokenStore>,
    clock: Arc<dyn Clock>,
    local_secret: String,
    pkce_state: String,
    session: RwLock<Session>,
    refresh_lock: Mutex<()>,
    refresh_generation: AtomicU64,
    authenticating: AtomicBool,
    revoked: AtomicBool,
}

impl SessionManager {
    /// Loads the local secret (generating and persisting it on first run)
    /// and hydrates any token pair left in the store.
    pub async fn load(
        config: OAuthConfig,
        store: Arc<dyn TokenStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, OAuthError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .use_rustls_tls()
            .build()?;

        let local_secret = match store.get(StoreKey::LocalSecret).await? {
            Some(secret) => secret,
            None => {
                let secret = pkce::generate_verifier();
                store.set(StoreKey::LocalSecret, &secret).await?;
                info!("Generated a new local secret");
                secret
            }
        };

        let now = clock.now().timestamp();
        let session = match (
            store.get(StoreKey::Token).await?,
            store.get(StoreKey::RefreshToken).await?,
        ) {
            (Some(access), Some(refresh)) => {
                info!("Restored OAuth session from the token store");
                Session::hydrated(access, refresh, now)
            }
            (None, None) => Session::empty(now),
            _ => {
                warn!("Token store holds only one of TOKEN / REFRESH_TOKEN, ignoring it");
                Session::empty(now)
            }
        };

        Ok(Self {
            config,
            http,
            store,
            clock,
            local_secret,
            pkce_state: pkce::generate_state(),
            session: RwLock::new(session),
            refresh_lock: Mutex::new(()),
            refresh_generation: AtomicU64::new(0),
            authenticating: AtomicBool::new(false),
            revoked: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &OAuthConfig {
        &self.config
    }

    /// The `state` value the callback is expected to echo back. The PKCE
    /// verifier never leaves the process, so that variant uses a separate
    /// per-process value.
    fn expected_state(&self) -> &str {
        match self.config.flow {
            FlowVariant::Pkce => &self.pkce_state,
            FlowVariant::ClientSecret => &self.local_secret,
        }
    }

    /// Build the provider authorize URL. Does not touch the session.
    pub fn begin_authorization(&self) -> Result<String, OAuthError> {
        let credentials = &self.config.credentials;
        let client_id = required(&credentials.client_id, "CLIENT_ID")?;
        let redirect_uri = required(&credentials.redirect_uri, "REDIRECT_URI")?;
        let scope = required(&credentials.scope, "SCOPE")?;

        let mut params = vec![
            ("client_id", client_id.to_string()),
            ("response_type", "code".to_string()),
            ("redirect_uri", redirect_uri.to_string()),
            ("scope", scope.to_string()),
            ("state", self.expected_state().to_string()),
        ];

        if self.config.flow == FlowVariant::Pkce {
            params.push(("code_challenge_method", "S256".to_string()));
            params.push(("code_challenge", pkce::code_challenge(&self.local_secret)));
        }

        let redirect = format!(
            "{}?{}",
            self.config.authorize_url(),
            serde_urlencoded::to_string(&params)?
        );
        info!(url = %redirect, "[redirect] authorization url built");

        Ok(redirect)
    }

    /// Exchange an authorization code for a token pair.
    ///
    /// On any failure the cached and persisted session are left untouched.
    #[tracing::instrument(skip_all)]
    pub async fn complete_authorization(
        &self,
        code: &str,
        state: Option<&str>,
    ) -> Result<(), OAuthError> {
        if let Some(state) = state {
            if state != self.expected_state() {
                warn!("[callback] state mismatch, refusing code exchange");
                return Err(OAuthError::StateMismatch);
            }
        }

        let redirect_uri = required(&self.config.credentials.redirect_uri, "REDIRECT_URI")?;

        let mut form = vec![
            ("grant_type", "authorization_code".to_string()),
            ("code", code.to_string()),
            ("redirect_uri", redirect_uri.to_string()),
        ];
        if self.config.flow == FlowVariant::Pkce {
            form.push(("code_verifier", self.local_secret.clone()));
        }

        self.authenticating.store(true, Ordering::SeqCst);
        let result = self.request_token(form).await;
        self.authenticating.store(false, Ordering::SeqCst);

        match result {
            Ok(grant) => {
                self.install(grant).await?;
                info!("[callback] token acquired");
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "[callback] error acquiring token");
                Err(err)
            }
        }
    }

    /// Trade the refresh token for a new pair.
    ///
    /// Missing client credentials or refresh token make this a no-op. A
    /// rejected refresh keeps the stale session and surfaces the provider
    /// body.
    #[tracing::instrument(skip(self))]
    pub async fn refresh(&self, trigger: RefreshTrigger) -> Result<RefreshOutcome, OAuthError> {
        let observed = self.refresh_generation.load(Ordering::SeqCst);
        let _guard = self.refresh_lock.lock().await;

        if self.refresh_generation.load(Ordering::SeqCst) != observed {
            debug!("Tokens changed while waiting for the refresh lock");
            return Ok(RefreshOutcome::Coalesced);
        }

        let Some(refresh_token) = self.refresh_credentials().await else {
            debug!("Refresh skipped, client credentials or refresh token missing");
            return Ok(RefreshOutcome::Skipped);
        };

        info!("[refresh] token re-requested");

        let form = vec![
            ("grant_type", "refresh_token".to_string()),
            ("refresh_token", refresh_token),
        ];

        match self.request_token(form).await {
            Ok(grant) => {
                self.install(grant).await?;
                info!("[refresh] new token acquired");
                Ok(RefreshOutcome::Refreshed)
            }
            Err(err) => {
                if matches!(err, OAuthError::UpstreamAuth { .. }) {
                    self.revoked.store(true, Ordering::SeqCst);
                }
                warn!(error = %err, "[refresh] error refreshing token");
                Err(err)
            }
        }
    }

    /// Send a bearer-authorized request to the provider and return its JSON
    /// body.
    ///
    /// An expired token is refreshed first. An unauthorized answer triggers
    /// exactly one refresh; the request is retried once only if that refresh
    /// yielded new tokens, otherwise the 401 is surfaced.
    #[tracing::instrument(skip(self, body))]
    pub async fn authorized_request(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
    ) -> Result<Value, OAuthError> {
        self.refresh_if_expired().await;

        let (status, payload) = self.send_authorized(&method, url, body).await?;
        if !is_unauthorized(status, &payload) {
            return api_result(status, payload);
        }

        warn!(%url, "Upstream rejected the access token");

        match self.refresh(RefreshTrigger::Unauthorized).await {
            Ok(RefreshOutcome::Refreshed) | Ok(RefreshOutcome::Coalesced) => {
                let (status, payload) = self.send_authorized(&method, url, body).await?;
                api_result(status, payload)
            }
            Ok(RefreshOutcome::Skipped) => Err(unauthorized(status, payload)),
            Err(err) => {
                warn!(error = %err, "Refresh after unauthorized response failed");
                Err(unauthorized(status, payload))
            }
        }
    }

    /// One run of the periodic refresh. Never fails; the outcome says what
    /// happened.
    pub async fn background_refresh_tick(&self) -> TickOutcome {
        if self.refresh_credentials().await.is_none() {
            return TickOutcome::Skipped;
        }

        match self.refresh(RefreshTrigger::Timer).await {
            Ok(RefreshOutcome::Refreshed) | Ok(RefreshOutcome::Coalesced) => TickOutcome::Refreshed,
            Ok(RefreshOutcome::Skipped) => TickOutcome::Skipped,
            Err(err) => TickOutcome::Failed(err.to_string()),
        }
    }

    pub async fn access_token(&self) -> Option<String> {
        self.session.read().await.access_token().map(str::to_string)
    }

    /// A copy of the cached session.
    pub async fn snapshot(&self) -> Session {
        self.session.read().await.clone()
    }

    pub async fn state(&self) -> SessionState {
        if self.authenticating.load(Ordering::SeqCst) {
            return SessionState::Authenticating;
        }

        let session = self.session.read().await;
        if !session.is_authenticated() {
            return SessionState::Unauthenticated;
        }
        if self.revoked.load(Ordering::SeqCst) {
            return SessionState::Revoked;
        }

        let now = self.clock.now().timestamp();
        if session.expires_within(now, EXPIRING_SOON_MARGIN_SECS) {
            SessionState::ExpiringSoon
        } else {
            SessionState::Authenticated
        }
    }

    async fn refresh_if_expired(&self) {
        let now = self.clock.now().timestamp();
        let expired = self.session.read().await.is_expired_at(now);
        if !expired {
            return;
        }

        if let Err(err) = self.refresh(RefreshTrigger::Expiry).await {
            warn!(error = %err, "Refresh of expired token failed, using the stale token");
        }
    }

    /// The refresh token, if client id, client secret and refresh token are
    /// all present.
    async fn refresh_credentials(&self) -> Option<String> {
        let credentials = &self.config.credentials;
        if credentials.client_id.is_none() || credentials.client_secret.is_none() {
            return None;
        }

        self.session.read().await.refresh_token().map(str::to_string)
    }

    async fn request_token(
        &self,
        mut form: Vec<(&'static str, String)>,
    ) -> Result<TokenGrant, OAuthError> {
        let credentials = &self.config.credentials;
        let mut request = self
            .http
            .post(self.config.token_url())
            .header(ACCEPT, "application/json");

        match self.config.flow {
            FlowVariant::Pkce => match (&credentials.client_id, &credentials.client_secret) {
                (Some(client_id), Some(client_secret)) => {
                    request = request.basic_auth(client_id, Some(client_secret));
                }
                (Some(client_id), None) => form.push(("client_id", client_id.clone())),
                _ => {}
            },
            FlowVariant::ClientSecret => {
                form.push((
                    "client_id",
                    required(&credentials.client_id, "CLIENT_ID")?.to_string(),
                ));
                form.push((
                    "client_secret",
                    required(&credentials.client_secret, "CLIENT_SECRET")?.to_string(),
                ));
            }
        }

        let response = request.form(&form).send().await?;
        let status = response.status();
        let body: Value = response.json().await?;

        let parsed: TokenResponse = serde_json::from_value(body.clone()).unwrap_or_default();
        match parsed.into_grant() {
            Some(grant) if status.is_success() => Ok(grant),
            _ => Err(OAuthError::upstream_auth(status, body)),
        }
    }

    /// Persist first, then swap the cached pair. A storage failure leaves the
    /// cached session as it was.
    async fn install(&self, grant: TokenGrant) -> Result<(), OAuthError> {
        self.store
            .set(StoreKey::Token, &grant.access_token)
            .await?;
        self.store
            .set(StoreKey::RefreshToken, &grant.refresh_token)
            .await?;

        let now = self.clock.now().timestamp();
        self.session.write().await.install(grant, now);
        self.refresh_generation.fetch_add(1, Ordering::SeqCst);
        self.revoked.store(false, Ordering::SeqCst);

        Ok(())
    }

    async fn send_authorized(
        &self,
        method: &Method,
        url: &str,
        body: Option<&Value>,
    ) -> Result<(StatusCode, Value), OAuthError> {
        let token = self.access_token().await.unwrap_or_default();

        let mut request = self
            .http
            .request(method.clone(), url)
            .bearer_auth(token)
            .header(ACCEPT, "application/json")
            .header("revision", &self.config.revision);

        request = match body {
            Some(body) => request.json(body),
            None => request.header(CONTENT_TYPE, "application/json"),
        };

        let response = request.send().await?;
        let status = response.status();
        let bytes = response.bytes().await?;

        let payload = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
        };

        Ok((status, payload))
    }
}

fn required<'a>(value: &'a Option<String>, name: &'static str) -> Result<&'a str, OAuthError> {
    value.as_deref().ok_or(OAuthError::Configuration(name))
}

/// HTTP 401, or the provider's `"code": 401` body convention.
fn is_unauthorized(status: StatusCode, payload: &Value) -> bool {
    if status == StatusCode::UNAUTHORIZED {
        return true;
    }

    match payload.get("code") {
        Some(Value::Number(code)) => code.as_i64() == Some(401),
        Some(Value::String(code)) => code == "401",
        _ => false,
    }
}

fn unauthorized(status: StatusCode, payload: Value) -> OAuthError {
    let status = if status.is_success() {
        StatusCode::UNAUTHORIZED
    } else {
        status
    };
    OAuthError::upstream_api(status, payload)
}

fn api_result(status: StatusCode, payload: Value) -> Result<Value, OAuthError> {
    if is_unauthorized(status, &payload) {
        return Err(unauthorized(status, payload));
    }
    if !status.is_success() {
        return Err(OAuthError::upstream_api(status, payload));
    }
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unauthorized_detection_covers_status_and_body_code() {
        assert!(is_unauthorized(StatusCode::UNAUTHORIZED, &Value::Null));
        assert!(is_unauthorized(StatusCode::OK, &json!({"code": 401})));
        assert!(is_unauthorized(StatusCode::OK, &json!({"code": "401"})));
        assert!(!is_unauthorized(StatusCode::OK, &json!({"code": 403})));
        assert!(!is_unauthorized(StatusCode::FORBIDDEN, &json!({"data": []})));
    }

    #[test]
    fn body_level_401_surfaces_as_unauthorized_status() {
        let err = api_result(StatusCode::OK, json!({"code": 401})).unwrap_err();
        assert!(err.is_unauthorized());
    }

    #[test]
    fn server_errors_keep_their_status() {
        match api_result(StatusCode::SERVICE_UNAVAILABLE, json!({"errors": []})) {
            Err(OAuthError::UpstreamApi { status, .. }) => {
                assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE)
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn trigger_names_are_lowercase() {
        assert_eq!(RefreshTrigger::Unauthorized.to_string(), "unauthorized");
        assert_eq!(RefreshTrigger::Timer.to_string(), "timer");
    }
}
