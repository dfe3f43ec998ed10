use std::collections::BTreeMap;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Redirect},
    routing::get,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::{
    api::{fetch_collection, Collection},
    errors::OAuthError,
    oauth::{RefreshOutcome, RefreshTrigger},
    state::AppState,
    summary::summarize,
};

/// Build the application router with all routes
pub fn routes(app_state: AppState) -> axum::Router {
    axum::Router::new()
        // OAuth flow
        .route("/login", get(login))
        .route("/callback", get(callback))
        .route("/refresh", get(refresh))
        .route("/logged-in", get(logged_in))
        // Upstream proxies
        .route("/get-lists", get(get_lists))
        .route("/get-lists/summary", get(get_lists_summary))
        .route("/get-metrics", get(get_metrics))
        .route("/get-profiles", get(get_profiles))
        // Dashboard bundle
        .fallback(crate::static_assets::serve_static_file)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(app_state)
}

#[derive(Debug, Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

/// First step of the OAuth flow: hand the dashboard the authorize URL.
async fn login(State(state): State<AppState>) -> Result<Json<Value>, OAuthError> {
    let redirect = state.session.begin_authorization()?;
    Ok(Json(json!({ "redirect": redirect })))
}

/// Second step: the provider sends the user back here with a code.
async fn callback(
    State(state): State<AppState>,
    Query(params): Query<CallbackParams>,
) -> Result<Redirect, OAuthError> {
    if let Some(error) = params.error {
        return Err(OAuthError::upstream_auth(
            StatusCode::BAD_REQUEST,
            json!({
                "error": error,
                "error_description": params.error_description,
            }),
        ));
    }

    let code = params.code.ok_or(OAuthError::MissingCode)?;

    state
        .session
        .complete_authorization(&code, params.state.as_deref())
        .await?;

    Ok(Redirect::to("/"))
}

async fn refresh(State(state): State<AppState>) -> Result<Redirect, OAuthError> {
    match state.session.refresh(RefreshTrigger::Manual).await? {
        RefreshOutcome::Skipped => info!("Manual refresh requested without a refresh token"),
        RefreshOutcome::Refreshed | RefreshOutcome::Coalesced => {}
    }

    Ok(Redirect::to("/"))
}

/// `{"token": "<access token>"}` or `{"token": false}` for the dashboard.
async fn logged_in(State(state): State<AppState>) -> Json<Value> {
    let token = state
        .session
        .access_token()
        .await
        .map(Value::String)
        .unwrap_or(Value::Bool(false));

    Json(json!({ "token": token }))
}

async fn get_lists(State(state): State<AppState>) -> Result<impl IntoResponse, OAuthError> {
    proxy(&state, Collection::Lists).await
}

async fn get_metrics(State(state): State<AppState>) -> Result<impl IntoResponse, OAuthError> {
    proxy(&state, Collection::Metrics).await
}

async fn get_profiles(State(state): State<AppState>) -> Result<impl IntoResponse, OAuthError> {
    proxy(&state, Collection::Profiles).await
}

async fn get_lists_summary(
    State(state): State<AppState>,
) -> Result<Json<BTreeMap<&'static str, crate::summary::SummarySeries>>, OAuthError> {
    let lists = fetch_collection(&state.session, Collection::Lists, state.page_options()).await?;

    let mut series = BTreeMap::new();
    series.insert("name", summarize(&lists, "name", "List Name"));

    Ok(Json(series))
}

async fn proxy(state: &AppState, collection: Collection) -> Result<Json<Vec<Value>>, OAuthError> {
    let records = fetch_collection(&state.session, collection, state.page_options()).await?;
    Ok(Json(records))
}
