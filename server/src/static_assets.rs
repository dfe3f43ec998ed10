use axum::{
    extract::State,
    http::{header, StatusCode, Uri},
    response::IntoResponse,
};
use mime_guess::from_path;

use crate::state::AppState;

// Serve the prebuilt dashboard bundle from the configured directory
pub async fn serve_static_file(State(state): State<AppState>, uri: Uri) -> impl IntoResponse {
    let path = uri.path().trim_start_matches('/');
    let path = if path.is_empty() { "index.html" } else { path };

    if path.split('/').any(|segment| segment == "..") {
        return StatusCode::NOT_FOUND.into_response();
    }

    match tokio::fs::read(state.config.static_dir.join(path)).await {
        Ok(contents) => {
            let mime_type = from_path(path).first_or_octet_stream().to_string();

            // Hashed assets can be cached forever, the entry point cannot
            let cache_control = if path == "index.html" {
                "no-cache"
            } else {
                "public, max-age=31536000"
            };

            (
                [
                    (header::CONTENT_TYPE, mime_type),
                    (header::CACHE_CONTROL, cache_control.to_string()),
                ],
                contents,
            )
                .into_response()
        }
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}
