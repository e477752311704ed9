//! The console's single-page UI shell.
//!
//! The page itself is served behind the auth middleware so that a lost session
//! is noticed on navigation; the script it loads is public.

use axum::{
    Router,
    http::header::{CACHE_CONTROL, CONTENT_TYPE},
    response::IntoResponse,
    routing::get,
};

use crate::state::AppState;

const INDEX_HTML: &str = include_str!("../../assets/index.html");
const APP_JS: &str = include_str!("../../assets/app.js");

/// Public asset routes.
pub(crate) fn routes() -> Router<AppState> {
    Router::new().route("/assets/app.js", get(serve_app_js))
}

/// UI pages; mounted behind authentication.
pub(crate) fn ui_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(serve_ui))
        .route("/ui", get(serve_ui))
        .route("/ui/{*path}", get(serve_ui))
}

pub(crate) async fn serve_ui() -> impl IntoResponse {
    (
        [
            (CONTENT_TYPE, "text/html; charset=utf-8"),
            (CACHE_CONTROL, "no-store"),
        ],
        INDEX_HTML,
    )
}

async fn serve_app_js() -> impl IntoResponse {
    (
        [(CONTENT_TYPE, "application/javascript; charset=utf-8")],
        APP_JS,
    )
}
