use alloc::sync::Arc;
use core::time::Duration;

use axum::{
    Router,
    body::Body,
    http::{
        Request, StatusCode,
        header::{AUTHORIZATION, COOKIE},
    },
    middleware::{self as ax_middleware},
    response::{IntoResponse as _, Redirect, Response},
    routing::{self, IntoMakeService, get},
};
use tower::ServiceBuilder;
use tower_http::{
    ServiceBuilderExt as _, request_id::MakeRequestUuid, timeout::TimeoutLayer, trace::TraceLayer,
};

use crate::{
    http::{api, assets, auth, server::middleware::LevelAdjustingOnFailure},
    state::AppState,
};

use crate::http::server::middleware::secure_headers_middleware;

/// Creates the main application router by merging public and private routes.
///
/// Public routes are the login/logout endpoints, static assets and the health
/// check. Private routes (the UI pages and the API) run behind the auth
/// middleware, which hands each handler an [`auth::AuthContext`].
pub(crate) fn create_app_router(auth_runtime: &Arc<auth::Runtime>) -> Router<AppState> {
    let public = Router::new()
        .merge(auth::routes())
        .merge(assets::routes())
        .route("/healthz", get(|| async { "ok" }));

    let private = Router::new()
        .nest("/api/v1", api::routes())
        .merge(assets::ui_routes())
        .route_layer(ax_middleware::from_fn_with_state(
            auth::LayerState {
                auth: Arc::clone(auth_runtime),
            },
            auth::require,
        ));

    public.merge(private)
}

async fn not_found(req: Request<Body>) -> Response {
    tracing::warn!(method = %req.method(), uri = %req.uri(), "Unhandled request");
    if req.uri().path().starts_with("/api/") {
        (StatusCode::NOT_FOUND, "not found").into_response()
    } else {
        Redirect::to("/").into_response()
    }
}

pub(crate) fn create_app(app_state: AppState) -> IntoMakeService<Router<()>> {
    #[expect(clippy::absolute_paths, reason = "I dont want conditional imports")]
    let middleware_stack = ServiceBuilder::new()
        .sensitive_headers([AUTHORIZATION, COOKIE])
        .set_x_request_id(MakeRequestUuid)
        .propagate_x_request_id()
        .layer(TraceLayer::new_for_http().on_failure(LevelAdjustingOnFailure))
        .layer(cfg_if_expr!(
            #[cfg(feature = "compression-gzip")]
            tower_http::compression::CompressionLayer::new(),
            #[cfg(not)]
            tower::layer::util::Identity::new(),
        ))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(30),
        ))
        .layer(ax_middleware::from_fn(secure_headers_middleware));

    let app = create_app_router(&app_state.auth)
        .with_state(app_state)
        .fallback(routing::any(not_found))
        .layer(middleware_stack);

    app.into_make_service()
}
