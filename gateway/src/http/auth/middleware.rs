//! Authentication middleware.

use alloc::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse as _, Response},
};
use tracing::error;

use crate::http::auth::{AuthContext, LayerState, Strategy};

/// Middleware that resolves the identity of a request depending on the
/// configured mode, and hands handlers an [`AuthContext`] with the cluster client
/// acting as it.
pub async fn require(
    State(LayerState { auth }): State<LayerState>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    match auth.strategy {
        Strategy::Disabled { ref client } => {
            req.extensions_mut()
                .insert(AuthContext::service(client.clone()));
            next.run(req).await
        }
        Strategy::Anonymous {
            ref identity,
            ref clients,
            ref factory,
        } => match factory.cached(clients, identity).await {
            Ok(client) => {
                req.extensions_mut().insert(AuthContext::impersonating(
                    identity.clone(),
                    client,
                    Arc::clone(clients),
                ));
                next.run(req).await
            }
            Err(e) => {
                error!(error = %e, %identity, "failed to build cluster client");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "could not create a cluster client",
                )
                    .into_response()
            }
        },
        Strategy::OAuth2(ref authenticator) => authenticator.serve(&auth, req, next).await,
    }
}
