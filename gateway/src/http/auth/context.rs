//! Per-request authentication result handed to API handlers.

use alloc::sync::Arc;

use axum::{
    extract::FromRequestParts,
    http::{StatusCode, request::Parts},
};
use kube::Client;

use crate::{cluster::UserClients, identity::Identity};

/// Who the request acts as, and the only cluster client it may use.
///
/// Inserted into the request extensions by [`super::require`].
#[derive(Clone)]
pub struct AuthContext {
    /// `None` when authentication is disabled and requests use the gateway's
    /// own credentials.
    pub identity: Option<Identity>,
    pub client: Client,
    cache: Option<Arc<UserClients>>,
}

impl AuthContext {
    pub(crate) const fn service(client: Client) -> Self {
        Self {
            identity: None,
            client,
            cache: None,
        }
    }

    pub(crate) const fn impersonating(
        identity: Identity,
        client: Client,
        cache: Arc<UserClients>,
    ) -> Self {
        Self {
            identity: Some(identity),
            client,
            cache: Some(cache),
        }
    }

    /// Name used in messages about this request's permissions.
    pub fn acting_as(&self) -> &str {
        self.identity
            .as_ref()
            .map_or("the gateway service account", |identity| {
                identity.username.as_str()
            })
    }

    /// Drops the cached client of this identity, e.g. after the API server
    /// rejected its credentials.
    pub async fn forget_client(&self) {
        if let (Some(cache), Some(identity)) = (self.cache.as_ref(), self.identity.as_ref()) {
            cache.invalidate(&identity.key()).await;
        }
    }
}

impl<S: Send + Sync> FromRequestParts<S> for AuthContext {
    type Rejection = (StatusCode, &'static str);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Self>()
            .cloned()
            .ok_or((StatusCode::UNAUTHORIZED, "unauthorized"))
    }
}
