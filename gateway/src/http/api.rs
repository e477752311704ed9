//! Console API: identity, namespace access and workload actions.
//!
//! Every handler runs behind the auth middleware and talks to the cluster only
//! through the client in its [`AuthContext`].

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use tracing::{error, warn};

use crate::{
    cluster::{
        KubeReviewer, NamespaceAccess, RbacError,
        actions::{self, ActionError, Target, WorkloadAction, WorkloadKind},
        rbac::list_accessible_namespaces,
    },
    http::auth::AuthContext,
    identity::Identity,
    state::AppState,
};

pub(crate) fn routes() -> Router<AppState> {
    Router::new()
        .route("/whoami", get(whoami))
        .route("/namespaces", get(namespaces))
        .route(
            "/workloads/{namespace}/{kind}/{name}/{action}",
            post(workload_action),
        )
}

/// Error answer of the API: a status code and a plain-text message.
#[derive(Debug)]
pub(crate) struct ApiError {
    status: StatusCode,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, self.message).into_response()
    }
}

impl From<RbacError> for ApiError {
    fn from(e: RbacError) -> Self {
        let status = match e {
            RbacError::Unavailable(_) | RbacError::Unauthorized(_) => StatusCode::BAD_GATEWAY,
            RbacError::Review(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: e.to_string(),
        }
    }
}

impl From<ActionError> for ApiError {
    fn from(e: ActionError) -> Self {
        let status = match e {
            ActionError::Unsupported { .. } => StatusCode::BAD_REQUEST,
            ActionError::Forbidden { .. } => StatusCode::FORBIDDEN,
            ActionError::Rbac(rbac) => return rbac.into(),
            ActionError::Kube(kube::Error::Api(ref response)) => {
                StatusCode::from_u16(response.code).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            ActionError::Kube(_) => StatusCode::BAD_GATEWAY,
        };
        Self {
            status,
            message: e.to_string(),
        }
    }
}

async fn whoami(ctx: AuthContext) -> Json<Option<Identity>> {
    Json(ctx.identity)
}

#[derive(Debug, Deserialize)]
struct NamespacesQuery {
    #[serde(default)]
    group: String,
    resource: String,
}

async fn namespaces(
    State(state): State<AppState>,
    ctx: AuthContext,
    Query(NamespacesQuery { group, resource }): Query<NamespacesQuery>,
) -> Result<Json<NamespaceAccess>, ApiError> {
    let reviewer = KubeReviewer::new(ctx.client.clone(), state.service.clone());
    let access = list_accessible_namespaces(
        &reviewer,
        &group,
        &resource,
        state.kubernetes.namespace_check_concurrency,
    )
    .await;

    match access {
        Ok(access) => Ok(Json(access)),
        Err(e) => {
            if matches!(e, RbacError::Unauthorized(_)) {
                ctx.forget_client().await;
            }
            warn!(error = %e, acting_as = ctx.acting_as(), %group, %resource, "namespace access lookup failed");
            Err(e.into())
        }
    }
}

async fn workload_action(
    State(state): State<AppState>,
    ctx: AuthContext,
    Path((namespace, kind, name, action)): Path<(String, WorkloadKind, String, WorkloadAction)>,
) -> Result<StatusCode, ApiError> {
    let reviewer = KubeReviewer::new(ctx.client.clone(), state.service.clone());
    let target = Target {
        namespace,
        kind,
        name,
    };
    let result = actions::perform(
        &reviewer,
        ctx.client.clone(),
        ctx.acting_as(),
        &target,
        action,
        &state.retry,
    )
    .await;

    match result {
        Ok(()) => Ok(StatusCode::NO_CONTENT),
        Err(e) => {
            if e.is_unauthorized() {
                ctx.forget_client().await;
            }
            match e {
                ActionError::Forbidden { .. } | ActionError::Unsupported { .. } => {
                    warn!(error = %e, "workload action refused");
                }
                _ => error!(error = %e, ?target, "workload action failed"),
            }
            Err(e.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use alloc::sync::Arc;

    use axum::{body::Body, http::Request};
    use axum_extra::extract::cookie::Key;
    use kube::{Config, core::ErrorResponse};
    use tower::ServiceExt as _;

    use super::*;
    use crate::{
        cluster::{ClientFactory, retry::RetryConfig},
        config::KubernetesConfig,
        http::{
            auth::{Runtime, Strategy},
            server::router::create_app_router,
        },
    };

    fn app() -> Router {
        crate::install_crypto_provider();
        let factory = ClientFactory::new(Config::new("http://127.0.0.1:1".parse().unwrap()));
        let service = factory.service_client().unwrap();
        let auth = Arc::new(Runtime::new(
            Strategy::Disabled {
                client: service.clone(),
            },
            Key::generate(),
            true,
        ));
        let state = AppState {
            auth,
            service,
            kubernetes: KubernetesConfig::default(),
            retry: RetryConfig::default(),
        };
        create_app_router(&state.auth).with_state(state)
    }

    async fn send(method: &str, uri: &str) -> Response {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        app().oneshot(request).await.unwrap()
    }

    #[tokio::test]
    async fn unreachable_api_server_is_not_reported_as_denied() {
        let response = send("GET", "/api/v1/namespaces?group=apps&resource=deployments").await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn namespaces_requires_resource() {
        let response = send("GET", "/api/v1/namespaces?group=apps").await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unsupported_action_is_rejected_before_any_review() {
        let response = send("POST", "/api/v1/workloads/team-a/deployments/web/suspend").await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_workload_kind_is_rejected() {
        let response = send("POST", "/api/v1/workloads/team-a/pods/web/restart").await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn action_review_against_unreachable_api_server_is_bad_gateway() {
        let response = send("POST", "/api/v1/workloads/team-a/deployments/web/restart").await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".into(),
            message: "boom".into(),
            reason: String::new(),
            code,
        })
    }

    #[test]
    fn kubernetes_status_codes_pass_through() {
        for code in [404, 409, 422] {
            let err = ApiError::from(ActionError::Kube(api_error(code)));
            assert_eq!(err.status.as_u16(), code);
        }
    }

    #[test]
    fn denials_name_identity_verb_and_target() {
        let err = ApiError::from(ActionError::Forbidden {
            identity: "jane@example.com".into(),
            verb: "restart",
            resource: "deployments",
            namespace: "team-a".into(),
            name: "web".into(),
        });
        assert_eq!(err.status, StatusCode::FORBIDDEN);
        assert_eq!(
            err.message,
            "jane@example.com is not allowed to restart deployments 'web' in namespace 'team-a'"
        );
    }

    #[test]
    fn infrastructure_failures_are_bad_gateway() {
        let unavailable = ApiError::from(RbacError::from(api_error(503)));
        assert_eq!(unavailable.status, StatusCode::BAD_GATEWAY);
        let rejected = ApiError::from(ActionError::Rbac(RbacError::from(api_error(401))));
        assert_eq!(rejected.status, StatusCode::BAD_GATEWAY);
        let review = ApiError::from(RbacError::Review("bad request".into()));
        assert_eq!(review.status, StatusCode::INTERNAL_SERVER_ERROR);
    }
}
