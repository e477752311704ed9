//! Authorization questions answered by the cluster's own RBAC.
//!
//! Every check is a `SelfSubjectAccessReview` sent with the impersonating client,
//! so the API server evaluates it for the request's identity. Custom verbs such
//! as `restart` or `suspend` are checked the same way: they only exist in the
//! roles operators write for this console, the API server itself never uses them.

use alloc::collections::BTreeSet;

use async_trait::async_trait;
use futures::{StreamExt as _, stream};
use k8s_openapi::api::{
    authorization::v1::{ResourceAttributes, SelfSubjectAccessReview, SelfSubjectAccessReviewSpec},
    core::v1::Namespace,
};
use kube::{
    Api, Client,
    api::{ListParams, PostParams},
};
use serde::Serialize;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RbacError {
    /// The API server could not answer (5xx, throttling, transport failure).
    #[error("authorization service unavailable: {0}")]
    Unavailable(String),
    /// The API server rejected the gateway's own credentials.
    #[error("cluster credentials rejected: {0}")]
    Unauthorized(String),
    #[error("access review failed: {0}")]
    Review(String),
}

impl From<kube::Error> for RbacError {
    fn from(error: kube::Error) -> Self {
        match error {
            kube::Error::Api(ref response) if response.code >= 500 || response.code == 429 => {
                Self::Unavailable(error.to_string())
            }
            kube::Error::Api(ref response) if response.code == 401 => {
                Self::Unauthorized(error.to_string())
            }
            kube::Error::HyperError(_) | kube::Error::Service(_) => {
                Self::Unavailable(error.to_string())
            }
            _ => Self::Review(error.to_string()),
        }
    }
}

impl RbacError {
    /// Whether the failure says nothing about the identity's permissions and
    /// must not be read as a denial.
    pub const fn is_infrastructure(&self) -> bool {
        matches!(*self, Self::Unavailable(_) | Self::Unauthorized(_))
    }
}

/// Source of access decisions for one identity.
#[async_trait]
pub trait AccessReviewer: Send + Sync {
    /// Whether the identity may perform the described request.
    async fn allowed(&self, attributes: ResourceAttributes) -> Result<bool, RbacError>;

    /// Names of all namespaces in the cluster.
    async fn namespaces(&self) -> Result<Vec<String>, RbacError>;
}

/// [`AccessReviewer`] backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeReviewer {
    /// Impersonating client; reviews are evaluated for its identity.
    user: Client,
    /// The gateway's own client, used to enumerate namespaces.
    service: Client,
}

impl KubeReviewer {
    pub const fn new(user: Client, service: Client) -> Self {
        Self { user, service }
    }
}

#[async_trait]
impl AccessReviewer for KubeReviewer {
    async fn allowed(&self, attributes: ResourceAttributes) -> Result<bool, RbacError> {
        let review = SelfSubjectAccessReview {
            spec: SelfSubjectAccessReviewSpec {
                resource_attributes: Some(attributes),
                ..Default::default()
            },
            ..Default::default()
        };
        let api: Api<SelfSubjectAccessReview> = Api::all(self.user.clone());
        let answered = api.create(&PostParams::default(), &review).await?;
        Ok(answered.status.is_some_and(|status| status.allowed))
    }

    async fn namespaces(&self) -> Result<Vec<String>, RbacError> {
        let api: Api<Namespace> = Api::all(self.service.clone());
        let list = api.list(&ListParams::default()).await?;
        Ok(list
            .items
            .into_iter()
            .filter_map(|namespace| namespace.metadata.name)
            .collect())
    }
}

/// Namespaces an identity may read a resource type in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceAccess {
    /// Explicitly accessible namespaces; empty when `all_namespaces` is set.
    pub namespaces: BTreeSet<String>,
    pub all_namespaces: bool,
}

fn list_attributes(group: &str, resource: &str, namespace: Option<String>) -> ResourceAttributes {
    ResourceAttributes {
        verb: Some("list".to_owned()),
        group: Some(group.to_owned()),
        resource: Some(resource.to_owned()),
        namespace,
        ..Default::default()
    }
}

/// Works out where the reviewer's identity may list `group`/`resource`.
///
/// A cluster-wide grant is answered with a single review. Otherwise every
/// namespace is reviewed, at most `concurrency` at a time. A namespace whose
/// review fails counts as inaccessible, unless the failure means the API server
/// is unavailable or rejected the gateway's credentials.
///
/// # Errors
///
/// Any infrastructure error from a review, and any error while listing namespaces.
pub async fn list_accessible_namespaces(
    reviewer: &dyn AccessReviewer,
    group: &str,
    resource: &str,
    concurrency: usize,
) -> Result<NamespaceAccess, RbacError> {
    if reviewer
        .allowed(list_attributes(group, resource, None))
        .await?
    {
        return Ok(NamespaceAccess {
            namespaces: BTreeSet::new(),
            all_namespaces: true,
        });
    }

    let names = reviewer.namespaces().await?;
    let mut checks = stream::iter(names)
        .map(|namespace| async move {
            let attributes = list_attributes(group, resource, Some(namespace.clone()));
            let result = reviewer.allowed(attributes).await;
            (namespace, result)
        })
        .buffer_unordered(concurrency.max(1));

    let mut namespaces = BTreeSet::new();
    while let Some((namespace, result)) = checks.next().await {
        match result {
            Ok(true) => {
                namespaces.insert(namespace);
            }
            Ok(false) => {}
            Err(e) if e.is_infrastructure() => return Err(e),
            Err(e) => {
                warn!(%namespace, error = %e, "namespace access review failed, treating as no access");
            }
        }
    }
    debug!(group, resource, accessible = namespaces.len(), "namespace access resolved");

    Ok(NamespaceAccess {
        namespaces,
        all_namespaces: false,
    })
}

/// Whether the reviewer's identity may perform `verb` on one object.
///
/// # Errors
///
/// Any error from the access review.
pub async fn can_act(
    reviewer: &dyn AccessReviewer,
    verb: &str,
    group: &str,
    resource: &str,
    namespace: &str,
    name: &str,
) -> Result<bool, RbacError> {
    reviewer
        .allowed(ResourceAttributes {
            verb: Some(verb.to_owned()),
            group: Some(group.to_owned()),
            resource: Some(resource.to_owned()),
            namespace: Some(namespace.to_owned()),
            name: Some(name.to_owned()),
            ..Default::default()
        })
        .await
}

#[cfg(test)]
pub(crate) mod tests {
    use core::sync::atomic::{AtomicUsize, Ordering};
    use std::collections::HashMap;

    use kube::core::ErrorResponse;

    use super::*;

    /// Scripted reviewer: answers per namespace, `None` key for cluster scope.
    #[derive(Default)]
    pub(crate) struct FakeReviewer {
        pub answers: HashMap<Option<String>, Result<bool, RbacError>>,
        pub namespaces: Vec<String>,
        pub reviews: AtomicUsize,
    }

    impl FakeReviewer {
        pub(crate) fn answer(mut self, namespace: Option<&str>, answer: Result<bool, RbacError>) -> Self {
            self.answers.insert(namespace.map(str::to_owned), answer);
            self
        }
    }

    #[async_trait]
    impl AccessReviewer for FakeReviewer {
        async fn allowed(&self, attributes: ResourceAttributes) -> Result<bool, RbacError> {
            self.reviews.fetch_add(1, Ordering::SeqCst);
            self.answers
                .get(&attributes.namespace)
                .cloned()
                .unwrap_or(Ok(false))
        }

        async fn namespaces(&self) -> Result<Vec<String>, RbacError> {
            Ok(self.namespaces.clone())
        }
    }

    fn cluster(namespaces: &[&str]) -> FakeReviewer {
        FakeReviewer {
            namespaces: namespaces.iter().map(|&n| n.to_owned()).collect(),
            ..FakeReviewer::default()
        }
    }

    #[tokio::test]
    async fn cluster_wide_grant_skips_per_namespace_checks() {
        let reviewer = cluster(&["a", "b", "c"]).answer(None, Ok(true));
        let access = list_accessible_namespaces(&reviewer, "apps", "deployments", 4)
            .await
            .unwrap();
        assert!(access.all_namespaces);
        assert!(access.namespaces.is_empty());
        assert_eq!(reviewer.reviews.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn returns_exactly_the_allowed_namespaces() {
        let reviewer = cluster(&["a", "b", "c", "d"])
            .answer(Some("a"), Ok(true))
            .answer(Some("c"), Ok(true));
        let access = list_accessible_namespaces(&reviewer, "apps", "deployments", 2)
            .await
            .unwrap();
        assert!(!access.all_namespaces);
        assert_eq!(
            access.namespaces.into_iter().collect::<Vec<_>>(),
            vec!["a".to_owned(), "c".to_owned()]
        );
        assert_eq!(reviewer.reviews.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn unavailable_review_aborts_enumeration() {
        let reviewer = cluster(&["a", "b", "c"])
            .answer(Some("a"), Ok(true))
            .answer(Some("b"), Err(RbacError::Unavailable("503".into())));
        let err = list_accessible_namespaces(&reviewer, "", "pods", 6)
            .await
            .unwrap_err();
        assert!(matches!(err, RbacError::Unavailable(_)));
    }

    #[tokio::test]
    async fn rejected_credentials_abort_enumeration() {
        let reviewer = cluster(&["a", "b"])
            .answer(Some("b"), Err(RbacError::Unauthorized("401".into())));
        let err = list_accessible_namespaces(&reviewer, "", "pods", 6)
            .await
            .unwrap_err();
        assert!(matches!(err, RbacError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn other_review_errors_mean_no_access() {
        let reviewer = cluster(&["a", "b"])
            .answer(Some("a"), Ok(true))
            .answer(Some("b"), Err(RbacError::Review("bad request".into())));
        let access = list_accessible_namespaces(&reviewer, "", "pods", 6)
            .await
            .unwrap();
        assert_eq!(access.namespaces.len(), 1);
    }

    #[tokio::test]
    async fn can_act_reviews_the_custom_verb() {
        let reviewer = FakeReviewer::default().answer(Some("prod"), Ok(true));
        assert!(
            can_act(&reviewer, "restart", "apps", "deployments", "prod", "web")
                .await
                .unwrap()
        );
        assert!(
            !can_act(&reviewer, "restart", "apps", "deployments", "dev", "web")
                .await
                .unwrap()
        );
    }

    #[test]
    fn classifies_kube_errors() {
        let api = |code| {
            kube::Error::Api(ErrorResponse {
                status: "Failure".into(),
                message: String::new(),
                reason: String::new(),
                code,
            })
        };
        assert!(matches!(RbacError::from(api(503)), RbacError::Unavailable(_)));
        assert!(matches!(RbacError::from(api(429)), RbacError::Unavailable(_)));
        assert!(matches!(RbacError::from(api(401)), RbacError::Unauthorized(_)));
        assert!(matches!(RbacError::from(api(400)), RbacError::Review(_)));
    }
}
