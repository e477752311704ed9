//! Operator actions on workloads: rollout restart and cron job suspension.
//!
//! Each action is authorized with its own verb (`restart`, `suspend`, `resume`)
//! before the object is read, then applied as a read-modify-replace guarded by
//! the object's `resourceVersion`.

use alloc::collections::BTreeMap;
use core::fmt::Debug;

use k8s_openapi::{
    NamespaceResourceScope,
    api::{
        apps::v1::{DaemonSet, Deployment, StatefulSet},
        batch::v1::CronJob,
        core::v1::PodTemplateSpec,
    },
};
use kube::{Api, Client, Resource, api::PostParams};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tracing::info;

use super::{
    rbac::{AccessReviewer, RbacError, can_act},
    retry::{RetryConfig, is_conflict, retry_with_backoff},
};

/// Annotation whose change makes a controller roll its pods, as `kubectl rollout restart` does.
pub const RESTARTED_AT_ANNOTATION: &str = "kubectl.kubernetes.io/restartedAt";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkloadKind {
    Deployments,
    StatefulSets,
    DaemonSets,
    CronJobs,
}

impl WorkloadKind {
    pub const fn group(self) -> &'static str {
        match self {
            Self::Deployments | Self::StatefulSets | Self::DaemonSets => "apps",
            Self::CronJobs => "batch",
        }
    }

    pub const fn resource(self) -> &'static str {
        match self {
            Self::Deployments => "deployments",
            Self::StatefulSets => "statefulsets",
            Self::DaemonSets => "daemonsets",
            Self::CronJobs => "cronjobs",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkloadAction {
    Restart,
    Suspend,
    Resume,
}

impl WorkloadAction {
    /// RBAC verb that grants this action.
    pub const fn verb(self) -> &'static str {
        match self {
            Self::Restart => "restart",
            Self::Suspend => "suspend",
            Self::Resume => "resume",
        }
    }

    const fn applies_to(self, kind: WorkloadKind) -> bool {
        match self {
            Self::Restart => !matches!(kind, WorkloadKind::CronJobs),
            Self::Suspend | Self::Resume => matches!(kind, WorkloadKind::CronJobs),
        }
    }
}

/// The object an action targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub namespace: String,
    pub kind: WorkloadKind,
    pub name: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error("action '{}' is not supported for {}", .action.verb(), .kind.resource())]
    Unsupported {
        action: WorkloadAction,
        kind: WorkloadKind,
    },
    #[error("{identity} is not allowed to {verb} {resource} '{name}' in namespace '{namespace}'")]
    Forbidden {
        identity: String,
        verb: &'static str,
        resource: &'static str,
        namespace: String,
        name: String,
    },
    #[error(transparent)]
    Rbac(#[from] RbacError),
    #[error("cluster request failed: {0}")]
    Kube(#[from] kube::Error),
}

/// Checks `action` against RBAC and applies it to `target`.
///
/// `identity` only labels the denial message; the decision comes from `reviewer`.
///
/// # Errors
///
/// [`ActionError::Unsupported`] for kind/action combinations that make no sense,
/// [`ActionError::Forbidden`] when RBAC denies the verb (before anything is read,
/// so existence is not disclosed), and any error of the review or the update.
pub async fn perform(
    reviewer: &dyn AccessReviewer,
    client: Client,
    identity: &str,
    target: &Target,
    action: WorkloadAction,
    retry: &RetryConfig,
) -> Result<(), ActionError> {
    let Target {
        ref namespace,
        kind,
        ref name,
    } = *target;
    if !action.applies_to(kind) {
        return Err(ActionError::Unsupported { action, kind });
    }

    let verb = action.verb();
    if !can_act(reviewer, verb, kind.group(), kind.resource(), namespace, name).await? {
        return Err(ActionError::Forbidden {
            identity: identity.to_owned(),
            verb,
            resource: kind.resource(),
            namespace: namespace.clone(),
            name: name.clone(),
        });
    }

    let restarted_at = chrono::Utc::now().to_rfc3339();
    match kind {
        WorkloadKind::Deployments => {
            update::<Deployment, _>(client, namespace, name, retry, |d| {
                if let Some(spec) = d.spec.as_mut() {
                    mark_restarted(&mut spec.template, &restarted_at);
                }
            })
            .await?;
        }
        WorkloadKind::StatefulSets => {
            update::<StatefulSet, _>(client, namespace, name, retry, |s| {
                if let Some(spec) = s.spec.as_mut() {
                    mark_restarted(&mut spec.template, &restarted_at);
                }
            })
            .await?;
        }
        WorkloadKind::DaemonSets => {
            update::<DaemonSet, _>(client, namespace, name, retry, |d| {
                if let Some(spec) = d.spec.as_mut() {
                    mark_restarted(&mut spec.template, &restarted_at);
                }
            })
            .await?;
        }
        WorkloadKind::CronJobs => {
            let suspend = action == WorkloadAction::Suspend;
            update::<CronJob, _>(client, namespace, name, retry, |c| {
                if let Some(spec) = c.spec.as_mut() {
                    spec.suspend = Some(suspend);
                }
            })
            .await?;
        }
    }

    info!(%identity, verb, resource = kind.resource(), %namespace, %name, "workload action applied");
    Ok(())
}

impl ActionError {
    /// Whether the API server rejected the credentials the request was sent with.
    pub fn is_unauthorized(&self) -> bool {
        match *self {
            Self::Rbac(RbacError::Unauthorized(_)) => true,
            Self::Kube(kube::Error::Api(ref response)) => response.code == 401,
            _ => false,
        }
    }
}

fn mark_restarted(template: &mut PodTemplateSpec, at: &str) {
    template
        .metadata
        .get_or_insert_with(Default::default)
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(RESTARTED_AT_ANNOTATION.to_owned(), at.to_owned());
}

/// Reads the object, applies `mutate` and replaces it with the version it was
/// read at. Conflicting writes are retried from a fresh read.
async fn update<K, F>(
    client: Client,
    namespace: &str,
    name: &str,
    retry: &RetryConfig,
    mutate: F,
) -> Result<K, kube::Error>
where
    F: Fn(&mut K),
    K: Resource<Scope = NamespaceResourceScope> + Clone + Debug + Serialize + DeserializeOwned,
    K::DynamicType: Default,
{
    let api: Api<K> = Api::namespaced(client, namespace);
    let api = &api;
    let mutate = &mutate;
    retry_with_backoff(retry, "workload update", is_conflict, || async move {
        let mut object = api.get(name).await?;
        mutate(&mut object);
        api.replace(name, &PostParams::default(), &object).await
    })
    .await
}

#[cfg(test)]
mod tests {
    use kube::Config;

    use super::*;
    use crate::cluster::rbac::tests::FakeReviewer;

    fn client() -> Client {
        crate::install_crypto_provider();
        Client::try_from(Config::new("http://127.0.0.1:1".parse().unwrap())).unwrap()
    }

    fn target(kind: WorkloadKind) -> Target {
        Target {
            namespace: "prod".into(),
            kind,
            name: "web".into(),
        }
    }

    #[test]
    fn parses_path_segments() {
        let kind: WorkloadKind = serde_json::from_str("\"statefulsets\"").unwrap();
        assert_eq!(kind, WorkloadKind::StatefulSets);
        let action: WorkloadAction = serde_json::from_str("\"resume\"").unwrap();
        assert_eq!(action, WorkloadAction::Resume);
        assert!(serde_json::from_str::<WorkloadKind>("\"pods\"").is_err());
    }

    #[test]
    fn restart_sets_annotation() {
        let mut template = PodTemplateSpec::default();
        mark_restarted(&mut template, "2026-01-01T00:00:00Z");
        let annotations = template.metadata.unwrap().annotations.unwrap();
        assert_eq!(
            annotations.get(RESTARTED_AT_ANNOTATION).map(String::as_str),
            Some("2026-01-01T00:00:00Z")
        );
    }

    #[tokio::test]
    async fn suspend_is_only_for_cron_jobs() {
        let reviewer = FakeReviewer::default().answer(Some("prod"), Ok(true));
        let err = perform(
            &reviewer,
            client(),
            "jane",
            &target(WorkloadKind::Deployments),
            WorkloadAction::Suspend,
            &RetryConfig::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ActionError::Unsupported { .. }));
        assert_eq!(reviewer.reviews.load(core::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn denial_names_identity_verb_and_target() {
        let reviewer = FakeReviewer::default();
        let err = perform(
            &reviewer,
            client(),
            "jane",
            &target(WorkloadKind::CronJobs),
            WorkloadAction::Suspend,
            &RetryConfig::default(),
        )
        .await
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "jane is not allowed to suspend cronjobs 'web' in namespace 'prod'"
        );
    }

    #[tokio::test]
    async fn unavailable_review_is_not_a_denial() {
        let reviewer = FakeReviewer::default()
            .answer(Some("prod"), Err(RbacError::Unavailable("timeout".into())));
        let err = perform(
            &reviewer,
            client(),
            "jane",
            &target(WorkloadKind::Deployments),
            WorkloadAction::Restart,
            &RetryConfig::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ActionError::Rbac(RbacError::Unavailable(_))));
    }
}
