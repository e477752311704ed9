//! Application state shared by all request handlers.

use alloc::sync::Arc;
use core::net::IpAddr;

use eyre::{WrapErr as _, ensure};
use kube::Client;
use tracing::info;

use crate::{
    cluster::{ClientFactory, retry::RetryConfig},
    config::{GatewayConfig, KubernetesConfig},
    http::auth,
};

#[derive(Clone)]
pub struct AppState {
    /// Authentication runtime (mode, cookie key and per-identity clients).
    pub auth: Arc<auth::Runtime>,
    /// The gateway's own, non-impersonating client.
    pub service: Client,
    pub kubernetes: KubernetesConfig,
    pub retry: RetryConfig,
}

/// Builds the state from a loaded configuration.
///
/// The cluster connection is inferred from the environment: in-cluster service
/// account first, then the local kubeconfig.
///
/// # Errors
///
/// Returns an error if no cluster configuration can be found or the auth
/// section is invalid.
#[tracing::instrument(skip_all)]
pub async fn initialize(config: &GatewayConfig) -> eyre::Result<AppState> {
    let base = kube::Config::infer()
        .await
        .wrap_err("Failed to infer the Kubernetes client configuration")?;
    info!(cluster_url = %base.cluster_url, "Using Kubernetes API server");

    let factory = ClientFactory::new(base);
    let service = factory
        .service_client()
        .wrap_err("Failed to build the Kubernetes client")?;
    let auth = auth::Runtime::from_config(&config.auth, factory, service.clone())
        .wrap_err("Invalid auth configuration")?;

    Ok(AppState {
        auth: Arc::new(auth),
        service,
        kubernetes: config.kubernetes.clone(),
        retry: RetryConfig::default(),
    })
}

/// Checks a configuration without connecting to anything.
///
/// # Errors
///
/// The first problem found in the configuration.
pub fn check(config: &GatewayConfig) -> eyre::Result<()> {
    ensure!(
        config.kubernetes.namespace_check_concurrency > 0,
        "kubernetes.namespace_check_concurrency must be at least 1"
    );
    config
        .server
        .bind
        .parse::<IpAddr>()
        .wrap_err_with(|| format!("server.bind '{}' is not an IP address", config.server.bind))?;
    auth::check(&config.auth).wrap_err("Invalid auth configuration")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass_the_check() {
        check(&GatewayConfig::default()).unwrap();
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let config = crate::config::parse("[kubernetes]\nnamespace_check_concurrency = 0").unwrap();
        assert!(check(&config).is_err());
    }

    #[test]
    fn bind_must_be_an_address() {
        let config = crate::config::parse("[server]\nbind = \"localhost:80\"").unwrap();
        assert!(check(&config).is_err());
    }
}
