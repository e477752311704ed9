//! Per-identity cluster clients.
//!
//! Every distinct [`IdentityKey`] gets exactly one client, built on first use and
//! shared by all requests acting as that identity. Concurrent first requests for
//! the same key wait for a single construction instead of racing.

use alloc::sync::Arc;
use core::future::Future;
use std::collections::HashMap;

use kube::{Client, Config};
use tokio::sync::{OnceCell, RwLock};

use crate::identity::{Identity, IdentityKey};

/// Compute-once-per-key cache.
///
/// A failed construction leaves the slot empty, so the next caller retries it.
#[derive(Debug)]
pub struct ClientCache<T> {
    entries: RwLock<HashMap<IdentityKey, Arc<OnceCell<T>>>>,
}

impl<T> Default for ClientCache<T> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl<T: Clone> ClientCache<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the value for `key`, running `init` if there is none yet.
    ///
    /// At most one `init` per key runs at a time; callers that arrive while it runs
    /// observe its result.
    ///
    /// # Errors
    ///
    /// Returns the error of `init`. Nothing is stored in that case.
    pub async fn get_or_try_init<F, Fut, E>(&self, key: &IdentityKey, init: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let cell = self.cell(key).await;
        cell.get_or_try_init(init).await.cloned()
    }

    async fn cell(&self, key: &IdentityKey) -> Arc<OnceCell<T>> {
        if let Some(cell) = self.entries.read().await.get(key) {
            return Arc::clone(cell);
        }
        let mut entries = self.entries.write().await;
        Arc::clone(entries.entry(key.clone()).or_default())
    }

    /// Drops the value for `key`; the next request builds a fresh one.
    pub async fn invalidate(&self, key: &IdentityKey) {
        if self.entries.write().await.remove(key).is_some() {
            tracing::debug!(key = %key.as_str().escape_debug(), "dropped cached client");
        }
    }

    /// Number of identities with a constructed value.
    pub async fn len(&self) -> usize {
        self.entries
            .read()
            .await
            .values()
            .filter(|cell| cell.initialized())
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Cache of impersonating clients keyed by identity.
pub type UserClients = ClientCache<Client>;

/// Builds clients that act as a given identity through impersonation.
#[derive(Clone)]
pub struct ClientFactory {
    base: Config,
}

impl ClientFactory {
    /// `base` carries the gateway's own credentials.
    pub const fn new(base: Config) -> Self {
        Self { base }
    }

    /// Client for the gateway's own service identity, without impersonation.
    ///
    /// # Errors
    ///
    /// Fails if the TLS or HTTP stack cannot be set up from the base config.
    pub fn service_client(&self) -> kube::Result<Client> {
        Client::try_from(self.base.clone())
    }

    fn config_for(&self, identity: &Identity) -> Config {
        let mut config = self.base.clone();
        config.auth_info.impersonate = Some(identity.username.clone());
        config.auth_info.impersonate_groups = if identity.groups.is_empty() {
            None
        } else {
            Some(identity.groups.iter().cloned().collect())
        };
        config
    }

    /// Client that sends every request as `identity`.
    ///
    /// # Errors
    ///
    /// Fails if the TLS or HTTP stack cannot be set up from the base config.
    pub fn build(&self, identity: &Identity) -> kube::Result<Client> {
        Client::try_from(self.config_for(identity))
    }

    /// Looks up or builds the client for `identity` in `cache`.
    ///
    /// # Errors
    ///
    /// As [`ClientFactory::build`].
    pub async fn cached(&self, cache: &UserClients, identity: &Identity) -> kube::Result<Client> {
        cache
            .get_or_try_init(&identity.key(), || async {
                tracing::info!(%identity, "building impersonating cluster client");
                self.build(identity)
            })
            .await
    }
}
