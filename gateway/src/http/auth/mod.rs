//! Authentication for the gateway: none, anonymous or OAuth2/OIDC.
//!
//! - none: requests use the gateway's own cluster credentials.
//! - anonymous: every request impersonates one configured identity.
//! - oauth2: authorization code flow with PKCE; the tokens live in an encrypted
//!   session cookie and are verified on every request, see [`oauth2`].

pub mod context;
pub mod cookies;
pub mod middleware;
pub mod oauth2;
pub mod provider;

use alloc::sync::Arc;

use axum::{Router, extract::FromRef, routing::get};
use axum_extra::extract::cookie::Key;
use base64::{Engine as _, engine::general_purpose::STANDARD as base64_gp_STANDARD};
use eyre::{Context as _, ensure};
use kube::Client;
use secrecy::{ExposeSecret as _, SecretString};
use tracing::{info, warn};

use crate::{
    cluster::{ClientFactory, UserClients},
    config::{AuthConfig, AuthMode, OAuth2Config},
    identity::Identity,
    policy::ClaimMapper,
    state::AppState,
};

pub use context::AuthContext;
pub(crate) use middleware::require;
pub use oauth2::Authenticator;
use provider::OidcProvider;

pub struct Runtime {
    pub strategy: Strategy,
    pub cookie_key: Key,
    /// Whether cookies carry the `Secure` attribute.
    pub secure_cookies: bool,
}

/// Resolved authentication mode.
pub enum Strategy {
    Disabled {
        client: Client,
    },
    Anonymous {
        identity: Identity,
        clients: Arc<UserClients>,
        factory: ClientFactory,
    },
    OAuth2(Arc<Authenticator>),
}

impl Runtime {
    pub const fn new(strategy: Strategy, cookie_key: Key, secure_cookies: bool) -> Self {
        Self {
            strategy,
            cookie_key,
            secure_cookies,
        }
    }

    /// Resolves the configured mode.
    ///
    /// `service` is the gateway's own client, used as is when authentication is
    /// disabled. No network calls are made: OIDC discovery happens on first use.
    ///
    /// # Errors
    ///
    /// This function will return an error if:
    /// - The configured `cookie_secret` is not valid base64 or not 64 bytes long
    /// - The anonymous username is empty
    /// - A policy expression does not compile
    /// - The issuer is not a valid URL or the HTTP clients cannot be built
    #[tracing::instrument(skip_all)]
    pub fn from_config(
        cfg: &AuthConfig,
        factory: ClientFactory,
        service: Client,
    ) -> eyre::Result<Self> {
        let cookie_key = setup_cookie_key(cfg.cookie_secret.as_ref())?;
        let (strategy, secure_cookies) = match cfg.mode {
            AuthMode::None => {
                info!("Auth mode: none, requests use the gateway's service account");
                (Strategy::Disabled { client: service }, true)
            }
            AuthMode::Anonymous(ref anonymous) => {
                let identity = anonymous_identity(&anonymous.username, &anonymous.groups)?;
                info!(%identity, "Auth mode: anonymous");
                let strategy = Strategy::Anonymous {
                    identity,
                    clients: Arc::new(UserClients::new()),
                    factory,
                };
                (strategy, true)
            }
            AuthMode::OAuth2(ref oauth2) => {
                let authenticator = build_authenticator(oauth2, factory)?;
                info!(issuer = %oauth2.issuer, client_id = %oauth2.client_id, "Auth mode: oauth2");
                if oauth2.insecure {
                    warn!("auth.insecure is set: cookies are sent without the Secure attribute");
                }
                if cfg.cookie_secret.is_none() {
                    warn!("no auth.cookie_secret configured: sessions end when the gateway restarts");
                }
                (Strategy::OAuth2(Arc::new(authenticator)), !oauth2.insecure)
            }
        };
        Ok(Self::new(strategy, cookie_key, secure_cookies))
    }
}

fn anonymous_identity(username: &str, groups: &[String]) -> eyre::Result<Identity> {
    ensure!(
        !username.trim().is_empty(),
        "auth.username must not be empty in anonymous mode"
    );
    Ok(Identity::new(
        username,
        groups.iter().filter(|g| !g.is_empty()).cloned(),
    ))
}

fn build_authenticator(cfg: &OAuth2Config, factory: ClientFactory) -> eyre::Result<Authenticator> {
    let mapper = ClaimMapper::from_config(cfg).wrap_err("Invalid claim policy")?;
    let provider = OidcProvider::new(cfg).wrap_err("Failed to set up the OIDC provider")?;
    Ok(Authenticator::new(Arc::new(provider), mapper, factory, cfg))
}

/// Validates the auth section without touching the network or the cluster.
///
/// # Errors
///
/// The first problem [`Runtime::from_config`] would fail on.
pub fn check(cfg: &AuthConfig) -> eyre::Result<()> {
    setup_cookie_key(cfg.cookie_secret.as_ref())?;
    match cfg.mode {
        AuthMode::None => {}
        AuthMode::Anonymous(ref anonymous) => {
            anonymous_identity(&anonymous.username, &anonymous.groups)?;
        }
        AuthMode::OAuth2(ref oauth2) => {
            ClaimMapper::from_config(oauth2).wrap_err("Invalid claim policy")?;
            OidcProvider::new(oauth2).wrap_err("Failed to set up the OIDC provider")?;
        }
    }
    Ok(())
}

/// Key for the private cookie jar, from config or freshly generated.
fn setup_cookie_key(cookie_secret: Option<&Arc<SecretString>>) -> eyre::Result<Key> {
    let Some(cookie_secret_val) = cookie_secret else {
        return Ok(Key::generate());
    };
    let bytes = base64_gp_STANDARD
        .decode((*cookie_secret_val).expose_secret().as_bytes())
        .wrap_err("Invalid cookie_secret in config")?;
    Key::try_from(bytes.as_slice())
        .wrap_err("Invalid cookie_secret length in config: expected 64 bytes")
}

/// Login and logout endpoints. They stay reachable without a session.
pub(crate) fn routes() -> Router<AppState> {
    Router::new()
        .route(oauth2::AUTHORIZE_PATH, get(oauth2::authorize))
        .route(oauth2::CALLBACK_PATH, get(oauth2::callback))
        .route(oauth2::LOGOUT_PATH, get(oauth2::logout).post(oauth2::logout))
}

#[derive(Clone)]
pub(crate) struct LayerState {
    pub auth: Arc<Runtime>,
}

impl FromRef<AppState> for LayerState {
    fn from_ref(input: &AppState) -> Self {
        Self {
            auth: Arc::clone(&input.auth),
        }
    }
}

impl FromRef<AppState> for Key {
    fn from_ref(input: &AppState) -> Self {
        input.auth.cookie_key.clone()
    }
}
