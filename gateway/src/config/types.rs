//! Configuration data types.
//!
//! ```toml
//! [server]
//! port = 8080
//! bind = "0.0.0.0"
//!
//! [auth]
//! mode = "oauth2"
//! issuer = "https://login.example.com/realms/ops"
//! client_id = "kubeconsole"
//! client_secret = "..."
//!
//! [[auth.variables]]
//! name = "email"
//! expression = "claims.email.lowerAscii()"
//!
//! [[auth.validations]]
//! expression = "claims.email_verified"
//! message = "email address is not verified"
//!
//! [auth.impersonation]
//! username = "email"
//! groups = "claims.groups.map(g, 'oidc:' + g)"
//! ```

use alloc::sync::Arc;

use secrecy::SecretString;
use serde::Deserialize;

/// Root of the configuration file.
#[derive(Debug, Deserialize, Default, Clone)]
pub struct GatewayConfig {
    #[serde(default)]
    pub server: ServerConfig,
    /// Authentication configuration (defaults to no auth when omitted).
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub kubernetes: KubernetesConfig,
}

/// HTTP listener settings.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind: default_bind(),
        }
    }
}

const fn default_port() -> u16 {
    8080
}

fn default_bind() -> String {
    "127.0.0.1".to_owned()
}

/// Authentication configuration wrapper.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct AuthConfig {
    #[serde(flatten)]
    pub mode: AuthMode,
    /// Optional base64-encoded cookie key (64 bytes). If omitted, a random key is
    /// generated on startup and sessions do not survive a restart.
    #[serde(default)]
    pub cookie_secret: Option<Arc<SecretString>>,
}

/// Supported authentication modes.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum AuthMode {
    /// No authentication; cluster calls use the gateway's own credentials.
    #[default]
    None,
    /// Every request acts as one fixed identity.
    Anonymous(AnonymousConfig),
    /// OpenID Connect authorization code flow.
    OAuth2(OAuth2Config),
}

#[derive(Debug, Deserialize, Clone)]
pub struct AnonymousConfig {
    pub username: String,
    #[serde(default)]
    pub groups: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct OAuth2Config {
    pub issuer: String,
    pub client_id: String,
    pub client_secret: Arc<SecretString>,
    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,
    /// Lifetime of the session cookie.
    #[serde(default = "default_session_duration_secs")]
    pub session_duration_secs: u64,
    /// Drops the `Secure` attribute from cookies. Only for plain-HTTP testing.
    #[serde(default)]
    pub insecure: bool,
    /// Absolute callback URL registered with the provider. Computed from the
    /// request's `Host` / `X-Forwarded-*` headers when omitted.
    #[serde(default)]
    pub redirect_url: Option<String>,
    /// Display name handed to the UI in the `auth-provider` cookie.
    #[serde(default = "default_provider_name")]
    pub provider_name: String,
    #[serde(default = "default_discovery_ttl_secs")]
    pub discovery_ttl_secs: u64,
    #[serde(default)]
    pub variables: Vec<VariableConfig>,
    #[serde(default)]
    pub validations: Vec<ValidationConfig>,
    #[serde(default)]
    pub impersonation: ImpersonationConfig,
}

fn default_scopes() -> Vec<String> {
    vec!["openid".to_owned(), "profile".to_owned(), "email".to_owned()]
}

const fn default_session_duration_secs() -> u64 {
    24 * 60 * 60
}

fn default_provider_name() -> String {
    "oidc".to_owned()
}

const fn default_discovery_ttl_secs() -> u64 {
    300
}

/// A named value computed from the claims and visible to later expressions.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct VariableConfig {
    pub name: String,
    pub expression: String,
}

/// An admission check; `message` is shown to the user when it does not hold.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct ValidationConfig {
    pub expression: String,
    pub message: String,
}

/// Expressions producing the impersonated username (string) and groups (list of strings).
#[derive(Debug, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct ImpersonationConfig {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub groups: Option<String>,
}

/// Settings for talking to the cluster.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct KubernetesConfig {
    /// Upper bound of concurrent per-namespace access reviews.
    #[serde(default = "default_namespace_check_concurrency")]
    pub namespace_check_concurrency: usize,
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        Self {
            namespace_check_concurrency: default_namespace_check_concurrency(),
        }
    }
}

const fn default_namespace_check_concurrency() -> usize {
    6
}
