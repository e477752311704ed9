//! OpenID Connect provider client.
//!
//! Provider metadata and signing keys come from discovery and are cached for
//! `discovery_ttl_secs`. A signature that does not verify against the cached
//! keys triggers one rediscovery before the token is rejected, so key rotation
//! at the provider does not log everybody out.

use alloc::sync::Arc;
use core::{str::FromStr as _, time::Duration};
use std::time::Instant;

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use eyre::WrapErr as _;
use oauth2_reqwest::ReqwestClient;
use openidconnect::{
    AuthorizationCode, ClaimsVerificationError, ClientId, ClientSecret, CsrfToken,
    EndpointMaybeSet, EndpointNotSet, EndpointSet, IssuerUrl, Nonce, OAuth2TokenResponse as _,
    PkceCodeChallenge, PkceCodeVerifier, RedirectUrl, RefreshToken, RequestTokenError, Scope,
    core::{
        CoreAuthenticationFlow, CoreClient, CoreIdToken, CoreProviderMetadata, CoreTokenResponse,
    },
};
use reqwest::redirect::Policy;
use secrecy::{ExposeSecret as _, SecretString};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::{config::OAuth2Config, policy::Claims};

/// Applies to every request made to the provider.
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    /// The token is malformed, expired, or not signed by the provider.
    #[error("token verification failed: {0}")]
    Verification(String),
    /// The provider refused a code or refresh token exchange.
    #[error("token exchange failed: {0}")]
    Exchange(String),
    /// Discovery or a token request could not reach the provider.
    #[error("identity provider unavailable: {0}")]
    Unavailable(String),
}

/// Everything the browser round trip to the provider needs.
#[derive(Debug, Clone)]
pub struct AuthorizationRequest {
    pub url: String,
    pub state: String,
    pub nonce: String,
    pub pkce_verifier: String,
}

/// Result of a successful code or refresh token exchange.
pub struct Tokens {
    /// Raw, verified ID token.
    pub id_token: String,
    pub refresh_token: Option<String>,
    /// Payload of `id_token`.
    pub claims: Claims,
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Starts a login that returns to `redirect_url`.
    async fn authorize(&self, redirect_url: &str) -> Result<AuthorizationRequest, ProviderError>;

    /// Redeems an authorization code. The returned ID token must carry `nonce`.
    async fn exchange_code(
        &self,
        code: &str,
        pkce_verifier: &str,
        nonce: &str,
        redirect_url: &str,
    ) -> Result<Tokens, ProviderError>;

    async fn refresh(&self, refresh_token: &str) -> Result<Tokens, ProviderError>;

    /// Checks signature, issuer, audience and expiry of a raw ID token.
    async fn verify(&self, id_token: &str) -> Result<Claims, ProviderError>;
}

// Ready-to-use OIDC client type with the endpoints we require set
type OidcClientReady = CoreClient<
    EndpointSet,      // HasAuthUrl
    EndpointNotSet,   // HasDeviceAuthUrl
    EndpointNotSet,   // HasIntrospectionUrl (OIDC discovery does not provide this)
    EndpointNotSet,   // HasRevocationUrl (OIDC discovery does not provide this)
    EndpointSet,      // HasTokenUrl
    EndpointMaybeSet, // HasUserInfoUrl (from discovery, optional)
>;

struct Discovered {
    client: OidcClientReady,
    at: Instant,
}

/// [`IdentityProvider`] for a real OpenID Connect issuer.
pub struct OidcProvider {
    issuer: IssuerUrl,
    client_id: String,
    client_secret: Arc<SecretString>,
    scopes: Vec<String>,
    discovery_ttl: Duration,
    /// Follows a few redirects; used for discovery and JWKS.
    discovery_http: reqwest::Client,
    /// Never follows redirects; used for the token endpoint.
    token_http: reqwest::Client,
    discovered: RwLock<Option<Discovered>>,
}

impl OidcProvider {
    /// Prepares the client. No request is made until the first login or
    /// verification.
    ///
    /// # Errors
    ///
    /// Fails on an invalid issuer URL or if the HTTP clients cannot be built.
    pub fn new(cfg: &OAuth2Config) -> eyre::Result<Self> {
        let issuer = IssuerUrl::new(cfg.issuer.clone()).wrap_err("invalid issuer URL")?;
        let discovery_http = reqwest::Client::builder()
            .redirect(Policy::limited(3))
            .timeout(HTTP_TIMEOUT)
            .build()
            .wrap_err("failed to build HTTP client")?;
        let token_http = reqwest::Client::builder()
            .redirect(Policy::none())
            .timeout(HTTP_TIMEOUT)
            .build()
            .wrap_err("failed to build HTTP client")?;

        Ok(Self {
            issuer,
            client_id: cfg.client_id.clone(),
            client_secret: Arc::clone(&cfg.client_secret),
            scopes: cfg.scopes.clone(),
            discovery_ttl: Duration::from_secs(cfg.discovery_ttl_secs),
            discovery_http,
            token_http,
            discovered: RwLock::new(None),
        })
    }

    /// Returns the discovered client, running discovery if the cached one is
    /// older than the TTL or `rediscover` is set.
    async fn client(&self, rediscover: bool) -> Result<OidcClientReady, ProviderError> {
        if !rediscover
            && let Some(ref cached) = *self.discovered.read().await
            && cached.at.elapsed() < self.discovery_ttl
        {
            return Ok(cached.client.clone());
        }

        let client = self.discover().await?;
        *self.discovered.write().await = Some(Discovered {
            client: client.clone(),
            at: Instant::now(),
        });
        Ok(client)
    }

    #[tracing::instrument(skip_all, fields(issuer = %self.issuer.as_str()))]
    async fn discover(&self) -> Result<OidcClientReady, ProviderError> {
        let metadata = CoreProviderMetadata::discover_async(
            self.issuer.clone(),
            &ReqwestClient::from(self.discovery_http.clone()),
        )
        .await
        .map_err(|e| ProviderError::Unavailable(format!("OIDC discovery failed: {e}")))?;

        let token_url = metadata.token_endpoint().cloned().ok_or_else(|| {
            ProviderError::Unavailable("OIDC provider missing token endpoint".to_owned())
        })?;
        let client = CoreClient::from_provider_metadata(
            metadata.clone(),
            ClientId::new(self.client_id.clone()),
            Some(ClientSecret::new(
                self.client_secret.expose_secret().to_owned(),
            )),
        )
        .set_auth_uri(metadata.authorization_endpoint().clone())
        .set_token_uri(token_url);

        info!("OIDC provider discovered");
        Ok(client)
    }

    async fn verify_token(
        &self,
        token: &CoreIdToken,
        nonce: Option<&Nonce>,
    ) -> Result<(), ProviderError> {
        let client = self.client(false).await?;
        match check_claims(&client, token, nonce) {
            Ok(()) => Ok(()),
            Err(ClaimsVerificationError::SignatureVerification(e)) => {
                debug!(error = %e, "ID token signature rejected, refreshing provider keys");
                let client = self.client(true).await?;
                check_claims(&client, token, nonce)
                    .map_err(|e| ProviderError::Verification(e.to_string()))
            }
            Err(e) => Err(ProviderError::Verification(e.to_string())),
        }
    }

    async fn tokens(
        &self,
        response: &CoreTokenResponse,
        nonce: Option<&Nonce>,
    ) -> Result<Tokens, ProviderError> {
        let id_token = response.extra_fields().id_token().ok_or_else(|| {
            ProviderError::Exchange("token response carries no ID token".to_owned())
        })?;
        self.verify_token(id_token, nonce).await?;

        let raw = id_token.to_string();
        Ok(Tokens {
            claims: payload_claims(&raw)?,
            id_token: raw,
            refresh_token: response.refresh_token().map(|t| t.secret().clone()),
        })
    }

    fn redirect_url(redirect_url: &str) -> Result<RedirectUrl, ProviderError> {
        RedirectUrl::new(redirect_url.to_owned())
            .map_err(|e| ProviderError::Exchange(format!("invalid redirect URL: {e}")))
    }
}

#[async_trait]
impl IdentityProvider for OidcProvider {
    async fn authorize(&self, redirect_url: &str) -> Result<AuthorizationRequest, ProviderError> {
        let client = self
            .client(false)
            .await?
            .set_redirect_uri(Self::redirect_url(redirect_url)?);

        let (pkce_challenge, verifier) = PkceCodeChallenge::new_random_sha256();
        let mut request = client.authorize_url(
            CoreAuthenticationFlow::AuthorizationCode,
            CsrfToken::new_random,
            Nonce::new_random,
        );
        // `openid` is always requested
        for scope in self.scopes.iter().filter(|s| *s != "openid") {
            request = request.add_scope(Scope::new(scope.clone()));
        }
        let (url, state, nonce) = request.set_pkce_challenge(pkce_challenge).url();

        Ok(AuthorizationRequest {
            url: url.to_string(),
            state: state.secret().clone(),
            nonce: nonce.secret().clone(),
            pkce_verifier: verifier.secret().clone(),
        })
    }

    async fn exchange_code(
        &self,
        code: &str,
        pkce_verifier: &str,
        nonce: &str,
        redirect_url: &str,
    ) -> Result<Tokens, ProviderError> {
        let client = self
            .client(false)
            .await?
            .set_redirect_uri(Self::redirect_url(redirect_url)?);
        let response = client
            .exchange_code(AuthorizationCode::new(code.to_owned()))
            .set_pkce_verifier(PkceCodeVerifier::new(pkce_verifier.to_owned()))
            .request_async(&ReqwestClient::from(self.token_http.clone()))
            .await
            .map_err(|e| match e {
                RequestTokenError::Request(ref inner) => {
                    ProviderError::Unavailable(inner.to_string())
                }
                other => ProviderError::Exchange(other.to_string()),
            })?;

        self.tokens(&response, Some(&Nonce::new(nonce.to_owned())))
            .await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<Tokens, ProviderError> {
        let client = self.client(false).await?;
        let refresh_token = RefreshToken::new(refresh_token.to_owned());
        let response = client
            .exchange_refresh_token(&refresh_token)
            .request_async(&ReqwestClient::from(self.token_http.clone()))
            .await
            .map_err(|e| match e {
                RequestTokenError::Request(ref inner) => {
                    ProviderError::Unavailable(inner.to_string())
                }
                other => ProviderError::Exchange(other.to_string()),
            })?;

        self.tokens(&response, None).await
    }

    async fn verify(&self, id_token: &str) -> Result<Claims, ProviderError> {
        let token = CoreIdToken::from_str(id_token)
            .map_err(|e| ProviderError::Verification(format!("malformed ID token: {e}")))?;
        self.verify_token(&token, None).await?;
        payload_claims(id_token)
    }
}

fn check_claims(
    client: &OidcClientReady,
    token: &CoreIdToken,
    nonce: Option<&Nonce>,
) -> Result<(), ClaimsVerificationError> {
    let verifier = client.id_token_verifier();
    match nonce {
        Some(nonce) => token.claims(&verifier, nonce).map(|_claims| ()),
        // session tokens are re-verified without the login nonce
        None => token
            .claims(&verifier, |_: Option<&Nonce>| Ok::<(), String>(()))
            .map(|_claims| ()),
    }
}

/// Full claim set of a compact JWS. Only call this on a verified token.
pub(crate) fn payload_claims(raw: &str) -> Result<Claims, ProviderError> {
    let payload = raw
        .split('.')
        .nth(1)
        .ok_or_else(|| ProviderError::Verification("ID token is not a JWS".to_owned()))?;
    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| ProviderError::Verification(format!("ID token payload: {e}")))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| ProviderError::Verification(format!("ID token payload: {e}")))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn jws(payload: &serde_json::Value) -> String {
        format!(
            "{}.{}.{}",
            URL_SAFE_NO_PAD.encode(r#"{"alg":"RS256"}"#),
            URL_SAFE_NO_PAD.encode(payload.to_string()),
            URL_SAFE_NO_PAD.encode("signature"),
        )
    }

    fn config(issuer: &str) -> OAuth2Config {
        let toml = format!(
            r#"
            [auth]
            mode = "oauth2"
            issuer = "{issuer}"
            client_id = "console"
            client_secret = "s3cret"
            [auth.impersonation]
            username = "claims.email"
            "#
        );
        match crate::config::parse(&toml).unwrap().auth.mode {
            crate::config::AuthMode::OAuth2(cfg) => cfg,
            other => panic!("unexpected mode {other:?}"),
        }
    }

    #[test]
    fn reads_full_claim_map() {
        let claims = payload_claims(&jws(&json!({
            "sub": "1",
            "email": "jane@example.com",
            "groups": ["dev", "ops"],
        })))
        .unwrap();
        assert_eq!(claims["email"], "jane@example.com");
        assert_eq!(claims["groups"], json!(["dev", "ops"]));
    }

    #[test]
    fn rejects_non_jws_payloads() {
        assert!(matches!(
            payload_claims("opaque-token"),
            Err(ProviderError::Verification(_))
        ));
        assert!(matches!(
            payload_claims("a.!!!.c"),
            Err(ProviderError::Verification(_))
        ));
    }

    #[test]
    fn rejects_invalid_issuer() {
        crate::install_crypto_provider();
        assert!(OidcProvider::new(&config("not a url")).is_err());
    }

    #[tokio::test]
    async fn unreachable_issuer_is_unavailable_not_invalid() {
        crate::install_crypto_provider();
        let issuer = "http://127.0.0.1:1/realms/test";
        let provider = OidcProvider::new(&config(issuer)).unwrap();
        let token = jws(&json!({
            "iss": issuer,
            "aud": "console",
            "sub": "1",
            "iat": 1_700_000_000_i64,
            "exp": 4_000_000_000_i64,
        }));

        let err = provider.verify(&token).await.unwrap_err();
        assert!(matches!(err, ProviderError::Unavailable(_)), "{err}");

        let err = provider.authorize("http://localhost/oauth2/callback").await.unwrap_err();
        assert!(matches!(err, ProviderError::Unavailable(_)), "{err}");
    }

    #[tokio::test]
    async fn malformed_token_fails_before_discovery() {
        crate::install_crypto_provider();
        let provider = OidcProvider::new(&config("http://127.0.0.1:1/realms/test")).unwrap();
        let err = provider.verify("not-a-jwt").await.unwrap_err();
        assert!(matches!(err, ProviderError::Verification(_)), "{err}");
    }
}
