//! OAuth2 / OIDC login and per-request session resolution.
//!
//! Login runs the authorization code flow with PKCE. Afterwards the browser
//! carries the ID token and refresh token in the encrypted session cookie; no
//! session state is kept on the server. Every request verifies the ID token,
//! refreshing it once if it no longer verifies, and maps its claims through the
//! configured policy to the identity the request acts as.

use alloc::sync::Arc;

use axum::{
    body::Body,
    extract::{Query, State},
    http::{HeaderMap, Request, StatusCode, Uri},
    middleware::Next,
    response::{IntoResponse as _, Redirect, Response},
};
use axum_extra::extract::cookie::{Cookie, CookieJar, PrivateCookieJar};
use cookie::time::Duration as CookieDuration;
use kube::Client;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::{
    cluster::{ClientFactory, UserClients},
    config::OAuth2Config,
    http::auth::{
        AuthContext, Runtime, Strategy,
        cookies::{
            COOKIE_NONCE, COOKIE_PKCE, COOKIE_RETURN_TO, COOKIE_STATE, Session, SessionError,
            auth_error_cookie, auth_provider_cookie, clear_transient_cookies, local_return_path,
            session_cookie, session_from_jar, session_removal, transient_cookie,
        },
        provider::{IdentityProvider, ProviderError, Tokens},
    },
    identity::Identity,
    policy::{AuthenticationError, ClaimMapper},
    state::AppState,
};

pub const AUTHORIZE_PATH: &str = "/oauth2/authorize";
pub const CALLBACK_PATH: &str = "/oauth2/callback";
pub const LOGOUT_PATH: &str = "/logout";

const API_PREFIX: &str = "/api";

/// Shared OAuth2 state: the provider, the compiled claim policy and the
/// per-identity client cache.
pub struct Authenticator {
    provider: Arc<dyn IdentityProvider>,
    mapper: ClaimMapper,
    clients: Arc<UserClients>,
    factory: ClientFactory,
    session_max_age: CookieDuration,
    redirect_url: Option<String>,
    provider_name: String,
}

/// Why a session could not be turned into an identity.
#[derive(Debug)]
enum Failure {
    /// The session token no longer verifies and could not be refreshed, or
    /// its claims were refused by the policy.
    Rejected(AuthenticationError),
    Unavailable(String),
    Client(kube::Error),
}

impl Failure {
    const fn status(&self) -> StatusCode {
        match *self {
            Self::Rejected(AuthenticationError::TokenInvalid(_)) => StatusCode::UNAUTHORIZED,
            Self::Rejected(_) => StatusCode::FORBIDDEN,
            Self::Unavailable(_) => StatusCode::BAD_GATEWAY,
            Self::Client(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the session cookie is useless from now on.
    const fn ends_session(&self) -> bool {
        matches!(*self, Self::Rejected(_))
    }

    fn message(&self) -> String {
        match *self {
            Self::Rejected(AuthenticationError::TokenInvalid(_)) => {
                "session expired, please log in again".to_owned()
            }
            Self::Rejected(ref e) => e.to_string(),
            Self::Unavailable(_) => "the identity provider is unavailable".to_owned(),
            Self::Client(_) => "could not create a cluster client".to_owned(),
        }
    }
}

struct Resolved {
    identity: Identity,
    client: Client,
    /// Set when the tokens were refreshed and the cookie has to be reissued.
    renewed: Option<Session>,
}

impl Authenticator {
    pub fn new(
        provider: Arc<dyn IdentityProvider>,
        mapper: ClaimMapper,
        factory: ClientFactory,
        cfg: &OAuth2Config,
    ) -> Self {
        Self {
            provider,
            mapper,
            clients: Arc::new(UserClients::new()),
            factory,
            session_max_age: CookieDuration::seconds(
                i64::try_from(cfg.session_duration_secs).unwrap_or(i64::MAX),
            ),
            redirect_url: cfg.redirect_url.clone(),
            provider_name: cfg.provider_name.clone(),
        }
    }

    pub(super) fn provider_cookie(&self, authenticated: bool, secure: bool) -> Cookie<'static> {
        auth_provider_cookie(&self.provider_name, AUTHORIZE_PATH, authenticated, secure)
    }

    fn redirect_url(&self, headers: &HeaderMap) -> Option<String> {
        if let Some(ref url) = self.redirect_url {
            return Some(url.clone());
        }
        let origin = request_origin(headers)?;
        Some(format!("{}{CALLBACK_PATH}", origin.trim_end_matches('/')))
    }

    /// Authenticates one request and runs it, or answers for it.
    ///
    /// API requests get a status code on failure. Page requests get redirected
    /// to `/` with an error cookie, except for `/` itself which is served so the
    /// UI can show the error.
    pub(super) async fn serve(&self, runtime: &Runtime, mut req: Request<Body>, next: Next) -> Response {
        let secure = runtime.secure_cookies;
        let path = req.uri().path().to_owned();
        let api = path == API_PREFIX || path.starts_with("/api/");
        let jar = PrivateCookieJar::from_headers(req.headers(), runtime.cookie_key.clone());

        let session = match session_from_jar(&jar) {
            Ok(session) => session,
            Err(e) => {
                debug!(error = %e, %path, "request without a usable session");
                let jar = if e == SessionError::Malformed {
                    jar.remove(session_removal())
                } else {
                    jar
                };
                if api {
                    return (StatusCode::UNAUTHORIZED, jar, "unauthorized").into_response();
                }
                let ui = CookieJar::new().add(self.provider_cookie(false, secure));
                return (jar, ui, next.run(req).await).into_response();
            }
        };

        let failure = match self.resolve(session).await {
            Ok(Resolved {
                identity,
                client,
                renewed,
            }) => {
                req.extensions_mut().insert(AuthContext::impersonating(
                    identity,
                    client,
                    Arc::clone(&self.clients),
                ));
                let response = next.run(req).await;
                return match renewed {
                    Some(session) => {
                        let jar = jar.add(session_cookie(&session, self.session_max_age, secure));
                        (jar, response).into_response()
                    }
                    None => response,
                };
            }
            Err(failure) => failure,
        };

        match failure {
            Failure::Unavailable(ref reason) => {
                warn!(%reason, %path, "identity provider unavailable");
            }
            Failure::Client(ref e) => warn!(error = %e, %path, "failed to build cluster client"),
            Failure::Rejected(AuthenticationError::TokenInvalid(ref reason)) => {
                info!(%reason, %path, "session ended");
            }
            Failure::Rejected(ref e) => info!(error = %e, %path, "session denied by policy"),
        }
        let status = failure.status();
        let jar = if failure.ends_session() {
            jar.remove(session_removal())
        } else {
            jar
        };
        if api {
            return (status, jar, failure.message()).into_response();
        }

        let ui = CookieJar::new()
            .add(auth_error_cookie(status, &failure.message(), secure))
            .add(self.provider_cookie(false, secure));
        if path == "/" {
            (jar, ui, next.run(req).await).into_response()
        } else {
            (jar, ui, Redirect::to("/")).into_response()
        }
    }

    async fn resolve(&self, session: Session) -> Result<Resolved, Failure> {
        let (claims, renewed) = match self.provider.verify(&session.access_token).await {
            Ok(claims) => (claims, None),
            Err(ProviderError::Unavailable(reason)) => return Err(Failure::Unavailable(reason)),
            Err(rejected) => {
                debug!(reason = %rejected, "access token rejected, refreshing");
                let Tokens {
                    id_token,
                    refresh_token,
                    claims,
                } = self.refresh(&session.refresh_token).await?;
                let renewed = Session {
                    access_token: id_token,
                    refresh_token: refresh_token.unwrap_or(session.refresh_token),
                };
                (claims, Some(renewed))
            }
        };

        let identity = self.mapper.map(claims).map_err(Failure::Rejected)?;
        let client = self
            .factory
            .cached(&self.clients, &identity)
            .await
            .map_err(Failure::Client)?;
        Ok(Resolved {
            identity,
            client,
            renewed,
        })
    }

    /// The single refresh attempt of a request.
    async fn refresh(&self, refresh_token: &str) -> Result<Tokens, Failure> {
        if refresh_token.is_empty() {
            return Err(Failure::Rejected(AuthenticationError::TokenInvalid(
                "no refresh token".to_owned(),
            )));
        }
        self.provider
            .refresh(refresh_token)
            .await
            .map_err(|e| match e {
                ProviderError::Unavailable(reason) => Failure::Unavailable(reason),
                other => Failure::Rejected(AuthenticationError::TokenInvalid(other.to_string())),
            })
    }

    fn login_failed(
        &self,
        jar: PrivateCookieJar,
        status: StatusCode,
        msg: &str,
        secure: bool,
    ) -> Response {
        let ui = CookieJar::new()
            .add(auth_error_cookie(status, msg, secure))
            .add(self.provider_cookie(false, secure));
        (jar, ui, Redirect::to("/")).into_response()
    }

    async fn start_login(
        &self,
        jar: PrivateCookieJar,
        headers: &HeaderMap,
        redirect: Option<&str>,
        secure: bool,
    ) -> Response {
        let Some(redirect_url) = self.redirect_url(headers) else {
            warn!("cannot compute the OAuth2 redirect URL: missing Host header");
            return self.login_failed(jar, StatusCode::BAD_REQUEST, "login failed: missing Host header", secure);
        };

        let request = match self.provider.authorize(&redirect_url).await {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "could not start login");
                let status = match e {
                    ProviderError::Unavailable(_) => StatusCode::BAD_GATEWAY,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                return self.login_failed(jar, status, "login failed: the identity provider is unavailable", secure);
            }
        };

        let return_to = redirect.and_then(local_return_path).unwrap_or("/");
        debug!(%return_to, "redirecting to the identity provider");
        let jar = jar
            .add(transient_cookie(COOKIE_STATE, request.state, secure))
            .add(transient_cookie(COOKIE_NONCE, request.nonce, secure))
            .add(transient_cookie(COOKIE_PKCE, request.pkce_verifier, secure))
            .add(transient_cookie(COOKIE_RETURN_TO, return_to.to_owned(), secure));
        (jar, Redirect::to(&request.url)).into_response()
    }

    async fn complete_login(
        &self,
        jar: PrivateCookieJar,
        headers: &HeaderMap,
        query: CallbackQuery,
        secure: bool,
    ) -> Response {
        let CallbackQuery {
            code,
            state,
            error,
            error_description,
        } = query;

        if let Err(reason) = validate_state(&jar, state.as_deref()) {
            warn!(reason, "rejecting OAuth2 callback");
            return self.login_failed(
                clear_transient_cookies(jar),
                StatusCode::BAD_REQUEST,
                "login rejected: CSRF state check failed",
                secure,
            );
        }

        if let Some(error) = error {
            warn!(%error, description = ?error_description, "identity provider reported an error");
            let msg = format!(
                "login failed: {}",
                error_description.as_deref().unwrap_or(&error)
            );
            return self.login_failed(clear_transient_cookies(jar), StatusCode::UNAUTHORIZED, &msg, secure);
        }

        let (Some(code), Some(pkce), Some(nonce)) = (code, jar.get(COOKIE_PKCE), jar.get(COOKIE_NONCE))
        else {
            warn!("OAuth2 callback without code, PKCE verifier or nonce");
            return self.login_failed(
                clear_transient_cookies(jar),
                StatusCode::BAD_REQUEST,
                "login rejected: incomplete authorization response",
                secure,
            );
        };
        let Some(redirect_url) = self.redirect_url(headers) else {
            return self.login_failed(
                clear_transient_cookies(jar),
                StatusCode::BAD_REQUEST,
                "login failed: missing Host header",
                secure,
            );
        };

        let tokens = match self
            .provider
            .exchange_code(&code, pkce.value(), nonce.value(), &redirect_url)
            .await
        {
            Ok(tokens) => tokens,
            Err(e) => {
                warn!(error = %e, "authorization code exchange failed");
                let status = match e {
                    ProviderError::Verification(_) => StatusCode::UNAUTHORIZED,
                    ProviderError::Exchange(_) | ProviderError::Unavailable(_) => {
                        StatusCode::BAD_GATEWAY
                    }
                };
                return self.login_failed(
                    clear_transient_cookies(jar),
                    status,
                    "login failed: could not complete the token exchange",
                    secure,
                );
            }
        };

        let identity = match self.mapper.map(tokens.claims) {
            Ok(identity) => identity,
            Err(e) => {
                info!(error = %e, "login denied by policy");
                return self.login_failed(clear_transient_cookies(jar), StatusCode::FORBIDDEN, &e.to_string(), secure);
            }
        };

        let return_to = jar
            .get(COOKIE_RETURN_TO)
            .and_then(|c| local_return_path(c.value()).map(str::to_owned))
            .unwrap_or_else(|| "/".to_owned());
        let session = Session {
            access_token: tokens.id_token,
            refresh_token: tokens.refresh_token.unwrap_or_default(),
        };
        let jar = clear_transient_cookies(jar).add(session_cookie(&session, self.session_max_age, secure));
        let ui = CookieJar::new().add(self.provider_cookie(true, secure));

        info!(%identity, %return_to, "login completed");
        (jar, ui, Redirect::to(&return_to)).into_response()
    }
}

// Compute request origin from headers
fn request_origin(headers: &HeaderMap) -> Option<String> {
    let host = headers
        .get("x-forwarded-host")
        .or_else(|| headers.get("host"))?
        .to_str()
        .ok()?;
    let proto = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("http");
    Some(format!("{proto}://{host}"))
}

/// Whether the `Origin`/`Referer` value points at `host` (host and port).
fn same_host(origin: &str, host: &str) -> bool {
    origin
        .parse::<Uri>()
        .ok()
        .and_then(|uri| uri.authority().map(|a| a.as_str().eq_ignore_ascii_case(host)))
        .unwrap_or(false)
}

/// Verify state (present in query params and matches cookies)
fn validate_state(jar: &PrivateCookieJar, state_param: Option<&str>) -> Result<(), &'static str> {
    let state_cookie = jar.get(COOKIE_STATE).ok_or("missing state cookie")?;
    let state_param = state_param.ok_or("missing state parameter")?;
    if state_cookie.value() != state_param {
        return Err("state mismatch");
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
pub(crate) struct AuthorizeQuery {
    redirect: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CallbackQuery {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

/// Starts an OAuth2 login.
pub(crate) async fn authorize(
    State(AppState { auth, .. }): State<AppState>,
    jar: PrivateCookieJar,
    headers: HeaderMap,
    Query(AuthorizeQuery { redirect }): Query<AuthorizeQuery>,
) -> Response {
    let Strategy::OAuth2(ref authenticator) = auth.strategy else {
        return Redirect::to("/").into_response();
    };
    authenticator
        .start_login(jar, &headers, redirect.as_deref(), auth.secure_cookies)
        .await
}

/// OAuth2 callback handler
pub(crate) async fn callback(
    State(AppState { auth, .. }): State<AppState>,
    jar: PrivateCookieJar,
    headers: HeaderMap,
    Query(query): Query<CallbackQuery>,
) -> Response {
    let Strategy::OAuth2(ref authenticator) = auth.strategy else {
        return Redirect::to("/").into_response();
    };
    authenticator
        .complete_login(jar, &headers, query, auth.secure_cookies)
        .await
}

/// Handle logout requests.
pub(crate) async fn logout(
    State(AppState { auth, .. }): State<AppState>,
    jar: PrivateCookieJar,
    headers: HeaderMap,
) -> Response {
    // Basic origin/referrer check to avoid cross-site logout triggers.
    if let Some(orig) = headers.get("origin").or_else(|| headers.get("referer"))
        && let Ok(orig_s) = orig.to_str()
        && let Some(host_hdr) = headers
            .get("x-forwarded-host")
            .or_else(|| headers.get("host"))
        && let Ok(host_s) = host_hdr.to_str()
        && !same_host(orig_s, host_s)
    {
        warn!(origin = %orig_s, host = %host_s, "logout: origin/referrer mismatch");
        return StatusCode::BAD_REQUEST.into_response();
    }

    let jar = jar.remove(session_removal());
    let ui = match auth.strategy {
        Strategy::OAuth2(ref authenticator) => {
            CookieJar::new().add(authenticator.provider_cookie(false, auth.secure_cookies))
        }
        Strategy::Disabled { .. } | Strategy::Anonymous { .. } => CookieJar::new(),
    };
    info!("session cleared");
    (jar, ui, Redirect::to("/")).into_response()
}
