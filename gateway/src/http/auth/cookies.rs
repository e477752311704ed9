//! Session codec and the cookies set by the authentication layer.
//!
//! The session and the OAuth2 login cookies go through a private (encrypted)
//! jar. The two cookies meant for the UI (`auth-error`, `auth-provider`) are
//! plain and readable from script; their values are base64url-encoded JSON.

use core::fmt;

use axum::http::StatusCode;
use axum_extra::extract::cookie::{Cookie, PrivateCookieJar};
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use cookie::{SameSite, time::Duration as CookieDuration};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::json;

pub const COOKIE_SESSION: &str = "kubeconsole_session";
pub const COOKIE_STATE: &str = "kubeconsole_oauth2_state";
pub const COOKIE_NONCE: &str = "kubeconsole_oauth2_nonce";
pub const COOKIE_PKCE: &str = "kubeconsole_oauth2_pkce";
pub const COOKIE_RETURN_TO: &str = "kubeconsole_oauth2_redirect";
pub const COOKIE_AUTH_ERROR: &str = "kubeconsole_auth_error";
pub const COOKIE_AUTH_PROVIDER: &str = "kubeconsole_auth_provider";

/// Login cookies are only sent back to the OAuth2 endpoints.
pub const OAUTH2_COOKIE_PATH: &str = "/oauth2/";

const TRANSIENT_MAX_AGE: CookieDuration = CookieDuration::minutes(5);

/// Tokens of an authenticated browser session.
///
/// `access_token` holds the raw ID token; `refresh_token` is empty when the
/// provider issued none.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub access_token: String,
    pub refresh_token: String,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("access_token", &"<redacted>")
            .field("has_refresh_token", &!self.refresh_token.is_empty())
            .finish()
    }
}

/// There is no usable session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("no session cookie")]
    Missing,
    #[error("session cookie is malformed")]
    Malformed,
}

/// Encodes a session as base64url (unpadded) JSON.
pub fn encode(session: &Session) -> String {
    // Two string fields: serialization cannot fail.
    let payload = serde_json::to_vec(session).unwrap_or_default();
    URL_SAFE_NO_PAD.encode(payload)
}

/// Inverse of [`encode`].
///
/// # Errors
///
/// [`SessionError::Malformed`] for anything that is not exactly an encoded
/// session with a non-empty access token.
pub fn decode(value: &str) -> Result<Session, SessionError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(value)
        .map_err(|_| SessionError::Malformed)?;
    let session: Session = serde_json::from_slice(&bytes).map_err(|_| SessionError::Malformed)?;
    if session.access_token.is_empty() {
        return Err(SessionError::Malformed);
    }
    Ok(session)
}

/// Reads the session from the private jar.
///
/// # Errors
///
/// [`SessionError::Missing`] if there is no cookie or it does not decrypt with
/// the current key, [`SessionError::Malformed`] if its content does not decode.
pub fn session_from_jar(jar: &PrivateCookieJar) -> Result<Session, SessionError> {
    let cookie = jar.get(COOKIE_SESSION).ok_or(SessionError::Missing)?;
    decode(cookie.value())
}

pub fn session_cookie(session: &Session, max_age: CookieDuration, secure: bool) -> Cookie<'static> {
    Cookie::build((COOKIE_SESSION, encode(session)))
        .http_only(true)
        .secure(secure)
        .same_site(SameSite::Lax)
        .max_age(max_age)
        .path("/")
        .build()
}

pub fn session_removal() -> Cookie<'static> {
    Cookie::build(COOKIE_SESSION).path("/").build()
}

/// Short-lived cookie carrying one piece of an in-flight login.
pub fn transient_cookie(name: &'static str, value: String, secure: bool) -> Cookie<'static> {
    Cookie::build((name, value))
        .http_only(true)
        .secure(secure)
        .same_site(SameSite::Lax)
        .max_age(TRANSIENT_MAX_AGE)
        .path(OAUTH2_COOKIE_PATH)
        .build()
}

pub fn clear_transient_cookies(jar: PrivateCookieJar) -> PrivateCookieJar {
    [COOKIE_STATE, COOKIE_NONCE, COOKIE_PKCE, COOKIE_RETURN_TO]
        .into_iter()
        .fold(jar, |jar, name| {
            jar.remove(Cookie::build(name).path(OAUTH2_COOKIE_PATH).build())
        })
}

fn ui_cookie(name: &'static str, payload: &serde_json::Value, secure: bool) -> Cookie<'static> {
    Cookie::build((name, URL_SAFE_NO_PAD.encode(payload.to_string())))
        .http_only(false)
        .secure(secure)
        .same_site(SameSite::Lax)
        .path("/")
        .build()
}

/// Error for the UI to show once after a failed login or a lost session.
pub fn auth_error_cookie(code: StatusCode, msg: &str, secure: bool) -> Cookie<'static> {
    let mut cookie = ui_cookie(
        COOKIE_AUTH_ERROR,
        &json!({ "code": code.as_u16(), "msg": msg }),
        secure,
    );
    cookie.set_max_age(TRANSIENT_MAX_AGE);
    cookie
}

/// Tells the UI which provider it logs in with, where, and whether it has a session.
pub fn auth_provider_cookie(
    provider: &str,
    url: &str,
    authenticated: bool,
    secure: bool,
) -> Cookie<'static> {
    ui_cookie(
        COOKIE_AUTH_PROVIDER,
        &json!({ "provider": provider, "url": url, "authenticated": authenticated }),
        secure,
    )
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AuthErrorPayload {
    pub code: u16,
    pub msg: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AuthProviderPayload {
    pub provider: String,
    pub url: String,
    pub authenticated: bool,
}

/// Decodes the value of one of the UI cookies.
pub fn decode_ui_cookie<T: DeserializeOwned>(value: &str) -> Option<T> {
    let bytes = URL_SAFE_NO_PAD.decode(value).ok()?;
    serde_json::from_slice(&bytes).ok()
}

/// Accepts `candidate` as a post-login redirect only if it stays on this origin.
pub fn local_return_path(candidate: &str) -> Option<&str> {
    let local = candidate.starts_with('/')
        && !candidate.starts_with("//")
        && !candidate.starts_with("/\\")
        && !candidate.contains(['\r', '\n']);
    local.then_some(candidate)
}

#[cfg(test)]
mod tests {
    use axum_extra::extract::cookie::Key;

    use super::*;

    fn session() -> Session {
        Session {
            access_token: "eyJhbGciOiJSUzI1NiJ9.eyJzdWIiOiIxIn0.c2ln".into(),
            refresh_token: "refresh-123".into(),
        }
    }

    #[test]
    fn session_roundtrip() {
        let encoded = encode(&session());
        assert!(!encoded.contains(['=', '+', '/']));
        assert_eq!(decode(&encoded).unwrap(), session());
    }

    #[test]
    fn session_payload_uses_camel_case_keys() {
        let json = URL_SAFE_NO_PAD.decode(encode(&session())).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&json).unwrap();
        assert_eq!(
            value,
            json!({
                "accessToken": "eyJhbGciOiJSUzI1NiJ9.eyJzdWIiOiIxIn0.c2ln",
                "refreshToken": "refresh-123",
            })
        );
    }

    #[test]
    fn session_without_refresh_token_roundtrips() {
        let session = Session {
            refresh_token: String::new(),
            ..session()
        };
        assert_eq!(decode(&encode(&session)).unwrap(), session);
    }

    #[test]
    fn corrupted_values_are_rejected() {
        let encoded = encode(&session());
        let truncated = &encoded[..encoded.len() / 2];
        let not_json = URL_SAFE_NO_PAD.encode("{not json");
        let partial = URL_SAFE_NO_PAD.encode(r#"{"accessToken":"abc"}"#);
        let empty_token = URL_SAFE_NO_PAD.encode(r#"{"accessToken":"","refreshToken":"r"}"#);

        for value in [
            "",
            "%%%",
            truncated,
            not_json.as_str(),
            partial.as_str(),
            empty_token.as_str(),
        ] {
            assert_eq!(decode(value), Err(SessionError::Malformed), "{value}");
        }
    }

    #[test]
    fn debug_does_not_print_tokens() {
        let printed = format!("{:?}", session());
        assert!(!printed.contains("refresh-123"));
        assert!(!printed.contains("eyJ"));
    }

    #[test]
    fn session_cookie_attributes() {
        let cookie = session_cookie(&session(), CookieDuration::hours(8), true);
        assert_eq!(cookie.path(), Some("/"));
        assert_eq!(cookie.http_only(), Some(true));
        assert_eq!(cookie.secure(), Some(true));
        assert_eq!(cookie.same_site(), Some(SameSite::Lax));
        assert_eq!(cookie.max_age(), Some(CookieDuration::hours(8)));

        let insecure = session_cookie(&session(), CookieDuration::hours(8), false);
        assert_eq!(insecure.secure(), Some(false));
    }

    #[test]
    fn transient_cookies_are_scoped_and_short_lived() {
        let cookie = transient_cookie(COOKIE_STATE, "xyz".into(), true);
        assert_eq!(cookie.path(), Some(OAUTH2_COOKIE_PATH));
        assert!(cookie.max_age().unwrap() <= CookieDuration::minutes(5));
    }

    #[test]
    fn session_from_private_jar() {
        let jar = PrivateCookieJar::new(Key::generate());
        assert_eq!(session_from_jar(&jar), Err(SessionError::Missing));

        let jar = jar.add(session_cookie(&session(), CookieDuration::hours(1), true));
        assert_eq!(session_from_jar(&jar).unwrap(), session());
    }

    #[test]
    fn ui_cookies_are_readable_json() {
        let cookie = auth_error_cookie(StatusCode::FORBIDDEN, "not an admin", true);
        assert_eq!(cookie.http_only(), Some(false));
        assert_eq!(cookie.max_age(), Some(CookieDuration::minutes(5)));
        let payload: AuthErrorPayload = decode_ui_cookie(cookie.value()).unwrap();
        assert_eq!(
            payload,
            AuthErrorPayload {
                code: 403,
                msg: "not an admin".into()
            }
        );

        let cookie = auth_provider_cookie("oidc", "/oauth2/authorize", false, true);
        assert_eq!(cookie.max_age(), None);
        let payload: AuthProviderPayload = decode_ui_cookie(cookie.value()).unwrap();
        assert!(!payload.authenticated);
        assert_eq!(payload.url, "/oauth2/authorize");
    }

    #[test]
    fn only_local_paths_are_return_targets() {
        assert_eq!(local_return_path("/ui/workloads?ns=a"), Some("/ui/workloads?ns=a"));
        assert_eq!(local_return_path("/"), Some("/"));
        for bad in [
            "//evil.example.com",
            "/\\evil.example.com",
            "https://evil.example.com",
            "evil",
            "",
            "/a\r\nSet-Cookie: x=y",
        ] {
            assert_eq!(local_return_path(bad), None, "{bad}");
        }
    }
}
