//! Session cookies: `authrim_session`, `authrim_admin_session` and the
//! OIDC Session Management `BROWSER_STATE`. Logout clears all three with a
//! matching SameSite.

use axum::http::header::{HeaderMap, HeaderValue, COOKIE, SET_COOKIE};

pub const SESSION_COOKIE: &str = "authrim_session";
pub const ADMIN_SESSION_COOKIE: &str = "authrim_admin_session";
pub const BROWSER_STATE_COOKIE: &str = "BROWSER_STATE";

const SAME_SITE: &str = "Lax";

pub fn read_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    let raw = headers.get(COOKIE)?.to_str().ok()?;
    raw.split(';').find_map(|pair| {
        let (k, v) = pair.trim().split_once('=')?;
        (k == name).then(|| v.to_string())
    })
}

pub fn session_cookie(value: &str, max_age_seconds: i64) -> HeaderValue {
    HeaderValue::from_str(&format!(
        "{SESSION_COOKIE}={value}; Path=/; Max-Age={max_age_seconds}; HttpOnly; Secure; SameSite={SAME_SITE}"
    ))
    .expect("valid cookie header")
}

pub fn browser_state_cookie(value: &str) -> HeaderValue {
    // Readable by the check-session iframe, so not HttpOnly.
    HeaderValue::from_str(&format!(
        "{BROWSER_STATE_COOKIE}={value}; Path=/; Secure; SameSite={SAME_SITE}"
    ))
    .expect("valid cookie header")
}

fn clearing(name: &str, http_only: bool) -> HeaderValue {
    let http_only = if http_only { "HttpOnly; " } else { "" };
    HeaderValue::from_str(&format!(
        "{name}=; Path=/; Max-Age=0; {http_only}Secure; SameSite={SAME_SITE}"
    ))
    .expect("valid cookie header")
}

/// Append clearing Set-Cookie headers for every auth cookie.
pub fn append_clearing_cookies(headers: &mut HeaderMap) {
    headers.append(SET_COOKIE, clearing(SESSION_COOKIE, true));
    headers.append(SET_COOKIE, clearing(ADMIN_SESSION_COOKIE, true));
    headers.append(SET_COOKIE, clearing(BROWSER_STATE_COOKIE, false));
}
