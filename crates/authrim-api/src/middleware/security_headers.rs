use axum::{extract::Request, http::HeaderValue, middleware::Next, response::Response};

/// Paths that must remain embeddable: the OIDC Session Management iframe
/// is loaded by relying parties by design.
const FRAMEABLE_PATHS: &[&str] = &["/session/check"];

/// Response hardening for the whole issuer surface, applied in one pass.
///
/// Everything this server returns is credential-bearing or derived from
/// credentials, so nothing is cacheable (RFC 6749 §5.1) and referrers are
/// suppressed entirely; authorization responses put codes and state into
/// URLs. Framing is denied except for the check-session document.
pub async fn security_headers_middleware(req: Request, next: Next) -> Response {
    let frameable = FRAMEABLE_PATHS.contains(&req.uri().path());
    let mut response = next.run(req).await;
    let headers = response.headers_mut();

    headers.insert("cache-control", HeaderValue::from_static("no-store"));
    headers.insert("pragma", HeaderValue::from_static("no-cache"));
    headers.insert(
        "x-content-type-options",
        HeaderValue::from_static("nosniff"),
    );
    headers.insert("referrer-policy", HeaderValue::from_static("no-referrer"));
    if !frameable {
        headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    }
    headers.insert(
        "strict-transport-security",
        HeaderValue::from_static("max-age=63072000"),
    );

    response
}
