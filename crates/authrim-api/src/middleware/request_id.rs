use axum::{extract::Request, http::HeaderValue, middleware::Next, response::Response};
use tracing::Instrument;
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Correlation id for one request. Lives in the request extensions, comes
/// back on the response, and is bound to the request's tracing span so the
/// audit records and domain events emitted underneath (both sink through
/// `tracing`) carry it without any explicit plumbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestId(pub Uuid);

impl RequestId {
    /// Honor a proxy-assigned id only when it is a well-formed UUID;
    /// anything else is replaced rather than echoed.
    fn for_request(req: &Request) -> Self {
        req.headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| Uuid::parse_str(s).ok())
            .map(RequestId)
            .unwrap_or_else(|| RequestId(Uuid::new_v4()))
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

pub async fn request_id_middleware(mut req: Request, next: Next) -> Response {
    let id = RequestId::for_request(&req);
    let span = tracing::info_span!(
        "http_request",
        request_id = %id,
        method = %req.method(),
        path = %req.uri().path(),
    );

    req.extensions_mut().insert(id);
    let mut response = next.run(req).instrument(span).await;

    if let Ok(value) = HeaderValue::from_str(&id.to_string()) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    #[test]
    fn test_malformed_inbound_id_is_replaced() {
        let req = Request::builder()
            .header(REQUEST_ID_HEADER, "not-a-uuid")
            .body(Body::empty())
            .unwrap();
        let id = RequestId::for_request(&req);
        assert_ne!(id.to_string(), "not-a-uuid");

        let proxied = Uuid::new_v4();
        let req = Request::builder()
            .header(REQUEST_ID_HEADER, proxied.to_string())
            .body(Body::empty())
            .unwrap();
        assert_eq!(RequestId::for_request(&req), RequestId(proxied));
    }
}
