//! OAuth error → HTTP mapping. Status codes are assigned here and only
//! here; 401s carry `WWW-Authenticate` per RFC 6750.

use authrim_core::OAuthError;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_description: Option<String>,
}

pub struct ApiError {
    pub inner: OAuthError,
}

impl ApiError {
    pub fn new(inner: OAuthError) -> Self {
        Self { inner }
    }
}

impl From<OAuthError> for ApiError {
    fn from(inner: OAuthError) -> Self {
        Self::new(inner)
    }
}

fn status_for(error: &OAuthError) -> StatusCode {
    match error {
        OAuthError::InvalidRequest { .. }
        | OAuthError::InvalidGrant { .. }
        | OAuthError::InvalidScope { .. }
        | OAuthError::InvalidDpopProof { .. }
        | OAuthError::SlowDown
        | OAuthError::AuthorizationPending
        | OAuthError::ExpiredToken => StatusCode::BAD_REQUEST,
        OAuthError::InvalidClient { .. } => StatusCode::UNAUTHORIZED,
        OAuthError::UnauthorizedClient { .. } | OAuthError::InvalidTarget { .. } => {
            StatusCode::FORBIDDEN
        }
        OAuthError::AccessDenied { .. } => StatusCode::FORBIDDEN,
        OAuthError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        OAuthError::ServerError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.inner);
        if matches!(self.inner, OAuthError::ServerError { description: ref d } if !d.is_empty()) {
            tracing::error!(detail = %self.inner, "request failed with server_error");
        }

        let body = ErrorBody {
            error: self.inner.error_code().to_string(),
            error_description: Some(self.inner.public_description()),
        };
        let mut response = (status, Json(body)).into_response();

        if status == StatusCode::UNAUTHORIZED {
            let challenge = format!(
                r#"Bearer error="{}", error_description="{}""#,
                self.inner.error_code(),
                self.inner.public_description().replace('"', "'"),
            );
            if let Ok(value) = HeaderValue::from_str(&challenge) {
                response.headers_mut().insert("www-authenticate", value);
            }
        }
        if let OAuthError::RateLimited {
            retry_after_seconds: Some(secs),
        } = &self.inner
        {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert("retry-after", value);
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            status_for(&OAuthError::invalid_grant("x")),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&OAuthError::invalid_client("x")),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            status_for(&OAuthError::invalid_target("x")),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            status_for(&OAuthError::RateLimited {
                retry_after_seconds: None
            }),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            status_for(&OAuthError::server_error("boom")),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
