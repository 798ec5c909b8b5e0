//! Recognized configuration keys and their hard-coded defaults.
//!
//! Every TTL, rate limit, feature flag and tenant setting resolves through
//! [`crate::ConfigProvider`]; this table is the lowest-priority layer.

use once_cell::sync::Lazy;
use serde_json::{json, Value};
use std::collections::HashMap;

pub const ISSUER: &str = "issuer";

pub const TOKEN_ACCESS_TTL: &str = "token.access_ttl_seconds";
pub const TOKEN_ID_TTL: &str = "token.id_ttl_seconds";
pub const TOKEN_REFRESH_TTL: &str = "token.refresh_ttl_seconds";

pub const TENANT_MAX_TOKEN_TTL: &str = "tenant.max_token_ttl_seconds";
pub const TENANT_ALLOWS_REFRESH: &str = "tenant.allows_refresh_token";
pub const TENANT_ALLOWS_TOKEN_EXCHANGE: &str = "tenant.allows_token_exchange";
pub const TENANT_ALLOWS_CLIENT_CREDENTIALS: &str = "tenant.allows_client_credentials";
pub const TENANT_ALLOWS_DEVICE_CODE: &str = "tenant.allows_device_code";
pub const TENANT_ALLOWS_CIBA: &str = "tenant.allows_ciba";
pub const TENANT_ALLOWS_JWT_BEARER: &str = "tenant.allows_jwt_bearer";

pub const TOKEN_EXCHANGE_ENABLED: &str = "oidc.tokenExchange.enabled";
pub const TOKEN_EXCHANGE_SUBJECT_TYPES: &str = "oidc.tokenExchange.allowedSubjectTokenTypes";
pub const TOKEN_EXCHANGE_MAX_RESOURCES: &str = "oidc.tokenExchange.maxResourceParams";
pub const TOKEN_EXCHANGE_MAX_AUDIENCES: &str = "oidc.tokenExchange.maxAudienceParams";
pub const ID_JAG_ENABLED: &str = "oidc.tokenExchange.idJag.enabled";
pub const ID_JAG_ALLOWED_ISSUERS: &str = "oidc.tokenExchange.idJag.allowedIssuers";
pub const ID_JAG_REQUIRE_CONFIDENTIAL: &str = "oidc.tokenExchange.idJag.requireConfidentialClient";
pub const CLIENT_CREDENTIALS_ENABLED: &str = "oidc.clientCredentials.enabled";

pub const FAPI_ENABLED: &str = "fapi.enabled";
pub const FAPI_REQUIRE_DPOP: &str = "fapi.requireDpop";

pub const NATIVE_SSO_ENABLED: &str = "nativeSso.enabled";
pub const NATIVE_SSO_DEVICE_SECRET_TTL: &str = "nativeSso.deviceSecretTtlSeconds";
pub const NATIVE_SSO_PER_USER_CAP: &str = "nativeSso.perUserCap";
pub const NATIVE_SSO_OVERFLOW_POLICY: &str = "nativeSso.overflowPolicy";
pub const NATIVE_SSO_MAX_USE_COUNT: &str = "nativeSso.maxUseCount";
pub const NATIVE_SSO_RATE_WINDOW: &str = "nativeSso.rateLimitWindowSeconds";
pub const NATIVE_SSO_RATE_MAX: &str = "nativeSso.rateLimitMaxAttempts";
pub const NATIVE_SSO_RATE_BLOCK: &str = "nativeSso.rateLimitBlockSeconds";
pub const NATIVE_SSO_ALLOW_CROSS_CLIENT: &str = "nativeSso.allowCrossClient";

pub const REFRESH_ROTATION_ENABLED: &str = "refresh.rotation_enabled";
pub const REFRESH_GENERATION: &str = "refresh.current_generation";
pub const REFRESH_SHARD_COUNT: &str = "refresh.shard_count";

pub const CHALLENGE_SHARD_COUNT: &str = "challenge.shard_count";
pub const SESSION_SHARD_COUNT: &str = "session.shard_count";
pub const REVOCATION_SHARD_COUNT: &str = "revocation.shard_count";

pub const AUTH_CODE_TTL: &str = "challenge.auth_code_ttl_seconds";
pub const EMAIL_CODE_TTL: &str = "challenge.email_code_ttl_seconds";
pub const EMAIL_CODE_MAX_ATTEMPTS: &str = "challenge.email_code_max_attempts";
pub const DEVICE_CODE_TTL: &str = "challenge.device_code_ttl_seconds";
pub const DEVICE_CODE_INTERVAL: &str = "challenge.device_code_interval_seconds";
pub const CIBA_REQUEST_TTL: &str = "challenge.ciba_request_ttl_seconds";
pub const CIBA_INTERVAL: &str = "challenge.ciba_interval_seconds";

pub const SESSION_TTL: &str = "session.ttl_seconds";
pub const SESSION_MAX_TTL: &str = "session.max_ttl_seconds";

pub const DPOP_MAX_SKEW: &str = "dpop.max_skew_seconds";
pub const DPOP_REPLAY_WINDOW: &str = "dpop.replay_window_seconds";

pub const KEYS_SIGNING_CACHE_TTL: &str = "keys.signing_cache_ttl_seconds";
pub const KEYS_OVERLAP_WINDOW: &str = "keys.overlap_window_seconds";

pub const LOGOUT_BACKCHANNEL_TIMEOUT: &str = "logout.backchannel_timeout_seconds";
pub const LOGOUT_BACKCHANNEL_RETRIES: &str = "logout.backchannel_retries";
pub const LOGOUT_WEBHOOK_SECRET_KEY: &str = "logout.webhook_secret_key";
pub const LOGOUT_DEFAULT_ERROR_PAGE: &str = "logout.default_error_page";

pub const ANON_DEVICE_HASH_KEY: &str = "anon.device_hash_key";
pub const OTP_HMAC_KEY: &str = "otp.hmac_key";

pub const ALLOWED_ORIGINS: &str = "allowed_origins";
pub const ALLOW_INSECURE_REDIRECTS: &str = "allow_insecure_redirect_uris";

pub const RATE_ANON_LOGIN_MAX: &str = "ratelimit.anon_login.max";
pub const RATE_ANON_LOGIN_WINDOW: &str = "ratelimit.anon_login.window_seconds";
pub const RATE_OTP_SEND_MAX: &str = "ratelimit.otp_send.max";
pub const RATE_OTP_SEND_WINDOW: &str = "ratelimit.otp_send.window_seconds";
pub const RATE_OTP_VERIFY_MAX: &str = "ratelimit.otp_verify.max";
pub const RATE_OTP_VERIFY_WINDOW: &str = "ratelimit.otp_verify.window_seconds";

pub(crate) static DEFAULTS: Lazy<HashMap<&'static str, Value>> = Lazy::new(|| {
    let mut m = HashMap::new();
    m.insert(ISSUER, json!("http://localhost:8080"));

    m.insert(TOKEN_ACCESS_TTL, json!(900));
    m.insert(TOKEN_ID_TTL, json!(900));
    m.insert(TOKEN_REFRESH_TTL, json!(2_592_000));

    m.insert(TENANT_MAX_TOKEN_TTL, json!(3600));
    m.insert(TENANT_ALLOWS_REFRESH, json!(true));
    m.insert(TENANT_ALLOWS_TOKEN_EXCHANGE, json!(true));
    m.insert(TENANT_ALLOWS_CLIENT_CREDENTIALS, json!(true));
    m.insert(TENANT_ALLOWS_DEVICE_CODE, json!(true));
    m.insert(TENANT_ALLOWS_CIBA, json!(false));
    m.insert(TENANT_ALLOWS_JWT_BEARER, json!(false));

    m.insert(TOKEN_EXCHANGE_ENABLED, json!(false));
    m.insert(
        TOKEN_EXCHANGE_SUBJECT_TYPES,
        json!(["access_token", "id_token", "jwt"]),
    );
    m.insert(TOKEN_EXCHANGE_MAX_RESOURCES, json!(10));
    m.insert(TOKEN_EXCHANGE_MAX_AUDIENCES, json!(10));
    m.insert(ID_JAG_ENABLED, json!(false));
    m.insert(ID_JAG_ALLOWED_ISSUERS, json!([]));
    m.insert(ID_JAG_REQUIRE_CONFIDENTIAL, json!(true));
    m.insert(CLIENT_CREDENTIALS_ENABLED, json!(true));

    m.insert(FAPI_ENABLED, json!(false));
    m.insert(FAPI_REQUIRE_DPOP, json!(false));

    m.insert(NATIVE_SSO_ENABLED, json!(false));
    m.insert(NATIVE_SSO_DEVICE_SECRET_TTL, json!(7_776_000));
    m.insert(NATIVE_SSO_PER_USER_CAP, json!(10));
    m.insert(NATIVE_SSO_OVERFLOW_POLICY, json!("revoke_oldest"));
    m.insert(NATIVE_SSO_MAX_USE_COUNT, json!(1000));
    m.insert(NATIVE_SSO_RATE_WINDOW, json!(60));
    m.insert(NATIVE_SSO_RATE_MAX, json!(10));
    m.insert(NATIVE_SSO_RATE_BLOCK, json!(300));
    m.insert(NATIVE_SSO_ALLOW_CROSS_CLIENT, json!(false));

    m.insert(REFRESH_ROTATION_ENABLED, json!(true));
    m.insert(REFRESH_GENERATION, json!(1));
    m.insert(REFRESH_SHARD_COUNT, json!(16));

    m.insert(CHALLENGE_SHARD_COUNT, json!(16));
    m.insert(SESSION_SHARD_COUNT, json!(16));
    m.insert(REVOCATION_SHARD_COUNT, json!(16));

    m.insert(AUTH_CODE_TTL, json!(600));
    m.insert(EMAIL_CODE_TTL, json!(600));
    m.insert(EMAIL_CODE_MAX_ATTEMPTS, json!(5));
    m.insert(DEVICE_CODE_TTL, json!(1800));
    m.insert(DEVICE_CODE_INTERVAL, json!(5));
    m.insert(CIBA_REQUEST_TTL, json!(600));
    m.insert(CIBA_INTERVAL, json!(5));

    m.insert(SESSION_TTL, json!(3600));
    m.insert(SESSION_MAX_TTL, json!(86_400));

    m.insert(DPOP_MAX_SKEW, json!(300));
    m.insert(DPOP_REPLAY_WINDOW, json!(600));

    m.insert(KEYS_SIGNING_CACHE_TTL, json!(300));
    m.insert(KEYS_OVERLAP_WINDOW, json!(86_400));

    m.insert(LOGOUT_BACKCHANNEL_TIMEOUT, json!(5));
    m.insert(LOGOUT_BACKCHANNEL_RETRIES, json!(2));
    m.insert(LOGOUT_DEFAULT_ERROR_PAGE, json!("/logout/error"));

    m.insert(ALLOWED_ORIGINS, json!([]));
    m.insert(ALLOW_INSECURE_REDIRECTS, json!(false));

    m.insert(RATE_ANON_LOGIN_MAX, json!(10));
    m.insert(RATE_ANON_LOGIN_WINDOW, json!(60));
    m.insert(RATE_OTP_SEND_MAX, json!(5));
    m.insert(RATE_OTP_SEND_WINDOW, json!(900));
    m.insert(RATE_OTP_VERIFY_MAX, json!(5));
    m.insert(RATE_OTP_VERIFY_WINDOW, json!(600));

    m
});
