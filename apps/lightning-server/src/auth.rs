use axum::http::{HeaderMap, header::AUTHORIZATION};
use lightning::Identity;
use serde_json::Value;

pub const USER_HEADER: &str = "x-lightning-user";

pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Identity a connection runs its queries under, fixed at upgrade.
///
/// The bearer token wins over the user header. Values that parse as JSON are kept as
/// JSON, anything else as a plain string.
pub fn identity_from_headers(headers: &HeaderMap) -> Identity {
    let raw = bearer_token(headers).or_else(|| {
        headers
            .get(USER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    });
    match raw {
        Some(raw) => Identity::new(
            serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string())),
        ),
        None => Identity::anonymous(),
    }
}

/// `true` when no secret is configured or the bearer token equals it.
pub fn secret_matches(headers: &HeaderMap, secret: Option<&str>) -> bool {
    match secret {
        None => true,
        Some(secret) => bearer_token(headers) == Some(secret),
    }
}
