use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, Request};
use axum::middleware::Next;
use axum::response::Response;
use axum::Extension;
use base64::Engine;
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::config::AuthConfig;
use crate::error::BrokerError;
use crate::State;

/// Broker API basic auth. A no-op when no credentials are configured.
pub async fn require_basic_auth<B>(
    Extension(state): Extension<State>,
    headers: HeaderMap,
    request: Request<B>,
    next: Next<B>,
) -> Result<Response, BrokerError> {
    let Some(expected) = state.auth.as_deref() else {
        return Ok(next.run(request).await);
    };
    if !authorized(&headers, expected) {
        warn!(
            method = %request.method(),
            path = %request.uri().path(),
            "rejected request with missing or invalid broker credentials"
        );
        return Err(BrokerError::Unauthorized);
    }
    Ok(next.run(request).await)
}

fn authorized(headers: &HeaderMap, expected: &AuthConfig) -> bool {
    let Some((username, password)) = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(parse_basic)
    else {
        return false;
    };
    // Compare digests so the comparison time does not depend on where the
    // strings first differ.
    let user_ok = Sha256::digest(username.as_bytes()) == Sha256::digest(expected.username.as_bytes());
    let pass_ok = Sha256::digest(password.as_bytes()) == Sha256::digest(expected.password.as_bytes());
    user_ok & pass_ok
}

fn parse_basic(value: &str) -> Option<(String, String)> {
    let (scheme, encoded) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some((username.to_string(), password.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use base64::engine::general_purpose::STANDARD;

    fn creds() -> AuthConfig {
        AuthConfig {
            username: "broker".to_string(),
            password: "p:w".to_string(),
        }
    }

    fn headers(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_str(value).expect("header"));
        headers
    }

    #[test]
    fn accepts_matching_basic_credentials() {
        let value = format!("Basic {}", STANDARD.encode("broker:p:w"));
        assert!(authorized(&headers(&value), &creds()));
        let value = format!("basic {}", STANDARD.encode("broker:p:w"));
        assert!(authorized(&headers(&value), &creds()));
    }

    #[test]
    fn rejects_wrong_or_malformed_credentials() {
        let wrong = format!("Basic {}", STANDARD.encode("broker:nope"));
        assert!(!authorized(&headers(&wrong), &creds()));
        assert!(!authorized(&headers("Bearer abc"), &creds()));
        assert!(!authorized(&headers("Basic !!!"), &creds()));
        assert!(!authorized(&HeaderMap::new(), &creds()));
    }
}
