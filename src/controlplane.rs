//! Control-plane client (component B): license authentication and roster fetch.

use std::time::Duration;

use http_cache_reqwest::{Cache, CacheMode, HttpCache, HttpCacheOptions, MokaManager};
use log::{info, warn};
use reqwest::StatusCode;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};

use crate::error::GatewayError;
use crate::types::User;

/// Fixed username the gateway authenticates as; only the license (sent as
/// the password) identifies the operator.
const BASIC_AUTH_USER: &str = "_";

/// Client-side timeout for the control-plane round trip.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Header the control plane uses to return the decoded user profile.
const USER_HEADER: &str = "X-User";

/// Authenticated response from a single `auth()` call.
pub struct AuthResponse {
    pub response: reqwest::Response,
    pub user: User,
}

/// Talks to the control plane: authenticates the license and hands back a
/// response whose body is the (still-unread) msgpack tunnel roster.
pub struct ControlPlaneClient {
    http: ClientWithMiddleware,
    backend_url: String,
    license: String,
}

impl ControlPlaneClient {
    pub fn new(backend_url: String, license: String) -> Self {
        let inner = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("failed to build control-plane HTTP client");

        let http = ClientBuilder::new(inner)
            .with(Cache(HttpCache {
                mode: CacheMode::Default,
                manager: MokaManager::default(),
                options: HttpCacheOptions::default(),
            }))
            .build();

        Self {
            http,
            backend_url,
            license,
        }
    }

    /// Authenticate against the control plane and decode the `X-User` header.
    ///
    /// Retries immediately, without backoff, on a network *timeout*
    /// specifically; any other transport error surfaces. The response body
    /// is left unread: the caller owns draining it (so the cache layer can
    /// persist the entry) and, on the per-request path, decoding it as the
    /// msgpack tunnel roster.
    pub async fn auth(&self) -> Result<AuthResponse, GatewayError> {
        loop {
            let response = match self.roundtrip().await {
                Ok(resp) => resp,
                Err(err) => {
                    let is_timeout = matches!(&err, reqwest_middleware::Error::Reqwest(e) if e.is_timeout());
                    if is_timeout {
                        warn!("control-plane request timed out, retrying immediately");
                        continue;
                    }
                    return Err(GatewayError::BackendUnreachable(err));
                }
            };

            let is_cached = response
                .headers()
                .get("x-cache")
                .and_then(|v| v.to_str().ok())
                .map(|v| v.eq_ignore_ascii_case("HIT"))
                .unwrap_or(false);

            info!(
                "control plane replied: status={} cached={}",
                response.status(),
                is_cached
            );

            let user = response
                .headers()
                .get(USER_HEADER)
                .and_then(|v| v.to_str().ok())
                .and_then(|raw| serde_json::from_str::<User>(raw).ok())
                .unwrap_or_default();

            if response.status() == StatusCode::UNAUTHORIZED {
                let reason = if user.is_zero() {
                    "no such user was found by this license key".to_string()
                } else {
                    "license was not granted access to the backend".to_string()
                };
                return Err(GatewayError::Unauthorized(reason));
            }

            if response.status() != StatusCode::OK {
                return Err(GatewayError::BackendRejected(response.status()));
            }

            return Ok(AuthResponse { response, user });
        }
    }

    async fn roundtrip(&self) -> Result<reqwest::Response, reqwest_middleware::Error> {
        self.http
            .get(&self.backend_url)
            .basic_auth(BASIC_AUTH_USER, Some(&self.license))
            .send()
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_response_carries_zero_user_on_decode_failure() {
        // Decode failure (no X-User header at all) must yield User::default(),
        // not an error -- exercised indirectly via User::default()'s is_zero.
        assert!(User::default().is_zero());
    }
}
