//! Bearer token validation against a remote tokeninfo endpoint.
mod cache;

use std::time::Instant;

use cache::{Lookup, TokeninfoCache};
use http::{HeaderValue, Request, StatusCode, Uri};
use monoio_http::common::body::{FixedBody, HttpBody};
use serde_json::{Map, Value};
use tracing::debug;
use veer_core::{config::TokeninfoConfig, AnyResult};

use crate::{http::util::collect_body, proxy::Forwarder};

pub type Claims = Map<String, Value>;

/// Terminal outcomes of a token validation.
///
/// `Clone` because one upstream result is broadcast to every coalesced
/// caller.
#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
pub enum TokeninfoError {
    /// The endpoint rejected the token.
    #[error("invalid token")]
    InvalidToken,
    /// The endpoint could not be reached or answered malformed data.
    #[error("tokeninfo service unreachable: {0}")]
    Unreachable(String),
}

/// Client with bounded cache and per-token request coalescing. Safe for
/// concurrent use by any number of request tasks on the owning worker.
pub struct TokeninfoClient {
    endpoint: Uri,
    forwarder: Forwarder,
    cache: TokeninfoCache,
}

impl TokeninfoClient {
    pub fn new(config: &TokeninfoConfig) -> AnyResult<Self> {
        let endpoint: Uri = config.url.parse()?;
        if endpoint.host().is_none() {
            veer_core::bail_into!("tokeninfo url {} has no host", config.url);
        }
        Ok(Self {
            endpoint,
            forwarder: Forwarder::with_timeouts(
                Some(config.timeout()),
                Some(config.timeout()),
            ),
            cache: TokeninfoCache::new(config.cache_size, config.cache_ttl()),
        })
    }

    /// Validate a bearer token, serving from cache when possible.
    ///
    /// Concurrent calls for the same token share a single upstream request.
    pub async fn get_tokeninfo(&self, token: &str) -> Result<Claims, TokeninfoError> {
        match self.cache.lookup(token, Instant::now()) {
            Lookup::Hit(info) => Ok(info),
            Lookup::Wait(rx) => match rx.await {
                Ok(result) => result,
                // the owner vanished without resolving; surface as transient
                Err(_) => Err(TokeninfoError::Unreachable(
                    "coalesced fetch canceled".to_string(),
                )),
            },
            Lookup::MissOwner => {
                let result = self.fetch(token).await;
                self.cache.resolve(token, result.clone(), Instant::now());
                result
            }
        }
    }

    async fn fetch(&self, token: &str) -> Result<Claims, TokeninfoError> {
        debug!("validating token upstream");
        let bearer = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|_| TokeninfoError::InvalidToken)?;
        let host = self
            .endpoint
            .authority()
            .expect("endpoint authority checked at construction")
            .as_str()
            .to_string();
        let req = Request::builder()
            .method(http::Method::GET)
            .uri(self.endpoint.clone())
            .header(http::header::AUTHORIZATION, bearer)
            .header(
                http::header::HOST,
                HeaderValue::from_str(&host)
                    .map_err(|e| TokeninfoError::Unreachable(e.to_string()))?,
            )
            .body(HttpBody::fixed_body(None))
            .map_err(|e| TokeninfoError::Unreachable(e.to_string()))?;

        let resp = self
            .forwarder
            .send(req)
            .await
            .map_err(|e| TokeninfoError::Unreachable(e.to_string()))?;

        match resp.status() {
            StatusCode::OK => {
                let body = collect_body(resp.into_body())
                    .await
                    .map_err(TokeninfoError::Unreachable)?;
                match serde_json::from_slice::<Value>(&body) {
                    Ok(Value::Object(map)) => Ok(map),
                    Ok(_) => Err(TokeninfoError::Unreachable(
                        "tokeninfo response is not an object".to_string(),
                    )),
                    Err(e) => Err(TokeninfoError::Unreachable(e.to_string())),
                }
            }
            s if s == StatusCode::BAD_REQUEST
                || s == StatusCode::UNAUTHORIZED
                || s == StatusCode::FORBIDDEN =>
            {
                Err(TokeninfoError::InvalidToken)
            }
            s => Err(TokeninfoError::Unreachable(format!(
                "unexpected tokeninfo status {s}"
            ))),
        }
    }
}
