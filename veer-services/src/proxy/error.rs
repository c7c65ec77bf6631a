//! Request-time error taxonomy and its HTTP rendering.
use http::{Response, StatusCode};
use monoio_http::common::body::FixedBody;
use veer_core::http::HttpError;

use crate::http::generate_response;

#[derive(thiserror::Error, Debug)]
pub enum ProxyError {
    #[error("no route matched")]
    NoRoute,
    #[error("loopback depth exceeded")]
    LoopbackExceeded,
    #[error("filter {filter} panicked: {message}")]
    FilterPanic { filter: String, message: String },
    #[error("upstream connect failed: {0}")]
    UpstreamConnect(String),
    #[error("upstream timed out")]
    UpstreamTimeout,
    #[error("upstream body relay failed: {0}")]
    UpstreamBody(String),
    #[error("server shutting down")]
    ShuttingDown,
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::NoRoute => StatusCode::NOT_FOUND,
            ProxyError::LoopbackExceeded => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyError::FilterPanic { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyError::UpstreamConnect(_) => StatusCode::BAD_GATEWAY,
            ProxyError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::UpstreamBody(_) => StatusCode::BAD_GATEWAY,
            ProxyError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Stable tag for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ProxyError::NoRoute => "no-route",
            ProxyError::LoopbackExceeded => "loopback-exceeded",
            ProxyError::FilterPanic { .. } => "filter-panic",
            ProxyError::UpstreamConnect(_) => "upstream-connect",
            ProxyError::UpstreamTimeout => "upstream-timeout",
            ProxyError::UpstreamBody(_) => "upstream-body",
            ProxyError::ShuttingDown => "shutting-down",
        }
    }

    /// Short opaque body; internals stay in the logs.
    pub fn public_reason(&self) -> &'static str {
        match self {
            ProxyError::NoRoute => "no route",
            ProxyError::LoopbackExceeded | ProxyError::FilterPanic { .. } => "internal error",
            ProxyError::UpstreamConnect(_) | ProxyError::UpstreamBody(_) => "bad gateway",
            ProxyError::UpstreamTimeout => "gateway timeout",
            ProxyError::ShuttingDown => "shutting down",
        }
    }
}

impl<B: FixedBody> HttpError<B> for ProxyError {
    fn to_response(&self) -> Option<Response<B>> {
        Some(generate_response(self.status(), false))
    }
}
