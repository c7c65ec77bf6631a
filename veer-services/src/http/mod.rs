//! Downstream HTTP serving: protocol detection, the h1/h2 connection
//! service, keep-alive handling and the experimental upgrade tunnel.
use http::HeaderValue;

pub mod content;
pub mod core;
pub mod detect;
pub mod persistence;
pub mod upgrade;
pub mod util;

pub use core::{HttpCoreService, HttpServerTimeout};

pub use content::ContentHandler;
pub use persistence::ConnectionReuseHandler;

pub(crate) const CLOSE: &str = "close";
pub(crate) const KEEPALIVE: &str = "Keep-Alive";
#[allow(clippy::declare_interior_mutable_const)]
pub(crate) const CLOSE_VALUE: HeaderValue = HeaderValue::from_static(CLOSE);
#[allow(clippy::declare_interior_mutable_const)]
pub(crate) const KEEPALIVE_VALUE: HeaderValue = HeaderValue::from_static(KEEPALIVE);
pub use util::generate_response;
