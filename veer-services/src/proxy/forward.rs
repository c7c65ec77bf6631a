//! Upstream forwarding over pooled h1/h2 connections.
use std::{
    net::{SocketAddr, ToSocketAddrs},
    time::Duration,
};

use http::Request;
use monoio::net::TcpStream;
use monoio_http::common::body::HttpBody;
use monoio_transports::{
    connectors::{Connector, TcpConnector},
    http::{HttpConnection, HttpConnector},
};
use tracing::debug;
use veer_core::config::{ProxyOptions, UpstreamHttpVersion};

use super::error::ProxyError;

pub type PooledHttpConnector = HttpConnector<TcpConnector, SocketAddr, TcpStream>;

/// Owns the upstream connection pool and the per-call timeout policy.
pub struct Forwarder {
    connector: PooledHttpConnector,
    connect_timeout: Option<Duration>,
    request_timeout: Option<Duration>,
}

fn build_connector(version: UpstreamHttpVersion) -> PooledHttpConnector {
    match version {
        UpstreamHttpVersion::Http2 => PooledHttpConnector::build_tcp_http2_only(),
        // no upgrades to h2 on plain-text connections
        UpstreamHttpVersion::Http11 => PooledHttpConnector::build_tcp_http1_only(),
        UpstreamHttpVersion::Auto => PooledHttpConnector::default(),
    }
}

impl Forwarder {
    pub fn new(options: &ProxyOptions) -> Self {
        let mut connector = build_connector(options.upstream_http_version);
        connector.set_read_timeout(options.upstream_read_timeout());
        Self {
            connector,
            connect_timeout: options.connect_timeout(),
            request_timeout: options.upstream_read_timeout(),
        }
    }

    pub fn with_timeouts(
        connect_timeout: Option<Duration>,
        request_timeout: Option<Duration>,
    ) -> Self {
        let mut connector = PooledHttpConnector::default();
        connector.set_read_timeout(request_timeout);
        Self {
            connector,
            connect_timeout,
            request_timeout,
        }
    }

    /// Rebuild for a new configuration generation, carrying the established
    /// connection pool over when possible.
    pub fn rebuilt_from(options: &ProxyOptions, old: &Forwarder) -> Self {
        let mut fresh = Self::new(options);
        match PooledHttpConnector::transfer_pool(&old.connector, &mut fresh.connector) {
            Ok(_) => tracing::trace!("transferred upstream pool to new forwarder"),
            Err(e) => tracing::error!("upstream pool transfer failed: {e:?}"),
        }
        fresh
    }

    /// Send one request to the upstream named by its URI authority. The
    /// request URI must be absolute by the time it gets here.
    pub async fn send(
        &self,
        mut req: Request<HttpBody>,
    ) -> Result<http::Response<HttpBody>, ProxyError> {
        let Some(host) = req.uri().host() else {
            return Err(ProxyError::UpstreamConnect(format!(
                "uri {} has no host",
                req.uri()
            )));
        };
        let port = req.uri().port_u16().unwrap_or(80);
        let mut addrs = (host, port)
            .to_socket_addrs()
            .map_err(|e| ProxyError::UpstreamConnect(format!("resolve {host}:{port}: {e}")))?;
        let Some(key) = addrs.next() else {
            return Err(ProxyError::UpstreamConnect(format!(
                "{host}:{port} resolved to no addresses"
            )));
        };
        debug!("forwarding to {key:?}");

        let connect = self.connector.connect(key);
        let connected = match self.connect_timeout {
            Some(t) => monoio::time::timeout(t, connect)
                .await
                .map_err(|_| ProxyError::UpstreamTimeout)?,
            None => connect.await,
        };
        let mut conn = match connected {
            Ok(conn) => {
                match &conn {
                    HttpConnection::Http1(_) => {
                        *req.version_mut() = http::Version::HTTP_11;
                    }
                    HttpConnection::Http2(_) => {
                        *req.version_mut() = http::Version::HTTP_2;
                        req.headers_mut().remove(http::header::HOST);
                    }
                }
                conn
            }
            Err(e) => return Err(ProxyError::UpstreamConnect(format!("{e:?}"))),
        };

        let send = conn.send_request(req);
        let (result, _reusable) = match self.request_timeout {
            Some(t) => monoio::time::timeout(t, send)
                .await
                .map_err(|_| ProxyError::UpstreamTimeout)?,
            None => send.await,
        };
        result.map_err(|e| ProxyError::UpstreamBody(format!("{e:?}")))
    }
}
