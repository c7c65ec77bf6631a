//! Experimental WebSocket/upgrade tunneling.
//!
//! Sits between protocol detection and the h1 service. When enabled and the
//! buffered request head carries `Connection: Upgrade`, the connection is
//! routed once against the current table and then spliced to the selected
//! backend as a raw bidirectional byte copy. Everything else is re-prefixed
//! and handed to the inner service untouched.
use std::{
    io,
    io::Cursor,
    net::ToSocketAddrs,
};

use http::{Method, Request};
use monoio::{
    io::{AsyncReadRent, AsyncWriteRent, AsyncWriteRentExt, PrefixedReadIo, Split, Splitable},
    net::TcpStream,
};
use monoio_http::common::body::{FixedBody, HttpBody};
use service_async::{
    layer::{layer_fn, FactoryLayer},
    MakeService, Param, Service,
};
use tracing::{debug, info, warn};
use veer_core::{
    config::ProxyOptions,
    http::HttpAccept,
    lb::{NetworkTarget, PickKey},
    routing::{Backend, TableHandle},
};

const MAX_HEAD_BYTES: usize = 16 * 1024;

pub struct UpgradeDetect<T> {
    inner: T,
    enabled: bool,
    table: TableHandle,
}

#[derive(thiserror::Error, Debug)]
pub enum UpgradeError<E> {
    #[error("inner error: {0:?}")]
    Inner(E),
    #[error("io error: {0:?}")]
    Io(#[from] io::Error),
}

type PrefixedStream<S> = PrefixedReadIo<S, Cursor<Vec<u8>>>;

impl<T, S, CX> Service<HttpAccept<S, CX>> for UpgradeDetect<T>
where
    T: Service<HttpAccept<PrefixedStream<S>, CX>, Response = ()>,
    S: Split + AsyncReadRent + AsyncWriteRent + 'static,
{
    type Response = ();
    type Error = UpgradeError<T::Error>;

    async fn call(&self, (h2, stream, cx): HttpAccept<S, CX>) -> Result<(), Self::Error> {
        if h2 || !self.enabled {
            let io = PrefixedReadIo::new(stream, Cursor::new(Vec::new()));
            return self
                .inner
                .call((h2, io, cx))
                .await
                .map_err(UpgradeError::Inner);
        }

        let (head, mut stream) = buffer_head(stream).await?;
        if let Some(req) = parse_upgrade_head(&head) {
            if let Some(target) = self.resolve_target(&req) {
                self.tunnel(stream, head, target).await?;
                return Ok(());
            }
            debug!("no tunnelable backend for upgrade request, serving inline");
        }

        let io = PrefixedReadIo::new(stream, Cursor::new(head));
        self.inner
            .call((false, io, cx))
            .await
            .map_err(UpgradeError::Inner)
    }
}

impl<T> UpgradeDetect<T> {
    fn resolve_target(&self, req: &Request<HttpBody>) -> Option<NetworkTarget> {
        let table = self.table.load();
        let (route, _params) = table.lookup(req)?;
        match &route.backend {
            Backend::Network(target) => Some(target.clone()),
            Backend::Lb(lb) => {
                let pick = lb.pick(&PickKey {
                    remote_addr: None,
                    path: req.uri().path(),
                });
                Some(pick.target.clone())
            }
            // shunt/loopback/dynamic upgrades run through the normal
            // pipeline instead
            _ => None,
        }
    }

    async fn tunnel<S>(
        &self,
        client: S,
        head: Vec<u8>,
        target: NetworkTarget,
    ) -> io::Result<()>
    where
        S: Split + AsyncReadRent + AsyncWriteRent + 'static,
    {
        let addr = (target.host(), target.port())
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no upstream address"))?;
        let upstream = TcpStream::connect(addr).await?;
        info!(upstream = %target.authority, "tunneling upgraded connection");

        let (mut client_read, mut client_write) = client.into_split();
        let (mut upstream_read, mut upstream_write) = upstream.into_split();

        // replay the buffered head, then splice both directions until one
        // side closes
        let (res, _) = upstream_write.write_all(head).await;
        res?;
        monoio::select! {
            r = copy_data(&mut client_read, &mut upstream_write) => {
                if let Err(e) = r {
                    debug!("client-to-upstream copy ended: {e}");
                }
            }
            r = copy_data(&mut upstream_read, &mut client_write) => {
                if let Err(e) = r {
                    debug!("upstream-to-client copy ended: {e}");
                }
            }
        }
        Ok(())
    }
}

/// Read until the end of the request head (or the size cap).
async fn buffer_head<S: AsyncReadRent>(mut stream: S) -> io::Result<(Vec<u8>, S)> {
    let mut head: Vec<u8> = Vec::with_capacity(1024);
    let mut chunk: Vec<u8> = Vec::with_capacity(1024);
    loop {
        let (res, buf) = stream.read(chunk).await;
        chunk = buf;
        let n = res?;
        if n == 0 {
            return Ok((head, stream));
        }
        head.extend_from_slice(&chunk);
        chunk.clear();
        if find_head_end(&head).is_some() || head.len() >= MAX_HEAD_BYTES {
            return Ok((head, stream));
        }
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

/// Parse the buffered head just enough for routing, returning it only when
/// the request actually asks for an upgrade.
fn parse_upgrade_head(buf: &[u8]) -> Option<Request<HttpBody>> {
    let end = find_head_end(buf)?;
    let text = std::str::from_utf8(&buf[..end]).ok()?;
    let mut lines = text.split("\r\n");
    let mut request_line = lines.next()?.split_whitespace();
    let method: Method = request_line.next()?.parse().ok()?;
    let target = request_line.next()?;

    let mut wants_upgrade = false;
    let mut builder = Request::builder().method(method).uri(target);
    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let (name, value) = (name.trim(), value.trim());
        if name.eq_ignore_ascii_case("connection")
            && value
                .split(',')
                .any(|t| t.trim().eq_ignore_ascii_case("upgrade"))
        {
            wants_upgrade = true;
        }
        builder = builder.header(name, value);
    }
    if !wants_upgrade {
        return None;
    }
    match builder.body(HttpBody::fixed_body(None)) {
        Ok(req) => Some(req),
        Err(e) => {
            warn!("upgrade head rejected: {e}");
            None
        }
    }
}

async fn copy_data<R: AsyncReadRent, W: AsyncWriteRent>(
    read: &mut R,
    write: &mut W,
) -> io::Result<()> {
    let mut buf: Vec<u8> = Vec::with_capacity(8 * 1024);
    loop {
        let (res, b) = read.read(buf).await;
        buf = b;
        if res? == 0 {
            return Ok(());
        }
        let (res, b) = write.write_all(buf).await;
        buf = b;
        res?;
        buf.clear();
    }
}

impl<F: MakeService> MakeService for UpgradeDetect<F> {
    type Service = UpgradeDetect<F::Service>;
    type Error = F::Error;

    fn make_via_ref(&self, old: Option<&Self::Service>) -> Result<Self::Service, Self::Error> {
        Ok(UpgradeDetect {
            inner: self.inner.make_via_ref(old.map(|o| &o.inner))?,
            enabled: self.enabled,
            table: self.table.clone(),
        })
    }
}

impl<F> UpgradeDetect<F> {
    pub fn layer<C>(table: TableHandle) -> impl FactoryLayer<C, F, Factory = Self>
    where
        C: Param<ProxyOptions>,
    {
        layer_fn(move |c: &C, inner| UpgradeDetect {
            inner,
            enabled: c.param().experimental_upgrade,
            table: table.clone(),
        })
    }
}
