//! Core connection service: h1 keep-alive loop and h2 multiplexing over the
//! per-request handler chain.
use std::{convert::Infallible, fmt::Debug, time::Duration};

use bytes::Bytes;
use certain_map::{Attach, Fork};
use futures::{stream::FuturesUnordered, StreamExt};
use http::StatusCode;
use monoio::io::{sink::SinkExt, stream::Stream, AsyncReadRent, AsyncWriteRent, Split, Splitable};
use monoio_http::{
    common::body::{Body, HttpBody, StreamHint},
    h1::codec::{
        decoder::{FillPayload, RequestDecoder},
        encoder::GenericEncoder,
    },
    h2::server::SendResponse,
};
use service_async::{
    layer::{layer_fn, FactoryLayer},
    MakeService, Param, ParamRef, Service,
};
use tracing::{error, info, warn};
use veer_core::{
    context::keys::PeerAddr,
    http::{HttpAccept, HttpHandler},
    AnyError,
};

use super::util::{drive_accompanied, generate_response};

/// Serves accepted connections: decodes requests, runs them through the
/// handler chain and encodes responses, for both HTTP/1.x and HTTP/2.
#[derive(Clone)]
pub struct HttpCoreService<H> {
    handler_chain: H,
    http_timeout: HttpServerTimeout,
}

impl<H> HttpCoreService<H> {
    pub fn new(handler_chain: H, http_timeout: HttpServerTimeout) -> Self {
        HttpCoreService {
            handler_chain,
            http_timeout,
        }
    }

    async fn h1_svc<S, CXIn, CXStore, CXState, Err>(&self, stream: S, ctx: CXIn)
    where
        CXIn: ParamRef<PeerAddr> + Fork<Store = CXStore, State = CXState>,
        CXStore: 'static,
        for<'a> CXState: Attach<CXStore>,
        for<'a> H: HttpHandler<
            <CXState as Attach<CXStore>>::Hdr<'a>,
            HttpBody,
            Body = HttpBody,
            Error = Err,
        >,
        Err: Into<AnyError> + Debug,
        S: Split + AsyncReadRent + AsyncWriteRent,
    {
        let (reader, writer) = stream.into_split();
        let mut decoder = RequestDecoder::new(reader);
        let mut encoder = GenericEncoder::new(writer);
        decoder.set_timeout(self.http_timeout.keepalive_timeout);

        loop {
            // decode the next request head, optionally bounded
            let decoded = match self.http_timeout.read_header_timeout {
                Some(header_timeout) => {
                    match monoio::time::timeout(header_timeout, decoder.next()).await {
                        Ok(inner) => inner,
                        Err(_) => {
                            info!(
                                "connection {:?} timed out while reading a request head",
                                ParamRef::<PeerAddr>::param_ref(&ctx),
                            );
                            break;
                        }
                    }
                }
                None => decoder.next().await,
            };

            let req = match decoded {
                Some(Ok(req)) => HttpBody::request(req),
                Some(Err(err)) => {
                    warn!("request head decode failed: {err}");
                    break;
                }
                None => {
                    info!(
                        "connection {:?} closed",
                        ParamRef::<PeerAddr>::param_ref(&ctx),
                    );
                    break;
                }
            };

            let (mut store, state) = ctx.fork();
            let forked_ctx = unsafe { state.attach(&mut store) };

            // run the handler while pumping the request body into it
            let res = drive_accompanied(
                self.handler_chain.handle(req, forked_ctx),
                decoder.fill_payload(),
            )
            .await;

            match res {
                Ok((resp, should_cont)) => {
                    let send = drive_accompanied(
                        encoder.send_and_flush(resp),
                        decoder.fill_payload(),
                    );
                    let sent = match self.http_timeout.read_body_timeout {
                        None => send.await,
                        Some(body_timeout) => {
                            match monoio::time::timeout(body_timeout, send).await {
                                Ok(r) => r,
                                Err(_) => {
                                    info!(
                                        "connection {:?} write timed out",
                                        ParamRef::<PeerAddr>::param_ref(&ctx),
                                    );
                                    break;
                                }
                            }
                        }
                    };
                    if let Err(e) = sent {
                        warn!("response encode/write failed: {e}");
                        break;
                    }
                    if !should_cont {
                        break;
                    }
                    // drain whatever is left of the request body before the
                    // next head
                    if let Err(e) = decoder.fill_payload().await {
                        warn!("request body drain failed: {e}");
                        break;
                    }
                }
                Err(e) => {
                    // non-renderable handler error
                    error!("request processing failed: {e:?}");
                    if let Err(e) = encoder
                        .send_and_flush(generate_response::<HttpBody>(
                            StatusCode::INTERNAL_SERVER_ERROR,
                            true,
                        ))
                        .await
                    {
                        warn!("error reply failed: {e}");
                    }
                    break;
                }
            }
        }
    }

    async fn h2_process_response(
        response: http::Response<HttpBody>,
        mut response_handle: SendResponse<Bytes>,
    ) {
        let (mut parts, mut body) = response.into_parts();
        parts.headers.remove("connection");
        let response = http::Response::from_parts(parts, ());

        match body.stream_hint() {
            StreamHint::None => {
                if let Err(e) = response_handle.send_response(response, true) {
                    error!("h2 response head send failed: {e:?}");
                }
            }
            StreamHint::Fixed => {
                let mut send_stream = match response_handle.send_response(response, false) {
                    Ok(s) => s,
                    Err(e) => {
                        error!("h2 response head send failed: {e:?}");
                        return;
                    }
                };

                if let Some(Ok(data)) = body.next_data().await {
                    let _ = send_stream.send_data(data, true);
                }
            }
            StreamHint::Stream => {
                let mut send_stream = match response_handle.send_response(response, false) {
                    Ok(s) => s,
                    Err(e) => {
                        error!("h2 response head send failed: {e:?}");
                        return;
                    }
                };

                while let Some(Ok(data)) = body.next_data().await {
                    let _ = send_stream.send_data(data, false);
                }

                let _ = send_stream.send_data(Bytes::new(), true);
            }
        }
    }

    async fn h2_svc<S, CXIn, CXStore, CXState, Err>(&self, stream: S, ctx: CXIn)
    where
        CXIn: ParamRef<PeerAddr> + Fork<Store = CXStore, State = CXState>,
        CXStore: 'static,
        for<'a> CXState: Attach<CXStore>,
        for<'a> H: HttpHandler<
            <CXState as Attach<CXStore>>::Hdr<'a>,
            HttpBody,
            Body = HttpBody,
            Error = Err,
        >,
        Err: Into<AnyError> + Debug,
        S: Split + AsyncReadRent + AsyncWriteRent + Unpin + 'static,
    {
        let mut connection = match monoio_http::h2::server::Builder::new()
            .initial_window_size(1_000_000)
            .max_concurrent_streams(1000)
            .handshake::<S, Bytes>(stream)
            .await
        {
            Ok(c) => c,
            Err(e) => {
                error!("h2 handshake failed: {e:?}");
                return;
            }
        };

        let (tx, mut rx) = local_sync::mpsc::unbounded::channel();
        let mut backend_resp_stream = FuturesUnordered::new();
        let mut frontend_resp_stream = FuturesUnordered::new();

        monoio::spawn(async move {
            while let Some(result) = connection.accept().await {
                if let Err(e) = tx.send(result) {
                    error!("h2 request relay failed: {e:?}");
                    break;
                }
            }
        });

        loop {
            monoio::select! {
                Some(Ok((request, response_handle))) = rx.recv() => {
                    let request = HttpBody::request(request);
                    let (mut store, state) = ctx.fork();
                    backend_resp_stream.push(async move {
                        let forked_ctx = unsafe { state.attach(&mut store) };
                        (self.handler_chain.handle(request, forked_ctx).await, response_handle)
                    });
                }
                Some(result) = backend_resp_stream.next() => {
                    match result {
                        (Ok((response, _)), response_handle) => {
                            frontend_resp_stream.push(Self::h2_process_response(response, response_handle));
                        }
                        (Err(e), mut response_handle) => {
                            error!("handler chain failed: {e:?}");
                            let (parts, _) = generate_response::<HttpBody>(StatusCode::INTERNAL_SERVER_ERROR, false).into_parts();
                            let response = http::Response::from_parts(parts, ());
                            let _ = response_handle.send_response(response, true);
                        }
                    }
                }
                Some(_) = frontend_resp_stream.next() => {}
                else => {
                    // all streams finished, drop the connection
                    break;
                }
            }
        }

        info!(
            "h2 connection {:?} finished",
            ParamRef::<PeerAddr>::param_ref(&ctx)
        );
    }
}

impl<H, Stream, CXIn, CXStore, CXState, Err> Service<HttpAccept<Stream, CXIn>>
    for HttpCoreService<H>
where
    CXIn: ParamRef<PeerAddr> + Fork<Store = CXStore, State = CXState>,
    CXStore: 'static,
    for<'a> CXState: Attach<CXStore>,
    for<'a> H:
        HttpHandler<<CXState as Attach<CXStore>>::Hdr<'a>, HttpBody, Body = HttpBody, Error = Err>,
    Stream: Split + AsyncReadRent + AsyncWriteRent + Unpin + 'static,
    Err: Into<AnyError> + Debug,
{
    type Response = ();
    type Error = Infallible;

    async fn call(
        &self,
        incoming_stream: HttpAccept<Stream, CXIn>,
    ) -> Result<Self::Response, Self::Error> {
        let (use_h2, stream, ctx) = incoming_stream;
        if use_h2 {
            self.h2_svc(stream, ctx).await
        } else {
            self.h1_svc(stream, ctx).await
        }
        Ok(())
    }
}

impl<F: MakeService> MakeService for HttpCoreService<F> {
    type Service = HttpCoreService<F::Service>;
    type Error = F::Error;

    fn make_via_ref(&self, old: Option<&Self::Service>) -> Result<Self::Service, Self::Error> {
        Ok(HttpCoreService {
            handler_chain: self
                .handler_chain
                .make_via_ref(old.map(|o| &o.handler_chain))?,
            http_timeout: self.http_timeout,
        })
    }
}

/// Timeouts of the downstream side of a connection.
///
/// `keepalive_timeout` bounds idle time between requests, the other two
/// bound reading a request head and writing a response.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct HttpServerTimeout {
    pub keepalive_timeout: Option<Duration>,
    pub read_header_timeout: Option<Duration>,
    pub read_body_timeout: Option<Duration>,
}

impl Default for HttpServerTimeout {
    fn default() -> Self {
        const DEFAULT_KEEPALIVE_SEC: u64 = 75;
        Self {
            keepalive_timeout: Some(Duration::from_secs(DEFAULT_KEEPALIVE_SEC)),
            read_header_timeout: None,
            read_body_timeout: None,
        }
    }
}

impl<F> HttpCoreService<F> {
    pub fn layer<C>() -> impl FactoryLayer<C, F, Factory = Self>
    where
        C: Param<HttpServerTimeout>,
    {
        layer_fn(|c: &C, inner| Self::new(inner, c.param()))
    }
}

impl Param<HttpServerTimeout> for veer_core::config::ServerConfig {
    fn param(&self) -> HttpServerTimeout {
        let defaults = HttpServerTimeout::default();
        HttpServerTimeout {
            keepalive_timeout: self
                .timeouts
                .keepalive_ms
                .map(Duration::from_millis)
                .or(defaults.keepalive_timeout),
            read_header_timeout: self.timeouts.read_header_ms.map(Duration::from_millis),
            read_body_timeout: self.timeouts.write_ms.map(Duration::from_millis),
        }
    }
}
