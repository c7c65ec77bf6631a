//! The request pipeline: match, run request filters, resolve a backend,
//! forward, run response filters in reverse.
pub mod error;
pub mod forward;
pub mod headers;

use std::{cell::Cell, panic::AssertUnwindSafe, rc::Rc};

use futures::FutureExt;
use http::{uri::Scheme, HeaderValue, Request, Response, StatusCode, Uri};
use monoio_http::common::body::{FixedBody, HttpBody};
use rand::Rng;
use service_async::{MakeService, ParamMaybeRef, ParamRef, Service};
use tracing::{error, warn, Span};
use veer_core::{
    config::ProxyOptions,
    context::keys::{PeerAddr, RemoteAddr},
    filter::FilterContext,
    http::ResponseWithContinue,
    lb::{NetworkTarget, PickKey},
    listener::AcceptedAddr,
    metrics::Metrics,
    routing::{Backend, Route, RouteTable, TableHandle},
};

pub use self::{error::ProxyError, forward::Forwarder};
use crate::http::generate_response;

/// State-bag key a filter sets to override the host rewrite policy for the
/// current request.
pub const PRESERVE_HOST_BAG_KEY: &str = "proxy.preserveHost";

/// Per-worker request dispatcher.
///
/// Reads the published route table once per request and keeps that reference
/// for the request's whole lifetime, loopback iterations included.
pub struct RoutingProxyHandler {
    table: TableHandle,
    forwarder: Forwarder,
    options: ProxyOptions,
    metrics: Rc<dyn Metrics>,
    draining: Rc<Cell<bool>>,
}

impl<CX> Service<(Request<HttpBody>, CX)> for RoutingProxyHandler
where
    CX: ParamRef<PeerAddr> + ParamMaybeRef<Option<RemoteAddr>>,
{
    type Response = ResponseWithContinue<HttpBody>;
    type Error = std::convert::Infallible;

    async fn call(
        &self,
        (req, ctx): (Request<HttpBody>, CX),
    ) -> Result<Self::Response, Self::Error> {
        if self.draining.get() {
            let err = ProxyError::ShuttingDown;
            return Ok((self.render_error(&err, &request_id()), false));
        }

        let client_addr = client_addr(&ctx);
        let table = self.table.load();
        self.metrics.incr("proxy.request");

        let mut fctx = FilterContext::new(
            req,
            request_id(),
            client_addr,
            self.metrics.clone(),
            Span::current(),
        );

        match self.pipeline(&table, &mut fctx).await {
            Ok(resp) => Ok((resp, true)),
            Err(err) => {
                self.metrics.incr(&format!("proxy.error.{}", err.kind()));
                warn!(
                    request_id = fctx.request_id(),
                    route = fctx.route_id().unwrap_or("-"),
                    kind = err.kind(),
                    "request failed: {err}"
                );
                Ok((self.render_error(&err, fctx.request_id()), true))
            }
        }
    }
}

impl RoutingProxyHandler {
    async fn pipeline(
        &self,
        table: &RouteTable,
        ctx: &mut FilterContext,
    ) -> Result<Response<HttpBody>, ProxyError> {
        let mut loops = 0usize;
        let route = loop {
            let req = ctx
                .request()
                .expect("request is present until a backend consumes it");
            let Some((route, params)) = table.lookup(req) else {
                return Err(ProxyError::NoRoute);
            };
            ctx.bind_route(Rc::from(route.id()), params);

            for (i, filter) in route.filters.iter().enumerate() {
                let name = route.def.filters[i].name.as_str();
                run_guarded(name, filter.request(ctx)).await?;
                if ctx.is_served() {
                    break;
                }
            }

            if ctx.is_served() {
                self.run_response_filters(&route, ctx).await?;
                return Ok(self.finish(ctx));
            }

            if ctx.loopback_requested() || matches!(route.backend, Backend::Loopback) {
                loops += 1;
                if loops > self.options.max_loop_depth {
                    return Err(ProxyError::LoopbackExceeded);
                }
                continue;
            }

            break route;
        };

        match &route.backend {
            Backend::Shunt => {
                ctx.set_response(generate_response(StatusCode::NOT_FOUND, false));
            }
            Backend::Network(target) => {
                let resp = self.forward(ctx, target.clone()).await?;
                ctx.set_response(resp);
            }
            Backend::Dynamic => {
                let target = self.dynamic_target(ctx)?;
                let resp = self.forward(ctx, target).await?;
                ctx.set_response(resp);
            }
            Backend::Lb(lb) => {
                let pick = lb.pick(&PickKey {
                    remote_addr: ctx.client_addr(),
                    path: ctx.latest_request_head().uri.path(),
                });
                let target = pick.target.clone();
                // the guard marks the call in flight until it resolves,
                // cancellation included
                let _guard = pick.guard;
                let resp = self.forward(ctx, target).await?;
                ctx.set_response(resp);
            }
            // the matching loop re-enters before a loopback backend gets here
            Backend::Loopback => unreachable!("loopback handled in the matching loop"),
        }

        self.run_response_filters(&route, ctx).await?;
        Ok(self.finish(ctx))
    }

    /// Response filters run over the full chain in exact reverse declaration
    /// order.
    async fn run_response_filters(
        &self,
        route: &Rc<Route>,
        ctx: &mut FilterContext,
    ) -> Result<(), ProxyError> {
        for (i, filter) in route.filters.iter().enumerate().rev() {
            let name = route.def.filters[i].name.as_str();
            run_guarded(name, filter.response(ctx)).await?;
        }
        Ok(())
    }

    fn finish(&self, ctx: &mut FilterContext) -> Response<HttpBody> {
        let mut resp = ctx
            .take_response()
            .expect("pipeline installs a response before finishing");
        headers::strip_hop_by_hop(resp.headers_mut());
        resp
    }

    async fn forward(
        &self,
        ctx: &mut FilterContext,
        target: NetworkTarget,
    ) -> Result<Response<HttpBody>, ProxyError> {
        let preserve_host = ctx
            .state_bag()
            .get(PRESERVE_HOST_BAG_KEY)
            .and_then(|v| v.downcast_ref::<bool>())
            .copied()
            .unwrap_or(self.options.preserve_host);

        let mut req = ctx
            .take_request()
            .expect("request is present until a backend consumes it");

        headers::strip_hop_by_hop(req.headers_mut());
        if self.options.x_forwarded_for {
            if let Some(addr) = ctx.client_addr() {
                headers::append_forwarded_for(req.headers_mut(), addr.ip());
            }
        }

        if !preserve_host {
            let host = HeaderValue::from_str(target.authority.as_str())
                .map_err(|e| ProxyError::UpstreamConnect(format!("invalid authority: {e}")))?;
            req.headers_mut().insert(http::header::HOST, host);
        }

        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
            .to_string();
        *req.uri_mut() = Uri::builder()
            .scheme(target.scheme.clone())
            .authority(target.authority.clone())
            .path_and_query(path_and_query)
            .build()
            .map_err(|e| ProxyError::UpstreamConnect(format!("invalid target uri: {e}")))?;

        self.forwarder.send(req).await
    }

    fn dynamic_target(&self, ctx: &mut FilterContext) -> Result<NetworkTarget, ProxyError> {
        let Some(host) = ctx.outgoing_host() else {
            return Err(ProxyError::UpstreamConnect(
                "dynamic backend target not set by any filter".to_string(),
            ));
        };
        let scheme = ctx.outgoing_scheme().cloned().unwrap_or(Scheme::HTTP);
        if scheme != Scheme::HTTP {
            return Err(ProxyError::UpstreamConnect(format!(
                "scheme {scheme} is not supported for upstreams"
            )));
        }
        let authority = host
            .parse()
            .map_err(|e| ProxyError::UpstreamConnect(format!("invalid outgoing host: {e}")))?;
        Ok(NetworkTarget { scheme, authority })
    }

    fn render_error(&self, err: &ProxyError, request_id: &str) -> Response<HttpBody> {
        let body = bytes::Bytes::from(err.public_reason());
        let mut builder = Response::builder().status(err.status());
        let headers = builder.headers_mut().expect("fresh response builder");
        headers.insert(
            http::header::CONTENT_LENGTH,
            HeaderValue::from_str(&body.len().to_string()).expect("ascii length"),
        );
        if let Ok(id) = HeaderValue::from_str(request_id) {
            headers.insert("x-request-id", id);
        }
        if let Some(server) = &self.options.server_header {
            if let Ok(v) = HeaderValue::from_str(server) {
                headers.insert(http::header::SERVER, v);
            }
        }
        builder
            .body(HttpBody::fixed_body(Some(body)))
            .expect("static response must build")
    }
}

/// Run one filter hook, converting panics into a pipeline error.
async fn run_guarded<F>(name: &str, fut: F) -> Result<(), ProxyError>
where
    F: std::future::Future<Output = ()>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(()) => Ok(()),
        Err(payload) => {
            let message = crate::common::panic_payload_text(&payload);
            error!(filter = name, %message, "filter panicked");
            Err(ProxyError::FilterPanic {
                filter: name.to_string(),
                message,
            })
        }
    }
}

fn request_id() -> String {
    format!("{:016x}", rand::thread_rng().gen::<u64>())
}

fn client_addr<CX>(ctx: &CX) -> Option<std::net::SocketAddr>
where
    CX: ParamRef<PeerAddr> + ParamMaybeRef<Option<RemoteAddr>>,
{
    let peer = ParamRef::<PeerAddr>::param_ref(ctx);
    let remote = ParamMaybeRef::<Option<RemoteAddr>>::param_maybe_ref(ctx);
    let addr = remote
        .and_then(|r| r.as_ref().map(|r| &r.0))
        .unwrap_or(&peer.0);
    match addr {
        AcceptedAddr::Tcp(addr) => Some(*addr),
        #[cfg(unix)]
        AcceptedAddr::Unix(_) => None,
    }
}

/// Factory wiring the handler into a service stack.
pub struct RoutingProxyFactory {
    table: TableHandle,
    options: ProxyOptions,
    metrics: Rc<dyn Metrics>,
    draining: Rc<Cell<bool>>,
}

impl RoutingProxyHandler {
    pub fn factory(
        table: TableHandle,
        options: ProxyOptions,
        metrics: Rc<dyn Metrics>,
        draining: Rc<Cell<bool>>,
    ) -> RoutingProxyFactory {
        RoutingProxyFactory {
            table,
            options,
            metrics,
            draining,
        }
    }
}

impl MakeService for RoutingProxyFactory {
    type Service = RoutingProxyHandler;
    type Error = std::convert::Infallible;

    fn make_via_ref(&self, old: Option<&Self::Service>) -> Result<Self::Service, Self::Error> {
        let forwarder = match old {
            Some(old) => Forwarder::rebuilt_from(&self.options, &old.forwarder),
            None => Forwarder::new(&self.options),
        };
        Ok(RoutingProxyHandler {
            table: self.table.clone(),
            forwarder,
            options: self.options.clone(),
            metrics: self.metrics.clone(),
            draining: self.draining.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use monoio::{
        io::{AsyncReadRent, AsyncWriteRentExt},
        net::TcpListener,
    };
    use veer_core::{
        metrics::RecordingMetrics,
        route::{Arg, BackendDef, FilterDef, LbAlgorithm, PredicateDef, RouteDef},
        routing::builder::TableBuilder,
    };

    use super::*;
    use crate::{
        filters::{builtin_registry as filter_registry, BreakerRegistry},
        http::util::collect_body,
        predicates::builtin_registry as predicate_registry,
    };

    struct TestCx(PeerAddr);

    impl ParamRef<PeerAddr> for TestCx {
        fn param_ref(&self) -> &PeerAddr {
            &self.0
        }
    }

    impl ParamMaybeRef<Option<RemoteAddr>> for TestCx {
        fn param_maybe_ref(&self) -> Option<&Option<RemoteAddr>> {
            None
        }
    }

    fn cx() -> TestCx {
        TestCx(PeerAddr(AcceptedAddr::Tcp("127.0.0.1:4000".parse().unwrap())))
    }

    fn predicate(name: &str, args: Vec<Arg>) -> PredicateDef {
        PredicateDef {
            name: name.into(),
            args,
        }
    }

    fn filter(name: &str, args: Vec<Arg>) -> FilterDef {
        FilterDef {
            name: name.into(),
            args,
        }
    }

    fn build_handler(
        defs: Vec<RouteDef>,
        options: ProxyOptions,
    ) -> (RoutingProxyHandler, Rc<RecordingMetrics>, TableHandle) {
        let metrics = Rc::new(RecordingMetrics::default());
        let mut builder = TableBuilder::new(
            Rc::new(filter_registry(None, Rc::new(BreakerRegistry::new()))),
            Rc::new(predicate_registry()),
            None,
            metrics.clone(),
        );
        let table = TableHandle::new(Rc::new(builder.build(defs)));
        let handler = RoutingProxyHandler::factory(
            table.clone(),
            options,
            metrics.clone(),
            Rc::new(Cell::new(false)),
        )
        .make_via_ref(None)
        .unwrap();
        (handler, metrics, table)
    }

    fn get(path: &str) -> Request<HttpBody> {
        Request::builder()
            .method(http::Method::GET)
            .uri(path)
            .header("host", "proxy.test")
            .body(HttpBody::fixed_body(None))
            .unwrap()
    }

    async fn body_text(resp: Response<HttpBody>) -> String {
        let bytes = collect_body(resp.into_body()).await.unwrap();
        String::from_utf8_lossy(&bytes).to_string()
    }

    /// Canned h1 upstream: records request heads, answers `200 hello`.
    fn spawn_upstream() -> (std::net::SocketAddr, Rc<RefCell<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let captured = seen.clone();
        monoio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                let captured = captured.clone();
                monoio::spawn(async move {
                    loop {
                        let buf: Vec<u8> = Vec::with_capacity(8 * 1024);
                        let (res, buf) = stream.read(buf).await;
                        match res {
                            Ok(0) | Err(_) => break,
                            Ok(_) => {}
                        }
                        captured
                            .borrow_mut()
                            .push(String::from_utf8_lossy(&buf).to_string());
                        let resp = b"HTTP/1.1 200 OK\r\ncontent-length: 5\r\n\r\nhello".to_vec();
                        let (res, _) = stream.write_all(resp).await;
                        if res.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        (addr, seen)
    }

    fn network_route(id: &str, path: &str, addr: std::net::SocketAddr) -> RouteDef {
        let mut def = RouteDef::new(
            id,
            BackendDef::Network {
                address: format!("http://{addr}").parse().unwrap(),
            },
        );
        def.predicates = vec![predicate("Path", vec![path.into()])];
        def
    }

    #[monoio::test(timer_enabled = true)]
    async fn simple_forward_reaches_upstream_verbatim() {
        let (addr, seen) = spawn_upstream();
        let (handler, _, _) = build_handler(
            vec![network_route("r", "/a", addr)],
            ProxyOptions::default(),
        );

        let (resp, _) = handler.call((get("/a"), cx())).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_text(resp).await, "hello");

        let heads = seen.borrow();
        assert_eq!(heads.len(), 1);
        assert!(heads[0].starts_with("GET /a HTTP/1.1"), "head: {}", heads[0]);
        let head = heads[0].to_ascii_lowercase();
        assert!(head.contains(&format!("host: {addr}")));
        assert!(head.contains("x-forwarded-for: 127.0.0.1"));
    }

    #[monoio::test(timer_enabled = true)]
    async fn preserve_host_keeps_client_host() {
        let (addr, seen) = spawn_upstream();
        let options = ProxyOptions {
            preserve_host: true,
            ..Default::default()
        };
        let (handler, _, _) = build_handler(vec![network_route("r", "/a", addr)], options);

        handler.call((get("/a"), cx())).await.unwrap();
        let head = seen.borrow()[0].to_ascii_lowercase();
        assert!(head.contains("host: proxy.test"), "head: {head}");
    }

    #[monoio::test(timer_enabled = true)]
    async fn filter_chain_shunt_order() {
        let mut def = RouteDef::new("r", BackendDef::Shunt);
        def.filters = vec![
            filter("setRequestHeader", vec!["X-A".into(), "1".into()]),
            filter("setResponseHeader", vec!["X-B".into(), "2".into()]),
        ];
        let (handler, _, _) = build_handler(vec![def], ProxyOptions::default());

        let (resp, _) = handler.call((get("/"), cx())).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(resp.headers().get("x-b").unwrap(), "2");
    }

    #[monoio::test(timer_enabled = true)]
    async fn loopback_rematches_the_rewritten_request() {
        let mut a = RouteDef::new("a", BackendDef::Loopback);
        a.predicates = vec![predicate("Path", vec!["/x".into()])];
        a.filters = vec![filter("setPath", vec!["/y".into()])];
        let mut b = RouteDef::new("b", BackendDef::Shunt);
        b.predicates = vec![predicate("Path", vec!["/y".into()])];
        b.filters = vec![filter("inlineContent", vec!["ok".into()])];

        let (handler, _, _) = build_handler(vec![a, b], ProxyOptions::default());
        let (resp, _) = handler.call((get("/x"), cx())).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_text(resp).await, "ok");
    }

    #[monoio::test(timer_enabled = true)]
    async fn loopback_depth_is_capped() {
        let mut def = RouteDef::new("spin", BackendDef::Loopback);
        def.predicates = vec![predicate("Path", vec!["/x".into()])];
        let (handler, metrics, _) = build_handler(vec![def], ProxyOptions::default());

        let (resp, _) = handler.call((get("/x"), cx())).await.unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(resp.headers().get("x-request-id").is_some());
        assert_eq!(metrics.get("proxy.error.loopback-exceeded"), 1);
    }

    #[monoio::test(timer_enabled = true)]
    async fn round_robin_alternates_between_endpoints() {
        let (addr1, seen1) = spawn_upstream();
        let (addr2, seen2) = spawn_upstream();
        let def = RouteDef::new(
            "lb",
            BackendDef::Lb {
                algorithm: LbAlgorithm::RoundRobin,
                endpoints: vec![
                    format!("http://{addr1}").parse().unwrap(),
                    format!("http://{addr2}").parse().unwrap(),
                ],
            },
        );
        let (handler, _, _) = build_handler(vec![def], ProxyOptions::default());

        for _ in 0..4 {
            let (resp, _) = handler.call((get("/"), cx())).await.unwrap();
            assert_eq!(resp.status(), StatusCode::OK);
        }
        assert_eq!(seen1.borrow().len(), 2);
        assert_eq!(seen2.borrow().len(), 2);
    }

    #[monoio::test(timer_enabled = true)]
    async fn bad_route_is_excluded_but_good_ones_serve() {
        let mut good = RouteDef::new("good", BackendDef::Shunt);
        good.predicates = vec![predicate("Path", vec!["/g".into()])];
        good.filters = vec![filter("status", vec![200.into()])];
        let mut bad = RouteDef::new("bad", BackendDef::Shunt);
        bad.predicates = vec![predicate("Path", vec!["/b".into()])];
        bad.filters = vec![filter("nonExistentFilter", vec![])];

        let (handler, metrics, _) = build_handler(vec![good, bad], ProxyOptions::default());

        let (resp, _) = handler.call((get("/g"), cx())).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let (resp, _) = handler.call((get("/b"), cx())).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(metrics.get("routing.invalid_route.unknown-filter"), 1);
    }

    #[monoio::test(timer_enabled = true)]
    async fn no_route_is_404_with_request_id() {
        let (handler, metrics, _) = build_handler(vec![], ProxyOptions::default());
        let (resp, _) = handler.call((get("/missing"), cx())).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert!(resp.headers().get("x-request-id").is_some());
        assert_eq!(metrics.get("proxy.error.no-route"), 1);
    }

    #[monoio::test(timer_enabled = true)]
    async fn unreachable_upstream_is_502() {
        let def = network_route("r", "/a", "127.0.0.1:1".parse().unwrap());
        let (handler, metrics, _) = build_handler(vec![def], ProxyOptions::default());
        let (resp, _) = handler.call((get("/a"), cx())).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(metrics.get("proxy.error.upstream-connect"), 1);
    }

    #[monoio::test(timer_enabled = true)]
    async fn panicking_filter_fails_with_500() {
        struct PanickingFilter;
        #[async_trait::async_trait(?Send)]
        impl veer_core::filter::Filter for PanickingFilter {
            async fn request(&self, _ctx: &mut FilterContext) {
                panic!("filter exploded");
            }
        }

        let metrics = Rc::new(RecordingMetrics::default());
        let mut filters = filter_registry(None, Rc::new(BreakerRegistry::new()));
        filters.register(
            "explode",
            Rc::new(|_args: &[veer_core::route::Arg]| {
                Ok(Rc::new(PanickingFilter) as Rc<dyn veer_core::filter::Filter>)
            }),
        );
        let mut builder = TableBuilder::new(
            Rc::new(filters),
            Rc::new(predicate_registry()),
            None,
            metrics.clone(),
        );
        let mut def = RouteDef::new("r", BackendDef::Shunt);
        def.filters = vec![filter("explode", vec![])];
        let table = TableHandle::new(Rc::new(builder.build(vec![def])));
        let handler = RoutingProxyHandler::factory(
            table,
            ProxyOptions::default(),
            metrics.clone(),
            Rc::new(Cell::new(false)),
        )
        .make_via_ref(None)
        .unwrap();

        let (resp, _) = handler.call((get("/"), cx())).await.unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(metrics.get("proxy.error.filter-panic"), 1);
    }

    #[monoio::test(timer_enabled = true)]
    async fn dynamic_backend_uses_filter_set_target() {
        let (addr, seen) = spawn_upstream();
        let mut def = RouteDef::new("dyn", BackendDef::Dynamic);
        def.filters = vec![filter(
            "setDynamicBackendUrl",
            vec![format!("http://{addr}").into()],
        )];
        let (handler, _, _) = build_handler(vec![def], ProxyOptions::default());

        let (resp, _) = handler.call((get("/d"), cx())).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(seen.borrow()[0].starts_with("GET /d"));
    }

    #[monoio::test(timer_enabled = true)]
    async fn draining_worker_rejects_new_requests() {
        let draining = Rc::new(Cell::new(true));
        let metrics = Rc::new(RecordingMetrics::default());
        let mut builder = TableBuilder::new(
            Rc::new(filter_registry(None, Rc::new(BreakerRegistry::new()))),
            Rc::new(predicate_registry()),
            None,
            metrics.clone(),
        );
        let table = TableHandle::new(Rc::new(builder.build(vec![])));
        let handler = RoutingProxyHandler::factory(
            table,
            ProxyOptions::default(),
            metrics,
            draining,
        )
        .make_via_ref(None)
        .unwrap();

        let (resp, cont) = handler.call((get("/"), cx())).await.unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(!cont);
    }

    #[monoio::test(timer_enabled = true)]
    async fn published_table_swap_is_observed_by_new_requests() {
        let (handler, metrics, table) = build_handler(vec![], ProxyOptions::default());
        let (resp, _) = handler.call((get("/n"), cx())).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        // publish a new generation containing /n
        let mut builder = TableBuilder::new(
            Rc::new(filter_registry(None, Rc::new(BreakerRegistry::new()))),
            Rc::new(predicate_registry()),
            None,
            metrics.clone(),
        );
        let mut def = RouteDef::new("n", BackendDef::Shunt);
        def.predicates = vec![predicate("Path", vec!["/n".into()])];
        def.filters = vec![filter("status", vec![204.into()])];
        let fresh = Rc::new(builder.build(vec![def]));
        table.publish(fresh);

        let (resp, _) = handler.call((get("/n"), cx())).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    }
}
