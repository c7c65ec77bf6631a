//! Per-request scratch space shared by all filters of a pipeline run.
use std::{any::Any, collections::HashMap, net::SocketAddr, rc::Rc};

use http::{uri::Scheme, HeaderMap, Method, Request, Response, StatusCode, Uri, Version};
use monoio_http::common::body::{FixedBody, HttpBody};
use tracing::Span;

use crate::metrics::Metrics;

/// Immutable snapshot of a request head.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
}

impl RequestHead {
    fn of<B>(req: &Request<B>) -> Self {
        Self {
            method: req.method().clone(),
            uri: req.uri().clone(),
            version: req.version(),
            headers: req.headers().clone(),
        }
    }
}

/// Immutable snapshot of a response head.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

impl ResponseHead {
    fn of<B>(resp: &Response<B>) -> Self {
        Self {
            status: resp.status(),
            headers: resp.headers().clone(),
        }
    }
}

/// Mutable per-request state handed to every filter hook.
///
/// Owned by exactly one pipeline task; its lifetime is one client request
/// including all loopback iterations.
pub struct FilterContext {
    request: Option<Request<HttpBody>>,
    latest_head: RequestHead,
    original_head: RequestHead,
    response: Option<Response<HttpBody>>,
    original_response_head: Option<ResponseHead>,
    state_bag: HashMap<String, Rc<dyn Any>>,
    path_params: HashMap<String, String>,
    outgoing_host: Option<String>,
    outgoing_scheme: Option<Scheme>,
    served: bool,
    loopback_requested: bool,
    route_id: Option<Rc<str>>,
    request_id: String,
    client_addr: Option<SocketAddr>,
    metrics: Rc<dyn Metrics>,
    span: Span,
    parent_span: Span,
}

impl FilterContext {
    pub fn new(
        request: Request<HttpBody>,
        request_id: String,
        client_addr: Option<SocketAddr>,
        metrics: Rc<dyn Metrics>,
        parent_span: Span,
    ) -> Self {
        let head = RequestHead::of(&request);
        let span =
            tracing::info_span!(parent: &parent_span, "request", id = request_id.as_str());
        Self {
            request: Some(request),
            latest_head: head.clone(),
            original_head: head,
            response: None,
            original_response_head: None,
            state_bag: HashMap::new(),
            path_params: HashMap::new(),
            outgoing_host: None,
            outgoing_scheme: None,
            served: false,
            loopback_requested: false,
            route_id: None,
            request_id,
            client_addr,
            metrics,
            span,
            parent_span,
        }
    }

    /// Bind the context to a matched route. Called per matching iteration;
    /// loopback iterations rebind with the newly matched route.
    pub fn bind_route(&mut self, route_id: Rc<str>, path_params: HashMap<String, String>) {
        self.route_id = Some(route_id);
        self.path_params = path_params;
        self.loopback_requested = false;
    }

    pub fn request(&self) -> Option<&Request<HttpBody>> {
        self.request.as_ref()
    }

    pub fn request_mut(&mut self) -> Option<&mut Request<HttpBody>> {
        self.request.as_mut()
    }

    /// Remove the request for forwarding. The head stays observable through
    /// [`Self::latest_request_head`].
    pub fn take_request(&mut self) -> Option<Request<HttpBody>> {
        let req = self.request.take();
        if let Some(req) = &req {
            self.latest_head = RequestHead::of(req);
        }
        req
    }

    pub fn latest_request_head(&mut self) -> &RequestHead {
        if let Some(req) = &self.request {
            self.latest_head = RequestHead::of(req);
        }
        &self.latest_head
    }

    pub fn original_request(&self) -> &RequestHead {
        &self.original_head
    }

    pub fn response(&self) -> Option<&Response<HttpBody>> {
        self.response.as_ref()
    }

    pub fn response_mut(&mut self) -> Option<&mut Response<HttpBody>> {
        self.response.as_mut()
    }

    /// Install the backend response. The first head installed this way is
    /// preserved as the "original" response.
    pub fn set_response(&mut self, response: Response<HttpBody>) {
        if self.original_response_head.is_none() {
            self.original_response_head = Some(ResponseHead::of(&response));
        }
        self.response = Some(response);
    }

    pub fn take_response(&mut self) -> Option<Response<HttpBody>> {
        self.response.take()
    }

    pub fn original_response(&self) -> Option<&ResponseHead> {
        self.original_response_head.as_ref()
    }

    /// Terminate the pipeline with the given response: remaining request
    /// filters are skipped, response filters still run in reverse order.
    pub fn serve(&mut self, response: Response<HttpBody>) {
        self.set_response(response);
        self.served = true;
    }

    /// Convenience for filters serving a bare status.
    pub fn serve_status(&mut self, status: StatusCode) {
        let resp = Response::builder()
            .status(status)
            .body(HttpBody::fixed_body(None))
            .expect("static response must build");
        self.serve(resp);
    }

    pub fn is_served(&self) -> bool {
        self.served
    }

    /// Request re-entry into route matching once the current request filter
    /// chain has finished.
    pub fn loopback(&mut self) {
        self.loopback_requested = true;
    }

    pub fn loopback_requested(&self) -> bool {
        self.loopback_requested
    }

    pub fn state_bag(&self) -> &HashMap<String, Rc<dyn Any>> {
        &self.state_bag
    }

    pub fn state_bag_mut(&mut self) -> &mut HashMap<String, Rc<dyn Any>> {
        &mut self.state_bag
    }

    pub fn path_param(&self, name: &str) -> Option<&str> {
        self.path_params.get(name).map(String::as_str)
    }

    pub fn path_params(&self) -> &HashMap<String, String> {
        &self.path_params
    }

    pub fn set_outgoing_host(&mut self, host: impl Into<String>) {
        self.outgoing_host = Some(host.into());
    }

    pub fn outgoing_host(&self) -> Option<&str> {
        self.outgoing_host.as_deref()
    }

    pub fn set_outgoing_scheme(&mut self, scheme: Scheme) {
        self.outgoing_scheme = Some(scheme);
    }

    pub fn outgoing_scheme(&self) -> Option<&Scheme> {
        self.outgoing_scheme.as_ref()
    }

    pub fn route_id(&self) -> Option<&str> {
        self.route_id.as_deref()
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn client_addr(&self) -> Option<SocketAddr> {
        self.client_addr
    }

    pub fn metrics(&self) -> &Rc<dyn Metrics> {
        &self.metrics
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn parent_span(&self) -> &Span {
        &self.parent_span
    }

    /// Detach a context for fan-out work (tee-style filters).
    ///
    /// The split context carries the current request head with an empty
    /// body and a snapshot of the state bag; nothing done with it can affect
    /// the primary response.
    pub fn split(&mut self) -> FilterContext {
        let head = self.latest_request_head().clone();
        let mut request = Request::builder()
            .method(head.method.clone())
            .uri(head.uri.clone())
            .version(head.version);
        if let Some(headers) = request.headers_mut() {
            *headers = head.headers.clone();
        }
        let request = request
            .body(HttpBody::fixed_body(None))
            .expect("split request must build");

        FilterContext {
            request: Some(request),
            latest_head: head.clone(),
            original_head: self.original_head.clone(),
            response: None,
            original_response_head: None,
            state_bag: self.state_bag.clone(),
            path_params: self.path_params.clone(),
            outgoing_host: self.outgoing_host.clone(),
            outgoing_scheme: self.outgoing_scheme.clone(),
            served: false,
            loopback_requested: false,
            route_id: self.route_id.clone(),
            request_id: self.request_id.clone(),
            client_addr: self.client_addr,
            metrics: self.metrics.clone(),
            span: self.span.clone(),
            parent_span: self.parent_span.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::default_metrics;

    fn ctx() -> FilterContext {
        let req = Request::builder()
            .method(Method::GET)
            .uri("/a?x=1")
            .body(HttpBody::fixed_body(None))
            .unwrap();
        FilterContext::new(req, "test".into(), None, default_metrics(), Span::none())
    }

    #[test]
    fn serve_sets_terminal_state() {
        let mut ctx = ctx();
        assert!(!ctx.is_served());
        ctx.serve_status(StatusCode::UNAUTHORIZED);
        assert!(ctx.is_served());
        assert_eq!(
            ctx.response().unwrap().status(),
            StatusCode::UNAUTHORIZED
        );
    }

    #[test]
    fn original_head_survives_mutation() {
        let mut ctx = ctx();
        *ctx.request_mut().unwrap().uri_mut() = "/rewritten".parse().unwrap();
        assert_eq!(ctx.original_request().uri.path(), "/a");
        assert_eq!(ctx.latest_request_head().uri.path(), "/rewritten");
    }

    #[test]
    fn split_shares_state_snapshot_but_not_response() {
        let mut ctx = ctx();
        ctx.state_bag_mut()
            .insert("k".into(), Rc::new("v".to_string()));
        let mut split = ctx.split();
        assert!(split.state_bag().contains_key("k"));
        split.serve_status(StatusCode::OK);
        assert!(ctx.response().is_none());
        assert!(!ctx.is_served());
    }

    #[test]
    fn first_response_head_is_preserved() {
        let mut ctx = ctx();
        let resp = Response::builder()
            .status(StatusCode::BAD_GATEWAY)
            .body(HttpBody::fixed_body(None))
            .unwrap();
        ctx.set_response(resp);
        let replacement = Response::builder()
            .status(StatusCode::OK)
            .body(HttpBody::fixed_body(None))
            .unwrap();
        ctx.set_response(replacement);
        assert_eq!(
            ctx.original_response().unwrap().status,
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(ctx.response().unwrap().status(), StatusCode::OK);
    }
}
