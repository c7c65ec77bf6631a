//! Response synthesis and body guards.
use std::rc::Rc;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderValue, Response, StatusCode};
use monoio_http::common::body::{FixedBody, HttpBody};
use veer_core::{
    filter::{Filter, FilterContext},
    route::{Arg, ArgsExt, CreateError},
};

/// Serve fixed content from within the proxy; response filters still run.
pub(super) struct InlineContent {
    body: Bytes,
}

impl InlineContent {
    pub(super) fn create(args: &[Arg]) -> Result<Rc<dyn Filter>, CreateError> {
        args.require_len(1)?;
        Ok(Rc::new(Self {
            body: Bytes::from(args.string_at(0)?),
        }))
    }
}

#[async_trait(?Send)]
impl Filter for InlineContent {
    async fn request(&self, ctx: &mut FilterContext) {
        let mut builder = Response::builder().status(StatusCode::OK);
        let headers = builder.headers_mut().expect("fresh response builder");
        headers.insert(
            http::header::CONTENT_LENGTH,
            HeaderValue::from_str(&self.body.len().to_string()).expect("ascii length"),
        );
        headers.insert(
            http::header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        let resp = builder
            .body(HttpBody::fixed_body(Some(self.body.clone())))
            .expect("static response must build");
        ctx.serve(resp);
    }
}

/// Override the response status on the way back to the client.
pub(super) struct Status {
    status: StatusCode,
}

impl Status {
    pub(super) fn create(args: &[Arg]) -> Result<Rc<dyn Filter>, CreateError> {
        args.require_len(1)?;
        let code = args.u64_at(0)?;
        let status = u16::try_from(code)
            .ok()
            .and_then(|c| StatusCode::from_u16(c).ok())
            .ok_or_else(|| CreateError::invalid_arg(0, "not a valid status code"))?;
        Ok(Rc::new(Self { status }))
    }
}

#[async_trait(?Send)]
impl Filter for Status {
    async fn response(&self, ctx: &mut FilterContext) {
        if let Some(resp) = ctx.response_mut() {
            *resp.status_mut() = self.status;
        }
    }
}

/// Serve a redirect from within the proxy.
pub(super) struct RedirectTo {
    status: StatusCode,
    location: HeaderValue,
}

impl RedirectTo {
    pub(super) fn create(args: &[Arg]) -> Result<Rc<dyn Filter>, CreateError> {
        args.require_len(2)?;
        let code = args.u64_at(0)?;
        let status = u16::try_from(code)
            .ok()
            .and_then(|c| StatusCode::from_u16(c).ok())
            .filter(StatusCode::is_redirection)
            .ok_or_else(|| CreateError::invalid_arg(0, "not a redirect status code"))?;
        let location = HeaderValue::from_str(&args.string_at(1)?)
            .map_err(|e| CreateError::invalid_arg(1, format!("invalid location: {e}")))?;
        Ok(Rc::new(Self { status, location }))
    }
}

#[async_trait(?Send)]
impl Filter for RedirectTo {
    async fn request(&self, ctx: &mut FilterContext) {
        let mut builder = Response::builder().status(self.status);
        let headers = builder.headers_mut().expect("fresh response builder");
        headers.insert(http::header::LOCATION, self.location.clone());
        headers.insert(
            http::header::CONTENT_LENGTH,
            HeaderValue::from_static("0"),
        );
        let resp = builder
            .body(HttpBody::fixed_body(None))
            .expect("static response must build");
        ctx.serve(resp);
    }
}

/// Reject requests whose declared content length exceeds the limit.
pub(super) struct MaxContentLength {
    limit: u64,
}

impl MaxContentLength {
    pub(super) fn create(args: &[Arg]) -> Result<Rc<dyn Filter>, CreateError> {
        args.require_len(1)?;
        Ok(Rc::new(Self {
            limit: args.u64_at(0)?,
        }))
    }
}

#[async_trait(?Send)]
impl Filter for MaxContentLength {
    async fn request(&self, ctx: &mut FilterContext) {
        let declared = ctx
            .request()
            .and_then(|req| req.headers().get(http::header::CONTENT_LENGTH))
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        if declared.is_some_and(|len| len > self.limit) {
            ctx.serve_status(StatusCode::PAYLOAD_TOO_LARGE);
        }
    }
}
