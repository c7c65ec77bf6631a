//! Header mutation filters.
use std::rc::Rc;

use async_trait::async_trait;
use http::{HeaderName, HeaderValue};
use veer_core::{
    filter::{Filter, FilterContext},
    route::{Arg, ArgsExt, CreateError},
};

fn header_name(args: &[Arg], pos: usize) -> Result<HeaderName, CreateError> {
    args.string_at(pos)?
        .parse()
        .map_err(|e| CreateError::invalid_arg(pos, format!("invalid header name: {e}")))
}

fn header_value(args: &[Arg], pos: usize) -> Result<HeaderValue, CreateError> {
    HeaderValue::from_str(&args.string_at(pos)?)
        .map_err(|e| CreateError::invalid_arg(pos, format!("invalid header value: {e}")))
}

pub(super) struct SetRequestHeader {
    name: HeaderName,
    value: HeaderValue,
}

impl SetRequestHeader {
    pub(super) fn create(args: &[Arg]) -> Result<Rc<dyn Filter>, CreateError> {
        args.require_len(2)?;
        Ok(Rc::new(Self {
            name: header_name(args, 0)?,
            value: header_value(args, 1)?,
        }))
    }
}

#[async_trait(?Send)]
impl Filter for SetRequestHeader {
    async fn request(&self, ctx: &mut FilterContext) {
        if let Some(req) = ctx.request_mut() {
            req.headers_mut().insert(self.name.clone(), self.value.clone());
        }
    }
}

pub(super) struct SetResponseHeader {
    name: HeaderName,
    value: HeaderValue,
}

impl SetResponseHeader {
    pub(super) fn create(args: &[Arg]) -> Result<Rc<dyn Filter>, CreateError> {
        args.require_len(2)?;
        Ok(Rc::new(Self {
            name: header_name(args, 0)?,
            value: header_value(args, 1)?,
        }))
    }
}

#[async_trait(?Send)]
impl Filter for SetResponseHeader {
    async fn response(&self, ctx: &mut FilterContext) {
        if let Some(resp) = ctx.response_mut() {
            resp.headers_mut().insert(self.name.clone(), self.value.clone());
        }
    }
}

pub(super) struct DropRequestHeader {
    name: HeaderName,
}

impl DropRequestHeader {
    pub(super) fn create(args: &[Arg]) -> Result<Rc<dyn Filter>, CreateError> {
        args.require_len(1)?;
        Ok(Rc::new(Self {
            name: header_name(args, 0)?,
        }))
    }
}

#[async_trait(?Send)]
impl Filter for DropRequestHeader {
    async fn request(&self, ctx: &mut FilterContext) {
        if let Some(req) = ctx.request_mut() {
            req.headers_mut().remove(&self.name);
        }
    }
}

pub(super) struct DropResponseHeader {
    name: HeaderName,
}

impl DropResponseHeader {
    pub(super) fn create(args: &[Arg]) -> Result<Rc<dyn Filter>, CreateError> {
        args.require_len(1)?;
        Ok(Rc::new(Self {
            name: header_name(args, 0)?,
        }))
    }
}

#[async_trait(?Send)]
impl Filter for DropResponseHeader {
    async fn response(&self, ctx: &mut FilterContext) {
        if let Some(resp) = ctx.response_mut() {
            resp.headers_mut().remove(&self.name);
        }
    }
}
