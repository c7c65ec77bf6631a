//! Query string manipulation.
use std::rc::Rc;

use async_trait::async_trait;
use http::Uri;
use tracing::warn;
use veer_core::{
    filter::{Filter, FilterContext},
    route::{Arg, ArgsExt, CreateError},
};

fn rewrite_query(ctx: &mut FilterContext, query: Option<String>) {
    let Some(req) = ctx.request_mut() else { return };
    let path_and_query = match &query {
        Some(query) if !query.is_empty() => format!("{}?{}", req.uri().path(), query),
        _ => req.uri().path().to_string(),
    };
    let mut builder = Uri::builder();
    if let Some(scheme) = req.uri().scheme() {
        builder = builder.scheme(scheme.clone());
    }
    if let Some(authority) = req.uri().authority() {
        builder = builder.authority(authority.clone());
    }
    match builder.path_and_query(path_and_query).build() {
        Ok(uri) => *req.uri_mut() = uri,
        Err(e) => warn!("query rewrite produced an invalid uri: {e}"),
    }
}

fn query_pairs(ctx: &FilterContext) -> Vec<(String, String)> {
    ctx.request()
        .and_then(|req| req.uri().query())
        .map(|query| {
            query
                .split('&')
                .filter(|pair| !pair.is_empty())
                .map(|pair| match pair.split_once('=') {
                    Some((k, v)) => (k.to_string(), v.to_string()),
                    None => (pair.to_string(), String::new()),
                })
                .collect()
        })
        .unwrap_or_default()
}

fn encode_pairs(pairs: &[(String, String)]) -> String {
    pairs
        .iter()
        .map(|(k, v)| {
            if v.is_empty() {
                k.clone()
            } else {
                format!("{k}={v}")
            }
        })
        .collect::<Vec<_>>()
        .join("&")
}

/// Remove the whole query string.
pub(super) struct StripQuery;

impl StripQuery {
    pub(super) fn create(args: &[Arg]) -> Result<Rc<dyn Filter>, CreateError> {
        args.require_len(0)?;
        Ok(Rc::new(Self))
    }
}

#[async_trait(?Send)]
impl Filter for StripQuery {
    async fn request(&self, ctx: &mut FilterContext) {
        rewrite_query(ctx, None);
    }
}

/// Set (or replace) one query parameter.
pub(super) struct SetQuery {
    key: String,
    value: String,
}

impl SetQuery {
    pub(super) fn create(args: &[Arg]) -> Result<Rc<dyn Filter>, CreateError> {
        args.require_len(2)?;
        Ok(Rc::new(Self {
            key: args.string_at(0)?,
            value: args.string_at(1)?,
        }))
    }
}

#[async_trait(?Send)]
impl Filter for SetQuery {
    async fn request(&self, ctx: &mut FilterContext) {
        let mut pairs = query_pairs(ctx);
        pairs.retain(|(k, _)| k != &self.key);
        pairs.push((self.key.clone(), self.value.clone()));
        rewrite_query(ctx, Some(encode_pairs(&pairs)));
    }
}

/// Remove one query parameter.
pub(super) struct DropQuery {
    key: String,
}

impl DropQuery {
    pub(super) fn create(args: &[Arg]) -> Result<Rc<dyn Filter>, CreateError> {
        args.require_len(1)?;
        Ok(Rc::new(Self {
            key: args.string_at(0)?,
        }))
    }
}

#[async_trait(?Send)]
impl Filter for DropQuery {
    async fn request(&self, ctx: &mut FilterContext) {
        let mut pairs = query_pairs(ctx);
        pairs.retain(|(k, _)| k != &self.key);
        let query = if pairs.is_empty() {
            None
        } else {
            Some(encode_pairs(&pairs))
        };
        rewrite_query(ctx, query);
    }
}
