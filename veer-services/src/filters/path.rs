//! Request path rewriting.
use std::rc::Rc;

use async_trait::async_trait;
use http::Uri;
use regex::Regex;
use tracing::warn;
use veer_core::{
    filter::{Filter, FilterContext},
    route::{Arg, ArgsExt, CreateError},
};

fn rewrite_path(ctx: &mut FilterContext, path: &str) {
    let Some(req) = ctx.request_mut() else { return };
    let path_and_query = match req.uri().query() {
        Some(query) => format!("{path}?{query}"),
        None => path.to_string(),
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
        Err(e) => warn!("path rewrite produced an invalid uri: {e}"),
    }
}

/// Replace the request path, keeping the query string.
pub(super) struct SetPath {
    path: String,
}

impl SetPath {
    pub(super) fn create(args: &[Arg]) -> Result<Rc<dyn Filter>, CreateError> {
        args.require_len(1)?;
        Ok(Rc::new(Self {
            path: args.string_at(0)?,
        }))
    }
}

#[async_trait(?Send)]
impl Filter for SetPath {
    async fn request(&self, ctx: &mut FilterContext) {
        rewrite_path(ctx, &self.path);
    }
}

/// Regex substitution over the request path.
pub(super) struct ModPath {
    pattern: Regex,
    replacement: String,
}

impl ModPath {
    pub(super) fn create(args: &[Arg]) -> Result<Rc<dyn Filter>, CreateError> {
        args.require_len(2)?;
        let pattern = Regex::new(&args.string_at(0)?)
            .map_err(|e| CreateError::invalid_arg(0, e.to_string()))?;
        Ok(Rc::new(Self {
            pattern,
            replacement: args.string_at(1)?,
        }))
    }
}

#[async_trait(?Send)]
impl Filter for ModPath {
    async fn request(&self, ctx: &mut FilterContext) {
        let Some(req) = ctx.request() else { return };
        let rewritten = self
            .pattern
            .replace_all(req.uri().path(), self.replacement.as_str())
            .into_owned();
        rewrite_path(ctx, &rewritten);
    }
}
