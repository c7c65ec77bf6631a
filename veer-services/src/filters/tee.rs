//! Shadow-traffic fan-out.
use std::rc::Rc;

use async_trait::async_trait;
use http::{HeaderValue, Request, Uri};
use monoio_http::common::body::{FixedBody, HttpBody};
use tracing::debug;
use veer_core::{
    filter::{Filter, FilterContext},
    route::{Arg, ArgsExt, CreateError},
};

use crate::proxy::Forwarder;

/// Mirror the request head to a shadow target without blocking, or
/// affecting, the primary pipeline.
pub(super) struct Tee {
    authority: http::uri::Authority,
    forwarder: Rc<Forwarder>,
}

impl Tee {
    pub(super) fn create(args: &[Arg]) -> Result<Rc<dyn Filter>, CreateError> {
        args.require_len(1)?;
        let uri: Uri = args
            .string_at(0)?
            .parse()
            .map_err(|e| CreateError::invalid_arg(0, format!("invalid url: {e}")))?;
        let authority = uri
            .authority()
            .cloned()
            .ok_or_else(|| CreateError::invalid_arg(0, "url has no host"))?;
        Ok(Rc::new(Self {
            authority,
            forwarder: Rc::new(Forwarder::with_timeouts(
                Some(std::time::Duration::from_secs(1)),
                Some(std::time::Duration::from_secs(5)),
            )),
        }))
    }
}

#[async_trait(?Send)]
impl Filter for Tee {
    async fn request(&self, ctx: &mut FilterContext) {
        // detach a context so the shadow call cannot touch the primary
        // response
        let mut split = ctx.split();
        let head = split.latest_request_head().clone();
        let Some(path_and_query) = head.uri.path_and_query().cloned() else {
            return;
        };
        let uri = match Uri::builder()
            .scheme(http::uri::Scheme::HTTP)
            .authority(self.authority.clone())
            .path_and_query(path_and_query)
            .build()
        {
            Ok(uri) => uri,
            Err(e) => {
                debug!("shadow target uri invalid: {e}");
                return;
            }
        };
        let mut builder = Request::builder().method(head.method.clone()).uri(uri);
        if let Some(headers) = builder.headers_mut() {
            *headers = head.headers.clone();
            if let Ok(host) = HeaderValue::from_str(self.authority.as_str()) {
                headers.insert(http::header::HOST, host);
            }
            headers.remove(http::header::CONTENT_LENGTH);
        }
        let Ok(req) = builder.body(HttpBody::fixed_body(None)) else {
            return;
        };

        let forwarder = self.forwarder.clone();
        monoio::spawn(async move {
            if let Err(e) = forwarder.send(req).await {
                debug!("shadow request failed: {e}");
            }
        });
    }
}
