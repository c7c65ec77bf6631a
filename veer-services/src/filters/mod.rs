//! Builtin filters and their registry.
mod auth;
mod breaker;
mod content;
mod dynamic;
mod headers;
mod path;
mod query;
mod scheduler;
mod tee;

use std::rc::Rc;

pub use auth::TOKENINFO_BAG_KEY;
pub use breaker::BreakerRegistry;
use veer_core::{
    filter::{Filter, FilterFactory, FilterRegistry},
    route::{Arg, CreateError},
};

use crate::tokeninfo::TokeninfoClient;

/// Registry with every builtin filter registered.
///
/// `tokeninfo` is optional: without it the auth filters stay registered but
/// fail route creation with a configuration error.
pub fn builtin_registry(
    tokeninfo: Option<Rc<TokeninfoClient>>,
    breakers: Rc<BreakerRegistry>,
) -> FilterRegistry {
    let mut registry = FilterRegistry::new();
    registry.register("setRequestHeader", factory(headers::SetRequestHeader::create));
    registry.register(
        "setResponseHeader",
        factory(headers::SetResponseHeader::create),
    );
    registry.register(
        "dropRequestHeader",
        factory(headers::DropRequestHeader::create),
    );
    registry.register(
        "dropResponseHeader",
        factory(headers::DropResponseHeader::create),
    );
    registry.register("setPath", factory(path::SetPath::create));
    registry.register("modPath", factory(path::ModPath::create));
    registry.register("stripQuery", factory(query::StripQuery::create));
    registry.register("setQuery", factory(query::SetQuery::create));
    registry.register("dropQuery", factory(query::DropQuery::create));
    registry.register("inlineContent", factory(content::InlineContent::create));
    registry.register("status", factory(content::Status::create));
    registry.register("redirectTo", factory(content::RedirectTo::create));
    registry.register("maxContentLength", factory(content::MaxContentLength::create));
    registry.register(
        "setDynamicBackendUrl",
        factory(dynamic::SetDynamicBackendUrl::create),
    );
    registry.register("preserveHost", factory(dynamic::PreserveHost::create));
    registry.register("tee", factory(tee::Tee::create));
    registry.register("fifo", factory(scheduler::SchedulerFilter::create_fifo));
    registry.register("lifo", factory(scheduler::SchedulerFilter::create_lifo));

    {
        let breakers = breakers.clone();
        registry.register(
            "consecutiveBreaker",
            Rc::new(move |args: &[Arg]| {
                breaker::BreakerFilter::create_consecutive(breakers.clone(), args)
            }),
        );
    }
    registry.register(
        "rateBreaker",
        Rc::new(move |args: &[Arg]| breaker::BreakerFilter::create_rate(breakers.clone(), args)),
    );

    {
        let tokeninfo_any = tokeninfo.clone();
        registry.register(
            "oauthTokeninfoAnyScope",
            Rc::new(move |args: &[Arg]| {
                auth::OauthTokeninfoScope::create_any(tokeninfo_any.clone(), args)
            }),
        );
    }
    registry.register(
        "oauthTokeninfoAllScope",
        Rc::new(move |args: &[Arg]| {
            auth::OauthTokeninfoScope::create_all(tokeninfo.clone(), args)
        }),
    );

    registry
}

fn factory(f: fn(&[Arg]) -> Result<Rc<dyn Filter>, CreateError>) -> Rc<dyn FilterFactory> {
    Rc::new(f)
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use http::{Request, StatusCode};
    use monoio_http::common::body::{FixedBody, HttpBody};
    use tracing::Span;
    use veer_core::{filter::FilterContext, metrics::default_metrics};

    use super::*;

    fn registry() -> FilterRegistry {
        builtin_registry(None, Rc::new(BreakerRegistry::new()))
    }

    fn ctx(uri: &str) -> FilterContext {
        let req = Request::builder()
            .uri(uri)
            .body(HttpBody::fixed_body(None))
            .unwrap();
        FilterContext::new(req, "t".into(), None, default_metrics(), Span::none())
    }

    #[monoio::test]
    async fn set_request_header_mutates_in_pipeline_view() {
        let f = registry()
            .create("setRequestHeader", &["X-A".into(), "1".into()])
            .unwrap();
        let mut ctx = ctx("/");
        f.request(&mut ctx).await;
        assert_eq!(ctx.request().unwrap().headers().get("x-a").unwrap(), "1");
        // the original head stays untouched
        assert!(ctx.original_request().headers.get("x-a").is_none());
    }

    #[monoio::test]
    async fn set_path_preserves_query() {
        let f = registry().create("setPath", &["/y".into()]).unwrap();
        let mut ctx = ctx("/x?k=v");
        f.request(&mut ctx).await;
        let uri = ctx.request().unwrap().uri();
        assert_eq!(uri.path(), "/y");
        assert_eq!(uri.query(), Some("k=v"));
    }

    #[monoio::test]
    async fn query_filters_rewrite_pairs() {
        let set = registry().create("setQuery", &["v".into(), "2".into()]).unwrap();
        let drop = registry().create("dropQuery", &["k".into()]).unwrap();
        let strip = registry().create("stripQuery", &[]).unwrap();

        let mut ctx = ctx("/p?k=1&other=x");
        set.request(&mut ctx).await;
        assert_eq!(
            ctx.request().unwrap().uri().query(),
            Some("k=1&other=x&v=2")
        );
        drop.request(&mut ctx).await;
        assert_eq!(ctx.request().unwrap().uri().query(), Some("other=x&v=2"));
        strip.request(&mut ctx).await;
        assert_eq!(ctx.request().unwrap().uri().query(), None);
        assert_eq!(ctx.request().unwrap().uri().path(), "/p");
    }

    #[monoio::test]
    async fn redirect_to_serves_location() {
        let f = registry()
            .create("redirectTo", &[301.into(), "https://example.org/new".into()])
            .unwrap();
        let mut ctx = ctx("/old");
        f.request(&mut ctx).await;
        assert!(ctx.is_served());
        let resp = ctx.response().unwrap();
        assert_eq!(resp.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(
            resp.headers().get(http::header::LOCATION).unwrap(),
            "https://example.org/new"
        );
    }

    #[monoio::test]
    async fn mod_path_substitutes() {
        let f = registry()
            .create("modPath", &["^/api/v1".into(), "/api/v2".into()])
            .unwrap();
        let mut ctx = ctx("/api/v1/users");
        f.request(&mut ctx).await;
        assert_eq!(ctx.request().unwrap().uri().path(), "/api/v2/users");
    }

    #[monoio::test]
    async fn inline_content_serves_and_status_overrides() {
        let inline = registry().create("inlineContent", &["ok".into()]).unwrap();
        let status = registry().create("status", &[201.into()]).unwrap();
        let mut ctx = ctx("/");
        inline.request(&mut ctx).await;
        assert!(ctx.is_served());
        assert_eq!(ctx.response().unwrap().status(), StatusCode::OK);
        status.response(&mut ctx).await;
        assert_eq!(ctx.response().unwrap().status(), StatusCode::CREATED);
    }

    #[monoio::test]
    async fn max_content_length_rejects_oversized() {
        let f = registry().create("maxContentLength", &[10.into()]).unwrap();
        let req = Request::builder()
            .uri("/")
            .header("content-length", "11")
            .body(HttpBody::fixed_body(None))
            .unwrap();
        let mut ctx =
            FilterContext::new(req, "t".into(), None, default_metrics(), Span::none());
        f.request(&mut ctx).await;
        assert!(ctx.is_served());
        assert_eq!(
            ctx.response().unwrap().status(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
    }

    #[monoio::test]
    async fn dynamic_backend_url_sets_outgoing_fields() {
        let f = registry()
            .create("setDynamicBackendUrl", &["http://shadow.local:8080".into()])
            .unwrap();
        let mut ctx = ctx("/");
        f.request(&mut ctx).await;
        assert_eq!(ctx.outgoing_host(), Some("shadow.local:8080"));
    }

    #[monoio::test]
    async fn auth_filters_require_configuration() {
        let err = registry()
            .create("oauthTokeninfoAnyScope", &["read".into()])
            .unwrap_err();
        assert!(err.to_string().contains("not configured"));
    }

    #[test]
    fn unknown_filter_is_an_error() {
        assert!(registry().create("nonExistentFilter", &[]).is_err());
    }
}
