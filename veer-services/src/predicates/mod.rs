//! Builtin free predicates.
//!
//! `Path`/`PathSubtree` are tree predicates handled by the table builder and
//! are deliberately absent here.
use std::rc::Rc;

use http::{Method, Request};
use monoio_http::common::body::HttpBody;
use regex::Regex;
use veer_core::{
    predicate::{Predicate, PredicateFactory, PredicateRegistry},
    route::{Arg, ArgsExt, CreateError},
};

/// Registry with every builtin predicate registered.
pub fn builtin_registry() -> PredicateRegistry {
    let mut registry = PredicateRegistry::new();
    registry.register("Method", factory(create_method));
    registry.register("Host", factory(create_host));
    registry.register("PathRegexp", factory(create_path_regexp));
    registry.register("Header", factory(create_header));
    registry.register("HeaderRegexp", factory(create_header_regexp));
    registry.register("Cookie", factory(create_cookie));
    registry.register("QueryParam", factory(create_query_param));
    registry.register("Weight", factory(create_weight));
    registry.register("True", factory(|args| {
        args.require_len(0)?;
        Ok(Rc::new(Fixed(true)) as Rc<dyn Predicate>)
    }));
    registry.register("False", factory(|args| {
        args.require_len(0)?;
        Ok(Rc::new(Fixed(false)) as Rc<dyn Predicate>)
    }));
    registry
}

fn factory(
    f: fn(&[Arg]) -> Result<Rc<dyn Predicate>, CreateError>,
) -> Rc<dyn PredicateFactory> {
    Rc::new(f)
}

fn compile(pos: usize, pattern: &str) -> Result<Regex, CreateError> {
    Regex::new(pattern).map_err(|e| CreateError::invalid_arg(pos, e.to_string()))
}

struct Fixed(bool);

impl Predicate for Fixed {
    fn matches(&self, _req: &Request<HttpBody>) -> bool {
        self.0
    }
}

struct MethodPredicate(Method);

impl Predicate for MethodPredicate {
    fn matches(&self, req: &Request<HttpBody>) -> bool {
        req.method() == self.0
    }
}

fn create_method(args: &[Arg]) -> Result<Rc<dyn Predicate>, CreateError> {
    args.require_len(1)?;
    let method = args.string_at(0)?;
    let method = method
        .to_ascii_uppercase()
        .parse::<Method>()
        .map_err(|e| CreateError::invalid_arg(0, e.to_string()))?;
    Ok(Rc::new(MethodPredicate(method)))
}

struct HostPredicate(Regex);

impl Predicate for HostPredicate {
    fn matches(&self, req: &Request<HttpBody>) -> bool {
        let host = req
            .headers()
            .get(http::header::HOST)
            .and_then(|v| v.to_str().ok())
            .or_else(|| req.uri().host());
        host.is_some_and(|h| self.0.is_match(h))
    }
}

fn create_host(args: &[Arg]) -> Result<Rc<dyn Predicate>, CreateError> {
    args.require_len(1)?;
    Ok(Rc::new(HostPredicate(compile(0, &args.string_at(0)?)?)))
}

struct PathRegexpPredicate(Regex);

impl Predicate for PathRegexpPredicate {
    fn matches(&self, req: &Request<HttpBody>) -> bool {
        self.0.is_match(req.uri().path())
    }
}

fn create_path_regexp(args: &[Arg]) -> Result<Rc<dyn Predicate>, CreateError> {
    args.require_len(1)?;
    Ok(Rc::new(PathRegexpPredicate(compile(0, &args.string_at(0)?)?)))
}

struct HeaderPredicate {
    name: String,
    value: String,
}

impl Predicate for HeaderPredicate {
    fn matches(&self, req: &Request<HttpBody>) -> bool {
        req.headers()
            .get_all(&self.name)
            .iter()
            .any(|v| v.to_str().is_ok_and(|v| v == self.value))
    }
}

fn create_header(args: &[Arg]) -> Result<Rc<dyn Predicate>, CreateError> {
    args.require_len(2)?;
    Ok(Rc::new(HeaderPredicate {
        name: args.string_at(0)?.to_ascii_lowercase(),
        value: args.string_at(1)?,
    }))
}

struct HeaderRegexpPredicate {
    name: String,
    pattern: Regex,
}

impl Predicate for HeaderRegexpPredicate {
    fn matches(&self, req: &Request<HttpBody>) -> bool {
        req.headers()
            .get_all(&self.name)
            .iter()
            .any(|v| v.to_str().is_ok_and(|v| self.pattern.is_match(v)))
    }
}

fn create_header_regexp(args: &[Arg]) -> Result<Rc<dyn Predicate>, CreateError> {
    args.require_len(2)?;
    Ok(Rc::new(HeaderRegexpPredicate {
        name: args.string_at(0)?.to_ascii_lowercase(),
        pattern: compile(1, &args.string_at(1)?)?,
    }))
}

struct CookiePredicate {
    name: String,
    pattern: Regex,
}

impl Predicate for CookiePredicate {
    fn matches(&self, req: &Request<HttpBody>) -> bool {
        req.headers()
            .get_all(http::header::COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(';'))
            .filter_map(|pair| pair.trim().split_once('='))
            .any(|(name, value)| name == self.name && self.pattern.is_match(value))
    }
}

fn create_cookie(args: &[Arg]) -> Result<Rc<dyn Predicate>, CreateError> {
    args.require_len(2)?;
    Ok(Rc::new(CookiePredicate {
        name: args.string_at(0)?,
        pattern: compile(1, &args.string_at(1)?)?,
    }))
}

struct QueryParamPredicate {
    key: String,
    pattern: Option<Regex>,
}

impl Predicate for QueryParamPredicate {
    fn matches(&self, req: &Request<HttpBody>) -> bool {
        let Some(query) = req.uri().query() else {
            return false;
        };
        query
            .split('&')
            .map(|pair| pair.split_once('=').unwrap_or((pair, "")))
            .any(|(key, value)| {
                key == self.key
                    && self.pattern.as_ref().is_none_or(|p| p.is_match(value))
            })
    }
}

fn create_query_param(args: &[Arg]) -> Result<Rc<dyn Predicate>, CreateError> {
    if args.is_empty() || args.len() > 2 {
        return Err(CreateError::ArgCount {
            expected: 1,
            got: args.len(),
        });
    }
    let key = args.string_at(0)?;
    let pattern = if args.len() == 2 {
        Some(compile(1, &args.string_at(1)?)?)
    } else {
        None
    };
    Ok(Rc::new(QueryParamPredicate { key, pattern }))
}

struct WeightPredicate(i32);

impl Predicate for WeightPredicate {
    fn matches(&self, _req: &Request<HttpBody>) -> bool {
        true
    }

    fn weight(&self) -> i32 {
        self.0
    }
}

fn create_weight(args: &[Arg]) -> Result<Rc<dyn Predicate>, CreateError> {
    args.require_len(1)?;
    Ok(Rc::new(WeightPredicate(args.u64_at(0)? as i32)))
}

#[cfg(test)]
mod tests {
    use monoio_http::common::body::FixedBody;

    use super::*;

    fn req(builder: http::request::Builder) -> Request<HttpBody> {
        builder.body(HttpBody::fixed_body(None)).unwrap()
    }

    fn create(reg: &PredicateRegistry, name: &str, args: &[Arg]) -> Rc<dyn Predicate> {
        reg.create(name, args).unwrap()
    }

    #[test]
    fn method_matches_case_insensitively_configured() {
        let reg = builtin_registry();
        let p = create(&reg, "Method", &["get".into()]);
        assert!(p.matches(&req(Request::builder().method("GET").uri("/"))));
        assert!(!p.matches(&req(Request::builder().method("POST").uri("/"))));
    }

    #[test]
    fn host_uses_header_or_uri() {
        let reg = builtin_registry();
        let p = create(&reg, "Host", &["^api[.]example[.]org$".into()]);
        assert!(p.matches(&req(
            Request::builder().uri("/").header("host", "api.example.org")
        )));
        assert!(!p.matches(&req(
            Request::builder().uri("/").header("host", "www.example.org")
        )));
    }

    #[test]
    fn header_exact_and_regexp() {
        let reg = builtin_registry();
        let exact = create(&reg, "Header", &["X-Env".into(), "prod".into()]);
        let rx = create(&reg, "HeaderRegexp", &["X-Env".into(), "^pr".into()]);
        let r = req(Request::builder().uri("/").header("x-env", "prod"));
        assert!(exact.matches(&r));
        assert!(rx.matches(&r));
        let r = req(Request::builder().uri("/").header("x-env", "staging"));
        assert!(!exact.matches(&r));
        assert!(!rx.matches(&r));
    }

    #[test]
    fn cookie_parses_pairs() {
        let reg = builtin_registry();
        let p = create(&reg, "Cookie", &["session".into(), ".+".into()]);
        assert!(p.matches(&req(
            Request::builder().uri("/").header("cookie", "a=1; session=xyz")
        )));
        assert!(!p.matches(&req(Request::builder().uri("/").header("cookie", "a=1"))));
    }

    #[test]
    fn query_param_with_and_without_pattern() {
        let reg = builtin_registry();
        let present = create(&reg, "QueryParam", &["debug".into()]);
        let valued = create(&reg, "QueryParam", &["v".into(), "^2$".into()]);
        let r = req(Request::builder().uri("/p?debug&v=2"));
        assert!(present.matches(&r));
        assert!(valued.matches(&r));
        assert!(!valued.matches(&req(Request::builder().uri("/p?v=3"))));
    }

    #[test]
    fn weight_always_matches() {
        let reg = builtin_registry();
        let p = create(&reg, "Weight", &[5.into()]);
        assert!(p.matches(&req(Request::builder().uri("/"))));
        assert_eq!(p.weight(), 5);
    }

    #[test]
    fn bad_regex_fails_creation() {
        let reg = builtin_registry();
        assert!(reg.create("Host", &["[".into()]).is_err());
    }
}
