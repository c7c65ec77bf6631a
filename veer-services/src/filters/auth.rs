//! Bearer token authentication backed by the tokeninfo client.
use std::rc::Rc;

use async_trait::async_trait;
use http::{HeaderValue, Response, StatusCode};
use monoio_http::common::body::{FixedBody, HttpBody};
use serde_json::Value;
use tracing::debug;
use veer_core::{
    filter::{Filter, FilterContext},
    route::{Arg, CreateError},
};

use crate::tokeninfo::{Claims, TokeninfoClient, TokeninfoError};

/// State-bag key under which validated claims are exposed to later filters.
pub const TOKENINFO_BAG_KEY: &str = "auth.tokeninfo";

enum ScopeMode {
    Any,
    All,
}

pub(super) struct OauthTokeninfoScope {
    client: Rc<TokeninfoClient>,
    scopes: Vec<String>,
    mode: ScopeMode,
}

impl OauthTokeninfoScope {
    fn create(
        client: Option<Rc<TokeninfoClient>>,
        args: &[Arg],
        mode: ScopeMode,
    ) -> Result<Rc<dyn Filter>, CreateError> {
        let client = client.ok_or_else(|| {
            CreateError::Other("tokeninfo is not configured on this server".to_string())
        })?;
        if args.is_empty() {
            return Err(CreateError::ArgCount {
                expected: 1,
                got: 0,
            });
        }
        let scopes = args
            .iter()
            .enumerate()
            .map(|(pos, arg)| {
                arg.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| CreateError::invalid_arg(pos, "expected a scope string"))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Rc::new(Self {
            client,
            scopes,
            mode,
        }))
    }

    pub(super) fn create_any(
        client: Option<Rc<TokeninfoClient>>,
        args: &[Arg],
    ) -> Result<Rc<dyn Filter>, CreateError> {
        Self::create(client, args, ScopeMode::Any)
    }

    pub(super) fn create_all(
        client: Option<Rc<TokeninfoClient>>,
        args: &[Arg],
    ) -> Result<Rc<dyn Filter>, CreateError> {
        Self::create(client, args, ScopeMode::All)
    }

    fn scopes_satisfied(&self, claims: &Claims) -> bool {
        let granted: Vec<&str> = claims
            .get("scope")
            .and_then(Value::as_array)
            .map(|scopes| scopes.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();
        match self.mode {
            ScopeMode::Any => self
                .scopes
                .iter()
                .any(|wanted| granted.contains(&wanted.as_str())),
            ScopeMode::All => self
                .scopes
                .iter()
                .all(|wanted| granted.contains(&wanted.as_str())),
        }
    }
}

#[async_trait(?Send)]
impl Filter for OauthTokeninfoScope {
    async fn request(&self, ctx: &mut FilterContext) {
        let token = ctx
            .request()
            .and_then(|req| req.headers().get(http::header::AUTHORIZATION))
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::to_string);
        let Some(token) = token else {
            ctx.serve(unauthorized());
            return;
        };

        match self.client.get_tokeninfo(&token).await {
            Ok(claims) => {
                if self.scopes_satisfied(&claims) {
                    ctx.state_bag_mut()
                        .insert(TOKENINFO_BAG_KEY.to_string(), Rc::new(claims));
                } else {
                    debug!("token lacks required scopes");
                    ctx.serve_status(StatusCode::FORBIDDEN);
                }
            }
            Err(TokeninfoError::InvalidToken) => ctx.serve(unauthorized()),
            Err(TokeninfoError::Unreachable(reason)) => {
                debug!(%reason, "tokeninfo endpoint unavailable");
                ctx.serve_status(StatusCode::BAD_GATEWAY);
            }
        }
    }
}

fn unauthorized() -> Response<HttpBody> {
    let mut builder = Response::builder().status(StatusCode::UNAUTHORIZED);
    let headers = builder.headers_mut().expect("fresh response builder");
    headers.insert(
        http::header::WWW_AUTHENTICATE,
        HeaderValue::from_static("Bearer"),
    );
    headers.insert(
        http::header::CONTENT_LENGTH,
        HeaderValue::from_static("0"),
    );
    builder
        .body(HttpBody::fixed_body(None))
        .expect("static response must build")
}
