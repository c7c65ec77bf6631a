//! Keep-alive negotiation between downstream clients and the pipeline.
use http::{HeaderMap, Request, Version};
use service_async::{
    layer::{layer_fn, FactoryLayer},
    MakeService, Service,
};
use tracing::debug;
use veer_core::http::{HttpHandler, ResponseWithContinue};

use super::{CLOSE, CLOSE_VALUE, KEEPALIVE, KEEPALIVE_VALUE};

/// Normalizes Connection semantics across HTTP/1.0, 1.1 and 2 and decides
/// whether the connection survives the current exchange.
#[derive(Clone)]
pub struct ConnectionReuseHandler<H> {
    inner: H,
}

impl<H, CX, B> Service<(Request<B>, CX)> for ConnectionReuseHandler<H>
where
    H: HttpHandler<CX, B>,
{
    type Response = ResponseWithContinue<H::Body>;
    type Error = H::Error;

    async fn call(
        &self,
        (mut request, ctx): (Request<B>, CX),
    ) -> Result<Self::Response, Self::Error> {
        let version = request.version();
        let keepalive = is_conn_keepalive(request.headers(), version);
        debug!("frontend keepalive {:?}", keepalive);

        match version {
            // treat 1.0 clients as 1.1 towards the upstream
            Version::HTTP_10 => {
                *request.version_mut() = Version::HTTP_11;
                let _ = request.headers_mut().remove(http::header::CONNECTION);

                let (mut response, mut cont) = self.inner.handle(request, ctx).await?;
                cont &= keepalive;

                let _ = response.headers_mut().remove(http::header::CONNECTION);
                if cont {
                    response
                        .headers_mut()
                        .insert(http::header::CONNECTION, KEEPALIVE_VALUE);
                }
                *response.version_mut() = version;

                Ok((response, cont))
            }
            Version::HTTP_11 => {
                let _ = request.headers_mut().remove(http::header::CONNECTION);

                let (mut response, mut cont) = self.inner.handle(request, ctx).await?;
                cont &= keepalive;

                let _ = response.headers_mut().remove(http::header::CONNECTION);
                if !cont {
                    response
                        .headers_mut()
                        .insert(http::header::CONNECTION, CLOSE_VALUE);
                }
                Ok((response, cont))
            }
            Version::HTTP_2 => {
                let (response, _) = self.inner.handle(request, ctx).await?;
                Ok((response, true))
            }
            _ => {
                let (response, _) = self.inner.handle(request, ctx).await?;
                Ok((response, false))
            }
        }
    }
}

fn is_conn_keepalive(headers: &HeaderMap, version: Version) -> bool {
    match (version, headers.get(http::header::CONNECTION)) {
        (Version::HTTP_10, Some(header)) => {
            header.to_str().is_ok_and(|v| v.eq_ignore_ascii_case(KEEPALIVE))
        }
        (Version::HTTP_11, None) => true,
        (Version::HTTP_11, Some(header)) => {
            !header.to_str().is_ok_and(|v| v.eq_ignore_ascii_case(CLOSE))
        }
        _ => false,
    }
}

impl<F: MakeService> MakeService for ConnectionReuseHandler<F> {
    type Service = ConnectionReuseHandler<F::Service>;
    type Error = F::Error;

    fn make_via_ref(&self, old: Option<&Self::Service>) -> Result<Self::Service, Self::Error> {
        Ok(ConnectionReuseHandler {
            inner: self.inner.make_via_ref(old.map(|o| &o.inner))?,
        })
    }
}

impl<F> ConnectionReuseHandler<F> {
    pub fn layer<C>() -> impl FactoryLayer<C, F, Factory = Self> {
        layer_fn(|_: &C, inner| ConnectionReuseHandler { inner })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keepalive_defaults_per_version() {
        let headers = HeaderMap::new();
        assert!(!is_conn_keepalive(&headers, Version::HTTP_10));
        assert!(is_conn_keepalive(&headers, Version::HTTP_11));

        let mut headers = HeaderMap::new();
        headers.insert(http::header::CONNECTION, CLOSE_VALUE);
        assert!(!is_conn_keepalive(&headers, Version::HTTP_11));

        let mut headers = HeaderMap::new();
        headers.insert(http::header::CONNECTION, KEEPALIVE_VALUE);
        assert!(is_conn_keepalive(&headers, Version::HTTP_10));
    }
}
