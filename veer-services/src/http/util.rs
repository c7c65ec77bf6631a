use std::future::Future;

use http::{Request, Response, StatusCode};
use monoio_http::common::body::FixedBody;
use service_async::{
    layer::{layer_fn, FactoryLayer},
    MakeService, Service,
};
use veer_core::http::{HttpError, ResponseWithContinue};

/// Build a bare response with an empty body; `close` additionally asks the
/// client to drop the connection.
pub fn generate_response<B: FixedBody>(status: StatusCode, close: bool) -> Response<B> {
    let mut builder = Response::builder().status(status);
    let headers = builder.headers_mut().expect("fresh response builder");
    if close {
        headers.insert(http::header::CONNECTION, super::CLOSE_VALUE);
    }
    headers.insert(
        http::header::CONTENT_LENGTH,
        http::HeaderValue::from_static("0"),
    );
    builder
        .body(B::fixed_body(None))
        .expect("static response must build")
}

/// Drive `main` while concurrently pumping `accompany` (typically the h1
/// request-body fill future); resolves with `main`'s output.
pub(crate) async fn drive_accompanied<M, A>(main: M, accompany: A) -> M::Output
where
    M: Future,
    A: Future,
{
    let mut main = std::pin::pin!(main);
    let mut accompany = std::pin::pin!(accompany);
    let mut accompany_done = false;
    std::future::poll_fn(|cx| {
        if !accompany_done && accompany.as_mut().poll(cx).is_ready() {
            accompany_done = true;
        }
        main.as_mut().poll(cx)
    })
    .await
}

/// Read a body to completion into one buffer.
pub async fn collect_body(
    mut body: monoio_http::common::body::HttpBody,
) -> Result<bytes::Bytes, String> {
    use monoio_http::common::body::{Body, StreamHint};
    match body.stream_hint() {
        StreamHint::None => Ok(bytes::Bytes::new()),
        StreamHint::Fixed => match body.next_data().await {
            Some(Ok(data)) => Ok(data),
            Some(Err(e)) => Err(format!("{e:?}")),
            None => Ok(bytes::Bytes::new()),
        },
        StreamHint::Stream => {
            let mut buf = bytes::BytesMut::new();
            while let Some(chunk) = body.next_data().await {
                match chunk {
                    Ok(data) => buf.extend_from_slice(&data),
                    Err(e) => return Err(format!("{e:?}")),
                }
            }
            Ok(buf.freeze())
        }
    }
}

/// Converts renderable handler errors into responses so that only fatal
/// errors escalate to the connection loop.
pub struct HttpErrorResponder<S>(pub S);

impl<S, CX, B, BOut> Service<(Request<B>, CX)> for HttpErrorResponder<S>
where
    S: Service<(Request<B>, CX), Response = ResponseWithContinue<BOut>>,
    S::Error: HttpError<BOut>,
{
    type Response = ResponseWithContinue<BOut>;
    type Error = S::Error;

    async fn call(&self, req: (Request<B>, CX)) -> Result<Self::Response, Self::Error> {
        match self.0.call(req).await {
            Ok(resp) => Ok(resp),
            Err(e) => match e.to_response() {
                Some(resp) => Ok((resp, true)),
                None => Err(e),
            },
        }
    }
}

impl<F: MakeService> MakeService for HttpErrorResponder<F> {
    type Service = HttpErrorResponder<F::Service>;
    type Error = F::Error;

    fn make_via_ref(&self, old: Option<&Self::Service>) -> Result<Self::Service, Self::Error> {
        Ok(HttpErrorResponder(self.0.make_via_ref(old.map(|o| &o.0))?))
    }
}

impl<F> HttpErrorResponder<F> {
    pub fn layer<C>() -> impl FactoryLayer<C, F, Factory = Self> {
        layer_fn(|_: &C, inner| HttpErrorResponder(inner))
    }
}
