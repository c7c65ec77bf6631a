//! HTTP abstractions shared by the connection stack and the proxy pipeline.
use std::future::Future;

use http::{Request, Response};
use service_async::Service;

/// A response paired with a flag telling the connection loop whether the
/// connection may be kept alive for a next request.
pub type ResponseWithContinue<B> = (Response<B>, bool);

/// An accepted connection after protocol detection: `(is_h2, stream, ctx)`.
pub type HttpAccept<Stream, CX> = (bool, Stream, CX);

/// Errors that know how to render themselves as an HTTP response.
///
/// Returning `None` marks the error as fatal for the connection; the
/// connection loop replies 500 and closes.
pub trait HttpError<B> {
    fn to_response(&self) -> Option<Response<B>>;
}

impl<B> HttpError<B> for std::convert::Infallible {
    fn to_response(&self) -> Option<Response<B>> {
        match *self {}
    }
}

/// Request-level handler abstraction: anything callable as a
/// `Service<(Request<B>, CX)>` returning [`ResponseWithContinue`].
pub trait HttpHandler<CX, B> {
    type Body;
    type Error;

    fn handle(
        &self,
        request: Request<B>,
        ctx: CX,
    ) -> impl Future<Output = Result<ResponseWithContinue<Self::Body>, Self::Error>>;
}

impl<T, CX, B, BOut> HttpHandler<CX, B> for T
where
    T: Service<(Request<B>, CX), Response = ResponseWithContinue<BOut>>,
{
    type Body = BOut;
    type Error = T::Error;

    fn handle(
        &self,
        request: Request<B>,
        ctx: CX,
    ) -> impl Future<Output = Result<ResponseWithContinue<BOut>, Self::Error>> {
        self.call((request, ctx))
    }
}
