//! Panic containment at the pipeline boundary.
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use service_async::{
    layer::{layer_fn, FactoryLayer},
    MakeService, Service,
};

pub struct CatchPanicService<S> {
    pub inner: S,
}

#[derive(thiserror::Error, Debug)]
pub enum CatchPanicError<E> {
    #[error("inner error: {0:?}")]
    Inner(E),
    // a String keeps the error Sync; the payload itself is Box<dyn Any + Send>
    #[error("inner panic: {0}")]
    Panic(String),
}

impl<R, S> Service<R> for CatchPanicService<S>
where
    S: Service<R>,
{
    type Response = S::Response;
    type Error = CatchPanicError<S::Error>;

    async fn call(&self, req: R) -> Result<Self::Response, Self::Error> {
        match AssertUnwindSafe(self.inner.call(req)).catch_unwind().await {
            Ok(Ok(r)) => Ok(r),
            Ok(Err(e)) => Err(CatchPanicError::Inner(e)),
            Err(e) => Err(CatchPanicError::Panic(payload_text(&e))),
        }
    }
}

/// Best-effort extraction of a panic payload message.
pub(crate) fn payload_text(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

impl<B, E> veer_core::http::HttpError<B> for CatchPanicError<E>
where
    B: monoio_http::common::body::FixedBody,
    E: veer_core::http::HttpError<B>,
{
    fn to_response(&self) -> Option<http::Response<B>> {
        match self {
            CatchPanicError::Inner(e) => e.to_response(),
            CatchPanicError::Panic(_) => Some(crate::http::generate_response(
                http::StatusCode::INTERNAL_SERVER_ERROR,
                false,
            )),
        }
    }
}

impl<F> CatchPanicService<F> {
    pub fn layer<C>() -> impl FactoryLayer<C, F, Factory = Self> {
        layer_fn(|_c: &C, inner| CatchPanicService { inner })
    }
}

impl<F: MakeService> MakeService for CatchPanicService<F> {
    type Service = CatchPanicService<F::Service>;
    type Error = F::Error;

    fn make_via_ref(&self, old: Option<&Self::Service>) -> Result<Self::Service, Self::Error> {
        Ok(CatchPanicService {
            inner: self.inner.make_via_ref(old.map(|o| &o.inner))?,
        })
    }
}
