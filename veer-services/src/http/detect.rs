//! Pattern detection on raw accepted streams.
//!
//! Consumed prefix bytes are re-attached through [`PrefixedReadIo`] so the
//! inner service sees an untouched stream.
use std::{future::Future, io, io::Cursor};

use monoio::{
    buf::IoBufMut,
    io::{AsyncReadRent, PrefixedReadIo},
};
use service_async::{
    layer::{layer_fn, FactoryLayer},
    MakeService, Service,
};

const H2_PREFACE: &[u8; 24] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Detect a pattern at the head of the input stream and hand back the
/// (possibly re-prefixed) stream together with the detection result.
pub trait Detect<IO> {
    type DetOut;
    type IOOut;

    fn detect(&self, io: IO) -> impl Future<Output = io::Result<(Self::DetOut, Self::IOOut)>>;
}

pub struct DetectService<D, S> {
    pub detector: D,
    pub inner: S,
}

#[derive(thiserror::Error, Debug)]
pub enum DetectError<E> {
    #[error("service error: {0:?}")]
    Svc(E),
    #[error("io error: {0:?}")]
    Io(std::io::Error),
}

impl<R, S, D, CX> Service<(R, CX)> for DetectService<D, S>
where
    D: Detect<R>,
    S: Service<(D::DetOut, D::IOOut, CX)>,
{
    type Response = S::Response;
    type Error = DetectError<S::Error>;

    async fn call(&self, (io, cx): (R, CX)) -> Result<Self::Response, Self::Error> {
        let (det, io) = self.detector.detect(io).await.map_err(DetectError::Io)?;
        self.inner
            .call((det, io, cx))
            .await
            .map_err(DetectError::Svc)
    }
}

/// Matches a static prefix; returns whether it matched in full, plus the
/// stream with everything read so far re-attached.
pub struct PrefixDetector(pub &'static [u8]);

impl<IO> Detect<IO> for PrefixDetector
where
    IO: AsyncReadRent,
{
    type DetOut = bool;
    type IOOut = PrefixedReadIo<IO, Cursor<Vec<u8>>>;

    async fn detect(&self, mut io: IO) -> io::Result<(Self::DetOut, Self::IOOut)> {
        let l = self.0.len();
        let mut written = 0;
        let mut buf: Vec<u8> = Vec::with_capacity(l);
        let mut eq = true;
        loop {
            // # Safety
            // The buffer was allocated with capacity l >= written.
            let buf_slice = unsafe { buf.slice_mut_unchecked(written..l) };
            let (result, buf_slice) = io.read(buf_slice).await;
            buf = buf_slice.into_inner();
            match result? {
                0 => {
                    break;
                }
                n => {
                    let curr = written;
                    written += n;
                    if self.0[curr..written] != buf[curr..written] {
                        eq = false;
                        break;
                    }
                }
            }
        }
        let io = PrefixedReadIo::new(io, Cursor::new(buf));
        Ok((eq && written == l, io))
    }
}

/// Distinguishes h2 connections by their client preface.
pub struct H2Detect<T> {
    inner: T,
}

impl<F: MakeService> MakeService for H2Detect<F> {
    type Service = DetectService<PrefixDetector, F::Service>;
    type Error = F::Error;

    fn make_via_ref(&self, old: Option<&Self::Service>) -> Result<Self::Service, Self::Error> {
        Ok(DetectService {
            inner: self.inner.make_via_ref(old.map(|o| &o.inner))?,
            detector: PrefixDetector(H2_PREFACE),
        })
    }
}

impl<F> H2Detect<F> {
    pub fn layer<C>() -> impl FactoryLayer<C, F, Factory = Self> {
        layer_fn(|_: &C, inner| H2Detect { inner })
    }
}
