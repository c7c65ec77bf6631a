//! Filter trait, factory registry and the per-request [`FilterContext`].
mod context;

use std::{collections::HashMap, rc::Rc};

use async_trait::async_trait;
pub use context::{FilterContext, RequestHead, ResponseHead};

use crate::route::{Arg, CreateError};

/// A two-sided request/response interceptor.
///
/// `request` hooks run in route declaration order, `response` hooks in exact
/// reverse order. Hooks communicate through the context (state bag, serve,
/// loopback); they do not return errors — a filter that wants to fail the
/// request serves an error response. Panics are caught by the pipeline.
#[async_trait(?Send)]
pub trait Filter {
    async fn request(&self, _ctx: &mut FilterContext) {}

    async fn response(&self, _ctx: &mut FilterContext) {}

    /// Release resources owned by this instance. Called once the route table
    /// generation that created the filter has fully drained.
    fn close(&self) {}
}

pub trait FilterFactory {
    fn create(&self, args: &[Arg]) -> Result<Rc<dyn Filter>, CreateError>;
}

impl<F> FilterFactory for F
where
    F: Fn(&[Arg]) -> Result<Rc<dyn Filter>, CreateError>,
{
    fn create(&self, args: &[Arg]) -> Result<Rc<dyn Filter>, CreateError> {
        (self)(args)
    }
}

#[derive(Default)]
pub struct FilterRegistry {
    factories: HashMap<String, Rc<dyn FilterFactory>>,
}

impl FilterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, factory: Rc<dyn FilterFactory>) {
        self.factories.insert(name.into(), factory);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn create(&self, name: &str, args: &[Arg]) -> Result<Rc<dyn Filter>, RegistryError> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| RegistryError::Unknown(name.to_string()))?;
        factory
            .create(args)
            .map_err(|e| RegistryError::Creation(name.to_string(), e))
    }
}

#[derive(thiserror::Error, Debug)]
pub enum RegistryError {
    #[error("unknown filter {0}")]
    Unknown(String),
    #[error("filter {0} creation failed: {1}")]
    Creation(String, CreateError),
}
