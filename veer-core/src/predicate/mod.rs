//! Predicate trait and the name → factory registry.
//!
//! Predicates decide whether a route accepts a request; they are ANDed
//! within a route. `Path`/`PathSubtree` are not registered here: the table
//! builder folds them into the path tree instead.
use std::{collections::HashMap, rc::Rc};

use http::Request;
use monoio_http::common::body::HttpBody;

use crate::route::{Arg, CreateError};

pub trait Predicate {
    /// Pure accept/reject decision. Must not fail: operational problems are
    /// logged by the implementation and reported as a non-match.
    fn matches(&self, req: &Request<HttpBody>) -> bool;

    /// Contribution to the owning route's matching weight.
    fn weight(&self) -> i32 {
        0
    }
}

pub trait PredicateFactory {
    fn create(&self, args: &[Arg]) -> Result<Rc<dyn Predicate>, CreateError>;
}

impl<F> PredicateFactory for F
where
    F: Fn(&[Arg]) -> Result<Rc<dyn Predicate>, CreateError>,
{
    fn create(&self, args: &[Arg]) -> Result<Rc<dyn Predicate>, CreateError> {
        (self)(args)
    }
}

#[derive(Default)]
pub struct PredicateRegistry {
    factories: HashMap<String, Rc<dyn PredicateFactory>>,
}

impl PredicateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, factory: Rc<dyn PredicateFactory>) {
        self.factories.insert(name.into(), factory);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn create(&self, name: &str, args: &[Arg]) -> Result<Rc<dyn Predicate>, RegistryError> {
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
    #[error("unknown predicate {0}")]
    Unknown(String),
    #[error("predicate {0} creation failed: {1}")]
    Creation(String, CreateError),
}
