//! Runtime routing state: instantiated routes, immutable tables and the
//! worker-local publish cell.
pub mod builder;
pub mod dataclient;
pub mod multiplexer;

use std::{
    cell::UnsafeCell,
    collections::{HashMap, HashSet},
    rc::Rc,
    time::{Duration, SystemTime},
};

use http::Request;
use monoio_http::common::body::HttpBody;

use crate::{
    filter::Filter,
    lb::{LoadBalancer, NetworkTarget},
    matcher::{Matcher, PathPattern},
    predicate::Predicate,
    route::RouteDef,
};

/// A route definition with everything instantiated for serving.
pub struct Route {
    pub def: RouteDef,
    pub backend: Backend,
    pub filters: Vec<Rc<dyn Filter>>,
    pub free_predicates: Vec<Rc<dyn Predicate>>,
    pub weight: i32,
    pub path: Option<PathPattern>,
}

impl Route {
    pub fn id(&self) -> &str {
        &self.def.id
    }
}

/// Resolved backend of a route.
pub enum Backend {
    Network(NetworkTarget),
    Shunt,
    Loopback,
    Dynamic,
    Lb(LoadBalancer),
}

/// Why a route definition was excluded from a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteErrorKind {
    UnknownFilter,
    FilterCreationFailed,
    UnknownPredicate,
    PredicateCreationFailed,
    InvalidPredicate,
    InvalidBackend,
    UnsupportedBackend,
    InvalidPathPattern,
}

impl RouteErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteErrorKind::UnknownFilter => "unknown-filter",
            RouteErrorKind::FilterCreationFailed => "filter-creation-failed",
            RouteErrorKind::UnknownPredicate => "unknown-predicate",
            RouteErrorKind::PredicateCreationFailed => "predicate-creation-failed",
            RouteErrorKind::InvalidPredicate => "invalid-predicate",
            RouteErrorKind::InvalidBackend => "invalid-backend",
            RouteErrorKind::UnsupportedBackend => "unsupported-backend",
            RouteErrorKind::InvalidPathPattern => "invalid-path-pattern",
        }
    }
}

#[derive(Debug)]
pub struct InvalidRoute {
    pub id: String,
    pub reason: RouteErrorKind,
    pub detail: String,
}

/// Immutable snapshot of the routing state. Never mutated after publication;
/// shared by reference-counting with every in-flight request.
pub struct RouteTable {
    pub routes: Vec<Rc<Route>>,
    pub matcher: Matcher,
    pub generation: u64,
    pub created_at: SystemTime,
    pub invalid_routes: Vec<InvalidRoute>,
}

impl RouteTable {
    pub fn empty() -> Self {
        Self {
            routes: Vec::new(),
            matcher: Matcher::new(),
            generation: 0,
            created_at: SystemTime::now(),
            invalid_routes: Vec::new(),
        }
    }

    pub fn lookup(
        &self,
        req: &Request<HttpBody>,
    ) -> Option<(Rc<Route>, HashMap<String, String>)> {
        self.matcher
            .lookup(&self.routes, req)
            .map(|m| (self.routes[m.index].clone(), m.params))
    }
}

/// Worker-local publish cell for the current table.
///
/// Single writer (the builder task), many readers (request tasks). Readers
/// clone the inner `Rc` once at request start and keep that reference for the
/// whole request, loopback iterations included.
#[derive(Clone)]
pub struct TableHandle {
    // UnsafeCell lets the builder replace the published Rc in place.
    inner: Rc<UnsafeCell<Rc<RouteTable>>>,
}

impl TableHandle {
    pub fn new(initial: Rc<RouteTable>) -> Self {
        Self {
            inner: Rc::new(UnsafeCell::new(initial)),
        }
    }

    #[inline]
    pub fn load(&self) -> Rc<RouteTable> {
        // # Safety
        // The handle is !Sync, so only the owning thread touches the cell.
        // The borrow ends before any await point.
        unsafe { &*self.inner.get() }.clone()
    }

    pub fn publish(&self, table: Rc<RouteTable>) {
        // # Safety
        // Same single-thread argument as `load`; readers hold clones, never
        // references into the cell.
        unsafe { *self.inner.get() = table }
    }
}

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);
const DRAIN_POLL_LIMIT: usize = 100;

/// After publishing a new generation, wait for the previous table to drain
/// (reference count reaches one) and close filters of routes that were not
/// carried over, bounded by a drain deadline.
pub fn schedule_filter_close(old: Rc<RouteTable>, current: &RouteTable) {
    let kept: HashSet<*const Route> = current
        .routes
        .iter()
        .map(|r| Rc::as_ptr(r))
        .collect();
    monoio::spawn(async move {
        for _ in 0..DRAIN_POLL_LIMIT {
            if Rc::strong_count(&old) == 1 {
                break;
            }
            monoio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }
        let mut closed = 0usize;
        for route in &old.routes {
            if kept.contains(&Rc::as_ptr(route)) {
                continue;
            }
            for filter in &route.filters {
                filter.close();
                closed += 1;
            }
        }
        if closed > 0 {
            tracing::debug!(
                generation = old.generation,
                closed,
                "closed filters of retired route table"
            );
        }
    });
}
