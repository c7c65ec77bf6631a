//! Turns merged route definitions into published route tables.
use std::{collections::HashMap, rc::Rc, time::Duration, time::SystemTime};

use tracing::{info, warn};

use super::{Backend, InvalidRoute, Route, RouteErrorKind, RouteTable, TableHandle};
use crate::{
    filter::{FilterRegistry, RegistryError as FilterRegistryError},
    lb::{LoadBalancer, NetworkTarget},
    matcher::{Matcher, PathPattern, PatternKind},
    metrics::Metrics,
    predicate::{PredicateRegistry, RegistryError as PredicateRegistryError},
    route::{ArgsExt, PredicateDef, RouteDef},
    routing::multiplexer::MergedDefs,
};

/// Hook applied to the definition list before instantiation.
pub trait PreProcessor {
    fn process(&self, defs: Vec<RouteDef>) -> Vec<RouteDef>;
}

/// Hook applied to the instantiated route list before matcher construction.
pub trait PostProcessor {
    fn process(&self, routes: Vec<Rc<Route>>) -> Vec<Rc<Route>>;
}

pub struct TableBuilder {
    filters: Rc<FilterRegistry>,
    predicates: Rc<PredicateRegistry>,
    pre_processors: Vec<Box<dyn PreProcessor>>,
    post_processors: Vec<Box<dyn PostProcessor>>,
    fade_in: Option<Duration>,
    metrics: Rc<dyn Metrics>,
    generation: u64,
    previous: HashMap<String, (RouteDef, Rc<Route>)>,
}

impl TableBuilder {
    pub fn new(
        filters: Rc<FilterRegistry>,
        predicates: Rc<PredicateRegistry>,
        fade_in: Option<Duration>,
        metrics: Rc<dyn Metrics>,
    ) -> Self {
        Self {
            filters,
            predicates,
            pre_processors: Vec::new(),
            post_processors: Vec::new(),
            fade_in,
            metrics,
            generation: 0,
            previous: HashMap::new(),
        }
    }

    pub fn add_pre_processor(&mut self, p: Box<dyn PreProcessor>) {
        self.pre_processors.push(p);
    }

    pub fn add_post_processor(&mut self, p: Box<dyn PostProcessor>) {
        self.post_processors.push(p);
    }

    /// Build the next table generation. Per-route errors exclude the route
    /// and never abort the update.
    pub fn build(&mut self, mut defs: Vec<RouteDef>) -> RouteTable {
        for p in &self.pre_processors {
            defs = p.process(defs);
        }

        let mut routes: Vec<Rc<Route>> = Vec::with_capacity(defs.len());
        let mut invalid = Vec::new();
        for def in defs {
            // Unchanged definitions keep their instances (and with them any
            // filter-owned resources and LB state) across generations.
            if let Some((prev_def, prev_route)) = self.previous.get(&def.id) {
                if *prev_def == def {
                    routes.push(prev_route.clone());
                    continue;
                }
            }
            match self.instantiate(&def) {
                Ok(route) => routes.push(Rc::new(route)),
                Err((reason, detail)) => {
                    self.metrics
                        .incr(&format!("routing.invalid_route.{}", reason.as_str()));
                    warn!(id = def.id.as_str(), reason = reason.as_str(), %detail, "route excluded");
                    invalid.push(InvalidRoute {
                        id: def.id,
                        reason,
                        detail,
                    });
                }
            }
        }

        for p in &self.post_processors {
            routes = p.process(routes);
        }

        // Matcher construction can still reject a pattern; drop the route
        // and retry so one bad pattern cannot block the table.
        let matcher = loop {
            let mut matcher = Matcher::new();
            let mut failed = None;
            for (index, route) in routes.iter().enumerate() {
                if let Err(e) = matcher.add(index, route.path.as_ref()) {
                    failed = Some((index, e));
                    break;
                }
            }
            match failed {
                None => break matcher,
                Some((index, e)) => {
                    let route = routes.remove(index);
                    self.metrics.incr(&format!(
                        "routing.invalid_route.{}",
                        RouteErrorKind::InvalidPathPattern.as_str()
                    ));
                    warn!(id = route.id(), error = %e, "route excluded");
                    invalid.push(InvalidRoute {
                        id: route.id().to_string(),
                        reason: RouteErrorKind::InvalidPathPattern,
                        detail: e.to_string(),
                    });
                }
            }
        };

        self.generation += 1;
        self.previous = routes
            .iter()
            .map(|r| (r.id().to_string(), (r.def.clone(), r.clone())))
            .collect();

        info!(
            generation = self.generation,
            routes = routes.len(),
            invalid = invalid.len(),
            "route table built"
        );
        RouteTable {
            routes,
            matcher,
            generation: self.generation,
            created_at: SystemTime::now(),
            invalid_routes: invalid,
        }
    }

    fn instantiate(&self, def: &RouteDef) -> Result<Route, (RouteErrorKind, String)> {
        let mut path = None;
        let mut free_defs: Vec<PredicateDef> = Vec::new();
        for pred in &def.predicates {
            match pred.name.as_str() {
                "Path" | "PathSubtree" => {
                    let pattern = pred.args.string_at(0).map_err(|e| {
                        (RouteErrorKind::PredicateCreationFailed, e.to_string())
                    })?;
                    if path.is_some() {
                        return Err((
                            RouteErrorKind::InvalidPredicate,
                            "at most one Path or PathSubtree predicate per route".to_string(),
                        ));
                    }
                    let kind = if pred.name == "Path" {
                        PatternKind::Exact
                    } else {
                        PatternKind::Subtree
                    };
                    path = Some(PathPattern { kind, pattern });
                }
                _ => free_defs.push(pred.clone()),
            }
        }
        free_defs.extend(def.legacy_predicates());

        let mut free_predicates = Vec::with_capacity(free_defs.len());
        let mut weight = 0i32;
        for pred in &free_defs {
            let instance = self.predicates.create(&pred.name, &pred.args).map_err(
                |e| match e {
                    PredicateRegistryError::Unknown(_) => {
                        (RouteErrorKind::UnknownPredicate, e.to_string())
                    }
                    PredicateRegistryError::Creation(..) => {
                        (RouteErrorKind::PredicateCreationFailed, e.to_string())
                    }
                },
            )?;
            weight += instance.weight();
            free_predicates.push(instance);
        }

        let mut filters = Vec::with_capacity(def.filters.len());
        for filter in &def.filters {
            let instance =
                self.filters
                    .create(&filter.name, &filter.args)
                    .map_err(|e| match e {
                        FilterRegistryError::Unknown(_) => {
                            (RouteErrorKind::UnknownFilter, e.to_string())
                        }
                        FilterRegistryError::Creation(..) => {
                            (RouteErrorKind::FilterCreationFailed, e.to_string())
                        }
                    })?;
            filters.push(instance);
        }

        let backend = self.resolve_backend(def)?;

        Ok(Route {
            def: def.clone(),
            backend,
            filters,
            free_predicates,
            weight,
            path,
        })
    }

    fn resolve_backend(&self, def: &RouteDef) -> Result<Backend, (RouteErrorKind, String)> {
        use crate::route::BackendDef;
        match &def.backend {
            BackendDef::Shunt => Ok(Backend::Shunt),
            BackendDef::Loopback => Ok(Backend::Loopback),
            BackendDef::Dynamic => Ok(Backend::Dynamic),
            BackendDef::Network { address } => {
                let target = NetworkTarget::from_uri(address)
                    .map_err(|e| (RouteErrorKind::InvalidBackend, e.to_string()))?;
                ensure_plain_http(&target)?;
                Ok(Backend::Network(target))
            }
            BackendDef::Lb {
                algorithm,
                endpoints,
            } => {
                let mut targets = Vec::with_capacity(endpoints.len());
                for uri in endpoints {
                    let target = NetworkTarget::from_uri(uri)
                        .map_err(|e| (RouteErrorKind::InvalidBackend, e.to_string()))?;
                    ensure_plain_http(&target)?;
                    targets.push(target);
                }
                let lb = LoadBalancer::new(*algorithm, targets, self.fade_in)
                    .map_err(|e| (RouteErrorKind::InvalidBackend, e.to_string()))?;
                if let Some((_, prev_route)) = self.previous.get(&def.id) {
                    if let Backend::Lb(prev_lb) = &prev_route.backend {
                        lb.start_fade_for_new(Some(prev_lb));
                    }
                }
                Ok(Backend::Lb(lb))
            }
        }
    }
}

fn ensure_plain_http(target: &NetworkTarget) -> Result<(), (RouteErrorKind, String)> {
    if target.scheme != http::uri::Scheme::HTTP {
        return Err((
            RouteErrorKind::UnsupportedBackend,
            format!("scheme {} is not supported for upstreams", target.scheme),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::{
        filter::{Filter, FilterContext},
        metrics::RecordingMetrics,
        predicate::Predicate,
        route::{Arg, BackendDef, CreateError, FilterDef},
    };

    struct TruePredicate(i32);
    impl Predicate for TruePredicate {
        fn matches(&self, _req: &http::Request<monoio_http::common::body::HttpBody>) -> bool {
            true
        }
        fn weight(&self) -> i32 {
            self.0
        }
    }

    #[derive(Default)]
    struct NopFilter {
        closed: Rc<Cell<bool>>,
    }
    #[async_trait::async_trait(?Send)]
    impl Filter for NopFilter {
        async fn request(&self, _ctx: &mut FilterContext) {}
        fn close(&self) {
            self.closed.set(true);
        }
    }

    fn registries() -> (Rc<FilterRegistry>, Rc<PredicateRegistry>) {
        let mut filters = FilterRegistry::new();
        filters.register(
            "nop",
            Rc::new(|_args: &[Arg]| -> Result<Rc<dyn Filter>, CreateError> {
                Ok(Rc::new(NopFilter::default()))
            }),
        );
        let mut predicates = PredicateRegistry::new();
        predicates.register(
            "Weight",
            Rc::new(|args: &[Arg]| -> Result<Rc<dyn Predicate>, CreateError> {
                args.require_len(1)?;
                Ok(Rc::new(TruePredicate(args.u64_at(0)? as i32)))
            }),
        );
        (Rc::new(filters), Rc::new(predicates))
    }

    fn test_builder() -> (TableBuilder, Rc<RecordingMetrics>) {
        let (filters, predicates) = registries();
        let metrics = Rc::new(RecordingMetrics::default());
        (
            TableBuilder::new(filters, predicates, None, metrics.clone()),
            metrics,
        )
    }

    fn def_with_path(id: &str, path: &str) -> RouteDef {
        let mut def = RouteDef::new(id, BackendDef::Shunt);
        def.predicates = vec![PredicateDef {
            name: "Path".into(),
            args: vec![path.into()],
        }];
        def
    }

    #[test]
    fn bad_route_is_isolated_and_counted() {
        let (mut builder, metrics) = test_builder();
        let good = def_with_path("good", "/g");
        let mut bad = def_with_path("bad", "/b");
        bad.filters = vec![FilterDef {
            name: "nonExistentFilter".into(),
            args: vec![],
        }];
        let table = builder.build(vec![good, bad]);
        assert_eq!(table.routes.len(), 1);
        assert_eq!(table.routes[0].id(), "good");
        assert_eq!(table.invalid_routes.len(), 1);
        assert_eq!(
            table.invalid_routes[0].reason,
            RouteErrorKind::UnknownFilter
        );
        assert_eq!(metrics.get("routing.invalid_route.unknown-filter"), 1);
    }

    #[test]
    fn unchanged_defs_reuse_instances() {
        let (mut builder, _) = test_builder();
        let mut def = def_with_path("r", "/a");
        def.filters = vec![FilterDef {
            name: "nop".into(),
            args: vec![],
        }];
        let first = builder.build(vec![def.clone()]);
        let second = builder.build(vec![def.clone()]);
        assert!(Rc::ptr_eq(&first.routes[0], &second.routes[0]));

        // a changed def produces a fresh instance
        def.predicates[0].args = vec!["/b".into()];
        let third = builder.build(vec![def]);
        assert!(!Rc::ptr_eq(&second.routes[0], &third.routes[0]));
    }

    #[test]
    fn weight_sums_predicate_contributions() {
        let (mut builder, _) = test_builder();
        let mut def = def_with_path("w", "/a");
        def.predicates.push(PredicateDef {
            name: "Weight".into(),
            args: vec![4.into()],
        });
        def.predicates.push(PredicateDef {
            name: "Weight".into(),
            args: vec![2.into()],
        });
        let table = builder.build(vec![def]);
        assert_eq!(table.routes[0].weight, 6);
    }

    #[test]
    fn https_backend_is_rejected() {
        let (mut builder, _) = test_builder();
        let def = RouteDef::new(
            "tls",
            BackendDef::Network {
                address: "https://secure.example.org".parse().unwrap(),
            },
        );
        let table = builder.build(vec![def]);
        assert!(table.routes.is_empty());
        assert_eq!(
            table.invalid_routes[0].reason,
            RouteErrorKind::UnsupportedBackend
        );
    }

    #[test]
    fn two_tree_predicates_invalid() {
        let (mut builder, _) = test_builder();
        let mut def = def_with_path("dup", "/a");
        def.predicates.push(PredicateDef {
            name: "PathSubtree".into(),
            args: vec!["/b".into()],
        });
        let table = builder.build(vec![def]);
        assert_eq!(
            table.invalid_routes[0].reason,
            RouteErrorKind::InvalidPredicate
        );
    }

    #[test]
    fn processors_run_before_and_after_instantiation() {
        struct DropPrefixed;
        impl PreProcessor for DropPrefixed {
            fn process(&self, defs: Vec<RouteDef>) -> Vec<RouteDef> {
                defs.into_iter()
                    .filter(|d| !d.id.starts_with("internal-"))
                    .collect()
            }
        }
        struct Reverse;
        impl PostProcessor for Reverse {
            fn process(&self, mut routes: Vec<Rc<Route>>) -> Vec<Rc<Route>> {
                routes.reverse();
                routes
            }
        }

        let (mut builder, _) = test_builder();
        builder.add_pre_processor(Box::new(DropPrefixed));
        builder.add_post_processor(Box::new(Reverse));
        let table = builder.build(vec![
            def_with_path("a", "/a"),
            def_with_path("internal-b", "/b"),
            def_with_path("c", "/c"),
        ]);
        let ids: Vec<_> = table.routes.iter().map(|r| r.id()).collect();
        assert_eq!(ids, vec!["c", "a"]);
    }

    #[test]
    fn generations_increase_monotonically() {
        let (mut builder, _) = test_builder();
        let t1 = builder.build(vec![def_with_path("a", "/a")]);
        let t2 = builder.build(vec![def_with_path("a", "/a")]);
        assert!(t2.generation > t1.generation);
    }

    #[monoio::test(timer_enabled = true)]
    async fn filters_of_retired_routes_close_after_drain() {
        let closed = Rc::new(Cell::new(false));
        let mut filters = FilterRegistry::new();
        let flag = closed.clone();
        filters.register(
            "nop",
            Rc::new(move |_args: &[Arg]| -> Result<Rc<dyn Filter>, CreateError> {
                Ok(Rc::new(NopFilter {
                    closed: flag.clone(),
                }))
            }),
        );
        let (_, predicates) = registries();
        let metrics = Rc::new(RecordingMetrics::default());
        let mut builder = TableBuilder::new(Rc::new(filters), predicates, None, metrics);

        let mut def = def_with_path("r", "/a");
        def.filters = vec![FilterDef {
            name: "nop".into(),
            args: vec![],
        }];
        let retired = Rc::new(builder.build(vec![def.clone()]));

        // change the definition so the instance is not carried over
        def.predicates[0].args = vec!["/b".into()];
        let current = builder.build(vec![def]);

        let in_flight = retired.clone();
        crate::routing::schedule_filter_close(retired, &current);

        monoio::time::sleep(Duration::from_millis(20)).await;
        assert!(!closed.get(), "close must wait until the table drains");

        drop(in_flight);
        monoio::time::sleep(Duration::from_millis(150)).await;
        assert!(closed.get(), "drained table closes its filters");
    }
}

/// Consume merged snapshots, build tables and publish them, retiring the
/// previous generation once it has drained.
pub async fn run_builder(
    mut builder: TableBuilder,
    mut rx: futures::channel::mpsc::UnboundedReceiver<MergedDefs>,
    handle: TableHandle,
) {
    use futures::StreamExt;
    while let Some(snapshot) = rx.next().await {
        let table = Rc::new(builder.build(snapshot.routes));
        let old = handle.load();
        handle.publish(table.clone());
        super::schedule_filter_close(old, &table);
    }
    info!("route definition stream closed, builder task exits");
}
