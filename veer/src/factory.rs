//! Preconstructed service stack for the proxy data path.
use std::{cell::Cell, rc::Rc};

use service_async::{stack::FactoryStack, MakeService};
use veer_core::{
    config::ServerConfig,
    context::EmptyContext,
    metrics::Metrics,
    routing::TableHandle,
};
use veer_services::{
    common::{CatchPanicService, ContextService},
    http::{
        detect::H2Detect, upgrade::UpgradeDetect, util::HttpErrorResponder,
        ConnectionReuseHandler, ContentHandler, HttpCoreService,
    },
    proxy::RoutingProxyHandler,
};

/// Build the per-worker connection-handling factory:
///
/// accept → context → h2 detect → upgrade detect → http core →
/// connection reuse → content coding → error responder → panic guard →
/// routing proxy
pub fn stack_factory(
    config: ServerConfig,
    table: TableHandle,
    metrics: Rc<dyn Metrics>,
    draining: Rc<Cell<bool>>,
) -> impl MakeService<
    Service = impl service_async::Service<
        (veer_core::listener::AcceptedStream, veer_core::listener::AcceptedAddr),
        Response = (),
        Error = impl std::fmt::Debug,
    >,
    Error = impl std::fmt::Debug,
> {
    let options = config.proxy.clone();
    FactoryStack::new(config)
        .replace(RoutingProxyHandler::factory(
            table.clone(),
            options,
            metrics,
            draining,
        ))
        .push(CatchPanicService::layer())
        .push(HttpErrorResponder::layer())
        .push(ContentHandler::layer())
        .push(ConnectionReuseHandler::layer())
        .push(HttpCoreService::layer())
        .push(UpgradeDetect::layer(table))
        .push(H2Detect::layer())
        .push(ContextService::<EmptyContext, _>::layer())
        .into_inner()
}
