//! Worker threads: one monoio runtime per core, each serving the listener
//! and maintaining its own route table generation.
use std::{
    cell::Cell,
    rc::Rc,
    thread::JoinHandle,
    time::{Duration, Instant},
};

use anyhow::Result;
use futures::channel::oneshot;
use futures_channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use monoio::{io::stream::Stream, utils::bind_to_cpu_set};
use service_async::{MakeService, Service};
use tracing::{error, info, warn};
use veer_core::{
    config::{Config, ListenerConfig, ServerConfig},
    listener::ListenerBuilder,
    metrics::default_metrics,
    routing::{builder::run_builder, builder::TableBuilder, multiplexer::MergedDefs, RouteTable, TableHandle},
};
use veer_services::{
    filters::{builtin_registry as filter_registry, BreakerRegistry},
    predicates::builtin_registry as predicate_registry,
    tokeninfo::TokeninfoClient,
};

use crate::{factory::stack_factory, runtime::RuntimeWrapper};

const DRAIN_DEADLINE: Duration = Duration::from_secs(10);
const DRAIN_POLL: Duration = Duration::from_millis(50);

pub struct WorkerHandles {
    pub join_handles: Vec<JoinHandle<()>>,
    pub defs_txs: Vec<UnboundedSender<MergedDefs>>,
    pub shutdown_txs: Vec<oneshot::Sender<()>>,
}

/// Spawn one worker thread per configured core. Each worker gets its own
/// route-definition channel and shutdown signal.
pub fn spawn_workers(config: &Config) -> Result<WorkerHandles> {
    let cores = if config.runtime.cpu_affinity {
        std::thread::available_parallelism().ok()
    } else {
        None
    };

    let mut handles = WorkerHandles {
        join_handles: Vec::new(),
        defs_txs: Vec::new(),
        shutdown_txs: Vec::new(),
    };

    // one shared builder: TCP binds per worker via SO_REUSEPORT, UDS workers
    // accept from clones of a single bound socket
    let listener_builder = std::sync::Arc::new(build_listener(&config.server.listener)?);

    for worker_id in 0..config.runtime.worker_threads {
        let (defs_tx, defs_rx) = unbounded();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let server = config.server.clone();
        let runtime_config = config.runtime.clone();
        let listener_builder = listener_builder.clone();

        let handle = std::thread::Builder::new()
            .name(format!("veer-worker-{worker_id}"))
            .spawn(move || {
                if let Some(cores) = cores {
                    let core = worker_id % cores;
                    if let Err(e) = bind_to_cpu_set([core]) {
                        warn!("binding worker {worker_id} to core {core} failed: {e}");
                    }
                }
                let mut runtime = RuntimeWrapper::from(&runtime_config);
                runtime.block_on(worker_main(
                    server,
                    listener_builder,
                    defs_rx,
                    shutdown_rx,
                    worker_id,
                ));
            })?;

        handles.join_handles.push(handle);
        handles.defs_txs.push(defs_tx);
        handles.shutdown_txs.push(shutdown_tx);
    }
    Ok(handles)
}

async fn worker_main(
    server: ServerConfig,
    listener_builder: std::sync::Arc<ListenerBuilder>,
    defs_rx: UnboundedReceiver<MergedDefs>,
    mut shutdown_rx: oneshot::Receiver<()>,
    worker_id: usize,
) {
    let metrics = default_metrics();
    let draining = Rc::new(Cell::new(false));
    let table = TableHandle::new(Rc::new(RouteTable::empty()));

    let tokeninfo = match &server.tokeninfo {
        Some(cfg) => match TokeninfoClient::new(cfg) {
            Ok(client) => Some(Rc::new(client)),
            Err(e) => {
                error!("tokeninfo client setup failed, auth filters disabled: {e}");
                None
            }
        },
        None => None,
    };
    let filters = Rc::new(filter_registry(tokeninfo, Rc::new(BreakerRegistry::new())));
    let predicates = Rc::new(predicate_registry());
    let builder = TableBuilder::new(filters, predicates, server.proxy.fade_in(), metrics.clone());
    monoio::spawn(run_builder(builder, defs_rx, table.clone()));

    let mut listener = match listener_builder.build() {
        Ok(l) => l,
        Err(e) => {
            error!("worker {worker_id} cannot bind: {e}");
            return;
        }
    };

    let factory = stack_factory(server, table, metrics, draining.clone());
    let svc = match factory.make_via_ref(None) {
        Ok(svc) => Rc::new(svc),
        Err(e) => {
            error!("worker {worker_id} service stack build failed: {e:?}");
            return;
        }
    };

    info!(worker_id, "worker serving");
    let inflight = Rc::new(Cell::new(0usize));
    loop {
        monoio::select! {
            accepted = listener.next() => {
                match accepted {
                    Some(Ok(accept)) => {
                        let svc = svc.clone();
                        let inflight = inflight.clone();
                        inflight.set(inflight.get() + 1);
                        monoio::spawn(async move {
                            if let Err(e) = svc.call(accept).await {
                                warn!("connection handling error: {e:?}");
                            }
                            inflight.set(inflight.get() - 1);
                        });
                    }
                    Some(Err(e)) => warn!("accept failed: {e:?}"),
                    None => break,
                }
            }
            _ = &mut shutdown_rx => {
                break;
            }
        }
    }

    // stop accepting, reject new requests on kept-alive connections, then
    // wait for in-flight work up to the drain deadline
    drop(listener);
    draining.set(true);
    let deadline = Instant::now() + DRAIN_DEADLINE;
    while inflight.get() > 0 && Instant::now() < deadline {
        monoio::time::sleep(DRAIN_POLL).await;
    }
    info!(worker_id, remaining = inflight.get(), "worker exits");
}

fn build_listener(config: &ListenerConfig) -> std::io::Result<ListenerBuilder> {
    match config {
        ListenerConfig::Socket { socket_addr } => {
            // monoio's default listener opts enable SO_REUSEPORT, which is
            // what lets every worker bind the same address
            ListenerBuilder::bind_tcp(*socket_addr, Default::default())
        }
        #[cfg(unix)]
        ListenerConfig::Unix { uds_path } => ListenerBuilder::bind_unix(uds_path),
    }
}
