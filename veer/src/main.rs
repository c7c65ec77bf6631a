use std::rc::Rc;

use anyhow::Result;
use clap::Parser;
use futures::StreamExt;
use tracing::info;
use veer_core::{
    config::Config,
    routing::{
        dataclient::{poll_client, DataClient, InlineClient},
        multiplexer::run_multiplexer,
    },
};

mod factory;
mod runtime;
mod server;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Path of the config file
    #[clap(short, long, value_parser)]
    config: String,
}

#[monoio::main(timer_enabled = true)]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = Config::load(&args.config)?;
    info!(server = config.server.name.as_str(), "starting");

    let workers = server::spawn_workers(&config)?;

    // control plane: one poll task per data client feeding the multiplexer
    let (events_tx, events_rx) = futures_channel::mpsc::unbounded();
    let clients: Vec<Rc<dyn DataClient>> = vec![Rc::new(InlineClient::new(
        config.server.routes.clone(),
    ))];
    let poll_timeout = config.server.routing.poll_timeout();
    let mut pollers = Vec::with_capacity(clients.len());
    for client in clients {
        let (fut, abort) = futures::future::abortable(poll_client(
            client,
            events_tx.clone(),
            poll_timeout,
        ));
        pollers.push(abort);
        monoio::spawn(async move {
            let _ = fut.await;
        });
    }
    drop(events_tx);
    let mux = monoio::spawn(run_multiplexer(events_rx, workers.defs_txs.clone()));

    // SIGINT/SIGTERM trips the shutdown sequence
    let (sig_tx, mut sig_rx) = futures_channel::mpsc::unbounded::<()>();
    ctrlc::set_handler(move || {
        let _ = sig_tx.unbounded_send(());
    })?;
    sig_rx.next().await;
    info!("shutdown signal received");

    // stop the control plane first so no further snapshots reach workers
    for poller in pollers {
        poller.abort();
    }
    mux.await;

    // then drain the workers
    for tx in workers.shutdown_txs {
        let _ = tx.send(());
    }
    for handle in workers.join_handles {
        let _ = handle.join();
    }
    info!("bye");
    Ok(())
}
