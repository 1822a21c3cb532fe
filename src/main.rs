#[macro_use]
extern crate tracing;
#[macro_use]
extern crate anyhow;
#[macro_use]
extern crate async_trait;

use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio::runtime;

mod args;
mod backoff;
mod catalogue;
mod config;
mod control;
mod coordinator;
mod journal;
mod link;
mod log;
mod misc;
mod payment;
mod shutdown;

use args::ArgsParser;
use catalogue::Catalogue;
use control::ControlPlane;
use coordinator::Coordinator;
use journal::SalesJournal;
use link::LinkSession;
use misc::DataDir;
use payment::PaymentClient;
use shutdown::Shutdown;

fn main() -> Result<()> {
    let runtime = runtime::Builder::new_multi_thread().enable_all().build()?;
    let mut shutdown = Shutdown::new();
    runtime.block_on(async_main(&mut shutdown))?;
    shutdown.trigger_shutdown();
    runtime.shutdown_timeout(Duration::from_secs(30));
    Ok(())
}

async fn async_main(shutdown: &mut Shutdown) -> Result<()> {
    log::init_logging()?;
    let args = ArgsParser::parse();
    let cfg = config::open(args.config).await?;
    info!(machine = %cfg.machine_id, "starting upper computer");

    shutdown::trap_signals(shutdown.handle()).await;

    let data_dir = DataDir::new(cfg.data_dir.clone());
    data_dir.ensure_exists().await?;

    info!("loading catalogue");
    let catalogue = Catalogue::open(data_dir.file("catalogue.json")).await?;
    debug!("catalogue has {} selections", catalogue.list().await.len());
    let journal = SalesJournal::open(data_dir.file("sales.jsonl")).await?;

    // control plane first, then the serial link; both reconnect on their own
    let (session, link, events) = LinkSession::new(&cfg.serial_port);
    let control = ControlPlane::new(&cfg, catalogue.clone(), journal.clone(), link.clone());
    tokio::spawn(control.run(shutdown.handle()));
    tokio::spawn(session.run(shutdown.handle()));

    // the payment client connects lazily on the first sale
    let payment = PaymentClient::new(
        &cfg.payment_host,
        cfg.payment_port,
        &cfg.terminal_id,
        &cfg.currency_code,
    );
    let coordinator = Coordinator::new(link, events, catalogue, journal, payment);
    tokio::spawn(coordinator.run(shutdown.handle()));

    info!("running -- SIGINT or SIGTERM to exit");
    let mut handle = shutdown.handle();
    handle.wait_for_shutdown().await;
    drop(handle);

    shutdown.wait_for_completion().await;
    Ok(())
}
