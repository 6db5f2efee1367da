use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use eve_market_hoarder::config::{HoarderArgs, SecretTable};
use eve_market_hoarder::dump::DumpRegistry;
use eve_market_hoarder::esi::EsiClient;
use eve_market_hoarder::fifo::Fifo;
use eve_market_hoarder::oauth::OAuthCache;
use eve_market_hoarder::runtime::{ESI_BASE_URL, Runtime};
use eve_market_hoarder::{histories, locations, orders, regions, systems};
use fs2::FileExt;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const ORDERS_TO_LOCATIONS_CAPACITY: usize = 32;
const MARKET_REQUEST_CAPACITY: usize = 4;
const MARKET_RESPONSE_CAPACITY: usize = 4;

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .init();

    // SAFETY: single-threaded at this point, before the tokio runtime has
    // spawned any worker that might read TZ concurrently.
    unsafe { std::env::set_var("TZ", "GMT") };

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "fatal error during startup or shutdown");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    let args = HoarderArgs::parse();
    let secrets = SecretTable::parse(&args.secrets).context("parsing --secrets")?;

    std::fs::create_dir_all(&args.dump_dir).context("creating dump_dir")?;
    let _lock = acquire_lock(&args.dump_dir)?;

    let region_ids = regions::load_from_csv(&args.regions_csv).context("loading regions_csv")?;
    info!(count = region_ids.len(), "loaded region table");

    let system_table = if args.structure {
        systems::SystemTable::load_from_csv(&args.systems_csv).context("loading systems_csv")?
    } else {
        systems::SystemTable::default()
    };

    let oauth = if args.structure {
        Some(OAuthCache::new(&secrets).context("constructing oauth cache")?)
    } else {
        None
    };

    let esi = EsiClient::new(ESI_BASE_URL).context("constructing http client")?;
    let dump_registry = Arc::new(DumpRegistry::new());

    let runtime = Arc::new(Runtime {
        esi,
        oauth,
        dump_registry: dump_registry.clone(),
        dump_dir: args.dump_dir.clone(),
        region_ids,
        systems: Arc::new(system_table),
        orders_to_locations: Fifo::new(ORDERS_TO_LOCATIONS_CAPACITY),
        market_request: Fifo::new(MARKET_REQUEST_CAPACITY),
        market_response: Fifo::new(MARKET_RESPONSE_CAPACITY),
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut workers = tokio::task::JoinSet::new();

    {
        let runtime = runtime.clone();
        let shutdown_rx = shutdown_rx.clone();
        workers.spawn(async move { orders::run(runtime, shutdown_rx).await });
    }

    if args.structure {
        let runtime = runtime.clone();
        let shutdown_rx = shutdown_rx.clone();
        let locations_csv = args.locations_csv.clone();
        workers.spawn(async move { locations::run(runtime, locations_csv, shutdown_rx).await });
    }

    if args.history {
        let runtime = runtime.clone();
        let shutdown_rx = shutdown_rx.clone();
        workers.spawn(async move { histories::run(runtime, shutdown_rx).await });
    }

    // Shutdown is triggered either by an external signal or by any worker
    // exiting on its own (a structural failure, per the per-worker error
    // policy — orders never returns early, locations/histories do on
    // unrecoverable setup/dump-write errors). Either way every other
    // worker must be asked to stop rather than left running unsupervised.
    let mut first_err: Option<anyhow::Error> = None;
    let mut signaled = false;
    loop {
        tokio::select! {
            _ = wait_for_shutdown_signal(), if !signaled => {
                signaled = true;
                info!("shutdown signal received, stopping workers");
                let _ = shutdown_tx.send(true);
            }
            maybe_result = workers.join_next() => {
                match maybe_result {
                    None => break,
                    Some(Ok(Ok(()))) => {}
                    Some(Ok(Err(err))) => {
                        error!(%err, "worker exited with an error, stopping the others");
                        first_err.get_or_insert(err);
                        let _ = shutdown_tx.send(true);
                    }
                    Some(Err(join_err)) => error!(%join_err, "worker task panicked"),
                }
            }
        }
    }

    dump_registry.burn();

    match first_err {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn acquire_lock(dump_dir: &std::path::Path) -> Result<std::fs::File> {
    let lock_path = dump_dir.join(".hoarder.lock");
    let file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .open(&lock_path)
        .with_context(|| format!("opening lock file {}", lock_path.display()))?;
    file.try_lock_exclusive().with_context(|| {
        format!(
            "another hoarder instance already holds {}",
            lock_path.display()
        )
    })?;
    Ok(file)
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("installing SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
