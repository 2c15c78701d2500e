//! Mock ticketing backend
//!
//! Serves the check-in HTTP contract over the in-memory store for local
//! testing of the engine.
//!
//! Behavior:
//! 1. Listens on configurable port (default 8787)
//! 2. Loads demo tickets, or a JSON seed file with `--seed`
//! 3. Individual calls can be made to fail (`--fail-atomic`, ...) or slow (`--latency-ms`)
//!    to exercise the fallback order
//!
//! Usage:
//!   cargo run --bin mock_backend -- --port 8787 --fail-atomic

use clap::Parser;
use entry_checkin::io::backend_server;
use entry_checkin::io::{MemoryTicketStore, StepFault};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "mock_backend")]
#[command(about = "Mock ticketing backend for local check-in testing")]
struct Args {
    /// TCP port to listen on
    #[arg(short, long, default_value = "8787")]
    port: u16,

    /// JSON seed file (events, holders, tickets); demo data when omitted
    #[arg(long)]
    seed: Option<String>,

    /// Fail the atomic resolve-and-check-in call
    #[arg(long)]
    fail_atomic: bool,

    /// Fail the joined ticket read
    #[arg(long)]
    fail_joined: bool,

    /// Fail the direct holder read
    #[arg(long)]
    fail_direct: bool,

    /// Fail check-in inserts
    #[arg(long)]
    fail_insert: bool,

    /// Added latency per call (ms)
    #[arg(long, default_value = "0")]
    latency_ms: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    let args = Args::parse();

    let store = match &args.seed {
        Some(path) => MemoryTicketStore::from_seed_file(path)?,
        None => MemoryTicketStore::with_demo_data(),
    };
    store.set_fault(StepFault::Atomic, args.fail_atomic);
    store.set_fault(StepFault::Joined, args.fail_joined);
    store.set_fault(StepFault::Direct, args.fail_direct);
    store.set_fault(StepFault::Insert, args.fail_insert);
    if args.latency_ms > 0 {
        store.set_latency(Some(Duration::from_millis(args.latency_ms)));
    }

    info!(
        port = %args.port,
        seed = ?args.seed,
        fail_atomic = %args.fail_atomic,
        fail_joined = %args.fail_joined,
        fail_direct = %args.fail_direct,
        fail_insert = %args.fail_insert,
        latency_ms = %args.latency_ms,
        "mock_backend_starting"
    );

    let listener = TcpListener::bind(("0.0.0.0", args.port)).await?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown_signal_received");
        let _ = shutdown_tx.send(true);
    });

    backend_server::serve(listener, Arc::new(store), shutdown_rx).await
}
