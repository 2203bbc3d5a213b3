//! Signaling relay binary entry point
//!
//! # Usage
//!
//! ```bash
//! # In-memory store on localhost:8080
//! cargo run -p campuscare-signaling-server
//!
//! # Durable store that survives restarts
//! cargo run -p campuscare-signaling-server -- \
//!   --store sqlite --db-path ./signaling.db --ttl-secs 600
//!
//! # With logging
//! RUST_LOG=debug cargo run -p campuscare-signaling-server
//! ```

use campuscare_signaling_server::RelayServer;
use campuscare_webrtc::signaling::mailbox::DEFAULT_MAX_PER_RECIPIENT;
use campuscare_webrtc::signaling::{Mailbox, MemoryMailbox, SqliteMailbox};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// CampusCare signaling relay
///
/// Queues offers, answers and ICE candidates per participant until polled.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1:8080", env = "SIGNALING_BIND_ADDRESS")]
    bind: String,

    /// Mailbox store
    #[arg(long, default_value = "memory", env = "SIGNALING_STORE")]
    store: StoreKind,

    /// SQLite database path (sqlite store only)
    #[arg(long, default_value = "./signaling.db", env = "SIGNALING_DB_PATH")]
    db_path: PathBuf,

    /// Seconds before an undelivered message is purged (sqlite store only)
    #[arg(long, default_value_t = 600, env = "SIGNALING_TTL_SECS")]
    ttl_secs: u64,

    /// Messages queued per recipient before new ones are rejected
    #[arg(long, default_value_t = DEFAULT_MAX_PER_RECIPIENT, env = "SIGNALING_MAX_PER_RECIPIENT")]
    max_per_recipient: usize,

    /// Emit logs as JSON
    #[arg(long, default_value_t = false, env = "SIGNALING_LOG_JSON")]
    log_json: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum StoreKind {
    /// Lost on restart
    Memory,
    /// Durable, with expiry
    Sqlite,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let shutdown_flag_handler = Arc::clone(&shutdown_flag);
    ctrlc::set_handler(move || {
        if shutdown_flag_handler.swap(true, Ordering::SeqCst) {
            eprintln!("Shutdown already in progress, forcing immediate exit");
            std::process::exit(0);
        }
        eprintln!("\nCtrl+C received, draining connections...");
    })?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get())
        .thread_name("signaling-relay")
        .enable_all()
        .build()?;

    runtime.block_on(async_main(args, shutdown_flag))
}

async fn async_main(
    args: Args,
    shutdown_flag: Arc<AtomicBool>,
) -> Result<(), Box<dyn std::error::Error>> {
    init_tracing(args.log_json);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        bind = %args.bind,
        store = ?args.store,
        max_per_recipient = args.max_per_recipient,
        "Signaling relay starting"
    );

    let mailbox: Arc<dyn Mailbox> = match args.store {
        StoreKind::Memory => Arc::new(MemoryMailbox::with_max_per_recipient(args.max_per_recipient)),
        StoreKind::Sqlite => {
            let store = SqliteMailbox::open(
                &args.db_path,
                Duration::from_secs(args.ttl_secs),
                args.max_per_recipient,
            )
            .map_err(|e| {
                error!("Failed to open {}: {}", args.db_path.display(), e);
                e
            })?;
            info!(db_path = %store.db_path().display(), "Using SQLite mailbox");
            Arc::new(store)
        }
    };

    let shutdown = async move {
        while !shutdown_flag.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    };

    RelayServer::new(args.bind, mailbox)
        .serve(shutdown)
        .await
        .map_err(|e| {
            error!("Relay error: {}", e);
            e
        })?;
    Ok(())
}

fn init_tracing(json: bool) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
