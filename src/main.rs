mod config;
mod conn;
mod error;
mod event;
mod filter;
mod ingest;
mod metrics;
mod monitor;
mod negentropy;
mod policy;
mod query;
mod relay;
mod schema;
mod server;
mod store;
mod sync;
mod writer;
mod ws;

use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use rand::{seq::SliceRandom, thread_rng};

use config::Settings;
use event::Event;
use policy::AcceptAll;
use relay::Engine;
use store::{Store, StoreOptions};

/// Command line interface entry point.
#[derive(Parser)]
#[command(
    name = "quern",
    author,
    version,
    about = "Indexed Nostr relay with live subscriptions and negentropy sync"
)]
struct Cli {
    /// Path to the `.env` configuration file.
    #[arg(long, default_value = ".env")]
    env: String,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Commands,
}

/// Supported CLI subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the store at `STORE_ROOT`.
    Init,
    /// Install one or more JSON event files.
    Ingest {
        /// Paths to JSON event files to ingest.
        #[arg(required = true)]
        files: Vec<String>,
    },
    /// Dump all stored events as NDJSON on stdout.
    Export,
    /// Rewrite the store log, dropping superseded data.
    Compact,
    /// Launch the WebSocket and HTTP services.
    Serve,
    /// Reconcile with a remote relay and transfer the difference.
    Sync {
        /// Remote relay websocket URL.
        #[arg(long)]
        relay: String,
        /// Restrict the session to these kinds.
        #[arg(long)]
        kind: Vec<u16>,
        /// Restrict the session to these authors.
        #[arg(long)]
        author: Vec<String>,
        #[arg(long)]
        since: Option<i64>,
        #[arg(long)]
        until: Option<i64>,
        /// Also publish events only this relay holds.
        #[arg(long)]
        upload: bool,
    },
    /// Verify a random sample of stored events.
    Verify {
        #[arg(long, default_value_t = 1000)]
        sample: usize,
    },
}

/// Execute the selected CLI subcommand.
async fn run(cli: Cli) -> Result<()> {
    let cfg = Settings::from_env(&cli.env)?;
    let opts = StoreOptions {
        map_bytes: cfg.store_map_bytes,
    };
    match cli.command {
        Commands::Init => {
            let store = Store::open(&cfg.store_root, opts)?;
            tracing::info!(
                path = %cfg.store_root.display(),
                seq = store.committed_seq(),
                "store initialized"
            );
        }
        Commands::Ingest { files } => {
            let store = Store::open(&cfg.store_root, opts)?;
            let mut events = Vec::with_capacity(files.len());
            for f in files {
                let data = std::fs::read_to_string(&f)?;
                let ev: Event = serde_json::from_str(&data)?;
                ev.validate_structure(cfg.max_event_bytes)
                    .map_err(|e| anyhow!("{f}: {e}"))?;
                if cfg.verify_sig {
                    ev.verify().map_err(|e| anyhow!("{f}: {e}"))?;
                }
                events.push(ev);
            }
            let stored = sync::install_batch(&store, &events)?;
            tracing::info!(stored, "ingest complete");
        }
        Commands::Export => {
            let store = Store::open(&cfg.store_root, opts)?;
            let txn = store.txn_ro();
            let mut cur = txn.cursor(schema::tbl::PRIMARY);
            let stdout = std::io::stdout();
            let mut out = stdout.lock();
            let mut next = cur.seek(&[]);
            while let Some((_, value)) = next {
                let rec: schema::StoredRecord = serde_json::from_slice(&value)?;
                serde_json::to_writer(&mut out, &rec.event)?;
                out.write_all(b"\n")?;
                next = cur.next();
            }
        }
        Commands::Compact => {
            let store = Store::open(&cfg.store_root, opts)?;
            store.compact()?;
            tracing::info!(used_bytes = store.used_bytes(), "store compacted");
        }
        Commands::Serve => {
            let store = Store::open(&cfg.store_root, opts)?;
            let http_addr: SocketAddr = cfg.bind_http.parse()?;
            let ws_addr: SocketAddr = cfg.bind_ws.parse()?;
            let engine = Engine::start(cfg, store, Arc::new(AcceptAll));
            tokio::try_join!(
                server::serve_http(http_addr, stopper(engine.clone())),
                ws::serve_ws(ws_addr, engine.clone(), stopper(engine.clone()))
            )?;
        }
        Commands::Sync {
            relay,
            kind,
            author,
            since,
            until,
            upload,
        } => {
            let mut filter = serde_json::Map::new();
            if !kind.is_empty() {
                filter.insert("kinds".into(), serde_json::json!(kind));
            }
            if !author.is_empty() {
                filter.insert("authors".into(), serde_json::json!(author));
            }
            if let Some(since) = since {
                filter.insert("since".into(), serde_json::json!(since));
            }
            if let Some(until) = until {
                filter.insert("until".into(), serde_json::json!(until));
            }
            let report = sync::run(&cfg, &relay, serde_json::Value::Object(filter), upload).await?;
            tracing::info!(
                downloaded = report.downloaded,
                uploaded = report.uploaded,
                "sync complete"
            );
        }
        Commands::Verify { sample } => {
            let store = Store::open(&cfg.store_root, opts)?;
            let verified = verify_sample(&store, sample)?;
            tracing::info!(verified, "verification passed");
        }
    }
    Ok(())
}

/// Resolves on ctrl-c or when the engine reports a fatal error.
fn stopper(engine: Arc<Engine>) -> impl std::future::Future<Output = ()> + Send + 'static {
    async move {
        tokio::select! {
            _ = engine.shutdown_requested() => {
                tracing::error!("engine requested shutdown");
            }
            _ = tokio::signal::ctrl_c() => {}
        }
    }
}

/// Re-verify id and signature for a random sample of stored events.
fn verify_sample(store: &Store, sample: usize) -> Result<usize> {
    let txn = store.txn_ro();
    let mut cur = txn.cursor(schema::tbl::PRIMARY);
    let mut events = Vec::new();
    let mut next = cur.seek(&[]);
    while let Some((_, value)) = next {
        let rec: schema::StoredRecord = serde_json::from_slice(&value)?;
        events.push(rec.event);
        next = cur.next();
    }
    let mut rng = thread_rng();
    events.shuffle(&mut rng);
    let take = sample.min(events.len());
    for ev in events.iter().take(take) {
        ev.verify().map_err(|e| anyhow!("event {}: {e}", ev.id))?;
    }
    Ok(take)
}

#[cfg(not(test))]
#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();
    let cli = Cli::parse();
    run(cli).await
}
