//! Engine assembly: builds the worker pools and the queues between
//! them, and owns process-level shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};

use crate::config::Settings;
use crate::conn::{ConnId, ConnectionRegistry};
use crate::error::Reject;
use crate::event::Event;
use crate::ingest::{run_ingester, IngestJob, IngestRoutes};
use crate::monitor::{run_monitor, MonitorMsg};
use crate::negentropy::{run_neg_worker, NegJob};
use crate::policy::WritePolicy;
use crate::query::run_req_worker;
use crate::schema::{EphemeralBuffer, Outcome};
use crate::store::Store;
use crate::writer::{run_writer, WriteReply, WriteRequest, WriterConfig};

/// A running relay engine: every pool spawned, every queue connected.
///
/// Data flow: socket frame -> ingester -> writer -> monitors, with the
/// req workers filling in history for fresh subscriptions.
pub struct Engine {
    pub settings: Arc<Settings>,
    pub store: Store,
    pub registry: Arc<ConnectionRegistry>,
    ingesters: Vec<mpsc::Sender<IngestJob>>,
    monitors: Vec<mpsc::Sender<MonitorMsg>>,
    neg_workers: Vec<mpsc::Sender<NegJob>>,
    writer: mpsc::Sender<WriteRequest>,
    pub ephemeral: Arc<EphemeralBuffer>,
    shutdown: watch::Receiver<bool>,
}

impl Engine {
    /// Spawn all pools onto the current runtime.
    pub fn start(settings: Settings, store: Store, policy: Arc<dyn WritePolicy>) -> Arc<Engine> {
        let settings = Arc::new(settings);
        let registry = Arc::new(ConnectionRegistry::new(settings.max_subs_per_conn));
        let ephemeral = Arc::new(EphemeralBuffer::new(Duration::from_secs(
            settings.ephemeral_lifetime_secs,
        )));
        let (shutdown_tx, shutdown) = watch::channel(false);
        let depth = settings.queue_depth;

        let mut monitors = Vec::with_capacity(settings.monitor_workers);
        for _ in 0..settings.monitor_workers.max(1) {
            let (tx, rx) = mpsc::channel(depth);
            tokio::spawn(run_monitor(rx, store.clone(), registry.clone()));
            monitors.push(tx);
        }

        let (writer, writer_rx) = mpsc::channel(depth);
        tokio::spawn(run_writer(
            writer_rx,
            store.clone(),
            registry.clone(),
            monitors.clone(),
            ephemeral.clone(),
            WriterConfig {
                batch_max: settings.write_batch_max,
                batch_window: Duration::from_millis(settings.write_batch_window_ms),
                commit_retries: settings.commit_retries,
            },
            shutdown_tx,
        ));

        let timeslice = Duration::from_micros(settings.query_timeslice_us);
        let mut req_workers = Vec::with_capacity(settings.req_workers);
        for _ in 0..settings.req_workers.max(1) {
            let (tx, rx) = mpsc::channel(depth);
            tokio::spawn(run_req_worker(
                rx,
                store.clone(),
                registry.clone(),
                monitors.clone(),
                ephemeral.clone(),
                timeslice,
            ));
            req_workers.push(tx);
        }

        let mut neg_workers = Vec::with_capacity(settings.neg_workers);
        for _ in 0..settings.neg_workers.max(1) {
            let (tx, rx) = mpsc::channel(depth);
            tokio::spawn(run_neg_worker(
                rx,
                store.clone(),
                registry.clone(),
                settings.max_sync_events,
                timeslice,
            ));
            neg_workers.push(tx);
        }

        let routes = Arc::new(IngestRoutes {
            registry: registry.clone(),
            writer: writer.clone(),
            req_workers,
            monitors: monitors.clone(),
            neg_workers: neg_workers.clone(),
            policy,
            settings: settings.clone(),
        });
        let mut ingesters = Vec::with_capacity(settings.ingest_workers);
        for _ in 0..settings.ingest_workers.max(1) {
            let (tx, rx) = mpsc::channel(depth);
            tokio::spawn(run_ingester(rx, routes.clone()));
            ingesters.push(tx);
        }

        // Ephemeral lifetimes are coarse; sweeping at a fraction of the
        // ttl keeps the buffer bounded without a timer per event.
        let sweep_buffer = ephemeral.clone();
        let sweep_every = Duration::from_secs((settings.ephemeral_lifetime_secs / 10).max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_every);
            loop {
                ticker.tick().await;
                let purged = sweep_buffer.sweep();
                if purged > 0 {
                    tracing::debug!(purged, remaining = sweep_buffer.len(), "swept ephemeral events");
                }
            }
        });

        Arc::new(Engine {
            settings,
            store,
            registry,
            ingesters,
            monitors,
            neg_workers,
            writer,
            ephemeral,
            shutdown,
        })
    }

    /// The ingester queue a connection's frames belong on.
    pub fn ingest_sender(&self, conn: ConnId) -> &mpsc::Sender<IngestJob> {
        &self.ingesters[(conn as usize) % self.ingesters.len()]
    }

    /// The monitor partition owning a connection.
    pub fn monitor_sender(&self, conn: ConnId) -> &mpsc::Sender<MonitorMsg> {
        &self.monitors[(conn as usize) % self.monitors.len()]
    }

    /// The negentropy worker owning a connection's sessions.
    pub fn neg_sender(&self, conn: ConnId) -> &mpsc::Sender<NegJob> {
        &self.neg_workers[(conn as usize) % self.neg_workers.len()]
    }

    /// Submit one event directly, bypassing the socket path. Used by
    /// the CLI and by the sync client.
    pub async fn submit(&self, event: Event) -> Result<Outcome, Reject> {
        let (tx, rx) = oneshot::channel();
        self.writer
            .send(WriteRequest {
                event: Arc::new(event),
                reply: WriteReply::Oneshot(tx),
            })
            .await
            .map_err(|_| Reject::Error("writer is gone".into()))?;
        rx.await
            .map_err(|_| Reject::Error("writer dropped the request".into()))?
    }

    /// Resolves when a fatal error asks every pool to stop.
    pub async fn shutdown_requested(&self) {
        let mut shutdown = self.shutdown.clone();
        while !*shutdown.borrow() {
            if shutdown.changed().await.is_err() {
                return;
            }
        }
    }
}
