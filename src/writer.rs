//! The single writer: batches verified events into one transaction,
//! commits, publishes to the monitors, then answers each submitter.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::timeout;

use crate::conn::{frames, ConnId, ConnectionRegistry};
use crate::error::{Reject, StoreError};
use crate::event::{is_ephemeral, Event};
use crate::metrics::metrics;
use crate::monitor::MonitorMsg;
use crate::schema::{install, last_quad, EphemeralBuffer, Outcome};
use crate::store::Store;

/// Where the verdict for a submission goes.
pub enum WriteReply {
    /// `OK` frame to the submitting connection.
    Connection(ConnId),
    /// Direct result, used by the CLI and sync paths.
    Oneshot(oneshot::Sender<Result<Outcome, Reject>>),
}

/// A verified event awaiting commit.
pub struct WriteRequest {
    pub event: Arc<Event>,
    pub reply: WriteReply,
}

/// Batch tuning for the writer loop.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    pub batch_max: usize,
    pub batch_window: Duration,
    pub commit_retries: usize,
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Run the writer until its queue closes or the store fails fatally.
///
/// Group commit: requests accumulate until the batch is full or the
/// window elapses, then one write transaction installs them all.
pub async fn run_writer(
    mut rx: mpsc::Receiver<WriteRequest>,
    store: Store,
    registry: Arc<ConnectionRegistry>,
    monitors: Vec<mpsc::Sender<MonitorMsg>>,
    ephemeral: Arc<EphemeralBuffer>,
    cfg: WriterConfig,
    shutdown: watch::Sender<bool>,
) {
    // Recovery: the log position restarts at the highest stored quad.
    let mut next_quad = match last_quad(&store.txn_ro()) {
        Ok(q) => q + 1,
        Err(e) => {
            tracing::error!(error = %e, "writer recovery failed");
            let _ = shutdown.send(true);
            return;
        }
    };
    tracing::info!(next_quad, "writer started");

    let mut batch: Vec<WriteRequest> = Vec::new();
    let mut batch_start: Option<Instant> = None;
    loop {
        let wait = if batch.is_empty() {
            Duration::from_secs(3600)
        } else {
            let elapsed = batch_start.map(|t| t.elapsed()).unwrap_or_default();
            cfg.batch_window.saturating_sub(elapsed)
        };
        match timeout(wait, rx.recv()).await {
            Ok(Some(req)) => {
                if batch.is_empty() {
                    batch_start = Some(Instant::now());
                }
                batch.push(req);
                if batch.len() >= cfg.batch_max {
                    if !flush(
                        std::mem::take(&mut batch),
                        &mut next_quad,
                        &store,
                        &registry,
                        &monitors,
                        &ephemeral,
                        &cfg,
                        &shutdown,
                    )
                    .await
                    {
                        return;
                    }
                    batch_start = None;
                }
            }
            Ok(None) => {
                if !batch.is_empty() {
                    let _ = flush(
                        std::mem::take(&mut batch),
                        &mut next_quad,
                        &store,
                        &registry,
                        &monitors,
                        &ephemeral,
                        &cfg,
                        &shutdown,
                    )
                    .await;
                }
                return;
            }
            Err(_) => {
                if !batch.is_empty() {
                    if !flush(
                        std::mem::take(&mut batch),
                        &mut next_quad,
                        &store,
                        &registry,
                        &monitors,
                        &ephemeral,
                        &cfg,
                        &shutdown,
                    )
                    .await
                    {
                        return;
                    }
                    batch_start = None;
                }
            }
        }
    }
}

enum Verdict {
    Persisted(Outcome),
    Ephemeral { quad: u64 },
}

/// Commit one batch; returns false on a fatal store error.
#[allow(clippy::too_many_arguments)]
async fn flush(
    batch: Vec<WriteRequest>,
    next_quad: &mut u64,
    store: &Store,
    registry: &ConnectionRegistry,
    monitors: &[mpsc::Sender<MonitorMsg>],
    ephemeral: &EphemeralBuffer,
    cfg: &WriterConfig,
    shutdown: &watch::Sender<bool>,
) -> bool {
    let received_at = now_secs();
    let mut attempt = 0;
    let (verdicts, committed) = loop {
        attempt += 1;
        match try_commit(&batch, *next_quad, store, received_at) {
            Ok(result) => break result,
            Err(e) if e.is_transient() && attempt <= cfg.commit_retries => {
                tracing::warn!(attempt, error = %e, "commit failed, retrying batch");
                continue;
            }
            Err(e) => {
                tracing::error!(error = %e, "fatal store error, shutting down");
                for req in batch {
                    answer(req, Err(Reject::Error(format!("commit failed: {e}"))), registry);
                }
                let _ = shutdown.send(true);
                return false;
            }
        }
    };

    // Commit order: quads advance past everything this batch produced.
    if let Some(max) = committed.iter().map(|(q, _)| *q).max() {
        *next_quad = max + 1;
    }

    // Ephemeral events become queryable before the monitors hear about
    // them, so a scan finishing in between cannot miss them.
    for (req, verdict) in batch.iter().zip(&verdicts) {
        if let Verdict::Ephemeral { quad } = verdict {
            ephemeral.push(*quad, req.event.clone());
        }
    }

    if !committed.is_empty() {
        let publish = Arc::new(committed);
        for monitor in monitors {
            let _ = monitor.send(MonitorMsg::Committed(publish.clone())).await;
        }
    }

    for (req, verdict) in batch.into_iter().zip(verdicts) {
        let m = metrics();
        let result = match verdict {
            Verdict::Persisted(outcome) => {
                match &outcome {
                    Outcome::Stored { .. } | Outcome::Replaced { .. } => {
                        m.events_stored.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                        m.events_by_kind.inc(&req.event.kind.to_string());
                    }
                    Outcome::Duplicate | Outcome::Shadowed => {
                        m.events_duplicate.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    }
                }
                Ok(outcome)
            }
            Verdict::Ephemeral { quad } => {
                m.events_by_kind.inc(&req.event.kind.to_string());
                Ok(Outcome::Stored { quad })
            }
        };
        answer(req, result, registry);
    }
    true
}

type CommitResult = (Vec<Verdict>, Vec<(u64, Arc<Event>)>);

fn try_commit(
    batch: &[WriteRequest],
    first_quad: u64,
    store: &Store,
    received_at: i64,
) -> Result<CommitResult, StoreError> {
    let mut txn = store.txn_rw()?;
    let mut quad = first_quad;
    let mut verdicts = Vec::with_capacity(batch.len());
    let mut committed: Vec<(u64, Arc<Event>)> = Vec::new();
    for req in batch {
        if is_ephemeral(req.event.kind) {
            let assigned = quad;
            quad += 1;
            committed.push((assigned, req.event.clone()));
            verdicts.push(Verdict::Ephemeral { quad: assigned });
            continue;
        }
        let outcome = install(&mut txn, &req.event, quad, received_at)?;
        if let Some(assigned) = outcome.quad() {
            quad = assigned + 1;
            committed.push((assigned, req.event.clone()));
        }
        verdicts.push(Verdict::Persisted(outcome));
    }
    txn.commit()?;
    Ok((verdicts, committed))
}

fn answer(req: WriteRequest, result: Result<Outcome, Reject>, registry: &ConnectionRegistry) {
    match req.reply {
        WriteReply::Oneshot(tx) => {
            let _ = tx.send(result);
        }
        WriteReply::Connection(conn) => {
            let (accepted, message) = match &result {
                Ok(Outcome::Stored { .. }) | Ok(Outcome::Replaced { .. }) => (true, String::new()),
                Ok(Outcome::Duplicate) => {
                    (true, "duplicate: already have this event".to_string())
                }
                Ok(Outcome::Shadowed) => (true, "duplicate: have a newer version".to_string()),
                Err(reject) => (reject.acknowledged(), reject.to_string()),
            };
            registry.deliver(conn, frames::ok(&req.event.id, accepted, &message));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::testutil::signed_event;
    use crate::store::StoreOptions;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::time::timeout as ttimeout;

    struct Fixture {
        _dir: TempDir,
        store: Store,
        tx: mpsc::Sender<WriteRequest>,
        monitor_rx: mpsc::Receiver<MonitorMsg>,
        ephemeral: Arc<EphemeralBuffer>,
        shutdown_rx: watch::Receiver<bool>,
    }

    fn fixture_with(opts: StoreOptions, cfg: WriterConfig) -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path(), opts).unwrap();
        let registry = Arc::new(ConnectionRegistry::new(10));
        let ephemeral = Arc::new(EphemeralBuffer::new(Duration::from_secs(60)));
        let (tx, rx) = mpsc::channel(64);
        let (monitor_tx, monitor_rx) = mpsc::channel(64);
        let (shutdown, shutdown_rx) = watch::channel(false);
        tokio::spawn(run_writer(
            rx,
            store.clone(),
            registry,
            vec![monitor_tx],
            ephemeral.clone(),
            cfg,
            shutdown,
        ));
        Fixture {
            _dir: dir,
            store,
            tx,
            monitor_rx,
            ephemeral,
            shutdown_rx,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(
            StoreOptions::default(),
            WriterConfig {
                batch_max: 100,
                batch_window: Duration::from_millis(5),
                commit_retries: 3,
            },
        )
    }

    async fn submit(fx: &Fixture, event: Event) -> Result<Outcome, Reject> {
        let (otx, orx) = oneshot::channel();
        fx.tx
            .send(WriteRequest {
                event: Arc::new(event),
                reply: WriteReply::Oneshot(otx),
            })
            .await
            .unwrap();
        ttimeout(Duration::from_secs(1), orx)
            .await
            .expect("verdict expected")
            .unwrap()
    }

    #[tokio::test]
    async fn stores_events_with_monotonic_quads() {
        let fx = fixture();
        let a = submit(&fx, signed_event(1, 100, vec![], "a")).await.unwrap();
        let b = submit(&fx, signed_event(1, 101, vec![], "b")).await.unwrap();
        assert_eq!(a, Outcome::Stored { quad: 1 });
        assert_eq!(b, Outcome::Stored { quad: 2 });
        assert_eq!(last_quad(&fx.store.txn_ro()).unwrap(), 2);
    }

    #[tokio::test]
    async fn duplicates_and_shadowed_consume_no_quads() {
        let fx = fixture();
        let ev = signed_event(1, 100, vec![], "a");
        submit(&fx, ev.clone()).await.unwrap();
        assert_eq!(submit(&fx, ev).await.unwrap(), Outcome::Duplicate);

        let newer = signed_event(0, 200, vec![], "profile v2");
        let older = signed_event(0, 100, vec![], "profile v1");
        assert_eq!(
            submit(&fx, newer).await.unwrap(),
            Outcome::Stored { quad: 2 }
        );
        assert_eq!(submit(&fx, older).await.unwrap(), Outcome::Shadowed);

        let next = submit(&fx, signed_event(1, 300, vec![], "next")).await.unwrap();
        assert_eq!(next, Outcome::Stored { quad: 3 });
    }

    #[tokio::test]
    async fn committed_events_are_published_in_order() {
        let mut fx = fixture();
        submit(&fx, signed_event(1, 100, vec![], "a")).await.unwrap();
        submit(&fx, signed_event(1, 101, vec![], "b")).await.unwrap();

        let mut seen = Vec::new();
        while seen.len() < 2 {
            match ttimeout(Duration::from_secs(1), fx.monitor_rx.recv())
                .await
                .unwrap()
                .unwrap()
            {
                MonitorMsg::Committed(batch) => {
                    seen.extend(batch.iter().map(|(q, _)| *q));
                }
                _ => panic!("unexpected monitor message"),
            }
        }
        assert_eq!(seen, vec![1, 2]);
    }

    #[tokio::test]
    async fn ephemeral_events_bypass_the_store() {
        let mut fx = fixture();
        let outcome = submit(&fx, signed_event(20001, 100, vec![], "now")).await.unwrap();
        assert_eq!(outcome, Outcome::Stored { quad: 1 });
        assert_eq!(fx.ephemeral.len(), 1);
        assert_eq!(last_quad(&fx.store.txn_ro()).unwrap(), 0);

        // Still fanned out live.
        match ttimeout(Duration::from_secs(1), fx.monitor_rx.recv())
            .await
            .unwrap()
            .unwrap()
        {
            MonitorMsg::Committed(batch) => assert_eq!(batch[0].0, 1),
            _ => panic!("unexpected monitor message"),
        }

        // Later persisted events never reuse the synthetic quad.
        let stored = submit(&fx, signed_event(1, 100, vec![], "later")).await.unwrap();
        assert_eq!(stored, Outcome::Stored { quad: 2 });
    }

    #[tokio::test]
    async fn fatal_store_error_reports_and_shuts_down() {
        let mut fx = fixture_with(
            StoreOptions { map_bytes: 256 },
            WriterConfig {
                batch_max: 100,
                batch_window: Duration::from_millis(5),
                commit_retries: 3,
            },
        );
        let err = submit(&fx, signed_event(1, 100, vec![], &"x".repeat(4096)))
            .await
            .unwrap_err();
        assert!(matches!(err, Reject::Error(_)));
        fx.shutdown_rx.changed().await.unwrap();
        assert!(*fx.shutdown_rx.borrow());
    }
}
