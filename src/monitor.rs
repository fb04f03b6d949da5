//! Live subscription monitors: partitioned fan-out of committed events.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::conn::{frames, ConnId, ConnectionRegistry, SubId};
use crate::event::Event;
use crate::filter::FilterGroup;
use crate::schema::{quad_key, tbl, StoredRecord};
use crate::store::Store;

/// Work items for one monitor partition.
pub enum MonitorMsg {
    /// Events just committed, in commit order.
    Committed(Arc<Vec<(u64, Arc<Event>)>>),
    /// A subscription whose initial scan has finished.
    Activate {
        conn: ConnId,
        sub: SubId,
        group: FilterGroup,
        /// Highest quad id the scan's snapshot covered.
        latest_quad: u64,
        cancel: Arc<AtomicBool>,
    },
    Close {
        conn: ConnId,
        sub: SubId,
    },
    Disconnect {
        conn: ConnId,
    },
}

struct Sub {
    group: FilterGroup,
    latest_quad: u64,
    cancel: Arc<AtomicBool>,
}

/// One partition of the monitor pool. Connections are assigned by
/// `conn % workers`, so per-connection fan-out stays single-threaded.
pub async fn run_monitor(
    mut rx: mpsc::Receiver<MonitorMsg>,
    store: Store,
    registry: Arc<ConnectionRegistry>,
) {
    let mut conns: HashMap<ConnId, HashMap<SubId, Sub>> = HashMap::new();
    while let Some(msg) = rx.recv().await {
        match msg {
            MonitorMsg::Committed(batch) => {
                let mut dead_conns: Vec<ConnId> = Vec::new();
                for (&conn, subs) in conns.iter_mut() {
                    let mut dead_subs: Vec<SubId> = Vec::new();
                    'subs: for (sub_id, sub) in subs.iter_mut() {
                        if sub.cancel.load(Ordering::Relaxed) {
                            dead_subs.push(sub_id.clone());
                            continue;
                        }
                        for (quad, event) in batch.iter() {
                            if sub.latest_quad >= *quad {
                                continue;
                            }
                            // Advance even without a match: every quad
                            // is considered exactly once per sub.
                            sub.latest_quad = *quad;
                            if sub.group.matches(event) {
                                if !registry.deliver(conn, frames::event(sub_id, event)) {
                                    dead_conns.push(conn);
                                    break 'subs;
                                }
                            }
                        }
                    }
                    for sub_id in dead_subs {
                        subs.remove(&sub_id);
                    }
                }
                for conn in dead_conns {
                    conns.remove(&conn);
                }
            }
            MonitorMsg::Activate {
                conn,
                sub,
                group,
                latest_quad,
                cancel,
            } => {
                if cancel.load(Ordering::Relaxed) || !registry.is_open(conn) {
                    continue;
                }
                // Close the gap between the scan snapshot and now so
                // nothing committed mid-scan is missed.
                let mut state = Sub {
                    group,
                    latest_quad,
                    cancel,
                };
                if catch_up(&store, &registry, conn, &sub, &mut state) {
                    conns.entry(conn).or_default().insert(sub, state);
                }
            }
            MonitorMsg::Close { conn, sub } => {
                if let Some(subs) = conns.get_mut(&conn) {
                    subs.remove(&sub);
                    if subs.is_empty() {
                        conns.remove(&conn);
                    }
                }
            }
            MonitorMsg::Disconnect { conn } => {
                conns.remove(&conn);
            }
        }
    }
}

/// Deliver events committed after the scan snapshot; returns whether
/// the connection is still alive.
fn catch_up(
    store: &Store,
    registry: &ConnectionRegistry,
    conn: ConnId,
    sub_id: &SubId,
    sub: &mut Sub,
) -> bool {
    let txn = store.txn_ro();
    let mut cur = txn.cursor(tbl::PRIMARY);
    let mut found = cur.seek(&quad_key(sub.latest_quad + 1));
    while let Some((key, value)) = found {
        let quad = match key.as_slice().try_into() {
            Ok(bytes) => u64::from_be_bytes(bytes),
            Err(_) => break,
        };
        sub.latest_quad = quad;
        if let Ok(record) = serde_json::from_slice::<StoredRecord>(&value) {
            if sub.group.matches(&record.event) {
                if !registry.deliver(conn, frames::event(sub_id, &record.event)) {
                    return false;
                }
            }
        }
        found = cur.next();
    }
    true
}
