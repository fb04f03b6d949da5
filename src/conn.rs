//! Per-connection bookkeeping: ids, subscriptions, outbound queues.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::error::Reject;
use crate::event::Event;
use crate::metrics::metrics;

/// Relay-local connection identifier.
pub type ConnId = u64;

/// A validated client-chosen subscription id.
///
/// 1 to 64 bytes, printable ASCII, excluding `"` and `\`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubId(String);

impl SubId {
    pub const MAX_LEN: usize = 64;

    pub fn new(raw: &str) -> Result<SubId, Reject> {
        if raw.is_empty() || raw.len() > Self::MAX_LEN {
            return Err(Reject::invalid("invalid subscription id length"));
        }
        let bad = raw
            .bytes()
            .any(|b| b < 0x20 || b == b'"' || b == b'\\' || b >= 0x7f);
        if bad {
            return Err(Reject::invalid("invalid character in subscription id"));
        }
        Ok(SubId(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SubId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Outbound frame constructors. Every frame the relay emits is built
/// here so the verb counters stay accurate.
pub mod frames {
    use super::*;

    pub fn event(sub: &SubId, ev: &Event) -> String {
        metrics().relay_messages.inc("EVENT");
        serde_json::json!(["EVENT", sub.as_str(), ev]).to_string()
    }

    pub fn eose(sub: &SubId) -> String {
        metrics().relay_messages.inc("EOSE");
        serde_json::json!(["EOSE", sub.as_str()]).to_string()
    }

    pub fn ok(event_id: &str, accepted: bool, message: &str) -> String {
        metrics().relay_messages.inc("OK");
        serde_json::json!(["OK", event_id, accepted, message]).to_string()
    }

    pub fn notice(message: &str) -> String {
        metrics().relay_messages.inc("NOTICE");
        serde_json::json!(["NOTICE", message]).to_string()
    }

    pub fn neg_msg(sub: &SubId, payload_hex: &str) -> String {
        metrics().relay_messages.inc("NEG-MSG");
        serde_json::json!(["NEG-MSG", sub.as_str(), payload_hex]).to_string()
    }

    pub fn neg_err(sub: &SubId, message: &str) -> String {
        metrics().relay_messages.inc("NEG-ERR");
        serde_json::json!(["NEG-ERR", sub.as_str(), message]).to_string()
    }
}

struct ConnEntry {
    outbound: mpsc::Sender<String>,
    /// Cancellation flags for the connection's live or scanning subs.
    subs: HashMap<SubId, Arc<AtomicBool>>,
}

/// Table of open connections, shared across all pools.
///
/// Subscriptions reference connections by id only; a stale id simply
/// fails lookup.
pub struct ConnectionRegistry {
    next: AtomicU64,
    max_subs: usize,
    inner: RwLock<HashMap<ConnId, ConnEntry>>,
}

impl ConnectionRegistry {
    pub fn new(max_subs: usize) -> Self {
        ConnectionRegistry {
            next: AtomicU64::new(1),
            max_subs,
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Admit a connection and hand back its id.
    pub fn register(&self, outbound: mpsc::Sender<String>) -> ConnId {
        let conn = self.next.fetch_add(1, Ordering::Relaxed);
        self.inner.write().insert(
            conn,
            ConnEntry {
                outbound,
                subs: HashMap::new(),
            },
        );
        metrics().connections_open.fetch_add(1, Ordering::Relaxed);
        conn
    }

    /// Remove a connection, cancelling everything it owns.
    pub fn unregister(&self, conn: ConnId) -> Vec<SubId> {
        let entry = self.inner.write().remove(&conn);
        match entry {
            Some(entry) => {
                metrics().connections_open.fetch_sub(1, Ordering::Relaxed);
                entry
                    .subs
                    .into_iter()
                    .map(|(sub, cancel)| {
                        cancel.store(true, Ordering::Relaxed);
                        sub
                    })
                    .collect()
            }
            None => Vec::new(),
        }
    }

    pub fn is_open(&self, conn: ConnId) -> bool {
        self.inner.read().contains_key(&conn)
    }

    /// Open a subscription, enforcing the per-connection cap. Reusing a
    /// live subid cancels the previous one first.
    pub fn add_sub(&self, conn: ConnId, sub: SubId) -> Result<Arc<AtomicBool>, Reject> {
        let mut inner = self.inner.write();
        let entry = inner
            .get_mut(&conn)
            .ok_or_else(|| Reject::Error("connection is gone".into()))?;
        if let Some(prior) = entry.subs.remove(&sub) {
            prior.store(true, Ordering::Relaxed);
        } else if entry.subs.len() >= self.max_subs {
            return Err(Reject::RateLimited(format!(
                "too many subscriptions (max {})",
                self.max_subs
            )));
        }
        let cancel = Arc::new(AtomicBool::new(false));
        entry.subs.insert(sub, cancel.clone());
        Ok(cancel)
    }

    /// Close one subscription; returns whether it existed.
    pub fn remove_sub(&self, conn: ConnId, sub: &SubId) -> bool {
        let mut inner = self.inner.write();
        let Some(entry) = inner.get_mut(&conn) else {
            return false;
        };
        match entry.subs.remove(sub) {
            Some(cancel) => {
                cancel.store(true, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    pub fn sub_count(&self, conn: ConnId) -> usize {
        self.inner
            .read()
            .get(&conn)
            .map(|e| e.subs.len())
            .unwrap_or(0)
    }

    /// Queue a frame without blocking. A connection whose outbound
    /// queue is full cannot keep up and is dropped.
    pub fn deliver(&self, conn: ConnId, frame: String) -> bool {
        let sender = {
            let inner = self.inner.read();
            match inner.get(&conn) {
                Some(entry) => entry.outbound.clone(),
                None => return false,
            }
        };
        match sender.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.unregister(conn);
                false
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(conn, "dropping connection that cannot keep up");
                self.unregister(conn);
                false
            }
        }
    }
}
