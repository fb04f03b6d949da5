//! Process-wide telemetry counters with a Prometheus text renderer.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;

/// A counter keyed by a label value, e.g. message verb or event kind.
///
/// The hot path takes a read lock and bumps an existing atomic; the
/// write lock is only taken the first time a label appears.
#[derive(Default)]
pub struct LabeledCounter {
    counters: RwLock<BTreeMap<String, Arc<AtomicU64>>>,
}

impl LabeledCounter {
    pub fn inc(&self, label: &str) {
        self.add(label, 1);
    }

    pub fn add(&self, label: &str, n: u64) {
        {
            let counters = self.counters.read();
            if let Some(c) = counters.get(label) {
                c.fetch_add(n, Ordering::Relaxed);
                return;
            }
        }
        let mut counters = self.counters.write();
        counters
            .entry(label.to_string())
            .or_default()
            .fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self, label: &str) -> u64 {
        self.counters
            .read()
            .get(label)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    fn snapshot(&self) -> BTreeMap<String, u64> {
        self.counters
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.load(Ordering::Relaxed)))
            .collect()
    }
}

/// All counters the relay exposes.
#[derive(Default)]
pub struct Metrics {
    /// Messages from clients, by verb.
    pub client_messages: LabeledCounter,
    /// Messages to clients, by verb.
    pub relay_messages: LabeledCounter,
    /// Accepted events, by kind.
    pub events_by_kind: LabeledCounter,
    /// Events durably committed.
    pub events_stored: AtomicU64,
    /// Events refused with a duplicate verdict.
    pub events_duplicate: AtomicU64,
    /// Events refused for any other reason.
    pub events_rejected: AtomicU64,
    /// Currently open websocket connections.
    pub connections_open: AtomicI64,
}

impl Metrics {
    /// Render all counters in the Prometheus text exposition format.
    pub fn render(&self) -> String {
        let mut out = String::new();

        out.push_str("# HELP nostr_client_messages_total Client messages received, by verb\n");
        out.push_str("# TYPE nostr_client_messages_total counter\n");
        for (verb, count) in self.client_messages.snapshot() {
            out.push_str(&format!(
                "nostr_client_messages_total{{verb=\"{verb}\"}} {count}\n"
            ));
        }

        out.push_str("# HELP nostr_relay_messages_total Relay messages sent, by verb\n");
        out.push_str("# TYPE nostr_relay_messages_total counter\n");
        for (verb, count) in self.relay_messages.snapshot() {
            out.push_str(&format!(
                "nostr_relay_messages_total{{verb=\"{verb}\"}} {count}\n"
            ));
        }

        out.push_str("# HELP nostr_events_total Accepted events, by kind\n");
        out.push_str("# TYPE nostr_events_total counter\n");
        for (kind, count) in self.events_by_kind.snapshot() {
            out.push_str(&format!("nostr_events_total{{kind=\"{kind}\"}} {count}\n"));
        }

        out.push_str("# HELP nostr_events_stored_total Events durably committed\n");
        out.push_str("# TYPE nostr_events_stored_total counter\n");
        out.push_str(&format!(
            "nostr_events_stored_total {}\n",
            self.events_stored.load(Ordering::Relaxed)
        ));

        out.push_str("# HELP nostr_events_duplicate_total Duplicate submissions\n");
        out.push_str("# TYPE nostr_events_duplicate_total counter\n");
        out.push_str(&format!(
            "nostr_events_duplicate_total {}\n",
            self.events_duplicate.load(Ordering::Relaxed)
        ));

        out.push_str("# HELP nostr_events_rejected_total Rejected submissions\n");
        out.push_str("# TYPE nostr_events_rejected_total counter\n");
        out.push_str(&format!(
            "nostr_events_rejected_total {}\n",
            self.events_rejected.load(Ordering::Relaxed)
        ));

        out.push_str("# HELP nostr_connections_open Open websocket connections\n");
        out.push_str("# TYPE nostr_connections_open gauge\n");
        out.push_str(&format!(
            "nostr_connections_open {}\n",
            self.connections_open.load(Ordering::Relaxed)
        ));

        out
    }
}

/// The process-wide registry, initialised on first use.
pub fn metrics() -> &'static Metrics {
    static METRICS: OnceLock<Metrics> = OnceLock::new();
    METRICS.get_or_init(Metrics::default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labeled_counter_accumulates() {
        let c = LabeledCounter::default();
        c.inc("EVENT");
        c.inc("EVENT");
        c.add("REQ", 3);
        assert_eq!(c.get("EVENT"), 2);
        assert_eq!(c.get("REQ"), 3);
        assert_eq!(c.get("CLOSE"), 0);
    }

    #[test]
    fn render_contains_series_and_types() {
        let m = Metrics::default();
        m.client_messages.inc("EVENT");
        m.events_by_kind.inc("1");
        m.events_stored.fetch_add(2, Ordering::Relaxed);
        let text = m.render();
        assert!(text.contains("# TYPE nostr_client_messages_total counter"));
        assert!(text.contains("nostr_client_messages_total{verb=\"EVENT\"} 1"));
        assert!(text.contains("nostr_events_total{kind=\"1\"} 1"));
        assert!(text.contains("nostr_events_stored_total 2"));
        assert!(text.contains("# TYPE nostr_connections_open gauge"));
    }

    #[test]
    fn global_registry_is_shared() {
        metrics().relay_messages.inc("EOSE");
        assert!(metrics().relay_messages.get("EOSE") >= 1);
    }
}
