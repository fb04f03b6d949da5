//! Ingester pool: parse, validate, verify, and route client messages.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;
use tokio::sync::mpsc;

use crate::config::Settings;
use crate::conn::{frames, ConnId, ConnectionRegistry, SubId};
use crate::error::Reject;
use crate::event::Event;
use crate::filter::{Filter, FilterGroup};
use crate::metrics::metrics;
use crate::monitor::MonitorMsg;
use crate::negentropy::NegJob;
use crate::policy::{Verdict, WritePolicy};
use crate::query::ScanJob;
use crate::writer::{WriteReply, WriteRequest};

/// A parsed incoming frame.
#[derive(Debug, Clone)]
pub enum ClientMessage {
    Event(Event),
    Req { sub: String, filters: Vec<Value> },
    Close { sub: String },
    NegOpen {
        sub: String,
        filter: Value,
        initial_hex: String,
    },
    NegMsg { sub: String, payload_hex: String },
    NegClose { sub: String },
}

impl ClientMessage {
    /// Parse one text frame of the client protocol.
    pub fn parse(text: &str) -> Result<ClientMessage, Reject> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| Reject::invalid(format!("malformed json: {e}")))?;
        let arr = value
            .as_array()
            .ok_or_else(|| Reject::invalid("frame must be a json array"))?;
        let verb = arr
            .first()
            .and_then(|v| v.as_str())
            .ok_or_else(|| Reject::invalid("frame verb must be a string"))?;
        let sub_at = |idx: usize| -> Result<String, Reject> {
            Ok(arr
                .get(idx)
                .and_then(|v| v.as_str())
                .ok_or_else(|| Reject::invalid("subscription id must be a string"))?
                .to_string())
        };
        match verb {
            "EVENT" => {
                let raw = arr
                    .get(1)
                    .ok_or_else(|| Reject::invalid("EVENT frame is missing the event"))?;
                let event: Event = serde_json::from_value(raw.clone())
                    .map_err(|e| Reject::invalid(format!("malformed event: {e}")))?;
                Ok(ClientMessage::Event(event))
            }
            "REQ" => Ok(ClientMessage::Req {
                sub: sub_at(1)?,
                filters: arr[2..].to_vec(),
            }),
            "CLOSE" => Ok(ClientMessage::Close { sub: sub_at(1)? }),
            "NEG-OPEN" => Ok(ClientMessage::NegOpen {
                sub: sub_at(1)?,
                filter: arr
                    .get(2)
                    .cloned()
                    .ok_or_else(|| Reject::invalid("NEG-OPEN frame is missing the filter"))?,
                initial_hex: sub_at(3)
                    .map_err(|_| Reject::invalid("NEG-OPEN message must be hex"))?,
            }),
            "NEG-MSG" => Ok(ClientMessage::NegMsg {
                sub: sub_at(1)?,
                payload_hex: sub_at(2)
                    .map_err(|_| Reject::invalid("NEG-MSG message must be hex"))?,
            }),
            "NEG-CLOSE" => Ok(ClientMessage::NegClose { sub: sub_at(1)? }),
            other => Err(Reject::invalid(format!("unknown verb: {other}"))),
        }
    }

    pub fn verb(&self) -> &'static str {
        match self {
            ClientMessage::Event(_) => "EVENT",
            ClientMessage::Req { .. } => "REQ",
            ClientMessage::Close { .. } => "CLOSE",
            ClientMessage::NegOpen { .. } => "NEG-OPEN",
            ClientMessage::NegMsg { .. } => "NEG-MSG",
            ClientMessage::NegClose { .. } => "NEG-CLOSE",
        }
    }
}

/// One unit of ingester work.
pub struct IngestJob {
    pub conn: ConnId,
    pub msg: ClientMessage,
}

/// Everything an ingester worker routes into.
pub struct IngestRoutes {
    pub registry: Arc<ConnectionRegistry>,
    pub writer: mpsc::Sender<WriteRequest>,
    pub req_workers: Vec<mpsc::Sender<ScanJob>>,
    pub monitors: Vec<mpsc::Sender<MonitorMsg>>,
    pub neg_workers: Vec<mpsc::Sender<NegJob>>,
    pub policy: Arc<dyn WritePolicy>,
    pub settings: Arc<Settings>,
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// One worker of the ingester pool. Frames for a given connection all
/// land on the same worker, so per-connection order is preserved.
pub async fn run_ingester(mut rx: mpsc::Receiver<IngestJob>, routes: Arc<IngestRoutes>) {
    while let Some(job) = rx.recv().await {
        handle(job, &routes).await;
    }
}

async fn handle(job: IngestJob, routes: &IngestRoutes) {
    let conn = job.conn;
    match job.msg {
        ClientMessage::Event(event) => {
            if let Err(reject) = admit_event(&event, routes) {
                metrics()
                    .events_rejected
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                routes.registry.deliver(
                    conn,
                    frames::ok(&event.id, reject.acknowledged(), &reject.to_string()),
                );
                return;
            }
            match routes.policy.evaluate(&event) {
                Verdict::Accept => {
                    let request = WriteRequest {
                        event: Arc::new(event),
                        reply: WriteReply::Connection(conn),
                    };
                    // A full writer queue holds this worker (and its
                    // connections' socket reads) back.
                    let _ = routes.writer.send(request).await;
                }
                Verdict::Reject(message) => {
                    metrics()
                        .events_rejected
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    let reject = Reject::Blocked(message);
                    routes
                        .registry
                        .deliver(conn, frames::ok(&event.id, false, &reject.to_string()));
                }
                Verdict::ShadowReject => {
                    routes
                        .registry
                        .deliver(conn, frames::ok(&event.id, true, ""));
                }
            }
        }
        ClientMessage::Req { sub, filters } => {
            let sub = match SubId::new(&sub) {
                Ok(sub) => sub,
                Err(reject) => {
                    routes
                        .registry
                        .deliver(conn, frames::notice(&reject.to_string()));
                    return;
                }
            };
            let group = match FilterGroup::from_values(&filters) {
                Ok(group) => group,
                Err(reject) => {
                    routes
                        .registry
                        .deliver(conn, frames::notice(&reject.to_string()));
                    return;
                }
            };
            let cancel = match routes.registry.add_sub(conn, sub.clone()) {
                Ok(cancel) => cancel,
                Err(reject) => {
                    routes
                        .registry
                        .deliver(conn, frames::notice(&reject.to_string()));
                    return;
                }
            };
            let worker = &routes.req_workers[(conn as usize) % routes.req_workers.len()];
            let _ = worker
                .send(ScanJob {
                    conn,
                    sub,
                    group,
                    cancel,
                })
                .await;
        }
        ClientMessage::Close { sub } => {
            let Ok(sub) = SubId::new(&sub) else {
                return;
            };
            routes.registry.remove_sub(conn, &sub);
            let monitor = &routes.monitors[(conn as usize) % routes.monitors.len()];
            let _ = monitor.send(MonitorMsg::Close { conn, sub }).await;
        }
        ClientMessage::NegOpen {
            sub,
            filter,
            initial_hex,
        } => {
            let Ok(sub) = SubId::new(&sub) else {
                routes
                    .registry
                    .deliver(conn, frames::notice("invalid: bad subscription id"));
                return;
            };
            let filter = match Filter::from_value(&filter) {
                Ok(filter) => filter,
                Err(reject) => {
                    routes
                        .registry
                        .deliver(conn, frames::neg_err(&sub, &reject.to_string()));
                    return;
                }
            };
            let worker = &routes.neg_workers[(conn as usize) % routes.neg_workers.len()];
            let _ = worker
                .send(NegJob::Open {
                    conn,
                    sub,
                    filter,
                    initial_hex,
                })
                .await;
        }
        ClientMessage::NegMsg { sub, payload_hex } => {
            let Ok(sub) = SubId::new(&sub) else {
                return;
            };
            let worker = &routes.neg_workers[(conn as usize) % routes.neg_workers.len()];
            let _ = worker
                .send(NegJob::Msg {
                    conn,
                    sub,
                    payload_hex,
                })
                .await;
        }
        ClientMessage::NegClose { sub } => {
            let Ok(sub) = SubId::new(&sub) else {
                return;
            };
            let worker = &routes.neg_workers[(conn as usize) % routes.neg_workers.len()];
            let _ = worker.send(NegJob::Close { conn, sub }).await;
        }
    }
}

/// Syntactic and cryptographic admission checks for a submission.
fn admit_event(event: &Event, routes: &IngestRoutes) -> Result<(), Reject> {
    let settings = &routes.settings;
    event.validate_structure(settings.max_event_bytes)?;
    event.validate_created_at(
        now_secs(),
        settings.reject_older_secs,
        settings.reject_newer_secs,
    )?;
    if settings.verify_sig {
        event.verify()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_every_verb() {
        let ev = crate::event::testutil::signed_event(1, 1, vec![], "x");
        let frame = json!(["EVENT", ev]).to_string();
        assert!(matches!(
            ClientMessage::parse(&frame).unwrap(),
            ClientMessage::Event(_)
        ));

        let msg = ClientMessage::parse(&json!(["REQ", "s1", {"kinds": [1]}]).to_string()).unwrap();
        match &msg {
            ClientMessage::Req { sub, filters } => {
                assert_eq!(sub, "s1");
                assert_eq!(filters.len(), 1);
            }
            _ => panic!("expected REQ"),
        }
        assert_eq!(msg.verb(), "REQ");

        assert!(matches!(
            ClientMessage::parse(&json!(["CLOSE", "s1"]).to_string()).unwrap(),
            ClientMessage::Close { .. }
        ));
        assert!(matches!(
            ClientMessage::parse(&json!(["NEG-OPEN", "s1", {}, "61"]).to_string()).unwrap(),
            ClientMessage::NegOpen { .. }
        ));
        assert!(matches!(
            ClientMessage::parse(&json!(["NEG-MSG", "s1", "61"]).to_string()).unwrap(),
            ClientMessage::NegMsg { .. }
        ));
        assert!(matches!(
            ClientMessage::parse(&json!(["NEG-CLOSE", "s1"]).to_string()).unwrap(),
            ClientMessage::NegClose { .. }
        ));
    }

    #[test]
    fn rejects_malformed_frames() {
        assert!(ClientMessage::parse("not json").is_err());
        assert!(ClientMessage::parse("{}").is_err());
        assert!(ClientMessage::parse("[]").is_err());
        assert!(ClientMessage::parse("[1, 2]").is_err());
        assert!(ClientMessage::parse("[\"WHAT\"]").is_err());
        assert!(ClientMessage::parse("[\"EVENT\"]").is_err());
        assert!(ClientMessage::parse("[\"EVENT\", {\"id\": 5}]").is_err());
        assert!(ClientMessage::parse("[\"REQ\", 7]").is_err());
        assert!(ClientMessage::parse("[\"NEG-OPEN\", \"s\", {}]").is_err());
    }

    #[test]
    fn req_with_no_filters_parses_but_group_rejects() {
        let msg = ClientMessage::parse(&json!(["REQ", "s1"]).to_string()).unwrap();
        match msg {
            ClientMessage::Req { filters, .. } => {
                assert!(FilterGroup::from_values(&filters).is_err());
            }
            _ => panic!("expected REQ"),
        }
    }
}
