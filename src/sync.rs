//! Sync client: reconcile the local store with a remote relay over
//! negentropy, then transfer the difference in both directions.

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::config::Settings;
use crate::event::{is_ephemeral, Event};
use crate::filter::Filter;
use crate::negentropy::{Item, Negentropy, NegentropyStorage};
use crate::query::collect_sync_items;
use crate::schema::{get_record, install, last_quad, lookup_id};
use crate::store::{Store, StoreOptions};

const SYNC_SUB: &str = "quern-sync";

/// What a sync session moved.
#[derive(Debug, Default, PartialEq)]
pub struct SyncReport {
    pub downloaded: usize,
    pub uploaded: usize,
}

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Reconcile with `relay` over `filter_json`; download what the remote
/// has that we lack, and optionally publish what only we hold.
pub async fn run(
    settings: &Settings,
    relay: &str,
    filter_json: Value,
    upload: bool,
) -> Result<SyncReport> {
    let filter = Filter::from_value(&filter_json).map_err(|e| anyhow!("{e}"))?;
    let store = Store::open(
        &settings.store_root,
        StoreOptions {
            map_bytes: settings.store_map_bytes,
        },
    )?;
    let items = collect_sync_items(
        store.clone(),
        filter,
        Duration::from_micros(settings.query_timeslice_us),
        settings.max_sync_events,
    )
    .await
    .map_err(|e| anyhow!("{e}"))?;
    tracing::info!(local = items.len(), relay, "starting reconciliation");

    let storage = NegentropyStorage::from_items(
        items
            .into_iter()
            .map(|(timestamp, id)| Item { timestamp, id })
            .collect(),
    );
    let mut session = Negentropy::initiator(storage);

    let url = Url::parse(relay).context("relay url")?;
    let (mut ws, _) = connect_async(url).await.context("connecting to relay")?;

    let open = json!(["NEG-OPEN", SYNC_SUB, filter_json, hex::encode(session.initiate())]);
    ws.send(Message::Text(open.to_string())).await?;

    let mut have: Vec<[u8; 32]> = Vec::new();
    let mut need: Vec<[u8; 32]> = Vec::new();
    loop {
        let frame = next_array(&mut ws).await?;
        match frame.first().and_then(Value::as_str) {
            Some("NEG-MSG") => {
                let payload = frame
                    .get(2)
                    .and_then(Value::as_str)
                    .and_then(|h| hex::decode(h).ok())
                    .ok_or_else(|| anyhow!("malformed NEG-MSG"))?;
                match session
                    .reconcile_with_ids(&payload, &mut have, &mut need)
                    .map_err(|e| anyhow!("{e}"))?
                {
                    Some(next) => {
                        let msg = json!(["NEG-MSG", SYNC_SUB, hex::encode(next)]);
                        ws.send(Message::Text(msg.to_string())).await?;
                    }
                    None => break,
                }
            }
            Some("NEG-ERR") => {
                bail!(
                    "remote reconciliation error: {}",
                    frame.get(2).and_then(Value::as_str).unwrap_or("unknown")
                )
            }
            _ => {}
        }
    }
    let _ = ws
        .send(Message::Text(json!(["NEG-CLOSE", SYNC_SUB]).to_string()))
        .await;
    tracing::info!(need = need.len(), have = have.len(), "reconciliation done");

    let mut report = SyncReport::default();
    report.downloaded = download(&mut ws, &store, settings, &need).await?;
    if upload {
        report.uploaded = publish(&mut ws, &store, &have).await?;
    }
    let _ = ws.close(None).await;
    Ok(report)
}

/// Fetch missing events by id and install them locally.
async fn download(
    ws: &mut Ws,
    store: &Store,
    settings: &Settings,
    need: &[[u8; 32]],
) -> Result<usize> {
    let mut downloaded = 0usize;
    for chunk in need.chunks(64) {
        let ids: Vec<String> = chunk.iter().map(hex::encode).collect();
        let req = json!(["REQ", SYNC_SUB, { "ids": ids }]);
        ws.send(Message::Text(req.to_string())).await?;
        let mut batch: Vec<Event> = Vec::new();
        loop {
            let frame = next_array(ws).await?;
            match frame.first().and_then(Value::as_str) {
                Some("EVENT") => {
                    let raw = frame.get(2).ok_or_else(|| anyhow!("malformed EVENT"))?;
                    let event: Event = serde_json::from_value(raw.clone())?;
                    if admit(&event, settings).is_ok() {
                        batch.push(event);
                    }
                }
                Some("EOSE") => break,
                Some("NOTICE") => {
                    tracing::warn!(
                        notice = frame.get(1).and_then(serde_json::Value::as_str).unwrap_or(""),
                        "remote notice during download"
                    );
                }
                _ => {}
            }
        }
        let _ = ws
            .send(Message::Text(json!(["CLOSE", SYNC_SUB]).to_string()))
            .await;
        downloaded += install_batch(store, &batch)?;
    }
    Ok(downloaded)
}

fn admit(event: &Event, settings: &Settings) -> Result<(), crate::error::Reject> {
    event.validate_structure(settings.max_event_bytes)?;
    if settings.verify_sig {
        event.verify()?;
    }
    Ok(())
}

/// Install a batch of events in one transaction, allocating quad ids
/// past the current maximum. Also used by the `ingest` subcommand.
pub fn install_batch(store: &Store, events: &[Event]) -> Result<usize> {
    if events.is_empty() {
        return Ok(0);
    }
    let mut next_quad = last_quad(&store.txn_ro())? + 1;
    let received_at = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    let mut txn = store.txn_rw()?;
    let mut stored = 0usize;
    for event in events {
        if is_ephemeral(event.kind) {
            continue;
        }
        let outcome = install(&mut txn, event, next_quad, received_at)?;
        if let Some(quad) = outcome.quad() {
            next_quad = quad + 1;
            stored += 1;
        }
    }
    txn.commit()?;
    Ok(stored)
}

/// Publish events only we hold back to the remote.
async fn publish(ws: &mut Ws, store: &Store, have: &[[u8; 32]]) -> Result<usize> {
    let mut uploaded = 0usize;
    for id in have {
        let event = {
            let txn = store.txn_ro();
            match lookup_id(&txn, id)? {
                Some(quad) => get_record(&txn, quad)?.map(|rec| rec.event),
                None => None,
            }
        };
        let Some(event) = event else { continue };
        ws.send(Message::Text(json!(["EVENT", event]).to_string()))
            .await?;
        // One OK per submission keeps the socket drained.
        loop {
            let frame = next_array(ws).await?;
            if frame.first().and_then(Value::as_str) == Some("OK") {
                uploaded += 1;
                break;
            }
        }
    }
    Ok(uploaded)
}

async fn next_array(ws: &mut Ws) -> Result<Vec<Value>> {
    loop {
        let msg = ws
            .next()
            .await
            .ok_or_else(|| anyhow!("relay closed the connection"))??;
        match msg {
            Message::Text(text) => {
                let value: Value = serde_json::from_str(&text).context("remote frame")?;
                let arr = value
                    .as_array()
                    .ok_or_else(|| anyhow!("remote frame is not an array"))?;
                return Ok(arr.clone());
            }
            Message::Close(_) => bail!("relay closed the connection"),
            _ => {}
        }
    }
}
