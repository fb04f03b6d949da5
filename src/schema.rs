//! Event schema over the store: primary table, secondary indices, and
//! the retention rules for replaceable and ephemeral kinds.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::event::{is_param_replaceable, is_replaceable, Event};
use crate::store::{ReadTxn, WriteTxn};

/// Table identifiers. Each index maps a composite key to a quad id.
pub mod tbl {
    /// quad -> stored record
    pub const PRIMARY: u8 = 0;
    /// id -> quad
    pub const BY_ID: u8 = 1;
    /// (pubkey, kind, created_at, quad)
    pub const BY_PUBKEY_KIND: u8 = 2;
    /// (pubkey, created_at, quad)
    pub const BY_PUBKEY: u8 = 3;
    /// (kind, created_at, quad)
    pub const BY_KIND: u8 = 4;
    /// (created_at, quad)
    pub const BY_CREATED: u8 = 5;
    /// (letter, value, created_at, quad)
    pub const BY_TAG: u8 = 6;
    /// (pubkey, kind[, d-value]) -> quad
    pub const REPLACEABLE: u8 = 7;
}

/// Longest tag value that gets an index row.
const MAX_INDEXED_TAG_VALUE: usize = 255;

/// What `install` did with a submitted event.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Newly written under this quad id.
    Stored { quad: u64 },
    /// The id is already present; nothing was written.
    Duplicate,
    /// Written under this quad id, deleting an older version.
    Replaced { quad: u64, replaced: u64 },
    /// An equal-or-newer version is already stored; nothing was written.
    Shadowed,
}

impl Outcome {
    /// The quad id the event is now live under, if any.
    pub fn quad(&self) -> Option<u64> {
        match self {
            Outcome::Stored { quad } | Outcome::Replaced { quad, .. } => Some(*quad),
            _ => None,
        }
    }
}

/// Row stored in the primary table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredRecord {
    pub event: Event,
    /// Wall-clock admission time, unix seconds.
    pub received_at: i64,
}

/// Uniform point-lookup access for read and write transactions.
pub trait Kv {
    fn kv_get(&self, table: u8, key: &[u8]) -> Option<Vec<u8>>;
}

impl Kv for ReadTxn {
    fn kv_get(&self, table: u8, key: &[u8]) -> Option<Vec<u8>> {
        self.get(table, key)
    }
}

impl Kv for WriteTxn<'_> {
    fn kv_get(&self, table: u8, key: &[u8]) -> Option<Vec<u8>> {
        self.get(table, key)
    }
}

/// Order-preserving encoding of a signed timestamp.
pub fn ts_bytes(created_at: i64) -> [u8; 8] {
    ((created_at as u64) ^ (1 << 63)).to_be_bytes()
}

/// Inverse of [`ts_bytes`].
pub fn ts_from(bytes: [u8; 8]) -> i64 {
    (u64::from_be_bytes(bytes) ^ (1 << 63)) as i64
}

pub fn quad_key(quad: u64) -> [u8; 8] {
    quad.to_be_bytes()
}

fn corrupt(what: &str) -> StoreError {
    StoreError::Corrupt(what.to_string())
}

fn decode_event_keys(event: &Event) -> Result<([u8; 32], [u8; 32]), StoreError> {
    let id = event.id_bytes().map_err(|_| corrupt("stored event id"))?;
    let pubkey = event
        .pubkey_bytes()
        .map_err(|_| corrupt("stored event pubkey"))?;
    Ok((id, pubkey))
}

fn pubkey_kind_key(pubkey: &[u8; 32], kind: u16, created_at: i64, quad: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(32 + 2 + 16);
    key.extend_from_slice(pubkey);
    key.extend_from_slice(&kind.to_be_bytes());
    key.extend_from_slice(&ts_bytes(created_at));
    key.extend_from_slice(&quad_key(quad));
    key
}

fn pubkey_key(pubkey: &[u8; 32], created_at: i64, quad: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(32 + 16);
    key.extend_from_slice(pubkey);
    key.extend_from_slice(&ts_bytes(created_at));
    key.extend_from_slice(&quad_key(quad));
    key
}

fn kind_key(kind: u16, created_at: i64, quad: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(2 + 16);
    key.extend_from_slice(&kind.to_be_bytes());
    key.extend_from_slice(&ts_bytes(created_at));
    key.extend_from_slice(&quad_key(quad));
    key
}

fn created_key(created_at: i64, quad: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(16);
    key.extend_from_slice(&ts_bytes(created_at));
    key.extend_from_slice(&quad_key(quad));
    key
}

/// Tag index prefix: letter, length-prefixed value.
pub fn tag_prefix(letter: u8, value: &str) -> Vec<u8> {
    let value = &value.as_bytes()[..value.len().min(MAX_INDEXED_TAG_VALUE)];
    let mut key = Vec::with_capacity(3 + value.len());
    key.push(letter);
    key.extend_from_slice(&(value.len() as u16).to_be_bytes());
    key.extend_from_slice(value);
    key
}

fn tag_key(letter: u8, value: &str, created_at: i64, quad: u64) -> Vec<u8> {
    let mut key = tag_prefix(letter, value);
    key.extend_from_slice(&ts_bytes(created_at));
    key.extend_from_slice(&quad_key(quad));
    key
}

/// Winner-slot key for replaceable and parameterised-replaceable kinds.
pub fn replaceable_key(pubkey: &[u8; 32], kind: u16, d_value: Option<&str>) -> Vec<u8> {
    let mut key = Vec::with_capacity(32 + 2 + 2 + d_value.map(str::len).unwrap_or(0));
    key.extend_from_slice(pubkey);
    key.extend_from_slice(&kind.to_be_bytes());
    if let Some(d) = d_value {
        key.extend_from_slice(&(d.len() as u16).to_be_bytes());
        key.extend_from_slice(d.as_bytes());
    }
    key
}

fn event_replaceable_key(event: &Event, pubkey: &[u8; 32]) -> Option<Vec<u8>> {
    if is_replaceable(event.kind) {
        Some(replaceable_key(pubkey, event.kind, None))
    } else if is_param_replaceable(event.kind) {
        Some(replaceable_key(pubkey, event.kind, Some(event.d_tag())))
    } else {
        None
    }
}

/// Split the trailing `(created_at, quad)` off an index key.
pub fn index_key_suffix(key: &[u8]) -> Result<(i64, u64), StoreError> {
    if key.len() < 16 {
        return Err(corrupt("index key too short"));
    }
    let tail = &key[key.len() - 16..];
    let ts: [u8; 8] = tail[..8].try_into().map_err(|_| corrupt("index ts"))?;
    let quad: [u8; 8] = tail[8..].try_into().map_err(|_| corrupt("index quad"))?;
    Ok((ts_from(ts), u64::from_be_bytes(quad)))
}

/// Load the primary record for a quad id.
pub fn get_record(txn: &impl Kv, quad: u64) -> Result<Option<StoredRecord>, StoreError> {
    match txn.kv_get(tbl::PRIMARY, &quad_key(quad)) {
        Some(bytes) => {
            let rec = serde_json::from_slice(&bytes).map_err(|_| corrupt("primary record"))?;
            Ok(Some(rec))
        }
        None => Ok(None),
    }
}

/// Resolve an event id to its quad, if stored.
pub fn lookup_id(txn: &impl Kv, id: &[u8; 32]) -> Result<Option<u64>, StoreError> {
    match txn.kv_get(tbl::BY_ID, id) {
        Some(bytes) => {
            let quad: [u8; 8] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| corrupt("by_id value"))?;
            Ok(Some(u64::from_be_bytes(quad)))
        }
        None => Ok(None),
    }
}

/// Highest quad id in the primary table; the Writer's recovery point.
pub fn last_quad(txn: &ReadTxn) -> Result<u64, StoreError> {
    let mut cur = txn.cursor(tbl::PRIMARY);
    match cur.seek_back(&[0xff; 8]) {
        Some((key, _)) => {
            let bytes: [u8; 8] = key
                .as_slice()
                .try_into()
                .map_err(|_| corrupt("primary key"))?;
            Ok(u64::from_be_bytes(bytes))
        }
        None => Ok(0),
    }
}

/// Install one event inside the open write transaction.
///
/// Runs the admission algorithm: duplicate check, replaceable-winner
/// resolution, index fan-out, and kind-5 deletion processing. Ephemeral
/// kinds must not reach this function.
pub fn install(
    txn: &mut WriteTxn<'_>,
    event: &Event,
    quad: u64,
    received_at: i64,
) -> Result<Outcome, StoreError> {
    let (id, pubkey) = decode_event_keys(event)?;

    if txn.get(tbl::BY_ID, &id).is_some() {
        return Ok(Outcome::Duplicate);
    }

    let repl_key = event_replaceable_key(event, &pubkey);
    let mut replaced = None;
    if let Some(rkey) = &repl_key {
        if let Some(bytes) = txn.get(tbl::REPLACEABLE, rkey) {
            let loser_quad = u64::from_be_bytes(
                bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| corrupt("replaceable value"))?,
            );
            let loser = get_record(txn, loser_quad)?
                .ok_or_else(|| corrupt("replaceable points at missing event"))?;
            let newer = (loser.event.created_at, &loser.event.id)
                > (event.created_at, &event.id);
            if newer {
                return Ok(Outcome::Shadowed);
            }
            remove_event(txn, loser_quad, &loser.event)?;
            replaced = Some(loser_quad);
        }
    }

    let record = StoredRecord {
        event: event.clone(),
        received_at,
    };
    let value = serde_json::to_vec(&record).map_err(|_| corrupt("encoding primary record"))?;
    txn.put(tbl::PRIMARY, quad_key(quad).to_vec(), value);
    txn.put(tbl::BY_ID, id.to_vec(), quad_key(quad).to_vec());
    txn.put(
        tbl::BY_PUBKEY_KIND,
        pubkey_kind_key(&pubkey, event.kind, event.created_at, quad),
        Vec::new(),
    );
    txn.put(
        tbl::BY_PUBKEY,
        pubkey_key(&pubkey, event.created_at, quad),
        Vec::new(),
    );
    txn.put(
        tbl::BY_KIND,
        kind_key(event.kind, event.created_at, quad),
        Vec::new(),
    );
    txn.put(
        tbl::BY_CREATED,
        created_key(event.created_at, quad),
        Vec::new(),
    );
    for (letter, value) in event.single_letter_tags() {
        txn.put(
            tbl::BY_TAG,
            tag_key(letter, value, event.created_at, quad),
            Vec::new(),
        );
    }
    if let Some(rkey) = repl_key {
        txn.put(tbl::REPLACEABLE, rkey, quad_key(quad).to_vec());
    }

    if event.kind == 5 {
        apply_deletion(txn, event, &pubkey)?;
    }

    Ok(match replaced {
        Some(replaced) => Outcome::Replaced { quad, replaced },
        None => Outcome::Stored { quad },
    })
}

/// Remove an event's primary row and every index row.
pub fn remove_event(txn: &mut WriteTxn<'_>, quad: u64, event: &Event) -> Result<(), StoreError> {
    let (id, pubkey) = decode_event_keys(event)?;
    txn.delete(tbl::PRIMARY, quad_key(quad).to_vec());
    txn.delete(tbl::BY_ID, id.to_vec());
    txn.delete(
        tbl::BY_PUBKEY_KIND,
        pubkey_kind_key(&pubkey, event.kind, event.created_at, quad),
    );
    txn.delete(tbl::BY_PUBKEY, pubkey_key(&pubkey, event.created_at, quad));
    txn.delete(tbl::BY_KIND, kind_key(event.kind, event.created_at, quad));
    txn.delete(tbl::BY_CREATED, created_key(event.created_at, quad));
    for (letter, value) in event.single_letter_tags() {
        txn.delete(tbl::BY_TAG, tag_key(letter, value, event.created_at, quad));
    }
    if let Some(rkey) = event_replaceable_key(event, &pubkey) {
        // Only clear the winner slot if it still points at this event.
        if txn.get(tbl::REPLACEABLE, &rkey).as_deref() == Some(&quad_key(quad)[..]) {
            txn.delete(tbl::REPLACEABLE, rkey);
        }
    }
    Ok(())
}

/// Process a kind-5 deletion: drop every referenced event owned by the
/// same author. The deletion record itself has already been stored.
fn apply_deletion(
    txn: &mut WriteTxn<'_>,
    deletion: &Event,
    author: &[u8; 32],
) -> Result<(), StoreError> {
    for (letter, value) in deletion.single_letter_tags() {
        if letter != b'e' {
            continue;
        }
        let Some(target_id) = crate::event::decode32(value) else {
            continue;
        };
        let Some(target_quad) = lookup_id(txn, &target_id)? else {
            continue;
        };
        let Some(target) = get_record(txn, target_quad)? else {
            continue;
        };
        let target_pubkey = target
            .event
            .pubkey_bytes()
            .map_err(|_| corrupt("stored event pubkey"))?;
        if &target_pubkey == author {
            remove_event(txn, target_quad, &target.event)?;
        }
    }
    Ok(())
}

/// Short-lived holding pen for ephemeral events.
///
/// Ephemeral kinds are never written to the store; they are fanned out
/// live and stay queryable from here until their lifetime passes.
pub struct EphemeralBuffer {
    ttl: Duration,
    inner: Mutex<VecDeque<EphemeralEntry>>,
}

struct EphemeralEntry {
    expires: Instant,
    quad: u64,
    event: Arc<Event>,
}

impl EphemeralBuffer {
    pub fn new(ttl: Duration) -> Self {
        EphemeralBuffer {
            ttl,
            inner: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push(&self, quad: u64, event: Arc<Event>) {
        self.inner.lock().push_back(EphemeralEntry {
            expires: Instant::now() + self.ttl,
            quad,
            event,
        });
    }

    /// Drop expired entries; returns how many were purged.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let before = inner.len();
        while inner.front().map(|e| e.expires <= now).unwrap_or(false) {
            inner.pop_front();
        }
        before - inner.len()
    }

    /// Unexpired entries matching a predicate, oldest first.
    pub fn matching(&self, pred: impl Fn(&Event) -> bool) -> Vec<(u64, Arc<Event>)> {
        let now = Instant::now();
        self.inner
            .lock()
            .iter()
            .filter(|e| e.expires > now && pred(&e.event))
            .map(|e| (e.quad, e.event.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}
