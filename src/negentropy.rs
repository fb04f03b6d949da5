//! Range-based set reconciliation over sorted `(timestamp, id)` records.
//!
//! Two peers holding overlapping event sets exchange a tree of range
//! fingerprints; ranges that disagree are split until small enough to
//! exchange literal id lists, yielding the symmetric difference with
//! sublinear bandwidth. The wire format is a protocol-version byte
//! followed by `(upper bound, mode, payload)` ranges, with timestamps
//! delta-encoded and bound ids truncated to the shortest disambiguating
//! prefix.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::conn::{frames, ConnId, ConnectionRegistry, SubId};
use crate::filter::Filter;
use crate::query::collect_sync_items;
use crate::store::Store;

pub const PROTOCOL_VERSION: u8 = 0x61;
const ID_SIZE: usize = 32;
const FINGERPRINT_SIZE: usize = 16;
/// Fan-out when a fingerprint mismatch splits a range.
const BUCKETS: usize = 16;
/// Ranges at or below this size exchange literal id lists.
const ID_LIST_THRESHOLD: usize = BUCKETS * 2;

const MODE_SKIP: u64 = 0;
const MODE_FINGERPRINT: u64 = 1;
const MODE_ID_LIST: u64 = 2;

#[derive(Debug, Error, PartialEq)]
pub enum NegentropyError {
    #[error("unsupported negentropy protocol version")]
    UnsupportedVersion,
    #[error("message truncated")]
    Truncated,
    #[error("unexpected mode {0}")]
    UnexpectedMode(u64),
    #[error("invalid bound id prefix")]
    InvalidBound,
    #[error("items are not sorted")]
    Unsorted,
}

/// One reconciliation record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Item {
    pub timestamp: u64,
    pub id: [u8; ID_SIZE],
}

/// A range boundary: a timestamp and a disambiguating id prefix.
#[derive(Debug, Clone, PartialEq)]
struct Bound {
    timestamp: u64,
    id_prefix: Vec<u8>,
}

impl Bound {
    fn infinity() -> Bound {
        Bound {
            timestamp: u64::MAX,
            id_prefix: Vec::new(),
        }
    }

    /// Does an item sort strictly below this bound? Comparing against
    /// the raw prefix matches zero-padded semantics because a full id
    /// always sorts at or above its own prefix.
    fn covers(&self, item: &Item) -> bool {
        match item.timestamp.cmp(&self.timestamp) {
            std::cmp::Ordering::Less => true,
            std::cmp::Ordering::Greater => false,
            std::cmp::Ordering::Equal => item.id.as_slice() < self.id_prefix.as_slice(),
        }
    }
}

/// Shortest bound separating `prev` from `curr` (`prev < bound <= curr`).
fn minimal_bound(prev: &Item, curr: &Item) -> Bound {
    if curr.timestamp != prev.timestamp {
        return Bound {
            timestamp: curr.timestamp,
            id_prefix: Vec::new(),
        };
    }
    let shared = prev
        .id
        .iter()
        .zip(curr.id.iter())
        .take_while(|(a, b)| a == b)
        .count();
    Bound {
        timestamp: curr.timestamp,
        id_prefix: curr.id[..=shared.min(ID_SIZE - 1)].to_vec(),
    }
}

/// Sorted, deduplicated record list for one reconciliation session.
#[derive(Debug, Clone, Default)]
pub struct NegentropyStorage {
    items: Vec<Item>,
}

impl NegentropyStorage {
    pub fn from_items(mut items: Vec<Item>) -> NegentropyStorage {
        items.sort_unstable();
        items.dedup();
        NegentropyStorage { items }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// First index at or after `from` whose item is not below `bound`.
    fn upper_bound(&self, from: usize, bound: &Bound) -> usize {
        from + self.items[from..].partition_point(|item| bound.covers(item))
    }

    fn fingerprint(&self, lower: usize, upper: usize) -> [u8; FINGERPRINT_SIZE] {
        let mut accum = Accumulator::default();
        for item in &self.items[lower..upper] {
            accum.add(&item.id);
        }
        accum.fingerprint(upper - lower)
    }
}

/// Fixed-width additive accumulator: 256-bit little-endian sum of ids.
/// Addition commutes and associates, so adjacent range accumulators
/// concatenate by adding.
#[derive(Default, Clone)]
struct Accumulator {
    buf: [u8; ID_SIZE],
}

impl Accumulator {
    fn add(&mut self, id: &[u8; ID_SIZE]) {
        let mut carry = 0u16;
        for (a, b) in self.buf.iter_mut().zip(id.iter()) {
            let sum = *a as u16 + *b as u16 + carry;
            *a = sum as u8;
            carry = sum >> 8;
        }
    }

    #[cfg(test)]
    fn combine(&mut self, other: &Accumulator) {
        let mut carry = 0u16;
        for (a, b) in self.buf.iter_mut().zip(other.buf.iter()) {
            let sum = *a as u16 + *b as u16 + carry;
            *a = sum as u8;
            carry = sum >> 8;
        }
    }

    /// Hash in the element count for cryptographic domain separation.
    fn fingerprint(&self, count: usize) -> [u8; FINGERPRINT_SIZE] {
        let mut hasher = Sha256::new();
        hasher.update(self.buf);
        hasher.update(encode_varint(count as u64));
        let digest = hasher.finalize();
        let mut out = [0u8; FINGERPRINT_SIZE];
        out.copy_from_slice(&digest[..FINGERPRINT_SIZE]);
        out
    }
}

fn encode_varint(mut n: u64) -> Vec<u8> {
    if n == 0 {
        return vec![0];
    }
    let mut out = Vec::new();
    while n != 0 {
        out.push((n & 0x7f) as u8);
        n >>= 7;
    }
    out.reverse();
    for i in 0..out.len() - 1 {
        out[i] |= 0x80;
    }
    out
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
    last_timestamp: u64,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Reader<'a> {
        Reader {
            data,
            pos: 0,
            last_timestamp: 0,
        }
    }

    fn done(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn byte(&mut self) -> Result<u8, NegentropyError> {
        let b = *self
            .data
            .get(self.pos)
            .ok_or(NegentropyError::Truncated)?;
        self.pos += 1;
        Ok(b)
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8], NegentropyError> {
        if self.pos + n > self.data.len() {
            return Err(NegentropyError::Truncated);
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn varint(&mut self) -> Result<u64, NegentropyError> {
        let mut out = 0u64;
        loop {
            let b = self.byte()?;
            out = (out << 7) | (b & 0x7f) as u64;
            if b & 0x80 == 0 {
                return Ok(out);
            }
        }
    }

    fn bound(&mut self) -> Result<Bound, NegentropyError> {
        let encoded = self.varint()?;
        let timestamp = if encoded == 0 {
            self.last_timestamp = u64::MAX;
            u64::MAX
        } else {
            let t = self.last_timestamp.saturating_add(encoded - 1);
            self.last_timestamp = t;
            t
        };
        let len = self.varint()? as usize;
        if len > ID_SIZE {
            return Err(NegentropyError::InvalidBound);
        }
        let id_prefix = self.bytes(len)?.to_vec();
        Ok(Bound {
            timestamp,
            id_prefix,
        })
    }
}

#[derive(Default)]
struct MsgWriter {
    out: Vec<u8>,
    last_timestamp: u64,
}

impl MsgWriter {
    fn new() -> MsgWriter {
        MsgWriter {
            out: vec![PROTOCOL_VERSION],
            last_timestamp: 0,
        }
    }

    fn bound(&mut self, bound: &Bound) {
        if bound.timestamp == u64::MAX {
            self.out.extend_from_slice(&encode_varint(0));
            self.last_timestamp = u64::MAX;
        } else {
            let delta = bound.timestamp.saturating_sub(self.last_timestamp) + 1;
            self.last_timestamp = bound.timestamp;
            self.out.extend_from_slice(&encode_varint(delta));
        }
        self.out
            .extend_from_slice(&encode_varint(bound.id_prefix.len() as u64));
        self.out.extend_from_slice(&bound.id_prefix);
    }

    fn varint(&mut self, n: u64) {
        self.out.extend_from_slice(&encode_varint(n));
    }

    fn raw(&mut self, bytes: &[u8]) {
        self.out.extend_from_slice(bytes);
    }

    fn is_bare(&self) -> bool {
        self.out.len() == 1
    }

    fn finish(self) -> Vec<u8> {
        self.out
    }
}

/// One side of a reconciliation session.
pub struct Negentropy {
    storage: NegentropyStorage,
    is_initiator: bool,
}

impl Negentropy {
    pub fn initiator(storage: NegentropyStorage) -> Negentropy {
        Negentropy {
            storage,
            is_initiator: true,
        }
    }

    pub fn responder(storage: NegentropyStorage) -> Negentropy {
        Negentropy {
            storage,
            is_initiator: false,
        }
    }

    /// First message: the full range `[0, infinity)`.
    pub fn initiate(&mut self) -> Vec<u8> {
        let mut writer = MsgWriter::new();
        self.split_range(0, self.storage.len(), &Bound::infinity(), &mut writer);
        writer.finish()
    }

    /// Responder step: always produces a reply.
    pub fn reconcile(&mut self, msg: &[u8]) -> Result<Vec<u8>, NegentropyError> {
        let mut have = Vec::new();
        let mut need = Vec::new();
        self.reconcile_aux(msg, &mut have, &mut need)
            .map(MsgWriter::finish)
    }

    /// Initiator step: accumulates the symmetric difference and returns
    /// `None` once both sides agree on every range.
    pub fn reconcile_with_ids(
        &mut self,
        msg: &[u8],
        have: &mut Vec<[u8; ID_SIZE]>,
        need: &mut Vec<[u8; ID_SIZE]>,
    ) -> Result<Option<Vec<u8>>, NegentropyError> {
        let writer = self.reconcile_aux(msg, have, need)?;
        if writer.is_bare() {
            return Ok(None);
        }
        Ok(Some(writer.finish()))
    }

    fn reconcile_aux(
        &mut self,
        msg: &[u8],
        have: &mut Vec<[u8; ID_SIZE]>,
        need: &mut Vec<[u8; ID_SIZE]>,
    ) -> Result<MsgWriter, NegentropyError> {
        let mut reader = Reader::new(msg);
        if reader.byte()? != PROTOCOL_VERSION {
            return Err(NegentropyError::UnsupportedVersion);
        }
        let mut writer = MsgWriter::new();
        let mut prev_index = 0usize;
        let mut prev_bound = Bound {
            timestamp: 0,
            id_prefix: Vec::new(),
        };
        let mut skip = false;

        while !reader.done() {
            let curr_bound = reader.bound()?;
            let mode = reader.varint()?;
            let lower = prev_index;
            let upper = self.storage.upper_bound(prev_index, &curr_bound);

            match mode {
                MODE_SKIP => {
                    skip = true;
                }
                MODE_FINGERPRINT => {
                    let theirs: [u8; FINGERPRINT_SIZE] = reader
                        .bytes(FINGERPRINT_SIZE)?
                        .try_into()
                        .map_err(|_| NegentropyError::Truncated)?;
                    let ours = self.storage.fingerprint(lower, upper);
                    if theirs == ours {
                        skip = true;
                    } else {
                        flush_skip(&mut skip, &prev_bound, &mut writer);
                        self.split_range(lower, upper, &curr_bound, &mut writer);
                    }
                }
                MODE_ID_LIST => {
                    let count = reader.varint()? as usize;
                    let mut theirs: HashSet<[u8; ID_SIZE]> = HashSet::with_capacity(count);
                    for _ in 0..count {
                        let id: [u8; ID_SIZE] = reader
                            .bytes(ID_SIZE)?
                            .try_into()
                            .map_err(|_| NegentropyError::Truncated)?;
                        theirs.insert(id);
                    }
                    for item in &self.storage.items[lower..upper] {
                        if !theirs.remove(&item.id) && self.is_initiator {
                            have.push(item.id);
                        }
                    }
                    if self.is_initiator {
                        need.extend(theirs);
                        skip = true;
                    } else {
                        flush_skip(&mut skip, &prev_bound, &mut writer);
                        writer.bound(&curr_bound);
                        writer.varint(MODE_ID_LIST);
                        writer.varint((upper - lower) as u64);
                        for item in &self.storage.items[lower..upper] {
                            writer.raw(&item.id);
                        }
                    }
                }
                other => return Err(NegentropyError::UnexpectedMode(other)),
            }
            prev_index = upper;
            prev_bound = curr_bound;
        }
        Ok(writer)
    }

    /// Emit a disagreeing range: literal ids when small, sixteen
    /// fingerprinted buckets otherwise.
    fn split_range(&self, lower: usize, upper: usize, upper_bound: &Bound, writer: &mut MsgWriter) {
        let num_elems = upper - lower;
        if num_elems <= ID_LIST_THRESHOLD {
            writer.bound(upper_bound);
            writer.varint(MODE_ID_LIST);
            writer.varint(num_elems as u64);
            for item in &self.storage.items[lower..upper] {
                writer.raw(&item.id);
            }
            return;
        }
        let per_bucket = num_elems / BUCKETS;
        let extra = num_elems % BUCKETS;
        let mut curr = lower;
        for i in 0..BUCKETS {
            let bucket_size = per_bucket + usize::from(i < extra);
            let fingerprint = self.storage.fingerprint(curr, curr + bucket_size);
            curr += bucket_size;
            let bound = if curr == upper {
                upper_bound.clone()
            } else {
                minimal_bound(&self.storage.items[curr - 1], &self.storage.items[curr])
            };
            writer.bound(&bound);
            writer.varint(MODE_FINGERPRINT);
            writer.raw(&fingerprint);
        }
    }
}

fn flush_skip(skip: &mut bool, prev_bound: &Bound, writer: &mut MsgWriter) {
    if *skip {
        *skip = false;
        writer.bound(prev_bound);
        writer.varint(MODE_SKIP);
    }
}

/// Work items for the negentropy worker pool.
pub enum NegJob {
    Open {
        conn: ConnId,
        sub: SubId,
        filter: Filter,
        initial_hex: String,
    },
    Msg {
        conn: ConnId,
        sub: SubId,
        payload_hex: String,
    },
    Close {
        conn: ConnId,
        sub: SubId,
    },
    Disconnect {
        conn: ConnId,
    },
}

/// One worker of the reconciliation pool; sessions are partitioned by
/// connection so each lives on exactly one worker.
pub async fn run_neg_worker(
    mut rx: mpsc::Receiver<NegJob>,
    store: Store,
    registry: Arc<ConnectionRegistry>,
    max_sync_events: usize,
    timeslice: Duration,
) {
    let mut sessions: HashMap<(ConnId, SubId), Negentropy> = HashMap::new();
    while let Some(job) = rx.recv().await {
        match job {
            NegJob::Open {
                conn,
                sub,
                filter,
                initial_hex,
            } => {
                let items = match collect_sync_items(
                    store.clone(),
                    filter,
                    timeslice,
                    max_sync_events,
                )
                .await
                {
                    Ok(items) => items,
                    Err(e) => {
                        registry.deliver(conn, frames::neg_err(&sub, &e.to_string()));
                        continue;
                    }
                };
                let storage = NegentropyStorage::from_items(
                    items
                        .into_iter()
                        .map(|(timestamp, id)| Item { timestamp, id })
                        .collect(),
                );
                let mut session = Negentropy::responder(storage);
                match decode_payload(&initial_hex).and_then(|msg| session.reconcile(&msg)) {
                    Ok(reply) => {
                        sessions.insert((conn, sub.clone()), session);
                        registry.deliver(conn, frames::neg_msg(&sub, &hex::encode(reply)));
                    }
                    Err(e) => {
                        registry.deliver(conn, frames::neg_err(&sub, &e.to_string()));
                    }
                }
            }
            NegJob::Msg {
                conn,
                sub,
                payload_hex,
            } => {
                let Some(session) = sessions.get_mut(&(conn, sub.clone())) else {
                    registry.deliver(conn, frames::neg_err(&sub, "no open session"));
                    continue;
                };
                match decode_payload(&payload_hex).and_then(|msg| session.reconcile(&msg)) {
                    Ok(reply) => {
                        registry.deliver(conn, frames::neg_msg(&sub, &hex::encode(reply)));
                    }
                    Err(e) => {
                        sessions.remove(&(conn, sub.clone()));
                        registry.deliver(conn, frames::neg_err(&sub, &e.to_string()));
                    }
                }
            }
            NegJob::Close { conn, sub } => {
                sessions.remove(&(conn, sub));
            }
            NegJob::Disconnect { conn } => {
                sessions.retain(|(c, _), _| *c != conn);
            }
        }
    }
}

fn decode_payload(payload_hex: &str) -> Result<Vec<u8>, NegentropyError> {
    hex::decode(payload_hex).map_err(|_| NegentropyError::Truncated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn item(timestamp: u64, seed: u8) -> Item {
        Item {
            timestamp,
            id: [seed; ID_SIZE],
        }
    }

    fn random_item(rng: &mut StdRng) -> Item {
        let mut id = [0u8; ID_SIZE];
        rng.fill(&mut id);
        Item {
            timestamp: rng.gen_range(0..1_000_000),
            id,
        }
    }

    /// Drive both sides to completion; returns (have, need) as seen by
    /// the initiator.
    fn run_session(
        a: Vec<Item>,
        b: Vec<Item>,
    ) -> (Vec<[u8; ID_SIZE]>, Vec<[u8; ID_SIZE]>, usize) {
        let mut initiator = Negentropy::initiator(NegentropyStorage::from_items(a));
        let mut responder = Negentropy::responder(NegentropyStorage::from_items(b));
        let mut have = Vec::new();
        let mut need = Vec::new();
        let mut msg = initiator.initiate();
        let mut round_trips = 0;
        loop {
            round_trips += 1;
            assert!(round_trips < 64, "reconciliation did not converge");
            let reply = responder.reconcile(&msg).unwrap();
            match initiator
                .reconcile_with_ids(&reply, &mut have, &mut need)
                .unwrap()
            {
                Some(next) => msg = next,
                None => break,
            }
        }
        have.sort_unstable();
        need.sort_unstable();
        (have, need, round_trips)
    }

    #[test]
    fn varint_roundtrip() {
        for n in [0u64, 1, 127, 128, 255, 16384, u32::MAX as u64, u64::MAX] {
            let encoded = encode_varint(n);
            let mut reader = Reader::new(&encoded);
            assert_eq!(reader.varint().unwrap(), n);
            assert!(reader.done());
        }
    }

    #[test]
    fn bound_roundtrip_with_delta_timestamps() {
        let bounds = vec![
            Bound {
                timestamp: 100,
                id_prefix: vec![],
            },
            Bound {
                timestamp: 100,
                id_prefix: vec![0xab, 0xcd],
            },
            Bound {
                timestamp: 5000,
                id_prefix: vec![0x01],
            },
            Bound::infinity(),
        ];
        let mut writer = MsgWriter::new();
        for b in &bounds {
            writer.bound(b);
        }
        let encoded = writer.finish();
        let mut reader = Reader::new(&encoded);
        assert_eq!(reader.byte().unwrap(), PROTOCOL_VERSION);
        for b in &bounds {
            assert_eq!(&reader.bound().unwrap(), b);
        }
        assert!(reader.done());
    }

    #[test]
    fn fingerprint_accumulators_concatenate() {
        let items: Vec<Item> = (0..10u8).map(|i| item(i as u64, i)).collect();
        let storage = NegentropyStorage::from_items(items.clone());
        let whole = storage.fingerprint(0, 10);

        let mut left = Accumulator::default();
        for it in &items[..4] {
            left.add(&it.id);
        }
        let mut right = Accumulator::default();
        for it in &items[4..] {
            right.add(&it.id);
        }
        left.combine(&right);
        assert_eq!(left.fingerprint(10), whole);
    }

    #[test]
    fn identical_sets_converge_immediately() {
        let items: Vec<Item> = (0..100u8).map(|i| item(i as u64 * 7, i)).collect();
        let (have, need, round_trips) = run_session(items.clone(), items);
        assert!(have.is_empty());
        assert!(need.is_empty());
        assert_eq!(round_trips, 1);
    }

    #[test]
    fn empty_versus_full_yields_all_needs() {
        let items: Vec<Item> = (0..40u8).map(|i| item(i as u64, i)).collect();
        let (have, need, _) = run_session(Vec::new(), items.clone());
        assert!(have.is_empty());
        assert_eq!(need.len(), items.len());

        let (have, need, _) = run_session(items.clone(), Vec::new());
        assert_eq!(have.len(), items.len());
        assert!(need.is_empty());
    }

    #[test]
    fn randomized_sets_converge_on_symmetric_difference() {
        let mut rng = StdRng::seed_from_u64(7);
        let shared: Vec<Item> = (0..800).map(|_| random_item(&mut rng)).collect();
        let only_a: Vec<Item> = (0..37).map(|_| random_item(&mut rng)).collect();
        let only_b: Vec<Item> = (0..53).map(|_| random_item(&mut rng)).collect();

        let mut a = shared.clone();
        a.extend(only_a.iter().copied());
        let mut b = shared;
        b.extend(only_b.iter().copied());

        let (have, need, round_trips) = run_session(a, b);
        let mut expect_have: Vec<[u8; ID_SIZE]> = only_a.iter().map(|i| i.id).collect();
        expect_have.sort_unstable();
        let mut expect_need: Vec<[u8; ID_SIZE]> = only_b.iter().map(|i| i.id).collect();
        expect_need.sort_unstable();
        assert_eq!(have, expect_have);
        assert_eq!(need, expect_need);
        // Fingerprint splitting keeps the exchange logarithmic.
        assert!(round_trips <= 6, "took {round_trips} round trips");
    }

    #[test]
    fn duplicate_timestamps_are_separated_by_id_prefix_bounds() {
        let mut items = Vec::new();
        for i in 0..200u8 {
            items.push(Item {
                timestamp: 42,
                id: [i; ID_SIZE],
            });
        }
        let missing = items.split_off(150);
        let mut full = items.clone();
        full.extend(missing.iter().copied());
        let (have, need, _) = run_session(items, full);
        assert!(have.is_empty());
        assert_eq!(need.len(), missing.len());
    }

    #[test]
    fn version_mismatch_is_rejected() {
        let mut session = Negentropy::responder(NegentropyStorage::default());
        assert_eq!(
            session.reconcile(&[0x60]).unwrap_err(),
            NegentropyError::UnsupportedVersion
        );
        assert_eq!(
            session.reconcile(&[]).unwrap_err(),
            NegentropyError::Truncated
        );
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let items: Vec<Item> = (0..100u8).map(|i| item(i as u64, i)).collect();
        let mut initiator = Negentropy::initiator(NegentropyStorage::from_items(items));
        let msg = initiate_truncated(&mut initiator);
        let mut responder = Negentropy::responder(NegentropyStorage::default());
        assert_eq!(
            responder.reconcile(&msg).unwrap_err(),
            NegentropyError::Truncated
        );
    }

    fn initiate_truncated(initiator: &mut Negentropy) -> Vec<u8> {
        let mut msg = initiator.initiate();
        msg.truncate(msg.len() - 3);
        msg
    }
}
