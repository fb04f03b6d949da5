//! Historical scans: per-filter index planning, descending merge, and
//! the timesliced worker pool that serves `REQ` backfills.

use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use lru::LruCache;
use tokio::sync::mpsc;

use crate::conn::{frames, ConnId, ConnectionRegistry, SubId};
use crate::error::{Reject, StoreError};
use crate::event::{decode32, is_param_replaceable, is_replaceable, Event};
use crate::filter::{Filter, FilterGroup};
use crate::monitor::MonitorMsg;
use crate::schema::{
    get_record, index_key_suffix, lookup_id, replaceable_key, tag_prefix, tbl, ts_bytes,
    EphemeralBuffer,
};
use crate::store::{ReadTxn, Store};

/// Prefix expansions beyond this fall back to a broader index.
const MAX_EXPANSION: usize = 4096;

/// Ids remembered for cross-filter de-duplication.
const DEDUP_CAPACITY: usize = 4096;

/// A queued request for an initial historical scan.
pub struct ScanJob {
    pub conn: ConnId,
    pub sub: SubId,
    pub group: FilterGroup,
    pub cancel: Arc<AtomicBool>,
}

enum IndexedState {
    Start,
    After(Vec<u8>),
    Done,
}

/// One cursor walk (or pre-resolved item list) feeding a filter.
enum SubScan {
    /// Descending walk of `prefix + created_at + quad` keys.
    Indexed {
        table: u8,
        prefix: Vec<u8>,
        lo: i64,
        hi: i64,
        state: IndexedState,
        head: Option<(i64, u64)>,
    },
    /// Items resolved at plan time, sorted newest first.
    Fixed {
        items: Vec<(i64, u64)>,
        idx: usize,
        head: Option<(i64, u64)>,
    },
}

impl SubScan {
    fn peek(&mut self, txn: &ReadTxn) -> Result<Option<(i64, u64)>, StoreError> {
        if self.head().is_none() {
            let pulled = self.pull(txn)?;
            self.set_head(pulled);
        }
        Ok(self.head())
    }

    fn head(&self) -> Option<(i64, u64)> {
        match self {
            SubScan::Indexed { head, .. } | SubScan::Fixed { head, .. } => *head,
        }
    }

    fn set_head(&mut self, value: Option<(i64, u64)>) {
        match self {
            SubScan::Indexed { head, .. } | SubScan::Fixed { head, .. } => *head = value,
        }
    }

    fn take(&mut self) -> Option<(i64, u64)> {
        match self {
            SubScan::Indexed { head, .. } | SubScan::Fixed { head, .. } => head.take(),
        }
    }

    fn pull(&mut self, txn: &ReadTxn) -> Result<Option<(i64, u64)>, StoreError> {
        match self {
            SubScan::Fixed { items, idx, .. } => {
                let item = items.get(*idx).copied();
                if item.is_some() {
                    *idx += 1;
                }
                Ok(item)
            }
            SubScan::Indexed {
                table,
                prefix,
                lo,
                hi,
                state,
                ..
            } => {
                let mut cur = txn.cursor(*table);
                let found = match state {
                    IndexedState::Done => None,
                    IndexedState::Start => {
                        let mut probe = prefix.clone();
                        probe.extend_from_slice(&ts_bytes(*hi));
                        probe.extend_from_slice(&[0xff; 8]);
                        cur.seek_back(&probe)
                    }
                    IndexedState::After(prev) => {
                        // The previous key still exists in this snapshot.
                        cur.seek_back(prev);
                        cur.prev()
                    }
                };
                match found {
                    Some((key, _)) if key.starts_with(prefix.as_slice()) => {
                        let (ts, quad) = index_key_suffix(&key)?;
                        if ts < *lo {
                            *state = IndexedState::Done;
                            Ok(None)
                        } else {
                            *state = IndexedState::After(key);
                            Ok(Some((ts, quad)))
                        }
                    }
                    _ => {
                        *state = IndexedState::Done;
                        Ok(None)
                    }
                }
            }
        }
    }
}

struct FilterScan {
    filter: Filter,
    limit: usize,
    emitted: usize,
    subscans: Vec<SubScan>,
}

impl FilterScan {
    fn peek(&mut self, txn: &ReadTxn) -> Result<Option<(i64, u64)>, StoreError> {
        if self.emitted >= self.limit {
            return Ok(None);
        }
        let mut best: Option<(i64, u64)> = None;
        for sub in &mut self.subscans {
            if let Some(head) = sub.peek(txn)? {
                if best.map(|b| head > b).unwrap_or(true) {
                    best = Some(head);
                }
            }
        }
        Ok(best)
    }

    fn pop(&mut self) -> Option<(i64, u64)> {
        let best = self
            .subscans
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.head().map(|h| (h, i)))
            .max();
        best.map(|(_, i)| self.subscans[i].take().unwrap_or_default())
    }
}

/// A resumable, snapshot-pinned historical scan for one subscription.
pub struct Scan {
    txn: ReadTxn,
    watermark: u64,
    filters: Vec<FilterScan>,
    dedup: LruCache<u64, ()>,
    ephemeral: Option<Arc<EphemeralBuffer>>,
    ephemeral_done: bool,
}

impl Scan {
    /// Pin a snapshot and compile the scan plan.
    pub fn new(
        store: &Store,
        group: &FilterGroup,
        ephemeral: Option<Arc<EphemeralBuffer>>,
    ) -> Result<Scan, StoreError> {
        let txn = store.txn_ro();
        let watermark = crate::schema::last_quad(&txn)?;
        let mut filters = Vec::with_capacity(group.0.len());
        for filter in &group.0 {
            let subscans = plan(&txn, filter)?;
            filters.push(FilterScan {
                limit: filter.limit.unwrap_or(usize::MAX),
                emitted: 0,
                filter: filter.clone(),
                subscans,
            });
        }
        Ok(Scan {
            txn,
            watermark,
            filters,
            dedup: LruCache::new(
                NonZeroUsize::new(DEDUP_CAPACITY).unwrap_or(NonZeroUsize::MIN),
            ),
            ephemeral,
            ephemeral_done: false,
        })
    }

    /// Highest quad id the snapshot covers; the monitor hand-off point.
    pub fn watermark(&self) -> u64 {
        self.watermark
    }

    /// Run until the budget is spent or the scan completes. At least
    /// one candidate is examined per call so progress is guaranteed.
    /// Returns `true` once all results have been produced.
    pub fn step(
        &mut self,
        budget: Duration,
        out: &mut Vec<(u64, Arc<Event>)>,
    ) -> Result<bool, StoreError> {
        let start = Instant::now();
        loop {
            let mut best: Option<((i64, u64), usize)> = None;
            for i in 0..self.filters.len() {
                if let Some(head) = self.filters[i].peek(&self.txn)? {
                    if best.map(|(b, _)| head > b).unwrap_or(true) {
                        best = Some((head, i));
                    }
                }
            }
            let Some(((_, quad), i)) = best else {
                self.finish_ephemeral(out);
                return Ok(true);
            };
            self.filters[i].pop();
            if !self.dedup.contains(&quad) {
                if let Some(rec) = get_record(&self.txn, quad)? {
                    if self.filters[i].filter.matches(&rec.event) {
                        self.dedup.put(quad, ());
                        self.filters[i].emitted += 1;
                        out.push((quad, Arc::new(rec.event)));
                    }
                }
            }
            if start.elapsed() >= budget {
                return Ok(false);
            }
        }
    }

    /// Ephemeral kinds live outside the store; append current buffer
    /// matches once the indexed walk is exhausted.
    fn finish_ephemeral(&mut self, out: &mut Vec<(u64, Arc<Event>)>) {
        if self.ephemeral_done {
            return;
        }
        self.ephemeral_done = true;
        let Some(buffer) = &self.ephemeral else {
            return;
        };
        let mut hits: Vec<(u64, Arc<Event>)> = Vec::new();
        for (quad, event) in buffer.matching(|_| true) {
            if self.dedup.contains(&quad) {
                continue;
            }
            let Some(fs) = self
                .filters
                .iter_mut()
                .find(|fs| fs.emitted < fs.limit && fs.filter.matches(&event))
            else {
                continue;
            };
            fs.emitted += 1;
            self.dedup.put(quad, ());
            hits.push((quad, event));
        }
        hits.sort_by_key(|(quad, ev)| std::cmp::Reverse((ev.created_at, *quad)));
        out.extend(hits);
    }

    #[cfg(test)]
    fn planned_tables(&self) -> Vec<Vec<u8>> {
        self.filters
            .iter()
            .map(|fs| {
                fs.subscans
                    .iter()
                    .map(|s| match s {
                        SubScan::Indexed { table, .. } => *table,
                        SubScan::Fixed { .. } => u8::MAX,
                    })
                    .collect()
            })
            .collect()
    }
}

/// Choose the cheapest index for a filter and build its subscans.
///
/// Preference order: by-id, replaceable, by-pubkey-kind, by-tag,
/// by-pubkey, by-kind, by-created-at. Expansion caps make over-broad
/// prefixes fall through to the next (always correct) choice.
fn plan(txn: &ReadTxn, filter: &Filter) -> Result<Vec<SubScan>, StoreError> {
    if let Some(subscans) = ids_plan(txn, filter)? {
        return Ok(subscans);
    }
    if let Some(subscans) = replaceable_plan(txn, filter)? {
        return Ok(subscans);
    }
    let lo = filter.since.unwrap_or(i64::MIN);
    let hi = filter.until.unwrap_or(i64::MAX);
    let indexed = |table: u8, prefix: Vec<u8>| SubScan::Indexed {
        table,
        prefix,
        lo,
        hi,
        state: IndexedState::Start,
        head: None,
    };

    let authors = match &filter.authors {
        Some(authors) => expand_authors(txn, authors)?,
        None => None,
    };
    if let (Some(pubkeys), Some(kinds)) = (&authors, &filter.kinds) {
        let mut subscans = Vec::with_capacity(pubkeys.len() * kinds.len());
        for pk in pubkeys {
            for kind in kinds {
                let mut prefix = pk.to_vec();
                prefix.extend_from_slice(&kind.to_be_bytes());
                subscans.push(indexed(tbl::BY_PUBKEY_KIND, prefix));
            }
        }
        return Ok(subscans);
    }
    if let Some((letter, values)) = filter
        .tags
        .iter()
        .min_by_key(|(_, values)| values.len())
    {
        let subscans = values
            .iter()
            .map(|v| indexed(tbl::BY_TAG, tag_prefix(*letter, v)))
            .collect();
        return Ok(subscans);
    }
    if let Some(pubkeys) = &authors {
        return Ok(pubkeys
            .iter()
            .map(|pk| indexed(tbl::BY_PUBKEY, pk.to_vec()))
            .collect());
    }
    if let Some(kinds) = &filter.kinds {
        return Ok(kinds
            .iter()
            .map(|k| indexed(tbl::BY_KIND, k.to_be_bytes().to_vec()))
            .collect());
    }
    Ok(vec![indexed(tbl::BY_CREATED, Vec::new())])
}

fn ids_plan(txn: &ReadTxn, filter: &Filter) -> Result<Option<Vec<SubScan>>, StoreError> {
    let Some(ids) = &filter.ids else {
        return Ok(None);
    };
    let mut items: Vec<(i64, u64)> = Vec::new();
    for spec in ids {
        if spec.len() == 64 {
            let Some(id) = decode32(spec) else { continue };
            if let Some(quad) = lookup_id(txn, &id)? {
                if let Some(rec) = get_record(txn, quad)? {
                    items.push((rec.event.created_at, quad));
                }
            }
        } else {
            let byte_len = spec.len() / 2 * 2;
            let prefix_bytes = hex::decode(&spec[..byte_len])
                .map_err(|_| StoreError::Corrupt("id prefix".into()))?;
            let mut cur = txn.cursor(tbl::BY_ID);
            let mut found = cur.seek(&prefix_bytes);
            while let Some((key, value)) = found {
                if !key.starts_with(&prefix_bytes) {
                    break;
                }
                if items.len() >= MAX_EXPANSION {
                    return Ok(None); // too broad, fall back
                }
                if hex::encode(&key).starts_with(spec.as_str()) {
                    let quad = u64::from_be_bytes(
                        value
                            .as_slice()
                            .try_into()
                            .map_err(|_| StoreError::Corrupt("by_id value".into()))?,
                    );
                    if let Some(rec) = get_record(txn, quad)? {
                        items.push((rec.event.created_at, quad));
                    }
                }
                found = cur.next();
            }
        }
    }
    items.sort_unstable_by(|a, b| b.cmp(a));
    items.dedup();
    Ok(Some(vec![SubScan::Fixed {
        items,
        idx: 0,
        head: None,
    }]))
}

/// Direct winner-slot lookups when every kind is a replaceable class
/// and authors are full-length.
fn replaceable_plan(txn: &ReadTxn, filter: &Filter) -> Result<Option<Vec<SubScan>>, StoreError> {
    if filter.ids.is_some() {
        return Ok(None);
    }
    let (Some(authors), Some(kinds)) = (&filter.authors, &filter.kinds) else {
        return Ok(None);
    };
    if authors.is_empty() || kinds.is_empty() {
        return Ok(None);
    }
    if authors.iter().any(|a| a.len() != 64) {
        return Ok(None);
    }
    let all_plain = kinds.iter().all(|k| is_replaceable(*k));
    let all_param = kinds.iter().all(|k| is_param_replaceable(*k));
    let d_values = filter.tags.get(&b'd');
    if !(all_plain || (all_param && d_values.is_some())) {
        return Ok(None);
    }

    let mut items: Vec<(i64, u64)> = Vec::new();
    for author in authors {
        let Some(pk) = decode32(author) else { continue };
        for kind in kinds {
            let keys: Vec<Vec<u8>> = if all_plain {
                vec![replaceable_key(&pk, *kind, None)]
            } else {
                d_values
                    .map(|values| {
                        values
                            .iter()
                            .map(|d| replaceable_key(&pk, *kind, Some(d)))
                            .collect()
                    })
                    .unwrap_or_default()
            };
            for key in keys {
                if let Some(bytes) = txn.get(tbl::REPLACEABLE, &key) {
                    let quad = u64::from_be_bytes(
                        bytes
                            .as_slice()
                            .try_into()
                            .map_err(|_| StoreError::Corrupt("replaceable value".into()))?,
                    );
                    if let Some(rec) = get_record(txn, quad)? {
                        items.push((rec.event.created_at, quad));
                    }
                }
            }
        }
    }
    items.sort_unstable_by(|a, b| b.cmp(a));
    items.dedup();
    Ok(Some(vec![SubScan::Fixed {
        items,
        idx: 0,
        head: None,
    }]))
}

/// Resolve author specs to concrete pubkeys, walking the index to
/// enumerate prefix matches. `None` when a prefix is too broad.
fn expand_authors(
    txn: &ReadTxn,
    authors: &[String],
) -> Result<Option<Vec<[u8; 32]>>, StoreError> {
    let mut pubkeys: Vec<[u8; 32]> = Vec::new();
    for author in authors {
        if author.len() == 64 {
            if let Some(pk) = decode32(author) {
                pubkeys.push(pk);
            }
            continue;
        }
        let byte_len = author.len() / 2 * 2;
        let prefix_bytes = hex::decode(&author[..byte_len])
            .map_err(|_| StoreError::Corrupt("author prefix".into()))?;
        let mut cur = txn.cursor(tbl::BY_PUBKEY);
        let mut found = cur.seek(&prefix_bytes);
        while let Some((key, _)) = found {
            if key.len() < 32 || !key.starts_with(&prefix_bytes) {
                break;
            }
            if pubkeys.len() >= MAX_EXPANSION {
                return Ok(None);
            }
            let pk: [u8; 32] = key[..32]
                .try_into()
                .map_err(|_| StoreError::Corrupt("pubkey index key".into()))?;
            if hex::encode(pk).starts_with(author.as_str()) {
                pubkeys.push(pk);
            }
            // Hop to the next distinct pubkey.
            let mut next = pk;
            if !increment(&mut next) {
                break;
            }
            found = cur.seek(&next);
        }
    }
    pubkeys.sort_unstable();
    pubkeys.dedup();
    Ok(Some(pubkeys))
}

fn increment(bytes: &mut [u8; 32]) -> bool {
    for b in bytes.iter_mut().rev() {
        let (v, overflow) = b.overflowing_add(1);
        *b = v;
        if !overflow {
            return true;
        }
    }
    false
}

/// Gather `(created_at, id)` items matching a filter, for negentropy
/// reconciliation. Yields to the runtime between timeslices.
pub async fn collect_sync_items(
    store: Store,
    mut filter: Filter,
    timeslice: Duration,
    max: usize,
) -> Result<Vec<(u64, [u8; 32])>, Reject> {
    filter.limit = None;
    let group = FilterGroup(vec![filter]);
    let mut scan =
        Scan::new(&store, &group, None).map_err(|e| Reject::Error(e.to_string()))?;
    let mut items: Vec<(u64, [u8; 32])> = Vec::new();
    let mut out = Vec::new();
    loop {
        out.clear();
        let done = scan
            .step(timeslice, &mut out)
            .map_err(|e| Reject::Error(e.to_string()))?;
        for (_, event) in &out {
            if items.len() >= max {
                return Err(Reject::invalid("too many events for sync session"));
            }
            let id = event
                .id_bytes()
                .map_err(|_| Reject::Error("stored event id".into()))?;
            items.push((event.created_at.max(0) as u64, id));
        }
        if done {
            break;
        }
        tokio::task::yield_now().await;
    }
    items.sort_unstable();
    Ok(items)
}

/// One worker of the scan pool: round-robins timeslices across its
/// pending scans so no subscription starves another.
pub async fn run_req_worker(
    mut rx: mpsc::Receiver<ScanJob>,
    store: Store,
    registry: Arc<ConnectionRegistry>,
    monitors: Vec<mpsc::Sender<MonitorMsg>>,
    ephemeral: Arc<EphemeralBuffer>,
    timeslice: Duration,
) {
    let mut pending: VecDeque<(ScanJob, Scan)> = VecDeque::new();
    loop {
        if pending.is_empty() {
            match rx.recv().await {
                Some(job) => admit(job, &store, &registry, &ephemeral, &mut pending),
                None => break,
            }
        }
        while let Ok(job) = rx.try_recv() {
            admit(job, &store, &registry, &ephemeral, &mut pending);
        }
        let Some((job, mut scan)) = pending.pop_front() else {
            continue;
        };
        if job.cancel.load(Ordering::Relaxed) {
            continue;
        }
        let mut out = Vec::new();
        match scan.step(timeslice, &mut out) {
            Ok(done) => {
                let mut alive = true;
                for (_, event) in &out {
                    if !registry.deliver(job.conn, frames::event(&job.sub, event)) {
                        alive = false;
                        break;
                    }
                }
                if !alive {
                    continue;
                }
                if done {
                    registry.deliver(job.conn, frames::eose(&job.sub));
                    let monitor = &monitors[(job.conn as usize) % monitors.len()];
                    let _ = monitor
                        .send(MonitorMsg::Activate {
                            conn: job.conn,
                            sub: job.sub,
                            group: job.group,
                            latest_quad: scan.watermark(),
                            cancel: job.cancel,
                        })
                        .await;
                } else {
                    pending.push_back((job, scan));
                }
            }
            Err(e) => {
                tracing::error!(conn = job.conn, sub = %job.sub, error = %e, "scan failed");
                registry.deliver(job.conn, frames::notice(&format!("error: scan failed: {e}")));
                registry.remove_sub(job.conn, &job.sub);
            }
        }
        tokio::task::yield_now().await;
    }
}

fn admit(
    job: ScanJob,
    store: &Store,
    registry: &ConnectionRegistry,
    ephemeral: &Arc<EphemeralBuffer>,
    pending: &mut VecDeque<(ScanJob, Scan)>,
) {
    if job.cancel.load(Ordering::Relaxed) {
        return;
    }
    match Scan::new(store, &job.group, Some(ephemeral.clone())) {
        Ok(scan) => pending.push_back((job, scan)),
        Err(e) => {
            tracing::error!(conn = job.conn, error = %e, "scan setup failed");
            registry.deliver(job.conn, frames::notice(&format!("error: scan failed: {e}")));
            registry.remove_sub(job.conn, &job.sub);
        }
    }
}
