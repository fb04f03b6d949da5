//! Transactional ordered key-value store.
//!
//! Single-writer, many-readers engine: one write transaction at a time,
//! snapshot-isolated read transactions that never block the writer, and
//! prefix-ordered cursors. Versions live in one ordered tree under
//! internal keys `(table, user_key, !seq)` so the newest version of a
//! key sorts first; deletes are tombstones. Every commit appends one
//! fsynced record to a write-ahead log which is replayed on open.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::error::StoreError;

const WAL_FILE: &str = "store.wal";

/// Fixed per-entry overhead charged against the byte budget.
const ENTRY_OVERHEAD: u64 = 16;

/// Internal version key. Derived ordering is `(table, key, rseq)`;
/// `rseq = !seq` puts the newest version of a user key first.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct IKey {
    table: u8,
    key: Vec<u8>,
    rseq: u64,
}

impl IKey {
    fn new(table: u8, key: Vec<u8>, seq: u64) -> Self {
        IKey {
            table,
            key,
            rseq: !seq,
        }
    }

    fn seq(&self) -> u64 {
        !self.rseq
    }
}

type Version = Option<Arc<[u8]>>;

struct State {
    map: BTreeMap<IKey, Version>,
    committed_seq: u64,
    used_bytes: u64,
}

/// Tuning knobs for a store instance.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Total byte budget; commits that would exceed it fail fatally.
    pub map_bytes: u64,
}

impl Default for StoreOptions {
    fn default() -> Self {
        StoreOptions { map_bytes: 1 << 30 }
    }
}

struct Inner {
    state: RwLock<State>,
    snapshots: Mutex<BTreeMap<u64, usize>>,
    wal: Mutex<File>,
    write_gate: Mutex<()>,
    opts: StoreOptions,
    dir: PathBuf,
}

/// Handle to an open store. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    inner: Arc<Inner>,
}

impl Store {
    /// Open (or create) a store rooted at `dir`, replaying its log.
    pub fn open(dir: &Path, opts: StoreOptions) -> Result<Store, StoreError> {
        std::fs::create_dir_all(dir)?;
        let wal_path = dir.join(WAL_FILE);
        let mut wal = OpenOptions::new()
            .read(true)
            .create(true)
            .append(true)
            .open(&wal_path)?;

        let (map, committed_seq, good_len) = replay(&mut wal)?;
        let actual_len = wal.metadata()?.len();
        if good_len < actual_len {
            tracing::warn!(
                dropped = actual_len - good_len,
                "truncating torn tail of write-ahead log"
            );
            wal.set_len(good_len)?;
        }
        let used_bytes = map
            .iter()
            .map(|(k, v)| entry_cost(&k.key, v.as_deref()))
            .sum();

        Ok(Store {
            inner: Arc::new(Inner {
                state: RwLock::new(State {
                    map,
                    committed_seq,
                    used_bytes,
                }),
                snapshots: Mutex::new(BTreeMap::new()),
                wal: Mutex::new(wal),
                write_gate: Mutex::new(()),
                opts,
                dir: dir.to_path_buf(),
            }),
        })
    }

    /// Open a snapshot-isolated read transaction.
    pub fn txn_ro(&self) -> ReadTxn {
        // Register while holding the state lock so a concurrent commit
        // cannot collect this snapshot's versions first.
        let state = self.inner.state.read();
        let seq = state.committed_seq;
        *self.inner.snapshots.lock().entry(seq).or_insert(0) += 1;
        drop(state);
        ReadTxn {
            inner: self.inner.clone(),
            seq,
        }
    }

    /// Open the write transaction. Errors if one is already open.
    pub fn txn_rw(&self) -> Result<WriteTxn<'_>, StoreError> {
        let gate = self
            .inner
            .write_gate
            .try_lock()
            .ok_or(StoreError::WriteBusy)?;
        Ok(WriteTxn {
            store: self,
            _gate: gate,
            staged: BTreeMap::new(),
        })
    }

    /// Sequence number of the latest commit.
    pub fn committed_seq(&self) -> u64 {
        self.inner.state.read().committed_seq
    }

    /// Approximate live bytes currently charged against the budget.
    pub fn used_bytes(&self) -> u64 {
        self.inner.state.read().used_bytes
    }

    /// Rewrite the log as a single record holding only live data.
    pub fn compact(&self) -> Result<(), StoreError> {
        let _gate = self
            .inner
            .write_gate
            .try_lock()
            .ok_or(StoreError::WriteBusy)?;
        let mut wal = self.inner.wal.lock();
        let state = self.inner.state.read();

        let mut entries: Vec<(u8, Vec<u8>, Option<Vec<u8>>)> = Vec::new();
        let mut last_key: Option<(u8, Vec<u8>)> = None;
        for (ik, version) in state.map.iter() {
            let key_id = (ik.table, ik.key.clone());
            if last_key.as_ref() == Some(&key_id) {
                continue; // only the newest version survives compaction
            }
            last_key = Some(key_id);
            if let Some(v) = version {
                entries.push((ik.table, ik.key.clone(), Some(v.to_vec())));
            }
        }

        let record = encode_record(state.committed_seq, &entries);
        let tmp = tempfile::NamedTempFile::new_in(&self.inner.dir)?;
        let mut tmp_file = tmp.as_file();
        tmp_file.write_all(&record)?;
        tmp_file.sync_data()?;
        let wal_path = self.inner.dir.join(WAL_FILE);
        tmp.persist(&wal_path)
            .map_err(|e| StoreError::Io(e.error))?;
        *wal = OpenOptions::new().read(true).append(true).open(&wal_path)?;
        Ok(())
    }

    fn min_live_snapshot(&self) -> Option<u64> {
        self.inner.snapshots.lock().keys().next().copied()
    }
}

/// A snapshot-isolated read transaction.
pub struct ReadTxn {
    inner: Arc<Inner>,
    seq: u64,
}

impl ReadTxn {
    /// Point lookup at the snapshot.
    pub fn get(&self, table: u8, key: &[u8]) -> Option<Vec<u8>> {
        let state = self.inner.state.read();
        visible_version(&state.map, table, key, self.seq).map(|v| v.to_vec())
    }

    /// Open a cursor over one table, bound to this snapshot.
    pub fn cursor(&self, table: u8) -> Cursor<'_> {
        Cursor {
            txn: self,
            table,
            pos: None,
        }
    }
}

impl Drop for ReadTxn {
    fn drop(&mut self) {
        let mut snaps = self.inner.snapshots.lock();
        if let Some(count) = snaps.get_mut(&self.seq) {
            *count -= 1;
            if *count == 0 {
                snaps.remove(&self.seq);
            }
        }
    }
}

/// Ordered iteration over the visible keys of one table.
pub struct Cursor<'t> {
    txn: &'t ReadTxn,
    table: u8,
    pos: Option<Vec<u8>>,
}

impl Cursor<'_> {
    /// Position at the first visible key `>= from` and return it.
    pub fn seek(&mut self, from: &[u8]) -> Option<(Vec<u8>, Vec<u8>)> {
        let start = Bound::Included(IKey {
            table: self.table,
            key: from.to_vec(),
            rseq: 0,
        });
        self.walk_forward(start)
    }

    /// Position at the last visible key `<= from` and return it.
    pub fn seek_back(&mut self, from: &[u8]) -> Option<(Vec<u8>, Vec<u8>)> {
        let end = Bound::Included(IKey {
            table: self.table,
            key: from.to_vec(),
            rseq: u64::MAX,
        });
        self.walk_backward(end)
    }

    /// Advance to the next visible key.
    pub fn next(&mut self) -> Option<(Vec<u8>, Vec<u8>)> {
        let pos = self.pos.clone()?;
        let start = Bound::Excluded(IKey {
            table: self.table,
            key: pos,
            rseq: u64::MAX,
        });
        self.walk_forward(start)
    }

    /// Step back to the previous visible key.
    pub fn prev(&mut self) -> Option<(Vec<u8>, Vec<u8>)> {
        let pos = self.pos.clone()?;
        let end = Bound::Excluded(IKey {
            table: self.table,
            key: pos,
            rseq: 0,
        });
        self.walk_backward(end)
    }

    fn walk_forward(&mut self, start: Bound<IKey>) -> Option<(Vec<u8>, Vec<u8>)> {
        let snap_rseq = !self.txn.seq;
        let state = self.txn.inner.state.read();
        let end = table_end(self.table);
        let mut skip_key: Option<&[u8]> = None;
        for (ik, version) in state.map.range((start, end)) {
            if skip_key == Some(ik.key.as_slice()) {
                continue;
            }
            if ik.rseq < snap_rseq {
                // Version newer than the snapshot; an older one may follow.
                continue;
            }
            // Newest visible version of this key.
            match version {
                Some(v) => {
                    let found = (ik.key.clone(), v.to_vec());
                    self.pos = Some(found.0.clone());
                    return Some(found);
                }
                None => {
                    // Deleted at this snapshot; move past remaining versions.
                    skip_key = Some(ik.key.as_slice());
                }
            }
        }
        self.pos = None;
        None
    }

    fn walk_backward(&mut self, end: Bound<IKey>) -> Option<(Vec<u8>, Vec<u8>)> {
        let snap_rseq = !self.txn.seq;
        let state = self.txn.inner.state.read();
        let start = Bound::Included(IKey {
            table: self.table,
            key: Vec::new(),
            rseq: 0,
        });
        // Reverse iteration visits each key's versions oldest-first, so
        // remember the newest visible one until the key changes.
        let mut candidate: Option<(Vec<u8>, Version)> = None;
        for (ik, version) in state.map.range((start, end)).rev() {
            let key_changed = matches!(&candidate, Some((ckey, _)) if ckey != &ik.key);
            if key_changed {
                // A deleted or invisible candidate falls through and the
                // walk continues into the previous key.
                if let Some((ckey, Some(v))) = candidate.take() {
                    self.pos = Some(ckey.clone());
                    return Some((ckey, v.to_vec()));
                }
            }
            if ik.rseq >= snap_rseq {
                candidate = Some((ik.key.clone(), version.clone()));
            } else if candidate.is_none() {
                candidate = Some((ik.key.clone(), None));
            }
        }
        if let Some((ckey, Some(v))) = candidate {
            self.pos = Some(ckey.clone());
            return Some((ckey, v.to_vec()));
        }
        self.pos = None;
        None
    }
}

fn table_end(table: u8) -> Bound<IKey> {
    if table == u8::MAX {
        Bound::Unbounded
    } else {
        Bound::Excluded(IKey {
            table: table + 1,
            key: Vec::new(),
            rseq: 0,
        })
    }
}

fn visible_version<'m>(
    map: &'m BTreeMap<IKey, Version>,
    table: u8,
    key: &[u8],
    snap: u64,
) -> Option<&'m Arc<[u8]>> {
    let start = IKey::new(table, key.to_vec(), snap);
    let end = IKey {
        table,
        key: key.to_vec(),
        rseq: u64::MAX,
    };
    map.range(start..=end)
        .next()
        .and_then(|(_, version)| version.as_ref())
}

/// The exclusive write transaction.
pub struct WriteTxn<'a> {
    store: &'a Store,
    _gate: MutexGuard<'a, ()>,
    staged: BTreeMap<(u8, Vec<u8>), Option<Vec<u8>>>,
}

impl WriteTxn<'_> {
    /// Read through the staged overlay, then the latest committed state.
    pub fn get(&self, table: u8, key: &[u8]) -> Option<Vec<u8>> {
        if let Some(staged) = self.staged.get(&(table, key.to_vec())) {
            return staged.clone();
        }
        let state = self.store.inner.state.read();
        let seq = state.committed_seq;
        visible_version(&state.map, table, key, seq).map(|v| v.to_vec())
    }

    pub fn put(&mut self, table: u8, key: Vec<u8>, value: Vec<u8>) {
        self.staged.insert((table, key), Some(value));
    }

    pub fn delete(&mut self, table: u8, key: Vec<u8>) {
        self.staged.insert((table, key), None);
    }

    /// Durably commit: budget check, WAL append + fsync, then publish.
    pub fn commit(self) -> Result<u64, StoreError> {
        if self.staged.is_empty() {
            return Ok(self.store.inner.state.read().committed_seq);
        }
        let inner = &self.store.inner;
        let min_snap = self.store.min_live_snapshot();

        // Budget check against the post-commit footprint.
        let (delta, seq) = {
            let state = inner.state.read();
            let mut delta: i64 = 0;
            for ((table, key), value) in &self.staged {
                delta += entry_cost(key, value.as_deref()) as i64;
                if min_snap.is_none() {
                    if let Some(old) =
                        visible_version(&state.map, *table, key, state.committed_seq)
                    {
                        delta -= entry_cost(key, Some(old)) as i64;
                    }
                }
            }
            let projected = state.used_bytes.saturating_add_signed(delta);
            if projected > inner.opts.map_bytes {
                return Err(StoreError::MapFull {
                    used: projected,
                    budget: inner.opts.map_bytes,
                });
            }
            (delta, state.committed_seq + 1)
        };

        // Durability first: the record must be on disk before readers
        // can observe it.
        let entries: Vec<(u8, Vec<u8>, Option<Vec<u8>>)> = self
            .staged
            .iter()
            .map(|((t, k), v)| (*t, k.clone(), v.clone()))
            .collect();
        let record = encode_record(seq, &entries);
        {
            let mut wal = inner.wal.lock();
            let offset = wal.seek(SeekFrom::End(0))?;
            if let Err(e) = wal.write_all(&record).and_then(|_| wal.sync_data()) {
                // Leave no torn record behind for a retried commit.
                let _ = wal.set_len(offset);
                return Err(e.into());
            }
        }

        let mut state = inner.state.write();
        // Re-read the snapshot floor under the write lock; readers
        // register under the state lock, so this cannot go stale.
        let min_snap = self.store.min_live_snapshot();
        for ((table, key), value) in self.staged {
            state
                .map
                .insert(IKey::new(table, key.clone(), seq), value.map(Arc::from));
            gc_versions(&mut state.map, table, &key, seq, min_snap);
        }
        state.used_bytes = state.used_bytes.saturating_add_signed(delta);
        state.committed_seq = seq;
        Ok(seq)
    }
}

/// Drop versions of `key` that no live snapshot can still observe.
fn gc_versions(
    map: &mut BTreeMap<IKey, Version>,
    table: u8,
    key: &[u8],
    newest_seq: u64,
    min_snap: Option<u64>,
) {
    let start = IKey::new(table, key.to_vec(), newest_seq);
    let end = IKey {
        table,
        key: key.to_vec(),
        rseq: u64::MAX,
    };
    let mut keep_next_older = match min_snap {
        // Oldest snapshot still needs the newest version at or below it.
        Some(snap) => snap < newest_seq,
        None => false,
    };
    let mut dead: Vec<IKey> = Vec::new();
    for (ik, _) in map.range((Bound::Excluded(start.clone()), Bound::Included(end))) {
        let needed = match min_snap {
            Some(snap) => {
                if ik.seq() > snap {
                    true
                } else if keep_next_older {
                    keep_next_older = false;
                    true
                } else {
                    false
                }
            }
            None => false,
        };
        if !needed {
            dead.push(ik.clone());
        }
    }
    for ik in dead {
        map.remove(&ik);
    }
    // A tombstone with nothing beneath it shadows nothing.
    let only_version = map
        .range((Bound::Excluded(start.clone()), Bound::Included(IKey {
            table,
            key: key.to_vec(),
            rseq: u64::MAX,
        })))
        .next()
        .is_none();
    if only_version {
        if let Some(None) = map.get(&start) {
            map.remove(&start);
        }
    }
}

fn entry_cost(key: &[u8], value: Option<&[u8]>) -> u64 {
    ENTRY_OVERHEAD + key.len() as u64 + value.map(|v| v.len() as u64).unwrap_or(0)
}

fn encode_record(seq: u64, entries: &[(u8, Vec<u8>, Option<Vec<u8>>)]) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&seq.to_le_bytes());
    payload.extend_from_slice(&(entries.len() as u32).to_le_bytes());
    for (table, key, value) in entries {
        payload.push(*table);
        payload.push(u8::from(value.is_some()));
        payload.extend_from_slice(&(key.len() as u32).to_le_bytes());
        payload.extend_from_slice(key);
        if let Some(v) = value {
            payload.extend_from_slice(&(v.len() as u32).to_le_bytes());
            payload.extend_from_slice(v);
        }
    }
    let mut record = Vec::with_capacity(payload.len() + 8);
    record.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    record.extend_from_slice(&payload);
    record
}

/// Replay the log, returning the rebuilt tree, the last committed seq,
/// and the byte offset of the last intact record's end.
#[allow(clippy::type_complexity)]
fn replay(wal: &mut File) -> Result<(BTreeMap<IKey, Version>, u64, u64), StoreError> {
    let mut data = Vec::new();
    wal.seek(SeekFrom::Start(0))?;
    wal.read_to_end(&mut data)?;

    let mut map: BTreeMap<IKey, Version> = BTreeMap::new();
    let mut committed_seq = 0u64;
    let mut offset = 0usize;
    let mut good_len = 0u64;

    while data.len() - offset >= 8 {
        let len = u64::from_le_bytes(
            data[offset..offset + 8]
                .try_into()
                .map_err(|_| StoreError::Corrupt("record header".into()))?,
        ) as usize;
        let body_start = offset + 8;
        if len > data.len() - body_start {
            break; // torn tail
        }
        let body = &data[body_start..body_start + len];
        match decode_record(body) {
            Some((seq, entries)) if seq > committed_seq => {
                for (table, key, value) in entries {
                    // Replay keeps only the newest version per key;
                    // history before open is unobservable.
                    let ik = IKey::new(table, key.clone(), seq);
                    let range_end = IKey {
                        table,
                        key,
                        rseq: u64::MAX,
                    };
                    let stale: Vec<IKey> = map
                        .range((Bound::Excluded(ik.clone()), Bound::Included(range_end)))
                        .map(|(k, _)| k.clone())
                        .collect();
                    for k in stale {
                        map.remove(&k);
                    }
                    match value {
                        Some(v) => {
                            map.insert(ik, Some(Arc::from(v)));
                        }
                        None => {
                            map.remove(&ik);
                        }
                    }
                }
                committed_seq = seq;
                offset = body_start + len;
                good_len = offset as u64;
            }
            _ => break, // malformed or out-of-order record: treat as torn
        }
    }

    Ok((map, committed_seq, good_len))
}

#[allow(clippy::type_complexity)]
fn decode_record(body: &[u8]) -> Option<(u64, Vec<(u8, Vec<u8>, Option<Vec<u8>>)>)> {
    if body.len() < 12 {
        return None;
    }
    let seq = u64::from_le_bytes(body[0..8].try_into().ok()?);
    let count = u32::from_le_bytes(body[8..12].try_into().ok()?) as usize;
    let mut pos = 12usize;
    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        if body.len() < pos + 6 {
            return None;
        }
        let table = body[pos];
        let is_put = body[pos + 1] == 1;
        let klen = u32::from_le_bytes(body[pos + 2..pos + 6].try_into().ok()?) as usize;
        pos += 6;
        if body.len() < pos + klen {
            return None;
        }
        let key = body[pos..pos + klen].to_vec();
        pos += klen;
        let value = if is_put {
            if body.len() < pos + 4 {
                return None;
            }
            let vlen = u32::from_le_bytes(body[pos..pos + 4].try_into().ok()?) as usize;
            pos += 4;
            if body.len() < pos + vlen {
                return None;
            }
            let v = body[pos..pos + vlen].to_vec();
            pos += vlen;
            Some(v)
        } else {
            None
        };
        entries.push((table, key, value));
    }
    if pos != body.len() {
        return None;
    }
    Some((seq, entries))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_store(dir: &TempDir) -> Store {
        Store::open(dir.path(), StoreOptions::default()).unwrap()
    }

    fn put1(store: &Store, table: u8, key: &[u8], value: &[u8]) -> u64 {
        let mut txn = store.txn_rw().unwrap();
        txn.put(table, key.to_vec(), value.to_vec());
        txn.commit().unwrap()
    }

    #[test]
    fn put_get_delete_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        put1(&store, 0, b"alpha", b"1");
        let ro = store.txn_ro();
        assert_eq!(ro.get(0, b"alpha"), Some(b"1".to_vec()));
        assert_eq!(ro.get(0, b"beta"), None);
        assert_eq!(ro.get(1, b"alpha"), None);
        drop(ro);

        let mut txn = store.txn_rw().unwrap();
        txn.delete(0, b"alpha".to_vec());
        txn.commit().unwrap();
        assert_eq!(store.txn_ro().get(0, b"alpha"), None);
    }

    #[test]
    fn snapshot_isolation() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        put1(&store, 0, b"k", b"old");
        let ro = store.txn_ro();
        put1(&store, 0, b"k", b"new");
        // The earlier snapshot still sees the superseded version.
        assert_eq!(ro.get(0, b"k"), Some(b"old".to_vec()));
        assert_eq!(store.txn_ro().get(0, b"k"), Some(b"new".to_vec()));
    }

    #[test]
    fn snapshot_does_not_see_later_delete() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        put1(&store, 0, b"k", b"v");
        let ro = store.txn_ro();
        let mut txn = store.txn_rw().unwrap();
        txn.delete(0, b"k".to_vec());
        txn.commit().unwrap();
        assert_eq!(ro.get(0, b"k"), Some(b"v".to_vec()));
        assert_eq!(store.txn_ro().get(0, b"k"), None);
    }

    #[test]
    fn single_writer_enforced() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let _w = store.txn_rw().unwrap();
        assert!(matches!(store.txn_rw(), Err(StoreError::WriteBusy)));
    }

    #[test]
    fn cursor_walks_in_key_order() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let mut txn = store.txn_rw().unwrap();
        for k in [b"b".to_vec(), b"a".to_vec(), b"d".to_vec(), b"c".to_vec()] {
            txn.put(3, k.clone(), k);
        }
        txn.commit().unwrap();

        let ro = store.txn_ro();
        let mut cur = ro.cursor(3);
        let mut keys = vec![];
        let mut next = cur.seek(b"");
        while let Some((k, _)) = next {
            keys.push(k);
            next = cur.next();
        }
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]);

        let mut cur = ro.cursor(3);
        let (k, _) = cur.seek_back(b"zz").unwrap();
        assert_eq!(k, b"d");
        let (k, _) = cur.prev().unwrap();
        assert_eq!(k, b"c");
        let (k, _) = cur.seek_back(b"b").unwrap();
        assert_eq!(k, b"b");
        let (k, _) = cur.prev().unwrap();
        assert_eq!(k, b"a");
        assert!(cur.prev().is_none());
    }

    #[test]
    fn cursor_stays_within_table() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let mut txn = store.txn_rw().unwrap();
        txn.put(1, b"x".to_vec(), b"t1".to_vec());
        txn.put(2, b"a".to_vec(), b"t2".to_vec());
        txn.commit().unwrap();

        let ro = store.txn_ro();
        let mut cur = ro.cursor(1);
        assert_eq!(cur.seek(b"").unwrap().0, b"x".to_vec());
        assert!(cur.next().is_none());
        let mut cur = ro.cursor(2);
        assert_eq!(cur.seek_back(b"zz").unwrap().0, b"a".to_vec());
        assert!(cur.prev().is_none());
    }

    #[test]
    fn cursor_skips_deleted_keys_at_snapshot() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let mut txn = store.txn_rw().unwrap();
        txn.put(0, b"a".to_vec(), b"1".to_vec());
        txn.put(0, b"b".to_vec(), b"2".to_vec());
        txn.put(0, b"c".to_vec(), b"3".to_vec());
        txn.commit().unwrap();
        let old = store.txn_ro();
        let mut txn = store.txn_rw().unwrap();
        txn.delete(0, b"b".to_vec());
        txn.commit().unwrap();

        let ro = store.txn_ro();
        let mut cur = ro.cursor(0);
        assert_eq!(cur.seek(b"").unwrap().0, b"a".to_vec());
        assert_eq!(cur.next().unwrap().0, b"c".to_vec());
        assert!(cur.next().is_none());

        // Pinned snapshot still iterates the deleted key.
        let mut cur = old.cursor(0);
        assert_eq!(cur.seek(b"").unwrap().0, b"a".to_vec());
        assert_eq!(cur.next().unwrap().0, b"b".to_vec());
        assert_eq!(cur.next().unwrap().0, b"c".to_vec());
    }

    #[test]
    fn write_txn_reads_its_own_staging() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        put1(&store, 0, b"k", b"committed");
        let mut txn = store.txn_rw().unwrap();
        assert_eq!(txn.get(0, b"k"), Some(b"committed".to_vec()));
        txn.put(0, b"k".to_vec(), b"staged".to_vec());
        assert_eq!(txn.get(0, b"k"), Some(b"staged".to_vec()));
        txn.delete(0, b"k".to_vec());
        assert_eq!(txn.get(0, b"k"), None);
        drop(txn); // abort
        assert_eq!(store.txn_ro().get(0, b"k"), Some(b"committed".to_vec()));
    }

    #[test]
    fn reopen_recovers_committed_state() {
        let dir = TempDir::new().unwrap();
        {
            let store = open_store(&dir);
            put1(&store, 0, b"a", b"1");
            put1(&store, 0, b"b", b"2");
            let mut txn = store.txn_rw().unwrap();
            txn.delete(0, b"a".to_vec());
            txn.commit().unwrap();
        }
        let store = open_store(&dir);
        assert_eq!(store.committed_seq(), 3);
        let ro = store.txn_ro();
        assert_eq!(ro.get(0, b"a"), None);
        assert_eq!(ro.get(0, b"b"), Some(b"2".to_vec()));
    }

    #[test]
    fn torn_tail_is_truncated_on_open() {
        let dir = TempDir::new().unwrap();
        {
            let store = open_store(&dir);
            put1(&store, 0, b"a", b"1");
        }
        let wal_path = dir.path().join(WAL_FILE);
        let mut f = OpenOptions::new().append(true).open(&wal_path).unwrap();
        f.write_all(&[42u8; 11]).unwrap(); // half a record
        drop(f);

        let store = open_store(&dir);
        assert_eq!(store.txn_ro().get(0, b"a"), Some(b"1".to_vec()));
        // The torn bytes are gone and the store keeps working.
        put1(&store, 0, b"b", b"2");
        drop(store);
        let store = open_store(&dir);
        assert_eq!(store.txn_ro().get(0, b"b"), Some(b"2".to_vec()));
    }

    #[test]
    fn map_full_is_fatal_and_leaves_state_unchanged() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path(), StoreOptions { map_bytes: 64 }).unwrap();
        let mut txn = store.txn_rw().unwrap();
        txn.put(0, b"k".to_vec(), vec![0u8; 128]);
        let err = txn.commit().unwrap_err();
        assert!(matches!(err, StoreError::MapFull { .. }));
        assert!(!err.is_transient());
        assert_eq!(store.committed_seq(), 0);
        assert_eq!(store.txn_ro().get(0, b"k"), None);
    }

    #[test]
    fn superseded_versions_are_collected() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        for i in 0..10u8 {
            put1(&store, 0, b"k", &[i]);
        }
        // No snapshots are live, so only the newest version remains.
        let versions = store.inner.state.read().map.len();
        assert_eq!(versions, 1);

        let ro = store.txn_ro();
        put1(&store, 0, b"k", b"newer");
        assert!(store.inner.state.read().map.len() >= 2);
        drop(ro);
        put1(&store, 0, b"k", b"newest");
        assert_eq!(store.inner.state.read().map.len(), 1);
    }

    #[test]
    fn compact_rewrites_log() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        for i in 0..20u8 {
            put1(&store, 0, b"k", &[i]);
        }
        put1(&store, 1, b"other", b"v");
        let before = std::fs::metadata(dir.path().join(WAL_FILE)).unwrap().len();
        store.compact().unwrap();
        let after = std::fs::metadata(dir.path().join(WAL_FILE)).unwrap().len();
        assert!(after < before);

        drop(store);
        let store = open_store(&dir);
        assert_eq!(store.txn_ro().get(0, b"k"), Some(vec![19u8]));
        assert_eq!(store.txn_ro().get(1, b"other"), Some(b"v".to_vec()));
    }
}
