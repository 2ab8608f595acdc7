//! Transactional system-metadata store.
//!
//! The distributor's persisted state is a single small keyspace held in
//! memory and written through to one fjall partition. Mutators use optimistic
//! transactions: reads record a conflict set, commit validates it against the
//! sequence numbers of concurrent commits and either applies atomically or
//! fails with a conflict for the retry loop to absorb.
//!
//! Range maps (shard map, audit progress) are stored as boundary keys under a
//! prefix: a boundary at key `k` carries the value in effect for `[k, next)`.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::RwLock;
use std::time::Duration;

use fjall::{Keyspace, PartitionCreateOptions, PartitionHandle};

use crate::error::{Error, Result};
use crate::KeyRange;

enum Mutation {
    Set(Vec<u8>),
    Clear,
}

struct StoreInner {
    data: BTreeMap<Vec<u8>, Vec<u8>>,
    /// Last commit sequence that touched each key, including removals.
    versions: BTreeMap<Vec<u8>, u64>,
    commit_seq: u64,
}

pub struct SystemStore {
    inner: RwLock<StoreInner>,
    keyspace: Keyspace,
    partition: PartitionHandle,
}

impl SystemStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let keyspace = fjall::Config::new(path).open()?;
        let partition = keyspace.open_partition("system", PartitionCreateOptions::default())?;

        let mut data = BTreeMap::new();
        for item in partition.iter() {
            let (key, value) = item?;
            data.insert(key.to_vec(), value.to_vec());
        }

        Ok(Self {
            inner: RwLock::new(StoreInner {
                data,
                versions: BTreeMap::new(),
                commit_seq: 0,
            }),
            keyspace,
            partition,
        })
    }

    pub fn begin(&self) -> Transaction<'_> {
        let snapshot_seq = self.inner.read().unwrap().commit_seq;
        Transaction {
            store: self,
            snapshot_seq,
            read_keys: Vec::new(),
            read_ranges: Vec::new(),
            writes: BTreeMap::new(),
            cleared: Vec::new(),
        }
    }

    pub fn commit_seq(&self) -> u64 {
        self.inner.read().unwrap().commit_seq
    }

    /// Run `f` inside a transaction, retrying on conflicts with backoff.
    pub async fn run_txn<T>(
        &self,
        mut f: impl FnMut(&mut Transaction<'_>) -> Result<T>,
    ) -> Result<T> {
        let mut backoff = Duration::from_millis(5);
        loop {
            let mut tr = self.begin();
            let outcome = f(&mut tr).and_then(|value| tr.commit().map(|_| value));
            match outcome {
                Ok(value) => return Ok(value),
                Err(err) if err.is_txn_retryable() => {
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(Duration::from_millis(500));
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn commit_txn(&self, tr: &Transaction<'_>) -> Result<u64> {
        let mut inner = self.inner.write().unwrap();

        for key in &tr.read_keys {
            if inner.versions.get(key).copied().unwrap_or(0) > tr.snapshot_seq {
                return Err(Error::TxnConflict);
            }
        }
        for (begin, end) in &tr.read_ranges {
            let conflicted = inner
                .versions
                .range::<[u8], _>((
                    std::ops::Bound::Included(begin.as_slice()),
                    std::ops::Bound::Excluded(end.as_slice()),
                ))
                .any(|(_, seq)| *seq > tr.snapshot_seq);
            if conflicted {
                return Err(Error::TxnConflict);
            }
        }

        let seq = inner.commit_seq + 1;
        let mut batch = self.keyspace.batch();

        for (begin, end) in &tr.cleared {
            let doomed: Vec<Vec<u8>> = inner
                .data
                .range::<[u8], _>((
                    std::ops::Bound::Included(begin.as_slice()),
                    std::ops::Bound::Excluded(end.as_slice()),
                ))
                .map(|(k, _)| k.clone())
                .collect();
            for key in doomed {
                inner.data.remove(&key);
                inner.versions.insert(key.clone(), seq);
                batch.remove(&self.partition, key);
            }
        }
        for (key, mutation) in &tr.writes {
            match mutation {
                Mutation::Set(value) => {
                    inner.data.insert(key.clone(), value.clone());
                    batch.insert(&self.partition, key.clone(), value.clone());
                }
                Mutation::Clear => {
                    inner.data.remove(key);
                    batch.remove(&self.partition, key.clone());
                }
            }
            inner.versions.insert(key.clone(), seq);
        }

        batch.commit()?;
        inner.commit_seq = seq;
        Ok(seq)
    }
}

pub struct Transaction<'a> {
    store: &'a SystemStore,
    snapshot_seq: u64,
    read_keys: Vec<Vec<u8>>,
    read_ranges: Vec<(Vec<u8>, Vec<u8>)>,
    writes: BTreeMap<Vec<u8>, Mutation>,
    cleared: Vec<(Vec<u8>, Vec<u8>)>,
}

impl Transaction<'_> {
    pub fn get(&mut self, key: &[u8]) -> Option<Vec<u8>> {
        self.read_keys.push(key.to_vec());
        if let Some(mutation) = self.writes.get(key) {
            return match mutation {
                Mutation::Set(value) => Some(value.clone()),
                Mutation::Clear => None,
            };
        }
        if self.key_cleared(key) {
            return None;
        }
        self.store.inner.read().unwrap().data.get(key).cloned()
    }

    /// All entries in `[begin, end)`, this transaction's writes included.
    pub fn get_range(&mut self, begin: &[u8], end: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.read_ranges.push((begin.to_vec(), end.to_vec()));
        self.range_snapshot(begin, end)
    }

    /// Bounded range read, optionally from the end backwards.
    pub fn get_range_limit(
        &mut self,
        begin: &[u8],
        end: &[u8],
        limit: usize,
        reverse: bool,
    ) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.read_ranges.push((begin.to_vec(), end.to_vec()));
        let mut all = self.range_snapshot(begin, end);
        if reverse {
            all.reverse();
        }
        all.truncate(limit);
        all
    }

    pub fn set(&mut self, key: &[u8], value: &[u8]) {
        self.writes
            .insert(key.to_vec(), Mutation::Set(value.to_vec()));
    }

    pub fn clear(&mut self, key: &[u8]) {
        self.writes.insert(key.to_vec(), Mutation::Clear);
    }

    pub fn clear_range(&mut self, begin: &[u8], end: &[u8]) {
        let in_range: Vec<Vec<u8>> = self
            .writes
            .range::<[u8], _>((
                std::ops::Bound::Included(begin),
                std::ops::Bound::Excluded(end),
            ))
            .map(|(k, _)| k.clone())
            .collect();
        for key in in_range {
            self.writes.remove(&key);
        }
        self.cleared.push((begin.to_vec(), end.to_vec()));
    }

    pub fn commit(self) -> Result<u64> {
        self.store.commit_txn(&self)
    }

    fn key_cleared(&self, key: &[u8]) -> bool {
        self.cleared
            .iter()
            .any(|(b, e)| key >= b.as_slice() && key < e.as_slice())
    }

    fn range_snapshot(&self, begin: &[u8], end: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
        let inner = self.store.inner.read().unwrap();
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = inner
            .data
            .range::<[u8], _>((
                std::ops::Bound::Included(begin),
                std::ops::Bound::Excluded(end),
            ))
            .filter(|(k, _)| !self.key_cleared(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (key, mutation) in self.writes.range::<[u8], _>((
            std::ops::Bound::Included(begin),
            std::ops::Bound::Excluded(end),
        )) {
            match mutation {
                Mutation::Set(value) => {
                    merged.insert(key.clone(), value.clone());
                }
                Mutation::Clear => {
                    merged.remove(key);
                }
            }
        }
        merged.into_iter().collect()
    }
}

/// One aligned entry of a range map read.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RangeMapEntry {
    pub range: KeyRange,
    pub value: Vec<u8>,
}

fn key_after(key: &[u8]) -> Vec<u8> {
    let mut next = key.to_vec();
    next.push(0);
    next
}

/// Seed a range map so every key has a boundary at or before it.
pub fn rangemap_init(tr: &mut Transaction<'_>, prefix: &[u8], default_value: &[u8]) {
    let begin = prefix.to_vec();
    let mut end = prefix.to_vec();
    end.extend_from_slice(crate::keys::USER_KEYSPACE_END);
    tr.set(&begin, default_value);
    tr.set(&end, b"");
}

/// Value in effect at `key`: the value of the rightmost boundary at or
/// before it. Empty when the map has no boundary there.
pub fn rangemap_value_at(tr: &mut Transaction<'_>, prefix: &[u8], key: &[u8]) -> Vec<u8> {
    let mut at = prefix.to_vec();
    at.extend_from_slice(key);
    let entries = tr.get_range(prefix, &key_after(&at));
    entries.last().map(|(_, v)| v.clone()).unwrap_or_default()
}

/// Assign `value` to `range`, preserving the value in effect after
/// `range.end` and dropping interior boundaries. A boundary that would
/// separate two equal values is dropped rather than written, so adjacent
/// entries never carry the same value and the map stays coalesced.
pub fn rangemap_set(tr: &mut Transaction<'_>, prefix: &[u8], range: &KeyRange, value: &[u8]) {
    let prior_end_value = rangemap_value_at(tr, prefix, &range.end);
    let mut begin_key = prefix.to_vec();
    begin_key.extend_from_slice(&range.begin);
    let mut end_key = prefix.to_vec();
    end_key.extend_from_slice(&range.end);

    // Value in effect immediately to the left of the range, when any
    // boundary exists there.
    let left_value = tr
        .get_range(prefix, &begin_key)
        .last()
        .map(|(_, v)| v.clone());

    tr.clear_range(&begin_key, &end_key);
    match left_value {
        // The left neighbor already carries this value; extending it over
        // the range needs no boundary of its own.
        Some(left) if left == value => {}
        _ => tr.set(&begin_key, value),
    }
    if prior_end_value == value {
        // Equal on both sides of the end boundary: drop it. The boundary at
        // `range.end` sits outside the cleared span, so clear explicitly.
        tr.clear(&end_key);
    } else {
        tr.set(&end_key, &prior_end_value);
    }
}

/// Aligned read of `range`: entries tile `[range.begin, range.end)` exactly,
/// each carrying the boundary value in effect over it.
pub fn rangemap_get(tr: &mut Transaction<'_>, prefix: &[u8], range: &KeyRange) -> Vec<RangeMapEntry> {
    let mut begin_key = prefix.to_vec();
    begin_key.extend_from_slice(&range.begin);
    let mut end_key = prefix.to_vec();
    end_key.extend_from_slice(&range.end);

    let head_value = rangemap_value_at(tr, prefix, &range.begin);
    let interior = tr.get_range(&key_after(&begin_key), &end_key);

    let mut boundaries: Vec<(Vec<u8>, Vec<u8>)> = vec![(range.begin.clone(), head_value)];
    for (key, value) in interior {
        boundaries.push((key[prefix.len()..].to_vec(), value));
    }

    let mut entries = Vec::with_capacity(boundaries.len());
    for i in 0..boundaries.len() {
        let end = if i + 1 < boundaries.len() {
            boundaries[i + 1].0.clone()
        } else {
            range.end.clone()
        };
        let (begin, value) = boundaries[i].clone();
        if begin < end {
            entries.push(RangeMapEntry {
                range: KeyRange::new(begin, end),
                value,
            });
        }
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, SystemStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SystemStore::open(dir.path().join("sys")).expect("open store");
        (dir, store)
    }

    #[test]
    fn point_reads_conflict_with_concurrent_writes() {
        let (_dir, store) = store();

        let mut setup = store.begin();
        setup.set(b"k", b"v0");
        setup.commit().expect("setup");

        let mut a = store.begin();
        let mut b = store.begin();
        assert_eq!(a.get(b"k"), Some(b"v0".to_vec()));
        assert_eq!(b.get(b"k"), Some(b"v0".to_vec()));
        a.set(b"k", b"va");
        b.set(b"k", b"vb");
        a.commit().expect("first writer wins");
        assert_eq!(b.commit(), Err(Error::TxnConflict));
    }

    #[test]
    fn range_reads_conflict_with_inserts_into_the_range() {
        let (_dir, store) = store();

        let mut reader = store.begin();
        assert!(reader.get_range(b"a", b"z").is_empty());

        let mut writer = store.begin();
        writer.set(b"m", b"1");
        writer.commit().expect("insert");

        reader.set(b"out", b"1");
        assert_eq!(reader.commit(), Err(Error::TxnConflict));
    }

    #[test]
    fn absent_read_conflicts_with_creation() {
        let (_dir, store) = store();

        let mut a = store.begin();
        let mut b = store.begin();
        assert_eq!(a.get(b"name"), None);
        assert_eq!(b.get(b"name"), None);
        a.set(b"name", b"1");
        b.set(b"name", b"2");
        a.commit().expect("first");
        assert_eq!(b.commit(), Err(Error::TxnConflict));
    }

    #[test]
    fn data_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let store = SystemStore::open(dir.path().join("sys")).expect("open");
            let mut tr = store.begin();
            tr.set(b"persisted", b"yes");
            tr.commit().expect("commit");
        }
        let store = SystemStore::open(dir.path().join("sys")).expect("reopen");
        let mut tr = store.begin();
        assert_eq!(tr.get(b"persisted"), Some(b"yes".to_vec()));
    }

    #[test]
    fn rangemap_set_and_get_tile_the_space() {
        let (_dir, store) = store();
        let prefix = b"\xff/testmap/";

        let mut tr = store.begin();
        rangemap_init(&mut tr, prefix, b"init");
        rangemap_set(
            &mut tr,
            prefix,
            &KeyRange::new(b"b".to_vec(), b"d".to_vec()),
            b"mid",
        );
        tr.commit().expect("commit");

        let mut tr = store.begin();
        let entries = rangemap_get(
            &mut tr,
            prefix,
            &KeyRange::new(b"".to_vec(), crate::keys::USER_KEYSPACE_END.to_vec()),
        );
        let got: Vec<(Vec<u8>, Vec<u8>, Vec<u8>)> = entries
            .iter()
            .map(|e| (e.range.begin.clone(), e.range.end.clone(), e.value.clone()))
            .collect();
        assert_eq!(
            got,
            vec![
                (b"".to_vec(), b"b".to_vec(), b"init".to_vec()),
                (b"b".to_vec(), b"d".to_vec(), b"mid".to_vec()),
                (
                    b"d".to_vec(),
                    crate::keys::USER_KEYSPACE_END.to_vec(),
                    b"init".to_vec()
                ),
            ]
        );
    }

    #[test]
    fn rangemap_set_coalesces_equal_neighbors() {
        let (_dir, store) = store();
        let prefix = b"\xff/testmap/";

        let mut tr = store.begin();
        rangemap_init(&mut tr, prefix, b"base");
        rangemap_set(
            &mut tr,
            prefix,
            &KeyRange::new(b"b".to_vec(), b"d".to_vec()),
            b"mid",
        );
        tr.commit().expect("commit");

        // Writing the right neighbor's value up to its boundary removes the
        // boundary instead of duplicating the value across it.
        let mut tr = store.begin();
        rangemap_set(
            &mut tr,
            prefix,
            &KeyRange::new(b"a".to_vec(), b"b".to_vec()),
            b"mid",
        );
        tr.commit().expect("commit");

        let mut tr = store.begin();
        let mut boundary_b = prefix.to_vec();
        boundary_b.extend_from_slice(b"b");
        assert_eq!(tr.get(&boundary_b), None, "duplicate-value boundary survived");
        let entries = rangemap_get(
            &mut tr,
            prefix,
            &KeyRange::new(b"".to_vec(), crate::keys::USER_KEYSPACE_END.to_vec()),
        );
        let got: Vec<(Vec<u8>, Vec<u8>, Vec<u8>)> = entries
            .iter()
            .map(|e| (e.range.begin.clone(), e.range.end.clone(), e.value.clone()))
            .collect();
        assert_eq!(
            got,
            vec![
                (b"".to_vec(), b"a".to_vec(), b"base".to_vec()),
                (b"a".to_vec(), b"d".to_vec(), b"mid".to_vec()),
                (
                    b"d".to_vec(),
                    crate::keys::USER_KEYSPACE_END.to_vec(),
                    b"base".to_vec()
                ),
            ]
        );

        // Writing the left neighbor's value leaves no begin boundary either:
        // [d, ...) already carries "base", so [f, h) = "base" is a no-op.
        let mut tr = store.begin();
        rangemap_set(
            &mut tr,
            prefix,
            &KeyRange::new(b"f".to_vec(), b"h".to_vec()),
            b"base",
        );
        tr.commit().expect("commit");

        let mut tr = store.begin();
        let mut boundary_f = prefix.to_vec();
        boundary_f.extend_from_slice(b"f");
        let mut boundary_h = prefix.to_vec();
        boundary_h.extend_from_slice(b"h");
        assert_eq!(tr.get(&boundary_f), None);
        assert_eq!(tr.get(&boundary_h), None);
        let tail = rangemap_get(
            &mut tr,
            prefix,
            &KeyRange::new(b"d".to_vec(), crate::keys::USER_KEYSPACE_END.to_vec()),
        );
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].value, b"base".to_vec());
    }

    #[test]
    fn rangemap_overwrite_drops_interior_boundaries() {
        let (_dir, store) = store();
        let prefix = b"\xff/testmap/";

        let mut tr = store.begin();
        rangemap_init(&mut tr, prefix, b"0");
        rangemap_set(&mut tr, prefix, &KeyRange::new(b"b".to_vec(), b"c".to_vec()), b"1");
        rangemap_set(&mut tr, prefix, &KeyRange::new(b"c".to_vec(), b"d".to_vec()), b"2");
        tr.commit().expect("commit");

        let mut tr = store.begin();
        rangemap_set(&mut tr, prefix, &KeyRange::new(b"a".to_vec(), b"e".to_vec()), b"3");
        tr.commit().expect("commit");

        let mut tr = store.begin();
        let entries = rangemap_get(
            &mut tr,
            prefix,
            &KeyRange::new(b"a".to_vec(), b"e".to_vec()),
        );
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].value, b"3".to_vec());

        // The value after the overwritten span is preserved.
        let after = rangemap_value_at(&mut tr, prefix, b"f");
        assert_eq!(after, b"0".to_vec());
    }
}
