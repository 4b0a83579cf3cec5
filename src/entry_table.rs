//! The entry table is the authoritative map from content identifier
//! to cache bookkeeping.  It performs no I/O: the manager pairs each
//! table mutation with the matching filesystem operation.
//!
//! Entries are kept in a total eviction order.  Each insert or touch
//! draws a fresh rank from a monotonic counter, so two entries never
//! compare equal and eviction is deterministic.  Depending on the
//! [`VolatilePolicy`], volatile entries may additionally sort in a
//! lower tier than every regular entry.
use std::collections::BTreeMap;
use std::collections::HashMap;

use crate::content_id::ContentId;
use crate::error::QuotaError;
use crate::error::Result;

/// How volatile entries interact with recency when picking victims.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VolatilePolicy {
    /// Ignore the volatile flag: evict in pure least-recently-used
    /// order.
    Lru,
    /// Volatile entries are all evicted (in recency order) before any
    /// regular entry.
    EvictFirst,
}

impl Default for VolatilePolicy {
    fn default() -> Self {
        VolatilePolicy::EvictFirst
    }
}

/// What the table knows about one cached object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CacheEntry {
    pub id: ContentId,
    /// Bytes occupied on disk.
    pub size: u64,
    /// An entry with a positive pin count is never picked for
    /// automatic eviction.
    pub pin_count: u32,
    pub volatile: bool,
    /// Position in the recency order; larger is more recent.
    pub rank: u64,
}

impl CacheEntry {
    #[inline]
    pub fn is_pinned(&self) -> bool {
        self.pin_count > 0
    }
}

/// Eviction victims, in the order they should be removed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Candidates {
    pub ids: Vec<ContentId>,
    /// Sum of the candidates' sizes.
    pub bytes: u64,
    /// False when the table ran out of unpinned entries before the
    /// running total reached the target.
    pub sufficient: bool,
}

// Sort key in the eviction order: (tier, rank).
type OrderKey = (u8, u64);

#[derive(Clone, Debug, Default)]
pub struct EntryTable {
    entries: HashMap<ContentId, CacheEntry>,
    order: BTreeMap<OrderKey, ContentId>,
    next_rank: u64,
    total_size: u64,
    pinned_size: u64,
    policy: VolatilePolicy,
}

impl EntryTable {
    pub fn new(policy: VolatilePolicy) -> EntryTable {
        EntryTable {
            policy,
            ..Default::default()
        }
    }

    pub fn policy(&self) -> VolatilePolicy {
        self.policy
    }

    fn order_key(&self, entry: &CacheEntry) -> OrderKey {
        let tier = match self.policy {
            VolatilePolicy::EvictFirst if entry.volatile => 0,
            _ => 1,
        };

        (tier, entry.rank)
    }

    fn fresh_rank(&mut self) -> u64 {
        let ret = self.next_rank;

        self.next_rank += 1;
        ret
    }

    /// Adds a new entry at the most recent position.
    pub fn insert(&mut self, id: ContentId, size: u64, volatile: bool) -> Result<()> {
        if self.entries.contains_key(&id) {
            return Err(QuotaError::AlreadyExists(id));
        }

        let entry = CacheEntry {
            id,
            size,
            pin_count: 0,
            volatile,
            rank: self.fresh_rank(),
        };

        let key = self.order_key(&entry);
        self.order.insert(key, id);
        self.entries.insert(id, entry);
        self.total_size += size;
        Ok(())
    }

    /// Moves `id` to the most recent position.
    pub fn touch(&mut self, id: ContentId) -> Result<()> {
        let rank = self.fresh_rank();
        let entry = self.entries.get_mut(&id).ok_or(QuotaError::NotFound(id))?;
        let old = *entry;

        entry.rank = rank;
        let new = *entry;

        let (old_key, new_key) = (self.order_key(&old), self.order_key(&new));
        self.order.remove(&old_key);
        self.order.insert(new_key, id);
        Ok(())
    }

    pub fn pin(&mut self, id: ContentId) -> Result<()> {
        let entry = self.entries.get_mut(&id).ok_or(QuotaError::NotFound(id))?;

        if entry.pin_count == 0 {
            self.pinned_size += entry.size;
        }

        entry.pin_count += 1;
        Ok(())
    }

    /// Drops one pin reference.  Unpinning an entry that holds no pin
    /// is an error, not a no-op.
    pub fn unpin(&mut self, id: ContentId) -> Result<()> {
        let entry = self.entries.get_mut(&id).ok_or(QuotaError::NotFound(id))?;

        if entry.pin_count == 0 {
            return Err(QuotaError::NotPinned(id));
        }

        entry.pin_count -= 1;
        if entry.pin_count == 0 {
            self.pinned_size -= entry.size;
        }

        Ok(())
    }

    /// Forgets about `id` and returns the number of bytes it occupied.
    pub fn remove(&mut self, id: ContentId) -> Result<u64> {
        let entry = self.entries.remove(&id).ok_or(QuotaError::NotFound(id))?;

        let key = self.order_key(&entry);
        self.order.remove(&key);
        self.total_size -= entry.size;
        if entry.is_pinned() {
            self.pinned_size -= entry.size;
        }

        Ok(entry.size)
    }

    /// Walks entries from the first eviction victim onwards, skipping
    /// pinned entries, until the candidates add up to at least
    /// `target_bytes`.
    pub fn select_eviction_candidates(&self, target_bytes: u64) -> Candidates {
        let mut ret = Candidates::default();

        for entry in self.entries() {
            if ret.bytes >= target_bytes {
                break;
            }

            if entry.is_pinned() {
                continue;
            }

            ret.ids.push(entry.id);
            ret.bytes += entry.size;
        }

        ret.sufficient = ret.bytes >= target_bytes;
        ret
    }

    pub fn get(&self, id: &ContentId) -> Option<&CacheEntry> {
        self.entries.get(id)
    }

    pub fn contains(&self, id: &ContentId) -> bool {
        self.entries.contains_key(id)
    }

    /// Iterates over all entries in eviction order: first victim first.
    pub fn entries(&self) -> impl Iterator<Item = &CacheEntry> + '_ {
        self.order.values().map(move |id| &self.entries[id])
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Bytes held by entries with a positive pin count.
    pub fn pinned_size(&self) -> u64 {
        self.pinned_size
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod test {
    use crate::content_id::ContentId;
    use crate::entry_table::*;
    use proptest::collection::vec;
    use proptest::prelude::*;
    use proptest_derive::Arbitrary;

    fn id(name: &str) -> ContentId {
        ContentId::of(name.as_bytes())
    }

    fn order(table: &EntryTable) -> Vec<ContentId> {
        table.entries().map(|e| e.id).collect()
    }

    #[test]
    fn smoke_test() {
        let mut table = EntryTable::new(VolatilePolicy::Lru);

        table.insert(id("a"), 10, false).expect("insert must succeed");
        table.insert(id("b"), 5, false).expect("insert must succeed");
        assert_eq!(table.total_size(), 15);
        assert_eq!(table.len(), 2);

        assert!(matches!(
            table.insert(id("a"), 1, false),
            Err(QuotaError::AlreadyExists(x)) if x == id("a")
        ));
        // A rejected insert must not change the accounting.
        assert_eq!(table.total_size(), 15);

        assert_eq!(table.remove(id("a")).expect("remove must succeed"), 10);
        assert_eq!(table.total_size(), 5);
        assert!(matches!(
            table.remove(id("a")),
            Err(QuotaError::NotFound(_))
        ));
    }

    #[test]
    fn missing_ids() {
        let mut table = EntryTable::new(VolatilePolicy::Lru);

        assert!(matches!(table.touch(id("x")), Err(QuotaError::NotFound(_))));
        assert!(matches!(table.pin(id("x")), Err(QuotaError::NotFound(_))));
        assert!(matches!(table.unpin(id("x")), Err(QuotaError::NotFound(_))));
    }

    /// Insert A, B, C; touch A; the first victim is B.
    #[test]
    fn touch_moves_to_back() {
        let mut table = EntryTable::new(VolatilePolicy::Lru);

        for name in &["a", "b", "c"] {
            table.insert(id(name), 1, false).expect("insert must succeed");
        }

        table.touch(id("a")).expect("touch must succeed");
        assert_eq!(order(&table), vec![id("b"), id("c"), id("a")]);

        let candidates = table.select_eviction_candidates(1);
        assert_eq!(candidates.ids, vec![id("b")]);
        assert!(candidates.sufficient);
    }

    #[test]
    fn pin_unpin() {
        let mut table = EntryTable::new(VolatilePolicy::Lru);

        table.insert(id("a"), 4, false).expect("insert must succeed");
        table.insert(id("b"), 4, false).expect("insert must succeed");

        table.pin(id("a")).expect("pin must succeed");
        table.pin(id("a")).expect("pin must succeed");
        assert_eq!(table.pinned_size(), 4);
        assert_eq!(table.select_eviction_candidates(4).ids, vec![id("b")]);

        table.unpin(id("a")).expect("unpin must succeed");
        // Still pinned once.
        assert_eq!(table.select_eviction_candidates(4).ids, vec![id("b")]);
        table.unpin(id("a")).expect("unpin must succeed");
        assert_eq!(table.pinned_size(), 0);
        assert_eq!(table.select_eviction_candidates(4).ids, vec![id("a")]);

        // Never below zero.
        assert!(matches!(
            table.unpin(id("a")),
            Err(QuotaError::NotPinned(x)) if x == id("a")
        ));
        assert_eq!(table.get(&id("a")).expect("present").pin_count, 0);
    }

    #[test]
    fn remove_pinned_updates_pinned_size() {
        let mut table = EntryTable::new(VolatilePolicy::Lru);

        table.insert(id("a"), 4, false).expect("insert must succeed");
        table.pin(id("a")).expect("pin must succeed");
        assert_eq!(table.remove(id("a")).expect("remove must succeed"), 4);
        assert_eq!(table.pinned_size(), 0);
        assert_eq!(table.total_size(), 0);
    }

    #[test]
    fn insufficient_candidates() {
        let mut table = EntryTable::new(VolatilePolicy::Lru);

        table.insert(id("a"), 4, false).expect("insert must succeed");
        table.insert(id("b"), 4, false).expect("insert must succeed");
        table.pin(id("a")).expect("pin must succeed");

        let candidates = table.select_eviction_candidates(6);
        assert_eq!(candidates.ids, vec![id("b")]);
        assert_eq!(candidates.bytes, 4);
        assert!(!candidates.sufficient);

        // Nothing to do for a zero target.
        let candidates = table.select_eviction_candidates(0);
        assert!(candidates.ids.is_empty());
        assert!(candidates.sufficient);
    }

    #[test]
    fn volatile_first() {
        let mut table = EntryTable::new(VolatilePolicy::EvictFirst);

        table.insert(id("old"), 1, false).expect("insert must succeed");
        table.insert(id("tmp"), 1, true).expect("insert must succeed");
        table.insert(id("new"), 1, false).expect("insert must succeed");

        assert_eq!(order(&table), vec![id("tmp"), id("old"), id("new")]);

        // Touching keeps a volatile entry in its tier.
        table.touch(id("tmp")).expect("touch must succeed");
        assert_eq!(order(&table), vec![id("tmp"), id("old"), id("new")]);
    }

    #[test]
    fn volatile_ignored_by_lru() {
        let mut table = EntryTable::new(VolatilePolicy::Lru);

        table.insert(id("old"), 1, false).expect("insert must succeed");
        table.insert(id("tmp"), 1, true).expect("insert must succeed");

        assert_eq!(order(&table), vec![id("old"), id("tmp")]);
    }

    #[derive(Arbitrary, Clone, Debug)]
    enum Op {
        Insert(u8, u16, bool),
        Touch(u8),
        Pin(u8),
        Unpin(u8),
        Remove(u8),
    }

    fn small_id(key: u8) -> ContentId {
        ContentId::new([key % 8; 20])
    }

    proptest! {
        /// The incremental totals always match a recount of the
        /// present entries.
        #[test]
        fn test_total_size_oracle(ops in vec(any::<Op>(), 0..64usize),
                                  evict_volatile in any::<bool>()) {
            let policy = if evict_volatile {
                VolatilePolicy::EvictFirst
            } else {
                VolatilePolicy::Lru
            };
            let mut table = EntryTable::new(policy);

            for op in ops {
                let _ = match op {
                    Op::Insert(key, size, volatile) => {
                        table.insert(small_id(key), size as u64, volatile)
                    }
                    Op::Touch(key) => table.touch(small_id(key)),
                    Op::Pin(key) => table.pin(small_id(key)),
                    Op::Unpin(key) => table.unpin(small_id(key)),
                    Op::Remove(key) => table.remove(small_id(key)).map(|_| ()),
                };

                let total: u64 = table.entries().map(|e| e.size).sum();
                let pinned: u64 = table
                    .entries()
                    .filter(|e| e.is_pinned())
                    .map(|e| e.size)
                    .sum();
                assert_eq!(table.total_size(), total);
                assert_eq!(table.pinned_size(), pinned);
                assert_eq!(table.entries().count(), table.len());
            }
        }

        /// Candidates never include pinned entries, follow the
        /// eviction order, and stop as soon as they cover the target.
        #[test]
        fn test_candidate_oracle(sizes in vec((1..100u64, any::<bool>()), 0..20usize),
                                 target in 0..1000u64) {
            let mut table = EntryTable::new(VolatilePolicy::Lru);

            for (i, (size, pinned)) in sizes.iter().enumerate() {
                let key = ContentId::new([i as u8; 20]);
                table.insert(key, *size, false).expect("keys are distinct");
                if *pinned {
                    table.pin(key).expect("entry exists");
                }
            }

            let candidates = table.select_eviction_candidates(target);
            let expected: Vec<_> = table.entries().filter(|e| !e.is_pinned()).collect();

            assert_eq!(&candidates.ids[..],
                       &expected.iter().map(|e| e.id).collect::<Vec<_>>()[0..candidates.ids.len()]);
            assert_eq!(candidates.sufficient, candidates.bytes >= target);
            if let Some(last) = candidates.ids.last() {
                let size = table.get(last).expect("candidate exists").size;
                assert!(candidates.bytes - size < target);
            }
        }
    }
}
