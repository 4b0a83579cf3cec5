//! The eviction policy decides how much to reclaim and drives the
//! reclaim loop.  Once the cache grows past its limit, we evict down
//! to the low-water mark (`limit - threshold`) rather than to the
//! limit itself, so a cache hovering at capacity does not evict on
//! every insert.
//!
//! Victims are unlinked before their table entry goes away: a crash
//! mid-pass leaves at most an untracked file, which the next recovery
//! scan adopts, never a tracked entry without its file.
use std::collections::VecDeque;
use std::time::Duration;
use std::time::Instant;

use crate::cache_dir::CacheDir;
use crate::content_id::ContentId;
use crate::entry_table::EntryTable;
use crate::error::QuotaError;
use crate::error::Result;

/// Remember at most this many eviction passes for rate queries.
const MAX_HISTORY: usize = 1024;

/// The size limit and the cleanup threshold.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Limits {
    limit: u64,
    threshold: u64,
}

impl Limits {
    /// Returns limits for a cache of at most `limit` bytes that evicts
    /// down to `limit - threshold` bytes.
    pub fn new(limit: u64, threshold: u64) -> Result<Limits> {
        if threshold > limit {
            return Err(QuotaError::InvalidLimits { limit, threshold });
        }

        Ok(Limits { limit, threshold })
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    pub fn low_water_mark(&self) -> u64 {
        self.limit - self.threshold
    }

    #[inline]
    pub fn needs_eviction(&self, total: u64) -> bool {
        total > self.limit
    }
}

/// The state of a cache that could not be brought down to its target
/// because everything left is pinned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Overflow {
    pub total: u64,
    pub limit: u64,
    pub pinned: u64,
}

impl From<Overflow> for QuotaError {
    fn from(overflow: Overflow) -> QuotaError {
        QuotaError::QuotaExceededPinned {
            total: overflow.total,
            limit: overflow.limit,
            pinned: overflow.pinned,
        }
    }
}

/// What an eviction pass did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Reclaim {
    pub evicted: Vec<ContentId>,
    pub freed: u64,
    pub overflow: Option<Overflow>,
}

/// Evicts entries until the table's total size is at most `target`.
/// `limit` is only used to describe an overflow.
pub fn reclaim(table: &mut EntryTable, dir: &CacheDir, target: u64, limit: u64) -> Reclaim {
    let mut ret = Reclaim::default();
    let total = table.total_size();

    if total <= target {
        return ret;
    }

    let candidates = table.select_eviction_candidates(total - target);
    for id in candidates.ids {
        if let Err(e) = dir.remove(&id) {
            // A tracked entry without its file is worse than an
            // untracked file: drop the entry regardless.
            tracing::warn!(%id, %e, "failed to unlink evicted object");
        }

        match table.remove(id) {
            Ok(size) => {
                ret.freed += size;
                ret.evicted.push(id);
            }
            Err(e) => tracing::warn!(%id, %e, "eviction candidate vanished from table"),
        }
    }

    if !candidates.sufficient {
        ret.overflow = Some(Overflow {
            total: table.total_size(),
            limit,
            pinned: table.pinned_size(),
        });
    }

    tracing::info!(
        evicted = ret.evicted.len(),
        freed = ret.freed,
        remaining = table.total_size(),
        target,
        "eviction pass complete"
    );
    ret
}

/// Runs an eviction pass down to the low-water mark if the table
/// exceeds `limits`.
pub fn enforce(table: &mut EntryTable, dir: &CacheDir, limits: &Limits) -> Option<Reclaim> {
    if !limits.needs_eviction(table.total_size()) {
        return None;
    }

    Some(reclaim(table, dir, limits.low_water_mark(), limits.limit()))
}

/// Timestamps of recent eviction passes.
#[derive(Clone, Debug, Default)]
pub struct CleanupHistory {
    passes: VecDeque<Instant>,
}

impl CleanupHistory {
    pub fn record(&mut self) {
        if self.passes.len() == MAX_HISTORY {
            self.passes.pop_front();
        }

        self.passes.push_back(Instant::now());
    }

    /// Returns the number of recorded passes in the last `period`.
    pub fn count_since(&self, period: Duration) -> u64 {
        let now = Instant::now();

        self.passes
            .iter()
            .rev()
            .take_while(|at| now.duration_since(**at) <= period)
            .count() as u64
    }
}

#[cfg(test)]
fn populate(dir: &CacheDir, table: &mut EntryTable, name: &str, size: usize) -> ContentId {
    use std::io::Write;

    let id = ContentId::of(name.as_bytes());
    let mut tmp = dir.stage().expect("stage must succeed");
    tmp.write_all(&vec![0u8; size]).expect("write must succeed");
    let staged = tmp.into_temp_path().keep().expect("keep must succeed");

    dir.publish(&staged, &id).expect("publish must succeed");
    table
        .insert(id, size as u64, false)
        .expect("insert must succeed");
    id
}

#[test]
fn test_limits() {
    let limits = Limits::new(10, 2).expect("valid limits");

    assert_eq!(limits.low_water_mark(), 8);
    assert!(!limits.needs_eviction(10));
    assert!(limits.needs_eviction(11));

    assert!(matches!(
        Limits::new(1, 2),
        Err(QuotaError::InvalidLimits {
            limit: 1,
            threshold: 2
        })
    ));
}

/// Evict the oldest entry, and unlink its file.
#[test]
fn test_enforce() {
    use crate::entry_table::VolatilePolicy;
    use test_dir::{DirBuilder, TestDir};

    let temp = TestDir::temp();
    let dir = CacheDir::open(temp.path("cache")).expect("open must succeed");
    let mut table = EntryTable::new(VolatilePolicy::Lru);
    let limits = Limits::new(10, 2).expect("valid limits");

    let a = populate(&dir, &mut table, "a", 4);
    let b = populate(&dir, &mut table, "b", 4);
    assert!(enforce(&mut table, &dir, &limits).is_none());

    let c = populate(&dir, &mut table, "c", 4);
    let result = enforce(&mut table, &dir, &limits).expect("must evict");

    assert_eq!(result.evicted, vec![a]);
    assert_eq!(result.freed, 4);
    assert_eq!(result.overflow, None);
    assert_eq!(table.total_size(), 8);
    assert!(dir.object_size(&a).is_err());
    assert!(dir.object_size(&b).is_ok());
    assert!(dir.object_size(&c).is_ok());
}

/// Pinned entries stay put, and the shortfall is reported.
#[test]
fn test_overflow_when_pinned() {
    use crate::entry_table::VolatilePolicy;
    use test_dir::{DirBuilder, TestDir};

    let temp = TestDir::temp();
    let dir = CacheDir::open(temp.path("cache")).expect("open must succeed");
    let mut table = EntryTable::new(VolatilePolicy::Lru);

    let a = populate(&dir, &mut table, "a", 6);
    let b = populate(&dir, &mut table, "b", 6);
    table.pin(a).expect("pin must succeed");

    let result = reclaim(&mut table, &dir, 4, 10);
    assert_eq!(result.evicted, vec![b]);
    assert_eq!(
        result.overflow,
        Some(Overflow {
            total: 6,
            limit: 10,
            pinned: 6
        })
    );
    assert!(dir.object_size(&a).is_ok());
}

/// An object that already vanished from disk is still dropped from
/// the table.
#[test]
fn test_evict_missing_file() {
    use crate::entry_table::VolatilePolicy;
    use test_dir::{DirBuilder, TestDir};

    let temp = TestDir::temp();
    let dir = CacheDir::open(temp.path("cache")).expect("open must succeed");
    let mut table = EntryTable::new(VolatilePolicy::Lru);

    let a = populate(&dir, &mut table, "a", 6);
    dir.remove(&a).expect("remove must succeed");

    let result = reclaim(&mut table, &dir, 0, 0);
    assert_eq!(result.evicted, vec![a]);
    assert!(table.is_empty());
}

#[test]
fn test_history() {
    let mut history = CleanupHistory::default();

    assert_eq!(history.count_since(Duration::from_secs(60)), 0);
    history.record();
    history.record();
    assert_eq!(history.count_since(Duration::from_secs(60)), 2);
}
