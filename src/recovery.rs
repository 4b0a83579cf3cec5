//! Recovery rebuilds the entry table from what is physically present
//! in the cache directory.  There is deliberately no persisted index:
//! after a crash of the authority (or of a client mid-publish), the
//! directory is the only thing we can trust.
//!
//! Every object found is adopted with its on-disk size, no pins, and
//! the regular (non-volatile) class.  When timestamps are requested,
//! recency follows the later of each file's mtime and atime (publishing
//! bumps the former, touching the latter); otherwise objects enter the
//! table in identifier order, which is arbitrary but stable.
use filetime::FileTime;
use std::io::ErrorKind;
use std::io::Result;
use std::path::Path;

use crate::cache_dir::CacheDir;
use crate::content_id::ContentId;
use crate::entry_table::EntryTable;
use crate::entry_table::VolatilePolicy;

/// A `FoundObject` is what we know about one object file on disk.
#[derive(Clone, Copy, Debug)]
struct FoundObject {
    id: ContentId,
    size: u64,
    last_used: FileTime,
}

/// Summary of a recovery scan.
#[derive(Debug)]
pub struct Recovered {
    pub table: EntryTable,
    /// Files under shard directories that do not name an object.
    pub strays: usize,
}

/// Uppercase shard names are scanned too, so that their files are
/// reported as strays rather than silently skipped.
fn is_shard_name(name: &str) -> bool {
    name.len() == 2 && name.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Lists the objects in one shard directory.  Files that vanish while
/// we scan are skipped; anything unparseable is counted as a stray.
fn collect_shard(shard_dir: &Path, shard: &str, found: &mut Vec<FoundObject>) -> Result<usize> {
    let mut strays = 0;

    for maybe_entry in std::fs::read_dir(shard_dir)? {
        let entry = match maybe_entry {
            Ok(entry) => entry,
            Err(_) => continue,
        };

        let meta = match entry.metadata() {
            Ok(meta) => meta,
            Err(e) if e.kind() == ErrorKind::NotFound => continue,
            err => err?,
        };

        let id = entry
            .file_name()
            .to_str()
            .and_then(|name| ContentId::from_shard_entry(shard, name));
        let id = match id {
            Some(id) if meta.is_file() => id,
            _ => {
                tracing::warn!(path = %entry.path().display(), "ignoring stray file in cache directory");
                strays += 1;
                continue;
            }
        };

        let mtime = FileTime::from_last_modification_time(&meta);
        let atime = FileTime::from_last_access_time(&meta);
        found.push(FoundObject {
            id,
            size: meta.len(),
            last_used: mtime.max(atime),
        });
    }

    Ok(strays)
}

/// Scans `dir` and returns a fresh table for what it holds.
pub fn rebuild(dir: &CacheDir, policy: VolatilePolicy, use_timestamps: bool) -> Result<Recovered> {
    let mut found = Vec::new();
    let mut strays = 0;

    for maybe_entry in std::fs::read_dir(dir.base_dir())? {
        let entry = match maybe_entry {
            Ok(entry) => entry,
            Err(_) => continue,
        };

        let name = entry.file_name();
        let shard = match name.to_str() {
            Some(shard) if is_shard_name(shard) => shard,
            _ => continue,
        };

        match entry.file_type() {
            Ok(kind) if kind.is_dir() => {}
            _ => continue,
        }

        strays += collect_shard(&entry.path(), shard, &mut found)?;
    }

    if use_timestamps {
        found.sort_by_key(|obj| (obj.last_used, obj.id));
    } else {
        found.sort_by_key(|obj| obj.id);
    }

    let mut table = EntryTable::new(policy);
    for obj in found {
        if let Err(e) = table.insert(obj.id, obj.size, false) {
            tracing::warn!(id = %obj.id, %e, "duplicate object in cache directory");
            strays += 1;
        }
    }

    tracing::info!(
        objects = table.len(),
        bytes = table.total_size(),
        strays,
        "rebuilt cache table from disk"
    );
    Ok(Recovered { table, strays })
}

#[cfg(test)]
fn place(dir: &CacheDir, name: &str, size: usize, age_secs: i64) -> ContentId {
    let id = ContentId::of(name.as_bytes());
    let path = dir.object_path(&id);

    std::fs::create_dir_all(path.parent().expect("objects live in shards"))
        .expect("mkdir must succeed");
    std::fs::write(&path, vec![1u8; size]).expect("write must succeed");

    let stamp = FileTime::from_unix_time(1_600_000_000 - age_secs, 0);
    filetime::set_file_times(&path, stamp, stamp).expect("set_file_times must succeed");
    id
}

/// Simulated crash: only the files remain.  The rebuilt table must
/// account for exactly what is on disk.
#[test]
fn test_rebuild_sizes() {
    use test_dir::{DirBuilder, TestDir};

    let temp = TestDir::temp();
    let dir = CacheDir::open(temp.path("cache")).expect("open must succeed");

    place(&dir, "a", 100, 0);
    place(&dir, "b", 250, 0);
    place(&dir, "c", 1, 0);

    let recovered = rebuild(&dir, VolatilePolicy::default(), true).expect("rebuild must succeed");
    assert_eq!(recovered.table.len(), 3);
    assert_eq!(recovered.table.total_size(), 351);
    assert_eq!(recovered.table.pinned_size(), 0);
    assert_eq!(recovered.strays, 0);
}

/// Older objects come first in the eviction order.
#[test]
fn test_rebuild_order() {
    use test_dir::{DirBuilder, TestDir};

    let temp = TestDir::temp();
    let dir = CacheDir::open(temp.path("cache")).expect("open must succeed");

    let newest = place(&dir, "newest", 1, 10);
    let oldest = place(&dir, "oldest", 1, 300);
    let middle = place(&dir, "middle", 1, 100);

    let recovered = rebuild(&dir, VolatilePolicy::default(), true).expect("rebuild must succeed");
    let order: Vec<_> = recovered.table.entries().map(|e| e.id).collect();
    assert_eq!(order, vec![oldest, middle, newest]);

    // Without timestamps, we get identifier order.
    let recovered = rebuild(&dir, VolatilePolicy::default(), false).expect("rebuild must succeed");
    let order: Vec<_> = recovered.table.entries().map(|e| e.id).collect();
    let mut sorted = vec![oldest, middle, newest];
    sorted.sort();
    assert_eq!(order, sorted);
}

/// Staged files, top-level files, and junk in shards are not objects.
#[test]
fn test_rebuild_ignores_junk() {
    use test_dir::{DirBuilder, FileType, TestDir};

    let temp = TestDir::temp()
        .create("cache", FileType::Dir)
        .create("cache/txn", FileType::Dir)
        .create("cache/ab", FileType::Dir)
        .create("cache/zz", FileType::Dir)
        .create("cache/txn/half_written", FileType::ZeroFile(10))
        .create("cache/cachemgr.socket", FileType::ZeroFile(0))
        .create("cache/ab/not-an-id", FileType::ZeroFile(10))
        .create("cache/zz/0000", FileType::ZeroFile(10));
    let dir = CacheDir::open(temp.path("cache")).expect("open must succeed");

    place(&dir, "a", 7, 0);

    let recovered = rebuild(&dir, VolatilePolicy::default(), true).expect("rebuild must succeed");
    assert_eq!(recovered.table.len(), 1);
    assert_eq!(recovered.table.total_size(), 7);
    assert_eq!(recovered.strays, 1);
}

/// Only the lowercase spelling of an id is an object: anything else
/// would be tracked under a path that eviction never unlinks.
#[test]
fn test_rebuild_rejects_uppercase_names() {
    use test_dir::{DirBuilder, TestDir};

    let temp = TestDir::temp();
    let dir = CacheDir::open(temp.path("cache")).expect("open must succeed");

    let hex = ContentId::of(b"upper").to_hex().to_uppercase();
    let upper_shard = dir.base_dir().join(&hex[0..2]);
    std::fs::create_dir_all(&upper_shard).expect("mkdir must succeed");
    std::fs::write(upper_shard.join(&hex[2..]), vec![1u8; 100]).expect("write must succeed");

    let lower = ContentId::of(b"lower");
    let mixed_path = dir.object_path(&lower).with_file_name(lower.to_hex()[2..].to_uppercase());
    std::fs::create_dir_all(mixed_path.parent().expect("objects live in shards"))
        .expect("mkdir must succeed");
    std::fs::write(&mixed_path, vec![1u8; 10]).expect("write must succeed");

    let recovered = rebuild(&dir, VolatilePolicy::default(), true).expect("rebuild must succeed");
    assert!(recovered.table.is_empty());
    assert_eq!(recovered.table.total_size(), 0);
    assert_eq!(recovered.strays, 2);
    // Strays are left alone.
    assert!(upper_shard.join(&hex[2..]).exists());
    assert!(mixed_path.exists());
}
