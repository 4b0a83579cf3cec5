//! The `CacheDir` owns the physical layout of the shared cache
//! directory.  Objects live at `<base>/<2 hex digits>/<38 hex digits>`;
//! clients write new objects under the `txn` staging subdirectory and
//! ask the quota manager to publish them.
//!
//! File timestamps double as persistent recency hints: publishing an
//! object bumps its mtime, and touching it bumps its atime, so a later
//! recovery scan can rebuild a sensible LRU order.  Nothing here
//! touches the entry table; the manager pairs the two.
use filetime::FileTime;
use std::fs::File;
use std::fs::OpenOptions;
use std::io::Error;
use std::io::ErrorKind;
use std::io::Result;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;
use std::time::SystemTime;
use tempfile::NamedTempFile;

use crate::content_id::ContentId;
use crate::error::is_absent_file_error;

/// Clients stage new objects in this subdirectory of the cache.
pub const STAGING_SUBDIR: &str = "txn";

/// The quota manager holds an exclusive `flock` on this file.
pub const LOCK_FILE_NAME: &str = "cachemgr.lock";

#[derive(Clone, Debug)]
pub struct CacheDir {
    base: PathBuf,
    staging: PathBuf,
}

/// Removes a file if it exists.
fn ensure_file_removed(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if is_absent_file_error(&e) => Ok(()),
        err => err,
    }
}

/// Marks the file at `path` as read-only.
fn set_read_only(path: &Path) -> Result<()> {
    let mut permissions = std::fs::symlink_metadata(path)?.permissions();

    permissions.set_readonly(true);
    std::fs::set_permissions(path, permissions)
}

impl CacheDir {
    /// Opens the cache directory at `base`, creating it and its
    /// staging subdirectory if necessary.
    pub fn open(base: impl AsRef<Path>) -> Result<CacheDir> {
        let base = base.as_ref().to_owned();
        let staging = base.join(STAGING_SUBDIR);

        std::fs::create_dir_all(&staging)?;
        Ok(CacheDir { base, staging })
    }

    /// Takes the exclusive lock on the cache directory.  The lock
    /// lasts as long as the returned file stays open; a second caller
    /// gets `WouldBlock` until then.
    pub fn lock(&self) -> Result<File> {
        let path = self.base.join(LOCK_FILE_NAME);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&path)?;

        // SAFETY: `file` owns a valid descriptor for the call's duration.
        if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) } != 0 {
            let e = Error::last_os_error();
            if e.kind() == ErrorKind::WouldBlock {
                return Err(Error::new(
                    ErrorKind::WouldBlock,
                    format!("another quota manager owns {}", self.base.display()),
                ));
            }

            return Err(e);
        }

        Ok(file)
    }

    pub fn base_dir(&self) -> &Path {
        &self.base
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging
    }

    pub fn object_path(&self, id: &ContentId) -> PathBuf {
        id.object_path(&self.base)
    }

    /// Returns a fresh private temporary file in the staging area.
    pub fn stage(&self) -> Result<NamedTempFile> {
        NamedTempFile::new_in(&self.staging)
    }

    /// Returns the size of the object for `id`, or `NotFound` if it is
    /// not on disk.
    pub fn object_size(&self, id: &ContentId) -> Result<u64> {
        let meta = std::fs::symlink_metadata(self.object_path(id))?;

        if !meta.is_file() {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!("object {} is not a regular file", id),
            ));
        }

        Ok(meta.len())
    }

    /// Consumes the staged file at `staged` and publishes it as the
    /// object for `id`.  The rename is atomic; the published file is
    /// read-only and sits at the recent end of the on-disk order.
    ///
    /// Only files directly under the staging directory are accepted.
    pub fn publish(&self, staged: &Path, id: &ContentId) -> Result<()> {
        let parent = staged
            .parent()
            .map(std::fs::canonicalize)
            .transpose()?;
        if parent != Some(std::fs::canonicalize(&self.staging)?) {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                format!("{} is not in the staging area", staged.display()),
            ));
        }

        let dst = self.object_path(id);
        if let Some(shard) = dst.parent() {
            std::fs::create_dir_all(shard)?;
        }

        // Bump the mtime before publishing: readers that come in right
        // away should find the object already marked as new.
        filetime::set_file_mtime(staged, FileTime::now())?;
        set_read_only(staged)?;
        std::fs::rename(staged, &dst)
    }

    /// Deletes a staged file that will never be published.
    pub fn discard(&self, staged: &Path) -> Result<()> {
        ensure_file_removed(staged)
    }

    /// Moves the object to the recent end of the on-disk order.
    pub fn mark_inserted(&self, id: &ContentId) -> Result<()> {
        filetime::set_file_mtime(self.object_path(id), FileTime::now())
    }

    /// Records an access to the object.  Returns false if the object
    /// is not on disk anymore.
    pub fn mark_accessed(&self, id: &ContentId) -> Result<bool> {
        match filetime::set_file_atime(self.object_path(id), FileTime::now()) {
            Ok(()) => Ok(true),
            Err(e) if is_absent_file_error(&e) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Unlinks the object for `id`.  Succeeds if it is already gone.
    pub fn remove(&self, id: &ContentId) -> Result<()> {
        ensure_file_removed(&self.object_path(id))
    }

    /// Deletes staged files with mtime older than `max_age`: they were
    /// left behind by clients that died before publishing.
    ///
    /// Returns the number of files deleted.
    pub fn cleanup_staging(&self, max_age: Duration) -> Result<usize> {
        let threshold = match SystemTime::now().checked_sub(max_age) {
            Some(time) => time,
            None => return Ok(0),
        };

        let mut deleted = 0;
        let mut temp = self.staging.clone();
        for dirent in std::fs::read_dir(&self.staging)?.flatten() {
            let mut handle = || -> Result<bool> {
                let mtime = dirent.metadata()?.modified()?;

                if mtime >= threshold {
                    return Ok(false);
                }

                temp.push(dirent.file_name());
                let ret = ensure_file_removed(&temp);
                temp.pop();

                ret.map(|_| true)
            };

            if let Ok(true) = handle() {
                deleted += 1;
            }
        }

        Ok(deleted)
    }
}

#[cfg(test)]
fn write_staged(dir: &CacheDir, payload: &[u8]) -> PathBuf {
    use std::io::Write;

    let mut tmp = dir.stage().expect("stage must succeed");
    tmp.write_all(payload).expect("write must succeed");
    tmp.into_temp_path().keep().expect("keep must succeed")
}

#[test]
fn test_publish() {
    use test_dir::{DirBuilder, TestDir};

    let temp = TestDir::temp();
    let dir = CacheDir::open(temp.path("cache")).expect("open must succeed");
    let id = ContentId::of(b"payload");

    let staged = write_staged(&dir, b"payload");
    dir.publish(&staged, &id).expect("publish must succeed");

    // The staged file is consumed.
    assert!(matches!(std::fs::metadata(&staged),
                     Err(e) if e.kind() == ErrorKind::NotFound));
    assert_eq!(
        std::fs::read(dir.object_path(&id)).expect("read must succeed"),
        b"payload"
    );
    assert_eq!(dir.object_size(&id).expect("object must exist"), 7);
    assert!(std::fs::metadata(dir.object_path(&id))
        .expect("metadata must succeed")
        .permissions()
        .readonly());
}

#[test]
fn test_publish_outside_staging() {
    use test_dir::{DirBuilder, FileType, TestDir};

    let temp = TestDir::temp().create("elsewhere", FileType::RandomFile(10));
    let dir = CacheDir::open(temp.path("cache")).expect("open must succeed");
    let id = ContentId::of(b"x");

    let err = dir
        .publish(&temp.path("elsewhere"), &id)
        .expect_err("must reject files outside txn");
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
    // The file must stay where it was.
    assert!(std::fs::metadata(temp.path("elsewhere")).is_ok());
}

#[test]
fn test_lock_is_exclusive() {
    use test_dir::{DirBuilder, TestDir};

    let temp = TestDir::temp();
    let dir = CacheDir::open(temp.path("cache")).expect("open must succeed");
    let other = CacheDir::open(temp.path("cache")).expect("open must succeed");

    let held = dir.lock().expect("first lock must succeed");
    assert!(matches!(other.lock(), Err(e) if e.kind() == ErrorKind::WouldBlock));

    drop(held);
    other.lock().expect("lock must succeed once released");
}

#[test]
fn test_remove() {
    use test_dir::{DirBuilder, TestDir};

    let temp = TestDir::temp();
    let dir = CacheDir::open(temp.path("cache")).expect("open must succeed");
    let id = ContentId::of(b"payload");

    let staged = write_staged(&dir, b"payload");
    dir.publish(&staged, &id).expect("publish must succeed");

    dir.remove(&id).expect("remove must succeed");
    assert!(matches!(dir.object_size(&id),
                     Err(e) if e.kind() == ErrorKind::NotFound));

    // Removing an absent object is fine.
    dir.remove(&id).expect("remove must succeed");
    assert!(!dir.mark_accessed(&id).expect("must succeed on missing objects"));
}

#[test]
fn test_cleanup_staging() {
    use test_dir::{DirBuilder, TestDir};

    let temp = TestDir::temp();
    let dir = CacheDir::open(temp.path("cache")).expect("open must succeed");

    let old = write_staged(&dir, b"old");
    filetime::set_file_mtime(&old, FileTime::from_unix_time(1_000_000, 0))
        .expect("set_file_mtime must succeed");
    let fresh = write_staged(&dir, b"fresh");

    assert_eq!(
        dir.cleanup_staging(Duration::from_secs(3600))
            .expect("cleanup must succeed"),
        1
    );
    assert!(std::fs::metadata(&old).is_err());
    assert!(std::fs::metadata(&fresh).is_ok());
}
