//! Every failure the quota manager reports to a client is a
//! [`QuotaError`].  Errors for one command never stop the authority;
//! they travel back to the issuing client (or to the log, for
//! fire-and-forget commands).
use std::io::Error;
use std::io::ErrorKind;

use thiserror::Error;

use crate::content_id::ContentId;

pub type Result<T, E = QuotaError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum QuotaError {
    #[error("no cache entry for {0}")]
    NotFound(ContentId),

    #[error("cache entry {0} already exists")]
    AlreadyExists(ContentId),

    #[error("cache entry {0} is not pinned")]
    NotPinned(ContentId),

    /// Eviction could not reach the low-water mark because everything
    /// left is pinned.  The manager keeps serving with the limit
    /// violated.
    #[error("cache holds {total} bytes over a {limit} byte limit, {pinned} bytes pinned")]
    QuotaExceededPinned { total: u64, limit: u64, pinned: u64 },

    #[error("cleanup threshold {threshold} exceeds limit {limit}")]
    InvalidLimits { limit: u64, threshold: u64 },

    #[error("I/O error in cache directory: {0}")]
    Io(#[from] Error),

    /// The client could not talk to the authority.  Fatal to the
    /// client's operation, never to the authority.
    #[error("cannot reach quota manager: {0}")]
    ChannelFailure(String),

    #[error("malformed frame: {0}")]
    Protocol(String),

    #[error("invalid argument: {0}")]
    InvalidPayload(String),
}

impl QuotaError {
    /// Returns whether the error is the soft "everything left is
    /// pinned" warning rather than a hard failure.
    pub fn is_soft(&self) -> bool {
        matches!(self, QuotaError::QuotaExceededPinned { .. })
    }
}

/// Checks whether the error is for a missing file: NotFound, or a
/// stale NFS handle.  Both mean the object is gone, which is what an
/// unlink wanted anyway.
pub fn is_absent_file_error(error: &Error) -> bool {
    if error.kind() == ErrorKind::NotFound {
        true
    } else if let Some(errno) = error.raw_os_error() {
        errno == libc::ESTALE
    } else {
        false
    }
}

/// Checks whether a write to a backchannel failed because nobody is
/// listening anymore, or because the listener stopped draining its
/// end.  Either way, the subscriber is as good as dead.
pub fn is_dead_endpoint_error(error: &Error) -> bool {
    match error.kind() {
        ErrorKind::BrokenPipe | ErrorKind::WouldBlock => true,
        _ => matches!(error.raw_os_error(), Some(errno) if errno == libc::ENXIO),
    }
}

#[test]
fn test_absent_file_errors() {
    assert!(is_absent_file_error(&Error::new(
        ErrorKind::NotFound,
        "not found"
    )));
    assert!(!is_absent_file_error(&Error::new(
        ErrorKind::PermissionDenied,
        "bad"
    )));

    assert!(is_absent_file_error(&Error::from_raw_os_error(libc::ENOENT)));
    assert!(is_absent_file_error(&Error::from_raw_os_error(libc::ESTALE)));
    assert!(!is_absent_file_error(&Error::from_raw_os_error(libc::EIO)));
}

#[test]
fn test_dead_endpoint_errors() {
    assert!(is_dead_endpoint_error(&Error::from_raw_os_error(libc::EPIPE)));
    assert!(is_dead_endpoint_error(&Error::from_raw_os_error(libc::EAGAIN)));
    assert!(is_dead_endpoint_error(&Error::from_raw_os_error(libc::ENXIO)));
    assert!(!is_dead_endpoint_error(&Error::from_raw_os_error(libc::EACCES)));
}

#[test]
fn test_soft_errors() {
    let id = ContentId::of(b"x");

    assert!(QuotaError::QuotaExceededPinned {
        total: 2,
        limit: 1,
        pinned: 2
    }
    .is_soft());
    assert!(!QuotaError::NotFound(id).is_soft());
}
