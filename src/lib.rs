//! A quota manager for a content-addressed disk cache shared by many
//! client processes.  Exactly one authority owns the bookkeeping for
//! a cache directory: which objects exist, how large they are, how
//! recently each was used, and which are pinned.  Clients never
//! modify that state directly; they send commands, and the authority
//! applies them one at a time, in arrival order, evicting
//! least-recently-used objects whenever the cache grows past its
//! limit.
//!
//! Serialising everything through one authority is what makes the
//! rest simple.  There are no locks on the cache state, no
//! per-shard statistics files, and no chance for two processes to
//! both decide to evict the same object (or both decide there is room
//! for one more).  The price is a round-trip per synchronous command,
//! which is why the highest-volume command, `touch`, is
//! fire-and-forget.
//!
//! Eviction is batched: when the total size exceeds the limit, the
//! authority evicts down to `limit - threshold` bytes in a single
//! pass, so a cache running at capacity does not pay for an eviction
//! on every insert.  Pinned objects are never evicted.  When pinned
//! objects alone keep the cache above its target, the pass reports a
//! [`QuotaError::QuotaExceededPinned`] warning in its [`Outcome`] and
//! asks every backchannel subscriber to release what pins it can
//! (with the [`RELEASE_PINS_MESSAGE`] broadcast).  The cache is then
//! allowed to stay over quota until pins go away.
//!
//! The on-disk state is the source of truth.  The authority persists
//! no index; on startup, [`QuotaManager::create`] rebuilds the table
//! by scanning the cache directory, so crashing the authority (or a
//! client in the middle of publishing an object) never loses more
//! than recency information.
//!
//! # Sample usage
//!
//! A process that owns the cache directory spawns the authority, and
//! talks to it in-process:
//!
//! ```no_run
//! # fn main() -> cache_quota::Result<()> {
//! use cache_quota::CacheDir;
//! use cache_quota::ContentId;
//! use cache_quota::QuotaManager;
//! use std::io::Write;
//!
//! const MB: u64 = 1024 * 1024;
//!
//! let manager = QuotaManager::create("/tmp/cache", 100 * MB, 20 * MB, true)?.spawn()?;
//! let mut client = manager.client();
//!
//! // Write the object to the staging area, then let the authority
//! // publish and account for it.
//! let contents = b"hello";
//! let id = ContentId::of(contents);
//! let mut staged = CacheDir::open("/tmp/cache")?.stage()?;
//! staged.write_all(contents)?;
//!
//! let outcome = client.publish(id, staged.into_temp_path(), false)?;
//! if let Some(warning) = outcome.warning() {
//!     eprintln!("cache over quota: {}", warning);
//! }
//!
//! // Keep the object around while we use it.
//! client.pin(id)?;
//! client.touch(id)?;
//! client.unpin(id)?;
//! # Ok(())
//! # }
//! ```
//!
//! Other processes connect to the authority's socket, and may
//! subscribe to broadcasts with a [`Backchannel`]:
//!
//! ```no_run
//! # fn main() -> cache_quota::Result<()> {
//! use cache_quota::Backchannel;
//! use cache_quota::RemoteClient;
//! use std::time::Duration;
//!
//! let mut client = RemoteClient::connect("/tmp/cache/cachemgr.socket")?;
//! let mut channel = Backchannel::create("/tmp/cache", "my-process")?;
//! client.register_backchannel(&channel)?;
//!
//! if let Some(message) = channel.recv_timeout(Duration::from_secs(1))? {
//!     println!("got {} bytes from the quota manager", message.len());
//! }
//!
//! println!("{:?}", client.usage()?);
//! # Ok(())
//! # }
//! ```
//!
//! # Cache directory structure
//!
//! Each object lives at `$CACHE/ab/cdef...`, where `abcdef...` is the
//! lowercase hex rendering of its 20-byte content identifier.  Objects
//! are written in `$CACHE/txn`, and atomically renamed into place once
//! complete and read-only; anything in `txn` is invisible to the
//! quota manager, and abandoned staged files are eventually swept.
//!
//! The authority holds an exclusive `flock` on `$CACHE/cachemgr.lock`
//! for as long as it runs, listens on `$CACHE/cachemgr.socket` by
//! default, and backchannel FIFOs are created wherever their subscribers like
//! (usually next to the socket).
//!
//! File modification times record when an object was published, and
//! access times when it was last touched; recovery uses the later of
//! the two to reconstruct the eviction order.  Nothing else about the
//! bookkeeping touches the disk.
mod backchannel;
mod cache_dir;
mod client;
mod content_id;
pub mod entry_table;
mod error;
pub mod eviction;
mod manager;
pub mod protocol;
mod recovery;
mod server;
mod trigger;

pub use backchannel::check_payload;
pub use backchannel::Backchannel;
pub use backchannel::MAX_BROADCAST_LEN;
pub use cache_dir::CacheDir;
pub use cache_dir::STAGING_SUBDIR;
pub use client::Client;
pub use client::LocalClient;
pub use client::LocalTransport;
pub use client::RemoteClient;
pub use client::SocketTransport;
pub use client::Transport;
pub use content_id::ContentId;
pub use content_id::CONTENT_ID_LEN;
pub use entry_table::CacheEntry;
pub use entry_table::VolatilePolicy;
pub use error::QuotaError;
pub use error::Result;
pub use manager::QuotaConfig;
pub use manager::QuotaManager;
pub use manager::QuotaManagerHandle;
pub use manager::State;
pub use manager::DEFAULT_SOCKET_NAME;
pub use manager::RELEASE_PINS_MESSAGE;
pub use protocol::Outcome;
pub use protocol::Usage;
