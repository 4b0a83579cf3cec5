//! The quota manager is the single authority over a shared cache
//! directory.  It owns the entry table, the limits, and the
//! backchannel registry, and applies commands strictly one at a time:
//! every command, including the eviction pass it may trigger, runs to
//! completion before the next one is dequeued.  That total order is
//! the only synchronisation clients ever need.
//!
//! A manager goes through `Uninitialized -> Recovering -> Serving` in
//! [`QuotaManager::create`], then [`QuotaManager::spawn`] moves it to
//! a dedicated authority thread fed by a single-consumer queue, with a
//! Unix socket listener forwarding remote commands into that queue.
//! Dropping the [`QuotaManagerHandle`] stops the listener, switches to
//! `ShuttingDown`, drains whatever is already queued, and exits.
//!
//! Only one manager may own a cache directory: `create` takes an
//! exclusive lock on it before looking at anything, and fails if
//! another manager holds it.
//!
//! The manager never restarts itself.  After a crash, the next
//! `create` rebuilds everything from the cache directory.
use derivative::Derivative;
use std::fs::File;
use std::path::Path;
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::mpsc::Receiver;
use std::sync::mpsc::Sender;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::backchannel;
use crate::backchannel::Registry;
use crate::cache_dir::CacheDir;
use crate::client::LocalClient;
use crate::client::LocalTransport;
use crate::entry_table::EntryTable;
use crate::entry_table::VolatilePolicy;
use crate::error::QuotaError;
use crate::error::Result;
use crate::eviction;
use crate::eviction::CleanupHistory;
use crate::eviction::Limits;
use crate::eviction::Overflow;
use crate::protocol::Command;
use crate::protocol::Outcome;
use crate::protocol::Reply;
use crate::protocol::Usage;
use crate::recovery;
use crate::server;
use crate::trigger::PeriodicTrigger;

/// The authority listens on this socket in the cache directory.
pub const DEFAULT_SOCKET_NAME: &str = "cachemgr.socket";

/// Broadcast to every backchannel when eviction is blocked by pins:
/// subscribers should release whatever pins they can spare.
pub const RELEASE_PINS_MESSAGE: &[u8] = b"R";

/// Sweep the staging area roughly this often, in inserts.
const DEFAULT_SWEEP_PERIOD: u64 = 64;

/// Staged files older than this were abandoned by their writer.
const DEFAULT_MAX_STAGING_AGE: Duration = Duration::from_secs(3600);

/// Everything the bootstrap layer hands the quota manager.
#[derive(Clone, Debug)]
pub struct QuotaConfig {
    cache_dir: PathBuf,
    limit: u64,
    threshold: u64,
    rebuild: bool,
    volatile_policy: VolatilePolicy,
    socket_name: String,
    sweep_period: u64,
    max_staging_age: Duration,
}

impl QuotaConfig {
    /// Returns the configuration for a cache at `cache_dir` holding at
    /// most `limit` bytes, evicting down to `limit - threshold` bytes.
    pub fn new(cache_dir: impl AsRef<Path>, limit: u64, threshold: u64) -> QuotaConfig {
        QuotaConfig {
            cache_dir: cache_dir.as_ref().to_owned(),
            limit,
            threshold,
            rebuild: true,
            volatile_policy: VolatilePolicy::default(),
            socket_name: DEFAULT_SOCKET_NAME.to_owned(),
            sweep_period: DEFAULT_SWEEP_PERIOD,
            max_staging_age: DEFAULT_MAX_STAGING_AGE,
        }
    }

    /// When true (the default), recovery orders objects by their
    /// timestamps; otherwise by identifier.
    pub fn rebuild(mut self, rebuild: bool) -> Self {
        self.rebuild = rebuild;
        self
    }

    pub fn volatile_policy(mut self, policy: VolatilePolicy) -> Self {
        self.volatile_policy = policy;
        self
    }

    pub fn socket_name(mut self, name: &str) -> Self {
        self.socket_name = name.to_owned();
        self
    }

    pub fn sweep_period(mut self, inserts: u64) -> Self {
        self.sweep_period = inserts;
        self
    }

    pub fn max_staging_age(mut self, age: Duration) -> Self {
        self.max_staging_age = age;
        self
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn socket_path(&self) -> PathBuf {
        self.cache_dir.join(&self.socket_name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Uninitialized,
    Recovering,
    Serving,
    ShuttingDown,
}

/// Messages on the authority's queue.
#[derive(Debug)]
pub(crate) enum Envelope {
    Request {
        command: Command,
        /// Absent for fire-and-forget commands.
        reply: Option<Sender<Result<Reply>>>,
    },
    Shutdown,
}

#[derive(Derivative)]
#[derivative(Debug)]
pub struct QuotaManager {
    config: QuotaConfig,
    state: State,
    dir: CacheDir,
    limits: Limits,
    #[derivative(Debug = "ignore")]
    table: EntryTable,
    registry: Registry<File>,
    history: CleanupHistory,
    // Set while the last eviction pass left the cache over target.
    overflow: Option<Overflow>,
    sweep: PeriodicTrigger,
    // Held until the manager is dropped.
    #[derivative(Debug = "ignore")]
    _lock: File,
}

impl QuotaManager {
    /// Opens the cache at `cache_dir` and rebuilds its bookkeeping.
    /// See [`QuotaConfig::rebuild`] for `rebuild`.
    pub fn create(
        cache_dir: impl AsRef<Path>,
        limit: u64,
        threshold: u64,
        rebuild: bool,
    ) -> Result<QuotaManager> {
        QuotaManager::with_config(QuotaConfig::new(cache_dir, limit, threshold).rebuild(rebuild))
    }

    pub fn with_config(config: QuotaConfig) -> Result<QuotaManager> {
        let mut state = State::Uninitialized;
        let limits = Limits::new(config.limit, config.threshold)?;

        let dir = CacheDir::open(&config.cache_dir)?;
        let lock = dir.lock()?;

        transition(&mut state, State::Recovering);
        match dir.cleanup_staging(config.max_staging_age) {
            Ok(0) => {}
            Ok(deleted) => tracing::info!(deleted, "removed abandoned staged files"),
            Err(e) => tracing::warn!(%e, "failed to sweep staging area"),
        }

        let recovered = recovery::rebuild(&dir, config.volatile_policy, config.rebuild)?;
        let mut manager = QuotaManager {
            sweep: PeriodicTrigger::new(config.sweep_period),
            config,
            state,
            dir,
            limits,
            table: recovered.table,
            registry: Registry::new(),
            history: CleanupHistory::default(),
            overflow: None,
            _lock: lock,
        };

        // The cache may have grown past the limit while nobody was
        // watching, or the limit may have shrunk.
        manager.enforce_limits(Outcome::default());
        transition(&mut manager.state, State::Serving);
        Ok(manager)
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn config(&self) -> &QuotaConfig {
        &self.config
    }

    pub fn limits(&self) -> Limits {
        self.limits
    }

    pub fn table(&self) -> &EntryTable {
        &self.table
    }

    pub fn usage(&self) -> Usage {
        Usage {
            limit: self.limits.limit(),
            threshold: self.limits.threshold(),
            total: self.table.total_size(),
            pinned: self.table.pinned_size(),
            entries: self.table.len() as u64,
            backchannels: self.registry.len() as u64,
            overflow: self.overflow.is_some(),
        }
    }

    /// Folds an eviction pass's results into `outcome`, and tells
    /// subscribers to let go of pins if the pass came up short.
    fn absorb(&mut self, mut outcome: Outcome, reclaim: eviction::Reclaim) -> Outcome {
        self.history.record();
        outcome.evicted += reclaim.evicted.len() as u64;
        outcome.freed += reclaim.freed;
        outcome.overflow = reclaim.overflow;
        self.overflow = reclaim.overflow;

        if let Some(overflow) = reclaim.overflow {
            tracing::warn!(
                total = overflow.total,
                limit = overflow.limit,
                pinned = overflow.pinned,
                "cache over quota, remaining entries are pinned"
            );

            match self.registry.broadcast(RELEASE_PINS_MESSAGE) {
                Ok(0) => {}
                Ok(dropped) => {
                    tracing::info!(dropped, "pruned backchannels while requesting pin release")
                }
                Err(e) => tracing::error!(%e, "failed to request pin release"),
            }
        }

        outcome
    }

    /// Evicts down to the low-water mark if the cache is over its
    /// limit.
    fn enforce_limits(&mut self, outcome: Outcome) -> Outcome {
        match eviction::enforce(&mut self.table, &self.dir, &self.limits) {
            Some(reclaim) => self.absorb(outcome, reclaim),
            None => {
                self.overflow = None;
                outcome
            }
        }
    }

    fn discard_staged(&self, staged: &Path) {
        if let Err(e) = self.dir.discard(staged) {
            tracing::warn!(path = %staged.display(), %e, "failed to delete staged file");
        }
    }

    fn maybe_sweep(&mut self) {
        if !self.sweep.event() {
            return;
        }

        match self.dir.cleanup_staging(self.config.max_staging_age) {
            Ok(0) => {}
            Ok(deleted) => tracing::info!(deleted, "removed abandoned staged files"),
            Err(e) => tracing::warn!(%e, "failed to sweep staging area"),
        }
    }

    /// Applies one command to completion.  Errors affect only this
    /// command.
    pub fn apply(&mut self, command: Command) -> Result<Reply> {
        tracing::debug!(?command, "applying command");

        match command {
            Command::Insert {
                id,
                size,
                volatile,
                staged,
            } => {
                self.maybe_sweep();
                // The staged copy is consumed whatever happens.
                if let Some(staged) = &staged {
                    if self.table.contains(&id) {
                        self.discard_staged(staged);
                        return Err(QuotaError::AlreadyExists(id));
                    }

                    if let Err(e) = self.dir.publish(staged, &id) {
                        self.discard_staged(staged);
                        return Err(e.into());
                    }
                } else if self.table.contains(&id) {
                    return Err(QuotaError::AlreadyExists(id));
                }

                // Account for what is on disk, as recovery would.
                let on_disk = self.dir.object_size(&id)?;
                if on_disk != size {
                    tracing::debug!(%id, size, on_disk, "object size differs from client's claim");
                }

                if staged.is_none() {
                    if let Err(e) = self.dir.mark_inserted(&id) {
                        tracing::debug!(%id, %e, "failed to update object mtime");
                    }
                }

                self.table.insert(id, on_disk, volatile)?;
                Ok(Reply::Done(self.enforce_limits(Outcome::default())))
            }
            Command::Touch { id } => {
                self.table.touch(id)?;
                if let Err(e) = self.dir.mark_accessed(&id) {
                    tracing::debug!(%id, %e, "failed to update object atime");
                }

                Ok(Reply::Done(Outcome::default()))
            }
            Command::Pin { id } => {
                self.table.pin(id)?;
                Ok(Reply::Done(Outcome::default()))
            }
            Command::Unpin { id } => {
                self.table.unpin(id)?;
                // The entry may be the only thing standing between an
                // over-quota cache and its target.
                Ok(Reply::Done(self.enforce_limits(Outcome::default())))
            }
            Command::Remove { id } => {
                if !self.table.contains(&id) {
                    return Err(QuotaError::NotFound(id));
                }

                if let Err(e) = self.dir.remove(&id) {
                    tracing::warn!(%id, %e, "failed to unlink removed object");
                }

                let freed = self.table.remove(id)?;
                Ok(Reply::Done(Outcome {
                    freed,
                    ..Default::default()
                }))
            }
            Command::List { filter } => Ok(Reply::Entries(
                self.table
                    .entries()
                    .filter(|entry| filter.matches(entry))
                    .copied()
                    .collect(),
            )),
            Command::SetLimits { limit, threshold } => {
                self.limits = Limits::new(limit, threshold)?;
                tracing::info!(limit, threshold, "updated cache limits");
                Ok(Reply::Done(self.enforce_limits(Outcome::default())))
            }
            Command::RegisterBackchannel {
                identifier,
                endpoint,
            } => {
                let added = self
                    .registry
                    .register(&identifier, &endpoint, || {
                        backchannel::open_endpoint(&endpoint)
                    })
                    .map_err(|e| {
                        QuotaError::ChannelFailure(format!(
                            "cannot open backchannel {}: {}",
                            endpoint.display(),
                            e
                        ))
                    })?;

                if added {
                    tracing::info!(%identifier, endpoint = %endpoint.display(), "registered backchannel");
                }

                Ok(Reply::Done(Outcome::default()))
            }
            Command::UnregisterBackchannel {
                identifier,
                endpoint,
            } => {
                if self.registry.unregister(&identifier, &endpoint) {
                    tracing::info!(%identifier, endpoint = %endpoint.display(), "unregistered backchannel");
                }

                Ok(Reply::Done(Outcome::default()))
            }
            Command::Broadcast { payload } => {
                self.registry
                    .broadcast(&payload)
                    .map_err(|e| QuotaError::InvalidPayload(e.to_string()))?;
                Ok(Reply::Done(Outcome::default()))
            }
            Command::Cleanup { target } => {
                let target = target.unwrap_or_else(|| self.limits.low_water_mark());
                let reclaim =
                    eviction::reclaim(&mut self.table, &self.dir, target, self.limits.limit());

                Ok(Reply::Done(self.absorb(Outcome::default(), reclaim)))
            }
            Command::Usage => Ok(Reply::Usage(self.usage())),
            Command::CleanupRate { period_secs } => Ok(Reply::Count(
                self.history.count_since(Duration::from_secs(period_secs)),
            )),
        }
    }

    fn serve(&mut self, command: Command, reply: Option<Sender<Result<Reply>>>) {
        let result = self.apply(command);

        match reply {
            // The client may have given up waiting; that's fine.
            Some(reply) => {
                let _ = reply.send(result);
            }
            None => {
                if let Err(e) = result {
                    tracing::warn!(%e, "fire-and-forget command failed");
                }
            }
        }
    }

    /// The authority loop: one command at a time until shutdown.
    fn run(mut self, inbox: Receiver<Envelope>) {
        while let Ok(envelope) = inbox.recv() {
            match envelope {
                Envelope::Request { command, reply } => self.serve(command, reply),
                Envelope::Shutdown => break,
            }
        }

        transition(&mut self.state, State::ShuttingDown);
        while let Ok(envelope) = inbox.try_recv() {
            if let Envelope::Request { command, reply } = envelope {
                self.serve(command, reply);
            }
        }

        tracing::info!(
            entries = self.table.len(),
            bytes = self.table.total_size(),
            "quota manager stopped"
        );
    }

    /// Starts the authority thread and the socket listener.
    pub fn spawn(self) -> Result<QuotaManagerHandle> {
        let socket_path = self.config.socket_path();
        let listener = server::bind(&socket_path)?;
        let (sender, inbox) = mpsc::channel();

        let authority = std::thread::Builder::new()
            .name("quota-authority".to_owned())
            .spawn(move || self.run(inbox))?;
        let listener = server::Listener::spawn(listener, socket_path.clone(), sender.clone())?;

        Ok(QuotaManagerHandle {
            sender,
            socket_path,
            authority: Some(authority),
            listener: Some(listener),
        })
    }
}

fn transition(state: &mut State, next: State) {
    tracing::info!(from = ?*state, to = ?next, "quota manager state change");
    *state = next;
}

/// Owns a running quota manager.  Dropping the handle shuts the
/// manager down after draining queued commands.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct QuotaManagerHandle {
    #[derivative(Debug = "ignore")]
    sender: Sender<Envelope>,
    socket_path: PathBuf,
    authority: Option<JoinHandle<()>>,
    listener: Option<server::Listener>,
}

impl QuotaManagerHandle {
    /// Returns an in-process client.
    pub fn client(&self) -> LocalClient {
        LocalClient::new(LocalTransport::new(self.sender.clone()))
    }

    /// Remote clients connect here.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Shuts the manager down and waits for the authority to finish.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        // Commands queued before the shutdown marker are still applied.
        let _ = self.sender.send(Envelope::Shutdown);
        if let Some(listener) = self.listener.take() {
            listener.stop();
        }

        if let Some(authority) = self.authority.take() {
            if authority.join().is_err() {
                tracing::error!("quota authority thread panicked");
            }
        }
    }
}

impl Drop for QuotaManagerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod test {
    use crate::content_id::ContentId;
    use crate::manager::*;
    use crate::protocol::ListFilter;
    use test_dir::{DirBuilder, TestDir};

    const MB: u64 = 1024 * 1024;

    /// Writes an object of `size` bytes straight into place.
    fn place(manager: &QuotaManager, name: &str, size: u64) -> ContentId {
        let id = ContentId::of(name.as_bytes());
        let path = manager.dir.object_path(&id);

        std::fs::create_dir_all(path.parent().unwrap()).expect("mkdir must succeed");
        std::fs::write(&path, vec![0u8; size as usize]).expect("write must succeed");
        id
    }

    fn insert(manager: &mut QuotaManager, name: &str, size: u64) -> (ContentId, Outcome) {
        let id = place(manager, name, size);
        let outcome = match manager.apply(Command::Insert {
            id,
            size,
            volatile: false,
            staged: None,
        }) {
            Ok(Reply::Done(outcome)) => outcome,
            other => panic!("unexpected insert reply {:?}", other),
        };

        (id, outcome)
    }

    #[test]
    fn create_and_serve() {
        let temp = TestDir::temp();
        let manager =
            QuotaManager::create(temp.path("cache"), 10 * MB, 2 * MB, true).expect("create must succeed");

        assert_eq!(manager.state(), State::Serving);
        assert_eq!(manager.usage().total, 0);
        assert_eq!(manager.limits().low_water_mark(), 8 * MB);
    }

    #[test]
    fn reject_bad_limits() {
        let temp = TestDir::temp();

        assert!(matches!(
            QuotaManager::create(temp.path("cache"), MB, 2 * MB, true),
            Err(QuotaError::InvalidLimits { .. })
        ));
    }

    /// 10MB limit, 2MB threshold, three 4MB objects: the third insert
    /// evicts the first.
    #[test]
    fn evict_oldest_on_overflow() {
        let temp = TestDir::temp();
        let mut manager =
            QuotaManager::create(temp.path("cache"), 10 * MB, 2 * MB, true).expect("create must succeed");

        let (a, outcome) = insert(&mut manager, "a", 4 * MB);
        assert_eq!(outcome.evicted, 0);
        let (b, _) = insert(&mut manager, "b", 4 * MB);
        let (c, outcome) = insert(&mut manager, "c", 4 * MB);

        assert_eq!(outcome.evicted, 1);
        assert_eq!(outcome.freed, 4 * MB);
        assert_eq!(outcome.overflow, None);
        assert!(manager.table().total_size() <= 8 * MB);
        assert!(!manager.table().contains(&a));
        assert!(manager.table().contains(&b));
        assert!(manager.table().contains(&c));
        // The evicted object is gone from disk too.
        assert!(!manager.dir.object_path(&a).exists());
    }

    /// Touching A after inserting A, B, C makes B the first victim.
    #[test]
    fn touch_protects_from_eviction() {
        let temp = TestDir::temp();
        let mut manager =
            QuotaManager::create(temp.path("cache"), 3 * MB, 0, true).expect("create must succeed");

        let (a, _) = insert(&mut manager, "a", MB);
        let (b, _) = insert(&mut manager, "b", MB);
        let (c, _) = insert(&mut manager, "c", MB);
        manager
            .apply(Command::Touch { id: a })
            .expect("touch must succeed");

        let (d, outcome) = insert(&mut manager, "d", MB);
        assert_eq!(outcome.evicted, 1);
        assert!(manager.table().contains(&a));
        assert!(!manager.table().contains(&b));
        assert!(manager.table().contains(&c));
        assert!(manager.table().contains(&d));
    }

    /// Pin A, then insert more than the unpinned rest can make room
    /// for: A stays, and the overflow is reported as a soft warning.
    #[test]
    fn pinned_overflow() {
        let temp = TestDir::temp();
        let mut manager =
            QuotaManager::create(temp.path("cache"), 10 * MB, 2 * MB, true).expect("create must succeed");

        let (a, _) = insert(&mut manager, "a", 9 * MB);
        manager
            .apply(Command::Pin { id: a })
            .expect("pin must succeed");

        let (b, outcome) = insert(&mut manager, "b", 2 * MB);
        assert!(matches!(
            outcome.warning(),
            Some(QuotaError::QuotaExceededPinned {
                total,
                pinned,
                ..
            }) if total == 9 * MB && pinned == 9 * MB
        ));
        assert!(manager.table().contains(&a));
        assert!(!manager.table().contains(&b));
        assert!(manager.usage().overflow);

        // Back under the limit once unpinned, but above the low-water
        // mark until the next cleanup.
        match manager.apply(Command::Unpin { id: a }) {
            Ok(Reply::Done(outcome)) => assert_eq!(outcome, Outcome::default()),
            other => panic!("unexpected unpin reply {:?}", other),
        }
        assert!(!manager.usage().overflow);

        match manager.apply(Command::Cleanup { target: None }) {
            Ok(Reply::Done(outcome)) => {
                assert_eq!(outcome.evicted, 1);
                assert_eq!(outcome.overflow, None);
            }
            other => panic!("unexpected cleanup reply {:?}", other),
        }
        assert!(!manager.table().contains(&a));
    }

    #[test]
    fn pin_unpin_round_trip() {
        let temp = TestDir::temp();
        let mut manager =
            QuotaManager::create(temp.path("cache"), 10 * MB, 0, true).expect("create must succeed");

        let (a, _) = insert(&mut manager, "a", MB);
        manager.apply(Command::Pin { id: a }).expect("pin must succeed");
        manager.apply(Command::Unpin { id: a }).expect("unpin must succeed");
        assert!(matches!(
            manager.apply(Command::Unpin { id: a }),
            Err(QuotaError::NotPinned(_))
        ));

        // Eligible for eviction again.
        match manager.apply(Command::Cleanup { target: Some(0) }) {
            Ok(Reply::Done(outcome)) => assert_eq!(outcome.evicted, 1),
            other => panic!("unexpected cleanup reply {:?}", other),
        }
        assert!(manager.table().is_empty());
    }

    #[test]
    fn unknown_ids() {
        let temp = TestDir::temp();
        let mut manager =
            QuotaManager::create(temp.path("cache"), 10 * MB, 0, true).expect("create must succeed");
        let id = ContentId::of(b"nope");

        for command in vec![
            Command::Touch { id },
            Command::Pin { id },
            Command::Unpin { id },
            Command::Remove { id },
        ] {
            assert!(matches!(
                manager.apply(command),
                Err(QuotaError::NotFound(x)) if x == id
            ));
        }

        // Inserting an object that is not on disk fails and leaves no
        // trace.
        assert!(matches!(
            manager.apply(Command::Insert {
                id,
                size: 1,
                volatile: false,
                staged: None
            }),
            Err(QuotaError::Io(_))
        ));
        assert!(manager.table().is_empty());
    }

    #[test]
    fn duplicate_insert() {
        let temp = TestDir::temp();
        let mut manager =
            QuotaManager::create(temp.path("cache"), 10 * MB, 0, true).expect("create must succeed");

        let (a, _) = insert(&mut manager, "a", MB);
        assert!(matches!(
            manager.apply(Command::Insert {
                id: a,
                size: MB,
                volatile: false,
                staged: None
            }),
            Err(QuotaError::AlreadyExists(_))
        ));
        assert_eq!(manager.table().total_size(), MB);
    }

    #[test]
    fn remove_unlinks() {
        let temp = TestDir::temp();
        let mut manager =
            QuotaManager::create(temp.path("cache"), 10 * MB, 0, true).expect("create must succeed");

        let (a, _) = insert(&mut manager, "a", MB);
        manager.apply(Command::Pin { id: a }).expect("pin must succeed");
        match manager.apply(Command::Remove { id: a }) {
            Ok(Reply::Done(outcome)) => assert_eq!(outcome.freed, MB),
            other => panic!("unexpected remove reply {:?}", other),
        }

        assert!(!manager.dir.object_path(&a).exists());
        assert_eq!(manager.usage().pinned, 0);
    }

    #[test]
    fn shrink_limits() {
        let temp = TestDir::temp();
        let mut manager =
            QuotaManager::create(temp.path("cache"), 10 * MB, 0, true).expect("create must succeed");

        for name in &["a", "b", "c"] {
            insert(&mut manager, name, 2 * MB);
        }

        assert!(matches!(
            manager.apply(Command::SetLimits {
                limit: MB,
                threshold: 2 * MB
            }),
            Err(QuotaError::InvalidLimits { .. })
        ));
        // Unchanged after the rejected update.
        assert_eq!(manager.limits().limit(), 10 * MB);

        match manager.apply(Command::SetLimits {
            limit: 5 * MB,
            threshold: MB,
        }) {
            Ok(Reply::Done(outcome)) => assert_eq!(outcome.evicted, 1),
            other => panic!("unexpected set_limits reply {:?}", other),
        }
        assert_eq!(manager.table().total_size(), 4 * MB);
        assert_eq!(
            manager
                .apply(Command::CleanupRate { period_secs: 60 })
                .expect("cleanup rate must succeed"),
            Reply::Count(1)
        );
    }

    #[test]
    fn list_filters() {
        let temp = TestDir::temp();
        let mut manager =
            QuotaManager::create(temp.path("cache"), 10 * MB, 0, true).expect("create must succeed");

        let (a, _) = insert(&mut manager, "a", 1);
        let (b, _) = insert(&mut manager, "b", 1);
        manager.apply(Command::Pin { id: b }).expect("pin must succeed");

        let ids = |reply: Reply| match reply {
            Reply::Entries(entries) => entries.iter().map(|e| e.id).collect::<Vec<_>>(),
            other => panic!("unexpected list reply {:?}", other),
        };

        assert_eq!(
            ids(manager
                .apply(Command::List {
                    filter: ListFilter::All
                })
                .expect("list must succeed")),
            vec![a, b]
        );
        assert_eq!(
            ids(manager
                .apply(Command::List {
                    filter: ListFilter::Pinned
                })
                .expect("list must succeed")),
            vec![b]
        );
        assert!(ids(manager
            .apply(Command::List {
                filter: ListFilter::Volatile
            })
            .expect("list must succeed"))
        .is_empty());
    }

    /// The table tracks the size on disk, whatever the client claims.
    #[test]
    fn insert_uses_disk_size() {
        let temp = TestDir::temp();
        let mut manager =
            QuotaManager::create(temp.path("cache"), 10 * MB, 0, true).expect("create must succeed");

        let id = place(&manager, "a", 100);
        manager
            .apply(Command::Insert {
                id,
                size: 1,
                volatile: false,
                staged: None,
            })
            .expect("insert must succeed");
        assert_eq!(manager.table().total_size(), 100);
        drop(manager);

        let manager =
            QuotaManager::create(temp.path("cache"), 10 * MB, 0, true).expect("create must succeed");
        assert_eq!(manager.table().total_size(), 100);
    }

    /// A staged file handed to the manager is gone after the insert,
    /// even when the insert fails.
    #[test]
    fn failed_publish_consumes_staged_file() {
        let temp = TestDir::temp();
        let mut manager =
            QuotaManager::create(temp.path("cache"), 10 * MB, 0, true).expect("create must succeed");

        let outside = temp.path("elsewhere");
        std::fs::write(&outside, b"payload").expect("write must succeed");
        assert!(matches!(
            manager.apply(Command::Insert {
                id: ContentId::of(b"payload"),
                size: 7,
                volatile: false,
                staged: Some(outside.clone()),
            }),
            Err(QuotaError::Io(_))
        ));
        assert!(!outside.exists());
        assert!(manager.table().is_empty());

        // Same for a duplicate.
        let (a, _) = insert(&mut manager, "a", 1);
        let staged = manager
            .dir
            .stage()
            .expect("stage must succeed")
            .into_temp_path()
            .keep()
            .expect("keep must succeed");
        assert!(matches!(
            manager.apply(Command::Insert {
                id: a,
                size: 0,
                volatile: false,
                staged: Some(staged.clone()),
            }),
            Err(QuotaError::AlreadyExists(_))
        ));
        assert!(!staged.exists());
        assert!(manager.dir.object_path(&a).exists());
    }

    /// Eviction must unlink what recovery adopted: files under names
    /// other than their canonical path are never adopted.
    #[test]
    fn uppercase_objects_are_not_tracked() {
        let temp = TestDir::temp();
        let cache = temp.path("cache");
        let hex = ContentId::of(b"upper").to_hex().to_uppercase();
        let path = cache.join(&hex[0..2]).join(&hex[2..]);

        std::fs::create_dir_all(path.parent().unwrap()).expect("mkdir must succeed");
        std::fs::write(&path, vec![0u8; 100]).expect("write must succeed");

        let mut manager =
            QuotaManager::create(&cache, 10 * MB, 0, true).expect("create must succeed");
        assert_eq!(manager.table().total_size(), 0);
        match manager.apply(Command::Cleanup { target: Some(0) }) {
            Ok(Reply::Done(outcome)) => assert_eq!(outcome.evicted, 0),
            other => panic!("unexpected cleanup reply {:?}", other),
        }
        drop(manager);

        let manager = QuotaManager::create(&cache, 10 * MB, 0, true).expect("create must succeed");
        assert!(manager.table().is_empty());
        assert!(path.exists());
    }

    /// A second manager on a live cache must not touch the directory.
    #[test]
    fn one_manager_per_directory() {
        let temp = TestDir::temp();
        let mut manager =
            QuotaManager::create(temp.path("cache"), 10 * MB, 0, true).expect("create must succeed");

        let ids: Vec<_> = ["a", "b", "c"]
            .iter()
            .map(|name| insert(&mut manager, name, 1000).0)
            .collect();

        assert!(matches!(
            QuotaManager::create(temp.path("cache"), 1000, 0, true),
            Err(QuotaError::Io(e)) if e.kind() == std::io::ErrorKind::WouldBlock
        ));
        for id in &ids {
            assert!(manager.dir.object_path(id).exists());
        }
        assert_eq!(manager.table().len(), 3);

        drop(manager);
        let manager =
            QuotaManager::create(temp.path("cache"), 10 * MB, 0, true).expect("create must succeed");
        assert_eq!(manager.table().len(), 3);
    }

    /// Crash: drop the manager without ceremony, and recover.
    #[test]
    fn recover_after_crash() {
        let temp = TestDir::temp();
        let mut manager =
            QuotaManager::create(temp.path("cache"), 10 * MB, 0, true).expect("create must succeed");

        insert(&mut manager, "a", 3);
        insert(&mut manager, "b", 5);
        drop(manager);

        let manager =
            QuotaManager::create(temp.path("cache"), 10 * MB, 0, true).expect("create must succeed");
        assert_eq!(manager.table().len(), 2);
        assert_eq!(manager.table().total_size(), 8);
    }

    /// Recovery enforces the limit on what it finds.
    #[test]
    fn recover_over_limit() {
        let temp = TestDir::temp();
        let mut manager =
            QuotaManager::create(temp.path("cache"), 10 * MB, 0, true).expect("create must succeed");

        for name in &["a", "b", "c", "d"] {
            insert(&mut manager, name, 2 * MB);
        }
        drop(manager);

        let manager =
            QuotaManager::create(temp.path("cache"), 5 * MB, MB, true).expect("create must succeed");
        assert!(manager.table().total_size() <= 4 * MB);
        assert_eq!(manager.state(), State::Serving);
    }
}
