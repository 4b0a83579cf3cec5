//! Clients talk to the quota manager through a [`Transport`]: either
//! in-process, straight into the authority's queue, or over the cache
//! directory's Unix socket.  [`Client`] wraps a transport with one
//! typed method per command.
//!
//! Every method either gets the authority's reply or fails with
//! `ChannelFailure`; fire-and-forget commands (`touch`, `broadcast`)
//! only fail when the command cannot be handed over.
use std::io::ErrorKind;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::mpsc::RecvTimeoutError;
use std::sync::mpsc::Sender;
use std::time::Duration;
use tempfile::TempPath;

use crate::backchannel;
use crate::backchannel::Backchannel;
use crate::content_id::ContentId;
use crate::entry_table::CacheEntry;
use crate::error::QuotaError;
use crate::error::Result;
use crate::manager::Envelope;
use crate::protocol;
use crate::protocol::Command;
use crate::protocol::ListFilter;
use crate::protocol::Outcome;
use crate::protocol::Reply;
use crate::protocol::Request;
use crate::protocol::Usage;
use crate::protocol::MAX_REPLY_LEN;

/// A `Transport` hands commands to the authority.
pub trait Transport {
    /// Sends `command`.  When `want_reply` is true, waits for the
    /// authority's reply and returns it; otherwise returns `None` as
    /// soon as the command is queued.
    fn call(&mut self, command: Command, want_reply: bool) -> Result<Option<Reply>>;
}

fn disconnected() -> QuotaError {
    QuotaError::ChannelFailure("quota manager is gone".to_owned())
}

/// Feeds the authority's queue directly.
#[derive(Clone, Debug)]
pub struct LocalTransport {
    sender: Sender<Envelope>,
    timeout: Option<Duration>,
}

impl LocalTransport {
    pub(crate) fn new(sender: Sender<Envelope>) -> LocalTransport {
        LocalTransport {
            sender,
            timeout: None,
        }
    }

    /// Bounds how long calls wait for a reply.  `None` waits forever.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }
}

impl Transport for LocalTransport {
    fn call(&mut self, command: Command, want_reply: bool) -> Result<Option<Reply>> {
        if !want_reply {
            self.sender
                .send(Envelope::Request {
                    command,
                    reply: None,
                })
                .map_err(|_| disconnected())?;
            return Ok(None);
        }

        let (reply, response) = mpsc::channel();
        self.sender
            .send(Envelope::Request {
                command,
                reply: Some(reply),
            })
            .map_err(|_| disconnected())?;

        let response = match self.timeout {
            None => response.recv().map_err(|_| disconnected())?,
            Some(timeout) => match response.recv_timeout(timeout) {
                Ok(response) => response,
                Err(RecvTimeoutError::Timeout) => {
                    return Err(QuotaError::ChannelFailure(format!(
                        "no reply from quota manager after {:?}",
                        timeout
                    )))
                }
                Err(RecvTimeoutError::Disconnected) => return Err(disconnected()),
            },
        };

        response.map(Some)
    }
}

/// Speaks the wire protocol over the authority's socket.
#[derive(Debug)]
pub struct SocketTransport {
    stream: UnixStream,
    // A timed-out call may still get its reply later, which would be
    // mistaken for the next call's.  Refuse to reuse the stream.
    desynchronized: bool,
}

impl SocketTransport {
    pub fn connect(path: impl AsRef<Path>) -> Result<SocketTransport> {
        let path = path.as_ref();
        let stream = UnixStream::connect(path).map_err(|e| {
            QuotaError::ChannelFailure(format!("cannot connect to {}: {}", path.display(), e))
        })?;

        Ok(SocketTransport {
            stream,
            desynchronized: false,
        })
    }

    /// Bounds how long calls block on the socket.  `None` waits
    /// forever.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.stream.set_read_timeout(timeout)?;
        self.stream.set_write_timeout(timeout)?;
        Ok(())
    }

    fn channel_failure(&mut self, e: std::io::Error) -> QuotaError {
        self.desynchronized = true;

        match e.kind() {
            ErrorKind::WouldBlock | ErrorKind::TimedOut => {
                QuotaError::ChannelFailure("timed out waiting for quota manager".to_owned())
            }
            _ => QuotaError::ChannelFailure(format!("quota manager connection failed: {}", e)),
        }
    }
}

impl Transport for SocketTransport {
    fn call(&mut self, command: Command, want_reply: bool) -> Result<Option<Reply>> {
        if self.desynchronized {
            return Err(QuotaError::ChannelFailure(
                "connection unusable after an earlier failure".to_owned(),
            ));
        }

        let frame = protocol::encode_request(&Request {
            command,
            want_reply,
        })?;
        if let Err(e) = protocol::write_frame(&mut self.stream, &frame) {
            return Err(self.channel_failure(e));
        }

        if !want_reply {
            return Ok(None);
        }

        match protocol::read_frame(&mut self.stream, MAX_REPLY_LEN) {
            Ok(Some(body)) => protocol::decode_response(&body).map(Some),
            Ok(None) => {
                self.desynchronized = true;
                Err(QuotaError::ChannelFailure(
                    "quota manager closed the connection".to_owned(),
                ))
            }
            Err(e) => Err(self.channel_failure(e)),
        }
    }
}

/// A typed front for a [`Transport`].
#[derive(Clone, Debug)]
pub struct Client<T: Transport> {
    transport: T,
}

pub type LocalClient = Client<LocalTransport>;

pub type RemoteClient = Client<SocketTransport>;

impl RemoteClient {
    /// Connects to the quota manager listening at `socket_path`.
    pub fn connect(socket_path: impl AsRef<Path>) -> Result<RemoteClient> {
        Ok(Client::new(SocketTransport::connect(socket_path)?))
    }
}

fn unexpected(reply: Reply) -> QuotaError {
    QuotaError::Protocol(format!("unexpected reply {:?}", reply))
}

impl<T: Transport> Client<T> {
    pub fn new(transport: T) -> Client<T> {
        Client { transport }
    }

    pub fn transport(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Sends a raw command.  Returns the reply, if one was requested.
    pub fn call(&mut self, command: Command, want_reply: bool) -> Result<Option<Reply>> {
        self.transport.call(command, want_reply)
    }

    fn request(&mut self, command: Command) -> Result<Reply> {
        self.transport
            .call(command, true)?
            .ok_or_else(|| QuotaError::Protocol("missing reply".to_owned()))
    }

    fn done(&mut self, command: Command) -> Result<Outcome> {
        match self.request(command)? {
            Reply::Done(outcome) => Ok(outcome),
            other => Err(unexpected(other)),
        }
    }

    /// Records an object of `size` bytes already in place in the cache
    /// directory.
    pub fn insert(&mut self, id: ContentId, size: u64, volatile: bool) -> Result<Outcome> {
        self.done(Command::Insert {
            id,
            size,
            volatile,
            staged: None,
        })
    }

    /// Hands a fully written staging file (see `CacheDir::stage`) to
    /// the manager, which publishes it as `id` and records it.  The
    /// staging file belongs to the manager from then on, whatever the
    /// outcome.
    pub fn publish(&mut self, id: ContentId, staged: TempPath, volatile: bool) -> Result<Outcome> {
        let size = std::fs::metadata(&staged)?.len();
        let staged: PathBuf = staged.keep().map_err(|e| QuotaError::Io(e.error))?;

        self.done(Command::Insert {
            id,
            size,
            volatile,
            staged: Some(staged),
        })
    }

    /// Marks `id` as just used.  Does not wait for the manager.
    pub fn touch(&mut self, id: ContentId) -> Result<()> {
        self.transport.call(Command::Touch { id }, false)?;
        Ok(())
    }

    pub fn pin(&mut self, id: ContentId) -> Result<()> {
        self.done(Command::Pin { id })?;
        Ok(())
    }

    pub fn unpin(&mut self, id: ContentId) -> Result<Outcome> {
        self.done(Command::Unpin { id })
    }

    /// Deletes `id` from the cache, pinned or not.  Returns the number
    /// of bytes released.
    pub fn remove(&mut self, id: ContentId) -> Result<u64> {
        Ok(self.done(Command::Remove { id })?.freed)
    }

    fn list_filtered(&mut self, filter: ListFilter) -> Result<Vec<CacheEntry>> {
        match self.request(Command::List { filter })? {
            Reply::Entries(entries) => Ok(entries),
            other => Err(unexpected(other)),
        }
    }

    /// Lists every entry, first eviction victim first.
    pub fn list(&mut self) -> Result<Vec<CacheEntry>> {
        self.list_filtered(ListFilter::All)
    }

    pub fn list_pinned(&mut self) -> Result<Vec<CacheEntry>> {
        self.list_filtered(ListFilter::Pinned)
    }

    pub fn list_volatile(&mut self) -> Result<Vec<CacheEntry>> {
        self.list_filtered(ListFilter::Volatile)
    }

    pub fn set_limits(&mut self, limit: u64, threshold: u64) -> Result<Outcome> {
        self.done(Command::SetLimits { limit, threshold })
    }

    /// Subscribes the FIFO at `endpoint` to broadcasts under
    /// `identifier`.
    pub fn register_endpoint(&mut self, identifier: &str, endpoint: &Path) -> Result<()> {
        self.done(Command::RegisterBackchannel {
            identifier: identifier.to_owned(),
            endpoint: endpoint.to_owned(),
        })?;
        Ok(())
    }

    pub fn unregister_endpoint(&mut self, identifier: &str, endpoint: &Path) -> Result<()> {
        self.done(Command::UnregisterBackchannel {
            identifier: identifier.to_owned(),
            endpoint: endpoint.to_owned(),
        })?;
        Ok(())
    }

    pub fn register_backchannel(&mut self, channel: &Backchannel) -> Result<()> {
        self.register_endpoint(channel.identifier(), channel.endpoint())
    }

    pub fn unregister_backchannel(&mut self, channel: &Backchannel) -> Result<()> {
        self.unregister_endpoint(channel.identifier(), channel.endpoint())
    }

    /// Sends `payload` to every registered backchannel.  Does not wait
    /// for the manager.
    pub fn broadcast(&mut self, payload: &[u8]) -> Result<()> {
        backchannel::check_payload(payload)
            .map_err(|e| QuotaError::InvalidPayload(e.to_string()))?;
        self.transport.call(
            Command::Broadcast {
                payload: payload.to_vec(),
            },
            false,
        )?;
        Ok(())
    }

    /// Evicts down to the low-water mark.
    pub fn cleanup(&mut self) -> Result<Outcome> {
        self.done(Command::Cleanup { target: None })
    }

    /// Evicts until at most `target` bytes remain.
    pub fn cleanup_to(&mut self, target: u64) -> Result<Outcome> {
        self.done(Command::Cleanup {
            target: Some(target),
        })
    }

    pub fn usage(&mut self) -> Result<Usage> {
        match self.request(Command::Usage)? {
            Reply::Usage(usage) => Ok(usage),
            other => Err(unexpected(other)),
        }
    }

    /// Returns the number of eviction passes in the last `period`.
    pub fn cleanup_rate(&mut self, period: Duration) -> Result<u64> {
        match self.request(Command::CleanupRate {
            period_secs: period.as_secs(),
        })? {
            Reply::Count(count) => Ok(count),
            other => Err(unexpected(other)),
        }
    }
}
