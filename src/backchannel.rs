//! Backchannels let the quota manager notify subscribers (typically
//! mount processes) of global cache events.  A subscriber creates a
//! named pipe, asks the manager to register it, and reads short
//! messages from its end.
//!
//! The registry never waits on a subscriber: endpoints are opened and
//! written in non-blocking mode, and any failed delivery (closed pipe,
//! full pipe, anything else) drops that subscriber on the spot.  There
//! is no liveness ping; dead subscribers are discovered lazily, at
//! broadcast time.
//!
//! Each message travels as a one-byte length followed by the payload.
//! Frames are at most 256 bytes, well under `PIPE_BUF`, so concurrent
//! writes never interleave and a full pipe rejects a frame whole.
use derivative::Derivative;
use std::collections::BTreeMap;
use std::ffi::CString;
use std::fs::File;
use std::fs::OpenOptions;
use std::io::Error;
use std::io::ErrorKind;
use std::io::Read;
use std::io::Result;
use std::io::Write;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::FileTypeExt;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;
use std::time::Instant;

use crate::error::is_dead_endpoint_error;

/// Longest payload a broadcast may carry.
pub const MAX_BROADCAST_LEN: usize = u8::MAX as usize;

/// A `Sink` is the delivery side of one registered backchannel.
pub trait Sink: Send {
    /// Attempts to deliver one framed message without blocking.
    fn deliver(&mut self, frame: &[u8]) -> Result<()>;
}

impl Sink for File {
    fn deliver(&mut self, frame: &[u8]) -> Result<()> {
        self.write_all(frame)
    }
}

/// Rejects payloads that cannot be framed.
pub fn check_payload(payload: &[u8]) -> Result<()> {
    if payload.is_empty() || payload.len() > MAX_BROADCAST_LEN {
        return Err(Error::new(
            ErrorKind::InvalidInput,
            format!(
                "broadcast payload must hold 1 to {} bytes, got {}",
                MAX_BROADCAST_LEN,
                payload.len()
            ),
        ));
    }

    Ok(())
}

fn frame(payload: &[u8]) -> Vec<u8> {
    let mut ret = Vec::with_capacity(payload.len() + 1);

    ret.push(payload.len() as u8);
    ret.extend_from_slice(payload);
    ret
}

/// Opens the write end of the FIFO at `endpoint` without blocking.
/// Fails with `ENXIO` if nobody has the read end open, and refuses
/// anything that is not a FIFO.
pub fn open_endpoint(endpoint: &Path) -> Result<File> {
    let file = OpenOptions::new()
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(endpoint)?;

    if !file.metadata()?.file_type().is_fifo() {
        return Err(Error::new(
            ErrorKind::InvalidInput,
            format!("backchannel {} is not a named pipe", endpoint.display()),
        ));
    }

    Ok(file)
}

#[derive(Derivative)]
#[derivative(Debug(bound = ""))]
struct Subscriber<S: Sink> {
    #[derivative(Debug = "ignore")]
    sink: S,
    registered: Instant,
}

/// The set of live backchannels, keyed by `(identifier, endpoint)`.
/// Several endpoints may share an identifier.
#[derive(Derivative)]
#[derivative(Debug(bound = ""), Default(bound = ""))]
pub struct Registry<S: Sink = File> {
    subscribers: BTreeMap<(String, PathBuf), Subscriber<S>>,
}

impl<S: Sink> Registry<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `endpoint` under `identifier`, calling `open` to
    /// obtain its sink.  Registering a known pair again is a no-op
    /// that does not call `open`.
    ///
    /// Returns whether a new subscriber was added.
    pub fn register(
        &mut self,
        identifier: &str,
        endpoint: &Path,
        open: impl FnOnce() -> Result<S>,
    ) -> Result<bool> {
        let key = (identifier.to_owned(), endpoint.to_owned());

        if self.subscribers.contains_key(&key) {
            return Ok(false);
        }

        let sink = open()?;
        self.subscribers.insert(
            key,
            Subscriber {
                sink,
                registered: Instant::now(),
            },
        );
        Ok(true)
    }

    /// Removes the exact `(identifier, endpoint)` pair.  Absent pairs
    /// are ignored: subscribers may race with their own shutdown.
    ///
    /// Returns whether a subscriber was removed.
    pub fn unregister(&mut self, identifier: &str, endpoint: &Path) -> bool {
        self.subscribers
            .remove(&(identifier.to_owned(), endpoint.to_owned()))
            .is_some()
    }

    /// Delivers `payload` to every subscriber, independently.  Failed
    /// subscribers are dropped and never retried.  Payloads that
    /// cannot be framed are refused before anything is sent.
    ///
    /// Returns the number of subscribers dropped.
    pub fn broadcast(&mut self, payload: &[u8]) -> Result<usize> {
        check_payload(payload)?;
        let frame = frame(payload);
        let before = self.subscribers.len();

        self.subscribers.retain(|(identifier, endpoint), subscriber| {
            match subscriber.sink.deliver(&frame) {
                Ok(()) => true,
                Err(e) => {
                    if !is_dead_endpoint_error(&e) {
                        tracing::warn!(%identifier, endpoint = %endpoint.display(), %e,
                                       "unexpected backchannel failure");
                    }

                    tracing::info!(
                        %identifier,
                        endpoint = %endpoint.display(),
                        age_secs = subscriber.registered.elapsed().as_secs(),
                        "dropping dead backchannel"
                    );
                    false
                }
            }
        });

        Ok(before - self.subscribers.len())
    }

    pub fn contains(&self, identifier: &str, endpoint: &Path) -> bool {
        self.subscribers
            .contains_key(&(identifier.to_owned(), endpoint.to_owned()))
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }
}

/// The subscriber's end of a backchannel: a FIFO it owns and reads.
/// Dropping the `Backchannel` closes and deletes the FIFO; the manager
/// notices at its next broadcast.
#[derive(Debug)]
pub struct Backchannel {
    identifier: String,
    path: PathBuf,
    reader: File,
    pending: Vec<u8>,
}

impl Backchannel {
    /// Creates a fresh FIFO in `dir` for a subscriber known as
    /// `identifier`, and opens its read end.
    pub fn create(dir: impl AsRef<Path>, identifier: &str) -> Result<Backchannel> {
        let name = format!(
            "backchannel.{}.{:016x}",
            identifier
                .chars()
                .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
                .collect::<String>(),
            rand::random::<u64>()
        );
        let path = dir.as_ref().join(name);

        let c_path = CString::new(path.as_os_str().as_bytes())?;
        // SAFETY: `c_path` is a valid NUL-terminated string.
        if unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) } != 0 {
            return Err(Error::last_os_error());
        }

        let reader = match OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&path)
        {
            Ok(file) => file,
            Err(e) => {
                let _ = std::fs::remove_file(&path);
                return Err(e);
            }
        };

        Ok(Backchannel {
            identifier: identifier.to_owned(),
            path,
            reader,
            pending: Vec::new(),
        })
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// The endpoint to hand to `RegisterBackchannel`.
    pub fn endpoint(&self) -> &Path {
        &self.path
    }

    fn pop_message(&mut self) -> Option<Vec<u8>> {
        let len = *self.pending.first()? as usize;

        if self.pending.len() < len + 1 {
            return None;
        }

        let message = self.pending[1..=len].to_vec();
        self.pending.drain(..=len);
        Some(message)
    }

    /// Returns the next complete message, if one is available now.
    pub fn try_recv(&mut self) -> Result<Option<Vec<u8>>> {
        if let Some(message) = self.pop_message() {
            return Ok(Some(message));
        }

        let mut buf = [0u8; 4096];
        loop {
            match self.reader.read(&mut buf) {
                // No writer right now.
                Ok(0) => break,
                Ok(n) => self.pending.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        Ok(self.pop_message())
    }

    /// Waits up to `timeout` for the next complete message.
    pub fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(message) = self.try_recv()? {
                return Ok(Some(message));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining == Duration::ZERO {
                return Ok(None);
            }

            let mut pfd = libc::pollfd {
                fd: self.reader.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            };
            let millis = remaining.as_millis().min(i32::MAX as u128) as libc::c_int;
            // SAFETY: `pfd` is a single valid pollfd for the call's duration.
            let rc = unsafe { libc::poll(&mut pfd, 1, millis.max(1)) };
            if rc < 0 {
                let e = Error::last_os_error();
                if e.kind() != ErrorKind::Interrupted {
                    return Err(e);
                }
            } else if rc > 0 && (pfd.revents & libc::POLLIN) == 0 {
                // Hangup without data: the writer is gone for good.
                return self.try_recv();
            }
        }
    }
}

impl Drop for Backchannel {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}
