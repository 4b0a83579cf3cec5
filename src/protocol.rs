//! The command protocol spoken between clients and the quota manager.
//!
//! Every frame is a little-endian `u32` body length followed by the
//! body.  A request body starts with a command tag and a flags byte
//! (bit 0: the client wants a reply), then the command's fields.  A
//! reply body starts with a status byte: 0 for success, followed by a
//! reply kind and its fields, or an error code followed by the error's
//! fields.
//!
//! Identifiers travel as their 20 raw bytes, integers as little-endian
//! fixed-width values, and strings, paths and payloads as a `u16`
//! length followed by their bytes.
use bytes::Buf;
use bytes::BufMut;
use bytes::BytesMut;
use std::ffi::OsStr;
use std::io::Error;
use std::io::ErrorKind;
use std::io::Read;
use std::io::Write;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::path::PathBuf;

use crate::content_id::ContentId;
use crate::content_id::CONTENT_ID_LEN;
use crate::entry_table::CacheEntry;
use crate::error::QuotaError;
use crate::error::Result;
use crate::eviction::Overflow;

/// Requests are small; anything bigger is garbage.
pub const MAX_REQUEST_LEN: usize = 64 * 1024;

/// Replies may list every cached object.
pub const MAX_REPLY_LEN: usize = 256 * 1024 * 1024;

const FLAG_WANT_REPLY: u8 = 1;

mod tag {
    pub const INSERT: u8 = 1;
    pub const TOUCH: u8 = 2;
    pub const PIN: u8 = 3;
    pub const UNPIN: u8 = 4;
    pub const REMOVE: u8 = 5;
    pub const LIST: u8 = 6;
    pub const SET_LIMITS: u8 = 7;
    pub const REGISTER_BACKCHANNEL: u8 = 8;
    pub const UNREGISTER_BACKCHANNEL: u8 = 9;
    pub const BROADCAST: u8 = 10;
    pub const CLEANUP: u8 = 11;
    pub const USAGE: u8 = 12;
    pub const CLEANUP_RATE: u8 = 13;
}

mod kind {
    pub const DONE: u8 = 1;
    pub const ENTRIES: u8 = 2;
    pub const USAGE: u8 = 3;
    pub const COUNT: u8 = 4;
}

mod code {
    pub const NOT_FOUND: u8 = 1;
    pub const ALREADY_EXISTS: u8 = 2;
    pub const NOT_PINNED: u8 = 3;
    pub const QUOTA_EXCEEDED_PINNED: u8 = 4;
    pub const INVALID_LIMITS: u8 = 5;
    pub const IO: u8 = 6;
    pub const CHANNEL_FAILURE: u8 = 7;
    pub const PROTOCOL: u8 = 8;
    pub const INVALID_PAYLOAD: u8 = 9;
}

/// Which entries a `List` command returns.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ListFilter {
    All = 0,
    Pinned = 1,
    Volatile = 2,
}

impl ListFilter {
    pub fn matches(self, entry: &CacheEntry) -> bool {
        match self {
            ListFilter::All => true,
            ListFilter::Pinned => entry.is_pinned(),
            ListFilter::Volatile => entry.volatile,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// Tracks a new object.  With `staged`, the manager first publishes
    /// the staged file as the object; otherwise the object must
    /// already be in place.
    Insert {
        id: ContentId,
        size: u64,
        volatile: bool,
        staged: Option<PathBuf>,
    },
    Touch {
        id: ContentId,
    },
    Pin {
        id: ContentId,
    },
    Unpin {
        id: ContentId,
    },
    Remove {
        id: ContentId,
    },
    List {
        filter: ListFilter,
    },
    SetLimits {
        limit: u64,
        threshold: u64,
    },
    RegisterBackchannel {
        identifier: String,
        endpoint: PathBuf,
    },
    UnregisterBackchannel {
        identifier: String,
        endpoint: PathBuf,
    },
    Broadcast {
        payload: Vec<u8>,
    },
    /// Evicts down to `target` bytes, or to the low-water mark.
    Cleanup {
        target: Option<u64>,
    },
    Usage,
    /// Counts eviction passes in the last `period_secs` seconds.
    CleanupRate {
        period_secs: u64,
    },
}

impl Command {
    /// Returns whether clients wait for this command's reply by
    /// default.  `Touch` and `Broadcast` are fire-and-forget.
    pub fn is_synchronous(&self) -> bool {
        !matches!(self, Command::Touch { .. } | Command::Broadcast { .. })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Request {
    pub command: Command,
    pub want_reply: bool,
}

/// The effect of a mutating command.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Outcome {
    /// Number of objects evicted while applying the command.
    pub evicted: u64,
    /// Bytes released by the command (evictions and explicit removal).
    pub freed: u64,
    /// Set when eviction could not reach its target because the rest
    /// of the cache is pinned.  A warning, not a failure.
    pub overflow: Option<Overflow>,
}

impl Outcome {
    /// Returns the soft `QuotaExceededPinned` warning, if any.
    pub fn warning(&self) -> Option<QuotaError> {
        self.overflow.map(QuotaError::from)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Usage {
    pub limit: u64,
    pub threshold: u64,
    pub total: u64,
    pub pinned: u64,
    pub entries: u64,
    pub backchannels: u64,
    /// Whether the last eviction pass left the cache over target.
    pub overflow: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reply {
    Done(Outcome),
    /// Entries in eviction order, first victim first.
    Entries(Vec<CacheEntry>),
    Usage(Usage),
    Count(u64),
}

fn truncated() -> QuotaError {
    QuotaError::Protocol("truncated frame".to_owned())
}

/// Bounds-checked field reader over a frame body.
struct Fields<'a> {
    buf: &'a [u8],
}

impl<'a> Fields<'a> {
    fn need(&self, len: usize) -> Result<()> {
        if self.buf.remaining() < len {
            return Err(truncated());
        }

        Ok(())
    }

    fn u8(&mut self) -> Result<u8> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    fn u16(&mut self) -> Result<u16> {
        self.need(2)?;
        Ok(self.buf.get_u16_le())
    }

    fn u32(&mut self) -> Result<u32> {
        self.need(4)?;
        Ok(self.buf.get_u32_le())
    }

    fn i32(&mut self) -> Result<i32> {
        self.need(4)?;
        Ok(self.buf.get_i32_le())
    }

    fn u64(&mut self) -> Result<u64> {
        self.need(8)?;
        Ok(self.buf.get_u64_le())
    }

    fn bool(&mut self) -> Result<bool> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(QuotaError::Protocol(format!("bad boolean {}", other))),
        }
    }

    fn id(&mut self) -> Result<ContentId> {
        self.need(CONTENT_ID_LEN)?;

        let mut bytes = [0u8; CONTENT_ID_LEN];
        self.buf.copy_to_slice(&mut bytes);
        Ok(ContentId::new(bytes))
    }

    fn bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.u16()? as usize;

        self.need(len)?;
        let buf: &'a [u8] = self.buf;
        let (head, tail) = buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    fn string(&mut self) -> Result<String> {
        String::from_utf8(self.bytes()?.to_vec())
            .map_err(|_| QuotaError::Protocol("string is not UTF-8".to_owned()))
    }

    fn path(&mut self) -> Result<PathBuf> {
        Ok(Path::new(OsStr::from_bytes(self.bytes()?)).to_owned())
    }

    fn finish(&self) -> Result<()> {
        if self.buf.has_remaining() {
            return Err(QuotaError::Protocol(format!(
                "{} trailing bytes",
                self.buf.remaining()
            )));
        }

        Ok(())
    }
}

fn put_bytes(dst: &mut BytesMut, bytes: &[u8]) -> Result<()> {
    if bytes.len() > u16::MAX as usize {
        return Err(QuotaError::InvalidPayload(format!(
            "field of {} bytes is too long",
            bytes.len()
        )));
    }

    dst.put_u16_le(bytes.len() as u16);
    dst.put_slice(bytes);
    Ok(())
}

fn put_path(dst: &mut BytesMut, path: &Path) -> Result<()> {
    put_bytes(dst, path.as_os_str().as_bytes())
}

/// Prepends the length header to a finished body.
fn seal(body: BytesMut) -> Vec<u8> {
    let mut ret = Vec::with_capacity(body.len() + 4);

    ret.put_u32_le(body.len() as u32);
    ret.extend_from_slice(&body);
    ret
}

fn put_header(body: &mut BytesMut, tag: u8, flags: u8) {
    body.put_u8(tag);
    body.put_u8(flags);
}

/// Encodes `request` as a complete frame.
pub fn encode_request(request: &Request) -> Result<Vec<u8>> {
    let mut body = BytesMut::new();
    let flags = if request.want_reply { FLAG_WANT_REPLY } else { 0 };

    match &request.command {
        Command::Insert {
            id,
            size,
            volatile,
            staged,
        } => {
            put_header(&mut body, tag::INSERT, flags);
            body.put_slice(id.as_bytes());
            body.put_u64_le(*size);
            body.put_u8(*volatile as u8);
            match staged {
                Some(path) => {
                    body.put_u8(1);
                    put_path(&mut body, path)?;
                }
                None => body.put_u8(0),
            }
        }
        Command::Touch { id } => {
            put_header(&mut body, tag::TOUCH, flags);
            body.put_slice(id.as_bytes());
        }
        Command::Pin { id } => {
            put_header(&mut body, tag::PIN, flags);
            body.put_slice(id.as_bytes());
        }
        Command::Unpin { id } => {
            put_header(&mut body, tag::UNPIN, flags);
            body.put_slice(id.as_bytes());
        }
        Command::Remove { id } => {
            put_header(&mut body, tag::REMOVE, flags);
            body.put_slice(id.as_bytes());
        }
        Command::List { filter } => {
            put_header(&mut body, tag::LIST, flags);
            body.put_u8(*filter as u8);
        }
        Command::SetLimits { limit, threshold } => {
            put_header(&mut body, tag::SET_LIMITS, flags);
            body.put_u64_le(*limit);
            body.put_u64_le(*threshold);
        }
        Command::RegisterBackchannel {
            identifier,
            endpoint,
        } => {
            put_header(&mut body, tag::REGISTER_BACKCHANNEL, flags);
            put_bytes(&mut body, identifier.as_bytes())?;
            put_path(&mut body, endpoint)?;
        }
        Command::UnregisterBackchannel {
            identifier,
            endpoint,
        } => {
            put_header(&mut body, tag::UNREGISTER_BACKCHANNEL, flags);
            put_bytes(&mut body, identifier.as_bytes())?;
            put_path(&mut body, endpoint)?;
        }
        Command::Broadcast { payload } => {
            put_header(&mut body, tag::BROADCAST, flags);
            put_bytes(&mut body, payload)?;
        }
        Command::Cleanup { target } => {
            put_header(&mut body, tag::CLEANUP, flags);
            match target {
                Some(target) => {
                    body.put_u8(1);
                    body.put_u64_le(*target);
                }
                None => body.put_u8(0),
            }
        }
        Command::Usage => put_header(&mut body, tag::USAGE, flags),
        Command::CleanupRate { period_secs } => {
            put_header(&mut body, tag::CLEANUP_RATE, flags);
            body.put_u64_le(*period_secs);
        }
    }

    Ok(seal(body))
}

/// Decodes a request body (without its length header).
pub fn decode_request(body: &[u8]) -> Result<Request> {
    let mut fields = Fields { buf: body };
    let tag = fields.u8()?;
    let flags = fields.u8()?;

    let command = match tag {
        tag::INSERT => {
            let id = fields.id()?;
            let size = fields.u64()?;
            let volatile = fields.bool()?;
            let staged = if fields.bool()? {
                Some(fields.path()?)
            } else {
                None
            };

            Command::Insert {
                id,
                size,
                volatile,
                staged,
            }
        }
        tag::TOUCH => Command::Touch { id: fields.id()? },
        tag::PIN => Command::Pin { id: fields.id()? },
        tag::UNPIN => Command::Unpin { id: fields.id()? },
        tag::REMOVE => Command::Remove { id: fields.id()? },
        tag::LIST => Command::List {
            filter: match fields.u8()? {
                0 => ListFilter::All,
                1 => ListFilter::Pinned,
                2 => ListFilter::Volatile,
                other => return Err(QuotaError::Protocol(format!("bad list filter {}", other))),
            },
        },
        tag::SET_LIMITS => Command::SetLimits {
            limit: fields.u64()?,
            threshold: fields.u64()?,
        },
        tag::REGISTER_BACKCHANNEL => Command::RegisterBackchannel {
            identifier: fields.string()?,
            endpoint: fields.path()?,
        },
        tag::UNREGISTER_BACKCHANNEL => Command::UnregisterBackchannel {
            identifier: fields.string()?,
            endpoint: fields.path()?,
        },
        tag::BROADCAST => Command::Broadcast {
            payload: fields.bytes()?.to_vec(),
        },
        tag::CLEANUP => Command::Cleanup {
            target: if fields.bool()? {
                Some(fields.u64()?)
            } else {
                None
            },
        },
        tag::USAGE => Command::Usage,
        tag::CLEANUP_RATE => Command::CleanupRate {
            period_secs: fields.u64()?,
        },
        other => return Err(QuotaError::Protocol(format!("unknown command tag {}", other))),
    };

    fields.finish()?;
    Ok(Request {
        command,
        want_reply: flags & FLAG_WANT_REPLY != 0,
    })
}

fn put_overflow(body: &mut BytesMut, overflow: &Overflow) {
    body.put_u64_le(overflow.total);
    body.put_u64_le(overflow.limit);
    body.put_u64_le(overflow.pinned);
}

fn put_error(body: &mut BytesMut, error: &QuotaError) -> Result<()> {
    match error {
        QuotaError::NotFound(id) => {
            body.put_u8(code::NOT_FOUND);
            body.put_slice(id.as_bytes());
        }
        QuotaError::AlreadyExists(id) => {
            body.put_u8(code::ALREADY_EXISTS);
            body.put_slice(id.as_bytes());
        }
        QuotaError::NotPinned(id) => {
            body.put_u8(code::NOT_PINNED);
            body.put_slice(id.as_bytes());
        }
        QuotaError::QuotaExceededPinned {
            total,
            limit,
            pinned,
        } => {
            body.put_u8(code::QUOTA_EXCEEDED_PINNED);
            put_overflow(
                body,
                &Overflow {
                    total: *total,
                    limit: *limit,
                    pinned: *pinned,
                },
            );
        }
        QuotaError::InvalidLimits { limit, threshold } => {
            body.put_u8(code::INVALID_LIMITS);
            body.put_u64_le(*limit);
            body.put_u64_le(*threshold);
        }
        QuotaError::Io(e) => {
            body.put_u8(code::IO);
            body.put_i32_le(e.raw_os_error().unwrap_or(-1));
            put_bytes(body, truncate_message(&e.to_string()))?;
        }
        QuotaError::ChannelFailure(message) => {
            body.put_u8(code::CHANNEL_FAILURE);
            put_bytes(body, truncate_message(message))?;
        }
        QuotaError::Protocol(message) => {
            body.put_u8(code::PROTOCOL);
            put_bytes(body, truncate_message(message))?;
        }
        QuotaError::InvalidPayload(message) => {
            body.put_u8(code::INVALID_PAYLOAD);
            put_bytes(body, truncate_message(message))?;
        }
    }

    Ok(())
}

fn truncate_message(message: &str) -> &[u8] {
    let bytes = message.as_bytes();

    &bytes[..bytes.len().min(1024)]
}

/// Encodes the authority's answer to one request as a complete frame.
pub fn encode_response(response: &Result<Reply>) -> Result<Vec<u8>> {
    let mut body = BytesMut::new();

    match response {
        Ok(reply) => {
            body.put_u8(0);
            match reply {
                Reply::Done(outcome) => {
                    body.put_u8(kind::DONE);
                    body.put_u64_le(outcome.evicted);
                    body.put_u64_le(outcome.freed);
                    match &outcome.overflow {
                        Some(overflow) => {
                            body.put_u8(1);
                            put_overflow(&mut body, overflow);
                        }
                        None => body.put_u8(0),
                    }
                }
                Reply::Entries(entries) => {
                    body.put_u8(kind::ENTRIES);
                    body.put_u32_le(entries.len() as u32);
                    for entry in entries {
                        body.put_slice(entry.id.as_bytes());
                        body.put_u64_le(entry.size);
                        body.put_u32_le(entry.pin_count);
                        body.put_u8(entry.volatile as u8);
                        body.put_u64_le(entry.rank);
                    }
                }
                Reply::Usage(usage) => {
                    body.put_u8(kind::USAGE);
                    body.put_u64_le(usage.limit);
                    body.put_u64_le(usage.threshold);
                    body.put_u64_le(usage.total);
                    body.put_u64_le(usage.pinned);
                    body.put_u64_le(usage.entries);
                    body.put_u64_le(usage.backchannels);
                    body.put_u8(usage.overflow as u8);
                }
                Reply::Count(count) => {
                    body.put_u8(kind::COUNT);
                    body.put_u64_le(*count);
                }
            }
        }
        Err(error) => {
            body.put_u8(1);
            put_error(&mut body, error)?;
        }
    }

    if body.len() > MAX_REPLY_LEN {
        return Err(QuotaError::InvalidPayload(format!(
            "reply of {} bytes is too long",
            body.len()
        )));
    }

    Ok(seal(body))
}

fn get_overflow(fields: &mut Fields) -> Result<Overflow> {
    Ok(Overflow {
        total: fields.u64()?,
        limit: fields.u64()?,
        pinned: fields.u64()?,
    })
}

fn get_message(fields: &mut Fields) -> Result<String> {
    Ok(String::from_utf8_lossy(fields.bytes()?).into_owned())
}

fn get_error(fields: &mut Fields) -> Result<QuotaError> {
    Ok(match fields.u8()? {
        code::NOT_FOUND => QuotaError::NotFound(fields.id()?),
        code::ALREADY_EXISTS => QuotaError::AlreadyExists(fields.id()?),
        code::NOT_PINNED => QuotaError::NotPinned(fields.id()?),
        code::QUOTA_EXCEEDED_PINNED => get_overflow(fields)?.into(),
        code::INVALID_LIMITS => QuotaError::InvalidLimits {
            limit: fields.u64()?,
            threshold: fields.u64()?,
        },
        code::IO => {
            let errno = fields.i32()?;
            let kind = if errno >= 0 {
                Error::from_raw_os_error(errno).kind()
            } else {
                ErrorKind::Other
            };

            QuotaError::Io(Error::new(kind, get_message(fields)?))
        }
        code::CHANNEL_FAILURE => QuotaError::ChannelFailure(get_message(fields)?),
        code::PROTOCOL => QuotaError::Protocol(get_message(fields)?),
        code::INVALID_PAYLOAD => QuotaError::InvalidPayload(get_message(fields)?),
        other => return Err(QuotaError::Protocol(format!("unknown error code {}", other))),
    })
}

/// Decodes a response body (without its length header).  An error
/// reply decodes to that error.
pub fn decode_response(body: &[u8]) -> Result<Reply> {
    let mut fields = Fields { buf: body };

    if fields.u8()? != 0 {
        let error = get_error(&mut fields)?;

        fields.finish()?;
        return Err(error);
    }

    let reply = match fields.u8()? {
        kind::DONE => {
            let evicted = fields.u64()?;
            let freed = fields.u64()?;
            let overflow = if fields.bool()? {
                Some(get_overflow(&mut fields)?)
            } else {
                None
            };

            Reply::Done(Outcome {
                evicted,
                freed,
                overflow,
            })
        }
        kind::ENTRIES => {
            let count = fields.u32()? as usize;
            // Don't trust the count for preallocation.
            let mut entries = Vec::with_capacity(count.min(fields.buf.len() / 41));

            for _ in 0..count {
                entries.push(CacheEntry {
                    id: fields.id()?,
                    size: fields.u64()?,
                    pin_count: fields.u32()?,
                    volatile: fields.bool()?,
                    rank: fields.u64()?,
                });
            }

            Reply::Entries(entries)
        }
        kind::USAGE => Reply::Usage(Usage {
            limit: fields.u64()?,
            threshold: fields.u64()?,
            total: fields.u64()?,
            pinned: fields.u64()?,
            entries: fields.u64()?,
            backchannels: fields.u64()?,
            overflow: fields.bool()?,
        }),
        kind::COUNT => Reply::Count(fields.u64()?),
        other => return Err(QuotaError::Protocol(format!("unknown reply kind {}", other))),
    };

    fields.finish()?;
    Ok(reply)
}

/// Reads one frame body from `reader`.  Returns `None` on a clean end
/// of stream before the header; a stream that ends inside a frame is
/// an `UnexpectedEof` error.
pub fn read_frame(reader: &mut impl Read, max_len: usize) -> std::io::Result<Option<Vec<u8>>> {
    let mut header = [0u8; 4];
    let mut filled = 0;

    while filled < header.len() {
        match reader.read(&mut header[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => {
                return Err(Error::new(
                    ErrorKind::UnexpectedEof,
                    format!("stream ended after {} header bytes", filled),
                ))
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }

    let len = u32::from_le_bytes(header) as usize;
    if len > max_len {
        return Err(Error::new(
            ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds {} byte limit", len, max_len),
        ));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;
    Ok(Some(body))
}

/// Writes a complete frame (as returned by the `encode_*` functions).
pub fn write_frame(writer: &mut impl Write, frame: &[u8]) -> std::io::Result<()> {
    writer.write_all(frame)?;
    writer.flush()
}
