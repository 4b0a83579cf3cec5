//! The socket front end of the authority.  A listener thread accepts
//! connections on the cache directory's Unix socket, and each
//! connection gets a thread that decodes requests and forwards them,
//! in order, to the authority's queue.  Connection threads never touch
//! the cache state themselves.
use std::io::BufReader;
use std::io::BufWriter;
use std::io::Error;
use std::io::ErrorKind;
use std::io::Result;
use std::io::Write;
use std::os::unix::net::UnixListener;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::error::QuotaError;
use crate::manager::Envelope;
use crate::protocol;
use crate::protocol::MAX_REQUEST_LEN;

/// The accept loop checks for a stop request at least this often.
const STOP_POLL_MS: libc::c_int = 100;

/// Binds the authority socket at `path`.  A leftover socket file from
/// a dead authority is replaced; a live one is an error.
pub(crate) fn bind(path: &Path) -> Result<UnixListener> {
    match UnixListener::bind(path) {
        Err(e) if e.kind() == ErrorKind::AddrInUse => {}
        ret => return ret,
    }

    if UnixStream::connect(path).is_ok() {
        return Err(std::io::Error::new(
            ErrorKind::AddrInUse,
            format!("another quota manager is serving {}", path.display()),
        ));
    }

    tracing::info!(path = %path.display(), "replacing stale quota manager socket");
    std::fs::remove_file(path)?;
    UnixListener::bind(path)
}

/// A running accept loop.
#[derive(Debug)]
pub(crate) struct Listener {
    path: PathBuf,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Listener {
    pub(crate) fn spawn(
        listener: UnixListener,
        path: PathBuf,
        authority: Sender<Envelope>,
    ) -> Result<Listener> {
        listener.set_nonblocking(true)?;
        let stop = Arc::new(AtomicBool::new(false));
        let thread = {
            let stop = stop.clone();

            std::thread::Builder::new()
                .name("quota-listener".to_owned())
                .spawn(move || accept_loop(listener, &stop, authority))?
        };

        Ok(Listener {
            path,
            stop,
            thread: Some(thread),
        })
    }

    /// Stops accepting connections and removes the socket file.
    /// Established connections keep forwarding until their peer hangs
    /// up or the authority goes away.
    pub(crate) fn stop(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("quota listener thread panicked");
            }
        }

        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::debug!(path = %self.path.display(), %e, "failed to remove quota manager socket");
        }
    }
}

/// Waits up to `STOP_POLL_MS` for a pending connection.
fn wait_for_client(listener: &UnixListener) -> Result<bool> {
    let mut pfd = libc::pollfd {
        fd: listener.as_raw_fd(),
        events: libc::POLLIN,
        revents: 0,
    };

    // SAFETY: `pfd` is a single valid pollfd for the call's duration.
    match unsafe { libc::poll(&mut pfd, 1, STOP_POLL_MS) } {
        rc if rc > 0 => Ok(true),
        0 => Ok(false),
        _ => {
            let e = Error::last_os_error();
            if e.kind() == ErrorKind::Interrupted {
                Ok(false)
            } else {
                Err(e)
            }
        }
    }
}

fn accept_loop(listener: UnixListener, stop: &AtomicBool, authority: Sender<Envelope>) {
    while !stop.load(Ordering::SeqCst) {
        match wait_for_client(&listener) {
            Ok(true) => {}
            Ok(false) => continue,
            Err(e) => {
                tracing::error!(%e, "failed to poll quota manager socket");
                break;
            }
        }

        if stop.load(Ordering::SeqCst) {
            break;
        }

        let stream = match listener.accept() {
            Ok((stream, _)) => stream,
            Err(e) if e.kind() == ErrorKind::WouldBlock => continue,
            Err(e) => {
                tracing::warn!(%e, "failed to accept quota client");
                continue;
            }
        };

        // Connection threads block on their stream.
        if let Err(e) = stream.set_nonblocking(false) {
            tracing::warn!(%e, "failed to configure quota client stream");
            continue;
        }

        let authority = authority.clone();
        let spawned = std::thread::Builder::new()
            .name("quota-connection".to_owned())
            .spawn(move || serve_connection(stream, authority));
        if let Err(e) = spawned {
            tracing::warn!(%e, "failed to spawn connection thread");
        }
    }
}

/// Sends an error reply for a request we could not even decode.  The
/// stream is out of sync afterwards, so the caller hangs up.
fn reject(writer: &mut impl Write, error: QuotaError) {
    tracing::warn!(%error, "rejecting malformed quota request");

    if let Ok(frame) = protocol::encode_response(&Err(error)) {
        let _ = protocol::write_frame(writer, &frame);
    }
}

fn serve_connection(stream: UnixStream, authority: Sender<Envelope>) {
    let mut writer = match stream.try_clone() {
        Ok(clone) => BufWriter::new(clone),
        Err(e) => {
            tracing::warn!(%e, "failed to clone quota client stream");
            return;
        }
    };
    let mut reader = BufReader::new(stream);

    loop {
        let body = match protocol::read_frame(&mut reader, MAX_REQUEST_LEN) {
            Ok(Some(body)) => body,
            Ok(None) => break,
            Err(e) if e.kind() == ErrorKind::InvalidData => {
                reject(&mut writer, QuotaError::Protocol(e.to_string()));
                break;
            }
            Err(e) => {
                tracing::debug!(%e, "quota client connection failed");
                break;
            }
        };

        let request = match protocol::decode_request(&body) {
            Ok(request) => request,
            Err(e) => {
                reject(&mut writer, e);
                break;
            }
        };

        if !request.want_reply {
            let envelope = Envelope::Request {
                command: request.command,
                reply: None,
            };

            if authority.send(envelope).is_err() {
                break;
            }

            continue;
        }

        let (reply, response) = mpsc::channel();
        let envelope = Envelope::Request {
            command: request.command,
            reply: Some(reply),
        };

        if authority.send(envelope).is_err() {
            break;
        }

        // The authority drops the sender without replying only when it
        // is gone for good.
        let response = match response.recv() {
            Ok(response) => response,
            Err(_) => break,
        };

        let written = protocol::encode_response(&response)
            .map_err(|e| std::io::Error::new(ErrorKind::InvalidData, e.to_string()))
            .and_then(|frame| protocol::write_frame(&mut writer, &frame));
        if let Err(e) = written {
            // The client is gone; its command was applied regardless.
            tracing::debug!(%e, "failed to send quota reply");
            break;
        }
    }
}

#[cfg(test)]
mod test {
    use crate::server::*;
    use std::time::Duration;
    use test_dir::{DirBuilder, TestDir};

    #[test]
    fn bind_refuses_live_socket() {
        let temp = TestDir::temp();
        let path = temp.path("socket");

        let live = bind(&path).expect("bind must succeed");
        assert!(matches!(bind(&path), Err(e) if e.kind() == ErrorKind::AddrInUse));

        // Stale once nobody listens.
        drop(live);
        bind(&path).expect("bind must replace a stale socket");
    }

    /// Stopping must not depend on the socket file still being there.
    #[test]
    fn stop_without_socket_file() {
        let temp = TestDir::temp();
        let path = temp.path("socket");
        let (sender, _inbox) = mpsc::channel();

        let listener = Listener::spawn(
            bind(&path).expect("bind must succeed"),
            path.clone(),
            sender,
        )
        .expect("spawn must succeed");
        std::fs::remove_file(&path).expect("remove must succeed");

        let (done, stopped) = mpsc::channel();
        std::thread::spawn(move || {
            listener.stop();
            let _ = done.send(());
        });
        stopped
            .recv_timeout(Duration::from_secs(5))
            .expect("stop must finish");
    }
}
