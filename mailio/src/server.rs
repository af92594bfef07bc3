//! Serve the receiving side of the bounce protocol
//!
//! One request record per connection: read it, hand it to a
//! [`BounceService`], write back a `status` record and close. This is what
//! the bounce, defer and trace daemons look like from a client's point of
//! view, and what the client tests run against.

use std::fs;
use std::io::{self, Write};
use std::net::TcpListener;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixListener;
use std::path::PathBuf;
use std::time::Duration;

use log::{debug, warn};

use crate::attr::{encode_record, ParseResult, Record, RecordReader};
use crate::bounce::{BounceRequest, MAIL_ATTR_STATUS};
use crate::connect::ServiceAddress;
use crate::error::*;
use crate::event::poll_timeout;
use crate::stream::Stream;

#[derive(Debug)]
pub enum Listener {
    TCP(TcpListener),
    UNIX(UnixListener, PathBuf),
}

impl Listener {
    /// Bind to a `unix:` or `tcp:` address. A stale UNIX socket file is
    /// replaced, and removed again when the listener is dropped.
    pub fn new<S: ?Sized + AsRef<str>>(address: &S) -> Result<Self> {
        match ServiceAddress::parse(address)? {
            ServiceAddress::Tcp(addr) => Ok(Listener::TCP(TcpListener::bind(addr.as_str())?)),
            ServiceAddress::Unix(path) => {
                // ignore error on non-existent file
                let _ = fs::remove_file(&path);
                let listener = UnixListener::bind(&path)?;
                Ok(Listener::UNIX(listener, path))
            }
        }
    }

    /// The address clients should connect to; resolves `tcp:...:0` to the
    /// port actually bound.
    pub fn address(&self) -> Result<String> {
        match self {
            Listener::TCP(l) => Ok(format!("tcp:{}", l.local_addr()?)),
            Listener::UNIX(_, path) => Ok(format!("unix:{}", path.display())),
        }
    }

    /// Accept one connection, waiting at most `timeout` if given.
    pub fn accept(&self, timeout: Option<Duration>) -> Result<Box<dyn Stream>> {
        if timeout.is_some() {
            wait_readable(self.as_raw_fd(), timeout)?;
        }
        match self {
            Listener::TCP(l) => {
                let (s, _addr) = l.accept()?;
                Ok(Box::new(s))
            }
            Listener::UNIX(l, _) => {
                let (s, _addr) = l.accept()?;
                Ok(Box::new(s))
            }
        }
    }
}

impl AsRawFd for Listener {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            Listener::TCP(l) => l.as_raw_fd(),
            Listener::UNIX(l, _) => l.as_raw_fd(),
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Listener::UNIX(_, path) = self {
            let _ = fs::remove_file(path);
        }
    }
}

fn wait_readable(fd: RawFd, timeout: Option<Duration>) -> Result<()> {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    loop {
        let ret = unsafe { libc::poll(&mut pfd, 1, poll_timeout(timeout)) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err.into());
        }
        if ret == 0 {
            return Err(Error::Timeout);
        }
        return Ok(());
    }
}

/// Decides the status of one request.
pub trait BounceService {
    fn handle(&self, request: &BounceRequest) -> u32;
}

impl<F> BounceService for F
where
    F: Fn(&BounceRequest) -> u32,
{
    fn handle(&self, request: &BounceRequest) -> u32 {
        self(request)
    }
}

pub struct ServeConfig {
    /// Stop serving when no client connects for this long.
    pub idle_timeout: Option<Duration>,
    /// Bound on reading a request and writing the reply.
    pub ipc_timeout: Option<Duration>,
    /// Stop after this many answered requests.
    pub max_requests: Option<usize>,
}

impl Default for ServeConfig {
    fn default() -> Self {
        ServeConfig {
            idle_timeout: None,
            ipc_timeout: Some(Duration::from_secs(3600)),
            max_requests: None,
        }
    }
}

/// Answer requests until `max_requests` have been answered or no client
/// shows up within `idle_timeout`. Returns the number answered. A failing
/// connection is logged and does not stop the loop.
pub fn serve<S: BounceService + ?Sized>(
    listener: &Listener,
    service: &S,
    config: &ServeConfig,
) -> Result<usize> {
    let mut served = 0;
    loop {
        if let Some(max) = config.max_requests {
            if served >= max {
                return Ok(served);
            }
        }
        let mut stream = match listener.accept(config.idle_timeout) {
            Ok(stream) => stream,
            Err(Error::Timeout) => return Ok(served),
            Err(e) => return Err(e),
        };
        match handle_connection(&mut *stream, service, config.ipc_timeout) {
            Ok(_) => served += 1,
            Err(e) if e.is_connection_closed() => debug!("client went away: {}", e),
            Err(e) => warn!("bounce request failed: {}", e),
        }
    }
}

/// Read one request from `stream`, answer it, and return the status sent.
/// The stream is shut down after the reply, so the client sees end of file
/// even while the caller still holds it.
pub fn handle_connection<S: BounceService + ?Sized>(
    stream: &mut dyn Stream,
    service: &S,
    ipc_timeout: Option<Duration>,
) -> Result<u32> {
    stream.set_io_timeout(ipc_timeout)?;
    let mut reader = RecordReader::default();
    let record = loop {
        match reader.poll() {
            ParseResult::Complete { record, .. } => break record,
            ParseResult::Invalid { error } => return Err(Error::Protocol(error)),
            ParseResult::Incomplete => {
                if reader.read_from(&mut *stream)? == 0 {
                    return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
                }
            }
        }
    };
    let request = BounceRequest::from_record(&record)?;
    let status = service.handle(&request);
    debug!(
        "{}: {:?} request from {}: status {}",
        request.id, request.command, request.sender, status
    );
    let reply = encode_record(&Record::new().num(MAIL_ATTR_STATUS, status))?;
    stream.write_all(&reply)?;
    stream.flush()?;
    if let Err(e) = stream.shutdown() {
        debug!("{}: shutdown after reply: {}", request.id, e);
    }
    Ok(status)
}
