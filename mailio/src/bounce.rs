//! Asynchronous bounce, defer and trace requests.
//!
//! Each request is a single exchange with one of the delivery status
//! services: connect, write one attribute record, then wait in the event
//! loop for one reply record carrying a `status`. The caller's completion
//! closure runs exactly once with that status, or with `-1` if anything
//! fails on the way: connect, serialization, the reply deadline, or a
//! missing or malformed reply. The connection is closed before the closure
//! runs.
//!
//! Connecting blocks the caller; only the wait for the reply goes through
//! the dispatcher.
//!
//! ```no_run
//! use std::rc::Rc;
//! use mailio::{BounceClient, BounceFlags, Config, Envelope, EventLoop, MailConnector};
//!
//! let config = Config::default();
//! let ev = Rc::new(EventLoop::new());
//! let client = BounceClient::new(
//!     ev.clone(),
//!     Rc::new(MailConnector::new(config.clone())),
//!     &config,
//! );
//! let msg = Envelope {
//!     queue: "active",
//!     id: "3F2A51C0B2",
//!     encoding: "8bit",
//!     sender: "owner@example.com",
//! };
//! client.flush(BounceFlags::empty(), &msg, |status| {
//!     println!("bounce finished with status {}", status);
//! });
//! ev.run_until(|| false)?;
//! # Ok::<(), mailio::Error>(())
//! ```

use std::cell::RefCell;
use std::convert::TryFrom;
use std::io::{self, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::{Rc, Weak};
use std::time::Duration;

use bitflags::bitflags;
use log::{debug, info, warn};

use crate::attr::{encode_record, ParseResult, Record, RecordReader};
use crate::config::{Config, MAIL_CLASS_PRIVATE};
use crate::connect::ConnectionProvider;
use crate::error::*;
use crate::event::{Dispatcher, EventHandler, EventKind, Token};
use crate::stream::Stream;

pub const MAIL_ATTR_NREQ: &str = "nrequest";
pub const MAIL_ATTR_FLAGS: &str = "flags";
pub const MAIL_ATTR_QUEUE: &str = "queue_name";
pub const MAIL_ATTR_QUEUEID: &str = "queue_id";
pub const MAIL_ATTR_ENCODING: &str = "encoding";
pub const MAIL_ATTR_SENDER: &str = "sender";
pub const MAIL_ATTR_VERPDL: &str = "verp_delimiters";
pub const MAIL_ATTR_STATUS: &str = "status";

/// Request codes understood by the bounce, defer and trace services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BounceCommand {
    Append,
    Flush,
    Warn,
    Verp,
    One,
    Trace,
}

impl BounceCommand {
    pub fn code(self) -> u32 {
        match self {
            BounceCommand::Append => 0,
            BounceCommand::Flush => 1,
            BounceCommand::Warn => 2,
            BounceCommand::Verp => 3,
            BounceCommand::One => 4,
            BounceCommand::Trace => 5,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(BounceCommand::Append),
            1 => Some(BounceCommand::Flush),
            2 => Some(BounceCommand::Warn),
            3 => Some(BounceCommand::Verp),
            4 => Some(BounceCommand::One),
            5 => Some(BounceCommand::Trace),
            _ => None,
        }
    }

    /// What failed, in the wording of the deferral log line.
    pub fn what(self) -> &'static str {
        match self {
            BounceCommand::Flush | BounceCommand::Verp => "bounce",
            BounceCommand::Warn => "delay warning",
            BounceCommand::Trace => "trace",
            _ => "whatever",
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BounceFlags: u32 {
        /// Do not log a deferral when the request fails.
        const CLEAN = 1 << 0;
        /// Delete recipients from the queue file after success.
        const DELRCPT = 1 << 1;
    }
}

/// The message a request is about.
#[derive(Debug, Clone, Copy)]
pub struct Envelope<'a> {
    pub queue: &'a str,
    pub id: &'a str,
    pub encoding: &'a str,
    pub sender: &'a str,
}

/// One request as it travels on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BounceRequest {
    pub command: BounceCommand,
    pub flags: BounceFlags,
    pub queue: String,
    pub id: String,
    pub encoding: String,
    pub sender: String,
    pub verp: Option<String>,
}

impl BounceRequest {
    pub fn new(command: BounceCommand, flags: BounceFlags, msg: &Envelope<'_>) -> Self {
        BounceRequest {
            command,
            flags,
            queue: msg.queue.into(),
            id: msg.id.into(),
            encoding: msg.encoding.into(),
            sender: msg.sender.into(),
            verp: None,
        }
    }

    /// Attributes in the order the services read them.
    pub fn to_record(&self) -> Record {
        let record = Record::new()
            .num(MAIL_ATTR_NREQ, self.command.code())
            .num(MAIL_ATTR_FLAGS, self.flags.bits())
            .str(MAIL_ATTR_QUEUE, &self.queue)
            .str(MAIL_ATTR_QUEUEID, &self.id)
            .str(MAIL_ATTR_ENCODING, &self.encoding)
            .str(MAIL_ATTR_SENDER, &self.sender);
        match self.verp {
            Some(ref verp) => record.str(MAIL_ATTR_VERPDL, verp),
            None => record,
        }
    }

    pub fn from_record(record: &Record) -> Result<Self> {
        let code = record.get_num(MAIL_ATTR_NREQ)?;
        let command = BounceCommand::from_code(code)
            .ok_or_else(|| Error::Protocol(format!("unknown request code {}", code)))?;
        Ok(BounceRequest {
            command,
            flags: BounceFlags::from_bits_truncate(record.get_num(MAIL_ATTR_FLAGS)?),
            queue: record.get_str(MAIL_ATTR_QUEUE)?.into(),
            id: record.get_str(MAIL_ATTR_QUEUEID)?.into(),
            encoding: record.get_str(MAIL_ATTR_ENCODING)?.into(),
            sender: record.get_str(MAIL_ATTR_SENDER)?.into(),
            verp: record.get(MAIL_ATTR_VERPDL).map(String::from),
        })
    }
}

/// The log line for a failed request, unless `CLEAN` silences it.
pub fn deferral_notice(
    command: BounceCommand,
    flags: BounceFlags,
    id: &str,
    status: i32,
) -> Option<String> {
    if status != 0 && !flags.contains(BounceFlags::CLEAN) {
        Some(format!("{}: status=deferred ({} failed)", id, command.what()))
    } else {
        None
    }
}

type Completion = Box<dyn FnOnce(i32)>;

/// A request between its flush and its reply.
struct Pending {
    command: BounceCommand,
    flags: BounceFlags,
    id: String,
    fd: RawFd,
    token: Token,
    stream: Box<dyn Stream>,
    reader: RecordReader,
    callback: Completion,
}

impl Pending {
    /// Pull what the socket has. `None` means keep waiting.
    fn read_reply(&mut self) -> Option<i32> {
        let eof = match self.reader.read_from(&mut *self.stream) {
            Ok(n) => n == 0,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                warn!("{}: read() would block on readable descriptor", self.id);
                return None;
            }
            Err(e) => {
                debug!("{}: reading reply: {}", self.id, e);
                return Some(-1);
            }
        };
        match self.reader.poll() {
            ParseResult::Complete { record, .. } => match record.scan_num(MAIL_ATTR_STATUS) {
                Ok(status) => Some(i32::try_from(status).unwrap_or(-1)),
                Err(e) => {
                    debug!("{}: malformed reply: {}", self.id, e);
                    Some(-1)
                }
            },
            ParseResult::Incomplete if eof => {
                debug!("{}: connection closed before reply", self.id);
                Some(-1)
            }
            ParseResult::Incomplete => None,
            ParseResult::Invalid { error } => {
                debug!("{}: malformed reply: {}", self.id, error);
                Some(-1)
            }
        }
    }
}

/// Issues bounce, defer and trace requests on behalf of a queue manager.
pub struct BounceClient {
    dispatcher: Rc<dyn Dispatcher>,
    connector: Rc<dyn ConnectionProvider>,
    bounce_service: String,
    defer_service: String,
    trace_service: String,
    reply_timeout: Duration,
}

impl BounceClient {
    pub fn new(
        dispatcher: Rc<dyn Dispatcher>,
        connector: Rc<dyn ConnectionProvider>,
        config: &Config,
    ) -> Self {
        BounceClient {
            dispatcher,
            connector,
            bounce_service: config.bounce_service.clone(),
            defer_service: config.defer_service.clone(),
            trace_service: config.trace_service.clone(),
            reply_timeout: config.ipc_timeout(),
        }
    }

    /// Return the message's bounce log to the sender.
    pub fn flush<F>(&self, flags: BounceFlags, msg: &Envelope<'_>, callback: F)
    where
        F: FnOnce(i32) + 'static,
    {
        let request = BounceRequest::new(BounceCommand::Flush, flags, msg);
        self.request(MAIL_CLASS_PRIVATE, &self.bounce_service, request, callback)
    }

    /// Like [`flush`](Self::flush), one notification per recipient with
    /// VERP style sender addresses built from `verp` delimiters.
    pub fn flush_verp<F>(&self, flags: BounceFlags, msg: &Envelope<'_>, verp: &str, callback: F)
    where
        F: FnOnce(i32) + 'static,
    {
        let mut request = BounceRequest::new(BounceCommand::Verp, flags, msg);
        request.verp = Some(verp.into());
        self.request(MAIL_CLASS_PRIVATE, &self.bounce_service, request, callback)
    }

    /// Return the defer log to the sender and delete the recipients.
    pub fn defer_flush<F>(&self, flags: BounceFlags, msg: &Envelope<'_>, callback: F)
    where
        F: FnOnce(i32) + 'static,
    {
        let request = BounceRequest::new(BounceCommand::Flush, flags | BounceFlags::DELRCPT, msg);
        self.request(MAIL_CLASS_PRIVATE, &self.defer_service, request, callback)
    }

    pub fn defer_flush_verp<F>(
        &self,
        flags: BounceFlags,
        msg: &Envelope<'_>,
        verp: &str,
        callback: F,
    ) where
        F: FnOnce(i32) + 'static,
    {
        let mut request =
            BounceRequest::new(BounceCommand::Verp, flags | BounceFlags::DELRCPT, msg);
        request.verp = Some(verp.into());
        self.request(MAIL_CLASS_PRIVATE, &self.defer_service, request, callback)
    }

    /// Send a delay warning. Recipients are never deleted by a warning,
    /// whatever `flags` says.
    pub fn warn<F>(&self, flags: BounceFlags, msg: &Envelope<'_>, callback: F)
    where
        F: FnOnce(i32) + 'static,
    {
        let request = BounceRequest::new(BounceCommand::Warn, flags - BounceFlags::DELRCPT, msg);
        self.request(MAIL_CLASS_PRIVATE, &self.defer_service, request, callback)
    }

    /// Return the delivery trace to the sender.
    pub fn trace_flush<F>(&self, flags: BounceFlags, msg: &Envelope<'_>, callback: F)
    where
        F: FnOnce(i32) + 'static,
    {
        let request = BounceRequest::new(BounceCommand::Trace, flags, msg);
        self.request(MAIL_CLASS_PRIVATE, &self.trace_service, request, callback)
    }

    /// Send `request` to `service` of `class` and report the reply status to
    /// `callback`.
    ///
    /// Connect and serialization failures run `callback` with `-1` before
    /// this returns; otherwise it runs from the dispatcher.
    pub fn request<F>(&self, class: &str, service: &str, request: BounceRequest, callback: F)
    where
        F: FnOnce(i32) + 'static,
    {
        let command = request.command;
        let flags = request.flags;
        let callback: Completion = Box::new(callback);

        let stream = match self.send(class, service, &request) {
            Ok(stream) => stream,
            Err(e) => {
                debug!("{}: {}/{}: {}", request.id, class, service, e);
                return complete(command, flags, &request.id, -1, callback);
            }
        };

        let fd = stream.as_raw_fd();
        let token = self.dispatcher.new_token();
        let slot: Rc<RefCell<Option<Pending>>> = Rc::new(RefCell::new(None));
        let handler: EventHandler = {
            let slot = slot.clone();
            let dispatcher = Rc::downgrade(&self.dispatcher);
            Rc::new(move |kind| reply_event(&dispatcher, &slot, kind))
        };
        *slot.borrow_mut() = Some(Pending {
            command,
            flags,
            id: request.id,
            fd,
            token,
            stream,
            reader: RecordReader::default(),
            callback,
        });
        self.dispatcher.enable_read(fd, handler.clone());
        if !self.reply_timeout.is_zero() {
            self.dispatcher.request_timer(token, handler, self.reply_timeout);
        }
    }

    fn send(&self, class: &str, service: &str, request: &BounceRequest) -> Result<Box<dyn Stream>> {
        let mut stream = self.connector.connect_wait(class, service)?;
        let payload = encode_record(&request.to_record())?;
        stream.write_all(&payload)?;
        stream.flush()?;
        stream.set_nonblocking(true)?;
        debug!(
            "{}: {:?} request sent to {}/{}",
            request.id, request.command, class, service
        );
        Ok(stream)
    }
}

fn reply_event(dispatcher: &Weak<dyn Dispatcher>, slot: &RefCell<Option<Pending>>, kind: EventKind) {
    let status = {
        let mut guard = slot.borrow_mut();
        let pending = match guard.as_mut() {
            Some(pending) => pending,
            None => return,
        };
        match kind {
            EventKind::Readable => match pending.read_reply() {
                Some(status) => status,
                None => return,
            },
            EventKind::Timeout => {
                debug!("{}: timeout while waiting for reply", pending.id);
                -1
            }
            EventKind::Exception | EventKind::Writable => {
                debug!("{}: {:?} while waiting for reply", pending.id, kind);
                -1
            }
        }
    };

    let pending = match slot.borrow_mut().take() {
        Some(pending) => pending,
        None => return,
    };
    if let Some(dispatcher) = dispatcher.upgrade() {
        dispatcher.disable_readwrite(pending.fd);
        dispatcher.cancel_timer(pending.token);
    }
    let Pending {
        command,
        flags,
        id,
        stream,
        callback,
        ..
    } = pending;
    drop(stream);
    complete(command, flags, &id, status, callback);
}

fn complete(command: BounceCommand, flags: BounceFlags, id: &str, status: i32, callback: Completion) {
    if let Some(notice) = deferral_notice(command, flags, id, status) {
        info!("{}", notice);
    }
    callback(status);
}
