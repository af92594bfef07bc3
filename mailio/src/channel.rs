//! Non-blocking buffered duplex channel.
//!
//! A [`Channel`] owns one connected stream and two fixed-size buffers. The
//! application fills the write buffer or makes room in the read buffer, then
//! enables exactly one of read or write together with a timeout. When the
//! dispatcher reports readiness the channel performs a single `read` or
//! `write`, updates the pending counts and sticky flags, and hands control to
//! the application action. The channel never re-arms itself: the action
//! decides whether to read more, start writing, go dormant, or destroy.
//!
//! ```no_run
//! use std::os::unix::net::UnixStream;
//! use std::rc::Rc;
//! use std::time::Duration;
//! use mailio::{Channel, EventKind, EventLoop};
//!
//! let ev = Rc::new(EventLoop::new());
//! let (sock, _peer) = UnixStream::pair()?;
//! let chan = Channel::new(ev.clone(), Box::new(sock), 4096, "peer", |chan, kind| {
//!     if kind == EventKind::Readable && chan.flags().is_empty() {
//!         let n = chan.read_pend();
//!         chan.consume_read(n);
//!         chan.enable_read(Duration::from_secs(30));
//!     } else {
//!         chan.disable_readwrite();
//!     }
//! });
//! chan.enable_read(Duration::from_secs(30));
//! ev.run_until(|| false)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::cell::{Ref, RefCell};
use std::fmt;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;
use std::time::Duration;

use bitflags::bitflags;
use log::{debug, warn};

use crate::event::{Dispatcher, EventHandler, EventKind, Token};
use crate::stream::Stream;

bitflags! {
    /// Which pseudothread is currently enabled. At most one bit is ever set.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Active: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
    }
}

bitflags! {
    /// Sticky status bits. Set by the channel, cleared only through
    /// [`Channel::clear_flags`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ChannelFlags: u8 {
        const EOF = 1 << 0;
        const ERROR = 1 << 1;
        const TIMEOUT = 1 << 2;
    }
}

impl ChannelFlags {
    /// Any of the flags that end a conversation.
    pub fn is_failed(self) -> bool {
        self.intersects(ChannelFlags::EOF | ChannelFlags::ERROR | ChannelFlags::TIMEOUT)
    }
}

type Action = Rc<dyn Fn(&Channel, EventKind)>;

struct Inner {
    label: String,
    fd: RawFd,
    stream: Option<Box<dyn Stream>>,
    dispatcher: Rc<dyn Dispatcher>,
    token: Token,
    handler: EventHandler,
    action: Action,
    active: Active,
    flags: ChannelFlags,
    bufsize: usize,
    read_buf: Box<[u8]>,
    read_pend: usize,
    write_buf: Box<[u8]>,
    write_pend: usize,
}

/// Handle to a buffered duplex channel.
///
/// Handles are cheap clones of one shared channel. The action receives the
/// channel as its first argument, so it should not capture a handle itself;
/// doing so keeps the channel alive until [`destroy`](Channel::destroy).
#[derive(Clone)]
pub struct Channel {
    inner: Rc<RefCell<Inner>>,
}

impl Channel {
    /// Take ownership of a connected stream and switch it to non-blocking
    /// mode.
    ///
    /// # Panics
    ///
    /// If the descriptor is negative, `bufsize` is zero, or the descriptor
    /// cannot be made non-blocking.
    pub fn new<F>(
        dispatcher: Rc<dyn Dispatcher>,
        mut stream: Box<dyn Stream>,
        bufsize: usize,
        label: &str,
        action: F,
    ) -> Channel
    where
        F: Fn(&Channel, EventKind) + 'static,
    {
        let fd = stream.as_raw_fd();
        if fd < 0 {
            panic!("Channel::new: bad file descriptor: {}", fd);
        }
        if bufsize == 0 {
            panic!("Channel::new: bad buffer size: {}", bufsize);
        }
        if let Err(e) = stream.set_nonblocking(true) {
            panic!("{}: fd {}: cannot enable non-blocking mode: {}", label, fd, e);
        }

        let token = dispatcher.new_token();
        let inner = Rc::new_cyclic(|weak: &std::rc::Weak<RefCell<Inner>>| {
            let weak = weak.clone();
            let handler: EventHandler = Rc::new(move |kind| {
                if let Some(inner) = weak.upgrade() {
                    Channel { inner }.event(kind);
                }
            });
            RefCell::new(Inner {
                label: label.to_string(),
                fd,
                stream: Some(stream),
                dispatcher,
                token,
                handler,
                action: Rc::new(action),
                active: Active::empty(),
                flags: ChannelFlags::empty(),
                bufsize,
                read_buf: vec![0u8; bufsize].into_boxed_slice(),
                read_pend: 0,
                write_buf: vec![0u8; bufsize].into_boxed_slice(),
                write_pend: 0,
            })
        });
        debug!("{}: fd {}: channel created, bufsize {}", label, fd, bufsize);
        Channel { inner }
    }

    /// Wait until the stream is readable, or until `timeout` expires.
    ///
    /// # Panics
    ///
    /// If a pseudothread is already active, `timeout` is zero, or the read
    /// buffer is full.
    pub fn enable_read(&self, timeout: Duration) {
        let (dispatcher, fd, token, handler) = {
            let mut inner = self.live_mut("enable_read");
            inner.check_enable("enable_read", timeout);
            if inner.read_pend >= inner.bufsize {
                panic!(
                    "{}: fd {}: enable_read: read buffer is full",
                    inner.label, inner.fd
                );
            }
            inner.active = Active::READ;
            inner.registration()
        };
        dispatcher.enable_read(fd, handler.clone());
        dispatcher.request_timer(token, handler, timeout);
    }

    /// Wait until the stream is writable, or until `timeout` expires.
    ///
    /// # Panics
    ///
    /// If a pseudothread is already active, `timeout` is zero, or the write
    /// buffer is empty.
    pub fn enable_write(&self, timeout: Duration) {
        let (dispatcher, fd, token, handler) = {
            let mut inner = self.live_mut("enable_write");
            inner.check_enable("enable_write", timeout);
            if inner.write_pend == 0 {
                panic!(
                    "{}: fd {}: enable_write: write buffer is empty",
                    inner.label, inner.fd
                );
            }
            inner.active = Active::WRITE;
            inner.registration()
        };
        dispatcher.enable_write(fd, handler.clone());
        dispatcher.request_timer(token, handler, timeout);
    }

    /// Cancel any I/O interest and the timer. Safe to call when dormant.
    pub fn disable_readwrite(&self) {
        let (dispatcher, fd, token, _) = {
            let mut inner = self.live_mut("disable_readwrite");
            inner.active = Active::empty();
            inner.registration()
        };
        dispatcher.disable_readwrite(fd);
        dispatcher.cancel_timer(token);
    }

    /// Go dormant but keep a liveness timer: no I/O interest, and a
    /// `Timeout` event after `timeout` unless something is enabled first.
    pub fn quiesce(&self, timeout: Duration) {
        if timeout.is_zero() {
            panic!("{}: quiesce: bad timeout {:?}", self.label(), timeout);
        }
        self.disable_readwrite();
        let (dispatcher, _, token, handler) = self.inner.borrow().registration();
        dispatcher.request_timer(token, handler, timeout);
    }

    /// Cancel all registrations, close the stream and release both buffers.
    /// Any later use of another handle to this channel panics.
    pub fn destroy(self) {
        self.disable_readwrite();
        let stream = {
            let mut inner = self.inner.borrow_mut();
            debug!("{}: fd {}: channel destroyed", inner.label, inner.fd);
            inner.read_buf = Box::default();
            inner.write_buf = Box::default();
            inner.read_pend = 0;
            inner.write_pend = 0;
            inner.stream.take()
        };
        drop(stream);
    }

    pub fn fd(&self) -> RawFd {
        self.inner.borrow().fd
    }

    pub fn label(&self) -> Ref<'_, str> {
        Ref::map(self.inner.borrow(), |i| i.label.as_str())
    }

    pub fn bufsize(&self) -> usize {
        self.inner.borrow().bufsize
    }

    pub fn active(&self) -> Active {
        self.inner.borrow().active
    }

    pub fn flags(&self) -> ChannelFlags {
        self.inner.borrow().flags
    }

    pub fn clear_flags(&self, mask: ChannelFlags) {
        self.inner.borrow_mut().flags.remove(mask);
    }

    pub fn read_pend(&self) -> usize {
        self.inner.borrow().read_pend
    }

    /// The unread bytes at the front of the read buffer.
    pub fn read_pending(&self) -> Ref<'_, [u8]> {
        Ref::map(self.inner.borrow(), |i| &i.read_buf[..i.read_pend])
    }

    /// Drop `n` bytes from the front of the read buffer, moving the rest up.
    pub fn consume_read(&self, n: usize) {
        let mut inner = self.live_mut("consume_read");
        let inner = &mut *inner;
        if n > inner.read_pend {
            panic!(
                "{}: consume_read: {} bytes requested, {} pending",
                inner.label, n, inner.read_pend
            );
        }
        inner.read_buf.copy_within(n..inner.read_pend, 0);
        inner.read_pend -= n;
    }

    pub fn write_pend(&self) -> usize {
        self.inner.borrow().write_pend
    }

    /// The queued, unsent bytes at the front of the write buffer.
    pub fn write_pending(&self) -> Ref<'_, [u8]> {
        Ref::map(self.inner.borrow(), |i| &i.write_buf[..i.write_pend])
    }

    /// Room left in the write buffer.
    pub fn write_vacant(&self) -> usize {
        let inner = self.inner.borrow();
        inner.bufsize - inner.write_pend
    }

    /// Append as much of `data` as fits in the write buffer and return how
    /// many bytes were taken. The buffer never grows.
    pub fn queue_write(&self, data: &[u8]) -> usize {
        let mut inner = self.live_mut("queue_write");
        let inner = &mut *inner;
        let n = data.len().min(inner.bufsize - inner.write_pend);
        inner.write_buf[inner.write_pend..inner.write_pend + n].copy_from_slice(&data[..n]);
        inner.write_pend += n;
        n
    }

    fn live_mut(&self, op: &str) -> std::cell::RefMut<'_, Inner> {
        let inner = self.inner.borrow_mut();
        if inner.stream.is_none() {
            panic!("{}: {}: channel used after destroy", inner.label, op);
        }
        inner
    }

    fn event(&self, kind: EventKind) {
        let action = {
            let mut inner = self.inner.borrow_mut();
            if inner.stream.is_none() {
                debug!("{}: {:?} event after destroy", inner.label, kind);
                return;
            }
            match kind {
                EventKind::Readable => inner.fill_read(),
                EventKind::Writable => inner.drain_write(),
                EventKind::Timeout => inner.flags.insert(ChannelFlags::TIMEOUT),
                EventKind::Exception => inner.flags.insert(ChannelFlags::ERROR),
            }
            inner.action.clone()
        };
        action(self, kind);
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Channel")
            .field("label", &inner.label)
            .field("fd", &inner.fd)
            .field("active", &inner.active)
            .field("flags", &inner.flags)
            .field("read_pend", &inner.read_pend)
            .field("write_pend", &inner.write_pend)
            .field("bufsize", &inner.bufsize)
            .finish()
    }
}

impl Inner {
    fn registration(&self) -> (Rc<dyn Dispatcher>, RawFd, Token, EventHandler) {
        (
            self.dispatcher.clone(),
            self.fd,
            self.token,
            self.handler.clone(),
        )
    }

    fn check_enable(&self, op: &str, timeout: Duration) {
        if !self.active.is_empty() {
            panic!(
                "{}: fd {}: {}: {:?} is already active",
                self.label, self.fd, op, self.active
            );
        }
        if timeout.is_zero() {
            panic!(
                "{}: fd {}: {}: bad timeout {:?}",
                self.label, self.fd, op, timeout
            );
        }
    }

    fn fill_read(&mut self) {
        if self.read_pend == self.bufsize {
            panic!("{}: fd {}: read buffer is full", self.label, self.fd);
        }
        let result = match self.stream.as_mut() {
            Some(stream) => stream.read(&mut self.read_buf[self.read_pend..]),
            None => return,
        };
        match result {
            Ok(0) => self.flags.insert(ChannelFlags::EOF),
            Ok(n) => self.read_pend += n,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                warn!(
                    "{}: fd {}: read() would block on readable descriptor",
                    self.label, self.fd
                );
            }
            Err(e) => {
                debug!("{}: fd {}: read: {}", self.label, self.fd, e);
                self.flags.insert(ChannelFlags::ERROR);
            }
        }
    }

    fn drain_write(&mut self) {
        if self.write_pend == 0 {
            panic!("{}: fd {}: write buffer is empty", self.label, self.fd);
        }
        let result = match self.stream.as_mut() {
            Some(stream) => stream.write(&self.write_buf[..self.write_pend]),
            None => return,
        };
        match result {
            Ok(0) => {
                debug!("{}: fd {}: write accepted no data", self.label, self.fd);
                self.flags.insert(ChannelFlags::ERROR);
            }
            Ok(n) => {
                self.write_buf.copy_within(n..self.write_pend, 0);
                self.write_pend -= n;
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                warn!(
                    "{}: fd {}: write() would block on writable descriptor",
                    self.label, self.fd
                );
            }
            Err(e) => {
                debug!("{}: fd {}: write: {}", self.label, self.fd, e);
                self.flags.insert(ChannelFlags::ERROR);
            }
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if self.stream.take().is_some() {
            self.dispatcher.disable_readwrite(self.fd);
            self.dispatcher.cancel_timer(self.token);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::{ManualDispatcher, ScriptedStream};
    use std::cell::Cell;

    const TIMEOUT: Duration = Duration::from_secs(30);

    struct Fixture {
        ev: Rc<ManualDispatcher>,
        calls: Rc<RefCell<Vec<EventKind>>>,
    }

    impl Fixture {
        fn new() -> Self {
            Fixture {
                ev: Rc::new(ManualDispatcher::new()),
                calls: Rc::new(RefCell::new(Vec::new())),
            }
        }

        fn channel(&self, stream: ScriptedStream, bufsize: usize) -> Channel {
            let calls = self.calls.clone();
            Channel::new(
                self.ev.clone(),
                Box::new(stream),
                bufsize,
                "test",
                move |_, kind| calls.borrow_mut().push(kind),
            )
        }
    }

    #[test]
    fn test_new_channel_is_dormant() {
        let fx = Fixture::new();
        let chan = fx.channel(ScriptedStream::new(5), 1024);
        assert_eq!(chan.read_pend(), 0);
        assert_eq!(chan.write_pend(), 0);
        assert_eq!(chan.bufsize(), 1024);
        assert!(chan.active().is_empty());
        assert!(chan.flags().is_empty());
        assert_eq!(&*chan.label(), "test");
        assert_eq!(chan.fd(), 5);
        assert!(fx.ev.is_idle());
    }

    #[test]
    #[should_panic(expected = "bad file descriptor")]
    fn test_negative_fd_panics() {
        let fx = Fixture::new();
        fx.channel(ScriptedStream::new(-1), 1024);
    }

    #[test]
    #[should_panic(expected = "bad buffer size")]
    fn test_zero_bufsize_panics() {
        let fx = Fixture::new();
        fx.channel(ScriptedStream::new(5), 0);
    }

    #[test]
    fn test_read_fills_from_pending_offset() {
        let fx = Fixture::new();
        let chan = fx.channel(
            ScriptedStream::new(5).read(b"hello ").read(b"world"),
            16,
        );
        chan.enable_read(TIMEOUT);
        assert_eq!(fx.ev.interest(5), Some(EventKind::Readable));
        assert_eq!(fx.ev.timer_delays(), vec![TIMEOUT]);
        assert_eq!(chan.active(), Active::READ);

        fx.ev.fire(5, EventKind::Readable);
        chan.disable_readwrite();
        chan.enable_read(TIMEOUT);
        fx.ev.fire(5, EventKind::Readable);

        assert_eq!(&*chan.read_pending(), b"hello world");
        assert_eq!(*fx.calls.borrow(), vec![EventKind::Readable; 2]);
    }

    #[test]
    fn test_read_never_exceeds_bufsize() {
        let fx = Fixture::new();
        let chan = fx.channel(ScriptedStream::new(5).read(&[7u8; 64]), 10);
        chan.enable_read(TIMEOUT);
        fx.ev.fire(5, EventKind::Readable);
        assert_eq!(chan.read_pend(), 10);
        assert!(chan.flags().is_empty());
    }

    #[test]
    #[should_panic(expected = "read buffer is full")]
    fn test_enable_read_on_full_buffer_panics() {
        let fx = Fixture::new();
        let chan = fx.channel(ScriptedStream::new(5).read(b"0123"), 4);
        chan.enable_read(TIMEOUT);
        fx.ev.fire(5, EventKind::Readable);
        chan.disable_readwrite();
        chan.enable_read(TIMEOUT);
    }

    #[test]
    #[should_panic(expected = "read buffer is full")]
    fn test_readable_event_on_full_buffer_panics() {
        let fx = Fixture::new();
        let chan = fx.channel(ScriptedStream::new(5).read(b"0123").read(b"4"), 4);
        chan.enable_read(TIMEOUT);
        fx.ev.fire(5, EventKind::Readable);
        // reading left enabled on a full buffer
        fx.ev.fire(5, EventKind::Readable);
    }

    #[test]
    fn test_read_error_sets_sticky_flag() {
        let fx = Fixture::new();
        let chan = fx.channel(
            ScriptedStream::new(5)
                .read_err(io::ErrorKind::ConnectionReset)
                .read(b"later"),
            64,
        );
        chan.enable_read(TIMEOUT);
        fx.ev.fire(5, EventKind::Readable);
        assert_eq!(chan.flags(), ChannelFlags::ERROR);

        fx.ev.fire(5, EventKind::Readable);
        assert_eq!(chan.read_pend(), 5);
        assert_eq!(chan.flags(), ChannelFlags::ERROR);

        chan.clear_flags(ChannelFlags::ERROR);
        assert!(chan.flags().is_empty());
    }

    #[test]
    fn test_would_block_is_tolerated() {
        let fx = Fixture::new();
        let chan = fx.channel(ScriptedStream::new(5), 64);
        chan.enable_read(TIMEOUT);
        fx.ev.fire(5, EventKind::Readable);
        assert!(chan.flags().is_empty());
        assert_eq!(chan.read_pend(), 0);
        assert_eq!(*fx.calls.borrow(), vec![EventKind::Readable]);
    }

    #[test]
    fn test_partial_write_compacts_remainder() {
        let fx = Fixture::new();
        let stream = ScriptedStream::new(5).accept(3).accept(100);
        let written = stream.written();
        let chan = fx.channel(stream, 1024);

        assert_eq!(chan.queue_write(b"abcdefgh"), 8);
        chan.enable_write(TIMEOUT);
        assert_eq!(fx.ev.interest(5), Some(EventKind::Writable));

        fx.ev.fire(5, EventKind::Writable);
        assert_eq!(chan.write_pend(), 5);
        assert_eq!(&*chan.write_pending(), b"defgh");

        fx.ev.fire(5, EventKind::Writable);
        assert_eq!(chan.write_pend(), 0);
        assert_eq!(&*written.borrow(), b"abcdefgh");
        assert_eq!(*fx.calls.borrow(), vec![EventKind::Writable; 2]);
    }

    #[test]
    fn test_queue_write_never_grows() {
        let fx = Fixture::new();
        let chan = fx.channel(ScriptedStream::new(5), 8);
        assert_eq!(chan.queue_write(b"0123456789"), 8);
        assert_eq!(chan.write_vacant(), 0);
        assert_eq!(chan.queue_write(b"x"), 0);
    }

    #[test]
    fn test_write_error_sets_sticky_flag() {
        let fx = Fixture::new();
        let chan = fx.channel(
            ScriptedStream::new(5).write_err(io::ErrorKind::BrokenPipe),
            64,
        );
        chan.queue_write(b"data");
        chan.enable_write(TIMEOUT);
        fx.ev.fire(5, EventKind::Writable);
        assert_eq!(chan.flags(), ChannelFlags::ERROR);
        assert_eq!(chan.write_pend(), 4);
    }

    #[test]
    fn test_zero_length_write_sets_error() {
        let fx = Fixture::new();
        let chan = fx.channel(ScriptedStream::new(5).accept(0), 64);
        chan.queue_write(b"data");
        chan.enable_write(TIMEOUT);
        fx.ev.fire(5, EventKind::Writable);
        assert_eq!(chan.flags(), ChannelFlags::ERROR);
        assert_eq!(chan.write_pend(), 4);
        assert_eq!(*fx.calls.borrow(), vec![EventKind::Writable]);
    }

    #[test]
    #[should_panic(expected = "write buffer is empty")]
    fn test_enable_write_on_empty_buffer_panics() {
        let fx = Fixture::new();
        let chan = fx.channel(ScriptedStream::new(5), 64);
        chan.enable_write(TIMEOUT);
    }

    #[test]
    #[should_panic(expected = "already active")]
    fn test_second_pseudothread_panics() {
        let fx = Fixture::new();
        let chan = fx.channel(ScriptedStream::new(5), 64);
        chan.queue_write(b"x");
        chan.enable_read(TIMEOUT);
        chan.enable_write(TIMEOUT);
    }

    #[test]
    #[should_panic(expected = "bad timeout")]
    fn test_zero_timeout_panics() {
        let fx = Fixture::new();
        let chan = fx.channel(ScriptedStream::new(5), 64);
        chan.enable_read(Duration::from_secs(0));
    }

    #[test]
    #[should_panic(expected = "bad timeout")]
    fn test_quiesce_zero_timeout_panics() {
        let fx = Fixture::new();
        let chan = fx.channel(ScriptedStream::new(5), 64);
        chan.quiesce(Duration::from_secs(0));
    }

    #[test]
    fn test_timeout_and_exception_flags() {
        let fx = Fixture::new();
        let chan = fx.channel(ScriptedStream::new(5), 64);
        chan.enable_read(TIMEOUT);
        fx.ev.fire_timers();
        assert_eq!(chan.flags(), ChannelFlags::TIMEOUT);
        fx.ev.fire(5, EventKind::Exception);
        assert_eq!(chan.flags(), ChannelFlags::TIMEOUT | ChannelFlags::ERROR);
        assert!(chan.flags().is_failed());
        assert_eq!(
            *fx.calls.borrow(),
            vec![EventKind::Timeout, EventKind::Exception]
        );
    }

    #[test]
    fn test_disable_readwrite_is_idempotent() {
        let fx = Fixture::new();
        let chan = fx.channel(ScriptedStream::new(5), 64);
        chan.disable_readwrite();
        chan.disable_readwrite();
        assert!(chan.active().is_empty());
        assert!(chan.flags().is_empty());
        assert!(fx.ev.is_idle());

        chan.enable_read(TIMEOUT);
        chan.disable_readwrite();
        chan.disable_readwrite();
        assert!(fx.ev.is_idle());
        assert!(chan.active().is_empty());
    }

    #[test]
    fn test_quiesce_keeps_only_the_timer() {
        let fx = Fixture::new();
        let chan = fx.channel(ScriptedStream::new(5), 64);
        chan.enable_read(TIMEOUT);
        chan.quiesce(Duration::from_secs(300));
        assert!(chan.active().is_empty());
        assert_eq!(fx.ev.interest(5), None);
        assert_eq!(fx.ev.timer_delays(), vec![Duration::from_secs(300)]);

        fx.ev.fire_timers();
        assert_eq!(chan.flags(), ChannelFlags::TIMEOUT);
        assert_eq!(*fx.calls.borrow(), vec![EventKind::Timeout]);
    }

    #[test]
    fn test_action_drives_next_step() {
        let fx = Fixture::new();
        let stream = ScriptedStream::new(5).read(b"ping").accept(64);
        let written = stream.written();
        let chan = Channel::new(
            fx.ev.clone(),
            Box::new(stream),
            64,
            "echo",
            |chan, kind| match kind {
                EventKind::Readable => {
                    let data = chan.read_pending().to_vec();
                    chan.consume_read(data.len());
                    chan.queue_write(&data);
                    chan.disable_readwrite();
                    chan.enable_write(TIMEOUT);
                }
                _ => chan.disable_readwrite(),
            },
        );
        chan.enable_read(TIMEOUT);
        fx.ev.fire(5, EventKind::Readable);
        assert_eq!(chan.active(), Active::WRITE);
        fx.ev.fire(5, EventKind::Writable);
        assert!(chan.active().is_empty());
        assert_eq!(&*written.borrow(), b"ping");
    }

    #[test]
    fn test_destroy_closes_once() {
        let fx = Fixture::new();
        let stream = ScriptedStream::new(5);
        let closed = stream.closed();
        let chan = fx.channel(stream, 64);
        let other = chan.clone();
        chan.enable_read(TIMEOUT);
        chan.destroy();
        assert_eq!(closed.get(), 1);
        assert!(fx.ev.is_idle());
        drop(other);
        assert_eq!(closed.get(), 1);
    }

    #[test]
    fn test_drop_without_destroy_releases() {
        let fx = Fixture::new();
        let stream = ScriptedStream::new(5);
        let closed = stream.closed();
        let chan = fx.channel(stream, 64);
        chan.enable_read(TIMEOUT);
        drop(chan);
        assert_eq!(closed.get(), 1);
        assert!(fx.ev.is_idle());
    }

    #[test]
    fn test_destroy_from_action() {
        let fx = Fixture::new();
        let stream = ScriptedStream::new(5).read(b"");
        let closed = stream.closed();
        let holder: Rc<RefCell<Option<Channel>>> = Rc::new(RefCell::new(None));
        let destroyed = Rc::new(Cell::new(false));
        let (h, d) = (holder.clone(), destroyed.clone());
        let chan = Channel::new(fx.ev.clone(), Box::new(stream), 64, "eof", move |_, _| {
            if let Some(chan) = h.borrow_mut().take() {
                assert!(chan.flags().contains(ChannelFlags::EOF));
                chan.destroy();
                d.set(true);
            }
        });
        chan.enable_read(TIMEOUT);
        *holder.borrow_mut() = Some(chan);

        fx.ev.fire(5, EventKind::Readable);
        assert!(destroyed.get());
        assert_eq!(closed.get(), 1);
        assert!(fx.ev.is_idle());
    }

    #[test]
    #[should_panic(expected = "used after destroy")]
    fn test_use_after_destroy_panics() {
        let fx = Fixture::new();
        let chan = fx.channel(ScriptedStream::new(5), 64);
        let other = chan.clone();
        chan.destroy();
        other.enable_read(TIMEOUT);
    }
}
