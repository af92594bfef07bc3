//! Single-threaded event dispatch.
//!
//! Work that waits for I/O is represented as a registration with a
//! [`Dispatcher`]: an interest in one descriptor (readable or writable) plus
//! an optional one-shot timer, each carrying a handler closure. The dispatcher
//! calls the handler back with an [`EventKind`] when the condition occurs, and
//! the handler decides what to register next. Nothing here spawns threads.
//!
//! [`EventLoop`] is the production dispatcher built on `poll(2)`. Tests may
//! supply their own implementation of the trait to fire events by hand.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::{Duration, Instant};

use log::{debug, trace};

use crate::error::*;

/// Condition reported to a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Readable,
    Writable,
    Timeout,
    Exception,
}

/// Identifies a timer registration. Obtain one from [`Dispatcher::new_token`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token(pub u64);

pub type EventHandler = Rc<dyn Fn(EventKind)>;

/// The event source consumed by channels and bounce requests.
///
/// A descriptor carries at most one I/O interest at a time. Enabling read on
/// a descriptor that is enabled for write (or the reverse) is a programming
/// error and panics.
pub trait Dispatcher {
    fn enable_read(&self, fd: RawFd, handler: EventHandler);
    fn enable_write(&self, fd: RawFd, handler: EventHandler);
    /// Drop any read or write interest in `fd`. No-op if there is none.
    fn disable_readwrite(&self, fd: RawFd);
    /// Arm a one-shot timer. Requesting an armed token again replaces its
    /// deadline and handler.
    fn request_timer(&self, token: Token, handler: EventHandler, delay: Duration);
    /// Returns true if the timer was armed.
    fn cancel_timer(&self, token: Token) -> bool;
    fn new_token(&self) -> Token;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interest {
    Read,
    Write,
}

struct Registration {
    interest: Interest,
    handler: EventHandler,
}

struct Timer {
    deadline: Instant,
    handler: EventHandler,
}

#[derive(Default)]
struct LoopState {
    fds: BTreeMap<RawFd, Registration>,
    timers: HashMap<Token, Timer>,
    next_token: u64,
}

/// `poll(2)` based [`Dispatcher`].
///
/// Each [`run_once`](EventLoop::run_once) round first delivers expired timers
/// in deadline order, then I/O readiness. A registration is looked up again
/// right before its handler runs, so a handler that disables another
/// descriptor or timer during the round prevents that delivery.
#[derive(Default)]
pub struct EventLoop {
    state: RefCell<LoopState>,
}

impl EventLoop {
    pub fn new() -> Self {
        Self::default()
    }

    /// True if no descriptor interest and no timer is registered.
    pub fn is_idle(&self) -> bool {
        let state = self.state.borrow();
        state.fds.is_empty() && state.timers.is_empty()
    }

    /// Wait for at most `max_wait` (forever if `None`, bounded by the
    /// earliest timer) and deliver what is ready. Returns the number of
    /// handler invocations.
    pub fn run_once(&self, max_wait: Option<Duration>) -> Result<usize> {
        let (mut pollfds, interests, wait) = {
            let state = self.state.borrow();
            let now = Instant::now();
            let next_timer = state
                .timers
                .values()
                .map(|t| t.deadline.saturating_duration_since(now))
                .min();
            let wait = match (max_wait, next_timer) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            let mut pollfds = Vec::with_capacity(state.fds.len());
            let mut interests = Vec::with_capacity(state.fds.len());
            for (fd, reg) in state.fds.iter() {
                pollfds.push(libc::pollfd {
                    fd: *fd,
                    events: match reg.interest {
                        Interest::Read => libc::POLLIN,
                        Interest::Write => libc::POLLOUT,
                    },
                    revents: 0,
                });
                interests.push((reg.interest, reg.handler.clone()));
            }
            (pollfds, interests, wait)
        };

        if pollfds.is_empty() && wait.is_none() {
            return Ok(0);
        }

        let ret = unsafe {
            libc::poll(
                pollfds.as_mut_ptr(),
                pollfds.len() as libc::nfds_t,
                poll_timeout(wait),
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err.into());
        }

        let mut delivered = self.fire_timers();

        for (pfd, (interest, polled)) in pollfds.iter().zip(interests) {
            if pfd.revents == 0 {
                continue;
            }
            let kind = event_kind(interest, pfd.revents);
            // the readiness belongs to the registration that was polled
            let handler = {
                let state = self.state.borrow();
                match state.fds.get(&pfd.fd) {
                    Some(reg) if reg.interest == interest && Rc::ptr_eq(&reg.handler, &polled) => {
                        reg.handler.clone()
                    }
                    _ => continue,
                }
            };
            trace!("fd {}: {:?}", pfd.fd, kind);
            handler(kind);
            delivered += 1;
        }

        Ok(delivered)
    }

    /// Run rounds until `done` returns true or no registration is left.
    /// Returns the final value of `done`.
    pub fn run_until<F: FnMut() -> bool>(&self, mut done: F) -> Result<bool> {
        loop {
            if done() {
                return Ok(true);
            }
            if self.is_idle() {
                return Ok(false);
            }
            self.run_once(None)?;
        }
    }

    fn fire_timers(&self) -> usize {
        let now = Instant::now();
        let mut expired: Vec<(Instant, Token)> = self
            .state
            .borrow()
            .timers
            .iter()
            .filter(|(_, t)| t.deadline <= now)
            .map(|(token, t)| (t.deadline, *token))
            .collect();
        expired.sort();

        let mut delivered = 0;
        for (_, token) in expired {
            // skip timers cancelled or re-armed by an earlier handler
            let timer = {
                let mut state = self.state.borrow_mut();
                let due = state.timers.get(&token).map_or(false, |t| t.deadline <= now);
                if due {
                    state.timers.remove(&token)
                } else {
                    None
                }
            };
            if let Some(timer) = timer {
                trace!("timer {:?}: expired", token);
                (timer.handler)(EventKind::Timeout);
                delivered += 1;
            }
        }
        delivered
    }

    fn enable(&self, fd: RawFd, interest: Interest, handler: EventHandler) {
        let mut state = self.state.borrow_mut();
        if let Some(reg) = state.fds.get(&fd) {
            if reg.interest != interest {
                panic!("{:?}: fd {}: read/write I/O request", interest, fd);
            }
        }
        debug!("fd {}: enable {:?}", fd, interest);
        state.fds.insert(fd, Registration { interest, handler });
    }
}

impl Dispatcher for EventLoop {
    fn enable_read(&self, fd: RawFd, handler: EventHandler) {
        self.enable(fd, Interest::Read, handler)
    }

    fn enable_write(&self, fd: RawFd, handler: EventHandler) {
        self.enable(fd, Interest::Write, handler)
    }

    fn disable_readwrite(&self, fd: RawFd) {
        if self.state.borrow_mut().fds.remove(&fd).is_some() {
            debug!("fd {}: disable read/write", fd);
        }
    }

    fn request_timer(&self, token: Token, handler: EventHandler, delay: Duration) {
        let deadline = Instant::now() + delay;
        self.state
            .borrow_mut()
            .timers
            .insert(token, Timer { deadline, handler });
    }

    fn cancel_timer(&self, token: Token) -> bool {
        self.state.borrow_mut().timers.remove(&token).is_some()
    }

    fn new_token(&self) -> Token {
        let mut state = self.state.borrow_mut();
        state.next_token += 1;
        Token(state.next_token)
    }
}

fn event_kind(interest: Interest, revents: libc::c_short) -> EventKind {
    if revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
        return EventKind::Exception;
    }
    match interest {
        Interest::Read => EventKind::Readable,
        Interest::Write if revents & libc::POLLOUT != 0 => EventKind::Writable,
        Interest::Write => EventKind::Exception,
    }
}

pub(crate) fn poll_timeout(wait: Option<Duration>) -> libc::c_int {
    match wait {
        None => -1,
        Some(d) => {
            // round up so a timer is never polled for zero ms before it is due
            let mut ms = d.as_millis();
            if d.subsec_nanos() % 1_000_000 != 0 {
                ms += 1;
            }
            ms.min(libc::c_int::MAX as u128) as libc::c_int
        }
    }
}
