//! Non-blocking I/O plumbing for mail queue services.
//!
//! Two building blocks sit on top of a single-threaded [`Dispatcher`]:
//!
//! - [`Channel`], a buffered duplex stream with one bounded read buffer and
//!   one bounded write buffer. The application enables reading or writing
//!   with a deadline; the channel moves bytes between the socket and its
//!   buffers and calls back with the outcome.
//! - [`BounceClient`], which sends one request to the bounce, defer or trace
//!   service and reports the reply status to a completion closure exactly
//!   once.
//!
//! Requests travel as attribute records (see [`attr`]), and [`server`]
//! provides the receiving side for services and tests.
//!
//! A minimal flush against the default Postfix spool layout:
//!
//!```no_run
//! use std::rc::Rc;
//! use mailio::{BounceClient, BounceFlags, Config, Envelope, EventLoop, MailConnector};
//!
//! let config = Config::load("/etc/mailio.json")?;
//! let ev = Rc::new(EventLoop::new());
//! let client = BounceClient::new(ev.clone(), Rc::new(MailConnector::new(config.clone())), &config);
//! let msg = Envelope {
//!     queue: "deferred",
//!     id: "3F2A51C0B2",
//!     encoding: "7bit",
//!     sender: "owner@example.com",
//! };
//! client.warn(BounceFlags::empty(), &msg, |status| {
//!     if status != 0 {
//!         eprintln!("delay warning not sent");
//!     }
//! });
//! ev.run_until(|| false)?;
//! # Ok::<(), mailio::Error>(())
//!```

extern crate bitflags;
extern crate libc;
extern crate serde;
#[macro_use]
extern crate serde_derive;
extern crate serde_json;

pub mod attr;
mod bounce;
mod channel;
mod config;
mod connect;
mod error;
mod event;
pub mod server;
mod stream;


pub use crate::bounce::{
    deferral_notice, BounceClient, BounceCommand, BounceFlags, BounceRequest, Envelope,
};
pub use crate::channel::{Active, Channel, ChannelFlags};
pub use crate::config::{Config, MAIL_CLASS_PRIVATE};
pub use crate::connect::{ConnectionProvider, MailConnector, ServiceAddress};
pub use crate::error::{Error, Result};
pub use crate::event::{Dispatcher, EventHandler, EventKind, EventLoop, Token};
pub use crate::stream::Stream;
