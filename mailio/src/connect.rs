//! Connections to named mail services.

use std::net::TcpStream;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::thread;

use log::{debug, warn};

use crate::config::Config;
use crate::error::*;
use crate::stream::Stream;

/// Where a service listens.
///
/// Supported address URIs:
///
/// - UNIX socket `unix:/var/spool/postfix/private/bounce`, an optional
///   `;mode=0666` style suffix is ignored
/// - TCP `tcp:127.0.0.1:10025`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceAddress {
    Unix(PathBuf),
    Tcp(String),
}

impl ServiceAddress {
    pub fn parse<S: ?Sized + AsRef<str>>(address: &S) -> Result<Self> {
        let address = address.as_ref();
        if let Some(addr) = address.strip_prefix("tcp:") {
            if addr.is_empty() {
                return Err(Error::InvalidAddress(address.into()));
            }
            Ok(ServiceAddress::Tcp(addr.into()))
        } else if let Some(addr) = address.strip_prefix("unix:") {
            let addr = addr.split(';').next().unwrap_or(addr);
            if addr.is_empty() {
                return Err(Error::InvalidAddress(address.into()));
            }
            Ok(ServiceAddress::Unix(PathBuf::from(addr)))
        } else {
            Err(Error::InvalidAddress(address.into()))
        }
    }

    pub fn connect(&self) -> Result<Box<dyn Stream>> {
        match self {
            ServiceAddress::Unix(path) => Ok(Box::new(UnixStream::connect(path)?)),
            ServiceAddress::Tcp(addr) => Ok(Box::new(TcpStream::connect(addr.as_str())?)),
        }
    }
}

/// Source of connections for the bounce client.
pub trait ConnectionProvider {
    /// Connect to service `name` of `class`, waiting and retrying as the
    /// provider sees fit. Blocks the caller.
    fn connect_wait(&self, class: &str, name: &str) -> Result<Box<dyn Stream>>;
}

/// Connects to the services described by a [`Config`].
///
/// Failed attempts are logged and retried after
/// `connect_retry_delay_ms`, up to `connect_attempts` in total. Connected
/// streams are blocking, with reads and writes bounded by the IPC timeout.
pub struct MailConnector {
    config: Config,
}

impl MailConnector {
    pub fn new(config: Config) -> Self {
        MailConnector { config }
    }
}

impl ConnectionProvider for MailConnector {
    fn connect_wait(&self, class: &str, name: &str) -> Result<Box<dyn Stream>> {
        let address = ServiceAddress::parse(&self.config.service_address(class, name))?;
        let attempts = self.config.connect_attempts.max(1);
        let timeout = Some(self.config.ipc_timeout()).filter(|t| !t.is_zero());

        let mut attempt = 1;
        loop {
            let err = match address.connect() {
                Ok(mut stream) => {
                    stream.set_io_timeout(timeout)?;
                    debug!("connected to subsystem {}/{} ({:?})", class, name, address);
                    return Ok(stream);
                }
                Err(Error::Io(e)) => e,
                Err(e) => return Err(e),
            };
            warn!("connect #{} to subsystem {}/{}: {}", attempt, class, name, err);
            if attempt >= attempts {
                return Err(Error::Connect {
                    class: class.into(),
                    name: name.into(),
                    attempts,
                    source: err,
                });
            }
            attempt += 1;
            thread::sleep(self.config.connect_retry_delay());
        }
    }
}
