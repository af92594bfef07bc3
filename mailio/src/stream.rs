use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::time::Duration;

use crate::error::*;

/// A connected, bidirectional byte stream backed by one descriptor.
///
/// Channels and bounce requests take ownership of a `Box<dyn Stream>`; dropping
/// the box closes the descriptor.
pub trait Stream: Read + Write + AsRawFd {
    fn shutdown(&mut self) -> Result<()>;
    fn set_nonblocking(&mut self, b: bool) -> Result<()>;
    /// Bound blocking reads and writes. `None` waits forever.
    fn set_io_timeout(&mut self, timeout: Option<Duration>) -> Result<()>;
}

impl Stream for TcpStream {
    #[inline]
    fn shutdown(&mut self) -> Result<()> {
        TcpStream::shutdown(self, Shutdown::Both)?;
        Ok(())
    }

    #[inline]
    fn set_nonblocking(&mut self, b: bool) -> Result<()> {
        TcpStream::set_nonblocking(self, b)?;
        Ok(())
    }

    #[inline]
    fn set_io_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.set_read_timeout(timeout)?;
        self.set_write_timeout(timeout)?;
        Ok(())
    }
}

impl Stream for UnixStream {
    #[inline]
    fn shutdown(&mut self) -> Result<()> {
        UnixStream::shutdown(self, Shutdown::Both)?;
        Ok(())
    }

    #[inline]
    fn set_nonblocking(&mut self, b: bool) -> Result<()> {
        UnixStream::set_nonblocking(self, b)?;
        Ok(())
    }

    #[inline]
    fn set_io_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.set_read_timeout(timeout)?;
        self.set_write_timeout(timeout)?;
        Ok(())
    }
}
