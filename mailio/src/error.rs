use std::io;

/// Recoverable failures of the connection, codec and configuration layers.
///
/// Misuse of a [`Channel`](crate::Channel) is not reported here; those are
/// programming errors and panic.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Invalid service address '{0}'")]
    InvalidAddress(String),
    #[error("connect to subsystem {class}/{name} failed after {attempts} attempts: {source}")]
    Connect {
        class: String,
        name: String,
        attempts: u32,
        #[source]
        source: io::Error,
    },
    #[error("Invalid attribute '{name}': {reason}")]
    InvalidAttribute { name: String, reason: &'static str },
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Configuration error: {0}")]
    Config(#[from] serde_json::Error),
    #[error("Timeout Error")]
    Timeout,
}

impl Error {
    /// True for errors that indicate the peer went away.
    pub fn is_connection_closed(&self) -> bool {
        match self {
            Error::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
