use std::io;
use thiserror::Error;

/// Errors raised by the control protocol engines.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed or unexpected PDU.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("not connected to hub")]
    NotConnected,

    #[error("already connected to hub as {0}, disconnect first")]
    AlreadyConnected(String),

    #[error("peer {0} already registered")]
    AlreadyRegistered(String),

    /// Read or write failure on the physical stream.
    #[error("transport lost: {0}")]
    TransportLost(#[from] io::Error),

    /// The control engine stopped and cannot be resumed.
    #[error("hub connection lost: {0}")]
    HubConnectionLost(String),

    #[error("session {0} is not silent")]
    NotSilent(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn protocol<S: Into<String>>(msg: S) -> Self {
        Error::Protocol(msg.into())
    }
}
