use std::io;

use thiserror::Error;

use crate::protocol::Command;

/// Errors published on a request's event channel.
///
/// Cloneable so that every subscriber gets its own copy; transport errors
/// keep only the kind and message of the underlying `io::Error`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("handshaking has already completed, cannot {action} the request")]
    HandshakeComplete { action: &'static str },
    #[error("bind requests cannot be accepted")]
    BindUnsupported,
    #[error("client connection is closed")]
    Closed,
    #[error("client transport error: {message}")]
    Transport { kind: io::ErrorKind, message: String },
    #[error("failed to connect to {target}: {message}")]
    Dial { target: String, message: String },
}

impl From<io::Error> for RequestError {
    fn from(e: io::Error) -> Self {
        RequestError::Transport {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("cannot proxy an invalid request")]
    InvalidRequest,
    #[error("unexpected command: {0:?}")]
    UnexpectedCommand(Option<Command>),
    #[error(transparent)]
    Request(#[from] RequestError),
}
