//! Error types for the relay.

use std::io;

use switchboard_wire::DecodeError;

/// Reading or writing one frame on a socket failed.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("malformed frame: {0}")]
    Decode(#[from] DecodeError),
}

impl FrameError {
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Io(_) => "io",
            Self::Decode(e) => e.error_code(),
        }
    }
}

/// Why a connection never made it into the registry.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("peer closed before sending a handshake")]
    Closed,

    #[error("no handshake within {0:?}")]
    Timeout(std::time::Duration),

    #[error("handshake has an empty sender id")]
    EmptySender,

    #[error("sender id {0:?} is reserved")]
    ReservedId(String),

    #[error("first frame was a DISCONNECT")]
    Disconnect,

    #[error("server shutting down")]
    Cancelled,

    #[error(transparent)]
    Frame(#[from] FrameError),
}

impl HandshakeError {
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Timeout(_) => "timeout",
            Self::EmptySender => "empty_sender",
            Self::ReservedId(_) => "reserved_id",
            Self::Disconnect => "disconnect",
            Self::Cancelled => "cancelled",
            Self::Frame(e) => e.error_code(),
        }
    }
}

/// Failures of the listening socket itself. Anything here ends the server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("listener failed: {0}")]
    ListenerFatal(#[source] io::Error),
}
