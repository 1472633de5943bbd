//! Message model and wire codec for the switchboard relay.
//!
//! Every frame on the wire is `[4-byte big-endian length][body]`, where the
//! body is a versioned binary layout of one [`Message`]. This crate has no
//! async runtime dependency; the server and client wrap it around tokio
//! streams.

pub mod codec;
pub mod error;
pub mod message;

pub use codec::{FRAME_HEADER_LEN, WIRE_VERSION, decode, decode_body, encode};
pub use error::{DecodeError, EncodeError};
pub use message::{
    BROADCAST, CALL_INIT_CONTENT, HANDSHAKE_CONTENT, Message, MessageId, MessageType,
    ONLINE_USERS_CONTENT, SERVER_SENDER,
};
