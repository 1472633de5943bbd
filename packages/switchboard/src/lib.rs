//! TCP connection multiplexer and message relay.
//!
//! Clients open one long-lived connection, identify themselves with a
//! handshake frame, and from then on every frame they send is forwarded
//! either to one named user or to everyone else online. Delivery is
//! best-effort and at-most-once: nothing is stored, retried or acknowledged.

pub mod client;
pub mod config;
mod connection;
pub mod error;
pub mod framing;
pub mod listener;
pub mod metrics;
pub mod registry;
pub mod router;

pub use client::Client;
pub use config::{ServerConfig, load_config};
pub use connection::ConnectionState;
pub use error::{FrameError, HandshakeError, ServerError};
pub use listener::Server;
pub use metrics::{MetricsSnapshot, ServerMetrics};
pub use registry::{ConnectionHandle, ConnectionId, Registry, User};
pub use router::{RouteOutcome, Router};

pub use switchboard_wire as wire;
