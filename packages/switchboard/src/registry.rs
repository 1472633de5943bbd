//! Who is online, and where to send their frames.
//!
//! The registry maps user id to the live connection serving it. Entries are
//! sharded by `DashMap`, so every operation locks a single key's shard and
//! no caller ever holds a lock across a send. A user's record lives exactly
//! as long as their connection; going offline removes it.

use std::fmt;
use std::net::SocketAddr;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use switchboard_wire::{Message, encode};

/// Server-assigned connection number, unique for the life of the process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Presence record for one user id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct User {
    pub id: String,
    pub remote_addr: SocketAddr,
    pub online: bool,
}

impl User {
    pub fn online(id: impl Into<String>, remote_addr: SocketAddr) -> Self {
        Self {
            id: id.into(),
            remote_addr,
            online: true,
        }
    }

    pub fn remote_port(&self) -> u16 {
        self.remote_addr.port()
    }
}

/// The routable side of a connection: its outbound queue and its kill switch.
///
/// Cloning is cheap. Sending never blocks: a queue that is full or already
/// closed counts as a write failure and closes the connection.
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    id: ConnectionId,
    user_id: String,
    tx: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
}

impl ConnectionHandle {
    pub fn new(
        id: ConnectionId,
        user_id: impl Into<String>,
        tx: mpsc::Sender<Bytes>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            user_id: user_id.into(),
            tx,
            cancel,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Encode and queue `msg`. A message that cannot be encoded is dropped
    /// without touching the connection.
    pub fn send(&self, msg: &Message) -> bool {
        match encode(msg) {
            Ok(frame) => self.send_frame(frame),
            Err(e) => {
                warn!(
                    conn_id = %self.id,
                    user = %self.user_id,
                    code = e.error_code(),
                    "unencodable message: {}", e
                );
                false
            }
        }
    }

    /// Queue an encoded frame behind everything queued before it.
    ///
    /// Returns `false` if the frame was not queued; the connection has then
    /// been told to close.
    pub fn send_frame(&self, frame: Bytes) -> bool {
        match self.tx.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(
                    conn_id = %self.id,
                    user = %self.user_id,
                    "outbound queue full, closing slow connection"
                );
                self.close();
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(conn_id = %self.id, user = %self.user_id, "send to closed connection");
                self.close();
                false
            }
        }
    }

    /// Ask the owning connection task to shut down. Idempotent.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.tx.is_closed()
    }

    /// A handle backed by a bare channel, for exercising routing without sockets.
    #[cfg(test)]
    pub(crate) fn detached(
        id: u64,
        user_id: &str,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self::new(ConnectionId(id), user_id, tx, CancellationToken::new()),
            rx,
        )
    }
}

#[derive(Debug)]
struct Presence {
    user: User,
    connection: ConnectionHandle,
}

/// Process-wide user id → connection table.
#[derive(Debug, Default)]
pub struct Registry {
    entries: DashMap<String, Presence>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `handle` the routing target for `user.id`.
    ///
    /// Last registration wins. A different connection previously registered
    /// under the same id is closed and returned.
    pub fn register(&self, user: User, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        let new_id = handle.id();
        let key = user.id.clone();
        let previous = self
            .entries
            .insert(
                key,
                Presence {
                    user,
                    connection: handle,
                },
            )
            .map(|p| p.connection)
            .filter(|old| old.id() != new_id);

        // Shard lock is released by now.
        if let Some(old) = &previous {
            debug!(user = %old.user_id(), old = %old.id(), new = %new_id, "connection superseded");
            old.close();
        }
        previous
    }

    /// Remove the entry for `user_id` if it still belongs to `conn_id`.
    ///
    /// Returns whether anything was removed. A superseded connection cleaning
    /// up after itself leaves its replacement alone.
    pub fn unregister(&self, user_id: &str, conn_id: ConnectionId) -> bool {
        self.entries
            .remove_if(user_id, |_, presence| presence.connection.id() == conn_id)
            .is_some()
    }

    pub fn lookup(&self, user_id: &str) -> Option<ConnectionHandle> {
        self.entries.get(user_id).map(|p| p.connection.clone())
    }

    /// Presence record of an online user.
    pub fn user(&self, user_id: &str) -> Option<User> {
        self.entries.get(user_id).map(|p| p.user.clone())
    }

    /// Sorted ids of every online user.
    pub fn snapshot(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Presence records of every online user, sorted by id.
    pub fn online_users(&self) -> Vec<User> {
        let mut users: Vec<User> = self.entries.iter().map(|e| e.user.clone()).collect();
        users.sort_by(|a, b| a.id.cmp(&b.id));
        users
    }

    /// Point-in-time copy of every live connection handle.
    pub fn handles(&self) -> Vec<ConnectionHandle> {
        self.entries.iter().map(|e| e.connection.clone()).collect()
    }

    /// Number of online users.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
