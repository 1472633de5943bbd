//! One accepted socket, from handshake to close.
//!
//! ```text
//! AwaitingHandshake ──ok──▶ Active ──DISCONNECT / EOF / bad frame / cancel──▶ Closing ──▶ Closed
//!         │                                                                     ▲
//!         └──────────── bad or missing handshake, timeout, cancel ──────────────┘
//! ```
//!
//! The read half stays with the connection task. The write half moves into a
//! writer task that drains the connection's bounded queue, so every outbound
//! frame goes through one ordered path no matter which peer routed it.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use switchboard_wire::{BROADCAST, Message, SERVER_SENDER};

use crate::error::{FrameError, HandshakeError};
use crate::framing::{read_message, write_frame};
use crate::listener::ServerContext;
use crate::registry::{ConnectionHandle, ConnectionId, User};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    AwaitingHandshake,
    Active,
    Closing,
    Closed,
}

pub(crate) struct Connection {
    id: ConnectionId,
    peer: SocketAddr,
    state: ConnectionState,
    user_id: Option<String>,
    reader: BufReader<OwnedReadHalf>,
    /// Held until the handshake completes, then moved into the writer task.
    write_half: Option<OwnedWriteHalf>,
    writer: Option<JoinHandle<OwnedWriteHalf>>,
    cancel: CancellationToken,
    ctx: Arc<ServerContext>,
}

impl Connection {
    pub(crate) fn new(
        stream: TcpStream,
        peer: SocketAddr,
        id: ConnectionId,
        cancel: CancellationToken,
        ctx: Arc<ServerContext>,
    ) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self {
            id,
            peer,
            state: ConnectionState::AwaitingHandshake,
            user_id: None,
            reader: BufReader::new(read_half),
            write_half: Some(write_half),
            writer: None,
            cancel,
            ctx,
        }
    }

    /// Drive the connection to completion. Always ends in `Closed`.
    pub(crate) async fn run(mut self) {
        self.ctx.metrics.connection_opened();
        debug!(peer = %self.peer, conn_id = %self.id, "connection accepted");

        match self.await_handshake().await {
            Ok(hello) => {
                self.activate(hello.sender_id().to_string());
                self.receive_loop().await;
            }
            Err(HandshakeError::Cancelled) => {
                debug!(peer = %self.peer, conn_id = %self.id, "cancelled before handshake");
            }
            Err(e) => {
                self.ctx.metrics.handshake_failed();
                if matches!(e, HandshakeError::Frame(FrameError::Decode(_))) {
                    self.ctx.metrics.decode_error();
                }
                info!(
                    peer = %self.peer,
                    conn_id = %self.id,
                    code = e.error_code(),
                    "handshake failed: {}", e
                );
            }
        }

        self.close().await;
        self.ctx.metrics.connection_closed();
        debug!(peer = %self.peer, conn_id = %self.id, state = ?self.state(), "connection finished");
    }

    async fn await_handshake(&mut self) -> Result<Message, HandshakeError> {
        let max = self.ctx.config.max_frame_bytes;
        let limit = self.ctx.config.handshake_timeout;
        let cancel = self.cancel.clone();
        let reader = &mut self.reader;

        let first = async move {
            match limit {
                Some(limit) => tokio::time::timeout(limit, read_message(reader, max))
                    .await
                    .map_err(|_| HandshakeError::Timeout(limit))?
                    .map_err(HandshakeError::from),
                None => read_message(reader, max).await.map_err(HandshakeError::from),
            }
        };

        let hello = tokio::select! {
            _ = cancel.cancelled() => return Err(HandshakeError::Cancelled),
            result = first => result?,
        };

        let hello = hello.ok_or(HandshakeError::Closed)?;
        if hello.sender_id().is_empty() {
            return Err(HandshakeError::EmptySender);
        }
        if hello.sender_id() == BROADCAST || hello.sender_id() == SERVER_SENDER {
            return Err(HandshakeError::ReservedId(hello.sender_id().to_string()));
        }
        if hello.is_disconnect() {
            return Err(HandshakeError::Disconnect);
        }
        Ok(hello)
    }

    /// Queue the acknowledgment, become routable, then start the writer.
    ///
    /// The ack is queued before the registry entry exists, so nothing routed
    /// by a peer can overtake it. The writer starts after registration, so a
    /// client holding its ack can already be reached.
    fn activate(&mut self, user_id: String) {
        let (tx, rx) = mpsc::channel(self.ctx.config.send_queue_capacity);
        let handle = ConnectionHandle::new(self.id, user_id.clone(), tx, self.cancel.clone());

        let mut online = self.ctx.registry.snapshot();
        if let Err(pos) = online.binary_search(&user_id) {
            online.insert(pos, user_id.clone());
        }
        handle.send(&Message::online_users_ack(user_id.clone(), &online));

        let user = User::online(user_id.clone(), self.peer);
        if let Some(old) = self.ctx.registry.register(user, handle) {
            self.ctx.metrics.connection_superseded();
            info!(user = %user_id, old = %old.id(), conn_id = %self.id, "replaced existing connection");
        }

        if let Some(write_half) = self.write_half.take() {
            self.writer = Some(tokio::spawn(write_loop(
                write_half,
                rx,
                self.cancel.clone(),
                self.id,
            )));
        }

        info!(peer = %self.peer, conn_id = %self.id, user = %user_id, "user online");
        self.user_id = Some(user_id);
        self.state = ConnectionState::Active;
    }

    async fn receive_loop(&mut self) {
        let max = self.ctx.config.max_frame_bytes;
        let user = self.user_id.clone().unwrap_or_default();

        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!(user = %user, conn_id = %self.id, "connection cancelled");
                    break;
                }
                next = read_message(&mut self.reader, max) => next,
            };

            match next {
                Ok(Some(msg)) if msg.is_disconnect() => {
                    debug!(user = %user, conn_id = %self.id, "client sent DISCONNECT");
                    break;
                }
                Ok(Some(msg)) => {
                    self.ctx.metrics.message_received();
                    self.ctx.router.route_message(&msg);
                }
                Ok(None) => {
                    debug!(user = %user, conn_id = %self.id, "peer closed stream");
                    break;
                }
                Err(FrameError::Decode(e)) => {
                    self.ctx.metrics.decode_error();
                    warn!(
                        user = %user,
                        conn_id = %self.id,
                        code = e.error_code(),
                        "dropping connection on bad frame: {}", e
                    );
                    break;
                }
                Err(FrameError::Io(e)) => {
                    debug!(user = %user, conn_id = %self.id, "read error: {}", e);
                    break;
                }
            }
        }

        self.state = ConnectionState::Closing;
    }

    /// Unregister, stop the writer and close the socket. Safe to call twice.
    pub(crate) async fn close(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.state = ConnectionState::Closing;

        if let Some(user) = &self.user_id {
            if self.ctx.registry.unregister(user, self.id) {
                info!(peer = %self.peer, conn_id = %self.id, user = %user, "user offline");
            }
        }

        self.cancel.cancel();

        let write_half = match self.writer.take() {
            Some(task) => task.await.ok(),
            None => self.write_half.take(),
        };
        if let Some(mut write_half) = write_half {
            let _ = write_half.shutdown().await;
        }

        self.state = ConnectionState::Closed;
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.state
    }
}

/// Drain queued frames onto the socket in order. Hands the write half back
/// so the owner can shut it down.
async fn write_loop(
    mut write_half: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Bytes>,
    cancel: CancellationToken,
    conn_id: ConnectionId,
) -> OwnedWriteHalf {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        let written = tokio::select! {
            _ = cancel.cancelled() => break,
            written = write_frame(&mut write_half, &frame) => written,
        };
        if let Err(e) = written {
            debug!(conn_id = %conn_id, "write error: {}", e);
            cancel.cancel();
            break;
        }
    }
    write_half
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use std::time::Duration;
    use switchboard_wire::encode;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn pair() -> (TcpStream, TcpStream, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, peer) = listener.accept().await.unwrap();
        (client, server, peer)
    }

    fn ctx(config: ServerConfig) -> Arc<ServerContext> {
        Arc::new(ServerContext::new(config))
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (_client, server, peer) = pair().await;
        let mut conn = Connection::new(
            server,
            peer,
            ConnectionId(1),
            CancellationToken::new(),
            ctx(ServerConfig::default()),
        );
        assert_eq!(conn.state(), ConnectionState::AwaitingHandshake);

        conn.close().await;
        assert_eq!(conn.state(), ConnectionState::Closed);
        conn.close().await;
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn empty_sender_is_rejected() {
        let (mut client, server, peer) = pair().await;
        let ctx = ctx(ServerConfig::default());
        let mut conn = Connection::new(
            server,
            peer,
            ConnectionId(1),
            CancellationToken::new(),
            Arc::clone(&ctx),
        );

        client.write_all(&encode(&Message::handshake("")).unwrap()).await.unwrap();
        let err = conn.await_handshake().await.unwrap_err();
        assert!(matches!(err, HandshakeError::EmptySender));
        assert!(ctx.registry.is_empty());
    }

    #[tokio::test]
    async fn reserved_ids_are_rejected() {
        for reserved in [BROADCAST, SERVER_SENDER] {
            let (mut client, server, peer) = pair().await;
            let ctx = ctx(ServerConfig::default());
            let mut conn = Connection::new(
                server,
                peer,
                ConnectionId(1),
                CancellationToken::new(),
                Arc::clone(&ctx),
            );

            client
                .write_all(&encode(&Message::handshake(reserved)).unwrap())
                .await
                .unwrap();
            let err = conn.await_handshake().await.unwrap_err();
            assert!(matches!(&err, HandshakeError::ReservedId(id) if id == reserved));
            assert_eq!(err.error_code(), "reserved_id");
            assert!(ctx.registry.is_empty());
        }
    }

    #[tokio::test]
    async fn handshake_timeout_closes() {
        let (mut client, server, peer) = pair().await;
        let config = ServerConfig {
            handshake_timeout: Some(Duration::from_millis(50)),
            ..ServerConfig::default()
        };
        let conn = Connection::new(
            server,
            peer,
            ConnectionId(1),
            CancellationToken::new(),
            ctx(config),
        );

        tokio::time::timeout(Duration::from_secs(5), conn.run())
            .await
            .unwrap();

        // Server side shut down its half; the client sees EOF.
        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn cancel_before_handshake() {
        let (_client, server, peer) = pair().await;
        let cancel = CancellationToken::new();
        let ctx = ctx(ServerConfig::default());
        let conn = Connection::new(server, peer, ConnectionId(1), cancel.clone(), Arc::clone(&ctx));

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), conn.run())
            .await
            .unwrap();
        assert_eq!(ctx.metrics.snapshot().connections.handshake_failures, 0);
        assert_eq!(ctx.metrics.snapshot().connections.active, 0);
    }
}
