//! Minimal async client, used by the CLI and the integration tests.

use anyhow::{Context, Result};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};

use switchboard_wire::{Message, encode};

use crate::framing::{DEFAULT_MAX_FRAME_BYTES, read_message, write_frame};

pub struct Client {
    user_id: String,
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Client {
    /// Connect, handshake as `user_id`, and wait for the server's
    /// acknowledgment. Returns the client and the ids that were online at
    /// registration time (including `user_id`).
    pub async fn connect(
        addr: impl ToSocketAddrs,
        user_id: impl Into<String>,
    ) -> Result<(Self, Vec<String>)> {
        let user_id = user_id.into();
        let stream = TcpStream::connect(addr)
            .await
            .context("failed to connect to switchboard")?;
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();

        let mut client = Self {
            user_id,
            reader: BufReader::new(read_half),
            writer: write_half,
        };

        let hello = Message::handshake(client.user_id.clone());
        client.send(&hello).await.context("failed to send handshake")?;

        let ack = client
            .recv()
            .await?
            .context("server closed the connection during handshake")?;
        let online = ack.online_users().with_context(|| {
            format!(
                "expected online-users acknowledgment, got {} from {}",
                ack.kind(),
                ack.sender_id()
            )
        })?;

        Ok((client, online))
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub async fn send(&mut self, msg: &Message) -> Result<()> {
        let frame = encode(msg)?;
        write_frame(&mut self.writer, &frame).await?;
        Ok(())
    }

    /// Next message from the server, or `None` once it closes the connection.
    pub async fn recv(&mut self) -> Result<Option<Message>> {
        Ok(read_message(&mut self.reader, DEFAULT_MAX_FRAME_BYTES).await?)
    }

    /// Send DISCONNECT and close the socket.
    pub async fn disconnect(mut self) -> Result<()> {
        let bye = Message::disconnect(self.user_id.clone());
        self.send(&bye).await?;
        self.writer.shutdown().await?;
        Ok(())
    }
}
