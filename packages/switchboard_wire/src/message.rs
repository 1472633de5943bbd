//! The relayed envelope and its type tag.

use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, SubsecRound, Utc};

/// Reserved receiver id meaning "every other connected user".
/// An empty receiver id means the same thing.
pub const BROADCAST: &str = "ALL";

/// Sender id the server uses for frames it originates.
pub const SERVER_SENDER: &str = "SERVER";

/// Conventional content of the first frame a client sends.
pub const HANDSHAKE_CONTENT: &str = "CONNECT";

/// Content marker of the server's handshake acknowledgment.
pub const ONLINE_USERS_CONTENT: &str = "ONLINE_USERS";

/// Content of call initiation messages.
pub const CALL_INIT_CONTENT: &str = "CALL_INIT";

/// Opaque unique message token.
#[derive(Clone, Debug, Hash, Eq, PartialEq)]
pub struct MessageId(String);

impl MessageId {
    /// A fresh random id.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<String> for MessageId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for MessageId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Message kind. The ordinal is what travels on the wire, so the order of
/// the variants is part of the protocol.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub enum MessageType {
    Text,
    Image,
    File,
    Audio,
    VideoCall,
    AudioCall,
    Emoji,
    CallSignal,
    Disconnect,
}

impl MessageType {
    pub const ALL: [MessageType; 9] = [
        MessageType::Text,
        MessageType::Image,
        MessageType::File,
        MessageType::Audio,
        MessageType::VideoCall,
        MessageType::AudioCall,
        MessageType::Emoji,
        MessageType::CallSignal,
        MessageType::Disconnect,
    ];

    pub fn ordinal(self) -> u8 {
        match self {
            Self::Text => 0,
            Self::Image => 1,
            Self::File => 2,
            Self::Audio => 3,
            Self::VideoCall => 4,
            Self::AudioCall => 5,
            Self::Emoji => 6,
            Self::CallSignal => 7,
            Self::Disconnect => 8,
        }
    }

    pub fn from_ordinal(ordinal: u8) -> Option<Self> {
        Self::ALL.get(ordinal as usize).copied()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "TEXT",
            Self::Image => "IMAGE",
            Self::File => "FILE",
            Self::Audio => "AUDIO",
            Self::VideoCall => "VIDEO_CALL",
            Self::AudioCall => "AUDIO_CALL",
            Self::Emoji => "EMOJI",
            Self::CallSignal => "CALL_SIGNAL",
            Self::Disconnect => "DISCONNECT",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One relayed envelope.
///
/// Immutable once built: the chainable `to`/`with_*` setters consume the
/// value and are meant for construction only. The server reads nothing but
/// [`kind`](Self::kind), [`sender_id`](Self::sender_id) and
/// [`receiver_id`](Self::receiver_id); the rest is carried through untouched.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    id: MessageId,
    sender_id: String,
    receiver_id: String,
    kind: MessageType,
    content: Option<String>,
    payload: Option<Bytes>,
    file_name: Option<String>,
    file_size: i64,
    timestamp: DateTime<Utc>,
}

impl Message {
    /// Build a message with a fresh id and the current time, addressed to
    /// nobody (which routes as a broadcast) until [`to`](Self::to) is called.
    ///
    /// The timestamp is kept at millisecond precision, which is what the
    /// wire carries.
    pub fn new(sender_id: impl Into<String>, kind: MessageType) -> Self {
        Self {
            id: MessageId::new(),
            sender_id: sender_id.into(),
            receiver_id: String::new(),
            kind,
            content: None,
            payload: None,
            file_name: None,
            file_size: 0,
            timestamp: Utc::now().trunc_subsecs(3),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_parts(
        id: MessageId,
        sender_id: String,
        receiver_id: String,
        kind: MessageType,
        content: Option<String>,
        payload: Option<Bytes>,
        file_name: Option<String>,
        file_size: i64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            sender_id,
            receiver_id,
            kind,
            content,
            payload,
            file_name,
            file_size,
            timestamp,
        }
    }

    pub fn to(mut self, receiver_id: impl Into<String>) -> Self {
        self.receiver_id = receiver_id.into();
        self
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    /// Attach a payload; `file_size` follows the payload length.
    pub fn with_attachment(mut self, payload: impl Into<Bytes>, file_name: impl Into<String>) -> Self {
        let payload = payload.into();
        self.file_size = payload.len() as i64;
        self.payload = Some(payload);
        self.file_name = Some(file_name.into());
        self
    }

    // --- Common shapes used by clients ---

    /// First frame of a session. Carries only the sender id.
    pub fn handshake(user_id: impl Into<String>) -> Self {
        Self::new(user_id, MessageType::Text).with_content(HANDSHAKE_CONTENT)
    }

    pub fn text(
        sender_id: impl Into<String>,
        receiver_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self::new(sender_id, MessageType::Text)
            .to(receiver_id)
            .with_content(content)
    }

    pub fn emoji(
        sender_id: impl Into<String>,
        receiver_id: impl Into<String>,
        emoji: impl Into<String>,
    ) -> Self {
        Self::new(sender_id, MessageType::Emoji)
            .to(receiver_id)
            .with_content(emoji)
    }

    pub fn image(
        sender_id: impl Into<String>,
        receiver_id: impl Into<String>,
        data: impl Into<Bytes>,
        file_name: impl Into<String>,
    ) -> Self {
        Self::new(sender_id, MessageType::Image)
            .to(receiver_id)
            .with_attachment(data, file_name)
    }

    pub fn file(
        sender_id: impl Into<String>,
        receiver_id: impl Into<String>,
        data: impl Into<Bytes>,
        file_name: impl Into<String>,
    ) -> Self {
        Self::new(sender_id, MessageType::File)
            .to(receiver_id)
            .with_attachment(data, file_name)
    }

    pub fn audio(
        sender_id: impl Into<String>,
        receiver_id: impl Into<String>,
        data: impl Into<Bytes>,
        file_name: impl Into<String>,
    ) -> Self {
        Self::new(sender_id, MessageType::Audio)
            .to(receiver_id)
            .with_attachment(data, file_name)
    }

    pub fn audio_call(sender_id: impl Into<String>, receiver_id: impl Into<String>) -> Self {
        Self::new(sender_id, MessageType::AudioCall)
            .to(receiver_id)
            .with_content(CALL_INIT_CONTENT)
    }

    pub fn video_call(sender_id: impl Into<String>, receiver_id: impl Into<String>) -> Self {
        Self::new(sender_id, MessageType::VideoCall)
            .to(receiver_id)
            .with_content(CALL_INIT_CONTENT)
    }

    /// Call control traffic (accept/decline/hang-up). The content is opaque
    /// to the relay.
    pub fn call_signal(
        sender_id: impl Into<String>,
        receiver_id: impl Into<String>,
        signal: impl Into<String>,
    ) -> Self {
        Self::new(sender_id, MessageType::CallSignal)
            .to(receiver_id)
            .with_content(signal)
    }

    pub fn disconnect(sender_id: impl Into<String>) -> Self {
        Self::new(sender_id, MessageType::Disconnect)
    }

    /// The server's handshake acknowledgment: the online user ids as a JSON
    /// array in the payload.
    pub fn online_users_ack(user_id: impl Into<String>, online: &[String]) -> Self {
        // Serializing a slice of strings cannot fail.
        let payload = serde_json::to_vec(online).unwrap_or_default();
        Self {
            payload: Some(Bytes::from(payload)),
            ..Self::new(SERVER_SENDER, MessageType::Text)
                .to(user_id)
                .with_content(ONLINE_USERS_CONTENT)
        }
    }

    /// The user list of an acknowledgment built by
    /// [`online_users_ack`](Self::online_users_ack), or `None` for any other
    /// message.
    pub fn online_users(&self) -> Option<Vec<String>> {
        if self.sender_id != SERVER_SENDER
            || self.content.as_deref() != Some(ONLINE_USERS_CONTENT)
        {
            return None;
        }
        match &self.payload {
            Some(payload) => serde_json::from_slice(payload).ok(),
            // Older servers only sent the marker.
            None => Some(Vec::new()),
        }
    }

    // --- Accessors ---

    pub fn id(&self) -> &MessageId {
        &self.id
    }

    pub fn sender_id(&self) -> &str {
        &self.sender_id
    }

    pub fn receiver_id(&self) -> &str {
        &self.receiver_id
    }

    pub fn kind(&self) -> MessageType {
        self.kind
    }

    pub fn content(&self) -> Option<&str> {
        self.content.as_deref()
    }

    pub fn payload(&self) -> Option<&Bytes> {
        self.payload.as_ref()
    }

    pub fn file_name(&self) -> Option<&str> {
        self.file_name.as_deref()
    }

    pub fn file_size(&self) -> i64 {
        self.file_size
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn is_broadcast(&self) -> bool {
        self.receiver_id.is_empty() || self.receiver_id == BROADCAST
    }

    pub fn is_disconnect(&self) -> bool {
        self.kind == MessageType::Disconnect
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordinals_follow_declaration_order() {
        for (i, kind) in MessageType::ALL.iter().enumerate() {
            assert_eq!(kind.ordinal() as usize, i);
            assert_eq!(MessageType::from_ordinal(i as u8), Some(*kind));
        }
        assert_eq!(MessageType::from_ordinal(9), None);
        assert_eq!(MessageType::from_ordinal(u8::MAX), None);
    }

    #[test]
    fn broadcast_detection() {
        assert!(Message::new("alice", MessageType::Text).is_broadcast());
        assert!(Message::text("alice", BROADCAST, "hello all").is_broadcast());
        assert!(!Message::text("alice", "bob", "hi").is_broadcast());
        // The sentinel is case sensitive.
        assert!(!Message::text("alice", "all", "hi").is_broadcast());
    }

    #[test]
    fn attachment_sets_file_size() {
        let msg = Message::file("alice", "bob", vec![0u8; 1234], "notes.txt");
        assert_eq!(msg.kind(), MessageType::File);
        assert_eq!(msg.file_size(), 1234);
        assert_eq!(msg.file_name(), Some("notes.txt"));
        assert_eq!(msg.payload().map(|p| p.len()), Some(1234));
    }

    #[test]
    fn handshake_shape() {
        let msg = Message::handshake("alice");
        assert_eq!(msg.sender_id(), "alice");
        assert_eq!(msg.kind(), MessageType::Text);
        assert_eq!(msg.content(), Some(HANDSHAKE_CONTENT));
        assert!(msg.receiver_id().is_empty());
    }

    #[test]
    fn fresh_ids_are_unique() {
        let a = Message::text("alice", "bob", "x");
        let b = Message::text("alice", "bob", "x");
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn timestamp_has_millisecond_precision() {
        let msg = Message::new("alice", MessageType::Emoji);
        assert_eq!(msg.timestamp().timestamp_subsec_nanos() % 1_000_000, 0);
    }

    #[test]
    fn online_users_ack_roundtrip() {
        let users = vec!["alice".to_string(), "bob".to_string()];
        let ack = Message::online_users_ack("bob", &users);
        assert_eq!(ack.sender_id(), SERVER_SENDER);
        assert_eq!(ack.receiver_id(), "bob");
        assert_eq!(ack.online_users(), Some(users));
    }

    #[test]
    fn online_users_marker_without_payload() {
        let marker = Message::new(SERVER_SENDER, MessageType::Text)
            .to("bob")
            .with_content(ONLINE_USERS_CONTENT);
        assert_eq!(marker.online_users(), Some(Vec::new()));
    }

    #[test]
    fn online_users_ignores_client_messages() {
        let spoof = Message::text("mallory", "bob", ONLINE_USERS_CONTENT);
        assert_eq!(spoof.online_users(), None);
    }

    #[test]
    fn call_constructors() {
        let call = Message::video_call("alice", "bob");
        assert_eq!(call.kind(), MessageType::VideoCall);
        assert_eq!(call.content(), Some(CALL_INIT_CONTENT));

        let signal = Message::call_signal("bob", "alice", "ACCEPT:Video Call");
        assert_eq!(signal.kind(), MessageType::CallSignal);
        assert_eq!(signal.content(), Some("ACCEPT:Video Call"));

        assert!(Message::disconnect("alice").is_disconnect());
    }
}
