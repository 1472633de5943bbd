//! Length-prefixed binary frames.
//!
//! Wire format: `[4-byte big-endian length N][N-byte body]`
//!
//! Body (version 1), all integers big-endian:
//!
//! | field        | encoding                                          |
//! |--------------|---------------------------------------------------|
//! | version      | `u8`, currently 1                                 |
//! | id           | str                                               |
//! | sender_id    | str                                               |
//! | receiver_id  | str                                               |
//! | type         | `u8` ordinal of [`MessageType`]                   |
//! | flags        | `u8`: bit0 content, bit1 payload, bit2 file_name  |
//! | content      | str, only when bit0 is set                        |
//! | payload      | `u32` length + raw bytes, only when bit1 is set   |
//! | file_name    | str, only when bit2 is set                        |
//! | file_size    | `i64`                                             |
//! | timestamp    | `i64` milliseconds since the Unix epoch (UTC)     |
//!
//! where str is a `u32` byte length followed by UTF-8.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::DateTime;

use crate::error::{DecodeError, EncodeError};
use crate::message::{Message, MessageId, MessageType};

/// Size of the length prefix in front of every frame body.
pub const FRAME_HEADER_LEN: usize = 4;

/// Body layout version written by [`encode`].
pub const WIRE_VERSION: u8 = 1;

const FLAG_CONTENT: u8 = 0b001;
const FLAG_PAYLOAD: u8 = 0b010;
const FLAG_FILE_NAME: u8 = 0b100;
const KNOWN_FLAGS: u8 = FLAG_CONTENT | FLAG_PAYLOAD | FLAG_FILE_NAME;

/// Encode a message into one complete frame, length prefix included.
///
/// Fails if any length-prefixed field, or the body as a whole, does not fit
/// in a `u32`.
pub fn encode(msg: &Message) -> Result<Bytes, EncodeError> {
    let body_len = u32_len("frame", estimated_body_len(msg))?;
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + body_len as usize);
    buf.put_u32(0); // patched below

    buf.put_u8(WIRE_VERSION);
    put_str(&mut buf, "id", msg.id().as_str())?;
    put_str(&mut buf, "sender_id", msg.sender_id())?;
    put_str(&mut buf, "receiver_id", msg.receiver_id())?;
    buf.put_u8(msg.kind().ordinal());

    let mut flags = 0u8;
    if msg.content().is_some() {
        flags |= FLAG_CONTENT;
    }
    if msg.payload().is_some() {
        flags |= FLAG_PAYLOAD;
    }
    if msg.file_name().is_some() {
        flags |= FLAG_FILE_NAME;
    }
    buf.put_u8(flags);

    if let Some(content) = msg.content() {
        put_str(&mut buf, "content", content)?;
    }
    if let Some(payload) = msg.payload() {
        buf.put_u32(u32_len("payload", payload.len())?);
        buf.put_slice(payload);
    }
    if let Some(file_name) = msg.file_name() {
        put_str(&mut buf, "file_name", file_name)?;
    }
    buf.put_i64(msg.file_size());
    buf.put_i64(msg.timestamp().timestamp_millis());

    let body_len = u32_len("frame", buf.len() - FRAME_HEADER_LEN)?;
    buf[..FRAME_HEADER_LEN].copy_from_slice(&body_len.to_be_bytes());
    Ok(buf.freeze())
}

/// Decode one complete frame, length prefix included.
///
/// The declared length must match the bytes supplied exactly.
pub fn decode(frame: &[u8]) -> Result<Message, DecodeError> {
    if frame.len() < FRAME_HEADER_LEN {
        return Err(DecodeError::TruncatedPrefix {
            available: frame.len(),
        });
    }
    let (header, body) = frame.split_at(FRAME_HEADER_LEN);
    let declared = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
    if declared != body.len() {
        return Err(DecodeError::LengthMismatch {
            declared,
            actual: body.len(),
        });
    }
    decode_body(Bytes::copy_from_slice(body))
}

/// Decode a frame body whose length prefix has already been consumed.
///
/// The payload is sliced out of `body` without copying.
pub fn decode_body(body: Bytes) -> Result<Message, DecodeError> {
    let mut r = BodyReader { buf: body };

    let version = r.u8("version")?;
    if version != WIRE_VERSION {
        return Err(DecodeError::UnsupportedVersion(version));
    }

    let id = r.string("id")?;
    let sender_id = r.string("sender_id")?;
    let receiver_id = r.string("receiver_id")?;

    let ordinal = r.u8("type")?;
    let kind = MessageType::from_ordinal(ordinal).ok_or(DecodeError::UnknownType(ordinal))?;

    let flags = r.u8("flags")?;
    if flags & !KNOWN_FLAGS != 0 {
        return Err(DecodeError::UnknownFlags(flags));
    }

    let content = if flags & FLAG_CONTENT != 0 {
        Some(r.string("content")?)
    } else {
        None
    };
    let payload = if flags & FLAG_PAYLOAD != 0 {
        Some(r.bytes("payload")?)
    } else {
        None
    };
    let file_name = if flags & FLAG_FILE_NAME != 0 {
        Some(r.string("file_name")?)
    } else {
        None
    };

    let file_size = r.i64("file_size")?;
    let millis = r.i64("timestamp")?;
    let timestamp =
        DateTime::from_timestamp_millis(millis).ok_or(DecodeError::InvalidTimestamp(millis))?;

    if r.buf.has_remaining() {
        return Err(DecodeError::TrailingBytes(r.buf.remaining()));
    }

    Ok(Message::from_parts(
        MessageId::from(id),
        sender_id,
        receiver_id,
        kind,
        content,
        payload,
        file_name,
        file_size,
        timestamp,
    ))
}

fn put_str(buf: &mut BytesMut, field: &'static str, s: &str) -> Result<(), EncodeError> {
    buf.put_u32(u32_len(field, s.len())?);
    buf.put_slice(s.as_bytes());
    Ok(())
}

fn u32_len(field: &'static str, len: usize) -> Result<u32, EncodeError> {
    u32::try_from(len).map_err(|_| EncodeError::FieldTooLong { field, len })
}

fn estimated_body_len(msg: &Message) -> usize {
    // version + type + flags + file_size + timestamp + three length prefixes
    let fixed = 1 + 1 + 1 + 8 + 8 + 3 * 4;
    fixed
        + msg.id().as_str().len()
        + msg.sender_id().len()
        + msg.receiver_id().len()
        + msg.content().map_or(0, |c| 4 + c.len())
        + msg.payload().map_or(0, |p| 4 + p.len())
        + msg.file_name().map_or(0, |f| 4 + f.len())
}

/// Bounds-checked cursor over a frame body. Every read verifies the bytes
/// are present first, so `Buf`'s panicking getters are never reached with
/// too little data.
struct BodyReader {
    buf: Bytes,
}

impl BodyReader {
    fn need(&self, field: &'static str, needed: usize) -> Result<(), DecodeError> {
        if self.buf.remaining() < needed {
            return Err(DecodeError::Truncated {
                field,
                needed,
                remaining: self.buf.remaining(),
            });
        }
        Ok(())
    }

    fn u8(&mut self, field: &'static str) -> Result<u8, DecodeError> {
        self.need(field, 1)?;
        Ok(self.buf.get_u8())
    }

    fn i64(&mut self, field: &'static str) -> Result<i64, DecodeError> {
        self.need(field, 8)?;
        Ok(self.buf.get_i64())
    }

    fn bytes(&mut self, field: &'static str) -> Result<Bytes, DecodeError> {
        self.need(field, 4)?;
        let declared = self.buf.get_u32() as usize;
        if declared > self.buf.remaining() {
            return Err(DecodeError::FieldOverrun {
                field,
                declared,
                remaining: self.buf.remaining(),
            });
        }
        Ok(self.buf.split_to(declared))
    }

    fn string(&mut self, field: &'static str) -> Result<String, DecodeError> {
        let raw = self.bytes(field)?;
        String::from_utf8(raw.to_vec()).map_err(|_| DecodeError::InvalidUtf8 { field })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::BROADCAST;

    fn sample() -> Message {
        Message::image("alice", "bob", vec![1u8, 2, 3, 4, 5], "cat.png")
            .with_content("look at this")
    }

    /// Build a body by hand so malformed variants can be produced.
    fn body_with(kind: u8, flags: u8, tail: &[u8]) -> Vec<u8> {
        let mut b = BytesMut::new();
        b.put_u8(WIRE_VERSION);
        put_str(&mut b, "id", "id-1").unwrap();
        put_str(&mut b, "sender_id", "alice").unwrap();
        put_str(&mut b, "receiver_id", "bob").unwrap();
        b.put_u8(kind);
        b.put_u8(flags);
        b.put_slice(tail);
        b.to_vec()
    }

    fn fixed_tail() -> Vec<u8> {
        let mut b = BytesMut::new();
        b.put_i64(0);
        b.put_i64(1_700_000_000_000);
        b.to_vec()
    }

    fn framed(body: &[u8]) -> Vec<u8> {
        let mut f = (body.len() as u32).to_be_bytes().to_vec();
        f.extend_from_slice(body);
        f
    }

    #[test]
    fn roundtrip_preserves_every_field() {
        let msg = sample();
        let frame = encode(&msg).unwrap();
        let back = decode(&frame).unwrap();
        assert_eq!(back, msg);
        assert_eq!(back.file_size(), 5);
        assert_eq!(back.timestamp(), msg.timestamp());
    }

    #[test]
    fn length_prefix_counts_body_only() {
        let frame = encode(&Message::text("alice", BROADCAST, "hello all")).unwrap();
        let declared = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(declared, frame.len() - FRAME_HEADER_LEN);
        assert_eq!(frame[FRAME_HEADER_LEN], WIRE_VERSION);
    }

    #[test]
    fn absent_optionals_stay_absent() {
        let msg = Message::disconnect("alice");
        let back = decode(&encode(&msg).unwrap()).unwrap();
        assert_eq!(back.content(), None);
        assert_eq!(back.payload(), None);
        assert_eq!(back.file_name(), None);
    }

    #[test]
    fn empty_payload_is_not_absent() {
        let msg = Message::file("alice", "bob", Vec::<u8>::new(), "empty.bin");
        let back = decode(&encode(&msg).unwrap()).unwrap();
        assert_eq!(back.payload().map(|p| p.len()), Some(0));
    }

    #[test]
    fn truncated_prefix() {
        assert_eq!(
            decode(&[0, 0, 1]),
            Err(DecodeError::TruncatedPrefix { available: 3 })
        );
        assert_eq!(decode(&[]), Err(DecodeError::TruncatedPrefix { available: 0 }));
    }

    #[test]
    fn declared_length_must_match() {
        let frame = encode(&sample()).unwrap();
        let short = &frame[..frame.len() - 1];
        assert!(matches!(
            decode(short),
            Err(DecodeError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn field_length_beyond_frame_is_rejected() {
        let mut b = BytesMut::new();
        b.put_u8(WIRE_VERSION);
        b.put_u32(10_000); // id claims far more than the frame holds
        b.put_slice(b"abc");
        let err = decode(&framed(&b)).unwrap_err();
        assert_eq!(
            err,
            DecodeError::FieldOverrun {
                field: "id",
                declared: 10_000,
                remaining: 3,
            }
        );
    }

    #[test]
    fn unknown_type_ordinal() {
        let body = body_with(9, 0, &fixed_tail());
        assert_eq!(decode(&framed(&body)), Err(DecodeError::UnknownType(9)));
    }

    #[test]
    fn unknown_flags() {
        let body = body_with(0, 0b1000, &fixed_tail());
        assert_eq!(decode(&framed(&body)), Err(DecodeError::UnknownFlags(0b1000)));
    }

    #[test]
    fn unsupported_version() {
        let mut body = encode(&sample()).unwrap()[FRAME_HEADER_LEN..].to_vec();
        body[0] = 2;
        assert_eq!(
            decode(&framed(&body)),
            Err(DecodeError::UnsupportedVersion(2))
        );
    }

    #[test]
    fn missing_fixed_fields() {
        // Declares content but stops right after the flags byte.
        let body = body_with(0, FLAG_CONTENT, &[]);
        assert!(matches!(
            decode(&framed(&body)),
            Err(DecodeError::Truncated { field: "content", .. })
        ));

        let body = body_with(0, 0, &[0, 0, 0]);
        assert!(matches!(
            decode(&framed(&body)),
            Err(DecodeError::Truncated { field: "file_size", .. })
        ));
    }

    #[test]
    fn invalid_utf8() {
        let mut b = BytesMut::new();
        b.put_u8(WIRE_VERSION);
        b.put_u32(2);
        b.put_slice(&[0xff, 0xfe]);
        assert_eq!(
            decode(&framed(&b)),
            Err(DecodeError::InvalidUtf8 { field: "id" })
        );
    }

    #[test]
    fn trailing_bytes() {
        let mut tail = fixed_tail();
        tail.extend_from_slice(&[7, 7]);
        let body = body_with(0, 0, &tail);
        assert_eq!(decode(&framed(&body)), Err(DecodeError::TrailingBytes(2)));
    }

    #[test]
    fn decode_body_slices_payload() {
        let msg = Message::audio("alice", "bob", vec![9u8; 64], "voice.ogg");
        let frame = encode(&msg).unwrap();
        let body = frame.slice(FRAME_HEADER_LEN..);
        let back = decode_body(body).unwrap();
        assert_eq!(back.payload().map(|p| p.as_ref()), Some(&[9u8; 64][..]));
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn lengths_past_u32_are_refused() {
        let len = u32::MAX as usize + 1;
        assert_eq!(
            u32_len("payload", len),
            Err(EncodeError::FieldTooLong {
                field: "payload",
                len,
            })
        );
        assert_eq!(u32_len("payload", u32::MAX as usize), Ok(u32::MAX));
    }
}
