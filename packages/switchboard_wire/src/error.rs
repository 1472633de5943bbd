//! Encode and decode failures for the frame codec.

/// Why a frame could not be turned into a [`crate::Message`].
///
/// A decode error is always fatal to the connection that produced the
/// frame and never to anything else.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("truncated length prefix: {available} of 4 bytes")]
    TruncatedPrefix { available: usize },

    #[error("truncated frame: {field} needs {needed} bytes, {remaining} remain")]
    Truncated {
        field: &'static str,
        needed: usize,
        remaining: usize,
    },

    #[error("{field} declares {declared} bytes but only {remaining} remain in the frame")]
    FieldOverrun {
        field: &'static str,
        declared: usize,
        remaining: usize,
    },

    #[error("frame declares {declared} bytes but carries {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },

    #[error("unknown message type ordinal {0}")]
    UnknownType(u8),

    #[error("unsupported wire version {0}")]
    UnsupportedVersion(u8),

    #[error("unknown field flags {0:#04x}")]
    UnknownFlags(u8),

    #[error("{field} is not valid UTF-8")]
    InvalidUtf8 { field: &'static str },

    #[error("{0} trailing bytes after the last field")]
    TrailingBytes(usize),

    #[error("timestamp {0} ms is out of range")]
    InvalidTimestamp(i64),
}

impl DecodeError {
    /// Short stable label, used as a structured logging field.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::TruncatedPrefix { .. } => "truncated_prefix",
            Self::Truncated { .. } => "truncated",
            Self::FieldOverrun { .. } => "field_overrun",
            Self::LengthMismatch { .. } => "length_mismatch",
            Self::FrameTooLarge { .. } => "frame_too_large",
            Self::UnknownType(_) => "unknown_type",
            Self::UnsupportedVersion(_) => "unsupported_version",
            Self::UnknownFlags(_) => "unknown_flags",
            Self::InvalidUtf8 { .. } => "invalid_utf8",
            Self::TrailingBytes(_) => "trailing_bytes",
            Self::InvalidTimestamp(_) => "invalid_timestamp",
        }
    }
}

/// Why a [`crate::Message`] could not be written as a frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncodeError {
    #[error("{field} is {len} bytes, over the u32 length prefix limit")]
    FieldTooLong { field: &'static str, len: usize },
}

impl EncodeError {
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::FieldTooLong { .. } => "field_too_long",
        }
    }
}
