//! Error types and the structured remote error.

use core::fmt;

use serde::{Deserialize, Serialize};

use crate::message::Meta;

/// Codec registry and body (de)serialization errors.
#[derive(Debug)]
pub enum CodecError {
    /// No codec registered under this id.
    Unknown(u8),
    /// No codec registered under this name.
    UnknownName(String),
    /// A codec with this id is already registered.
    AlreadyRegistered(u8),
    EncodeFailed(String),
    DecodeFailed(String),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown(id) => write!(f, "unknown codec id: {id:#04x}"),
            Self::UnknownName(name) => write!(f, "unknown codec name: {name}"),
            Self::AlreadyRegistered(id) => {
                write!(f, "codec id {id:#04x} is already registered")
            }
            Self::EncodeFailed(msg) => write!(f, "body encode failed: {msg}"),
            Self::DecodeFailed(msg) => write!(f, "body decode failed: {msg}"),
        }
    }
}

impl std::error::Error for CodecError {}

/// Transfer-filter registry and pipe errors.
#[derive(Debug)]
pub enum FilterError {
    /// No filter registered under this id.
    Unknown(u8),
    /// A filter with this id is already registered.
    AlreadyRegistered(u8),
    /// The pipe would exceed the 255-id cap.
    PipeOverflow(usize),
    /// A filter rejected the bytes it was given.
    Apply { name: &'static str, message: String },
}

impl fmt::Display for FilterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown(id) => write!(f, "unknown transfer filter id: {id:#04x}"),
            Self::AlreadyRegistered(id) => {
                write!(f, "transfer filter id {id:#04x} is already registered")
            }
            Self::PipeOverflow(len) => {
                write!(f, "transfer pipe length {len} exceeds 255")
            }
            Self::Apply { name, message } => write!(f, "filter {name}: {message}"),
        }
    }
}

impl std::error::Error for FilterError {}

/// Wire protocol errors.
///
/// Only some of these desynchronise the byte stream. A reader must tear the
/// connection down on [`ProtoError::is_stream_fatal`] errors and may keep
/// reading after the rest, because the offending frame has been fully
/// consumed by then.
#[derive(Debug)]
pub enum ProtoError {
    /// The frame header announces a size above the configured limit.
    ExceedSizeLimit { size: u32, limit: u32 },
    /// The connection is closed.
    Closed,
    /// The frame structure itself is broken; the stream position is lost.
    BadFrame(String),
    /// The frame was consumed but its payload record does not parse.
    BadPayload(String),
    Io(std::io::Error),
    Codec(CodecError),
    Filter(FilterError),
}

impl ProtoError {
    /// True if the byte stream can no longer be trusted after this error.
    pub fn is_stream_fatal(&self) -> bool {
        matches!(
            self,
            Self::ExceedSizeLimit { .. } | Self::Closed | Self::BadFrame(_) | Self::Io(_)
        )
    }
}

impl fmt::Display for ProtoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ExceedSizeLimit { size, limit } => {
                write!(f, "message size {size} exceeds limit {limit}")
            }
            Self::Closed => write!(f, "connection closed"),
            Self::BadFrame(msg) => write!(f, "bad frame: {msg}"),
            Self::BadPayload(msg) => write!(f, "bad payload: {msg}"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Codec(e) => write!(f, "codec error: {e}"),
            Self::Filter(e) => write!(f, "filter error: {e}"),
        }
    }
}

impl std::error::Error for ProtoError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Codec(e) => Some(e),
            Self::Filter(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ProtoError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            Self::Closed
        } else {
            Self::Io(e)
        }
    }
}

impl From<CodecError> for ProtoError {
    fn from(e: CodecError) -> Self {
        Self::Codec(e)
    }
}

impl From<FilterError> for ProtoError {
    fn from(e: FilterError) -> Self {
        Self::Filter(e)
    }
}

/// Reserved meta key carrying a serialized [`Rerror`].
pub const META_RERROR_KEY: &str = "X-Reason";

/// Status code for a malformed or undecodable message.
pub const CODE_BAD_MESSAGE: i32 = 400;
/// Status code for a service method with no registered handler.
pub const CODE_NOT_FOUND: i32 = 404;
/// Status code for a handler that exceeded its context age.
pub const CODE_HANDLE_TIMEOUT: i32 = 408;
/// Status code for a handler failure, including trapped panics.
pub const CODE_INTERNAL: i32 = 500;

/// Structured error returned by the remote peer.
///
/// Travels on the wire as JSON in the reserved meta key; a REPLY carrying
/// one fails the corresponding CALL on the other side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rerror {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cause: String,
}

impl Rerror {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            cause: String::new(),
        }
    }

    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.cause = cause.into();
        self
    }

    pub fn bad_message(cause: impl Into<String>) -> Self {
        Self::new(CODE_BAD_MESSAGE, "bad message").with_cause(cause)
    }

    pub fn not_found(service_method: &str) -> Self {
        Self::new(CODE_NOT_FOUND, "handler not found").with_cause(service_method.to_owned())
    }

    pub fn handle_timeout() -> Self {
        Self::new(CODE_HANDLE_TIMEOUT, "handle timeout")
    }

    pub fn internal(cause: impl Into<String>) -> Self {
        Self::new(CODE_INTERNAL, "internal server error").with_cause(cause)
    }

    /// Serialize into the reserved meta key, replacing any previous value.
    pub fn write_to_meta(&self, meta: &mut Meta) {
        let encoded = serde_json::to_string(self).expect("Rerror is always serializable");
        meta.set(META_RERROR_KEY, &encoded);
    }

    /// Extract from the reserved meta key, if present and well-formed.
    pub fn from_meta(meta: &Meta) -> Option<Self> {
        let raw = meta.get(META_RERROR_KEY)?;
        serde_json::from_str(raw).ok()
    }
}

impl fmt::Display for Rerror {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.cause.is_empty() {
            write!(f, "{}: {}", self.code, self.message)
        } else {
            write!(f, "{}: {} ({})", self.code, self.message, self.cause)
        }
    }
}

impl std::error::Error for Rerror {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rerror_meta_roundtrip() {
        let mut meta = Meta::new();
        let rerr = Rerror::new(500, "boom").with_cause("stack");
        rerr.write_to_meta(&mut meta);
        assert_eq!(Rerror::from_meta(&meta), Some(rerr));
    }

    #[test]
    fn rerror_absent_from_empty_meta() {
        assert_eq!(Rerror::from_meta(&Meta::new()), None);
    }

    #[test]
    fn stream_fatal_classification() {
        assert!(ProtoError::Closed.is_stream_fatal());
        assert!(ProtoError::ExceedSizeLimit { size: 10, limit: 5 }.is_stream_fatal());
        assert!(ProtoError::BadFrame("truncated".into()).is_stream_fatal());
        assert!(!ProtoError::BadPayload("garbage record".into()).is_stream_fatal());
        assert!(!ProtoError::Filter(FilterError::Unknown(0xff)).is_stream_fatal());
        assert!(!ProtoError::Codec(CodecError::Unknown(9)).is_stream_fatal());
    }
}
