//! Body codecs and the codec registry.
//!
//! A codec turns the structured body value of a message into bytes and back,
//! and is identified on the wire by a single byte. The registry maps both the
//! id and the codec name to the implementation; nothing in the wire plane
//! hard-codes a serialization.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use parking_lot::RwLock;
use serde_json::Value;

use crate::error::CodecError;

/// Body codec id meaning "no codec".
pub const NIL_CODEC_ID: u8 = 0;

/// Id of the built-in JSON codec.
pub const JSON_CODEC_ID: u8 = b'j';
/// Id of the built-in MessagePack codec.
pub const MSGPACK_CODEC_ID: u8 = b'm';
/// Id of the built-in plain-text codec.
pub const PLAIN_CODEC_ID: u8 = b's';
/// Id of the built-in raw-bytes codec.
pub const RAW_CODEC_ID: u8 = b'r';

/// The body of a message.
///
/// Exactly one of: nothing, an opaque byte buffer, or a structured value
/// whose wire form is produced by the codec named in the message header.
/// Typed values cross the boundary via `serde_json::to_value`/`from_value`,
/// so any `Serialize`/`DeserializeOwned` type rides through any codec.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Body {
    #[default]
    None,
    Bytes(Bytes),
    Value(Value),
}

impl Body {
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    /// Borrow the structured value, if this body carries one.
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Self::Value(v) => Some(v),
            _ => None,
        }
    }

    /// Borrow the raw bytes, if this body carries them.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b),
            _ => None,
        }
    }
}

impl From<Value> for Body {
    fn from(v: Value) -> Self {
        Self::Value(v)
    }
}

impl From<Bytes> for Body {
    fn from(b: Bytes) -> Self {
        Self::Bytes(b)
    }
}

impl From<Vec<u8>> for Body {
    fn from(b: Vec<u8>) -> Self {
        Self::Bytes(Bytes::from(b))
    }
}

/// A body serializer identified by a 1-byte id.
pub trait Codec: Send + Sync + 'static {
    fn id(&self) -> u8;
    fn name(&self) -> &'static str;
    fn marshal(&self, value: &Value) -> Result<Bytes, CodecError>;
    fn unmarshal(&self, bytes: &[u8]) -> Result<Value, CodecError>;
}

/// JSON codec (`serde_json`).
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn id(&self) -> u8 {
        JSON_CODEC_ID
    }

    fn name(&self) -> &'static str {
        "json"
    }

    fn marshal(&self, value: &Value) -> Result<Bytes, CodecError> {
        serde_json::to_vec(value)
            .map(Bytes::from)
            .map_err(|e| CodecError::EncodeFailed(e.to_string()))
    }

    fn unmarshal(&self, bytes: &[u8]) -> Result<Value, CodecError> {
        serde_json::from_slice(bytes).map_err(|e| CodecError::DecodeFailed(e.to_string()))
    }
}

/// MessagePack codec (`rmp-serde`).
pub struct MsgpackCodec;

impl Codec for MsgpackCodec {
    fn id(&self) -> u8 {
        MSGPACK_CODEC_ID
    }

    fn name(&self) -> &'static str {
        "msgpack"
    }

    fn marshal(&self, value: &Value) -> Result<Bytes, CodecError> {
        rmp_serde::to_vec_named(value)
            .map(Bytes::from)
            .map_err(|e| CodecError::EncodeFailed(e.to_string()))
    }

    fn unmarshal(&self, bytes: &[u8]) -> Result<Value, CodecError> {
        rmp_serde::from_slice(bytes).map_err(|e| CodecError::DecodeFailed(e.to_string()))
    }
}

/// Plain-text codec: the value must be a string and travels as UTF-8.
pub struct PlainCodec;

impl Codec for PlainCodec {
    fn id(&self) -> u8 {
        PLAIN_CODEC_ID
    }

    fn name(&self) -> &'static str {
        "plain"
    }

    fn marshal(&self, value: &Value) -> Result<Bytes, CodecError> {
        match value {
            Value::String(s) => Ok(Bytes::from(s.clone().into_bytes())),
            other => Err(CodecError::EncodeFailed(format!(
                "plain codec requires a string value, got {other}"
            ))),
        }
    }

    fn unmarshal(&self, bytes: &[u8]) -> Result<Value, CodecError> {
        let s = std::str::from_utf8(bytes)
            .map_err(|e| CodecError::DecodeFailed(e.to_string()))?;
        Ok(Value::String(s.to_owned()))
    }
}

/// Raw codec: the value must be a JSON array of bytes; travels untouched.
///
/// Mostly useful as an explicit id for pre-serialized bodies; `Body::Bytes`
/// bypasses codecs entirely and is the usual way to send raw bytes.
pub struct RawCodec;

impl Codec for RawCodec {
    fn id(&self) -> u8 {
        RAW_CODEC_ID
    }

    fn name(&self) -> &'static str {
        "raw"
    }

    fn marshal(&self, value: &Value) -> Result<Bytes, CodecError> {
        serde_json::from_value::<Vec<u8>>(value.clone())
            .map(Bytes::from)
            .map_err(|e| CodecError::EncodeFailed(e.to_string()))
    }

    fn unmarshal(&self, bytes: &[u8]) -> Result<Value, CodecError> {
        Ok(Value::from(bytes.to_vec()))
    }
}

#[derive(Default)]
struct CodecMaps {
    by_id: HashMap<u8, Arc<dyn Codec>>,
    by_name: HashMap<&'static str, Arc<dyn Codec>>,
}

/// A scoped codec registry.
///
/// Cheap to clone; clones share the same underlying tables. Registration is
/// one-shot per id. The registry is effectively read-only after start-up;
/// register everything before the first connection.
#[derive(Clone, Default)]
pub struct CodecRegistry {
    inner: Arc<RwLock<CodecMaps>>,
}

impl CodecRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry preloaded with the built-in codecs.
    pub fn with_defaults() -> Self {
        let reg = Self::new();
        reg.register(Arc::new(JsonCodec)).expect("fresh registry");
        reg.register(Arc::new(MsgpackCodec)).expect("fresh registry");
        reg.register(Arc::new(PlainCodec)).expect("fresh registry");
        reg.register(Arc::new(RawCodec)).expect("fresh registry");
        reg
    }

    pub fn register(&self, codec: Arc<dyn Codec>) -> Result<(), CodecError> {
        let id = codec.id();
        if id == NIL_CODEC_ID {
            return Err(CodecError::AlreadyRegistered(NIL_CODEC_ID));
        }
        let mut maps = self.inner.write();
        if maps.by_id.contains_key(&id) {
            return Err(CodecError::AlreadyRegistered(id));
        }
        maps.by_name.insert(codec.name(), codec.clone());
        maps.by_id.insert(id, codec);
        Ok(())
    }

    pub fn get(&self, id: u8) -> Result<Arc<dyn Codec>, CodecError> {
        self.inner
            .read()
            .by_id
            .get(&id)
            .cloned()
            .ok_or(CodecError::Unknown(id))
    }

    pub fn get_by_name(&self, name: &str) -> Result<Arc<dyn Codec>, CodecError> {
        self.inner
            .read()
            .by_name
            .get(name)
            .cloned()
            .ok_or_else(|| CodecError::UnknownName(name.to_owned()))
    }
}

/// The process-wide registry, preloaded with the built-in codecs.
pub fn global() -> &'static CodecRegistry {
    static GLOBAL: OnceLock<CodecRegistry> = OnceLock::new();
    GLOBAL.get_or_init(CodecRegistry::with_defaults)
}

/// Register a codec in the process-wide registry.
///
/// # Panics
///
/// Panics if the id is already taken; duplicate ids are a start-up bug.
pub fn register(codec: Arc<dyn Codec>) {
    if let Err(e) = global().register(codec) {
        panic!("{e}");
    }
}
