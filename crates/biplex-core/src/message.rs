//! The in-memory record of one RPC frame.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

use crate::codec::{Body, CodecRegistry, NIL_CODEC_ID};
use crate::error::{CodecError, ProtoError};
use crate::xfer::{self, XferPipe};

use bytes::Bytes;

/// Message type: undefined.
pub const TYPE_UNDEFINED: u8 = 0;
/// Message type: a call expecting a correlated REPLY.
pub const TYPE_CALL: u8 = 1;
/// Message type: the reply to a CALL, correlated by seq.
pub const TYPE_REPLY: u8 = 2;
/// Message type: a one-way push.
pub const TYPE_PUSH: u8 = 3;
/// Message type reserved for authorization calls.
pub const TYPE_AUTH_CALL: u8 = 4;
/// Message type reserved for authorization replies.
pub const TYPE_AUTH_REPLY: u8 = 5;

/// Human-readable name of a message type; user-assigned codes print as numbers.
pub fn type_text(mtype: u8) -> String {
    match mtype {
        TYPE_UNDEFINED => "UNDEFINED".to_owned(),
        TYPE_CALL => "CALL".to_owned(),
        TYPE_REPLY => "REPLY".to_owned(),
        TYPE_PUSH => "PUSH".to_owned(),
        TYPE_AUTH_CALL => "AUTH_CALL".to_owned(),
        TYPE_AUTH_REPLY => "AUTH_REPLY".to_owned(),
        other => format!("TYPE({other})"),
    }
}

/// Ordered string multimap carried with every message.
///
/// Serialises as a urlencoded query string; insertion order is preserved on
/// the wire and back.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Meta {
    pairs: Vec<(String, String)>,
}

impl Meta {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a pair; multiple values for the same key may accumulate.
    pub fn add(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.pairs.push((key.into(), value.into()));
    }

    /// Replace every value of `key` with a single one.
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.pairs.retain(|(k, _)| k != key);
        self.pairs.push((key.to_owned(), value.into()));
    }

    /// The first value of `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Every value of `key`, in insertion order.
    pub fn get_all<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> {
        self.pairs
            .iter()
            .filter(move |(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn remove(&mut self, key: &str) {
        self.pairs.retain(|(k, _)| k != key);
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn clear(&mut self) {
        self.pairs.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Serialize as a urlencoded query string.
    pub fn to_query(&self) -> String {
        let mut ser = url::form_urlencoded::Serializer::new(String::new());
        for (k, v) in &self.pairs {
            ser.append_pair(k, v);
        }
        ser.finish()
    }

    /// Parse a urlencoded query string, preserving pair order.
    pub fn from_query(query: &str) -> Self {
        let pairs = url::form_urlencoded::parse(query.as_bytes())
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        Self { pairs }
    }
}

/// A small mutator applied to a message while it is being populated.
pub type MessageSetting = Box<dyn Fn(&mut Message) + Send + Sync>;

/// Set the message type.
pub fn with_mtype(mtype: u8) -> MessageSetting {
    Box::new(move |m| m.set_mtype(mtype))
}

/// Set the service method path.
pub fn with_service_method(service_method: &str) -> MessageSetting {
    let service_method = service_method.to_owned();
    Box::new(move |m| m.set_service_method(&service_method))
}

/// Append a `key=value` meta pair; values for the same key accumulate.
pub fn with_add_meta(key: &str, value: &str) -> MessageSetting {
    let (key, value) = (key.to_owned(), value.to_owned());
    Box::new(move |m| m.meta_mut().add(key.clone(), value.clone()))
}

/// Set a `key=value` meta pair, replacing previous values of the key.
pub fn with_set_meta(key: &str, value: &str) -> MessageSetting {
    let (key, value) = (key.to_owned(), value.to_owned());
    Box::new(move |m| m.meta_mut().set(&key, value.clone()))
}

/// Set the body codec id.
pub fn with_body_codec(body_codec: u8) -> MessageSetting {
    Box::new(move |m| m.set_body_codec(body_codec))
}

/// Set the body.
pub fn with_body(body: Body) -> MessageSetting {
    Box::new(move |m| m.set_body(body.clone()))
}

/// Set the handling deadline.
pub fn with_deadline(deadline: Instant) -> MessageSetting {
    Box::new(move |m| m.set_deadline(Some(deadline)))
}

/// Append filter ids to the transfer pipe, resolving against the
/// process-wide filter registry.
///
/// # Panics
///
/// Panics if an id is not registered; an unknown id in an outbound pipe is a
/// start-up bug.
pub fn with_xfer_pipe(filter_ids: &[u8]) -> MessageSetting {
    let ids = filter_ids.to_vec();
    Box::new(move |m| {
        for &id in &ids {
            if let Err(e) = m.xfer_pipe_mut().append(xfer::global(), id) {
                panic!("{e}");
            }
        }
    })
}

/// The in-memory record of one RPC frame.
#[derive(Debug, Default)]
pub struct Message {
    // Required header fields.
    seq: i32,
    mtype: u8,
    service_method: String,
    meta: Meta,

    // Optional body fields.
    body_codec: u8,
    body: Body,

    // Transfer pipe, framed size, handling deadline.
    xfer_pipe: XferPipe,
    size: u32,
    deadline: Option<Instant>,
}

impl Message {
    pub fn new() -> Self {
        Self::default()
    }

    /// A message with the given settings applied.
    pub fn with_settings(settings: &[MessageSetting]) -> Self {
        let mut m = Self::new();
        m.apply(settings);
        m
    }

    pub fn apply(&mut self, settings: &[MessageSetting]) {
        for setting in settings {
            setting(self);
        }
    }

    /// Clear every field, then re-apply `settings`.
    pub fn reset(&mut self, settings: &[MessageSetting]) {
        self.seq = 0;
        self.mtype = TYPE_UNDEFINED;
        self.service_method.clear();
        self.meta.clear();
        self.body_codec = NIL_CODEC_ID;
        self.body = Body::None;
        self.xfer_pipe.reset();
        self.size = 0;
        self.deadline = None;
        self.apply(settings);
    }

    pub fn seq(&self) -> i32 {
        self.seq
    }

    pub fn set_seq(&mut self, seq: i32) {
        self.seq = seq;
    }

    pub fn mtype(&self) -> u8 {
        self.mtype
    }

    pub fn set_mtype(&mut self, mtype: u8) {
        self.mtype = mtype;
    }

    /// The service method path. Recommended length ≤255 bytes.
    pub fn service_method(&self) -> &str {
        &self.service_method
    }

    pub fn set_service_method(&mut self, service_method: &str) {
        self.service_method = service_method.to_owned();
    }

    pub fn meta(&self) -> &Meta {
        &self.meta
    }

    pub fn meta_mut(&mut self) -> &mut Meta {
        &mut self.meta
    }

    pub fn body_codec(&self) -> u8 {
        self.body_codec
    }

    pub fn set_body_codec(&mut self, body_codec: u8) {
        self.body_codec = body_codec;
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    pub fn set_body(&mut self, body: Body) {
        self.body = body;
    }

    pub fn take_body(&mut self) -> Body {
        std::mem::take(&mut self.body)
    }

    pub fn xfer_pipe(&self) -> &XferPipe {
        &self.xfer_pipe
    }

    pub fn xfer_pipe_mut(&mut self) -> &mut XferPipe {
        &mut self.xfer_pipe
    }

    /// Total framed byte length, set by the protocol.
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Record the framed size, rejecting sizes above the global limit.
    pub fn set_size(&mut self, size: u32) -> Result<(), ProtoError> {
        check_message_size(size)?;
        self.size = size;
        Ok(())
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn set_deadline(&mut self, deadline: Option<Instant>) {
        self.deadline = deadline;
    }

    /// Encode the body. Raw byte bodies bypass the codec; empty for `None`.
    pub fn marshal_body(&self, codecs: &CodecRegistry) -> Result<Bytes, CodecError> {
        match &self.body {
            Body::None => Ok(Bytes::new()),
            Body::Bytes(b) => Ok(b.clone()),
            Body::Value(v) => codecs.get(self.body_codec)?.marshal(v),
        }
    }

    /// Decode `body_bytes` according to the body codec already parsed into
    /// the header. Codec id 0 leaves the bytes raw.
    pub fn unmarshal_body(
        &mut self,
        body_bytes: &[u8],
        codecs: &CodecRegistry,
    ) -> Result<(), CodecError> {
        if body_bytes.is_empty() {
            self.body = Body::None;
            return Ok(());
        }
        if self.body_codec == NIL_CODEC_ID {
            self.body = Body::Bytes(Bytes::copy_from_slice(body_bytes));
            return Ok(());
        }
        let value = codecs.get(self.body_codec)?.unmarshal(body_bytes)?;
        self.body = Body::Value(value);
        Ok(())
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let body = match &self.body {
            Body::None => serde_json::Value::Null,
            Body::Bytes(b) => serde_json::Value::String(format!("<{} raw bytes>", b.len())),
            Body::Value(v) => v.clone(),
        };
        let dump = serde_json::json!({
            "seq": self.seq,
            "mtype": self.mtype,
            "serviceMethod": self.service_method,
            "meta": self.meta.to_query(),
            "bodyCodec": self.body_codec,
            "body": body,
            "xferPipe": self.xfer_pipe.ids(),
            "size": self.size,
        });
        write!(f, "{dump:#}")
    }
}

static MESSAGE_SIZE_LIMIT: AtomicU32 = AtomicU32::new(u32::MAX);

/// The message size upper limit for reading and writing.
pub fn message_size_limit() -> u32 {
    MESSAGE_SIZE_LIMIT.load(Ordering::Relaxed)
}

/// Set the global message size limit; 0 resets to the full u32 range.
pub fn set_message_size_limit(limit: u32) {
    let limit = if limit == 0 { u32::MAX } else { limit };
    MESSAGE_SIZE_LIMIT.store(limit, Ordering::Relaxed);
}

/// Reject sizes above the global limit.
pub fn check_message_size(size: u32) -> Result<(), ProtoError> {
    let limit = message_size_limit();
    if size > limit {
        return Err(ProtoError::ExceedSizeLimit { size, limit });
    }
    Ok(())
}
