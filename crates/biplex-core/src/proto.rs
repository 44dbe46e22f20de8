//! Wire protocols: framing a message over a byte stream.
//!
//! Every protocol shares the outer frame
//!
//! ```text
//! size:u32-be | pipe_len:u8 | pipe:u8[pipe_len] | payload
//! ```
//!
//! where `size` counts every byte of the frame including itself and the
//! payload has already been run through the transfer pipe. Protocols differ
//! in how the payload record is serialized.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::buffer_pool::BufferPool;
use crate::codec::{self, CodecRegistry};
use crate::error::ProtoError;
use crate::message::{check_message_size, Message};
use crate::xfer::{self, XferRegistry};

/// Boxed future type for object-safe protocol methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// The write half a protocol packs into.
pub type ProtoWriter = dyn AsyncWrite + Unpin + Send;
/// The read half a protocol unpacks from.
pub type ProtoReader = dyn AsyncRead + Unpin + Send;

/// A wire protocol instance, bound to one socket direction.
///
/// `pack` must either write a complete frame or write nothing: a pack-side
/// error (oversize, unknown codec) leaves the stream untouched. `unpack`
/// must leave the stream positioned at the next frame boundary for every
/// error that is not [`ProtoError::is_stream_fatal`].
pub trait Proto: Send + Sync {
    fn version(&self) -> u8;
    fn name(&self) -> &'static str;

    /// Frame `m` onto `w`; returns the number of bytes written.
    fn pack<'a>(
        &'a mut self,
        w: &'a mut ProtoWriter,
        m: &'a mut Message,
    ) -> BoxFuture<'a, Result<usize, ProtoError>>;

    /// Read one frame from `r` into `m`; returns the number of bytes read.
    fn unpack<'a>(
        &'a mut self,
        r: &'a mut ProtoReader,
        m: &'a mut Message,
    ) -> BoxFuture<'a, Result<usize, ProtoError>>;
}

/// Creates a fresh protocol instance for each socket direction (and again on
/// every redial reset).
pub type ProtoFactory = Arc<dyn Fn() -> Box<dyn Proto> + Send + Sync>;

/// The length-prefixed structured protocol over the given registries.
pub fn raw_proto_factory(codecs: CodecRegistry, xfers: XferRegistry) -> ProtoFactory {
    let pool = BufferPool::new();
    Arc::new(move || Box::new(RawProto::new(codecs.clone(), xfers.clone(), pool.clone())))
}

/// [`raw_proto_factory`] over the process-wide registries.
pub fn default_proto_factory() -> ProtoFactory {
    raw_proto_factory(codec::global().clone(), xfer::global().clone())
}

/// The JSON-envelope protocol over the given registries.
pub fn json_proto_factory(codecs: CodecRegistry, xfers: XferRegistry) -> ProtoFactory {
    let pool = BufferPool::new();
    Arc::new(move || Box::new(JsonProto::new(codecs.clone(), xfers.clone(), pool.clone())))
}

/// Write the shared outer frame. `payload` has been through the pipe.
async fn write_frame(
    w: &mut ProtoWriter,
    m: &mut Message,
    payload: Vec<u8>,
) -> Result<usize, ProtoError> {
    let pipe_ids = m.xfer_pipe().ids();
    let total = 4u64 + 1 + pipe_ids.len() as u64 + payload.len() as u64;
    let size = u32::try_from(total).map_err(|_| ProtoError::ExceedSizeLimit {
        size: u32::MAX,
        limit: crate::message::message_size_limit(),
    })?;
    // The limit check happens here, before a single byte is written.
    m.set_size(size)?;

    let mut frame = Vec::with_capacity(size as usize);
    frame.extend_from_slice(&size.to_be_bytes());
    frame.push(pipe_ids.len() as u8);
    frame.extend_from_slice(&pipe_ids);
    frame.extend_from_slice(&payload);
    w.write_all(&frame).await?;
    w.flush().await?;
    Ok(size as usize)
}

/// Read the shared outer frame: returns the unfiltered payload record.
///
/// The frame is consumed in full before the pipe ids are resolved, so an
/// unknown filter id poisons only this message, not the stream.
async fn read_frame(
    r: &mut ProtoReader,
    m: &mut Message,
    pool: &BufferPool,
    xfers: &XferRegistry,
) -> Result<(Vec<u8>, usize), ProtoError> {
    let mut size_buf = [0u8; 4];
    r.read_exact(&mut size_buf).await?;
    let size = u32::from_be_bytes(size_buf);
    // Reject before allocating the payload buffer.
    check_message_size(size)?;
    if size < 5 {
        return Err(ProtoError::BadFrame(format!("frame size {size} < 5")));
    }
    m.set_size(size)?;

    let mut pipe_len_buf = [0u8; 1];
    r.read_exact(&mut pipe_len_buf).await?;
    let pipe_len = pipe_len_buf[0] as u32;
    if 5 + pipe_len > size {
        return Err(ProtoError::BadFrame(format!(
            "pipe length {pipe_len} exceeds frame size {size}"
        )));
    }

    let mut pipe_ids = [0u8; 255];
    let pipe_ids = &mut pipe_ids[..pipe_len as usize];
    r.read_exact(pipe_ids).await?;

    let payload_len = (size - 5 - pipe_len) as usize;
    let mut buf = pool.get();
    buf.resize(payload_len, 0);
    r.read_exact(&mut buf).await?;

    // Frame fully consumed; everything below is a per-message error.
    for &id in pipe_ids.iter() {
        m.xfer_pipe_mut().append(xfers, id)?;
    }
    let record = if m.xfer_pipe().is_empty() {
        buf.to_vec()
    } else {
        m.xfer_pipe().on_unpack(buf.to_vec())?
    };
    Ok((record, size as usize))
}

/// The length-prefixed structured protocol.
///
/// Payload record layout, all numbers big-endian:
///
/// ```text
/// seq:i32 | mtype:u8 | sm_len:u8 | service_method | meta_len:u16 |
/// meta (urlencoded) | body_codec:u8 | body
/// ```
pub struct RawProto {
    codecs: CodecRegistry,
    xfers: XferRegistry,
    pool: BufferPool,
}

impl RawProto {
    pub fn new(codecs: CodecRegistry, xfers: XferRegistry, pool: BufferPool) -> Self {
        Self { codecs, xfers, pool }
    }

    fn encode_record(&self, m: &Message) -> Result<Vec<u8>, ProtoError> {
        let body = m.marshal_body(&self.codecs)?;
        let sm = m.service_method().as_bytes();
        if sm.len() > u8::MAX as usize {
            return Err(ProtoError::BadPayload(format!(
                "service method length {} exceeds 255",
                sm.len()
            )));
        }
        let meta = m.meta().to_query();
        if meta.len() > u16::MAX as usize {
            return Err(ProtoError::BadPayload(format!(
                "meta length {} exceeds 65535",
                meta.len()
            )));
        }

        let mut record = Vec::with_capacity(9 + sm.len() + meta.len() + body.len());
        record.extend_from_slice(&m.seq().to_be_bytes());
        record.push(m.mtype());
        record.push(sm.len() as u8);
        record.extend_from_slice(sm);
        record.extend_from_slice(&(meta.len() as u16).to_be_bytes());
        record.extend_from_slice(meta.as_bytes());
        record.push(m.body_codec());
        record.extend_from_slice(&body);
        Ok(record)
    }

    fn decode_record(&self, record: &[u8], m: &mut Message) -> Result<(), ProtoError> {
        let mut cur = Cursor::new(record);
        m.set_seq(i32::from_be_bytes(cur.take_array::<4>()?));
        m.set_mtype(cur.take_array::<1>()?[0]);

        let sm_len = cur.take_array::<1>()?[0] as usize;
        let sm = std::str::from_utf8(cur.take(sm_len)?)
            .map_err(|e| ProtoError::BadPayload(format!("service method not UTF-8: {e}")))?;
        m.set_service_method(sm);

        let meta_len = u16::from_be_bytes(cur.take_array::<2>()?) as usize;
        let meta = std::str::from_utf8(cur.take(meta_len)?)
            .map_err(|e| ProtoError::BadPayload(format!("meta not UTF-8: {e}")))?;
        *m.meta_mut() = crate::message::Meta::from_query(meta);

        m.set_body_codec(cur.take_array::<1>()?[0]);
        m.unmarshal_body(cur.rest(), &self.codecs)?;
        Ok(())
    }
}

impl Proto for RawProto {
    fn version(&self) -> u8 {
        6
    }

    fn name(&self) -> &'static str {
        "raw"
    }

    fn pack<'a>(
        &'a mut self,
        w: &'a mut ProtoWriter,
        m: &'a mut Message,
    ) -> BoxFuture<'a, Result<usize, ProtoError>> {
        Box::pin(async move {
            let record = self.encode_record(m)?;
            let payload = m.xfer_pipe().on_pack(record)?;
            write_frame(w, m, payload).await
        })
    }

    fn unpack<'a>(
        &'a mut self,
        r: &'a mut ProtoReader,
        m: &'a mut Message,
    ) -> BoxFuture<'a, Result<usize, ProtoError>> {
        Box::pin(async move {
            let (record, n) = read_frame(r, m, &self.pool, &self.xfers).await?;
            self.decode_record(&record, m)?;
            Ok(n)
        })
    }
}

#[derive(Serialize, Deserialize)]
struct JsonEnvelope {
    seq: i32,
    mtype: u8,
    #[serde(rename = "serviceMethod")]
    service_method: String,
    meta: String,
    #[serde(rename = "bodyCodec")]
    body_codec: u8,
    body: Vec<u8>,
}

/// A raw-frame variant whose payload record is a JSON envelope.
///
/// The body travels as the codec's bytes inside the envelope, so every
/// header field still round-trips exactly.
pub struct JsonProto {
    codecs: CodecRegistry,
    xfers: XferRegistry,
    pool: BufferPool,
}

impl JsonProto {
    pub fn new(codecs: CodecRegistry, xfers: XferRegistry, pool: BufferPool) -> Self {
        Self { codecs, xfers, pool }
    }
}

impl Proto for JsonProto {
    fn version(&self) -> u8 {
        106
    }

    fn name(&self) -> &'static str {
        "json"
    }

    fn pack<'a>(
        &'a mut self,
        w: &'a mut ProtoWriter,
        m: &'a mut Message,
    ) -> BoxFuture<'a, Result<usize, ProtoError>> {
        Box::pin(async move {
            let body = m.marshal_body(&self.codecs)?;
            let envelope = JsonEnvelope {
                seq: m.seq(),
                mtype: m.mtype(),
                service_method: m.service_method().to_owned(),
                meta: m.meta().to_query(),
                body_codec: m.body_codec(),
                body: body.to_vec(),
            };
            let record = serde_json::to_vec(&envelope)
                .map_err(|e| ProtoError::BadPayload(e.to_string()))?;
            let payload = m.xfer_pipe().on_pack(record)?;
            write_frame(w, m, payload).await
        })
    }

    fn unpack<'a>(
        &'a mut self,
        r: &'a mut ProtoReader,
        m: &'a mut Message,
    ) -> BoxFuture<'a, Result<usize, ProtoError>> {
        Box::pin(async move {
            let (record, n) = read_frame(r, m, &self.pool, &self.xfers).await?;
            let envelope: JsonEnvelope = serde_json::from_slice(&record)
                .map_err(|e| ProtoError::BadPayload(e.to_string()))?;
            m.set_seq(envelope.seq);
            m.set_mtype(envelope.mtype);
            m.set_service_method(&envelope.service_method);
            *m.meta_mut() = crate::message::Meta::from_query(&envelope.meta);
            m.set_body_codec(envelope.body_codec);
            m.unmarshal_body(&envelope.body, &self.codecs)?;
            Ok(n)
        })
    }
}

/// Bounds-checked reader over a payload record.
struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ProtoError> {
        if self.pos + n > self.data.len() {
            return Err(ProtoError::BadPayload(format!(
                "record truncated at byte {} (want {n} more)",
                self.pos
            )));
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], ProtoError> {
        let slice = self.take(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Ok(out)
    }

    fn rest(&mut self) -> &'a [u8] {
        let out = &self.data[self.pos..];
        self.pos = self.data.len();
        out
    }
}
