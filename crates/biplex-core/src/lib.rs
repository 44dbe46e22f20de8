//! biplex-core: the wire plane of the biplex RPC framework.
//!
//! This crate defines:
//! - The message record ([`Message`], [`Meta`], message settings)
//! - Body codecs and their registry ([`Codec`], [`CodecRegistry`])
//! - Transfer filters and the filter pipe ([`XferFilter`], [`XferPipe`])
//! - Wire protocols ([`Proto`], [`RawProto`], [`JsonProto`])
//! - The socket binding a connection to a protocol ([`Socket`])
//! - Error types ([`ProtoError`], [`CodecError`], [`FilterError`], [`Rerror`])
//!
//! The RPC plane (sessions, routing, peers) lives in the `biplex` crate.

#![forbid(unsafe_code)]

mod buffer_pool;
pub mod codec;
mod error;
mod message;
mod proto;
mod socket;
pub mod xfer;

pub use buffer_pool::{BufferPool, PooledBuf};
pub use codec::{Body, Codec, CodecRegistry, NIL_CODEC_ID};
pub use error::{
    CodecError, FilterError, ProtoError, Rerror, CODE_BAD_MESSAGE, CODE_HANDLE_TIMEOUT,
    CODE_INTERNAL, CODE_NOT_FOUND, META_RERROR_KEY,
};
pub use message::{
    check_message_size, message_size_limit, set_message_size_limit, type_text, with_add_meta,
    with_body, with_body_codec, with_deadline, with_mtype, with_service_method, with_set_meta,
    with_xfer_pipe, Message, MessageSetting, Meta, TYPE_AUTH_CALL, TYPE_AUTH_REPLY, TYPE_CALL,
    TYPE_PUSH, TYPE_REPLY, TYPE_UNDEFINED,
};
pub use proto::{
    default_proto_factory, json_proto_factory, raw_proto_factory, BoxFuture, JsonProto, Proto,
    ProtoFactory, ProtoReader, ProtoWriter, RawProto,
};
pub use socket::{ConnStream, Socket};
pub use xfer::{XferFilter, XferPipe, XferRegistry};
