//! biplex: a bidirectional peer-to-peer RPC framework.
//!
//! Every endpoint is a [`Peer`]: it can serve methods and invoke methods on
//! its counterpart over the same connection. One connection is one
//! [`Session`]; a session multiplexes any number of concurrent CALLs,
//! their REPLYs (correlated by sequence number) and one-way PUSHes.
//!
//! # Quick start
//!
//! ```ignore
//! use std::sync::Arc;
//! use biplex::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Server peer.
//!     let srv = Peer::new(PeerConfig {
//!         listen_addr: "127.0.0.1".into(),
//!         listen_port: 9090,
//!         ..PeerConfig::default()
//!     })?;
//!     srv.route_call("home.test", |ctx| async move {
//!         let arg: serde_json::Value = ctx.parse_arg()?;
//!         Ok(Body::Value(serde_json::json!({ "arg": arg })))
//!     });
//!     tokio::spawn(async move { srv.listen_and_serve().await });
//!
//!     // Client peer on the same process (or anywhere else).
//!     let cli = Peer::new(PeerConfig::default())?;
//!     let sess = cli.dial("127.0.0.1:9090").await?;
//!     let reply: serde_json::Value = sess
//!         .call_typed("home.test", &serde_json::json!({"author": "henrylee2cn"}), vec![])
//!         .await?;
//!     println!("{reply}");
//!     Ok(())
//! }
//! ```
//!
//! # Bidirectional calls
//!
//! The server side holds the same [`Session`] type the client does; a CALL
//! handler may push to its caller mid-call through
//! [`HandlerCtx::session`], and either side may register handlers and
//! invoke the other.
//!
//! # Wire plane
//!
//! Framing, codecs and transfer filters live in [`biplex_core`] and are
//! re-exported here: the message record ([`Message`]), the codec registry
//! ([`CodecRegistry`]), the transfer-filter pipe ([`XferPipe`]) and the
//! pluggable wire protocols ([`Proto`]).

#![forbid(unsafe_code)]

mod config;
mod context;
mod error;
mod peer;
mod plugin;
mod router;
mod session;
mod tls;
mod util;

pub use config::{Network, PeerConfig};
pub use context::HandlerCtx;
pub use error::{CallError, CloseErrors, ConfigError};
pub use peer::Peer;
pub use plugin::{Plugin, PluginContainer};
pub use router::{normalize_service_method, Handler, Router, SubRouter};
pub use session::{Session, SessionStatus};
pub use tls::TlsHandshaker;

// The wire plane, re-exported.
#[doc(hidden)]
pub use biplex_core;
pub use biplex_core::{
    check_message_size, codec, default_proto_factory, json_proto_factory, message_size_limit,
    raw_proto_factory, set_message_size_limit, with_add_meta, with_body, with_body_codec,
    with_deadline, with_mtype, with_service_method, with_set_meta, with_xfer_pipe, xfer, Body,
    BoxFuture, Codec, CodecRegistry, ConnStream, JsonProto, Message, MessageSetting, Meta, Proto,
    ProtoFactory, RawProto, Rerror, Socket, XferFilter, XferPipe, XferRegistry, TYPE_CALL,
    TYPE_PUSH, TYPE_REPLY,
};

/// The usual imports.
pub mod prelude {
    pub use crate::{
        Body, CallError, HandlerCtx, Message, Meta, Network, Peer, PeerConfig, Plugin, Rerror,
        Session, SessionStatus,
    };
}
