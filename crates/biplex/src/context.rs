//! Per-inbound-message working storage passed to handlers.

use std::sync::Arc;
use std::time::Instant;

use biplex_core::{Body, Message, Meta, Rerror, CODE_BAD_MESSAGE};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;

use crate::router::Handler;
use crate::session::Session;
use crate::util::WaitGroupGuard;

/// Wraps one inbound CALL or PUSH while its handler runs.
///
/// Holds a grace token of the originating session; the token is released
/// when the context drops, which is what lets close await in-flight
/// handlers.
pub struct HandlerCtx {
    sess: Arc<Session>,
    input: Message,
    handler: Arc<Handler>,
    reply_meta: Mutex<Meta>,
    deadline: Option<Instant>,
    start: Option<Instant>,
    _grace: WaitGroupGuard,
}

impl HandlerCtx {
    pub(crate) fn new(
        sess: Arc<Session>,
        input: Message,
        handler: Arc<Handler>,
        deadline: Option<Instant>,
        start: Option<Instant>,
        grace: WaitGroupGuard,
    ) -> Arc<Self> {
        Arc::new(Self {
            sess,
            input,
            handler,
            reply_meta: Mutex::new(Meta::new()),
            deadline,
            start,
            _grace: grace,
        })
    }

    /// The session this message arrived on. A CALL handler may push back to
    /// its caller through it while the call is still in flight.
    pub fn session(&self) -> &Arc<Session> {
        &self.sess
    }

    pub fn seq(&self) -> i32 {
        self.input.seq()
    }

    pub fn mtype(&self) -> u8 {
        self.input.mtype()
    }

    pub fn service_method(&self) -> &str {
        self.input.service_method()
    }

    /// Meta carried by the inbound message.
    pub fn meta(&self) -> &Meta {
        self.input.meta()
    }

    /// The decoded argument.
    pub fn arg(&self) -> &Body {
        self.input.body()
    }

    /// Deserialize the argument into a concrete type.
    pub fn parse_arg<T: DeserializeOwned>(&self) -> Result<T, Rerror> {
        let value = match self.input.body() {
            Body::Value(v) => v.clone(),
            Body::None => serde_json::Value::Null,
            Body::Bytes(_) => {
                return Err(Rerror::new(
                    CODE_BAD_MESSAGE,
                    "raw byte body cannot be parsed as a typed argument",
                ))
            }
        };
        serde_json::from_value(value).map_err(|e| Rerror::bad_message(e.to_string()))
    }

    /// The whole inbound message, for handlers that need the header.
    pub fn input(&self) -> &Message {
        &self.input
    }

    /// Append a meta pair onto the REPLY (CALL handlers only; PUSH replies
    /// are never sent).
    pub fn add_reply_meta(&self, key: &str, value: &str) {
        self.reply_meta.lock().add(key, value);
    }

    /// Set a meta pair on the REPLY, replacing previous values of the key.
    pub fn set_reply_meta(&self, key: &str, value: &str) {
        self.reply_meta.lock().set(key, value);
    }

    pub(crate) fn take_reply_meta(&self) -> Meta {
        std::mem::take(&mut self.reply_meta.lock())
    }

    /// Deadline inherited from the peer's default context age, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub(crate) fn handler(&self) -> &Arc<Handler> {
        &self.handler
    }

    /// When timing is enabled, the instant this context was created.
    pub fn start_time(&self) -> Option<Instant> {
        self.start
    }
}
