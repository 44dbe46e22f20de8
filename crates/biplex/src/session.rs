//! The session: one transport connection bound to the message plane.
//!
//! A session multiplexes any number of concurrent outbound CALLs and inbound
//! handler dispatches over one socket. Exactly one reader task runs per
//! socket lifetime; replies are written by handler tasks, never by the
//! reader, so a slow outbound path cannot stall inbound traffic.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use biplex_core::{
    Body, BoxFuture, ConnStream, Message, MessageSetting, ProtoError, ProtoFactory, Rerror,
    Socket, NIL_CODEC_ID, TYPE_CALL, TYPE_PUSH, TYPE_REPLY,
};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::context::HandlerCtx;
use crate::error::CallError;
use crate::peer::SessionHub;
use crate::plugin::PluginContainer;
use crate::router::{HandlerBody, Router};
use crate::util::WaitGroup;

const STATUS_PREPARING: u8 = 0;
const STATUS_OK: u8 = 1;
const STATUS_ACTIVE_CLOSING: u8 = 2;
const STATUS_PASSIVE_CLOSING: u8 = 3;
const STATUS_CLOSED: u8 = 4;

/// Where a session is in its life. Transitions are monotonic toward
/// `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Preparing,
    Ok,
    ActiveClosing,
    PassiveClosing,
    Closed,
}

impl SessionStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            STATUS_PREPARING => Self::Preparing,
            STATUS_OK => Self::Ok,
            STATUS_ACTIVE_CLOSING => Self::ActiveClosing,
            STATUS_PASSIVE_CLOSING => Self::PassiveClosing,
            _ => Self::Closed,
        }
    }
}

/// The slice of peer configuration a session consults on the hot path.
#[derive(Debug, Clone)]
pub(crate) struct SessionConfig {
    pub default_context_age: Duration,
    pub slow_comet_duration: Duration,
    pub default_body_codec: u8,
    pub print_detail: bool,
    pub count_time: bool,
}

/// Produces a fresh connection for redial: `(stream, local, remote)`.
pub(crate) type DialFn =
    Arc<dyn Fn() -> BoxFuture<'static, std::io::Result<DialedConn>> + Send + Sync>;

pub(crate) struct DialedConn {
    pub conn: Box<dyn ConnStream>,
    pub local_addr: String,
    pub remote_addr: String,
}

#[derive(Clone)]
pub(crate) struct Redial {
    pub dial: DialFn,
    pub interval: Duration,
    /// 0 never redials, negative redials forever.
    pub times: i32,
}

struct PendingCall {
    tx: oneshot::Sender<Result<Message, CallError>>,
    start: Option<Instant>,
}

/// Removes the pending entry unless the call completed normally.
struct PendingGuard<'a> {
    sess: &'a Session,
    seq: i32,
    active: bool,
}

impl PendingGuard<'_> {
    fn disarm(&mut self) {
        self.active = false;
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.active {
            self.sess.pending.lock().calls.remove(&self.seq);
        }
    }
}

/// Sequence allocator and pending-CALL table, guarded together so an
/// allocation can detect a wrapped-counter collision atomically.
#[derive(Default)]
struct PendingTable {
    next_seq: i32,
    calls: HashMap<i32, PendingCall>,
}

impl PendingTable {
    fn bump_seq(&mut self) -> i32 {
        let seq = self.next_seq;
        self.next_seq = if seq == i32::MAX { i32::MIN } else { seq + 1 };
        seq
    }
}

/// The stateful binding of one transport connection to one peer.
pub struct Session {
    socket: Socket,
    proto_factory: ProtoFactory,
    router: Router,
    plugins: PluginContainer,
    cfg: SessionConfig,
    status: AtomicU8,
    pending: Mutex<PendingTable>,
    grace: WaitGroup,
    redial: Mutex<Option<Redial>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    hub: Mutex<Option<SessionHub>>,
}

impl Session {
    pub(crate) fn new(
        conn: Box<dyn ConnStream>,
        local_addr: String,
        remote_addr: String,
        proto_factory: ProtoFactory,
        router: Router,
        plugins: PluginContainer,
        cfg: SessionConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            socket: Socket::new(conn, &proto_factory, local_addr, remote_addr),
            proto_factory,
            router,
            plugins,
            cfg,
            status: AtomicU8::new(STATUS_PREPARING),
            pending: Mutex::new(PendingTable::default()),
            grace: WaitGroup::default(),
            redial: Mutex::new(None),
            reader: Mutex::new(None),
            hub: Mutex::new(None),
        })
    }

    pub(crate) fn set_redial(&self, redial: Redial) {
        *self.redial.lock() = Some(redial);
    }

    pub(crate) fn set_hub(&self, hub: SessionHub) {
        *self.hub.lock() = Some(hub);
    }

    pub(crate) fn activate(&self) {
        self.advance_status(STATUS_OK);
    }

    /// Per-session identifier. Accepted sessions keep the remote address;
    /// the client role reassigns its local address after dial, and again
    /// after redial while the id still equals the old local address.
    pub fn id(&self) -> String {
        self.socket.id()
    }

    pub fn set_id(&self, id: String) {
        let old = self.id();
        self.socket.set_id(id.clone());
        if let Some(hub) = self.hub.lock().clone() {
            hub.rekey(&old, &id);
        }
    }

    pub fn local_addr(&self) -> String {
        self.socket.local_addr()
    }

    pub fn remote_addr(&self) -> String {
        self.socket.remote_addr()
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Usable for new CALLs and PUSHes.
    pub fn is_ok(&self) -> bool {
        self.status() == SessionStatus::Ok
    }

    /// Status only ever moves forward.
    fn advance_status(&self, to: u8) -> bool {
        let mut current = self.status.load(Ordering::Acquire);
        loop {
            if current >= to {
                return false;
            }
            match self.status.compare_exchange_weak(
                current,
                to,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(now) => current = now,
            }
        }
    }

    /// Invoke `service_method` on the remote peer and await its REPLY.
    ///
    /// The deadline is taken from a `with_deadline` setting if present,
    /// otherwise from the peer's default context age.
    pub async fn call(
        &self,
        service_method: &str,
        body: Body,
        settings: Vec<MessageSetting>,
    ) -> Result<Message, CallError> {
        if !self.is_ok() {
            return Err(CallError::connection_closed("session is closing or closed"));
        }

        let start = self.cfg.count_time.then(Instant::now);
        let (seq, rx) = {
            let mut table = self.pending.lock();
            let seq = table.bump_seq();
            if table.calls.contains_key(&seq) {
                return Err(CallError::DuplicateSeq(seq));
            }
            let (tx, rx) = oneshot::channel();
            table.calls.insert(seq, PendingCall { tx, start });
            (seq, rx)
        };
        // A cancelled or failed call must not leave its entry behind.
        let mut guard = PendingGuard {
            sess: self,
            seq,
            active: true,
        };

        let mut msg = Message::new();
        msg.set_seq(seq);
        msg.set_mtype(TYPE_CALL);
        msg.set_service_method(service_method);
        msg.set_body(body);
        msg.apply(&settings);
        self.fill_body_codec(&mut msg);
        let deadline = msg.deadline().or_else(|| self.default_deadline());

        self.write_message(&mut msg).await?;

        let received = match deadline {
            Some(deadline) => {
                match tokio::time::timeout_at(deadline.into(), rx).await {
                    Ok(received) => received,
                    Err(_) => return Err(CallError::Timeout),
                }
            }
            None => rx.await,
        };
        guard.disarm();

        let reply = match received {
            Ok(result) => result?,
            // The session dropped the pending table.
            Err(_) => return Err(CallError::connection_closed("session torn down")),
        };
        if let Some(rerr) = Rerror::from_meta(reply.meta()) {
            return Err(CallError::Remote(rerr));
        }
        Ok(reply)
    }

    /// Typed wrapper over [`Session::call`].
    pub async fn call_typed<A, R>(
        &self,
        service_method: &str,
        arg: &A,
        settings: Vec<MessageSetting>,
    ) -> Result<R, CallError>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let value = serde_json::to_value(arg).map_err(|e| CallError::WriteFailed {
            cause: e.to_string(),
        })?;
        let reply = self
            .call(service_method, Body::Value(value), settings)
            .await?;
        let value = match reply.body() {
            Body::Value(v) => v.clone(),
            Body::None => serde_json::Value::Null,
            Body::Bytes(_) => {
                return Err(CallError::Remote(Rerror::bad_message(
                    "reply carries a raw byte body",
                )))
            }
        };
        serde_json::from_value(value)
            .map_err(|e| CallError::Remote(Rerror::bad_message(e.to_string())))
    }

    /// Send a one-way PUSH. No REPLY is ever expected or emitted for it.
    pub async fn push(
        &self,
        service_method: &str,
        body: Body,
        settings: Vec<MessageSetting>,
    ) -> Result<(), CallError> {
        if !self.is_ok() {
            return Err(CallError::connection_closed("session is closing or closed"));
        }
        let seq = self.pending.lock().bump_seq();
        let mut msg = Message::new();
        msg.set_seq(seq);
        msg.set_mtype(TYPE_PUSH);
        msg.set_service_method(service_method);
        msg.set_body(body);
        msg.apply(&settings);
        self.fill_body_codec(&mut msg);
        self.write_message(&mut msg).await.map(|_| ())
    }

    /// Typed wrapper over [`Session::push`].
    pub async fn push_typed<A: Serialize>(
        &self,
        service_method: &str,
        arg: &A,
        settings: Vec<MessageSetting>,
    ) -> Result<(), CallError> {
        let value = serde_json::to_value(arg).map_err(|e| CallError::WriteFailed {
            cause: e.to_string(),
        })?;
        self.push(service_method, Body::Value(value), settings).await
    }

    fn fill_body_codec(&self, msg: &mut Message) {
        if msg.body_codec() == NIL_CODEC_ID && matches!(msg.body(), Body::Value(_)) {
            msg.set_body_codec(self.cfg.default_body_codec);
        }
    }

    fn default_deadline(&self) -> Option<Instant> {
        (self.cfg.default_context_age > Duration::ZERO)
            .then(|| Instant::now() + self.cfg.default_context_age)
    }

    async fn write_message(&self, msg: &mut Message) -> Result<usize, CallError> {
        if self.cfg.print_detail {
            info!(session_id = %self.id(), "write message: {msg}");
        }
        self.socket.write(msg).await.map_err(|e| match e {
            ProtoError::Closed => CallError::connection_closed(e),
            other => CallError::WriteFailed {
                cause: other.to_string(),
            },
        })
    }

    /// Spawn the single reader task. Called once per socket lifetime; redial
    /// restarts the loop on the same task.
    pub(crate) fn start_read_loop(self: Arc<Self>) {
        let sess = self.clone();
        let handle = tokio::spawn(async move {
            sess.read_loop().await;
        });
        *self.reader.lock() = Some(handle);
    }

    async fn read_loop(self: Arc<Self>) {
        loop {
            let mut msg = Message::new();
            match self.socket.read(&mut msg).await {
                Ok(_) => {
                    if self.cfg.print_detail {
                        info!(session_id = %self.id(), "read message: {msg}");
                    }
                    match msg.mtype() {
                        TYPE_REPLY => self.deliver_reply(msg),
                        TYPE_CALL | TYPE_PUSH => self.clone().dispatch(msg),
                        other => {
                            warn!(mtype = other, seq = msg.seq(), "dropping message of unknown type")
                        }
                    }
                }
                Err(e) if !e.is_stream_fatal() => {
                    // The frame was consumed; only this message is lost.
                    warn!(session_id = %self.id(), error = %e, "dropping undecodable message");
                }
                Err(e) => {
                    match self.status() {
                        SessionStatus::ActiveClosing | SessionStatus::Closed => return,
                        _ => {}
                    }
                    debug!(session_id = %self.id(), error = %e, "read side failed");
                    if self.clone().try_redial().await {
                        continue;
                    }
                    self.passive_close().await;
                    return;
                }
            }
        }
    }

    /// Correlate a REPLY with its pending CALL by seq.
    fn deliver_reply(&self, msg: Message) {
        let entry = self.pending.lock().calls.remove(&msg.seq());
        match entry {
            Some(pending) => {
                if let Some(start) = pending.start {
                    let cost = start.elapsed();
                    if self.cfg.slow_comet_duration > Duration::ZERO
                        && cost > self.cfg.slow_comet_duration
                    {
                        warn!(
                            service_method = msg.service_method(),
                            seq = msg.seq(),
                            cost_ms = cost.as_millis() as u64,
                            "slow call"
                        );
                    } else {
                        debug!(
                            service_method = msg.service_method(),
                            seq = msg.seq(),
                            cost_ms = cost.as_millis() as u64,
                            "call completed"
                        );
                    }
                }
                let _ = pending.tx.send(Ok(msg));
            }
            None => {
                debug!(
                    seq = msg.seq(),
                    service_method = msg.service_method(),
                    "dropping REPLY with no pending call"
                );
            }
        }
    }

    /// Run the handler for an inbound CALL or PUSH in its own task.
    fn dispatch(self: Arc<Self>, msg: Message) {
        let is_call = msg.mtype() == TYPE_CALL;
        let handler = if is_call {
            self.router.get_call(msg.service_method())
        } else {
            self.router.get_push(msg.service_method())
        };

        let Some(handler) = handler else {
            if is_call {
                self.reply_not_found(msg);
            } else {
                warn!(
                    service_method = msg.service_method(),
                    "no handler for PUSH; dropping"
                );
            }
            return;
        };

        let deadline = self.default_deadline();
        let start = self.cfg.count_time.then(Instant::now);
        let ctx = HandlerCtx::new(
            self.clone(),
            msg,
            handler,
            deadline,
            start,
            self.grace.guard(),
        );
        let sess = self.clone();
        tokio::spawn(async move {
            sess.handle(ctx).await;
        });
    }

    /// A CALL for an unregistered method with no fallback still gets a
    /// REPLY, carrying the not-found error.
    fn reply_not_found(self: Arc<Self>, msg: Message) {
        warn!(
            service_method = msg.service_method(),
            "no handler for CALL"
        );
        let sess = self.clone();
        let guard = self.grace.guard();
        tokio::spawn(async move {
            let _guard = guard;
            let mut reply = reply_for(&msg);
            Rerror::not_found(msg.service_method()).write_to_meta(reply.meta_mut());
            if let Err(e) = sess.write_message(&mut reply).await {
                warn!(seq = reply.seq(), error = %e, "failed to write not-found REPLY");
            }
        });
    }

    async fn handle(self: Arc<Self>, ctx: Arc<HandlerCtx>) {
        let is_call = ctx.mtype() == TYPE_CALL;
        let result = self.run_handler(&ctx).await;

        if is_call {
            let mut reply = reply_for(ctx.input());
            *reply.meta_mut() = ctx.take_reply_meta();
            match result {
                Ok(body) => {
                    reply.set_body(body);
                    if matches!(reply.body(), Body::Value(_))
                        && ctx.input().body_codec() != NIL_CODEC_ID
                    {
                        reply.set_body_codec(ctx.input().body_codec());
                    }
                    self.fill_body_codec(&mut reply);
                }
                Err(rerr) => rerr.write_to_meta(reply.meta_mut()),
            }
            if let Err(e) = self.write_message(&mut reply).await {
                warn!(seq = reply.seq(), error = %e, "failed to write REPLY");
            }
        } else if let Err(rerr) = result {
            // PUSH errors are logged on this side only; never replied.
            error!(
                service_method = ctx.service_method(),
                error = %rerr,
                "PUSH handler failed"
            );
        }

        self.plugins.post_handle(&ctx);
        for p in &ctx.handler().plugins {
            p.post_handle(&ctx);
        }
        if let Some(start) = ctx.start_time() {
            let cost = start.elapsed();
            if self.cfg.slow_comet_duration > Duration::ZERO
                && cost > self.cfg.slow_comet_duration
            {
                warn!(
                    service_method = ctx.service_method(),
                    cost_ms = cost.as_millis() as u64,
                    "slow handler"
                );
            }
        }
    }

    /// Plugins, the handler itself, deadline enforcement, panic trapping.
    async fn run_handler(&self, ctx: &Arc<HandlerCtx>) -> Result<Body, Rerror> {
        self.plugins.pre_handle(ctx)?;
        for p in &ctx.handler().plugins {
            p.pre_handle(ctx)?;
        }

        let fut: BoxFuture<'static, Result<Body, Rerror>> = match &ctx.handler().body {
            HandlerBody::Call(f) => f(ctx.clone()),
            HandlerBody::Push(f) => {
                let fut = f(ctx.clone());
                Box::pin(async move { fut.await.map(|()| Body::None) })
            }
        };
        // A panicking handler must not take the session down; it becomes an
        // internal-error reply instead.
        let fut = AssertUnwindSafe(fut).catch_unwind();

        let outcome = match ctx.deadline() {
            Some(deadline) => match tokio::time::timeout_at(deadline.into(), fut).await {
                Ok(outcome) => outcome,
                Err(_) => return Err(Rerror::handle_timeout()),
            },
            None => fut.await,
        };

        match outcome {
            Ok(result) => result,
            Err(panic) => {
                let message = panic_message(panic);
                error!(
                    service_method = ctx.service_method(),
                    panic = %message,
                    "handler panicked"
                );
                Err(Rerror::internal(message))
            }
        }
    }

    /// Client-side redial after a read failure. Pending calls survive; new
    /// connection and protocol are swapped in via socket reset.
    async fn try_redial(self: Arc<Self>) -> bool {
        let Some(redial) = self.redial.lock().clone() else {
            return false;
        };
        if self.status() != SessionStatus::Ok {
            return false;
        }

        let old_id = self.id();
        let old_local = self.socket.local_addr();
        let mut remaining = redial.times;
        let mut last_error = String::new();
        loop {
            if remaining == 0 {
                break;
            }
            if remaining > 0 {
                remaining -= 1;
            }
            tokio::time::sleep(redial.interval).await;
            debug!(session_id = %old_id, "trying to redial...");
            match (redial.dial)().await {
                Ok(dialed) => {
                    self.socket
                        .reset(
                            dialed.conn,
                            &self.proto_factory,
                            dialed.local_addr.clone(),
                            dialed.remote_addr,
                        )
                        .await;
                    if old_id == old_local {
                        self.set_id(dialed.local_addr);
                    }
                    if self.plugins.post_dial(&self).is_err() {
                        let _ = self.close().await;
                        return false;
                    }
                    info!(session_id = %self.id(), "redial ok");
                    return true;
                }
                Err(e) => {
                    last_error = e.to_string();
                }
            }
        }
        error!(session_id = %old_id, error = %last_error, "redial failed");
        false
    }

    /// Actively close: block new calls, let in-flight handlers finish, stop
    /// the reader, drop the connection, fail the pending table.
    pub async fn close(&self) -> std::io::Result<()> {
        if !self.advance_status(STATUS_ACTIVE_CLOSING) {
            return Ok(());
        }
        self.grace.wait().await;
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        let result = self.socket.shutdown().await;
        self.drain_pending("session closed");
        self.advance_status(STATUS_CLOSED);
        self.remove_from_hub();
        result
    }

    /// Teardown driven by the reader after an unrecoverable read error.
    async fn passive_close(&self) {
        if !self.advance_status(STATUS_PASSIVE_CLOSING) {
            return;
        }
        info!(session_id = %self.id(), "session disconnected");
        self.drain_pending("connection lost");
        self.grace.wait().await;
        let _ = self.socket.shutdown().await;
        self.advance_status(STATUS_CLOSED);
        self.remove_from_hub();
    }

    fn drain_pending(&self, cause: &str) {
        let calls = std::mem::take(&mut self.pending.lock().calls);
        for (_, pending) in calls {
            let _ = pending.tx.send(Err(CallError::connection_closed(cause)));
        }
    }

    fn remove_from_hub(&self) {
        if let Some(hub) = self.hub.lock().take() {
            hub.remove(&self.id());
        }
    }

    #[cfg(test)]
    pub(crate) fn pending_len(&self) -> usize {
        self.pending.lock().calls.len()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id())
            .field("status", &self.status())
            .field("remote_addr", &self.remote_addr())
            .finish_non_exhaustive()
    }
}

/// A REPLY skeleton echoing the request's seq, method and pipe.
fn reply_for(request: &Message) -> Message {
    let mut reply = Message::new();
    reply.set_seq(request.seq());
    reply.set_mtype(TYPE_REPLY);
    reply.set_service_method(request.service_method());
    *reply.xfer_pipe_mut() = request.xfer_pipe().clone();
    reply
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seq_allocation_wraps_to_min() {
        let mut table = PendingTable {
            next_seq: i32::MAX,
            calls: HashMap::new(),
        };
        assert_eq!(table.bump_seq(), i32::MAX);
        assert_eq!(table.bump_seq(), i32::MIN);
        assert_eq!(table.bump_seq(), i32::MIN + 1);
    }

    #[test]
    fn wrapped_seq_collision_is_detected() {
        let mut table = PendingTable::default();
        let seq = table.bump_seq();
        let (tx, _rx) = oneshot::channel();
        table.calls.insert(seq, PendingCall { tx, start: None });

        // A full wrap lands on the same number while it is still pending.
        table.next_seq = seq;
        let reallocated = table.bump_seq();
        assert_eq!(reallocated, seq);
        assert!(table.calls.contains_key(&reallocated));
    }

    fn lone_session() -> Arc<Session> {
        // One end of a duplex with nobody reading; calls are written but
        // never answered. The reader loop is deliberately not started.
        let (conn, other) = tokio::io::duplex(64 * 1024);
        std::mem::forget(other);
        let sess = Session::new(
            Box::new(conn),
            "mem:test".into(),
            "mem:void".into(),
            biplex_core::default_proto_factory(),
            Router::new(),
            PluginContainer::default(),
            SessionConfig {
                default_context_age: Duration::ZERO,
                slow_comet_duration: Duration::ZERO,
                default_body_codec: biplex_core::codec::JSON_CODEC_ID,
                print_detail: false,
                count_time: false,
            },
        );
        sess.activate();
        sess
    }

    #[tokio::test]
    async fn cancelled_call_cleans_its_pending_entry() {
        let sess = lone_session();

        let task = {
            let sess = sess.clone();
            tokio::spawn(async move {
                let _ = sess.call("never.answered", Body::None, vec![]).await;
            })
        };

        let deadline = Instant::now() + Duration::from_secs(1);
        while sess.pending_len() == 0 {
            assert!(Instant::now() < deadline, "call never registered");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        task.abort();
        let _ = task.await;
        assert_eq!(sess.pending_len(), 0);
    }

    #[tokio::test]
    async fn call_deadline_yields_timeout_and_cleans_up() {
        let sess = lone_session();
        let err = sess
            .call(
                "never.answered",
                Body::None,
                vec![biplex_core::with_deadline(
                    Instant::now() + Duration::from_millis(50),
                )],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::Timeout));
        assert_eq!(sess.pending_len(), 0);
    }
}
