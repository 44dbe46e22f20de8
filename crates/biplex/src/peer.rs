//! The peer: owner of sessions, listeners, router and plugins.
//!
//! A peer is both server and client. `dial` opens an outbound session with
//! redial wired up; `listen_and_serve` accepts inbound sessions;
//! `serve_conn` admits an already-established connection without redial.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use biplex_core::{codec, default_proto_factory, Body, ConnStream, ProtoFactory, Rerror};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio::sync::Notify;
use tracing::{debug, error, info, trace, warn};

use crate::config::{Network, PeerConfig};
use crate::context::HandlerCtx;
use crate::error::{CallError, CloseErrors, ConfigError};
use crate::plugin::{Plugin, PluginContainer};
use crate::router::{Router, SubRouter};
use crate::session::{DialFn, DialedConn, Redial, Session, SessionConfig};
use crate::tls::TlsHandshaker;

/// The live-session registry, keyed by session id.
#[derive(Clone, Default)]
pub(crate) struct SessionHub {
    inner: Arc<Mutex<HashMap<String, Arc<Session>>>>,
}

impl SessionHub {
    pub fn set(&self, sess: &Arc<Session>) {
        self.inner.lock().insert(sess.id(), sess.clone());
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.inner.lock().get(id).cloned()
    }

    pub fn remove(&self, id: &str) {
        self.inner.lock().remove(id);
    }

    /// Follow a session id reassignment (redial).
    pub fn rekey(&self, old: &str, new: &str) {
        let mut map = self.inner.lock();
        if let Some(sess) = map.remove(old) {
            map.insert(new.to_owned(), sess);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn snapshot(&self) -> Vec<Arc<Session>> {
        self.inner.lock().values().cloned().collect()
    }

    pub fn drain(&self) -> Vec<Arc<Session>> {
        self.inner.lock().drain().map(|(_, s)| s).collect()
    }
}

struct PeerInner {
    router: Router,
    plugins: PluginContainer,
    hub: SessionHub,
    cfg: PeerConfig,
    default_body_codec: u8,
    default_proto: ProtoFactory,
    tls: Mutex<Option<Arc<dyn TlsHandshaker>>>,
    closed: AtomicBool,
    close_notify: Notify,
}

/// A communication peer in either or both roles.
#[derive(Clone)]
pub struct Peer {
    inner: Arc<PeerInner>,
}

impl Peer {
    pub fn new(cfg: PeerConfig) -> Result<Self, ConfigError> {
        Self::with_plugins(cfg, Vec::new())
    }

    pub fn with_plugins(
        mut cfg: PeerConfig,
        plugins: Vec<Arc<dyn Plugin>>,
    ) -> Result<Self, ConfigError> {
        let plugins = PluginContainer::new(plugins);
        plugins.pre_new_peer(&mut cfg);
        let default_body_codec = cfg.check(codec::global())?;

        let peer = Self {
            inner: Arc::new(PeerInner {
                router: Router::new(),
                plugins,
                hub: SessionHub::default(),
                cfg,
                default_body_codec,
                default_proto: default_proto_factory(),
                tls: Mutex::new(None),
                closed: AtomicBool::new(false),
                close_notify: Notify::new(),
            }),
        };
        peer.inner.plugins.post_new_peer(&peer);
        Ok(peer)
    }

    pub fn config(&self) -> &PeerConfig {
        &self.inner.cfg
    }

    pub fn plugin_container(&self) -> &PluginContainer {
        &self.inner.plugins
    }

    /// Install the TLS collaborator; affects subsequent dials and accepts.
    pub fn set_tls_handshaker(&self, tls: Arc<dyn TlsHandshaker>) {
        *self.inner.tls.lock() = Some(tls);
    }

    // Router facade.

    pub fn router(&self) -> &Router {
        &self.inner.router
    }

    pub fn sub_route(&self, prefix: &str, plugins: Vec<Arc<dyn Plugin>>) -> SubRouter {
        self.inner.router.sub_route(prefix, plugins)
    }

    pub fn route_call<F, Fut>(&self, path: &str, f: F) -> String
    where
        F: Fn(Arc<HandlerCtx>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Body, Rerror>> + Send + 'static,
    {
        self.inner.router.route_call(path, f)
    }

    pub fn route_push<F, Fut>(&self, path: &str, f: F) -> String
    where
        F: Fn(Arc<HandlerCtx>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Rerror>> + Send + 'static,
    {
        self.inner.router.route_push(path, f)
    }

    pub fn set_unknown_call<F, Fut>(&self, f: F, plugins: Vec<Arc<dyn Plugin>>)
    where
        F: Fn(Arc<HandlerCtx>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Body, Rerror>> + Send + 'static,
    {
        self.inner.router.set_unknown_call(f, plugins);
    }

    pub fn set_unknown_push<F, Fut>(&self, f: F, plugins: Vec<Arc<dyn Plugin>>)
    where
        F: Fn(Arc<HandlerCtx>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Rerror>> + Send + 'static,
    {
        self.inner.router.set_unknown_push(f, plugins);
    }

    // Session hub facade.

    pub fn get_session(&self, session_id: &str) -> Option<Arc<Session>> {
        self.inner.hub.get(session_id)
    }

    pub fn count_session(&self) -> usize {
        self.inner.hub.len()
    }

    /// Visit every session; stop when `f` returns false.
    pub fn range_session(&self, mut f: impl FnMut(&Arc<Session>) -> bool) {
        for sess in self.inner.hub.snapshot() {
            if !f(&sess) {
                break;
            }
        }
    }

    /// Connect to `addr` and admit a client session with redial wired up.
    pub async fn dial(&self, addr: &str) -> Result<Arc<Session>, CallError> {
        self.dial_with(addr, self.inner.default_proto.clone()).await
    }

    pub async fn dial_with(
        &self,
        addr: &str,
        proto_factory: ProtoFactory,
    ) -> Result<Arc<Session>, CallError> {
        let cfg = &self.inner.cfg;
        cfg.network
            .check_supported()
            .map_err(|e| CallError::DialFailed {
                cause: e.to_string(),
            })?;

        let dial_fn = self.dial_fn(addr.to_owned());
        let mut result = (dial_fn)().await;
        if result.is_err() {
            // The first dial gets the same redial budget as reconnects.
            let mut remaining = cfg.redial_times;
            while remaining != 0 && result.is_err() {
                if remaining > 0 {
                    remaining -= 1;
                }
                tokio::time::sleep(cfg.redial_interval).await;
                debug!(network = %cfg.network, addr, "trying to redial...");
                result = (dial_fn)().await;
            }
        }
        let dialed = result.map_err(|e| CallError::DialFailed {
            cause: e.to_string(),
        })?;

        let sess = Session::new(
            dialed.conn,
            dialed.local_addr,
            dialed.remote_addr,
            proto_factory,
            self.inner.router.clone(),
            self.inner.plugins.clone(),
            self.session_config(),
        );
        if cfg.redial_times != 0 {
            sess.set_redial(Redial {
                dial: dial_fn,
                interval: cfg.redial_interval,
                times: cfg.redial_times,
            });
        }
        sess.set_id(sess.local_addr());
        if let Err(rerr) = self.inner.plugins.post_dial(&sess) {
            let _ = sess.close().await;
            return Err(CallError::DialFailed {
                cause: rerr.to_string(),
            });
        }
        self.admit(&sess);
        info!(network = %cfg.network, addr, id = %sess.id(), "dial ok");
        Ok(sess)
    }

    /// Admit an already-established connection as a session.
    ///
    /// No redial is wired up; the post-accept plugins run and may reject.
    pub async fn serve_conn(
        &self,
        conn: Box<dyn ConnStream>,
        local_addr: String,
        remote_addr: String,
    ) -> Result<Arc<Session>, Rerror> {
        self.serve_conn_with(conn, local_addr, remote_addr, self.inner.default_proto.clone())
            .await
    }

    pub async fn serve_conn_with(
        &self,
        conn: Box<dyn ConnStream>,
        local_addr: String,
        remote_addr: String,
        proto_factory: ProtoFactory,
    ) -> Result<Arc<Session>, Rerror> {
        let sess = Session::new(
            conn,
            local_addr,
            remote_addr,
            proto_factory,
            self.inner.router.clone(),
            self.inner.plugins.clone(),
            self.session_config(),
        );
        if let Err(rerr) = self.inner.plugins.post_accept(&sess) {
            let _ = sess.close().await;
            return Err(rerr);
        }
        self.admit(&sess);
        self.spawn_session_age_timer(&sess);
        info!(remote = %sess.remote_addr(), id = %sess.id(), "serve ok");
        Ok(sess)
    }

    fn admit(&self, sess: &Arc<Session>) {
        sess.set_hub(self.inner.hub.clone());
        self.inner.hub.set(sess);
        sess.activate();
        sess.clone().start_read_loop();
    }

    fn session_config(&self) -> SessionConfig {
        let cfg = &self.inner.cfg;
        SessionConfig {
            default_context_age: cfg.default_context_age,
            slow_comet_duration: cfg.slow_comet_duration,
            default_body_codec: self.inner.default_body_codec,
            print_detail: cfg.print_detail,
            count_time: cfg.count_time,
        }
    }

    fn spawn_session_age_timer(&self, sess: &Arc<Session>) {
        let age = self.inner.cfg.default_session_age;
        if age.is_zero() {
            return;
        }
        let weak = Arc::downgrade(sess);
        tokio::spawn(async move {
            tokio::time::sleep(age).await;
            if let Some(sess) = weak.upgrade() {
                warn!(id = %sess.id(), "session max age reached");
                let _ = sess.close().await;
            }
        });
    }

    fn dial_fn(&self, addr: String) -> DialFn {
        let network = self.inner.cfg.network;
        let dial_timeout = self.inner.cfg.default_dial_timeout;
        let tls = self.inner.tls.lock().clone();
        Arc::new(move || {
            let addr = addr.clone();
            let tls = tls.clone();
            Box::pin(async move { dial_conn(network, addr, dial_timeout, tls).await })
        })
    }

    /// Bind per the peer configuration and accept until closed.
    pub async fn listen_and_serve(&self) -> io::Result<()> {
        self.listen_and_serve_with(self.inner.default_proto.clone())
            .await
    }

    pub async fn listen_and_serve_with(&self, proto_factory: ProtoFactory) -> io::Result<()> {
        let cfg = &self.inner.cfg;
        cfg.network
            .check_supported()
            .map_err(|e| io::Error::new(io::ErrorKind::Unsupported, e.to_string()))?;
        match cfg.network {
            Network::Unix => {
                let listener = UnixListener::bind(cfg.listen_address())?;
                self.serve_unix_listener(listener, proto_factory).await
            }
            _ => {
                let listener = TcpListener::bind(cfg.listen_address()).await?;
                self.serve_tcp_listener(listener, proto_factory).await
            }
        }
    }

    async fn serve_tcp_listener(
        &self,
        listener: TcpListener,
        proto_factory: ProtoFactory,
    ) -> io::Result<()> {
        let local = listener.local_addr()?.to_string();
        info!(network = %self.inner.cfg.network, addr = %local, "listen and serve");
        self.inner.plugins.post_listen(&local);

        let mut delay = Duration::ZERO;
        loop {
            let mut shutdown = pin!(self.inner.close_notify.notified());
            shutdown.as_mut().enable();
            if self.inner.closed.load(Ordering::Acquire) {
                return Ok(());
            }
            let accepted = tokio::select! {
                _ = &mut shutdown => return Ok(()),
                r = listener.accept() => r,
            };
            match accepted {
                Ok((conn, peer_addr)) => {
                    delay = Duration::ZERO;
                    let peer = self.clone();
                    let local = local.clone();
                    let proto_factory = proto_factory.clone();
                    tokio::spawn(async move {
                        peer.handshake_and_serve(
                            Box::new(conn),
                            local,
                            peer_addr.to_string(),
                            proto_factory,
                        )
                        .await;
                    });
                }
                Err(e) if is_temporary_accept_error(&e) => {
                    delay = next_accept_delay(delay);
                    trace!(error = %e, delay_ms = delay.as_millis() as u64, "accept error; retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn serve_unix_listener(
        &self,
        listener: UnixListener,
        proto_factory: ProtoFactory,
    ) -> io::Result<()> {
        let local = self.inner.cfg.listen_address();
        info!(network = "unix", addr = %local, "listen and serve");
        self.inner.plugins.post_listen(&local);

        let mut delay = Duration::ZERO;
        loop {
            let mut shutdown = pin!(self.inner.close_notify.notified());
            shutdown.as_mut().enable();
            if self.inner.closed.load(Ordering::Acquire) {
                return Ok(());
            }
            let accepted = tokio::select! {
                _ = &mut shutdown => return Ok(()),
                r = listener.accept() => r,
            };
            match accepted {
                Ok((conn, peer_addr)) => {
                    delay = Duration::ZERO;
                    let peer = self.clone();
                    let local = local.clone();
                    let remote = unix_addr_string(&peer_addr);
                    let proto_factory = proto_factory.clone();
                    tokio::spawn(async move {
                        peer.handshake_and_serve(Box::new(conn), local, remote, proto_factory)
                            .await;
                    });
                }
                Err(e) if is_temporary_accept_error(&e) => {
                    delay = next_accept_delay(delay);
                    trace!(error = %e, delay_ms = delay.as_millis() as u64, "accept error; retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// The TLS handshake (if configured) completes before the session is
    /// registered; a failed handshake drops the connection without one.
    async fn handshake_and_serve(
        &self,
        conn: Box<dyn ConnStream>,
        local_addr: String,
        remote_addr: String,
        proto_factory: ProtoFactory,
    ) {
        let tls = self.inner.tls.lock().clone();
        let conn = match tls {
            Some(tls) => match tls.server_handshake(conn).await {
                Ok(conn) => conn,
                Err(e) => {
                    error!(remote = %remote_addr, error = %e, "TLS handshake failed");
                    return;
                }
            },
            None => conn,
        };
        if let Err(rerr) = self
            .serve_conn_with(conn, local_addr, remote_addr.clone(), proto_factory)
            .await
        {
            warn!(remote = %remote_addr, error = %rerr, "connection rejected");
        }
    }

    /// Signal shutdown, stop the listeners, close every session in parallel
    /// and merge their errors.
    pub async fn close(&self) -> Result<(), CloseErrors> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.inner.close_notify.notify_waiters();

        let sessions = self.inner.hub.drain();
        let closings = sessions.into_iter().map(|sess| async move {
            let id = sess.id();
            (id, sess.close().await)
        });
        let mut errors = CloseErrors::default();
        for (id, result) in futures::future::join_all(closings).await {
            if let Err(e) = result {
                errors.push(id, e);
            }
        }
        errors.into_result()
    }
}

async fn dial_conn(
    network: Network,
    addr: String,
    dial_timeout: Duration,
    tls: Option<Arc<dyn TlsHandshaker>>,
) -> io::Result<DialedConn> {
    let fut = async {
        match network {
            Network::Tcp | Network::Tcp4 | Network::Tcp6 => {
                let stream = connect_tcp(network, &addr).await?;
                let local_addr = stream.local_addr()?.to_string();
                let remote_addr = stream.peer_addr()?.to_string();
                let conn: Box<dyn ConnStream> = Box::new(stream);
                let conn = match &tls {
                    Some(tls) => tls.client_handshake(conn, &addr).await?,
                    None => conn,
                };
                Ok(DialedConn {
                    conn,
                    local_addr,
                    remote_addr,
                })
            }
            Network::Unix => {
                let stream = UnixStream::connect(&addr).await?;
                let local_addr = stream
                    .local_addr()
                    .map(|a| unix_addr_string(&a))
                    .unwrap_or_else(|_| "unix:unnamed".to_owned());
                let conn: Box<dyn ConnStream> = Box::new(stream);
                let conn = match &tls {
                    Some(tls) => tls.client_handshake(conn, &addr).await?,
                    None => conn,
                };
                Ok(DialedConn {
                    conn,
                    local_addr,
                    remote_addr: addr.clone(),
                })
            }
            Network::Unixpacket | Network::Quic => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("network {network} is not supported"),
            )),
        }
    };
    if dial_timeout.is_zero() {
        fut.await
    } else {
        tokio::time::timeout(dial_timeout, fut)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "dial timed out"))?
    }
}

async fn connect_tcp(network: Network, addr: &str) -> io::Result<TcpStream> {
    match network {
        Network::Tcp => TcpStream::connect(addr).await,
        Network::Tcp4 | Network::Tcp6 => {
            let want_v4 = network == Network::Tcp4;
            let mut last_error = None;
            for candidate in tokio::net::lookup_host(addr).await? {
                if candidate.is_ipv4() != want_v4 {
                    continue;
                }
                match TcpStream::connect(candidate).await {
                    Ok(stream) => return Ok(stream),
                    Err(e) => last_error = Some(e),
                }
            }
            Err(last_error.unwrap_or_else(|| {
                io::Error::new(
                    io::ErrorKind::AddrNotAvailable,
                    format!("no {network} address for {addr}"),
                )
            }))
        }
        _ => unreachable!("connect_tcp is only called for TCP networks"),
    }
}

fn unix_addr_string(addr: &tokio::net::unix::SocketAddr) -> String {
    addr.as_pathname()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "unix:unnamed".to_owned())
}

/// Accept backoff: 5 ms, doubling, capped at 1 s.
pub(crate) fn next_accept_delay(current: Duration) -> Duration {
    if current.is_zero() {
        Duration::from_millis(5)
    } else {
        (current * 2).min(Duration::from_secs(1))
    }
}

/// Transient accept failures worth retrying; anything else ends the loop.
pub(crate) fn is_temporary_accept_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_series_is_bounded() {
        // Over k consecutive failures the total delay is ≤ 5ms·(2^k − 1) and
        // no single delay exceeds 1s.
        let mut delay = Duration::ZERO;
        let mut total = Duration::ZERO;
        for k in 1..=20u32 {
            delay = next_accept_delay(delay);
            assert!(delay <= Duration::from_secs(1));
            total += delay;
            let bound = Duration::from_millis(5)
                .saturating_mul(2u32.saturating_pow(k).saturating_sub(1));
            assert!(total <= bound, "total {total:?} exceeds bound {bound:?} at k={k}");
        }
        assert_eq!(next_accept_delay(Duration::from_secs(1)), Duration::from_secs(1));
    }

    #[test]
    fn temporary_error_classification() {
        assert!(is_temporary_accept_error(&io::Error::new(
            io::ErrorKind::ConnectionAborted,
            "aborted"
        )));
        assert!(!is_temporary_accept_error(&io::Error::new(
            io::ErrorKind::AddrInUse,
            "in use"
        )));
    }

    #[test]
    fn hub_rekey_moves_the_session_entry() {
        let hub = SessionHub::default();
        // rekey of a missing id is a no-op
        hub.rekey("a", "b");
        assert_eq!(hub.len(), 0);
    }
}
