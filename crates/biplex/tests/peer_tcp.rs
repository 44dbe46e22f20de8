//! Peer lifecycle over real TCP: listen, dial, redial, close.

use std::sync::Arc;
use std::time::Duration;

use biplex::prelude::*;
use biplex::{with_deadline, CallError};
use parking_lot::Mutex;
use serde_json::json;
use std::time::Instant;
use tokio::sync::oneshot;

/// Captures the listener's bound address so tests can bind port 0.
struct CaptureAddr {
    tx: Mutex<Option<oneshot::Sender<String>>>,
}

impl CaptureAddr {
    fn new() -> (Arc<Self>, oneshot::Receiver<String>) {
        let (tx, rx) = oneshot::channel();
        (
            Arc::new(Self {
                tx: Mutex::new(Some(tx)),
            }),
            rx,
        )
    }
}

impl Plugin for CaptureAddr {
    fn name(&self) -> &'static str {
        "capture-addr"
    }

    fn post_listen(&self, addr: &str) {
        if let Some(tx) = self.tx.lock().take() {
            let _ = tx.send(addr.to_owned());
        }
    }
}

fn server_config() -> PeerConfig {
    PeerConfig {
        listen_addr: "127.0.0.1".into(),
        listen_port: 0,
        ..PeerConfig::default()
    }
}

async fn start_server(cfg: PeerConfig) -> (Peer, String) {
    let (plugin, addr_rx) = CaptureAddr::new();
    let server = Peer::with_plugins(cfg, vec![plugin]).unwrap();
    {
        let server = server.clone();
        tokio::spawn(async move {
            let _ = server.listen_and_serve().await;
        });
    }
    let addr = tokio::time::timeout(Duration::from_secs(2), addr_rx)
        .await
        .expect("listener must come up")
        .unwrap();
    (server, addr)
}

#[tokio::test]
async fn listen_dial_call_close() {
    let mut cfg = server_config();
    cfg.count_time = true;
    let (server, addr) = start_server(cfg).await;
    server.route_call("math.double", |ctx| async move {
        let n: i64 = ctx.parse_arg()?;
        Ok(Body::Value(json!(n * 2)))
    });

    let client = Peer::new(PeerConfig::default()).unwrap();
    let sess = client.dial(&addr).await.unwrap();
    assert_eq!(client.count_session(), 1);
    assert!(client.get_session(&sess.id()).is_some());

    let doubled: i64 = sess.call_typed("math.double", &21, vec![]).await.unwrap();
    assert_eq!(doubled, 42);
    assert_eq!(server.count_session(), 1);

    client.close().await.unwrap();
    assert_eq!(client.count_session(), 0);
    assert_eq!(sess.status(), SessionStatus::Closed);
    server.close().await.unwrap();
}

#[tokio::test]
async fn dial_failure_exhausts_redial_budget() {
    let cfg = PeerConfig {
        redial_times: 2,
        redial_interval: Duration::from_millis(10),
        ..PeerConfig::default()
    };
    let client = Peer::new(cfg).unwrap();

    let started = Instant::now();
    // Port 1 on localhost refuses connections.
    let err = client.dial("127.0.0.1:1").await.unwrap_err();
    assert!(matches!(err, CallError::DialFailed { .. }));
    // Initial attempt plus two redials with sleeps between them.
    assert!(started.elapsed() >= Duration::from_millis(20));
}

#[tokio::test]
async fn redial_recovers_the_session() {
    let (server, addr) = start_server(server_config()).await;
    server.route_call("ping", |_ctx| async move { Ok(Body::Value(json!("pong"))) });

    let client = Peer::new(PeerConfig {
        redial_times: 5,
        redial_interval: Duration::from_millis(30),
        ..PeerConfig::default()
    })
    .unwrap();
    let sess = client.dial(&addr).await.unwrap();
    let pong: String = sess.call_typed("ping", &json!(null), vec![]).await.unwrap();
    assert_eq!(pong, "pong");

    // Kill the server side of the connection; the client's reader hits EOF
    // and redials (the listener is still up).
    server.range_session(|s| {
        let s = s.clone();
        tokio::spawn(async move {
            let _ = s.close().await;
        });
        true
    });

    // After the redial interval the same session object works again.
    let mut recovered = false;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        if !sess.is_ok() {
            continue;
        }
        if let Ok(pong) = sess
            .call_typed::<_, String>("ping", &json!(null), vec![])
            .await
        {
            assert_eq!(pong, "pong");
            recovered = true;
            break;
        }
    }
    assert!(recovered, "session must recover through redial");
    server.close().await.unwrap();
}

#[tokio::test]
async fn pending_call_never_hangs_across_disconnect() {
    let (server, addr) = start_server(server_config()).await;
    server.route_call("sleepy", |_ctx| async move {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(Body::None)
    });

    let client = Peer::new(PeerConfig {
        redial_times: 3,
        redial_interval: Duration::from_millis(30),
        ..PeerConfig::default()
    })
    .unwrap();
    let sess = client.dial(&addr).await.unwrap();

    // A call that cannot complete before the connection drops; its deadline
    // guarantees it resolves rather than hanging forever.
    let pending = {
        let sess = sess.clone();
        tokio::spawn(async move {
            sess.call(
                "sleepy",
                Body::None,
                vec![with_deadline(Instant::now() + Duration::from_millis(700))],
            )
            .await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    server.range_session(|s| {
        let s = s.clone();
        tokio::spawn(async move {
            let _ = s.close().await;
        });
        true
    });

    let outcome = tokio::time::timeout(Duration::from_secs(3), pending)
        .await
        .expect("pending call must resolve")
        .unwrap();
    assert!(
        matches!(outcome, Err(CallError::Timeout) | Err(CallError::ConnectionClosed { .. })),
        "got {outcome:?}"
    );

    server.close().await.unwrap();
}

#[tokio::test]
async fn session_age_closes_accepted_sessions() {
    let mut cfg = server_config();
    cfg.default_session_age = Duration::from_millis(150);
    let (server, addr) = start_server(cfg).await;

    let client = Peer::new(PeerConfig::default()).unwrap();
    let sess = client.dial(&addr).await.unwrap();
    assert!(sess.is_ok());

    // The server force-closes the accepted session after its max age; the
    // client sees the connection drop.
    tokio::time::timeout(Duration::from_secs(3), async {
        while server.count_session() > 0 {
            tokio::time::sleep(Duration::from_millis(30)).await;
        }
    })
    .await
    .expect("aged session must be closed");

    server.close().await.unwrap();
}
