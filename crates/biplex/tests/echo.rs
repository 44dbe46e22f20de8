//! End-to-end CALL/REPLY/PUSH behavior over in-memory connections.

use std::sync::Arc;
use std::time::Duration;

use biplex::prelude::*;
use biplex::{with_add_meta, with_xfer_pipe, CallError};
use serde_json::json;
use tokio::sync::Mutex;

/// Connect two peers over an in-memory duplex; both ends get a session.
async fn link(server: &Peer, client: &Peer) -> (Arc<Session>, Arc<Session>) {
    let (a, b) = tokio::io::duplex(256 * 1024);
    let srv_sess = server
        .serve_conn(Box::new(a), "mem:server".into(), "mem:client".into())
        .await
        .unwrap();
    let cli_sess = client
        .serve_conn(Box::new(b), "mem:client".into(), "mem:server".into())
        .await
        .unwrap();
    (srv_sess, cli_sess)
}

fn new_peer() -> Peer {
    Peer::new(PeerConfig::default()).unwrap()
}

#[tokio::test]
async fn call_echo_with_meta_and_gzip() {
    let server = new_peer();
    server.route_call("Home.Test", |ctx| async move {
        assert_eq!(ctx.meta().get("peer_id"), Some("110"));
        let arg: serde_json::Value = ctx.parse_arg()?;
        Ok(Body::Value(json!({ "arg": arg })))
    });
    let client = new_peer();
    let (_srv, sess) = link(&server, &client).await;

    let reply = sess
        .call(
            "Home.Test",
            Body::Value(json!({"author": "henrylee2cn"})),
            vec![with_add_meta("peer_id", "110"), with_xfer_pipe(&[0x67])],
        )
        .await
        .unwrap();
    assert_eq!(
        reply.body().as_value(),
        Some(&json!({"arg": {"author": "henrylee2cn"}}))
    );
}

#[tokio::test]
async fn server_pushes_during_call() {
    let server = new_peer();
    server.route_call("Home.Test", |ctx| async move {
        let arg: serde_json::Value = ctx.parse_arg()?;
        let peer_id = ctx.meta().get("peer_id").unwrap_or_default().to_owned();
        ctx.session()
            .push_typed("Push.Test", &json!({"your_id": peer_id}), vec![])
            .await
            .map_err(|e| Rerror::internal(e.to_string()))?;
        Ok(Body::Value(json!({ "arg": arg })))
    });

    let client = new_peer();
    let (push_tx, push_rx) = tokio::sync::oneshot::channel::<serde_json::Value>();
    let push_tx = Arc::new(Mutex::new(Some(push_tx)));
    client.route_push("Push.Test", move |ctx| {
        let push_tx = push_tx.clone();
        async move {
            let arg: serde_json::Value = ctx.parse_arg()?;
            if let Some(tx) = push_tx.lock().await.take() {
                let _ = tx.send(arg);
            }
            Ok(())
        }
    });
    let (_srv, sess) = link(&server, &client).await;

    let reply = sess
        .call(
            "Home.Test",
            Body::Value(json!({"author": "henrylee2cn"})),
            vec![with_add_meta("peer_id", "110")],
        )
        .await
        .unwrap();
    assert_eq!(
        reply.body().as_value(),
        Some(&json!({"arg": {"author": "henrylee2cn"}}))
    );

    // Ordering between the PUSH and the REPLY is unspecified, but the PUSH
    // arrives exactly once.
    let pushed = tokio::time::timeout(Duration::from_secs(2), push_rx)
        .await
        .expect("push must arrive")
        .unwrap();
    assert_eq!(pushed, json!({"your_id": "110"}));
}

#[tokio::test]
async fn concurrent_calls_correlate_by_seq() {
    let server = new_peer();
    server.route_call("echo.arg", |ctx| async move {
        let arg: serde_json::Value = ctx.parse_arg()?;
        // Shuffle completion order so replies interleave.
        let jitter = arg["n"].as_u64().unwrap_or(0) % 7;
        tokio::time::sleep(Duration::from_millis(jitter * 3)).await;
        Ok(Body::Value(arg))
    });
    let client = new_peer();
    let (_srv, sess) = link(&server, &client).await;

    let mut tasks = Vec::new();
    for n in 0..32u64 {
        let sess = sess.clone();
        tasks.push(tokio::spawn(async move {
            let reply: serde_json::Value = sess
                .call_typed("echo.arg", &json!({"n": n}), vec![])
                .await
                .unwrap();
            (n, reply)
        }));
    }
    for task in tasks {
        let (n, reply) = task.await.unwrap();
        assert_eq!(reply, json!({"n": n}), "caller {n} got someone else's reply");
    }
}

#[tokio::test]
async fn handler_panic_becomes_remote_error() {
    let server = new_peer();
    server.route_call("Boom.Go", |_ctx| async move {
        if true {
            panic!("nope");
        }
        Ok(Body::None)
    });
    server.route_call("still.alive", |_ctx| async move { Ok(Body::Value(json!(true))) });
    let client = new_peer();
    let (_srv, sess) = link(&server, &client).await;

    let err = sess.call("Boom.Go", Body::None, vec![]).await.unwrap_err();
    match &err {
        CallError::Remote(rerr) => assert!(
            rerr.to_string().contains("nope"),
            "remote error should carry the panic text: {rerr}"
        ),
        other => panic!("expected remote error, got {other}"),
    }

    // The session survived the panic.
    let alive: bool = sess.call_typed("still.alive", &json!(null), vec![]).await.unwrap();
    assert!(alive);
}

#[tokio::test]
async fn unknown_method_gets_not_found() {
    let server = new_peer();
    let client = new_peer();
    let (_srv, sess) = link(&server, &client).await;

    let err = sess
        .call("no.such.method", Body::None, vec![])
        .await
        .unwrap_err();
    match err {
        CallError::Remote(rerr) => assert_eq!(rerr.code, 404),
        other => panic!("expected remote 404, got {other}"),
    }
}

#[tokio::test]
async fn unknown_call_fallback_runs_on_miss() {
    let server = new_peer();
    server.set_unknown_call(
        |ctx| async move {
            Ok(Body::Value(json!({ "fallback": ctx.service_method() })))
        },
        Vec::new(),
    );
    let client = new_peer();
    let (_srv, sess) = link(&server, &client).await;

    let reply = sess.call("Missing.Op", Body::None, vec![]).await.unwrap();
    assert_eq!(
        reply.body().as_value(),
        Some(&json!({"fallback": "/missing/op"}))
    );
}

#[tokio::test]
async fn bidirectional_calls_on_one_connection() {
    let server = new_peer();
    server.route_call("side.a", |_ctx| async move { Ok(Body::Value(json!("a"))) });
    let client = new_peer();
    client.route_call("side.b", |_ctx| async move { Ok(Body::Value(json!("b"))) });
    let (srv_sess, cli_sess) = link(&server, &client).await;

    let a: String = cli_sess.call_typed("side.a", &json!(null), vec![]).await.unwrap();
    assert_eq!(a, "a");
    // The "server" invokes a method on the "client" over the same link.
    let b: String = srv_sess.call_typed("side.b", &json!(null), vec![]).await.unwrap();
    assert_eq!(b, "b");
}

#[tokio::test]
async fn close_fails_pending_and_blocks_new_calls() {
    let server = new_peer();
    server.route_call("sleepy", |_ctx| async move {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(Body::None)
    });
    let client = new_peer();
    let (_srv, sess) = link(&server, &client).await;

    let pending = {
        let sess = sess.clone();
        tokio::spawn(async move { sess.call("sleepy", Body::None, vec![]).await })
    };
    // Let the call reach the wire.
    tokio::time::sleep(Duration::from_millis(50)).await;

    sess.close().await.unwrap();
    assert_eq!(sess.status(), SessionStatus::Closed);

    let result = tokio::time::timeout(Duration::from_secs(2), pending)
        .await
        .expect("pending call must resolve after close")
        .unwrap();
    assert!(matches!(result, Err(CallError::ConnectionClosed { .. })));

    let err = sess.call("sleepy", Body::None, vec![]).await.unwrap_err();
    assert!(matches!(err, CallError::ConnectionClosed { .. }));
}

#[tokio::test]
async fn push_handler_error_does_not_reply() {
    let server = new_peer();
    server.route_push("fails", |_ctx| async move {
        Err(Rerror::internal("push failed"))
    });
    server.route_call("probe", |_ctx| async move { Ok(Body::Value(json!(1))) });
    let client = new_peer();
    let (_srv, sess) = link(&server, &client).await;

    sess.push("fails", Body::None, vec![]).await.unwrap();
    // No REPLY frame may come back for a PUSH; the next CALL still works
    // and is the only reply on the wire.
    let n: i64 = sess.call_typed("probe", &json!(null), vec![]).await.unwrap();
    assert_eq!(n, 1);
}
