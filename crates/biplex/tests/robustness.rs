//! Per-message error recovery: bad frames must not take the session down.

use std::sync::Arc;
use std::time::Duration;

use biplex_core::{
    CodecRegistry, Message, Proto, RawProto, XferRegistry, TYPE_CALL, TYPE_REPLY,
};
use biplex::prelude::*;
use serde_json::json;
use tokio::io::{AsyncWriteExt, DuplexStream};

fn raw_proto() -> RawProto {
    RawProto::new(
        CodecRegistry::with_defaults(),
        XferRegistry::with_defaults(),
        biplex_core::BufferPool::new(),
    )
}

async fn serve_side(peer: &Peer) -> (Arc<Session>, DuplexStream) {
    let (a, b) = tokio::io::duplex(64 * 1024);
    let sess = peer
        .serve_conn(Box::new(a), "mem:server".into(), "mem:raw-client".into())
        .await
        .unwrap();
    (sess, b)
}

#[tokio::test]
async fn unknown_filter_frame_is_dropped_session_survives() {
    let server = Peer::new(PeerConfig::default()).unwrap();
    server.route_call("home.test", |ctx| async move {
        let arg: serde_json::Value = ctx.parse_arg()?;
        Ok(Body::Value(json!({ "arg": arg })))
    });
    let (srv_sess, mut wire) = serve_side(&server).await;

    // Frame 1: pipeLen=1, pipe=[0xFF] (unregistered). The reader must log
    // and drop it without closing the session.
    let garbage = b"opaque";
    let size = (4 + 1 + 1 + garbage.len()) as u32;
    let mut frame = Vec::new();
    frame.extend_from_slice(&size.to_be_bytes());
    frame.push(1);
    frame.push(0xFF);
    frame.extend_from_slice(garbage);
    wire.write_all(&frame).await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(srv_sess.status(), SessionStatus::Ok);

    // Frame 2: a well-formed CALL; the stream stayed aligned and the
    // session answers it.
    let mut call = Message::new();
    call.set_seq(42);
    call.set_mtype(TYPE_CALL);
    call.set_service_method("home.test");
    call.set_body_codec(biplex_core::codec::JSON_CODEC_ID);
    call.set_body(Body::Value(json!({"author": "henrylee2cn"})));
    let mut proto = raw_proto();
    proto.pack(&mut wire, &mut call).await.unwrap();

    let mut reply = Message::new();
    let mut proto = raw_proto();
    tokio::time::timeout(Duration::from_secs(2), proto.unpack(&mut wire, &mut reply))
        .await
        .expect("reply must arrive")
        .unwrap();
    assert_eq!(reply.mtype(), TYPE_REPLY);
    assert_eq!(reply.seq(), 42);
    assert_eq!(
        reply.body().as_value(),
        Some(&json!({"arg": {"author": "henrylee2cn"}}))
    );
}

#[tokio::test]
async fn reply_with_unknown_seq_is_dropped() {
    let server = Peer::new(PeerConfig::default()).unwrap();
    server.route_call("probe", |_ctx| async move { Ok(Body::Value(json!(true))) });
    let (srv_sess, mut wire) = serve_side(&server).await;

    // An uncorrelated REPLY: logged and dropped.
    let mut stray = Message::new();
    stray.set_seq(777);
    stray.set_mtype(TYPE_REPLY);
    stray.set_service_method("nobody.waits");
    let mut proto = raw_proto();
    proto.pack(&mut wire, &mut stray).await.unwrap();

    // An unknown mtype: logged and dropped.
    let mut odd = Message::new();
    odd.set_seq(778);
    odd.set_mtype(200);
    odd.set_service_method("user.type");
    let mut proto = raw_proto();
    proto.pack(&mut wire, &mut odd).await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(srv_sess.status(), SessionStatus::Ok);

    // The session still serves.
    let mut call = Message::new();
    call.set_seq(1);
    call.set_mtype(TYPE_CALL);
    call.set_service_method("probe");
    let mut proto = raw_proto();
    proto.pack(&mut wire, &mut call).await.unwrap();

    let mut reply = Message::new();
    let mut proto = raw_proto();
    tokio::time::timeout(Duration::from_secs(2), proto.unpack(&mut wire, &mut reply))
        .await
        .expect("reply must arrive")
        .unwrap();
    assert_eq!(reply.seq(), 1);
}

#[tokio::test]
async fn truncated_stream_tears_the_session_down() {
    let server = Peer::new(PeerConfig::default()).unwrap();
    let (srv_sess, mut wire) = serve_side(&server).await;

    // A frame header promising more bytes than ever arrive.
    let size: u32 = 100;
    wire.write_all(&size.to_be_bytes()).await.unwrap();
    wire.write_all(&[0u8; 10]).await.unwrap();
    drop(wire);

    // EOF mid-frame desynchronises the stream; with no redial configured
    // the session closes passively.
    tokio::time::timeout(Duration::from_secs(2), async {
        while srv_sess.status() != SessionStatus::Closed {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("session must close on framing error");
}
