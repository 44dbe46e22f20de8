//! TCP client example.
//!
//! Dials the tcp_server example, issues a gzip-compressed CALL and prints
//! the reply and the server's PUSH.
//!
//! Run with: `cargo run --example tcp_client -p biplex`

use std::time::Duration;

use biplex::prelude::*;
use biplex::{with_add_meta, with_xfer_pipe};
use serde_json::json;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter("info,biplex=debug")
        .init();

    let peer = Peer::new(PeerConfig {
        redial_times: 3,
        redial_interval: Duration::from_millis(200),
        ..PeerConfig::default()
    })?;

    peer.route_push("push.status", |ctx| async move {
        let arg: serde_json::Value = ctx.parse_arg()?;
        println!("server pushed: {arg}");
        Ok(())
    });

    let sess = peer.dial("127.0.0.1:9090").await?;
    let reply: serde_json::Value = sess
        .call_typed(
            "home.test",
            &json!({ "author": "henrylee2cn" }),
            vec![with_add_meta("peer_id", "110"), with_xfer_pipe(&[0x67])],
        )
        .await?;
    println!("reply: {reply}");

    // Give the push a moment to arrive before shutting down.
    tokio::time::sleep(Duration::from_millis(200)).await;
    peer.close().await?;
    Ok(())
}
