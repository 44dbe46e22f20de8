//! TCP server example.
//!
//! Serves `home.test` CALLs and pushes a `push.status` back to the caller
//! while handling each call.
//!
//! Run with: `cargo run --example tcp_server -p biplex`
//! Then run the client (see tcp_client example).

use biplex::prelude::*;
use serde_json::json;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter("info,biplex=debug")
        .init();

    let peer = Peer::new(PeerConfig {
        listen_addr: "127.0.0.1".into(),
        listen_port: 9090,
        print_detail: true,
        count_time: true,
        ..PeerConfig::default()
    })?;

    peer.route_call("home.test", |ctx| async move {
        let arg: serde_json::Value = ctx.parse_arg()?;
        let peer_id = ctx.meta().get("peer_id").unwrap_or("unknown").to_owned();

        let sess = ctx.session().clone();
        tokio::spawn(async move {
            let _ = sess
                .push_typed("push.status", &json!({ "your_id": peer_id }), vec![])
                .await;
        });

        Ok(Body::Value(json!({ "arg": arg })))
    });

    peer.listen_and_serve().await?;
    Ok(())
}
