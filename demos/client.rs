//! Manual smoke-test binary: connects to a router, subscribes to a topic,
//! registers a procedure, then calls it and prints the result. Not part of
//! the published crate's API — run against a local router with:
//!
//!   rustc --edition 2018 -L target/debug/deps --extern wampcore=... demos/client.rs
//!
//! or copy into `src/bin/` during manual testing.

use std::sync::Arc;

use env_logger;
use log::info;
use serde_json::json;

use wampcore::{connect, Dict, List};

#[tokio::main]
async fn main() {
    env_logger::init();

    let channel = connect("ws://127.0.0.1:8090/ws", "realm1", None)
        .await
        .expect("failed to connect");
    info!("connected");

    let mut events = channel
        .subscribe("com.example.topic")
        .await
        .expect("subscribe failed");
    tokio::spawn(async move {
        use futures::StreamExt;
        while let Some(event) = events.next().await {
            match event {
                Ok((args, kwargs)) => info!("event: args={:?} kwargs={:?}", args, kwargs),
                Err(e) => {
                    info!("subscription ended: {}", e);
                    break;
                }
            }
        }
    });

    let _registration = channel
        .register(
            "com.example.add",
            Arc::new(|args: Option<List>, _kwargs: Option<Dict>| {
                let sum: i64 = args
                    .unwrap_or_default()
                    .iter()
                    .filter_map(|v| v.as_i64())
                    .sum();
                Box::pin(futures::stream::once(async move {
                    Ok((Some(vec![json!(sum)]), None))
                }))
            }),
        )
        .await
        .expect("register failed");
    info!("registered com.example.add");

    let mut result = channel
        .call("com.example.add", Some(vec![json!(2), json!(3)]), None)
        .await;
    {
        use futures::StreamExt;
        while let Some(item) = result.next().await {
            match item {
                Ok((args, _)) => info!("call result: {:?}", args),
                Err(e) => info!("call failed: {}", e),
            }
        }
    }

    channel.close().await.expect("close failed");
}
