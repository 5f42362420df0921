//! Client against a local echo server.
//!
//! Demonstrates:
//! - Queueing messages before the connection opens
//! - Logger and PingPong middleware
//! - Listening to store and lifecycle events
//! - Automatic reconnect after the server drops the connection
//!
//! Usage:
//!   cargo run --example echo
//!   cargo run --example echo -- --debug

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use resilient_ws::events::names;
use resilient_ws::{Client, Logger, PingPong, Result};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::time::sleep;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tracing_subscriber::EnvFilter;

// ============================================================================
// Constants
// ============================================================================

/// Frames after which the server drops a connection.
const DROP_AFTER: usize = 3;

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() {
    let debug = std::env::args().any(|a| a == "--debug");
    init_logging(debug);

    if let Err(e) = run().await {
        eprintln!("\n[ERROR] {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    println!("=== Echo ===\n");

    // ========================================================================
    // Start Server
    // ========================================================================

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .map_err(|e| resilient_ws::Error::transport(e.to_string()))?;
    let addr = listener
        .local_addr()
        .map_err(|e| resilient_ws::Error::transport(e.to_string()))?;
    tokio::spawn(serve(listener));

    println!("[1] Echo server on {addr}\n");

    // ========================================================================
    // Build Client
    // ========================================================================

    let client = Client::builder(format!("ws://{addr}"))
        .auto_connect(false)
        .reconnect_base_delay(Duration::from_millis(250))
        .build()?;

    client.use_middleware(Logger);
    client.use_middleware(PingPong::new(client.sender()));

    let _messages = client.on(names::STORE_STATE_CHANGED, |change: &Value| {
        println!("    state-changed: {}", change["type"]);
    });
    let _lifecycle = client.on(names::STATE_CHANGED, |change: &Value| {
        println!("    {} -> {}", change["from"], change["to"]);
    });
    let _retry = client.on(names::RECONNECT_SCHEDULED, |info: &Value| {
        println!("    reconnect in {}ms", info["delayMs"]);
    });

    println!("[2] Client built ({})\n", client.state());

    // ========================================================================
    // Queue, Connect, Flush
    // ========================================================================

    println!("[3] Queueing before connect...");
    client.send(&json!({ "seq": 1 }))?;
    client.send(&json!({ "seq": 2 }))?;
    println!("    queued: {}\n", client.queued().len());

    println!("[4] Connecting...");
    client.connect()?;
    sleep(Duration::from_millis(300)).await;

    // ========================================================================
    // Drop and Recover
    // ========================================================================

    println!("\n[5] Third frame makes the server drop us...");
    client.send(&"ping")?;
    sleep(Duration::from_secs(1)).await;

    client.send(&json!({ "seq": 3 }))?;
    sleep(Duration::from_millis(300)).await;

    let state = client.store_state();
    println!("\n[6] Received {} messages, connected: {}", state.messages.len(), state.connected);

    client.close().await?;
    println!("    ✓ Closed ({})", client.state());

    Ok(())
}

// ============================================================================
// Server
// ============================================================================

async fn serve(listener: TcpListener) {
    while let Ok((stream, _)) = listener.accept().await {
        tokio::spawn(async move {
            let Ok(mut ws) = accept_async(stream).await else {
                return;
            };

            let mut frames = 0;
            while let Some(Ok(msg)) = ws.next().await {
                if !msg.is_text() {
                    continue;
                }
                frames += 1;
                if frames >= DROP_AFTER {
                    // no close frame, the client sees 1006
                    return;
                }
                if ws.send(msg).await.is_err() {
                    return;
                }
            }
        });
    }
}

// ============================================================================
// Logging
// ============================================================================

fn init_logging(debug: bool) {
    let filter = if debug {
        "resilient_ws=debug"
    } else {
        "resilient_ws=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(false)
        .init();
}
