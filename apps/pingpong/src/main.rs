//! Ping-Pong Worker - Entry Point
//!
//! Demo consumer that bounces ping/pong messages over one topic.

#[tokio::main]
async fn main() -> eyre::Result<()> {
    pingpong::run().await
}
