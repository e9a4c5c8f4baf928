//! Offline-first send demo over the in-process transport.
//!
//! Sends a message while disconnected, then connects and watches the sync
//! cycle flush it.  Run with `RUST_LOG=debug` for the full trace.

use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::EnvFilter;

use pullse_client::{build_client, ClientConfig, ClientEvent};
use pullse_realtime::MemoryBackend;
use pullse_shared::types::ConversationId;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let dir = tempfile::tempdir()?;
    let mut config = ClientConfig::new("demo-workspace", "visitor-demo");
    config.db_path = Some(dir.path().join("widget.db"));

    let backend = MemoryBackend::new();
    let coordinator = build_client(&config, Arc::new(backend.connector()))?;
    let mut events = coordinator.events().expect("first take of the event stream");

    let conversation = ConversationId::new("conv-demo");

    // Offline: accepted immediately, optimistically queued.
    let message = coordinator
        .send_message(&conversation, "hello from offline", Vec::new())
        .await?;
    println!("sent while offline: status {:?}", message.status);

    // Reconnect; the sync cycle flushes without further action.
    coordinator.connect().await?;
    tokio::time::sleep(Duration::from_millis(200)).await;

    while let Ok(event) = events.try_recv() {
        match event {
            ClientEvent::ConnectionChanged { state } => println!("connection: {state:?}"),
            ClientEvent::QueueFlushed { conversation_id } => {
                println!("queue flushed for {conversation_id}")
            }
            other => println!("event: {other:?}"),
        }
    }

    let visible = coordinator.get_messages(&conversation)?;
    println!(
        "final status: {:?} ({} published on backend)",
        visible[0].status,
        backend.published("demo-workspace:conversations:conv-demo").len()
    );

    Ok(())
}
