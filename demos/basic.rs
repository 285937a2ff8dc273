//! tagsync basic demo
//!
//! Runs a sync client against an in-process connection, plays the server
//! side by hand and merges the received updates into a snapshot.
//!
//! # Usage
//!
//! ```bash
//! cargo run --example basic
//!
//! # More detail
//! RUST_LOG=debug cargo run --example basic
//!
//! # With a configuration file
//! TAGSYNC_CONFIG=/etc/tagsync/client.toml cargo run --example basic
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

use tagsync_client::{ClientConfig, ClientUpdate, Connection, MemoryConnection, SyncClient};
use tagsync_core::{create_bot, edit, insert, preserve, BotDelta, Snapshot, StateDelta};
use tagsync_protocol::{AddUpdates, BranchKey, ClientMessage, ServerMessage, UpdatesReceived};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = match std::env::var("TAGSYNC_CONFIG") {
        Ok(path) => ClientConfig::load(&path).with_context(|| format!("loading {}", path))?,
        Err(_) => ClientConfig::default(),
    };
    info!(?config, "Starting tagsync demo");

    let conn = Arc::new(MemoryConnection::with_codec(config.codec()));
    let client = SyncClient::new(conn.clone(), config)?;
    let driver = client.spawn();

    let key = BranchKey::for_inst("demo");
    let mut updates = client.watch_branch_updates(&key);
    let mut sync_events = client.on_sync_updates_event();

    // queued until the watch is acknowledged
    let local = StateDelta::from([(
        "bot1".to_string(),
        Some(BotDelta::new().tag_edit("name", edit([("local", 1)], vec![preserve(5), insert("!")]))),
    )]);
    client.add_updates(&key, vec![serde_json::to_string(&local)?]);

    conn.connect();
    tokio::time::sleep(Duration::from_millis(10)).await;

    // server: initial state of the branch
    let initial = StateDelta::from([(
        "bot1".to_string(),
        Some(BotDelta::from(create_bot(
            "bot1",
            [("name", "hello"), ("color", "red")],
        ))),
    )]);
    conn.deliver(ServerMessage::AddUpdates(
        AddUpdates::new(&key, vec![serde_json::to_string(&initial)?]).initial(),
    ));

    let mut snapshot = Snapshot::new();
    match tokio::time::timeout(Duration::from_secs(1), updates.recv()).await? {
        Some(ClientUpdate::Updates { updates, .. }) => {
            for update in updates {
                let delta: StateDelta = serde_json::from_str(&update)?;
                snapshot = snapshot.apply(&delta);
            }
        }
        other => bail!("expected the initial batch, got {:?}", other),
    }
    info!(bots = snapshot.len(), "Received initial state");

    // server: acknowledge the flushed local update
    tokio::time::sleep(Duration::from_millis(10)).await;
    for message in conn.take_sent() {
        if let ClientMessage::AddUpdates(batch) = message {
            let Some(update_id) = batch.update_id else {
                continue;
            };
            for update in &batch.updates {
                let delta: StateDelta = serde_json::from_str(update)?;
                snapshot = snapshot.apply(&delta);
            }
            conn.deliver(ServerMessage::UpdatesReceived(UpdatesReceived {
                record_name: batch.record_name,
                inst: batch.inst,
                branch: batch.branch,
                update_id,
                error_code: None,
                max_branch_size_in_bytes: None,
                needed_branch_size_in_bytes: None,
            }));
        }
    }

    while let Ok(Ok(event)) =
        tokio::time::timeout(Duration::from_millis(100), sync_events.recv()).await
    {
        info!(branch = %event.key, state = ?event.state, "Sync state changed");
    }

    if let Some(bot) = snapshot.get("bot1") {
        info!(name = ?bot.tag("name"), color = ?bot.tag("color"), "Merged bot");
    }
    info!(snapshot = %snapshot.to_json()?, "Final snapshot");

    client.close();
    driver.await?;
    Ok(())
}
