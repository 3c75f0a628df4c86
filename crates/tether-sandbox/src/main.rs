mod config;

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use tether_db::{Database, LocalCache, SqliteCache};
use tether_gateway::{Connection, LoopbackConnection, SendOutcome, WsConnection};
use tether_store::MemoryStore;
use tether_sync::{ChatSession, NewRoom};

use crate::config::SandboxConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tether=debug".into()),
        )
        .init();

    let config = SandboxConfig::from_env()?;

    // Collaborators
    let store = Arc::new(MemoryStore::new());
    let connection: Arc<dyn Connection> = match &config.gateway_url {
        Some(url) => {
            info!("Using gateway at {}", url);
            Arc::new(WsConnection::new(url.as_str()))
        }
        None => {
            info!("No TETHER_GATEWAY_URL set, using in-process echo connection");
            Arc::new(LoopbackConnection::with_echo())
        }
    };
    let db = match &config.db_path {
        Some(path) => Database::open(path)?,
        None => Database::open_in_memory()?,
    };
    let cache: Arc<dyn LocalCache> = Arc::new(SqliteCache::new(Arc::new(db)));

    let session = ChatSession::new(
        config.author.clone(),
        store,
        connection,
        Some(cache.clone()),
        config.session.clone(),
    );

    let room = session
        .create_room(NewRoom {
            name: "sandbox".into(),
            description: "Local playground".into(),
            ..NewRoom::default()
        })
        .await?;
    session.join_and_connect(&room.id).await?;
    session.watch_rooms([room.id.clone()]).await?;
    let mut view = session.enter_room(&room.id).await?;

    let mut texts: Vec<String> = std::env::args().skip(1).collect();
    if texts.is_empty() {
        texts.push("hello from tether".into());
    }
    for text in texts {
        match session.send_text(&room.id, text).await {
            SendOutcome::Delivered { message, duplicate, .. } => {
                info!("Delivered {} (seq {:?}, duplicate={})", message.id, message.seq, duplicate)
            }
            SendOutcome::Failed { message, reason } => warn!("Message {} failed: {}", message.id, reason),
        }
    }

    while let Ok(Some(message)) = tokio::time::timeout(Duration::from_millis(200), view.live.recv()).await {
        info!("[{}] {}: {}", room.name, message.sender_name, message.display_text());
    }

    let page = session.refresh_room_list().await?;
    for entry in &page.entries {
        info!(
            "Room {} ({}): last message {:?}, {} previews",
            entry.room.name,
            entry.room.id,
            entry.room.last_message,
            entry.previews.len()
        );
    }

    let cached = cache.cached_messages(&room.id, config.session.page_size).await?;
    info!("{} messages cached locally for {}", cached.len(), room.id);

    session.exit_room(&room.id).await;
    session.shutdown().await;
    Ok(())
}
