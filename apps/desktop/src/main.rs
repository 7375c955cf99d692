use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use client_core::{ChallengeDecryptor, Collaborators, DurableChatStore, PublicChatClient};
use shared::domain::{ChannelId, ConversationId, ServerUrl};
use tokio_stream::{
    wrappers::{errors::BroadcastStreamRecvError, BroadcastStream},
    StreamExt,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;

use config::{default_conversation_id, ChannelSubscription};

#[derive(Parser, Debug)]
struct Args {
    /// Settings file; defaults to ./public_chat.toml when present.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    database_url: Option<String>,
    #[arg(long, requires = "channel_id")]
    server_url: Option<String>,
    #[arg(long, requires = "server_url")]
    channel_id: Option<i64>,
    #[arg(long, requires = "server_url")]
    conversation_id: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    let mut settings = config::load_settings(args.config.as_deref())?;
    if let Some(database_url) = args.database_url {
        settings.database_url = database_url;
    }
    if let (Some(server_url), Some(channel_id)) = (args.server_url, args.channel_id) {
        let conversation_id = args
            .conversation_id
            .unwrap_or_else(|| default_conversation_id(&server_url, channel_id));
        settings.channels.push(ChannelSubscription {
            server_url,
            channel_id,
            conversation_id,
        });
    }
    if settings.channels.is_empty() {
        warn!("no public channels configured; pass --server-url and --channel-id");
    }

    let database_url = config::normalize_database_url(&settings.database_url);
    let store = DurableChatStore::initialize(&database_url).await?;
    let identity = store
        .load_or_create_identity(&settings.identity_label)
        .await
        .context("failed to load local identity")?;
    info!(public_key = %identity.public_key_hex(), "using local identity");

    if let Some(name) = &settings.profile_name {
        store.storage().set_local_profile_name(Some(name)).await?;
    }
    for subscription in &settings.channels {
        store
            .storage()
            .upsert_public_conversation(
                &ConversationId::new(subscription.conversation_id.as_str()),
                &ServerUrl::new(&subscription.server_url),
                ChannelId(subscription.channel_id),
            )
            .await?;
    }

    let client = PublicChatClient::new(
        Arc::new(identity),
        Collaborators::durable(store),
        settings.client_config(),
    )?;
    let mut events = BroadcastStream::new(client.subscribe_events());

    for subscription in &settings.channels {
        client
            .find_or_create_channel(
                &subscription.server_url,
                ChannelId(subscription.channel_id),
                ConversationId::new(subscription.conversation_id.as_str()),
            )
            .await;
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received, shutting down");
                break;
            }
            event = events.next() => match event {
                Some(Ok(event)) => println!("{}", serde_json::to_string(&event)?),
                Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                    warn!(skipped, "event printer fell behind");
                }
                None => break,
            },
        }
    }

    for subscription in &settings.channels {
        client
            .unregister_channel(&subscription.server_url, ChannelId(subscription.channel_id))
            .await;
    }
    client.shutdown().await;
    Ok(())
}
