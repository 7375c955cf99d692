use std::{collections::HashMap, sync::Arc};

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use shared::{
    domain::{ChannelId, ConversationId, MessageId, ServerUrl},
    protocol::PublicMessage,
};
use tokio::sync::{broadcast, Mutex};
use tracing::info;

pub mod channel;
pub mod config;
mod durable_store;
pub mod error;
pub mod identity;
pub mod registry;
pub mod token;
pub mod transport;

pub use channel::PublicChannel;
pub use config::ClientConfig;
pub use durable_store::{DurableChatStore, StoredPublicConversation};
pub use error::{ChallengeError, PublicChatError, RequestError};
pub use identity::{ChallengeDecryptor, LocalIdentity};
pub use registry::{PublicChatServer, ServerRegistry};
pub use token::TokenManager;

use registry::ClientContext;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Persists bearer tokens per server so a restart does not need a new
/// challenge round-trip.
#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn load_token(&self, server_url: &ServerUrl) -> Result<Option<String>>;
    async fn save_token(&self, server_url: &ServerUrl, token: &str) -> Result<()>;
}

/// Application-side record a channel writes its cursor and metadata into.
#[async_trait]
pub trait PublicConversation: Send + Sync {
    async fn last_retrieved_message(&self) -> Result<Option<MessageId>>;
    async fn set_last_retrieved_message(&self, id: Option<MessageId>) -> Result<()>;
    async fn set_moderator_status(&self, moderator: bool) -> Result<()>;
    async fn set_display_name(&self, name: &str) -> Result<()>;
    async fn set_avatar(&self, avatar: &str) -> Result<()>;
}

#[async_trait]
pub trait ConversationDirectory: Send + Sync {
    async fn conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Option<Arc<dyn PublicConversation>>>;
    async fn local_profile_name(&self) -> Result<Option<String>>;
}

/// Receives the events channels relay to the rest of the application.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: ClientEvent);
}

impl EventSink for broadcast::Sender<ClientEvent> {
    fn emit(&self, event: ClientEvent) {
        // no subscribers is not an error
        let _ = self.send(event);
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientEvent {
    PublicMessage(PublicMessage),
    DeleteLocalPublicMessage {
        message_server_id: MessageId,
        conversation_id: ConversationId,
    },
}

/// Token store that lives only as long as the process.
#[derive(Default)]
pub struct MemoryTokenStore {
    tokens: Mutex<HashMap<ServerUrl, String>>,
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn load_token(&self, server_url: &ServerUrl) -> Result<Option<String>> {
        Ok(self.tokens.lock().await.get(server_url).cloned())
    }

    async fn save_token(&self, server_url: &ServerUrl, token: &str) -> Result<()> {
        self.tokens
            .lock()
            .await
            .insert(server_url.clone(), token.to_string());
        Ok(())
    }
}

/// Directory with no conversations; channels still poll and relay events but
/// keep their cursors in memory only.
pub struct MissingConversationDirectory;

#[async_trait]
impl ConversationDirectory for MissingConversationDirectory {
    async fn conversation(
        &self,
        _conversation_id: &ConversationId,
    ) -> Result<Option<Arc<dyn PublicConversation>>> {
        Ok(None)
    }

    async fn local_profile_name(&self) -> Result<Option<String>> {
        Ok(None)
    }
}

/// Persistence collaborators the client is wired with.
#[derive(Clone)]
pub struct Collaborators {
    pub token_store: Arc<dyn TokenStore>,
    pub conversations: Arc<dyn ConversationDirectory>,
}

impl Collaborators {
    pub fn in_memory() -> Self {
        Self {
            token_store: Arc::new(MemoryTokenStore::default()),
            conversations: Arc::new(MissingConversationDirectory),
        }
    }

    pub fn durable(store: DurableChatStore) -> Self {
        let store = Arc::new(store);
        Self {
            token_store: store.clone(),
            conversations: store,
        }
    }
}

/// Fans an event out to the facade's subscribers and an optional downstream
/// sink.
struct RelaySink {
    events: broadcast::Sender<ClientEvent>,
    downstream: Option<Arc<dyn EventSink>>,
}

impl EventSink for RelaySink {
    fn emit(&self, event: ClientEvent) {
        if let Some(downstream) = &self.downstream {
            downstream.emit(event.clone());
        }
        self.events.emit(event);
    }
}

/// Entry point for public chat: routes channel registration to the per-server
/// registry and re-emits everything the channels relay.
pub struct PublicChatClient {
    registry: ServerRegistry,
    events: broadcast::Sender<ClientEvent>,
}

impl PublicChatClient {
    pub fn new(
        identity: Arc<dyn ChallengeDecryptor>,
        collaborators: Collaborators,
        config: ClientConfig,
    ) -> Result<Arc<Self>> {
        Self::build(identity, collaborators, config, None)
    }

    pub fn new_with_event_sink(
        identity: Arc<dyn ChallengeDecryptor>,
        collaborators: Collaborators,
        config: ClientConfig,
        sink: Arc<dyn EventSink>,
    ) -> Result<Arc<Self>> {
        Self::build(identity, collaborators, config, Some(sink))
    }

    fn build(
        identity: Arc<dyn ChallengeDecryptor>,
        collaborators: Collaborators,
        config: ClientConfig,
        downstream: Option<Arc<dyn EventSink>>,
    ) -> Result<Arc<Self>> {
        let http = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .context("failed to build HTTP client")?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let relay = Arc::new(RelaySink {
            events: events.clone(),
            downstream,
        });
        let context = Arc::new(ClientContext {
            http,
            identity,
            token_store: collaborators.token_store,
            conversations: collaborators.conversations,
            events: relay,
            config,
        });
        Ok(Arc::new(Self {
            registry: ServerRegistry::new(context),
            events,
        }))
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn registry(&self) -> &ServerRegistry {
        &self.registry
    }

    /// Returns the channel for `(server_url, channel_id)`, creating and
    /// starting it on first use.
    pub async fn find_or_create_channel(
        &self,
        server_url: &str,
        channel_id: ChannelId,
        conversation_id: ConversationId,
    ) -> Arc<PublicChannel> {
        self.registry
            .find_or_create_channel(&ServerUrl::new(server_url), channel_id, conversation_id)
            .await
    }

    /// Stops the channel's pollers. Returns whether the channel was registered.
    pub async fn unregister_channel(&self, server_url: &str, channel_id: ChannelId) -> bool {
        self.registry
            .unregister_channel(&ServerUrl::new(server_url), channel_id)
            .await
    }

    pub async fn channel(
        &self,
        server_url: &str,
        channel_id: ChannelId,
    ) -> Option<Arc<PublicChannel>> {
        self.registry
            .channel(&ServerUrl::new(server_url), channel_id)
            .await
    }

    pub async fn shutdown(&self) {
        let stopped = self.registry.shutdown().await;
        info!(count = stopped, "public chat client shut down");
    }
}

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
