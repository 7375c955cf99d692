use std::{collections::HashMap, sync::Arc};

use reqwest::Client;
use shared::domain::{ChannelId, ConversationId, ServerUrl};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::{
    channel::PublicChannel, config::ClientConfig, identity::ChallengeDecryptor,
    token::TokenManager, transport::AuthenticatedClient, ConversationDirectory, EventSink,
    TokenStore,
};

/// Dependencies shared by every server and channel of one client.
pub(crate) struct ClientContext {
    pub(crate) http: Client,
    pub(crate) identity: Arc<dyn ChallengeDecryptor>,
    pub(crate) token_store: Arc<dyn TokenStore>,
    pub(crate) conversations: Arc<dyn ConversationDirectory>,
    pub(crate) events: Arc<dyn EventSink>,
    pub(crate) config: ClientConfig,
}

/// One chat server: its token manager and the channels polled on it.
pub struct PublicChatServer {
    server_url: ServerUrl,
    transport: AuthenticatedClient,
    channels: Mutex<HashMap<ChannelId, Arc<PublicChannel>>>,
}

impl PublicChatServer {
    fn new(context: &ClientContext, server_url: ServerUrl) -> Arc<Self> {
        let tokens = Arc::new(TokenManager::new(
            server_url.clone(),
            context.http.clone(),
            Arc::clone(&context.identity),
            Arc::clone(&context.token_store),
        ));
        let transport = AuthenticatedClient::new(server_url.clone(), context.http.clone(), tokens);
        Arc::new(Self {
            server_url,
            transport,
            channels: Mutex::new(HashMap::new()),
        })
    }

    /// Fetches a token in the background so the first poll does not pay for
    /// the challenge round-trip.
    fn warm_token(&self) {
        let tokens = Arc::clone(self.transport.tokens());
        tokio::spawn(async move {
            if tokens.get_token(false).await.is_none() {
                warn!(server_url = %tokens.server_url(), "initial token fetch failed");
            }
        });
    }

    pub fn server_url(&self) -> &ServerUrl {
        &self.server_url
    }

    pub fn tokens(&self) -> &Arc<TokenManager> {
        self.transport.tokens()
    }

    pub async fn channel(&self, channel_id: ChannelId) -> Option<Arc<PublicChannel>> {
        self.channels.lock().await.get(&channel_id).cloned()
    }

    pub async fn channel_count(&self) -> usize {
        self.channels.lock().await.len()
    }
}

/// Servers keyed by normalized base URL, created on first reference and
/// dropped once their last channel is unregistered.
pub struct ServerRegistry {
    context: Arc<ClientContext>,
    servers: Mutex<HashMap<ServerUrl, Arc<PublicChatServer>>>,
}

impl ServerRegistry {
    pub(crate) fn new(context: Arc<ClientContext>) -> Self {
        Self {
            context,
            servers: Mutex::new(HashMap::new()),
        }
    }

    pub async fn server(&self, server_url: &ServerUrl) -> Option<Arc<PublicChatServer>> {
        self.servers.lock().await.get(server_url).cloned()
    }

    pub async fn channel(
        &self,
        server_url: &ServerUrl,
        channel_id: ChannelId,
    ) -> Option<Arc<PublicChannel>> {
        let server = self.server(server_url).await?;
        server.channel(channel_id).await
    }

    pub async fn find_or_create_channel(
        &self,
        server_url: &ServerUrl,
        channel_id: ChannelId,
        conversation_id: ConversationId,
    ) -> Arc<PublicChannel> {
        if let Some(existing) = self.channel(server_url, channel_id).await {
            return existing;
        }

        // resolved before taking the registry lock; the directory may hit disk
        let conversation = match self.context.conversations.conversation(&conversation_id).await {
            Ok(conversation) => conversation,
            Err(err) => {
                warn!(%conversation_id, "failed to resolve public conversation: {err:#}");
                None
            }
        };

        let mut servers = self.servers.lock().await;
        let server = match servers.get(server_url) {
            Some(server) => Arc::clone(server),
            None => {
                let server = PublicChatServer::new(&self.context, server_url.clone());
                server.warm_token();
                servers.insert(server_url.clone(), Arc::clone(&server));
                info!(%server_url, "registered public chat server");
                server
            }
        };

        let mut channels = server.channels.lock().await;
        if let Some(existing) = channels.get(&channel_id) {
            return Arc::clone(existing);
        }
        let channel = PublicChannel::new(
            Arc::clone(&self.context),
            server.transport.clone(),
            channel_id,
            conversation_id,
            conversation,
        );
        channels.insert(channel_id, Arc::clone(&channel));
        drop(channels);
        drop(servers);

        channel.start().await;
        channel
    }

    /// Stops the channel and forgets it; the server goes with its last channel.
    pub async fn unregister_channel(&self, server_url: &ServerUrl, channel_id: ChannelId) -> bool {
        let mut servers = self.servers.lock().await;
        let Some(server) = servers.get(server_url).cloned() else {
            warn!(%server_url, channel_id = channel_id.0, "unregister for unknown server");
            return false;
        };

        let mut channels = server.channels.lock().await;
        let Some(channel) = channels.remove(&channel_id) else {
            warn!(%server_url, channel_id = channel_id.0, "unregister for unknown channel");
            return false;
        };
        channel.stop();
        if channels.is_empty() {
            servers.remove(server_url);
            info!(%server_url, "removed public chat server");
        }
        info!(%server_url, channel_id = channel_id.0, "unregistered public channel");
        true
    }

    /// Stops every channel on every server. Returns how many were stopped.
    pub async fn shutdown(&self) -> usize {
        let servers: Vec<_> = self.servers.lock().await.drain().map(|(_, s)| s).collect();
        let mut stopped = Vec::new();
        for server in servers {
            stopped.extend(server.channels.lock().await.drain().map(|(_, c)| c));
        }
        for channel in &stopped {
            channel.stop();
        }
        for channel in &stopped {
            channel.wait_stopped().await;
        }
        stopped.len()
    }
}

#[cfg(test)]
#[path = "tests/registry_tests.rs"]
mod tests;
