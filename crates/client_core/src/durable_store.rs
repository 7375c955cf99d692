use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use shared::domain::{ConversationId, MessageId, ServerUrl};
use storage::Storage;
use tracing::info;

use crate::{
    identity::LocalIdentity, ConversationDirectory, PublicConversation, TokenStore,
};

/// SQLite-backed tokens, conversations and local identity.
#[derive(Clone)]
pub struct DurableChatStore {
    store: Storage,
}

impl DurableChatStore {
    pub fn new(store: Storage) -> Self {
        Self { store }
    }

    pub async fn initialize(database_url: &str) -> Result<Self> {
        let store = Storage::new(database_url)
            .await
            .with_context(|| format!("failed to initialize public chat storage at '{database_url}'"))?;
        Ok(Self { store })
    }

    pub fn storage(&self) -> &Storage {
        &self.store
    }

    pub async fn load_or_create_identity(&self, label: &str) -> Result<LocalIdentity> {
        if let Some(secret) = self.store.load_identity_key(label).await? {
            let bytes: [u8; 32] = secret
                .as_slice()
                .try_into()
                .with_context(|| format!("stored identity '{label}' is {} bytes", secret.len()))?;
            return Ok(LocalIdentity::from_bytes(bytes));
        }

        let identity = LocalIdentity::generate();
        self.store
            .save_identity_key(label, &identity.secret_bytes())
            .await?;
        info!(label, "generated local identity");
        Ok(identity)
    }
}

#[async_trait]
impl TokenStore for DurableChatStore {
    async fn load_token(&self, server_url: &ServerUrl) -> Result<Option<String>> {
        self.store.load_public_server_token(server_url).await
    }

    async fn save_token(&self, server_url: &ServerUrl, token: &str) -> Result<()> {
        self.store.save_public_server_token(server_url, token).await
    }
}

#[async_trait]
impl ConversationDirectory for DurableChatStore {
    async fn conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Option<Arc<dyn PublicConversation>>> {
        let Some(stored) = self.store.get_public_conversation(conversation_id).await? else {
            return Ok(None);
        };
        Ok(Some(Arc::new(StoredPublicConversation {
            store: self.store.clone(),
            conversation_id: stored.conversation_id,
        })))
    }

    async fn local_profile_name(&self) -> Result<Option<String>> {
        self.store.local_profile_name().await
    }
}

pub struct StoredPublicConversation {
    store: Storage,
    conversation_id: ConversationId,
}

#[async_trait]
impl PublicConversation for StoredPublicConversation {
    async fn last_retrieved_message(&self) -> Result<Option<MessageId>> {
        self.store.last_retrieved_message(&self.conversation_id).await
    }

    async fn set_last_retrieved_message(&self, id: Option<MessageId>) -> Result<()> {
        self.store
            .set_last_retrieved_message(&self.conversation_id, id)
            .await
    }

    async fn set_moderator_status(&self, moderator: bool) -> Result<()> {
        self.store
            .set_conversation_moderator(&self.conversation_id, moderator)
            .await
    }

    async fn set_display_name(&self, name: &str) -> Result<()> {
        self.store
            .set_conversation_display_name(&self.conversation_id, name)
            .await
    }

    async fn set_avatar(&self, avatar: &str) -> Result<()> {
        self.store
            .set_conversation_avatar(&self.conversation_id, avatar)
            .await
    }
}

#[cfg(test)]
#[path = "tests/durable_store_tests.rs"]
mod tests;
