use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::Utc;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde_json::Value;
use shared::{
    domain::{ChannelId, ConversationId, MessageId},
    protocol::{
        ChannelInfo, ChannelMessage, CreatedMessage, DeletionEntry, GroupContext, GroupKind,
        OutgoingMessage, ProfileUpdate, PublicMessage, PublicMessageBody, SenderProfile,
        TokenInfo, UserInfo,
    },
};
use tokio::{sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    error::PublicChatError,
    registry::ClientContext,
    transport::{AuthenticatedClient, RequestOptions},
    ClientEvent, PublicConversation,
};

#[derive(Default)]
struct MessageCursor {
    seeded: bool,
    last_seen: Option<MessageId>,
}

/// One subscribed public channel and its three polling loops.
pub struct PublicChannel {
    context: Arc<ClientContext>,
    transport: AuthenticatedClient,
    channel_id: ChannelId,
    conversation_id: ConversationId,
    conversation: Option<Arc<dyn PublicConversation>>,
    message_cursor: Mutex<MessageCursor>,
    deletion_cursor: Mutex<i64>,
    moderator: AtomicBool,
    stop: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PublicChannel {
    pub(crate) fn new(
        context: Arc<ClientContext>,
        transport: AuthenticatedClient,
        channel_id: ChannelId,
        conversation_id: ConversationId,
        conversation: Option<Arc<dyn PublicConversation>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            context,
            transport,
            channel_id,
            conversation_id,
            conversation,
            message_cursor: Mutex::new(MessageCursor::default()),
            deletion_cursor: Mutex::new(1),
            moderator: AtomicBool::new(false),
            stop: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn channel_id(&self) -> ChannelId {
        self.channel_id
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    pub fn is_moderator(&self) -> bool {
        self.moderator.load(Ordering::Acquire)
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    pub async fn last_seen_message_id(&self) -> Option<MessageId> {
        self.message_cursor.lock().await.last_seen
    }

    pub async fn last_deleted_id(&self) -> i64 {
        *self.deletion_cursor.lock().await
    }

    fn base_channel_endpoint(&self) -> String {
        format!("channels/{}", self.channel_id)
    }

    fn messages_endpoint(&self) -> String {
        format!("channels/{}/messages", self.channel_id)
    }

    /// Absolute URL messages are posted to.
    pub fn message_endpoint(&self) -> String {
        self.transport.server_url().join(&self.messages_endpoint())
    }

    pub(crate) async fn start(self: &Arc<Self>) {
        let config = &self.context.config;
        let loops = vec![
            self.spawn_loop("messages", config.message_poll_interval, |channel| async move {
                channel.poll_messages().await;
            }),
            self.spawn_loop("deletions", config.deletion_poll_interval, |channel| async move {
                channel.poll_deletions().await;
            }),
            self.spawn_loop("channel", config.channel_poll_interval, |channel| async move {
                channel.poll_channel_settings().await;
                if channel.is_stopped() {
                    return;
                }
                channel.refresh_moderator_status().await;
            }),
        ];
        self.tasks.lock().await.extend(loops);
        info!(
            server_url = %self.transport.server_url(),
            channel_id = self.channel_id.0,
            conversation_id = %self.conversation_id,
            "registered public channel"
        );
    }

    /// Each loop only reschedules after its previous cycle has completed, and
    /// never after the channel has been stopped.
    fn spawn_loop<F, Fut>(
        self: &Arc<Self>,
        name: &'static str,
        interval: Duration,
        cycle: F,
    ) -> JoinHandle<()>
    where
        F: Fn(Arc<Self>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let channel = Arc::clone(self);
        tokio::spawn(async move {
            let stop = channel.stop.clone();
            while !stop.is_cancelled() {
                cycle(Arc::clone(&channel)).await;
                if stop.is_cancelled() {
                    break;
                }
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
            debug!(channel_id = channel.channel_id.0, poller = name, "poller stopped");
        })
    }

    /// Stops all loops. A request already in flight still completes, but its
    /// loop exits instead of scheduling another cycle.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Waits for every loop task to exit. Only meaningful after [`Self::stop`].
    pub async fn wait_stopped(&self) {
        let handles = std::mem::take(&mut *self.tasks.lock().await);
        for result in futures::future::join_all(handles).await {
            if let Err(err) = result {
                warn!(channel_id = self.channel_id.0, "poller task failed: {err}");
            }
        }
    }

    /// One message polling cycle. Returns how many messages were relayed.
    pub async fn poll_messages(&self) -> usize {
        let mut cursor = self.message_cursor.lock().await;
        if !cursor.seeded {
            cursor.last_seen = self.seed_message_cursor().await;
            cursor.seeded = true;
        }

        let mut options = RequestOptions::get()
            .query("include_annotations", 1)
            .query("count", -i64::from(self.context.config.message_page_size))
            .query("include_deleted", false);
        if let Some(since) = cursor.last_seen {
            options = options.query("since_id", since);
        }

        let envelope = match self
            .transport
            .request_data::<Vec<Value>>(&self.messages_endpoint(), options)
            .await
        {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(channel_id = self.channel_id.0, "message poll failed: {err}");
                return 0;
            }
        };

        let mut received_at = Utc::now().timestamp_millis();
        let mut relayed = 0;
        let messages: Vec<ChannelMessage> =
            decode_items(&envelope.data, self.channel_id, "message");
        // server pages are newest first
        for message in messages.iter().rev() {
            let Some(public) = normalize_message(message, &self.conversation_id, received_at)
            else {
                continue;
            };
            received_at += 1;
            let id = public.server_id;
            cursor.last_seen = Some(cursor.last_seen.map_or(id, |seen| seen.max(id)));
            self.context.events.emit(ClientEvent::PublicMessage(public));
            relayed += 1;
        }

        if let Some(conversation) = &self.conversation {
            if let Err(err) = conversation
                .set_last_retrieved_message(cursor.last_seen)
                .await
            {
                warn!(
                    conversation_id = %self.conversation_id,
                    "failed to persist message cursor: {err:#}"
                );
            }
        }
        if relayed > 0 {
            debug!(channel_id = self.channel_id.0, count = relayed, "relayed public messages");
        }
        relayed
    }

    async fn seed_message_cursor(&self) -> Option<MessageId> {
        let Some(conversation) = &self.conversation else {
            warn!(
                conversation_id = %self.conversation_id,
                "polling for a public conversation that does not exist"
            );
            return Some(MessageId(0));
        };
        match conversation.last_retrieved_message().await {
            Ok(seen) => seen,
            Err(err) => {
                warn!(
                    conversation_id = %self.conversation_id,
                    "failed to read message cursor: {err:#}"
                );
                None
            }
        }
    }

    /// One deletion cycle: drains pages until the backlog is exhausted.
    /// Returns how many deletions were relayed.
    pub async fn poll_deletions(&self) -> usize {
        let mut cursor = self.deletion_cursor.lock().await;
        let page_size = self.context.config.deletion_page_size;
        let endpoint = format!("loki/v1/channel/{}/deletes", self.channel_id);
        let mut relayed = 0;

        for page in 0usize.. {
            if page > 0 && self.is_stopped() {
                break;
            }
            let options = RequestOptions::get()
                .query("count", page_size)
                .query("since_id", *cursor);
            let envelope = match self
                .transport
                .request_data::<Vec<Value>>(&endpoint, options)
                .await
            {
                Ok(envelope) => envelope,
                Err(err) => {
                    warn!(channel_id = self.channel_id.0, "deletion poll aborted: {err}");
                    break;
                }
            };

            let entries: Vec<DeletionEntry> =
                decode_items(&envelope.data, self.channel_id, "deletion");
            for entry in entries.iter().rev() {
                let Some(message_server_id) = entry.message_id else {
                    continue;
                };
                self.context.events.emit(ClientEvent::DeleteLocalPublicMessage {
                    message_server_id,
                    conversation_id: self.conversation_id.clone(),
                });
                relayed += 1;
            }

            if envelope.data.len() < page_size {
                break;
            }
            match envelope.meta.max_id {
                Some(max_id) if max_id > *cursor => *cursor = max_id,
                _ => {
                    warn!(
                        channel_id = self.channel_id.0,
                        "deletion page carried no usable max_id"
                    );
                    break;
                }
            }
            if !envelope.has_more() {
                break;
            }
        }
        relayed
    }

    /// Applies the channel's display settings to the conversation. Returns
    /// whether a settings annotation was found.
    pub async fn poll_channel_settings(&self) -> bool {
        let options = RequestOptions::get().query("include_annotations", 1);
        let envelope = match self
            .transport
            .request_data::<ChannelInfo>(&self.base_channel_endpoint(), options)
            .await
        {
            Ok(envelope) => envelope,
            Err(err) => {
                debug!(channel_id = self.channel_id.0, "channel settings poll failed: {err}");
                return false;
            }
        };

        let mut found = false;
        for settings in envelope.data.settings() {
            found = true;
            let Some(conversation) = &self.conversation else {
                continue;
            };
            if let Some(name) = settings.name.filter(|name| !name.is_empty()) {
                if let Err(err) = conversation.set_display_name(&name).await {
                    warn!(conversation_id = %self.conversation_id, "failed to apply channel name: {err:#}");
                }
            }
            if let Some(avatar) = settings.avatar.filter(|avatar| !avatar.is_empty()) {
                if let Err(err) = conversation.set_avatar(&avatar).await {
                    warn!(conversation_id = %self.conversation_id, "failed to apply channel avatar: {err:#}");
                }
            }
        }
        found
    }

    /// Refreshes the moderator flag, then pushes the local profile name to the
    /// server if it differs. A failed lookup keeps the previous flag.
    pub async fn refresh_moderator_status(&self) {
        if self.is_stopped() {
            return;
        }
        match self
            .transport
            .request_data::<UserInfo>("loki/v1/user_info", RequestOptions::get())
            .await
        {
            Ok(envelope) => {
                if let Some(moderator) = envelope.data.moderator_status {
                    self.moderator.store(moderator, Ordering::Release);
                }
            }
            Err(err) => {
                debug!(channel_id = self.channel_id.0, "moderator status lookup failed: {err}");
            }
        }
        if self.is_stopped() {
            return;
        }

        if let Some(conversation) = &self.conversation {
            if let Err(err) = conversation.set_moderator_status(self.is_moderator()).await {
                warn!(conversation_id = %self.conversation_id, "failed to store moderator status: {err:#}");
            }
        }

        if !self.is_stopped() {
            self.sync_profile_name().await;
        }
    }

    async fn sync_profile_name(&self) {
        let remote_name = match self
            .transport
            .request_data::<TokenInfo>("token", RequestOptions::get())
            .await
        {
            Ok(envelope) => match envelope.data.user {
                Some(user) => user.name,
                None => return,
            },
            Err(err) => {
                debug!(channel_id = self.channel_id.0, "token info lookup failed: {err}");
                return;
            }
        };

        let local_name = match self.context.conversations.local_profile_name().await {
            Ok(Some(name)) if !name.is_empty() => name,
            Ok(_) => return,
            Err(err) => {
                warn!("failed to read local profile name: {err:#}");
                return;
            }
        };
        if remote_name.as_deref() == Some(local_name.as_str()) {
            return;
        }

        let update = match serde_json::to_value(ProfileUpdate { name: local_name }) {
            Ok(update) => update,
            Err(err) => {
                warn!("failed to encode profile update: {err}");
                return;
            }
        };
        if let Err(err) = self
            .transport
            .request("users/me", RequestOptions::with_method(Method::PATCH).json(update))
            .await
        {
            debug!(server_url = %self.transport.server_url(), "profile name sync failed: {err}");
        }
    }

    /// Posts a message and returns its server id, or `None` if the server did
    /// not accept it.
    pub async fn send_message(
        &self,
        text: &str,
        timestamp: i64,
        display_name: &str,
        sender_key: &str,
    ) -> Option<MessageId> {
        let payload = OutgoingMessage::new(text, timestamp, display_name, sender_key);
        let body = match serde_json::to_value(&payload) {
            Ok(body) => body,
            Err(err) => {
                warn!("failed to encode outgoing message: {err}");
                return None;
            }
        };
        match self
            .transport
            .request_data::<CreatedMessage>(
                &self.messages_endpoint(),
                RequestOptions::with_method(Method::POST).json(body),
            )
            .await
        {
            Ok(envelope) => envelope.data.id,
            Err(err) => {
                warn!(channel_id = self.channel_id.0, "failed to send public message: {err}");
                None
            }
        }
    }

    /// Deletes a message, through the moderation endpoint when this identity
    /// moderates the channel.
    pub async fn delete_message(&self, server_id: MessageId) -> Result<(), PublicChatError> {
        let endpoint = if self.is_moderator() {
            format!("loki/v1/moderation/message/{server_id}")
        } else {
            format!("{}/messages/{server_id}", self.base_channel_endpoint())
        };
        match self
            .transport
            .request(&endpoint, RequestOptions::with_method(Method::DELETE))
            .await
        {
            Ok(_) => {
                info!(
                    channel_id = self.channel_id.0,
                    server_id = server_id.0,
                    "deleted public message"
                );
                Ok(())
            }
            Err(source) => {
                warn!(
                    channel_id = self.channel_id.0,
                    server_id = server_id.0,
                    "failed to delete public message: {source}"
                );
                Err(PublicChatError::DeleteFailed {
                    server_id,
                    channel: self.base_channel_endpoint(),
                    source,
                })
            }
        }
    }
}

/// Validates a raw channel message and turns it into the record handed to the
/// rest of the application. Deleted or incomplete messages yield `None`.
/// Decodes page items one by one. Items that do not decode are skipped so a
/// single malformed entry cannot stall the channel.
fn decode_items<T: DeserializeOwned>(
    items: &[Value],
    channel_id: ChannelId,
    kind: &'static str,
) -> Vec<T> {
    items
        .iter()
        .filter_map(|item| match serde_json::from_value(item.clone()) {
            Ok(decoded) => Some(decoded),
            Err(err) => {
                debug!(channel_id = channel_id.0, item = kind, "skipping malformed item: {err}");
                None
            }
        })
        .collect()
}

pub(crate) fn normalize_message(
    message: &ChannelMessage,
    conversation_id: &ConversationId,
    received_at: i64,
) -> Option<PublicMessage> {
    if message.is_deleted {
        return None;
    }
    let note = message.public_chat_note();
    let user = message.user.as_ref()?;

    let from = user
        .name
        .clone()
        .filter(|name| !name.is_empty())
        .or_else(|| note.as_ref().and_then(|note| note.from.clone()))
        .filter(|name| !name.is_empty())?;
    let timestamp = message
        .created_at_millis()
        .or_else(|| note.as_ref().and_then(|note| note.timestamp))
        .filter(|timestamp| *timestamp > 0)?;
    let server_id = message.id?;
    let source = user.username.clone().filter(|name| !name.is_empty())?;
    let body = message.text.clone().filter(|text| !text.is_empty())?;

    Some(PublicMessage {
        server_id,
        friend_request: false,
        source,
        source_device: 1,
        timestamp,
        server_timestamp: timestamp,
        received_at,
        is_public: true,
        message: PublicMessageBody {
            body,
            attachments: Vec::new(),
            group: GroupContext {
                id: conversation_id.clone(),
                kind: GroupKind::Deliver,
            },
            flags: 0,
            expire_timer: 0,
            profile_key: None,
            timestamp,
            received_at,
            sent_at: timestamp,
            quote: None,
            contact: Vec::new(),
            preview: Vec::new(),
            profile: SenderProfile { display_name: from },
        },
    })
}

#[cfg(test)]
#[path = "tests/channel_tests.rs"]
mod tests;
