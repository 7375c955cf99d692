use chrono::DateTime;
use serde::{de::DeserializeOwned, Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::domain::{ConversationId, MessageId};

/// Annotation type carrying the legacy public-chat fields on a message.
pub const PUBLIC_CHAT_ANNOTATION: &str = "network.loki.messenger.publicChat";
/// Annotation type carrying a channel's display settings.
pub const CHANNEL_SETTINGS_ANNOTATION: &str = "net.patter-app.settings";

/// Ids arrive as JSON numbers from some deployments and as strings from
/// others.
#[derive(Deserialize)]
#[serde(untagged)]
enum FlexibleId {
    Int(i64),
    Str(String),
}

impl FlexibleId {
    fn into_i64(self) -> Option<i64> {
        match self {
            Self::Int(value) => Some(value),
            Self::Str(value) => value.trim().parse().ok(),
        }
    }
}

fn flexible_i64<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<FlexibleId>::deserialize(deserializer)?.and_then(FlexibleId::into_i64))
}

fn flexible_message_id<'de, D>(deserializer: D) -> Result<Option<MessageId>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(flexible_i64(deserializer)?.map(MessageId))
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponseMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<u16>,
    #[serde(
        default,
        deserialize_with = "flexible_i64",
        skip_serializing_if = "Option::is_none"
    )]
    pub max_id: Option<i64>,
    #[serde(
        default,
        deserialize_with = "flexible_i64",
        skip_serializing_if = "Option::is_none"
    )]
    pub min_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub more: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Standard response wrapper: `{ "meta": {...}, "data": ... }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T> {
    #[serde(default)]
    pub meta: ResponseMeta,
    pub data: T,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub more: Option<bool>,
}

impl<T> Envelope<T> {
    /// Pagination hint, read from the top level first and `meta` second.
    pub fn has_more(&self) -> bool {
        self.more.or(self.meta.more).unwrap_or(false)
    }
}

impl<T: DeserializeOwned> Envelope<T> {
    pub fn from_value(value: Value) -> serde_json::Result<Self> {
        serde_json::from_value(value)
    }
}

/// Extracts `meta.code` from an arbitrary response body without requiring the
/// rest of the envelope to be well-formed.
pub fn meta_code(body: &Value) -> Option<u16> {
    body.get("meta")?
        .get("code")?
        .as_u64()
        .and_then(|code| u16::try_from(code).ok())
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatUser {
    #[serde(
        default,
        deserialize_with = "flexible_i64",
        skip_serializing_if = "Option::is_none"
    )]
    pub id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Annotation {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub value: Value,
}

impl Annotation {
    pub fn value_as<T: DeserializeOwned>(&self) -> Option<T> {
        serde_json::from_value(self.value.clone()).ok()
    }
}

/// Value of a [`PUBLIC_CHAT_ANNOTATION`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PublicChatNote {
    #[serde(
        default,
        deserialize_with = "flexible_i64",
        skip_serializing_if = "Option::is_none"
    )]
    pub timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

/// Value of a [`CHANNEL_SETTINGS_ANNOTATION`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelMessage {
    #[serde(
        default,
        deserialize_with = "flexible_message_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub id: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<ChatUser>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub is_deleted: bool,
    #[serde(default, deserialize_with = "null_as_default")]
    pub annotations: Vec<Annotation>,
}

impl ChannelMessage {
    pub fn public_chat_note(&self) -> Option<PublicChatNote> {
        self.annotations
            .iter()
            .find(|note| note.kind == PUBLIC_CHAT_ANNOTATION)
            .and_then(Annotation::value_as)
    }

    /// `created_at` as milliseconds since the Unix epoch.
    pub fn created_at_millis(&self) -> Option<i64> {
        let raw = self.created_at.as_deref()?;
        DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|parsed| parsed.timestamp_millis())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeletionEntry {
    #[serde(
        default,
        deserialize_with = "flexible_i64",
        skip_serializing_if = "Option::is_none"
    )]
    pub id: Option<i64>,
    #[serde(default, deserialize_with = "flexible_message_id")]
    pub message_id: Option<MessageId>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelInfo {
    #[serde(
        default,
        deserialize_with = "flexible_i64",
        skip_serializing_if = "Option::is_none"
    )]
    pub id: Option<i64>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub annotations: Vec<Annotation>,
}

impl ChannelInfo {
    pub fn settings(&self) -> impl Iterator<Item = ChannelSettings> + '_ {
        self.annotations
            .iter()
            .filter(|note| note.kind == CHANNEL_SETTINGS_ANNOTATION)
            .filter_map(Annotation::value_as)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub moderator_status: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<ChatUser>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengeResponse {
    #[serde(rename = "cipherText64")]
    pub cipher_text_b64: String,
    #[serde(rename = "serverPubKey64")]
    pub server_pub_key_b64: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitChallengeRequest {
    #[serde(rename = "pubKey")]
    pub pub_key: String,
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutgoingAnnotation {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: PublicChatNote,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutgoingMessage {
    pub text: String,
    pub annotations: Vec<OutgoingAnnotation>,
}

impl OutgoingMessage {
    pub fn new(text: &str, timestamp: i64, display_name: &str, sender_key: &str) -> Self {
        Self {
            text: text.to_string(),
            annotations: vec![OutgoingAnnotation {
                kind: PUBLIC_CHAT_ANNOTATION.to_string(),
                value: PublicChatNote {
                    timestamp: Some(timestamp),
                    from: Some(display_name.to_string()),
                    source: Some(sender_key.to_string()),
                },
            }],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileUpdate {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatedMessage {
    #[serde(default, deserialize_with = "flexible_message_id")]
    pub id: Option<MessageId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupKind {
    Deliver,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupContext {
    pub id: ConversationId,
    #[serde(rename = "type")]
    pub kind: GroupKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderProfile {
    pub display_name: String,
}

/// Content half of a [`PublicMessage`], shaped like a regular group message so
/// downstream handlers can treat public messages uniformly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublicMessageBody {
    pub body: String,
    pub attachments: Vec<Value>,
    pub group: GroupContext,
    pub flags: u32,
    pub expire_timer: u32,
    pub profile_key: Option<String>,
    pub timestamp: i64,
    pub received_at: i64,
    pub sent_at: i64,
    pub quote: Option<Value>,
    pub contact: Vec<Value>,
    pub preview: Vec<Value>,
    pub profile: SenderProfile,
}

/// Normalized record for a message received from a public channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublicMessage {
    pub server_id: MessageId,
    pub friend_request: bool,
    pub source: String,
    pub source_device: u32,
    pub timestamp: i64,
    pub server_timestamp: i64,
    pub received_at: i64,
    pub is_public: bool,
    pub message: PublicMessageBody,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn message_ids_accept_strings_and_numbers() {
        let messages: Vec<ChannelMessage> = serde_json::from_value(json!([
            { "id": "42", "text": "a" },
            { "id": 43, "text": "b" },
            { "id": null, "text": "c" }
        ]))
        .expect("messages");
        assert_eq!(messages[0].id, Some(MessageId(42)));
        assert_eq!(messages[1].id, Some(MessageId(43)));
        assert_eq!(messages[2].id, None);
    }

    #[test]
    fn public_chat_note_is_found_by_type() {
        let message: ChannelMessage = serde_json::from_value(json!({
            "id": 1,
            "annotations": [
                { "type": "something.else", "value": { "from": "nope" } },
                { "type": PUBLIC_CHAT_ANNOTATION, "value": { "timestamp": 1700000000000i64, "from": "alice" } }
            ]
        }))
        .expect("message");
        let note = message.public_chat_note().expect("note");
        assert_eq!(note.from.as_deref(), Some("alice"));
        assert_eq!(note.timestamp, Some(1_700_000_000_000));
    }

    #[test]
    fn annotation_without_type_still_decodes() {
        let message: ChannelMessage = serde_json::from_value(json!({
            "id": 6,
            "annotations": [{ "value": { "foo": 1 } }]
        }))
        .expect("message");
        assert_eq!(message.annotations.len(), 1);
        assert!(message.annotations[0].kind.is_empty());
        assert!(message.public_chat_note().is_none());
    }

    #[test]
    fn created_at_parses_to_millis() {
        let message = ChannelMessage {
            created_at: Some("2019-09-06T02:04:57.123Z".into()),
            ..ChannelMessage::default()
        };
        assert_eq!(message.created_at_millis(), Some(1_567_735_497_123));

        let broken = ChannelMessage {
            created_at: Some("yesterday".into()),
            ..ChannelMessage::default()
        };
        assert_eq!(broken.created_at_millis(), None);
    }

    #[test]
    fn envelope_more_prefers_top_level_flag() {
        let envelope: Envelope<Vec<DeletionEntry>> = Envelope::from_value(json!({
            "meta": { "code": 200, "max_id": "17", "more": false },
            "data": [],
            "more": true
        }))
        .expect("envelope");
        assert!(envelope.has_more());
        assert_eq!(envelope.meta.max_id, Some(17));
    }

    #[test]
    fn meta_code_reads_loose_bodies() {
        assert_eq!(meta_code(&json!({ "meta": { "code": 401 } })), Some(401));
        assert_eq!(meta_code(&json!({ "error": "nope" })), None);
    }

    #[test]
    fn outgoing_message_embeds_legacy_fields() {
        let payload = OutgoingMessage::new("hi", 1234, "Alice", "05abc");
        let value = serde_json::to_value(&payload).expect("json");
        assert_eq!(value["annotations"][0]["type"], PUBLIC_CHAT_ANNOTATION);
        assert_eq!(value["annotations"][0]["value"]["timestamp"], 1234);
        assert_eq!(value["annotations"][0]["value"]["from"], "Alice");
        assert_eq!(value["annotations"][0]["value"]["source"], "05abc");
    }
}
