use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use shared::domain::{ChannelId, ConversationId, MessageId, ServerUrl};

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoredServerToken {
    pub server_url: String,
    pub token: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoredConversation {
    pub conversation_id: ConversationId,
    pub server_url: ServerUrl,
    pub channel_id: ChannelId,
    pub last_retrieved_message: Option<MessageId>,
    pub moderator: bool,
    pub display_name: Option<String>,
    pub avatar: Option<String>,
    pub updated_at: DateTime<Utc>,
}

const CONVERSATION_COLUMNS: &str = "conversation_id, server_url, channel_id, last_retrieved_message, moderator, display_name, avatar, updated_at";

fn conversation_from_row(row: &SqliteRow) -> Result<StoredConversation> {
    Ok(StoredConversation {
        conversation_id: ConversationId(row.try_get::<String, _>(0)?),
        server_url: ServerUrl::new(&row.try_get::<String, _>(1)?),
        channel_id: ChannelId(row.try_get::<i64, _>(2)?),
        last_retrieved_message: row.try_get::<Option<i64>, _>(3)?.map(MessageId),
        moderator: row.try_get::<bool, _>(4)?,
        display_name: row.try_get::<Option<String>, _>(5)?,
        avatar: row.try_get::<Option<String>, _>(6)?,
        updated_at: row.try_get::<DateTime<Utc>, _>(7)?,
    })
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        // every pooled connection to an in-memory database would see its own
        // empty schema
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn load_public_server_token(&self, server_url: &ServerUrl) -> Result<Option<String>> {
        let row = sqlx::query("SELECT token FROM public_server_tokens WHERE server_url = ?")
            .bind(server_url.as_str())
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("failed to load token for {server_url}"))?;
        Ok(row.map(|r| r.get::<String, _>(0)))
    }

    pub async fn save_public_server_token(&self, server_url: &ServerUrl, token: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO public_server_tokens (server_url, token, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(server_url) DO UPDATE SET token = excluded.token, updated_at = excluded.updated_at",
        )
        .bind(server_url.as_str())
        .bind(token)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to save token for {server_url}"))?;
        Ok(())
    }

    pub async fn delete_public_server_token(&self, server_url: &ServerUrl) -> Result<bool> {
        let result = sqlx::query("DELETE FROM public_server_tokens WHERE server_url = ?")
            .bind(server_url.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn list_public_server_tokens(&self) -> Result<Vec<StoredServerToken>> {
        let rows = sqlx::query(
            "SELECT server_url, token, updated_at FROM public_server_tokens ORDER BY server_url",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| -> Result<StoredServerToken> {
                Ok(StoredServerToken {
                    server_url: r.try_get::<String, _>(0)?,
                    token: r.try_get::<String, _>(1)?,
                    updated_at: r.try_get::<DateTime<Utc>, _>(2)?,
                })
            })
            .collect()
    }

    /// Registers a conversation for a public channel. Re-registering keeps the
    /// stored cursor and metadata.
    pub async fn upsert_public_conversation(
        &self,
        conversation_id: &ConversationId,
        server_url: &ServerUrl,
        channel_id: ChannelId,
    ) -> Result<StoredConversation> {
        sqlx::query(
            "INSERT INTO public_conversations (conversation_id, server_url, channel_id, updated_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(conversation_id) DO UPDATE SET
                server_url = excluded.server_url,
                channel_id = excluded.channel_id,
                updated_at = excluded.updated_at",
        )
        .bind(conversation_id.as_str())
        .bind(server_url.as_str())
        .bind(channel_id.0)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to register conversation {conversation_id}"))?;

        self.get_public_conversation(conversation_id)
            .await?
            .with_context(|| format!("conversation {conversation_id} vanished after upsert"))
    }

    pub async fn get_public_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Option<StoredConversation>> {
        let row = sqlx::query(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM public_conversations WHERE conversation_id = ?"
        ))
        .bind(conversation_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(conversation_from_row).transpose()
    }

    pub async fn list_public_conversations(&self) -> Result<Vec<StoredConversation>> {
        let rows = sqlx::query(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM public_conversations ORDER BY server_url, channel_id"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(conversation_from_row).collect()
    }

    pub async fn last_retrieved_message(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Option<MessageId>> {
        let row = sqlx::query(
            "SELECT last_retrieved_message FROM public_conversations WHERE conversation_id = ?",
        )
        .bind(conversation_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row
            .and_then(|r| r.get::<Option<i64>, _>(0))
            .map(MessageId))
    }

    pub async fn set_last_retrieved_message(
        &self,
        conversation_id: &ConversationId,
        message_id: Option<MessageId>,
    ) -> Result<()> {
        self.update_conversation_column(
            conversation_id,
            "last_retrieved_message",
            message_id.map(|id| id.0),
        )
        .await
    }

    pub async fn set_conversation_moderator(
        &self,
        conversation_id: &ConversationId,
        moderator: bool,
    ) -> Result<()> {
        self.update_conversation_column(conversation_id, "moderator", moderator)
            .await
    }

    pub async fn set_conversation_display_name(
        &self,
        conversation_id: &ConversationId,
        display_name: &str,
    ) -> Result<()> {
        self.update_conversation_column(conversation_id, "display_name", display_name.to_string())
            .await
    }

    pub async fn set_conversation_avatar(
        &self,
        conversation_id: &ConversationId,
        avatar: &str,
    ) -> Result<()> {
        self.update_conversation_column(conversation_id, "avatar", avatar.to_string())
            .await
    }

    async fn update_conversation_column<T>(
        &self,
        conversation_id: &ConversationId,
        column: &'static str,
        value: T,
    ) -> Result<()>
    where
        T: for<'q> sqlx::Encode<'q, Sqlite> + sqlx::Type<Sqlite> + Send + 'static,
    {
        let sql = format!(
            "UPDATE public_conversations SET {column} = ?, updated_at = ? WHERE conversation_id = ?"
        );
        let result = sqlx::query(&sql)
            .bind(value)
            .bind(Utc::now())
            .bind(conversation_id.as_str())
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to update {column} for {conversation_id}"))?;
        if result.rows_affected() == 0 {
            anyhow::bail!("unknown public conversation {conversation_id}");
        }
        Ok(())
    }

    pub async fn set_local_profile_name(&self, profile_name: Option<&str>) -> Result<()> {
        sqlx::query(
            "INSERT INTO local_profile (id, profile_name, updated_at) VALUES (1, ?, ?)
             ON CONFLICT(id) DO UPDATE SET profile_name = excluded.profile_name, updated_at = excluded.updated_at",
        )
        .bind(profile_name)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .context("failed to save local profile name")?;
        Ok(())
    }

    pub async fn local_profile_name(&self) -> Result<Option<String>> {
        let row = sqlx::query("SELECT profile_name FROM local_profile WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.and_then(|r| r.get::<Option<String>, _>(0)))
    }

    pub async fn save_identity_key(&self, label: &str, secret_bytes: &[u8]) -> Result<()> {
        sqlx::query(
            "INSERT INTO local_identity_keys (label, secret_bytes) VALUES (?, ?)
             ON CONFLICT(label) DO UPDATE SET secret_bytes = excluded.secret_bytes",
        )
        .bind(label)
        .bind(secret_bytes)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to save identity key '{label}'"))?;
        Ok(())
    }

    pub async fn load_identity_key(&self, label: &str) -> Result<Option<Vec<u8>>> {
        let row = sqlx::query("SELECT secret_bytes FROM local_identity_keys WHERE label = ?")
            .bind(label)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<Vec<u8>, _>(0)))
    }
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url.contains(":memory:") || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
