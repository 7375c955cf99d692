use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use client_core::{ChallengeDecryptor, LocalIdentity};
use shared::domain::{ChannelId, ConversationId, ServerUrl};
use storage::Storage;

#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, default_value = "sqlite://./data/public_chat.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Persisted bearer tokens.
    Tokens {
        #[command(subcommand)]
        action: TokenAction,
    },
    /// Registered public conversations and their cursors.
    Conversations {
        #[command(subcommand)]
        action: ConversationAction,
    },
    Profile {
        #[command(subcommand)]
        action: ProfileAction,
    },
    Identity {
        #[command(subcommand)]
        action: IdentityAction,
    },
}

#[derive(Subcommand, Debug)]
enum TokenAction {
    List,
    Clear { server_url: String },
}

#[derive(Subcommand, Debug)]
enum ConversationAction {
    List,
    Add {
        server_url: String,
        channel_id: i64,
        conversation_id: String,
    },
}

#[derive(Subcommand, Debug)]
enum ProfileAction {
    /// Sets the name pushed to servers; omit NAME to clear it.
    SetName { name: Option<String> },
}

#[derive(Subcommand, Debug)]
enum IdentityAction {
    Show {
        #[arg(long, default_value = "default")]
        label: String,
    },
}

fn redact(token: &str) -> String {
    let visible: String = token.chars().take(6).collect();
    format!("{visible}…")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let storage = Storage::new(&cli.database_url).await?;

    match cli.command {
        Command::Tokens { action } => match action {
            TokenAction::List => {
                for stored in storage.list_public_server_tokens().await? {
                    println!(
                        "{} token={} updated_at={}",
                        stored.server_url,
                        redact(&stored.token),
                        stored.updated_at.to_rfc3339()
                    );
                }
            }
            TokenAction::Clear { server_url } => {
                let server_url = ServerUrl::new(&server_url);
                if storage.delete_public_server_token(&server_url).await? {
                    println!("cleared token for {server_url}");
                } else {
                    println!("no token stored for {server_url}");
                }
            }
        },
        Command::Conversations { action } => match action {
            ConversationAction::List => {
                for conversation in storage.list_public_conversations().await? {
                    println!("{}", serde_json::to_string(&conversation)?);
                }
            }
            ConversationAction::Add {
                server_url,
                channel_id,
                conversation_id,
            } => {
                let stored = storage
                    .upsert_public_conversation(
                        &ConversationId::new(conversation_id),
                        &ServerUrl::new(&server_url),
                        ChannelId(channel_id),
                    )
                    .await?;
                println!(
                    "registered conversation_id={} server_url={} channel_id={}",
                    stored.conversation_id, stored.server_url, stored.channel_id
                );
            }
        },
        Command::Profile {
            action: ProfileAction::SetName { name },
        } => {
            storage.set_local_profile_name(name.as_deref()).await?;
            match name {
                Some(name) => println!("profile name set to {name}"),
                None => println!("profile name cleared"),
            }
        }
        Command::Identity {
            action: IdentityAction::Show { label },
        } => {
            let Some(secret) = storage.load_identity_key(&label).await? else {
                println!("no identity stored under '{label}'");
                return Ok(());
            };
            let Ok(bytes) = <[u8; 32]>::try_from(secret.as_slice()) else {
                bail!("identity '{label}' is {} bytes, expected 32", secret.len());
            };
            let identity = LocalIdentity::from_bytes(bytes);
            println!("{label}: {}", identity.public_key_hex());
        }
    }

    Ok(())
}
