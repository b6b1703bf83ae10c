use anyhow::{Context, Result};
use chrono::Duration;
use clap::{Parser, Subcommand};
use client_core::config::{load_settings, normalize_database_url};
use shared::domain::{Actor, ActorId, ConversationKey};
use storage::{Storage, CURRENT_ACTOR_KEY};

#[derive(Parser, Debug)]
struct Cli {
    /// Defaults to the client's configured cache.
    #[arg(long)]
    database_url: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Delete cached messages older than the retention window.
    Purge {
        #[arg(long, default_value_t = 180)]
        minutes: i64,
    },
    /// Delete every cached message; the actor record is kept.
    Clear,
    Rooms,
    Direct {
        actor_id: String,
    },
    /// Print a conversation, e.g. `room:general` or `direct:u42`.
    Dump {
        key: String,
        #[arg(long, default_value_t = 100)]
        limit: u32,
    },
    Whoami,
    Forget,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let database_url = match cli.database_url {
        Some(url) => normalize_database_url(&url),
        None => load_settings().database_url,
    };
    let storage = Storage::new(&database_url).await?;
    let retention = Duration::minutes(load_settings().retention_minutes);

    match cli.command {
        Command::Purge { minutes } => {
            let purged = storage.purge_older_than(Duration::minutes(minutes)).await?;
            println!("purged {purged} messages older than {minutes} minutes");
        }
        Command::Clear => {
            storage.clear_all().await?;
            println!("cleared cached messages");
        }
        Command::Rooms => {
            for (room_id, count) in storage.list_cached_rooms().await? {
                println!("{room_id}\t{count}");
            }
        }
        Command::Direct { actor_id } => {
            let conversations = storage
                .list_direct_conversations(&ActorId::new(actor_id), retention)
                .await?;
            for conversation in conversations {
                println!(
                    "{}\t{} messages",
                    conversation.peer_id,
                    conversation.messages.len()
                );
            }
        }
        Command::Dump { key, limit } => {
            let key: ConversationKey = key.parse()?;
            for message in storage.query_conversation(&key, retention, limit).await? {
                println!(
                    "{}\t{}\t<{}> {}",
                    message.timestamp.to_rfc3339(),
                    message.id,
                    message.sender_alias,
                    message.text
                );
            }
        }
        Command::Whoami => match storage.get_setting(CURRENT_ACTOR_KEY).await? {
            Some(raw) => {
                let actor: Actor =
                    serde_json::from_str(&raw).context("stored actor record is malformed")?;
                println!(
                    "{} ({}){}",
                    actor.display_name,
                    actor.id,
                    if actor.is_anonymous { " anonymous" } else { "" }
                );
            }
            None => println!("no actor record"),
        },
        Command::Forget => {
            storage.delete_setting(CURRENT_ACTOR_KEY).await?;
            println!("actor record removed");
        }
    }

    Ok(())
}
