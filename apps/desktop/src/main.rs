use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::Parser;
use client_core::{
    config::{load_settings_from, normalize_database_url, DEFAULT_SETTINGS_FILE},
    ChatEngine, ClientEvent, ConnectionState, UiCommand,
};
use shared::domain::{Actor, ActorId, ConversationKey, MessageId, ProfileFields};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::{broadcast, mpsc},
};
use tracing::warn;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser, Debug)]
struct Args {
    #[arg(long, default_value = DEFAULT_SETTINGS_FILE)]
    config: PathBuf,
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    tenant: Option<String>,
    #[arg(long)]
    database_url: Option<String>,
    /// Join anonymously under this alias when no session resolves.
    #[arg(long)]
    alias: Option<String>,
    #[arg(long, default_value = "general")]
    room: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();

    let mut settings = load_settings_from(&args.config);
    if let Some(server_url) = args.server_url {
        settings.server_url = server_url;
    }
    if let Some(tenant) = args.tenant {
        settings.tenant_slug = tenant;
    }
    if let Some(database_url) = args.database_url {
        settings.database_url = normalize_database_url(&database_url);
    }

    let (mut engine, transport_events) = ChatEngine::from_settings(&settings).await?;
    let actor = match engine.session_changed().await {
        Some(actor) => actor,
        None => match args.alias {
            Some(alias) => {
                let provisional = ActorId::new(format!("anon-{}", Uuid::new_v4()));
                engine.login(Actor::anonymous(provisional, alias)).await
            }
            None => bail!("no session found; pass --alias to join anonymously"),
        },
    };
    println!(
        "joined tenant '{}' as {} ({})",
        settings.tenant_slug, actor.display_name, actor.id
    );

    let events = engine.subscribe_events();
    let (commands, commands_rx) = mpsc::channel(64);
    let engine_task = tokio::spawn(async move { engine.run(commands_rx, transport_events).await });
    let printer = tokio::spawn(print_events(events));

    let mut current = ConversationKey::room(args.room);
    commands
        .send(UiCommand::OpenConversation(current.clone()))
        .await?;
    commands.send(UiCommand::Focus(current.clone())).await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (command, rest) = line
            .split_once(' ')
            .map(|(command, rest)| (command, rest.trim()))
            .unwrap_or((line, ""));
        match command {
            "/quit" => break,
            "/logout" => {
                commands.send(UiCommand::Logout).await?;
                break;
            }
            "/alias" if !rest.is_empty() => {
                commands
                    .send(UiCommand::UpdateProfile(ProfileFields {
                        display_name: Some(rest.to_string()),
                        ..ProfileFields::default()
                    }))
                    .await?;
            }
            "/room" if !rest.is_empty() => {
                current = ConversationKey::room(rest);
                commands
                    .send(UiCommand::OpenConversation(current.clone()))
                    .await?;
                commands.send(UiCommand::Focus(current.clone())).await?;
            }
            "/dm" if !rest.is_empty() => {
                let (peer_id, name) = rest.split_once(' ').unwrap_or((rest, rest));
                let peer = Actor::anonymous(ActorId::new(peer_id), name.trim()).summary();
                current = ConversationKey::Direct(peer.id.clone());
                commands.send(UiCommand::StartChat(peer)).await?;
                commands.send(UiCommand::Focus(current.clone())).await?;
            }
            "/hide" => {
                commands
                    .send(UiCommand::HideConversation(current.clone()))
                    .await?;
            }
            "/delete" if !rest.is_empty() => {
                commands
                    .send(UiCommand::RequestDelete {
                        key: current.clone(),
                        message_id: MessageId::new(rest),
                    })
                    .await?;
            }
            other if other.starts_with('/') => {
                println!(
                    "commands: /room <id>, /dm <id> [name], /alias <name>, /hide, \
                     /delete <message id>, /logout, /quit"
                );
            }
            _ => {
                commands
                    .send(UiCommand::Send {
                        key: current.clone(),
                        text: line.to_string(),
                        image_ref: None,
                    })
                    .await?;
            }
        }
    }

    drop(commands);
    if let Err(err) = engine_task.await? {
        warn!("desktop: engine stopped with error: {err:#}");
    }
    printer.abort();
    Ok(())
}

async fn print_events(mut events: broadcast::Receiver<ClientEvent>) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "desktop: event printer fell behind");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };
        match event {
            ClientEvent::ViewChanged { key, messages } => {
                if let Some(last) = messages.last() {
                    println!(
                        "[{key}] {} <{}> {}",
                        last.timestamp.format("%H:%M"),
                        last.sender_alias,
                        last.text
                    );
                }
            }
            ClientEvent::PresenceChanged(snapshot) => {
                println!("* {} online", snapshot.online_actor_ids.len());
            }
            ClientEvent::UnreadChanged { key, count, total } if count > 0 => {
                println!("* {count} unread in {key} ({total} total)");
            }
            ClientEvent::ConnectionChanged(state) => match state {
                ConnectionState::Active => println!("* connected"),
                ConnectionState::Recovering => println!("* disconnected, retrying"),
                ConnectionState::Closed => println!("* offline"),
                _ => {}
            },
            ClientEvent::IdentityChanged(Some(actor)) => {
                println!("* you are {} ({})", actor.display_name, actor.id);
            }
            ClientEvent::IdentityChanged(None) => println!("* signed out"),
            ClientEvent::SendRejected {
                retry_after_ms,
                reason,
            } => match retry_after_ms {
                Some(ms) => println!("! {reason}, retry in {ms} ms"),
                None => println!("! {reason}"),
            },
            ClientEvent::Error(message) => println!("! {message}"),
            _ => {}
        }
    }
}
