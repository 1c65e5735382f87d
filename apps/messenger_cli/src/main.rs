use std::{path::PathBuf, sync::Arc};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use client_core::{
    Bucket, ConversationStore, CurrentUser, HttpMessengerApi, MessageView, OutgoingFile,
    PushConnection, StoreEvent,
};
use shared::domain::{ConversationId, MessageId};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;

use config::{load_settings, Settings};

#[derive(Parser, Debug)]
struct Args {
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    push_url: Option<String>,
    #[arg(long)]
    token: Option<String>,
    #[arg(long)]
    user_id: Option<String>,
    #[arg(long)]
    username: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the active, bot and archived conversations.
    List,
    /// Open a conversation and print its loaded window.
    History {
        #[arg(long)]
        room: String,
        /// Page back this many times after opening.
        #[arg(long, default_value_t = 0)]
        older: u32,
    },
    /// Send text and files to a conversation.
    Send {
        #[arg(long)]
        room: String,
        #[arg(long, default_value = "")]
        text: String,
        #[arg(long)]
        quote: Option<String>,
        #[arg(long = "file")]
        files: Vec<PathBuf>,
    },
    /// Follow the push channel and print store events until interrupted.
    Watch {
        /// Conversation to keep active while watching.
        #[arg(long)]
        room: Option<String>,
    },
}

impl Args {
    fn apply(&self, settings: &mut Settings) {
        if let Some(v) = &self.server_url {
            settings.server_url = v.clone();
        }
        if let Some(v) = &self.push_url {
            settings.push_url = Some(v.clone());
        }
        if let Some(v) = &self.token {
            settings.token = v.clone();
        }
        if let Some(v) = &self.user_id {
            settings.user_id = v.clone();
        }
        if let Some(v) = &self.username {
            settings.username = v.clone();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();

    let mut settings = load_settings();
    args.apply(&mut settings);
    if settings.token.is_empty() {
        bail!("no access token: pass --token or set MESSENGER_TOKEN");
    }
    if settings.user_id.is_empty() {
        bail!("no user id: pass --user-id or set MESSENGER_USER_ID");
    }

    let server_url = settings.server_url()?;
    let api = Arc::new(HttpMessengerApi::new(server_url.clone(), settings.token.clone()));
    let username = if settings.username.is_empty() {
        settings.user_id.clone()
    } else {
        settings.username.clone()
    };
    let user = CurrentUser::new(settings.user_id.as_str(), username);
    let store = ConversationStore::new_with_dependencies(api, user, settings.store_options());

    info!(server_url = %server_url, "loading conversations");
    store.load_conversations().await?;

    match args.command {
        Command::List => print_conversations(&store).await,
        Command::History { room, older } => {
            let room = ConversationId::new(room);
            store.set_active(Some(room.clone())).await?;
            for _ in 0..older {
                if !store.previous_messages(&room).await? {
                    break;
                }
            }
            print_messages(&store.messages(&room).await?);
        }
        Command::Send {
            room,
            text,
            quote,
            files,
        } => {
            let room = ConversationId::new(room);
            let outgoing = read_files(&files).await?;
            let quote = quote.map(MessageId::new);
            store.set_active(Some(room.clone())).await?;
            let keys = store.send(&room, &text, outgoing, quote.as_ref()).await?;
            for key in keys {
                match store.message_by_key(&room, key).await {
                    Some(message) if message.has_error() => {
                        warn!(conversation_id = %room, local_key = %key, "message failed to send");
                    }
                    Some(message) => println!("sent {}", message.id()),
                    None => warn!(conversation_id = %room, local_key = %key, "message was dropped"),
                }
            }
        }
        Command::Watch { room } => {
            if let Some(room) = room {
                store.set_active(Some(ConversationId::new(room))).await?;
            }
            watch(store, &settings).await?;
        }
    }

    Ok(())
}

async fn watch(store: Arc<ConversationStore>, settings: &Settings) -> Result<()> {
    let push_url = settings.push_url()?;
    let cancel = CancellationToken::new();
    let mut events = store.subscribe_events();
    let push = PushConnection::new(push_url.clone(), settings.token.clone())
        .spawn(Arc::clone(&store), cancel.clone());
    info!(push_url = %push_url, "watching for pushes");

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            event = events.recv() => match event {
                Ok(event) => print_event(&store, event).await,
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "store events lagged"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    cancel.cancel();
    push.await.context("push task panicked")?;
    Ok(())
}

async fn print_event(store: &ConversationStore, event: StoreEvent) {
    match event {
        StoreEvent::ConversationsChanged => {
            println!("conversations changed, {} unread", store.unread_total().await);
        }
        StoreEvent::MessagesChanged { conversation_id } => {
            let newest = store
                .messages(&conversation_id)
                .await
                .ok()
                .and_then(|views| views.into_iter().last());
            match newest {
                Some(view) => println!(
                    "[{conversation_id}] {}: {}",
                    view.message.sender.username, view.message.body
                ),
                None => println!("[{conversation_id}] messages changed"),
            }
        }
        StoreEvent::UnreadChanged {
            conversation_id,
            unread,
        } => println!("[{conversation_id}] unread {unread}"),
        StoreEvent::PossibleGap { conversation_id } => {
            println!("[{conversation_id}] pushes may have been missed while offline");
        }
        StoreEvent::Error(message) => warn!(error = %message, "store error"),
    }
}

async fn print_conversations(store: &ConversationStore) {
    for (label, bucket) in [
        ("active", Bucket::Active),
        ("bots", Bucket::Bot),
        ("archived", Bucket::Archived),
    ] {
        let conversations = store.conversations(bucket).await;
        println!("{label} ({})", conversations.len());
        for conversation in conversations {
            let muted = if conversation.muted { " muted" } else { "" };
            println!(
                "  {} {:?} {} unread={}{muted}",
                conversation.id, conversation.kind, conversation.title, conversation.unread
            );
        }
    }
}

fn print_messages(views: &[MessageView]) {
    for view in views {
        if view.is_start_of_new_messages {
            println!("---- new messages ----");
        }
        if view.is_first_of_day {
            println!("== {} ==", view.message.created_at.format("%Y-%m-%d"));
        }
        let message = &view.message;
        let state = if message.has_error() {
            " (failed)"
        } else if message.is_sending() {
            " (sending)"
        } else {
            ""
        };
        let body = if message.deleted {
            "<deleted>"
        } else {
            message.body.as_str()
        };
        println!(
            "{} {} {}: {body}{state}",
            message.created_at.format("%H:%M"),
            message.id(),
            message.sender.username
        );
    }
}

async fn read_files(paths: &[PathBuf]) -> Result<Vec<OutgoingFile>> {
    let mut files = Vec::with_capacity(paths.len());
    for path in paths {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read '{}'", path.display()))?;
        let filename = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        files.push(OutgoingFile {
            mime_type: mime_for(&filename).to_string(),
            filename,
            bytes,
        });
    }
    Ok(files)
}

fn mime_for(filename: &str) -> &'static str {
    let extension = filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match extension.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mp3" => "audio/mpeg",
        "ogg" => "audio/ogg",
        "pdf" => "application/pdf",
        "txt" => "text/plain",
        _ => "application/octet-stream",
    }
}
