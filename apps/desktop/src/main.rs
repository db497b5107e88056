use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use client_core::{
    load_settings, CacheNotification, ChatEngine, ClientEvent, ListKind, QueryKey, Session,
};
use shared::domain::{ThreadKey, UserId};
use storage::Storage;
use tokio_stream::{wrappers::BroadcastStream, StreamExt};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Args {
    #[arg(long)]
    user_id: String,
    #[arg(long, default_value = "")]
    display_name: String,
    #[arg(long)]
    access_token: String,
    /// Overrides `api_url` from the settings file.
    #[arg(long)]
    api_url: Option<String>,
    #[arg(long)]
    database_url: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print both thread lists.
    Threads,
    /// Send one text message and wait for the backend to confirm it.
    Send { thread: String, text: String },
    /// Follow realtime events until interrupted.
    Watch {
        #[arg(long)]
        thread: Option<String>,
    },
}

fn parse_thread(raw: &str) -> Result<ThreadKey> {
    let (kind, id) = raw
        .split_once(':')
        .ok_or_else(|| anyhow!("thread must look like direct:<id> or group:<id>, got '{raw}'"))?;
    ThreadKey::from_parts(kind, id).ok_or_else(|| anyhow!("unknown thread kind '{kind}'"))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();
    let args = Args::parse();

    let mut settings = load_settings();
    if let Some(api_url) = args.api_url {
        settings.api_url = api_url;
    }
    if let Some(database_url) = args.database_url {
        settings.database_url = database_url;
    }
    let storage = Storage::new(&settings.database_url)
        .await
        .with_context(|| format!("failed to open {}", settings.database_url))?;

    let display_name = if args.display_name.is_empty() {
        args.user_id.clone()
    } else {
        args.display_name
    };
    let session = Session {
        user_id: UserId::new(args.user_id),
        display_name,
        avatar_url: None,
        access_token: Some(args.access_token),
    };
    let engine = ChatEngine::new(settings, session, storage);
    engine.bootstrap().await?;

    match args.command {
        Command::Threads => print_threads(&engine),
        Command::Send { thread, text } => send(&engine, parse_thread(&thread)?, &text).await?,
        Command::Watch { thread } => {
            let thread = thread.as_deref().map(parse_thread).transpose()?;
            watch(&engine, thread).await?;
        }
    }

    engine.shutdown().await;
    Ok(())
}

fn print_threads(engine: &ChatEngine) {
    for kind in [ListKind::Conversations, ListKind::Groups] {
        println!("{kind:?}:");
        for summary in engine.thread_list(kind) {
            let preview = summary
                .last_message
                .as_ref()
                .map(|preview| preview.content.as_str())
                .unwrap_or_default();
            let pin = if summary.is_pinned { "*" } else { " " };
            println!(
                "{pin} {:<24} {:>3} unread  {} | {preview}",
                summary.thread, summary.unread_count, summary.title
            );
        }
    }
}

async fn send(engine: &Arc<ChatEngine>, thread: ThreadKey, text: &str) -> Result<()> {
    let mut events = engine.subscribe_events();
    let mut changes = engine.cache().subscribe();
    engine.select_thread(Some(thread.clone())).await?;
    let provisional = engine.send_text(&thread, text).await?;
    info!(thread = %thread, message_id = %provisional, "send: waiting for confirmation");

    let confirmed = tokio::time::timeout(Duration::from_secs(15), async {
        loop {
            tokio::select! {
                event = events.recv() => {
                    if let Ok(ClientEvent::SendFailed { message_id, error, .. }) = event {
                        if message_id == provisional {
                            return Err(anyhow!("send failed: {error}"));
                        }
                    }
                }
                change = changes.recv() => {
                    if let Ok(CacheNotification::Updated(QueryKey::Messages(updated))) = change {
                        if updated == thread
                            && !engine.messages(&thread).iter().any(|m| m.id == provisional)
                        {
                            return Ok(());
                        }
                    }
                }
            }
        }
    })
    .await
    .context("timed out waiting for the backend")?;
    confirmed?;

    if let Some(message) = engine.messages(&thread).last() {
        println!("sent {} at {}", message.id, message.created_at.to_rfc3339());
    }
    Ok(())
}

async fn watch(engine: &Arc<ChatEngine>, thread: Option<ThreadKey>) -> Result<()> {
    engine.connect_realtime().await?;
    if thread.is_some() {
        engine.select_thread(thread).await?;
    }

    let mut events = BroadcastStream::new(engine.subscribe_events());
    let mut changes = engine.cache().subscribe();
    let mut last_shown: HashMap<ThreadKey, String> = HashMap::new();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("watch: interrupted");
                return Ok(());
            }
            next = events.next() => match next {
                Some(Ok(event)) => print_event(&event),
                Some(Err(err)) => warn!(error = %err, "watch: skipped events"),
                None => return Ok(()),
            },
            change = changes.recv() => {
                if let Ok(CacheNotification::Updated(QueryKey::Messages(updated))) = change {
                    print_newest(engine, &updated, &mut last_shown);
                }
            }
        }
    }
}

fn print_newest(engine: &ChatEngine, thread: &ThreadKey, last_shown: &mut HashMap<ThreadKey, String>) {
    let Some(newest) = engine.messages(thread).pop() else {
        return;
    };
    if newest.is_provisional() || last_shown.get(thread) == Some(&newest.id.0) {
        return;
    }
    println!(
        "[{thread}] {} ({:?}): {}",
        newest.sender_id,
        newest.status,
        newest.preview_text()
    );
    last_shown.insert(thread.clone(), newest.id.0);
}

fn print_event(event: &ClientEvent) {
    match event {
        ClientEvent::TypingChanged { thread, label, .. } => {
            println!("[{thread}] {}", label.as_deref().unwrap_or("nobody is typing"));
        }
        ClientEvent::TransportStatus(status) => println!("realtime: {status:?}"),
        ClientEvent::SendFailed {
            thread, message_id, error,
        }
        | ClientEvent::EditFailed {
            thread, message_id, error,
        }
        | ClientEvent::QueuedSendDropped {
            thread, message_id, error,
        } => println!("[{thread}] {message_id} failed: {error}"),
        ClientEvent::SearchFailed { query, error } => println!("search '{query}' failed: {error}"),
        ClientEvent::Error(message) => println!("error: {message}"),
    }
}
