use std::io::Write;
use std::sync::Arc;

use anyhow::Context;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

use chat_transport::{
    ChatEvent, ChatSession, ClientConfig, CloseOutcome, ConnectionState, ConversationStore,
    EnvCredentialSource, LogNotificationSink, MemoryConversationStore, RefreshCoordinator, WsConnector,
};

enum Input {
    Message(String),
    FileUpload(Value),
    Quit,
    Empty,
}

fn parse_input(line: &str) -> Result<Input, serde_json::Error> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(Input::Empty);
    }
    if line == "/quit" {
        return Ok(Input::Quit);
    }
    if let Some(json) = line.strip_prefix("/file ") {
        return serde_json::from_str(json).map(Input::FileUpload);
    }
    Ok(Input::Message(line.to_string()))
}

fn render(event: &ChatEvent) {
    match event {
        ChatEvent::Partial(text) if !text.is_empty() => {
            print!("\rassistant> {text}");
            let _ = std::io::stdout().flush();
        }
        ChatEvent::Partial(_) => println!(),
        ChatEvent::Message(message) => println!("{}> {}", message.role, message.content),
        ChatEvent::TitleUpdated { title, .. } => println!("== {title} =="),
        ChatEvent::Typing(true) => println!("(assistant is typing)"),
        ChatEvent::Violation(record) => {
            println!("!! {} (level {})", record.message, record.level.as_u8());
        }
        ChatEvent::Ban(ban) if ban.is_banned => {
            if let Some(until) = ban.banned_until {
                println!("!! sending locked until {}", until.format("%H:%M:%S"));
            }
        }
        ChatEvent::Ban(_) => println!("(sending unlocked)"),
        ChatEvent::Connection(state) => info!("Connection: {state:?}"),
        ChatEvent::Typing(false) => {}
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present (development convenience)
    dotenvy::dotenv().ok();

    // Initialise tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chat_transport=debug".into()),
        )
        .init();

    let conversation_id = std::env::args()
        .nth(1)
        .context("usage: chat-transport <conversation-id>")?;
    let config = ClientConfig::from_env()?;

    // ── Wiring ────────────────────────────────────────────────────────────────
    let credentials = Arc::new(RefreshCoordinator::new(Arc::new(EnvCredentialSource::default())));
    let store = Arc::new(MemoryConversationStore::new());
    let (session, task) = ChatSession::spawn(
        config,
        Arc::new(WsConnector),
        store.clone(),
        Arc::new(LogNotificationSink),
    );

    let mut events = session.subscribe();
    session.open_with(conversation_id.clone(), credentials.as_ref()).await?;
    if session.snapshot().conversation_id.is_none() {
        anyhow::bail!("CHAT_ACCESS_TOKEN must be set (or present in .env)");
    }

    // ── Main loop ─────────────────────────────────────────────────────────────
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut refreshed = false;
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match parse_input(&line) {
                    Ok(Input::Quit) => break,
                    Ok(Input::Empty) => {}
                    Ok(Input::Message(text)) => {
                        session.send_typing().await;
                        if !session.send_message(text).await {
                            println!("(not sent: disconnected or locked out)");
                        }
                    }
                    Ok(Input::FileUpload(file_info)) => {
                        if !session.send_file_upload(file_info).await {
                            println!("(file upload not sent)");
                        }
                    }
                    Err(e) => println!("(invalid file info: {e})"),
                }
            }
            event = events.recv() => match event {
                Ok(ChatEvent::Connection(ConnectionState::Closed(CloseOutcome::Rejected))) => {
                    if refreshed {
                        error!("Session rejected again after refreshing the credential");
                        break;
                    }
                    refreshed = true;
                    warn!("Session rejected; refreshing credential");
                    let token = credentials.refresh().await?;
                    session.open(conversation_id.clone(), token).await?;
                }
                Ok(ChatEvent::Connection(ConnectionState::Closed(CloseOutcome::Exhausted))) => {
                    error!("Reconnect attempts exhausted");
                    break;
                }
                Ok(event) => {
                    if event == ChatEvent::Connection(ConnectionState::Open) {
                        refreshed = false;
                    }
                    render(&event);
                }
                Err(RecvError::Lagged(skipped)) => warn!("Dropped {skipped} events"),
                Err(RecvError::Closed) => break,
            }
        }
    }

    session.shutdown().await?;
    task.await?;

    let history = store.list_messages(&conversation_id).await?;
    info!("Conversation {conversation_id} ended with {} messages", history.len());
    Ok(())
}
