use anyhow::Result;
use clap::Parser;
use client_core::{ChatSession, Credentials, SessionConfig, SessionEvent, UserId};
use shared::{domain::MessageKind, protocol::ChatMessage};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::info;

#[derive(Parser, Debug)]
struct Args {
    /// Chat server base url, e.g. http://localhost:8080
    #[arg(long)]
    server_url: Option<String>,
    /// Bearer token from the login flow.
    #[arg(long)]
    token: Option<String>,
    #[arg(long)]
    user_id: Option<i64>,
    #[arg(long)]
    username: Option<String>,
}

#[derive(Debug)]
struct Settings {
    server_url: String,
    token: Option<String>,
    user_id: Option<i64>,
    username: Option<String>,
}

/// CLI flags win; environment variables fill the gaps.
fn resolve_settings(args: Args) -> Settings {
    let mut settings = Settings {
        server_url: args
            .server_url
            .unwrap_or_else(|| "http://localhost:8080".to_string()),
        token: args.token,
        user_id: args.user_id,
        username: args.username,
    };

    if let Ok(v) = std::env::var("CHAT_SERVER_URL") {
        if settings.server_url == "http://localhost:8080" {
            settings.server_url = v;
        }
    }
    if settings.token.is_none() {
        if let Ok(v) = std::env::var("CHAT_TOKEN") {
            settings.token = Some(v);
        }
    }
    if settings.user_id.is_none() {
        if let Ok(v) = std::env::var("CHAT_USER_ID") {
            settings.user_id = v.parse().ok();
        }
    }
    if settings.username.is_none() {
        if let Ok(v) = std::env::var("CHAT_USERNAME") {
            settings.username = Some(v);
        }
    }

    settings
}

fn print_message(message: &ChatMessage) {
    match message.kind {
        MessageKind::System => println!("-- {}", message.content),
        MessageKind::Chat => println!(
            "[{}] {}: {}",
            message.timestamp.format("%H:%M:%S"),
            message.username,
            message.content
        ),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();
    let args = Args::parse();
    let settings = resolve_settings(args);
    info!(server_url = %settings.server_url, "starting chat client");

    let mut config = SessionConfig::new(&settings.server_url);
    if let (Some(token), Some(user_id), Some(username)) =
        (settings.token, settings.user_id, settings.username)
    {
        config = config.with_credentials(Credentials {
            token,
            user_id: UserId(user_id),
            username,
        });
    }

    let session = ChatSession::new(config);
    let mut events = session.subscribe_events();
    if let Err(err) = session.connect().await {
        eprintln!("! {err}");
    }

    let renderer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(SessionEvent::Connected) => println!("* connected"),
                Ok(SessionEvent::Disconnected { error: Some(err) }) => {
                    println!("* disconnected: {err}")
                }
                Ok(SessionEvent::Disconnected { error: None }) => println!("* disconnected"),
                Ok(SessionEvent::MessageAppended(message)) => print_message(&message),
                Ok(SessionEvent::TimelineReloaded { count }) => {
                    println!("* loaded {count} messages")
                }
                Ok(SessionEvent::TimelineCleared) => println!("* timeline cleared"),
                Ok(SessionEvent::OnlineCount(count)) => println!("* {count} online"),
                Err(RecvError::Lagged(skipped)) => {
                    println!("* renderer lagged, skipped {skipped} events")
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match line.trim() {
            "" => {}
            "/quit" => break,
            "/clear" => session.clear().await,
            _ => {
                if let Err(err) = session.send(&line).await {
                    eprintln!("! send failed: {err}");
                }
            }
        }
    }

    session.disconnect().await;
    renderer.abort();
    Ok(())
}
