use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use client_core::{load_config, ChatClient, ClientEvent, Credential, Draft, LocalId, SessionContext};
use shared::domain::{ConversationRef, GroupId, UserId};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Args {
    #[arg(long)]
    server_url: String,
    #[arg(long)]
    token: String,
    #[arg(long)]
    user_id: i64,
    #[arg(long, default_value = "me")]
    name: String,
    /// TOML file with sync tuning; `CHAT__*` variables override it.
    #[arg(long)]
    config: Option<PathBuf>,
}

enum Command {
    Send(ConversationRef, String),
    Open(ConversationRef),
    Read(ConversationRef),
    Retry(LocalId),
    List,
    Quit,
}

fn parse_target(kind: &str, id: &str) -> Result<ConversationRef> {
    let id: i64 = id.parse().with_context(|| format!("bad id {id:?}"))?;
    match kind {
        "dm" => Ok(ConversationRef::Direct(UserId(id))),
        "group" => Ok(ConversationRef::Group(GroupId(id))),
        other => bail!("unknown conversation kind {other:?}"),
    }
}

fn parse_command(line: &str) -> Result<Command> {
    let mut words = line.splitn(4, ' ');
    let verb = words.next().unwrap_or_default();
    let mut target = || -> Result<ConversationRef> {
        let kind = words.next().context("missing dm|group")?;
        let id = words.next().context("missing id")?;
        parse_target(kind, id)
    };
    match verb {
        "/send" => {
            let conversation = target()?;
            let text = words.next().unwrap_or_default().to_string();
            Ok(Command::Send(conversation, text))
        }
        "/open" => Ok(Command::Open(target()?)),
        "/read" => Ok(Command::Read(target()?)),
        "/retry" => {
            let id = words.next().context("missing local id")?;
            Ok(Command::Retry(LocalId(id.trim_start_matches("local-").parse()?)))
        }
        "/list" => Ok(Command::List),
        "/quit" => Ok(Command::Quit),
        other => bail!("unknown command {other:?}"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let args = Args::parse();

    let config = load_config(args.config.as_deref());
    let session = SessionContext::new(
        UserId(args.user_id),
        args.name,
        Credential::new(args.token),
        args.server_url,
    );
    let client = ChatClient::with_http(session, config)?;

    let mut events = client.subscribe_events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ClientEvent::MessageReceived { conversation, local_id } => {
                    println!("[{conversation}] new message {local_id}");
                }
                ClientEvent::SendFailed { conversation, local_id, reason } => match local_id {
                    Some(id) => println!("[{conversation}] send {id} failed: {reason} (/retry {id})"),
                    None => println!("[{conversation}] send failed: {reason}"),
                },
                ClientEvent::SessionRejected { reason } => println!("session ended: {reason}"),
                ClientEvent::ConversationUpdated { .. } => {}
                other => println!("{other:?}"),
            }
        }
    });

    client.start().await?;
    println!("Connected as user_id={}", client.session().user_id);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let command = match parse_command(line) {
            Ok(command) => command,
            Err(err) => {
                println!("{err}");
                continue;
            }
        };
        match command {
            Command::Send(conversation, text) => {
                match client.send(conversation, Draft::text(text)).await {
                    Ok(local_id) => println!("[{conversation}] {local_id} pending"),
                    Err(failure) => println!("[{conversation}] not sent: {failure}"),
                }
            }
            Command::Open(conversation) => {
                client.select_conversation(conversation).await;
                for message in client.messages(conversation).await {
                    let sender = message
                        .sender_name
                        .clone()
                        .unwrap_or_else(|| message.sender.to_string());
                    println!(
                        "  {} {sender}: {} ({:?})",
                        message.created_at.format("%H:%M"),
                        message.content,
                        message.delivery
                    );
                }
            }
            Command::Read(conversation) => match client.mark_read(conversation).await {
                Ok(count) => println!("[{conversation}] {count} marked read"),
                Err(err) => println!("[{conversation}] {err}"),
            },
            Command::Retry(local_id) => match client.retry(local_id).await {
                Ok(new_id) => println!("{local_id} re-sent as {new_id}"),
                Err(failure) => println!("{local_id} not re-sent: {failure}"),
            },
            Command::List => {
                for row in client.conversation_list().await {
                    let online = if row.online { " *" } else { "" };
                    let typing = if row.typing.is_empty() { "" } else { " (typing)" };
                    println!(
                        "{} {}{online}{typing} [{} unread]",
                        row.conversation, row.title, row.unread
                    );
                }
            }
            Command::Quit => break,
        }
    }

    client.shutdown().await;
    Ok(())
}
