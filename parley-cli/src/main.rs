//! `parley`: terminal client for a relay-backed chat room.
//!
//! Reads lines from stdin and prints room changes as they happen.
//!
//! ```text
//! parley --name alice --room lobby --url ws://localhost:1999/parties/main
//! > hello                 send a message
//! > /edit 3f2a hello!     replace the content of message 3f2a…
//! > /who                  list participants
//! > /read                 mark everything read
//! > /quit                 leave the room
//! ```

use clap::Parser;
use parley_room::{
    mentions, ChatEntry, MemoryStore, RocksStore, RoomSession, RoomStore, RoomView, SessionCommand,
    SessionConfig, SessionHandle, StoreConfig, WsChannel, WsConfig,
};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;

#[derive(Parser)]
#[command(name = "parley")]
#[command(version = "0.1.0")]
#[command(about = "Join a real-time chat room from the terminal")]
struct Args {
    /// Relay base URL; the room id is appended as the last path segment
    #[arg(long, default_value = "ws://localhost:1999/parties/main")]
    url: String,

    /// Room to join
    #[arg(long, default_value = "lobby")]
    room: String,

    /// Display name in the room
    #[arg(long)]
    name: String,

    /// Keep room history in a RocksDB directory (memory only when omitted)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Seconds between presence heartbeats
    #[arg(long, default_value_t = 30)]
    heartbeat_secs: u64,
}

/// Parsed stdin line.
#[derive(Debug, PartialEq)]
enum Input {
    Say(String),
    Edit { id_prefix: String, text: String },
    Who,
    Read,
    Quit,
    Empty,
    Unknown(String),
}

fn parse_input(line: &str) -> Input {
    let line = line.trim();
    if line.is_empty() {
        return Input::Empty;
    }
    if !line.starts_with('/') {
        return Input::Say(line.to_owned());
    }

    let mut parts = line.splitn(3, ' ');
    match parts.next().unwrap_or_default() {
        "/quit" | "/q" => Input::Quit,
        "/who" => Input::Who,
        "/read" => Input::Read,
        "/edit" => match (parts.next(), parts.next()) {
            (Some(id), Some(text)) if !text.trim().is_empty() => Input::Edit {
                id_prefix: id.to_owned(),
                text: text.trim().to_owned(),
            },
            _ => Input::Unknown("usage: /edit <id> <text>".into()),
        },
        other => Input::Unknown(format!("unknown command {other}")),
    }
}

/// Resolve a possibly shortened id against the current log.
fn resolve_id<'a>(entries: &'a [ChatEntry], prefix: &str) -> Option<&'a str> {
    let mut matches = entries.iter().filter(|e| e.id.starts_with(prefix));
    match (matches.next(), matches.next()) {
        (Some(entry), None) => Some(entry.id.as_str()),
        _ => None,
    }
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

fn content_text(content: &Value) -> String {
    match content {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn render_entry(entry: &ChatEntry, local_user: &str) -> String {
    let marker = if entry.pending {
        "…"
    } else if entry.user != local_user && mentions(&entry.content, local_user) {
        "@"
    } else {
        " "
    };
    format!(
        "{marker} [{}] {}: {}",
        short_id(&entry.id),
        entry.user,
        content_text(&entry.content)
    )
}

/// Lines for entries that are new or changed since the last view.
///
/// Ids that left the log (trimmed, or renamed by a relay echo) are forgotten.
fn changed_lines(shown: &mut HashMap<String, (Value, bool)>, view: &RoomView) -> Vec<String> {
    let mut lines = Vec::new();
    for entry in &view.snapshot.messages {
        let state = (entry.content.clone(), entry.pending);
        if shown.get(&entry.id) != Some(&state) {
            lines.push(render_entry(entry, &view.local_user));
            shown.insert(entry.id.clone(), state);
        }
    }
    let live: HashSet<&str> = view.snapshot.messages.iter().map(|e| e.id.as_str()).collect();
    shown.retain(|id, _| live.contains(id.as_str()));
    lines
}

/// Print entries that are new or changed since the last view.
async fn render(mut views: watch::Receiver<RoomView>) {
    let mut shown: HashMap<String, (Value, bool)> = HashMap::new();
    let mut connected = false;

    loop {
        {
            let view = views.borrow_and_update();
            if view.connected != connected {
                connected = view.connected;
                println!("-- {} --", if connected { "connected" } else { "disconnected" });
            }
            for line in changed_lines(&mut shown, &view) {
                println!("{line}");
            }
        }
        if views.changed().await.is_err() {
            break;
        }
    }
}

fn print_roster(view: &RoomView) {
    println!("-- {} in {} --", view.snapshot.participants.len(), view.room_id);
    for p in &view.snapshot.participants {
        let status = if p.is_online() { "online" } else { "offline" };
        println!("   {} ({status})", p.user);
    }
}

async fn handle_line(handle: &SessionHandle, line: &str) -> Result<bool, Box<dyn std::error::Error>> {
    match parse_input(line) {
        Input::Quit => return Ok(false),
        Input::Empty => {}
        Input::Say(text) => handle.say(text).await?,
        Input::Who => print_roster(&handle.current()),
        Input::Read => {
            let last = handle.current().snapshot.messages.last().map(|e| e.id.clone());
            handle.command(SessionCommand::MarkRead(last)).await?;
        }
        Input::Edit { id_prefix, text } => {
            let view = handle.current();
            match resolve_id(&view.snapshot.messages, &id_prefix) {
                Some(id) => {
                    handle
                        .command(SessionCommand::Edit {
                            id: id.to_owned(),
                            content: Value::String(text),
                        })
                        .await?
                }
                None => eprintln!("no single message matches {id_prefix}"),
            }
        }
        Input::Unknown(message) => eprintln!("{message}"),
    }
    Ok(true)
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let store: Arc<dyn RoomStore> = match &args.data_dir {
        Some(dir) => Arc::new(RocksStore::open(StoreConfig::new(dir))?),
        None => Arc::new(MemoryStore::new()),
    };

    let config = SessionConfig {
        heartbeat_interval: Duration::from_secs(args.heartbeat_secs.max(1)),
        ..SessionConfig::default()
    };
    let channel = WsChannel::connect(WsConfig::new(args.url.as_str()), args.room.as_str());
    let handle = RoomSession::enter(args.name.as_str(), config, store, channel).spawn();

    let renderer = tokio::spawn(render(handle.subscribe()));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if !handle_line(&handle, &line).await? {
            break;
        }
    }

    let final_state = handle.leave().await?;
    log::info!("Left with {} messages", final_state.messages.len());
    renderer.abort();
    Ok(())
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    if let Err(e) = run(args).await {
        eprintln!("parley: {e}");
        std::process::exit(1);
    }
}
