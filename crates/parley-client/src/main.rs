//! # parley
//!
//! Line-oriented terminal client.
//!
//! Resumes the stored session or logs in with `PARLEY_EMAIL` /
//! `PARLEY_PASSWORD`, then reads commands from stdin. Any line that is not a
//! command is sent to the open conversation.

use std::sync::Arc;

use anyhow::{bail, Context};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

use parley_client::{ClientConfig, Client, Collaborators, CoreEvent, CoreSettings, SyncCore};
use parley_net::{HttpApi, SocketConfig, WebSocketConnector};
use parley_shared::UserId;
use parley_store::{Database, SqliteSessionStore};

const HELP: &str = "\
/peers            list conversations, most recent first
/open <id>        open the conversation with a peer
/close            close the open conversation
/search <term>    filter peers by name
/whois <id>       show a peer's profile
/logout           forget the session and exit
/quit             exit, keeping the session";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Tracing and configuration
    // -----------------------------------------------------------------------
    parley_client::init_tracing();
    info!("Starting Parley v{}", env!("CARGO_PKG_VERSION"));

    let config = ClientConfig::from_env();
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 2. Collaborators
    // -----------------------------------------------------------------------
    let api = Arc::new(HttpApi::new(&config.api_url).context("invalid PARLEY_API_URL")?);

    let mut socket = SocketConfig::new(config.socket_url.clone());
    socket.backoff_initial = config.backoff_initial;
    socket.backoff_max = config.backoff_max;

    let db = match &config.session_db {
        Some(path) => Database::open_at(path),
        None => Database::new(),
    }
    .context("failed to open session database")?;

    let client = Client::new(
        Collaborators {
            auth: api.clone(),
            history: api.clone(),
            directory: api,
            sessions: Arc::new(SqliteSessionStore::new(db)),
            connector: Arc::new(WebSocketConnector::new(socket)),
        },
        CoreSettings::from(&config),
    );

    // -----------------------------------------------------------------------
    // 3. Session
    // -----------------------------------------------------------------------
    let _events = client.subscribe(print_event);

    let identity = match client.resume().await? {
        Some(identity) => identity,
        None => {
            let (Some(email), Some(password)) = (&config.email, &config.password) else {
                bail!("no stored session; set PARLEY_EMAIL and PARLEY_PASSWORD to log in");
            };
            client.login(email, password).await?
        }
    };
    println!("Signed in as {} ({})", identity.display_name, identity.id);
    println!("{HELP}");

    // -----------------------------------------------------------------------
    // 4. Command loop
    // -----------------------------------------------------------------------
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let Some(core) = client.core() else {
            println!("Session ended.");
            break;
        };

        let line = line.trim();
        let (command, arg) = line.split_once(' ').unwrap_or((line, ""));
        let arg = arg.trim();

        match command {
            "" => {}
            "/help" => println!("{HELP}"),
            "/peers" => print_peers(&core, &core.sorted_peers()),
            "/search" => print_peers(&core, &core.search_peers(arg)),
            "/open" if !arg.is_empty() => {
                if let Err(e) = core.select_peer(UserId::new(arg)).await {
                    println!("Could not load history: {e}");
                }
                for message in core.messages() {
                    println!("{}", render(&message, &core));
                }
            }
            "/close" => core.clear_active_peer(),
            "/whois" if !arg.is_empty() => match core.peer_profile(&UserId::new(arg)).await {
                Ok(peer) => println!(
                    "{} <{}> {}",
                    peer.display_name,
                    peer.email.as_deref().unwrap_or("-"),
                    if core.is_online(&peer.id) { "online" } else { "offline" }
                ),
                Err(e) => println!("{e}"),
            },
            "/logout" => {
                client.logout()?;
                break;
            }
            "/quit" => break,
            cmd if cmd.starts_with('/') => println!("Unknown command. /help lists them."),
            _ => {
                core.compose_keystroke();
                match core.send_message(line) {
                    Ok(Some(_)) => {}
                    Ok(None) => println!("Open a conversation first (/open <id>)."),
                    Err(e) => println!("Not sent: {e}"),
                }
            }
        }
    }

    info!("Parley exiting");
    Ok(())
}

fn print_event(event: &CoreEvent) {
    match event {
        CoreEvent::MessageReceived(message) => {
            println!("[{}] {}: {}", message.created_at.format("%H:%M"), message.sender_id, message.body);
        }
        CoreEvent::TypingChanged { peer, typing: true } => println!("{peer} is typing..."),
        CoreEvent::ConnectionChanged(state) => println!("-- connection {state:?}"),
        CoreEvent::SessionExpired => println!("-- session expired, please log in again"),
        CoreEvent::LoggedOut => println!("-- logged out"),
        _ => {}
    }
}

fn print_peers(core: &SyncCore, peers: &[parley_shared::Peer]) {
    for peer in peers {
        let marker = if core.is_online(&peer.id) { '*' } else { ' ' };
        let preview = core
            .last_message(&peer.id)
            .map(|m| m.body)
            .unwrap_or_default();
        println!("{marker} {:<24} {:<12} {}", peer.display_name, peer.id.short(), preview);
    }
}

fn render(message: &parley_shared::Message, core: &SyncCore) -> String {
    let who = if message.sender_id == core.identity().id {
        "me".to_string()
    } else {
        message.sender_id.to_string()
    };
    let pending = if message.pending { " (sending)" } else { "" };
    format!("[{}] {who}: {}{pending}", message.created_at.format("%H:%M"), message.body)
}
