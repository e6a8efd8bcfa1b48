//! Huddle Server - Main Entry Point
//!
//! TCP listener for session chat and call signaling relay.

use anyhow::Result;
use clap::Parser;
use log::{error, info, warn};
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use uuid::Uuid;

use huddle::protocol::{ClientEvent, ServerEvent, MAX_FRAME_BYTES};
use huddle::router::{MessageDraft, MessageRouter};
use huddle::session::SessionRegistry;
use huddle::signaling::SignalingCoordinator;
use huddle::snapshot::{SnapshotDoc, SnapshotStore};
use huddle::ServerConfig;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "huddle-server")]
#[command(about = "Huddle Server - session chat and call signaling")]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config/server.toml")]
    config: PathBuf,

    /// Override host to bind to
    #[arg(long)]
    host: Option<String>,

    /// Override listening port
    #[arg(short, long)]
    port: Option<u16>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Per-connection state kept outside the registry: the display name the
/// connection last joined with.
struct ClientState {
    username: Option<String>,
}

/// Shared server state
struct ServerState {
    registry: Arc<SessionRegistry>,
    router: MessageRouter,
    coordinator: SignalingCoordinator,
    store: SnapshotStore,
}

impl ServerState {
    fn new(snapshot_path: PathBuf) -> Self {
        let registry = Arc::new(SessionRegistry::new());
        Self {
            router: MessageRouter::new(registry.clone()),
            coordinator: SignalingCoordinator::new(registry.clone()),
            store: SnapshotStore::new(snapshot_path),
            registry,
        }
    }

    fn persist(&self) {
        let doc = SnapshotDoc::capture(&self.registry);
        if let Err(e) = self.store.store(&doc) {
            error!("Snapshot write failed: {}", e);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&args.log_level))
        .init();

    // Load configuration
    let config = if args.config.exists() {
        ServerConfig::from_file(args.config.to_str().unwrap())?
    } else {
        info!("Config file not found, using defaults");
        ServerConfig::default()
    };

    let host = args.host.unwrap_or(config.host.clone());
    let port = args.port.unwrap_or(config.port);

    let state = Arc::new(ServerState::new(config.snapshot_path.clone()));

    // Restore durable state from the last run.
    match state.store.load() {
        Ok(doc) => doc.restore(&state.registry),
        Err(e) => warn!("Snapshot load failed, starting empty: {}", e),
    }

    // Periodic maintenance: snapshot, idle-session GC, stale typing flags.
    let maintenance_state = state.clone();
    let snapshot_interval = config.snapshot_interval();
    let session_retention = config.session_retention();
    let typing_timeout = config.typing_timeout();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(snapshot_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            maintenance_state.registry.sweep_typing(typing_timeout);
            maintenance_state.registry.sweep_idle(session_retention);
            maintenance_state.persist();
        }
    });

    // Bind TCP listener
    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!("Huddle server listening on {}", addr);

    // Accept connections until shutdown
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer_addr) = accepted?;
                let state = state.clone();
                tokio::spawn(async move {
                    info!("New connection from {}", peer_addr);
                    if let Err(e) = handle_client(stream, peer_addr, state).await {
                        error!("Client {} error: {}", peer_addr, e);
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down, writing final snapshot");
                state.persist();
                break;
            }
        }
    }

    Ok(())
}

/// Handle a connected client
async fn handle_client(
    stream: TcpStream,
    peer_addr: SocketAddr,
    state: Arc<ServerState>,
) -> Result<()> {
    let conn_id = Uuid::new_v4().to_string();
    let client_state = Arc::new(RwLock::new(ClientState { username: None }));

    // The writer task owns the socket's write half; every handler delivers
    // through this channel and never blocks on I/O.
    let (outbox, mut outbox_rx) = mpsc::unbounded_channel::<ServerEvent>();

    let (read_half, mut write_half) = stream.into_split();
    let writer_task = tokio::spawn(async move {
        while let Some(event) = outbox_rx.recv().await {
            if let Ok(data) = event.to_framed() {
                if write_half.write_all(&data).await.is_err() {
                    break;
                }
            }
        }
    });

    let mut read_stream = read_half;
    loop {
        // Read event length (4 bytes)
        let mut len_buf = [0u8; 4];
        if read_stream.read_exact(&mut len_buf).await.is_err() {
            break;
        }

        let msg_len = u32::from_be_bytes(len_buf) as usize;
        if msg_len > MAX_FRAME_BYTES {
            error!("Frame too large from {} ({} bytes)", peer_addr, msg_len);
            break;
        }

        // Read event body
        let mut msg_buf = vec![0u8; msg_len];
        if read_stream.read_exact(&mut msg_buf).await.is_err() {
            break;
        }

        match ClientEvent::from_bytes(&msg_buf) {
            Ok(event) => handle_event(event, &conn_id, &client_state, &state, &outbox),
            Err(e) => {
                error!("Invalid event from {}: {}", peer_addr, e);
                let _ = outbox.send(ServerEvent::Error {
                    message: "Invalid event format".to_string(),
                });
            }
        }
    }

    // Cleanup: leaving broadcasts user_left/count updates where needed.
    let left = state.registry.leave(&conn_id);
    if !left.is_empty() {
        state.persist();
    }
    writer_task.abort();
    info!("Client {} disconnected", peer_addr);

    Ok(())
}

/// Dispatch one client event
fn handle_event(
    event: ClientEvent,
    conn_id: &str,
    client_state: &Arc<RwLock<ClientState>>,
    state: &Arc<ServerState>,
    outbox: &mpsc::UnboundedSender<ServerEvent>,
) {
    match event {
        ClientEvent::JoinSession {
            session_id,
            username,
            participant_id,
        } => {
            client_state.write().username = Some(username.clone());
            let outcome = state.registry.join(
                &session_id,
                conn_id,
                &username,
                participant_id.as_deref(),
                outbox.clone(),
            );
            let _ = outbox.send(ServerEvent::SessionJoined {
                success: true,
                session_id: Some(session_id.clone()),
                participant_id: Some(outcome.participant_id),
                error: None,
            });
            // History replay, filtered for this user's eyes.
            let _ = outbox.send(ServerEvent::MessageHistory {
                session_id: session_id.clone(),
                messages: state.router.history_for(&session_id, &username),
            });
        }

        ClientEvent::LeaveSession => {
            let left = state.registry.leave(conn_id);
            if !left.is_empty() {
                state.persist();
            }
        }

        ClientEvent::SendMessage {
            session_id,
            content,
            reply_to,
            is_private,
            target_user,
        } => {
            let sender_name = client_state
                .read()
                .username
                .clone()
                .unwrap_or_else(|| "Unknown".to_string());
            state.router.publish(
                &session_id,
                conn_id,
                &sender_name,
                MessageDraft {
                    content,
                    reply_to,
                    is_private,
                    target_user,
                },
            );
        }

        ClientEvent::TypingStart {
            session_id,
            username,
        } => {
            state.registry.set_typing(&session_id, &username, true);
        }

        ClientEvent::TypingStop {
            session_id,
            username,
        } => {
            state.registry.set_typing(&session_id, &username, false);
        }

        ClientEvent::CallSignal(signal) => {
            if let Err(e) = state.coordinator.relay(conn_id, signal) {
                warn!("Signal rejected from {}: {}", conn_id, e);
                let _ = outbox.send(ServerEvent::SignalError {
                    kind: e.kind(),
                    reason: e.to_string(),
                });
            }
        }
    }
}
