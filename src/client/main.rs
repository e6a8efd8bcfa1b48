//! Huddle Interactive Client
//!
//! Terminal client with real-time updates and interactive commands. Call
//! negotiation runs against a loopback transport driver: offers and
//! answers are produced locally and "connect" immediately, so the full
//! signaling exchange and call lifecycle can be exercised end to end
//! without a browser runtime.

use anyhow::Result;
use clap::Parser;
use log::{debug, error, info};
use std::collections::{HashMap, VecDeque};
use std::io::{self, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use huddle::call::{CallManager, CallMedia, CallOutput, LinkAction, LinkTimer};
use huddle::media::DeviceManager;
use huddle::protocol::{ClientEvent, ServerEvent, MAX_FRAME_BYTES};
use huddle::ClientConfig;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "huddle-client")]
#[command(about = "Huddle Interactive Client")]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config/client.toml")]
    config: PathBuf,

    /// Server host
    #[arg(long)]
    host: Option<String>,

    /// Server port
    #[arg(short, long)]
    port: Option<u16>,

    /// Username
    #[arg(short, long)]
    username: Option<String>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// A fired call timer, routed back into the state machine.
#[derive(Debug)]
struct TimerFired {
    peer: String,
    timer: TimerKind,
}

#[derive(Debug, Clone, Copy)]
enum TimerKind {
    Answer,
    Reconnect,
}

/// Pending timer tasks per peer. Starting a timer for a peer replaces the
/// previous one of the same kind.
struct Timers {
    tx: mpsc::UnboundedSender<TimerFired>,
    answer: HashMap<String, JoinHandle<()>>,
    reconnect: HashMap<String, JoinHandle<()>>,
}

impl Timers {
    fn new(tx: mpsc::UnboundedSender<TimerFired>) -> Self {
        Self {
            tx,
            answer: HashMap::new(),
            reconnect: HashMap::new(),
        }
    }

    fn start(&mut self, peer: String, timer: LinkTimer) {
        let (kind, delay, slot) = match timer {
            LinkTimer::Answer(d) => (TimerKind::Answer, d, &mut self.answer),
            LinkTimer::Reconnect(d) => (TimerKind::Reconnect, d, &mut self.reconnect),
        };
        let tx = self.tx.clone();
        let peer_clone = peer.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(TimerFired {
                peer: peer_clone,
                timer: kind,
            });
        });
        if let Some(old) = slot.insert(peer, handle) {
            old.abort();
        }
    }

    fn cancel_answer(&mut self, peer: &str) {
        if let Some(handle) = self.answer.remove(peer) {
            handle.abort();
        }
    }

    fn cancel_all(&mut self, peer: &str) {
        self.cancel_answer(peer);
        if let Some(handle) = self.reconnect.remove(peer) {
            handle.abort();
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
        ClientConfig::from_file(args.config.to_str().unwrap())?
    } else {
        info!("Config file not found, using defaults");
        ClientConfig::default()
    };

    let host = args.host.unwrap_or(config.server_host.clone());
    let port = args.port.unwrap_or(config.port);
    let username = args.username.unwrap_or(config.default_username.clone());

    println!("🚀 Huddle Interactive Client");
    println!("============================");
    println!("Username: {}", username);
    println!("Server: {}:{}", host, port);
    println!();

    // Connect to server
    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    println!("🔌 Connecting to server...");
    let stream = TcpStream::connect(addr).await?;
    println!("✅ Connected to server");

    let (read_half, write_half) = stream.into_split();
    let writer = Arc::new(Mutex::new(write_half));

    // Server events feed the main loop rather than being printed inline,
    // because call envelopes have to reach the state machine.
    let (srv_tx, mut srv_rx) = mpsc::unbounded_channel::<ServerEvent>();
    let mut server_task = tokio::spawn(async move { read_server_events(read_half, srv_tx).await });

    // User input
    let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<String>();
    let input_task = tokio::spawn(async move { handle_user_input(cmd_tx).await });

    // Call timers
    let (timer_tx, mut timer_rx) = mpsc::unbounded_channel::<TimerFired>();
    let mut timers = Timers::new(timer_tx);

    let tuning = config.call.tuning();
    let mut manager: Option<CallManager> = None;
    let mut current_session: Option<String> = None;
    let mut participant_id: Option<String> = None;
    let mut known_users: Vec<String> = Vec::new();

    print_help();
    prompt();

    loop {
        tokio::select! {
            Some(command) = cmd_rx.recv() => {
                let parts: Vec<&str> = command.trim().split_whitespace().collect();
                if parts.is_empty() {
                    prompt();
                    continue;
                }

                match parts[0].to_lowercase().as_str() {
                    "join" => {
                        if parts.len() < 2 {
                            println!("Usage: join <session_id>");
                            prompt();
                            continue;
                        }
                        let session_id = parts[1].to_uppercase();
                        send_event(&writer, &ClientEvent::JoinSession {
                            session_id: session_id.clone(),
                            username: username.clone(),
                            participant_id: participant_id.clone(),
                        }).await?;
                        manager = Some(CallManager::with_tuning(
                            session_id.clone(),
                            username.clone(),
                            DeviceManager::new(),
                            tuning,
                        ));
                        current_session = Some(session_id);
                    },
                    "say" => {
                        let Some(session_id) = current_session.clone() else {
                            println!("Join a session first");
                            prompt();
                            continue;
                        };
                        let content = parts[1..].join(" ");
                        send_event(&writer, &ClientEvent::TypingStart {
                            session_id: session_id.clone(),
                            username: username.clone(),
                        }).await?;
                        send_event(&writer, &ClientEvent::SendMessage {
                            session_id: session_id.clone(),
                            content,
                            reply_to: None,
                            is_private: false,
                            target_user: None,
                        }).await?;
                        send_event(&writer, &ClientEvent::TypingStop {
                            session_id,
                            username: username.clone(),
                        }).await?;
                    },
                    "pm" => {
                        if parts.len() < 3 {
                            println!("Usage: pm <user> <message>");
                            prompt();
                            continue;
                        }
                        let Some(session_id) = current_session.clone() else {
                            println!("Join a session first");
                            prompt();
                            continue;
                        };
                        send_event(&writer, &ClientEvent::SendMessage {
                            session_id,
                            content: parts[2..].join(" "),
                            reply_to: None,
                            is_private: true,
                            target_user: Some(parts[1].to_string()),
                        }).await?;
                    },
                    "call" => {
                        if parts.len() < 2 {
                            println!("Usage: call <user> [audio|video]");
                            prompt();
                            continue;
                        }
                        let media = parse_media_arg(parts.get(2));
                        if let Some(m) = manager.as_mut() {
                            let outputs = m.start_call(parts[1], media);
                            process_outputs(m, outputs, &writer, &mut timers).await?;
                        } else {
                            println!("Join a session first");
                        }
                    },
                    "group" => {
                        let media = parse_media_arg(parts.get(1));
                        if let Some(m) = manager.as_mut() {
                            let outputs = m.join_group(media);
                            process_outputs(m, outputs, &writer, &mut timers).await?;
                            println!("📢 Announced to the group call; members will connect");
                        } else {
                            println!("Join a session first");
                        }
                    },
                    "accept" => {
                        if parts.len() < 2 {
                            println!("Usage: accept <user>");
                            prompt();
                            continue;
                        }
                        if let Some(m) = manager.as_mut() {
                            let outputs = m.accept(parts[1]);
                            process_outputs(m, outputs, &writer, &mut timers).await?;
                        }
                    },
                    "decline" => {
                        if parts.len() < 2 {
                            println!("Usage: decline <user>");
                            prompt();
                            continue;
                        }
                        if let Some(m) = manager.as_mut() {
                            let outputs = m.decline(parts[1]);
                            process_outputs(m, outputs, &writer, &mut timers).await?;
                        }
                    },
                    "hangup" => {
                        if let Some(m) = manager.as_mut() {
                            let outputs = match parts.get(1) {
                                Some(&"all") | None => m.hang_up_all(),
                                Some(peer) => m.hang_up(peer),
                            };
                            process_outputs(m, outputs, &writer, &mut timers).await?;
                        }
                    },
                    "mute" => {
                        if let Some(m) = manager.as_mut() {
                            let enabled = parts.get(1) == Some(&"off");
                            let outputs = m.set_audio(enabled);
                            process_outputs(m, outputs, &writer, &mut timers).await?;
                        }
                    },
                    "video" => {
                        if let Some(m) = manager.as_mut() {
                            let enabled = parts.get(1) == Some(&"on");
                            let outputs = m.set_video(enabled);
                            process_outputs(m, outputs, &writer, &mut timers).await?;
                        }
                    },
                    "users" => {
                        println!("👥 Users in session:");
                        for user in &known_users {
                            println!("  {}", user);
                        }
                    },
                    "leave" => {
                        send_event(&writer, &ClientEvent::LeaveSession).await?;
                        current_session = None;
                        manager = None;
                        known_users.clear();
                        println!("👋 Left session");
                    },
                    "quit" | "exit" => {
                        println!("👋 Goodbye!");
                        break;
                    },
                    "help" => print_help(),
                    other => {
                        println!("Unknown command: {}. Type 'help' for available commands.", other);
                    }
                }
                prompt();
            }

            Some(event) = srv_rx.recv() => {
                handle_server_event(
                    event,
                    &username,
                    &mut participant_id,
                    &mut known_users,
                    manager.as_mut(),
                    &writer,
                    &mut timers,
                ).await?;
                prompt();
            }

            Some(fired) = timer_rx.recv() => {
                if let Some(m) = manager.as_mut() {
                    let outputs = match fired.timer {
                        TimerKind::Answer => m.answer_timeout(&fired.peer),
                        TimerKind::Reconnect => m.reconnect_tick(&fired.peer),
                    };
                    process_outputs(m, outputs, &writer, &mut timers).await?;
                }
            }

            _ = &mut server_task => {
                println!("Server connection lost");
                break;
            }
        }
    }

    input_task.abort();
    Ok(())
}

fn print_help() {
    println!();
    println!("💬 Interactive Commands:");
    println!("  join <session_id>       - Join (or create) a session by token");
    println!("  say <message>           - Send a message to the session");
    println!("  pm <user> <message>     - Send a private message");
    println!("  call <user> [av]        - Start a call (audio|video, default video)");
    println!("  group [av]              - Start a group call with everyone present");
    println!("  accept <user>           - Accept an incoming call");
    println!("  decline <user>          - Decline an incoming call");
    println!("  hangup [user|all]       - End a call");
    println!("  mute [on|off]           - Toggle the microphone");
    println!("  video [on|off]          - Toggle the camera");
    println!("  users                   - List session participants");
    println!("  leave                   - Leave the session");
    println!("  quit                    - Exit client");
    println!();
}

fn prompt() {
    print!("> ");
    io::stdout().flush().unwrap();
}

fn parse_media_arg(arg: Option<&&str>) -> CallMedia {
    match arg.map(|s| s.to_lowercase()) {
        Some(ref s) if s == "audio" => CallMedia::Audio,
        _ => CallMedia::Video,
    }
}

/// Print a server event and feed call envelopes into the state machine.
async fn handle_server_event(
    event: ServerEvent,
    username: &str,
    participant_id: &mut Option<String>,
    known_users: &mut Vec<String>,
    manager: Option<&mut CallManager>,
    writer: &Arc<Mutex<OwnedWriteHalf>>,
    timers: &mut Timers,
) -> Result<()> {
    match event {
        ServerEvent::SessionJoined {
            success,
            session_id,
            participant_id: issued,
            error,
        } => {
            if success {
                println!("🎉 Joined session {}", session_id.unwrap_or_default());
                *participant_id = issued;
            } else {
                println!("❌ Failed to join: {}", error.unwrap_or_default());
            }
        }
        ServerEvent::UsersList { users, .. } => {
            *known_users = users
                .iter()
                .map(|u| u.username.clone())
                .filter(|name| name != username)
                .collect();
            known_users.sort();
            known_users.dedup();
            println!("👥 Present: {}", known_users.join(", "));
        }
        ServerEvent::MessageHistory { messages, .. } => {
            for msg in &messages {
                let marker = if msg.is_private { "🔒" } else { "💬" };
                println!("{} [{}] {}: {}", marker, msg.timestamp.format("%H:%M"), msg.sender_name, msg.content);
            }
        }
        ServerEvent::UserJoined { username: name, .. } => {
            if !known_users.contains(&name) && name != username {
                known_users.push(name.clone());
                known_users.sort();
            }
            println!("🟢 {} joined the session", name);
        }
        ServerEvent::UserLeft { username: name, .. } => {
            known_users.retain(|u| u != &name);
            println!("🔴 {} left the session", name);
        }
        ServerEvent::UserCountUpdate { count, .. } => {
            debug!("session now has {} user(s)", count);
        }
        ServerEvent::ReceiveMessage(msg) => {
            let marker = if msg.is_private { "🔒" } else { "💬" };
            println!("{} {}: {}", marker, msg.sender_name, msg.content);
        }
        ServerEvent::UserTyping {
            username: name,
            is_typing,
            ..
        } => {
            if is_typing {
                println!("✏️  {} is typing...", name);
            }
        }
        ServerEvent::DeliveryFailed {
            target_user, reason, ..
        } => {
            println!("❌ Message to {} not delivered: {}", target_user, reason);
        }
        ServerEvent::CallSignal(signal) => {
            if let Some(m) = manager {
                let outputs = m.handle_signal(&signal);
                process_outputs(m, outputs, writer, timers).await?;
            }
        }
        ServerEvent::SignalError { kind, reason } => {
            println!("❌ Signal {:?} rejected: {}", kind, reason);
        }
        ServerEvent::Error { message } => {
            println!("❌ Server error: {}", message);
        }
    }
    Ok(())
}

/// Carry out manager outputs. The loopback driver answers transport
/// operations immediately, which can produce further outputs; they are
/// drained from the same queue.
async fn process_outputs(
    manager: &mut CallManager,
    outputs: Vec<CallOutput>,
    writer: &Arc<Mutex<OwnedWriteHalf>>,
    timers: &mut Timers,
) -> Result<()> {
    let mut queue: VecDeque<CallOutput> = outputs.into();
    while let Some(output) = queue.pop_front() {
        match output {
            CallOutput::Signal(signal) => {
                send_event(writer, &ClientEvent::CallSignal(signal)).await?;
            }
            CallOutput::Transport { peer, action } => match action {
                LinkAction::CreateOffer => {
                    queue.extend(manager.offer_ready(&peer, stub_sdp("offer", &peer)));
                }
                LinkAction::CreateAnswer { .. } => {
                    queue.extend(manager.answer_ready(&peer, stub_sdp("answer", &peer)));
                    queue.extend(manager.transport_connected(&peer));
                }
                LinkAction::ApplyRemoteAnswer { .. } => {
                    queue.extend(manager.transport_connected(&peer));
                }
                LinkAction::RestartIce => {
                    queue.extend(manager.transport_connected(&peer));
                }
                other => debug!("transport op for {}: {:?}", peer, other),
            },
            CallOutput::Incoming { peer, media } => {
                println!(
                    "📞 Incoming {:?} call from {} (type 'accept {}' or 'decline {}')",
                    media, peer, peer, peer
                );
            }
            CallOutput::RemoteMedia { peer, audio, video } => {
                println!(
                    "🎛️  {} media: mic {}, camera {}",
                    peer,
                    if audio { "on" } else { "off" },
                    if video { "on" } else { "off" }
                );
            }
            CallOutput::LinkClosed { peer, reason } => {
                timers.cancel_all(&peer);
                println!("📴 Call with {} ended: {:?}", peer, reason);
            }
            CallOutput::StartTimer { peer, timer } => {
                timers.start(peer, timer);
            }
            CallOutput::CancelAnswerTimer { peer } => {
                timers.cancel_answer(&peer);
            }
        }
    }
    Ok(())
}

fn stub_sdp(kind: &str, peer: &str) -> String {
    format!("v=0 loopback-{}-{}", kind, peer)
}

async fn handle_user_input(cmd_tx: mpsc::UnboundedSender<String>) -> Result<()> {
    let stdin = tokio::io::stdin();
    let reader = BufReader::new(stdin);
    let mut lines = reader.lines();

    while let Some(line) = lines.next_line().await? {
        if cmd_tx.send(line).is_err() {
            break;
        }
    }
    Ok(())
}

async fn send_event(writer: &Arc<Mutex<OwnedWriteHalf>>, event: &ClientEvent) -> Result<()> {
    let data = event.to_framed()?;
    writer.lock().await.write_all(&data).await?;
    Ok(())
}

async fn read_server_events(
    mut reader: OwnedReadHalf,
    srv_tx: mpsc::UnboundedSender<ServerEvent>,
) -> Result<()> {
    loop {
        let mut len_buf = [0u8; 4];
        reader.read_exact(&mut len_buf).await?;
        let msg_len = u32::from_be_bytes(len_buf) as usize;
        if msg_len > MAX_FRAME_BYTES {
            error!("Oversized frame from server ({} bytes)", msg_len);
            break;
        }

        let mut msg_buf = vec![0u8; msg_len];
        reader.read_exact(&mut msg_buf).await?;

        match ServerEvent::from_bytes(&msg_buf) {
            Ok(event) => {
                if srv_tx.send(event).is_err() {
                    break;
                }
            }
            Err(e) => {
                error!("Invalid event from server: {}", e);
            }
        }
    }
    Ok(())
}
