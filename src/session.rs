//! Presence Registry
//!
//! Tracks which connections belong to which session, room membership and
//! typing state. The registry owns the per-connection outboxes, so message
//! and signal fan-out all goes through it. One instance is constructed at
//! process start and injected into every handler.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::protocol::{ChatMessage, ParticipantInfo, Presence, ServerEvent};

/// Per-connection delivery channel. The writer task on the other end owns
/// the socket; handlers never block on I/O.
pub type Outbox = mpsc::UnboundedSender<ServerEvent>;

/// Session tokens are 8 uppercase alphanumeric characters.
pub const SESSION_TOKEN_LEN: usize = 8;
const TOKEN_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Generate a fresh session token.
pub fn new_session_token() -> String {
    let mut rng = rand::thread_rng();
    (0..SESSION_TOKEN_LEN)
        .map(|_| TOKEN_CHARSET[rng.gen_range(0..TOKEN_CHARSET.len())] as char)
        .collect()
}

/// Registry-related errors
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Session not found")]
    SessionNotFound,
    #[error("Participant not found")]
    ParticipantNotFound,
}

/// One live connection inside a session.
///
/// The connection id is unique per socket and changes on every reconnect;
/// the participant id is the stable identity issued at first join and
/// carried back by the client across reconnects. No verification ties a
/// display name to either id - any connection may claim any name, which is
/// a known gap inherited from the protocol.
#[derive(Debug, Clone)]
pub struct Participant {
    pub conn_id: String,
    pub participant_id: String,
    pub username: String,
    pub presence: Presence,
    pub is_typing: bool,
    pub joined_at: DateTime<Utc>,
    typing_since: Option<Instant>,
}

impl Participant {
    pub fn new(conn_id: String, participant_id: String, username: String) -> Self {
        Self {
            conn_id,
            participant_id,
            username,
            presence: Presence::Online,
            is_typing: false,
            joined_at: Utc::now(),
            typing_since: None,
        }
    }

    pub fn info(&self) -> ParticipantInfo {
        ParticipantInfo {
            participant_id: self.participant_id.clone(),
            username: self.username.clone(),
            presence: self.presence,
            is_typing: self.is_typing,
        }
    }
}

/// A named chat session with an ordered message log.
#[derive(Debug)]
pub struct Session {
    pub token: String,
    pub created_at: DateTime<Utc>,
    messages: RwLock<Vec<ChatMessage>>,
    participants: RwLock<HashMap<String, Participant>>,
    empty_since: RwLock<Option<Instant>>,
}

impl Session {
    pub fn new(token: String) -> Self {
        Self {
            token,
            created_at: Utc::now(),
            messages: RwLock::new(Vec::new()),
            participants: RwLock::new(HashMap::new()),
            empty_since: RwLock::new(Some(Instant::now())),
        }
    }

    /// Rebuild a session from a snapshot. Only the lists survive a restart;
    /// no participant is live until it reconnects and joins again.
    pub fn restored(token: String, created_at: DateTime<Utc>, messages: Vec<ChatMessage>) -> Self {
        Self {
            token,
            created_at,
            messages: RwLock::new(messages),
            participants: RwLock::new(HashMap::new()),
            empty_since: RwLock::new(Some(Instant::now())),
        }
    }

    /// Add a participant, keyed by connection id. Rejoining with the same
    /// connection id replaces the entry rather than duplicating it.
    pub fn add_participant(&self, participant: Participant) {
        *self.empty_since.write() = None;
        self.participants
            .write()
            .insert(participant.conn_id.clone(), participant);
    }

    pub fn remove_participant(&self, conn_id: &str) -> Option<Participant> {
        let removed = self.participants.write().remove(conn_id);
        if self.participants.read().is_empty() {
            *self.empty_since.write() = Some(Instant::now());
        }
        removed
    }

    pub fn get_participant(&self, conn_id: &str) -> Option<Participant> {
        self.participants.read().get(conn_id).cloned()
    }

    pub fn participants(&self) -> Vec<Participant> {
        self.participants.read().values().cloned().collect()
    }

    pub fn participant_infos(&self) -> Vec<ParticipantInfo> {
        self.participants.read().values().map(|p| p.info()).collect()
    }

    /// Distinct display names currently in the session.
    pub fn usernames(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .participants
            .read()
            .values()
            .map(|p| p.username.clone())
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// Participant count as shown to clients: distinct display names, so a
    /// multi-tab user counts once.
    pub fn user_count(&self) -> usize {
        self.usernames().len()
    }

    /// Connection ids of every live connection claiming this display name.
    pub fn connections_of(&self, username: &str) -> Vec<String> {
        self.participants
            .read()
            .values()
            .filter(|p| p.username == username)
            .map(|p| p.conn_id.clone())
            .collect()
    }

    /// Append to the ordered log. The message router is the only caller.
    pub fn append_message(&self, message: ChatMessage) {
        self.messages.write().push(message);
    }

    /// History replay for a joiner, filtered by the privacy rule.
    pub fn history_for(&self, username: &str) -> Vec<ChatMessage> {
        self.messages
            .read()
            .iter()
            .filter(|m| m.visible_to(username))
            .cloned()
            .collect()
    }

    pub fn messages_snapshot(&self) -> Vec<ChatMessage> {
        self.messages.read().clone()
    }

    /// Update the typing flag for every connection of a display name.
    /// Returns false if the name is not present.
    pub fn set_typing(&self, username: &str, is_typing: bool) -> bool {
        let mut participants = self.participants.write();
        let mut found = false;
        for p in participants.values_mut() {
            if p.username == username {
                p.is_typing = is_typing;
                p.typing_since = is_typing.then(Instant::now);
                found = true;
            }
        }
        found
    }

    /// Clear typing flags older than `max_age` so a client that died
    /// mid-keystroke never leaves a stuck indicator. Returns the display
    /// names that were cleared.
    pub fn clear_stale_typing(&self, max_age: Duration) -> Vec<String> {
        let mut cleared = Vec::new();
        let mut participants = self.participants.write();
        for p in participants.values_mut() {
            if p.is_typing {
                let stale = p
                    .typing_since
                    .map(|since| since.elapsed() > max_age)
                    .unwrap_or(true);
                if stale {
                    p.is_typing = false;
                    p.typing_since = None;
                    cleared.push(p.username.clone());
                }
            }
        }
        cleared.sort();
        cleared.dedup();
        cleared
    }

    pub fn is_empty(&self) -> bool {
        self.participants.read().is_empty()
    }

    /// How long the session has been without any participant.
    pub fn idle_for(&self) -> Option<Duration> {
        self.empty_since.read().map(|since| since.elapsed())
    }
}

/// Result of admitting a connection into a session.
#[derive(Debug)]
pub struct JoinOutcome {
    pub participant_id: String,
    pub count: usize,
    pub users: Vec<ParticipantInfo>,
}

/// Owns every session, the connection index and room membership.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    /// Connection id -> session tokens it joined.
    conn_sessions: RwLock<HashMap<String, HashSet<String>>>,
    /// Connection id -> delivery channel.
    outboxes: RwLock<HashMap<String, Outbox>>,
    /// Room id -> member connection ids. A session token is a room; derived
    /// pair rooms for private signaling live here too.
    rooms: RwLock<HashMap<String, HashSet<String>>>,
    /// Stable participant id -> display name it was issued for, and when it
    /// was last presented. Swept with the retention window so the map does
    /// not grow one entry per join forever.
    identities: RwLock<HashMap<String, (String, Instant)>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            conn_sessions: RwLock::new(HashMap::new()),
            outboxes: RwLock::new(HashMap::new()),
            rooms: RwLock::new(HashMap::new()),
            identities: RwLock::new(HashMap::new()),
        }
    }

    /// Mint a new session with a fresh collision-checked token.
    pub fn create_session(&self) -> Arc<Session> {
        let mut sessions = self.sessions.write();
        let token = loop {
            let candidate = new_session_token();
            if !sessions.contains_key(&candidate) {
                break candidate;
            }
        };
        let session = Arc::new(Session::new(token.clone()));
        sessions.insert(token.clone(), session.clone());
        log::info!("Created session {}", token);
        session
    }

    /// Lookup for explicit join-by-token flows; unknown tokens are an error
    /// here, unlike the silent ignore for typing/message events.
    pub fn lookup(&self, token: &str) -> Result<Arc<Session>, RegistryError> {
        self.get_session(token).ok_or(RegistryError::SessionNotFound)
    }

    pub fn get_session(&self, token: &str) -> Option<Arc<Session>> {
        self.sessions.read().get(token).cloned()
    }

    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.read().values().cloned().collect()
    }

    /// Insert a session rebuilt from a snapshot; live sessions win.
    pub fn insert_restored(&self, session: Session) {
        let mut sessions = self.sessions.write();
        sessions
            .entry(session.token.clone())
            .or_insert_with(|| Arc::new(session));
    }

    /// Admit a connection into a session, creating the session on first
    /// join. Broadcasts `user_joined` to the rest of the room, the
    /// authoritative `users_list` to the joiner, and the updated count to
    /// everyone.
    pub fn join(
        &self,
        session_id: &str,
        conn_id: &str,
        username: &str,
        resume_id: Option<&str>,
        outbox: Outbox,
    ) -> JoinOutcome {
        let session = {
            let mut sessions = self.sessions.write();
            sessions
                .entry(session_id.to_string())
                .or_insert_with(|| Arc::new(Session::new(session_id.to_string())))
                .clone()
        };

        self.outboxes.write().insert(conn_id.to_string(), outbox);

        // Reuse the stable identity only when the client presents one that
        // was issued for the same display name.
        let participant_id = {
            let mut identities = self.identities.write();
            let resumable = resume_id
                .map(|id| {
                    identities
                        .get(id)
                        .map(|(name, _)| name == username)
                        .unwrap_or(false)
                })
                .unwrap_or(false);
            let id = if resumable {
                resume_id.unwrap_or_default().to_string()
            } else {
                Uuid::new_v4().to_string()
            };
            identities.insert(id.clone(), (username.to_string(), Instant::now()));
            id
        };

        let participant = Participant::new(
            conn_id.to_string(),
            participant_id.clone(),
            username.to_string(),
        );
        session.add_participant(participant);

        self.conn_sessions
            .write()
            .entry(conn_id.to_string())
            .or_default()
            .insert(session_id.to_string());
        self.join_room(session_id, conn_id);

        let users = session.participant_infos();
        let count = session.user_count();
        log::info!("{} joined session {} ({} users)", username, session_id, count);

        self.send_to_room(
            session_id,
            Some(conn_id),
            ServerEvent::UserJoined {
                session_id: session_id.to_string(),
                username: username.to_string(),
                participant_id: participant_id.clone(),
            },
        );
        self.send_to_conn(
            conn_id,
            ServerEvent::UsersList {
                session_id: session_id.to_string(),
                users: users.clone(),
            },
        );
        self.send_to_room(
            session_id,
            None,
            ServerEvent::UserCountUpdate {
                session_id: session_id.to_string(),
                count,
            },
        );

        JoinOutcome {
            participant_id,
            count,
            users,
        }
    }

    /// Remove a connection from every session it belonged to, broadcasting
    /// `user_left` where its display name is no longer present. Returns the
    /// tokens of the sessions it left.
    pub fn leave(&self, conn_id: &str) -> Vec<String> {
        let tokens: Vec<String> = self
            .conn_sessions
            .write()
            .remove(conn_id)
            .map(|set| set.into_iter().collect())
            .unwrap_or_default();

        for token in &tokens {
            let Some(session) = self.get_session(token) else {
                continue;
            };
            let Some(removed) = session.remove_participant(conn_id) else {
                continue;
            };
            // A multi-tab user is only gone once its last connection is.
            if session.connections_of(&removed.username).is_empty() {
                self.send_to_room(
                    token,
                    None,
                    ServerEvent::UserLeft {
                        session_id: token.clone(),
                        username: removed.username.clone(),
                    },
                );
            }
            self.send_to_room(
                token,
                None,
                ServerEvent::UserCountUpdate {
                    session_id: token.clone(),
                    count: session.user_count(),
                },
            );
            log::info!("{} left session {}", removed.username, token);
        }

        let mut rooms = self.rooms.write();
        for members in rooms.values_mut() {
            members.remove(conn_id);
        }
        rooms.retain(|_, members| !members.is_empty());
        self.outboxes.write().remove(conn_id);

        tokens
    }

    /// Update a typing flag and tell everyone else in the room. Unknown
    /// sessions and absent participants are silently ignored.
    pub fn set_typing(&self, session_id: &str, username: &str, is_typing: bool) {
        let Some(session) = self.get_session(session_id) else {
            log::debug!("typing event for unknown session {}", session_id);
            return;
        };
        if !session.set_typing(username, is_typing) {
            return;
        }
        self.broadcast_typing(&session, username, is_typing);
    }

    fn broadcast_typing(&self, session: &Session, username: &str, is_typing: bool) {
        let event = ServerEvent::UserTyping {
            session_id: session.token.clone(),
            username: username.to_string(),
            is_typing,
        };
        for p in session.participants() {
            if p.username != username {
                self.send_to_conn(&p.conn_id, event.clone());
            }
        }
    }

    /// Drop sessions that have been empty longer than the retention window,
    /// along with stable identities that have not been presented within it.
    pub fn sweep_idle(&self, retention: Duration) -> Vec<String> {
        let mut removed = Vec::new();
        let mut sessions = self.sessions.write();
        sessions.retain(|token, session| {
            let expired = session
                .idle_for()
                .map(|idle| idle > retention)
                .unwrap_or(false);
            if expired {
                removed.push(token.clone());
            }
            !expired
        });
        drop(sessions);
        // An identity stays resumable while its display name is live
        // anywhere, and for one retention window after that.
        let live: HashSet<String> = self
            .sessions()
            .iter()
            .flat_map(|s| s.usernames())
            .collect();
        self.identities
            .write()
            .retain(|_, (name, last_seen)| {
                live.contains(name) || last_seen.elapsed() <= retention
            });
        for token in &removed {
            log::info!("Garbage-collected idle session {}", token);
        }
        removed
    }

    /// Clear typing flags older than `max_age` everywhere, broadcasting the
    /// stop to the affected rooms.
    pub fn sweep_typing(&self, max_age: Duration) {
        for session in self.sessions() {
            for username in session.clear_stale_typing(max_age) {
                self.broadcast_typing(&session, &username, false);
            }
        }
    }

    /// Add a connection to a room. Joining twice is a no-op.
    pub fn join_room(&self, room_id: &str, conn_id: &str) {
        self.rooms
            .write()
            .entry(room_id.to_string())
            .or_default()
            .insert(conn_id.to_string());
    }

    pub fn room_members(&self, room_id: &str) -> Vec<String> {
        self.rooms
            .read()
            .get(room_id)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Deliver an event to one connection. A closed outbox just means the
    /// connection is going away; the disconnect path cleans it up.
    pub fn send_to_conn(&self, conn_id: &str, event: ServerEvent) {
        if let Some(outbox) = self.outboxes.read().get(conn_id) {
            if outbox.send(event).is_err() {
                log::debug!("outbox closed for {}", conn_id);
            }
        }
    }

    /// Deliver an event to every member of a room, optionally excluding one
    /// connection (usually the sender).
    pub fn send_to_room(&self, room_id: &str, except: Option<&str>, event: ServerEvent) {
        for conn_id in self.room_members(room_id) {
            if except == Some(conn_id.as_str()) {
                continue;
            }
            self.send_to_conn(&conn_id, event.clone());
        }
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

    fn drain(rx: &mut UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_session_token_format() {
        let token = new_session_token();
        assert_eq!(token.len(), SESSION_TOKEN_LEN);
        assert!(token
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));
    }

    #[test]
    fn test_join_then_leave_restores_participants() {
        let registry = SessionRegistry::new();
        let (tx_a, _rx_a) = unbounded_channel();
        let (tx_b, _rx_b) = unbounded_channel();
        registry.join("ABC12345", "conn-a", "alice", None, tx_a);

        let before: Vec<String> = registry.get_session("ABC12345").unwrap().usernames();

        registry.join("ABC12345", "conn-b", "bob", None, tx_b);
        let left = registry.leave("conn-b");
        assert_eq!(left, vec!["ABC12345".to_string()]);

        let after = registry.get_session("ABC12345").unwrap().usernames();
        assert_eq!(before, after);
    }

    #[test]
    fn test_rejoin_same_connection_does_not_duplicate() {
        let registry = SessionRegistry::new();
        let (tx, _rx) = unbounded_channel();
        registry.join("ABC12345", "conn-a", "alice", None, tx.clone());
        registry.join("ABC12345", "conn-a", "alice", None, tx);

        let session = registry.get_session("ABC12345").unwrap();
        assert_eq!(session.participants().len(), 1);
        assert_eq!(session.user_count(), 1);
    }

    #[test]
    fn test_two_user_join_scenario() {
        let registry = SessionRegistry::new();
        let (tx_a, mut rx_a) = unbounded_channel();
        let (tx_b, mut rx_b) = unbounded_channel();

        registry.join("ABC12345", "conn-a", "alice", None, tx_a);
        drain(&mut rx_a);

        let outcome = registry.join("ABC12345", "conn-b", "bob", None, tx_b);
        assert_eq!(outcome.count, 2);

        // alice sees bob join and the new count.
        let alice_events = drain(&mut rx_a);
        assert!(alice_events.iter().any(|e| matches!(
            e,
            ServerEvent::UserJoined { username, .. } if username == "bob"
        )));
        assert!(alice_events
            .iter()
            .any(|e| matches!(e, ServerEvent::UserCountUpdate { count: 2, .. })));

        // bob receives an authoritative users_list containing alice, and the count.
        let bob_events = drain(&mut rx_b);
        assert!(bob_events.iter().any(|e| matches!(
            e,
            ServerEvent::UsersList { users, .. }
                if users.iter().any(|u| u.username == "alice")
        )));
        assert!(bob_events
            .iter()
            .any(|e| matches!(e, ServerEvent::UserCountUpdate { count: 2, .. })));
    }

    #[test]
    fn test_resume_keeps_participant_identity() {
        let registry = SessionRegistry::new();
        let (tx, _rx) = unbounded_channel();
        let first = registry.join("ABC12345", "conn-a", "alice", None, tx.clone());
        registry.leave("conn-a");

        // Reconnect with a fresh connection id but the issued identity.
        let second = registry.join(
            "ABC12345",
            "conn-a2",
            "alice",
            Some(&first.participant_id),
            tx,
        );
        assert_eq!(first.participant_id, second.participant_id);
    }

    #[test]
    fn test_resume_rejected_for_other_username() {
        let registry = SessionRegistry::new();
        let (tx, _rx) = unbounded_channel();
        let alice = registry.join("ABC12345", "conn-a", "alice", None, tx.clone());

        let mallory = registry.join(
            "ABC12345",
            "conn-m",
            "mallory",
            Some(&alice.participant_id),
            tx,
        );
        assert_ne!(alice.participant_id, mallory.participant_id);
    }

    #[test]
    fn test_typing_ignored_for_unknown_session() {
        let registry = SessionRegistry::new();
        // Must not create the session as a side effect.
        registry.set_typing("NOSUCH00", "alice", true);
        assert!(registry.get_session("NOSUCH00").is_none());
    }

    #[test]
    fn test_typing_broadcast_excludes_typist() {
        let registry = SessionRegistry::new();
        let (tx_a, mut rx_a) = unbounded_channel();
        let (tx_b, mut rx_b) = unbounded_channel();
        registry.join("ABC12345", "conn-a", "alice", None, tx_a);
        registry.join("ABC12345", "conn-b", "bob", None, tx_b);
        drain(&mut rx_a);
        drain(&mut rx_b);

        registry.set_typing("ABC12345", "alice", true);

        assert!(drain(&mut rx_b).iter().any(|e| matches!(
            e,
            ServerEvent::UserTyping { username, is_typing: true, .. } if username == "alice"
        )));
        assert!(drain(&mut rx_a).is_empty());
    }

    #[test]
    fn test_no_stuck_typing_flag() {
        let registry = SessionRegistry::new();
        let (tx, _rx) = unbounded_channel();
        registry.join("ABC12345", "conn-a", "alice", None, tx);
        registry.set_typing("ABC12345", "alice", true);

        registry.sweep_typing(Duration::ZERO);

        let session = registry.get_session("ABC12345").unwrap();
        assert!(session.participants().iter().all(|p| !p.is_typing));
    }

    #[test]
    fn test_sweep_idle_removes_empty_sessions() {
        let registry = SessionRegistry::new();
        let (tx, _rx) = unbounded_channel();
        registry.join("ABC12345", "conn-a", "alice", None, tx);
        registry.leave("conn-a");

        let removed = registry.sweep_idle(Duration::ZERO);
        assert_eq!(removed, vec!["ABC12345".to_string()]);
        assert!(registry.get_session("ABC12345").is_none());
    }

    #[test]
    fn test_sweep_idle_spares_occupied_sessions() {
        let registry = SessionRegistry::new();
        let (tx, _rx) = unbounded_channel();
        registry.join("ABC12345", "conn-a", "alice", None, tx);

        assert!(registry.sweep_idle(Duration::ZERO).is_empty());
        assert!(registry.get_session("ABC12345").is_some());
    }

    #[test]
    fn test_sweep_idle_evicts_stale_identities() {
        let registry = SessionRegistry::new();
        let (tx, _rx) = unbounded_channel();
        let first = registry.join("ABC12345", "conn-a", "alice", None, tx.clone());
        registry.leave("conn-a");

        registry.sweep_idle(Duration::ZERO);

        // The issued identity aged out with the session; the resume attempt
        // gets a fresh one.
        let second = registry.join(
            "ABC12345",
            "conn-a2",
            "alice",
            Some(&first.participant_id),
            tx,
        );
        assert_ne!(first.participant_id, second.participant_id);
    }

    #[test]
    fn test_sweep_idle_keeps_identities_within_retention() {
        let registry = SessionRegistry::new();
        let (tx, _rx) = unbounded_channel();
        let first = registry.join("ABC12345", "conn-a", "alice", None, tx.clone());
        registry.leave("conn-a");

        registry.sweep_idle(Duration::from_secs(3600));

        let second = registry.join(
            "ABC12345",
            "conn-a2",
            "alice",
            Some(&first.participant_id),
            tx,
        );
        assert_eq!(first.participant_id, second.participant_id);
    }

    #[test]
    fn test_sweep_idle_spares_identities_of_live_users() {
        let registry = SessionRegistry::new();
        let (tx, _rx) = unbounded_channel();
        let first = registry.join("ABC12345", "conn-a", "alice", None, tx.clone());

        // alice is still connected; even a zero retention keeps her
        // identity resumable.
        registry.sweep_idle(Duration::ZERO);

        registry.leave("conn-a");
        let second = registry.join(
            "ABC12345",
            "conn-a2",
            "alice",
            Some(&first.participant_id),
            tx,
        );
        assert_eq!(first.participant_id, second.participant_id);
    }

    #[test]
    fn test_lookup_unknown_token() {
        let registry = SessionRegistry::new();
        assert!(matches!(
            registry.lookup("NOSUCH00"),
            Err(RegistryError::SessionNotFound)
        ));
    }
}
