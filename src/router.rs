//! Message Router
//!
//! Single ordering authority for chat messages: the only code path that
//! appends to a session log, then fans out according to the visibility
//! rule. Private messages reach exactly the sender and the named target;
//! a miss is reported back to the sender, never silently dropped.

use std::sync::Arc;
use uuid::Uuid;

use crate::protocol::{ChatMessage, DeliveryStatus, ServerEvent};
use crate::session::SessionRegistry;

/// Client-supplied fields of an outgoing message; the router fills in
/// identity, ordering and status.
#[derive(Debug, Clone)]
pub struct MessageDraft {
    pub content: String,
    pub reply_to: Option<String>,
    pub is_private: bool,
    pub target_user: Option<String>,
}

pub struct MessageRouter {
    registry: Arc<SessionRegistry>,
}

impl MessageRouter {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    /// Append a message to the session log and deliver it. Returns the
    /// stored message, or `None` when nothing was appended (unknown
    /// session, or a private target with no live connection).
    pub fn publish(
        &self,
        session_id: &str,
        sender_conn: &str,
        sender_name: &str,
        draft: MessageDraft,
    ) -> Option<ChatMessage> {
        let Some(session) = self.registry.get_session(session_id) else {
            log::debug!("message for unknown session {}", session_id);
            return None;
        };

        let message = ChatMessage {
            id: Uuid::new_v4().to_string(),
            sender_conn: sender_conn.to_string(),
            sender_name: sender_name.to_string(),
            content: draft.content,
            timestamp: chrono::Utc::now(),
            status: DeliveryStatus::Sent,
            reply_to: draft.reply_to,
            is_private: draft.is_private,
            target_user: draft.target_user,
        };

        if message.is_private {
            let target = message.target_user.clone().unwrap_or_default();
            let target_conns = session.connections_of(&target);
            if target_conns.is_empty() {
                log::info!(
                    "private message from {} to absent user {}",
                    sender_name,
                    target
                );
                self.registry.send_to_conn(
                    sender_conn,
                    ServerEvent::DeliveryFailed {
                        message_id: message.id.clone(),
                        target_user: target,
                        reason: "recipient not online".to_string(),
                    },
                );
                return None;
            }

            session.append_message(message.clone());

            // Exactly the sender's connections and the target's.
            let mut recipients = session.connections_of(sender_name);
            recipients.extend(target_conns);
            recipients.sort();
            recipients.dedup();
            for conn_id in recipients {
                self.registry
                    .send_to_conn(&conn_id, ServerEvent::ReceiveMessage(message.clone()));
            }
        } else {
            session.append_message(message.clone());
            self.registry.send_to_room(
                session_id,
                None,
                ServerEvent::ReceiveMessage(message.clone()),
            );
        }

        Some(message)
    }

    /// History replay for a joiner, filtered by the privacy rule.
    pub fn history_for(&self, session_id: &str, username: &str) -> Vec<ChatMessage> {
        self.registry
            .get_session(session_id)
            .map(|session| session.history_for(username))
            .unwrap_or_default()
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

    fn draft(content: &str) -> MessageDraft {
        MessageDraft {
            content: content.to_string(),
            reply_to: None,
            is_private: false,
            target_user: None,
        }
    }

    fn private_draft(content: &str, target: &str) -> MessageDraft {
        MessageDraft {
            content: content.to_string(),
            reply_to: None,
            is_private: true,
            target_user: Some(target.to_string()),
        }
    }

    struct Fixture {
        registry: Arc<SessionRegistry>,
        router: MessageRouter,
    }

    impl Fixture {
        fn new() -> Self {
            let registry = Arc::new(SessionRegistry::new());
            let router = MessageRouter::new(registry.clone());
            Self { registry, router }
        }

        fn join(&self, conn: &str, name: &str) -> UnboundedReceiver<ServerEvent> {
            let (tx, mut rx) = unbounded_channel();
            self.registry.join("ABC12345", conn, name, None, tx);
            drain(&mut rx);
            rx
        }
    }

    fn received(events: &[ServerEvent]) -> Vec<&ChatMessage> {
        events
            .iter()
            .filter_map(|e| match e {
                ServerEvent::ReceiveMessage(m) => Some(m),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_broadcast_reaches_everyone() {
        let fx = Fixture::new();
        let mut rx_a = fx.join("conn-a", "alice");
        let mut rx_b = fx.join("conn-b", "bob");

        let stored = fx
            .router
            .publish("ABC12345", "conn-a", "alice", draft("hello"))
            .unwrap();
        assert_eq!(stored.status, DeliveryStatus::Sent);

        for rx in [&mut rx_a, &mut rx_b] {
            let events = drain(rx);
            let msgs = received(&events);
            assert_eq!(msgs.len(), 1);
            assert_eq!(msgs[0].content, "hello");
        }
    }

    #[test]
    fn test_private_message_excludes_third_party() {
        let fx = Fixture::new();
        let mut rx_a = fx.join("conn-a", "alice");
        let mut rx_b = fx.join("conn-b", "bob");
        let mut rx_c = fx.join("conn-c", "carol");

        fx.router
            .publish("ABC12345", "conn-a", "alice", private_draft("psst", "bob"))
            .unwrap();

        assert_eq!(received(&drain(&mut rx_a)).len(), 1);
        assert_eq!(received(&drain(&mut rx_b)).len(), 1);
        assert!(received(&drain(&mut rx_c)).is_empty());
    }

    #[test]
    fn test_private_message_reaches_all_target_tabs() {
        let fx = Fixture::new();
        let _rx_a = fx.join("conn-a", "alice");
        let mut rx_b1 = fx.join("conn-b1", "bob");
        let mut rx_b2 = fx.join("conn-b2", "bob");

        fx.router
            .publish("ABC12345", "conn-a", "alice", private_draft("psst", "bob"))
            .unwrap();

        assert_eq!(received(&drain(&mut rx_b1)).len(), 1);
        assert_eq!(received(&drain(&mut rx_b2)).len(), 1);
    }

    #[test]
    fn test_private_miss_reports_delivery_failure() {
        let fx = Fixture::new();
        let mut rx_a = fx.join("conn-a", "alice");

        let stored = fx
            .router
            .publish("ABC12345", "conn-a", "alice", private_draft("psst", "bob"));
        assert!(stored.is_none());

        let events = drain(&mut rx_a);
        assert!(events.iter().any(|e| matches!(
            e,
            ServerEvent::DeliveryFailed { target_user, .. } if target_user == "bob"
        )));
        // Nothing reached the log.
        assert!(fx.router.history_for("ABC12345", "alice").is_empty());
    }

    #[test]
    fn test_sender_order_is_preserved() {
        let fx = Fixture::new();
        let _rx_a = fx.join("conn-a", "alice");
        let mut rx_b = fx.join("conn-b", "bob");

        for i in 0..5 {
            fx.router
                .publish("ABC12345", "conn-a", "alice", draft(&format!("m{}", i)))
                .unwrap();
        }

        let events = drain(&mut rx_b);
        let contents: Vec<&str> = received(&events).iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m0", "m1", "m2", "m3", "m4"]);
    }

    #[test]
    fn test_history_filtered_for_late_joiner() {
        let fx = Fixture::new();
        let _rx_a = fx.join("conn-a", "alice");
        let _rx_b = fx.join("conn-b", "bob");

        fx.router
            .publish("ABC12345", "conn-a", "alice", draft("public"))
            .unwrap();
        fx.router
            .publish("ABC12345", "conn-a", "alice", private_draft("psst", "bob"))
            .unwrap();

        let carol_view = fx.router.history_for("ABC12345", "carol");
        assert_eq!(carol_view.len(), 1);
        assert_eq!(carol_view[0].content, "public");

        let bob_view = fx.router.history_for("ABC12345", "bob");
        assert_eq!(bob_view.len(), 2);
    }

    #[test]
    fn test_unknown_session_is_ignored() {
        let fx = Fixture::new();
        assert!(fx
            .router
            .publish("NOSUCH00", "conn-a", "alice", draft("hello"))
            .is_none());
    }
}
