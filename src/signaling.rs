//! Signaling Coordinator
//!
//! Relays opaque call-control envelopes between participants. The
//! coordinator never inspects WebRTC payloads; it validates the routing
//! metadata at the boundary, stamps the sender's live connection id, and
//! forwards to either the deterministic pair room or the whole session.
//! No envelope is persisted - all call state lives on the clients.

use std::sync::Arc;

use crate::protocol::{pair_room_id, CallSignal, ServerEvent, SignalKind};
use crate::session::SessionRegistry;

/// Signaling protocol errors, reported back to the sender as a typed
/// error envelope rather than dropped.
#[derive(Debug, thiserror::Error)]
pub enum SignalError {
    #[error("{0:?} envelope is missing the caller identity")]
    MissingCaller(SignalKind),
    #[error("{0:?} envelope requires a target participant")]
    MissingTarget(SignalKind),
    #[error("target {target} has no live connection")]
    TargetOffline { kind: SignalKind, target: String },
}

impl SignalError {
    pub fn kind(&self) -> SignalKind {
        match self {
            SignalError::MissingCaller(kind) => *kind,
            SignalError::MissingTarget(kind) => *kind,
            SignalError::TargetOffline { kind, .. } => *kind,
        }
    }
}

pub struct SignalingCoordinator {
    registry: Arc<SessionRegistry>,
}

impl SignalingCoordinator {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    /// Route one envelope:
    /// 1. with a target participant, the destination is the pair room
    ///    derived from the sorted display names - recomputed on every
    ///    relay, so a refreshed connection is re-admitted without any
    ///    stored call state;
    /// 2. without one, the destination is the whole session room;
    /// 3. either way the envelope is stamped with the sender's connection
    ///    id so follow-ups can be addressed directly.
    pub fn relay(&self, sender_conn: &str, mut signal: CallSignal) -> Result<(), SignalError> {
        let kind = signal.kind;
        if signal.caller_name.is_empty() {
            return Err(SignalError::MissingCaller(kind));
        }
        if kind.requires_target() && signal.target_user.as_deref().unwrap_or("").is_empty() {
            return Err(SignalError::MissingTarget(kind));
        }

        signal.sender_conn = Some(sender_conn.to_string());

        match signal.target_user.clone() {
            Some(target) => self.relay_to_pair(sender_conn, &target, signal),
            None => {
                let session_id = signal.session_id.clone();
                if self.registry.get_session(&session_id).is_none() {
                    log::debug!("signal for unknown session {}", session_id);
                    return Ok(());
                }
                log::debug!(
                    "relaying {:?} from {} to session {}",
                    kind,
                    signal.caller_name,
                    session_id
                );
                self.registry
                    .send_to_room(&session_id, Some(sender_conn), ServerEvent::CallSignal(signal));
                Ok(())
            }
        }
    }

    fn relay_to_pair(
        &self,
        sender_conn: &str,
        target: &str,
        signal: CallSignal,
    ) -> Result<(), SignalError> {
        let kind = signal.kind;
        let offline = |kind| SignalError::TargetOffline {
            kind,
            target: target.to_string(),
        };

        let session = self
            .registry
            .get_session(&signal.session_id)
            .ok_or_else(|| offline(kind))?;

        let target_conns = session.connections_of(target);
        if target_conns.is_empty() {
            return Err(offline(kind));
        }

        // Re-admit every live connection of both names into the pair room
        // before fan-out; membership is derived, never stored call state.
        let room = pair_room_id(&signal.caller_name, target);
        for conn_id in session
            .connections_of(&signal.caller_name)
            .into_iter()
            .chain(target_conns)
        {
            self.registry.join_room(&room, &conn_id);
        }

        log::debug!(
            "relaying {:?} from {} to pair room {}",
            signal.kind,
            signal.caller_name,
            room
        );
        self.registry
            .send_to_room(&room, Some(sender_conn), ServerEvent::CallSignal(signal));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

    fn drain(rx: &mut UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn signals(events: &[ServerEvent]) -> Vec<&CallSignal> {
        events
            .iter()
            .filter_map(|e| match e {
                ServerEvent::CallSignal(s) => Some(s),
                _ => None,
            })
            .collect()
    }

    fn signal(kind: SignalKind, caller: &str, target: Option<&str>) -> CallSignal {
        CallSignal {
            kind,
            session_id: "ABC12345".to_string(),
            caller_name: caller.to_string(),
            target_user: target.map(str::to_string),
            payload: json!({"sdp": "v=0"}),
            sender_conn: None,
        }
    }

    struct Fixture {
        registry: Arc<SessionRegistry>,
        coordinator: SignalingCoordinator,
    }

    impl Fixture {
        fn new() -> Self {
            let registry = Arc::new(SessionRegistry::new());
            let coordinator = SignalingCoordinator::new(registry.clone());
            Self {
                registry,
                coordinator,
            }
        }

        fn join(&self, conn: &str, name: &str) -> UnboundedReceiver<ServerEvent> {
            let (tx, mut rx) = unbounded_channel();
            self.registry.join("ABC12345", conn, name, None, tx);
            drain(&mut rx);
            rx
        }
    }

    #[test]
    fn test_missing_caller_is_rejected() {
        let fx = Fixture::new();
        let result = fx
            .coordinator
            .relay("conn-a", signal(SignalKind::CallOffer, "", Some("bob")));
        assert!(matches!(result, Err(SignalError::MissingCaller(_))));
    }

    #[test]
    fn test_offer_without_target_is_rejected() {
        let fx = Fixture::new();
        let _rx = fx.join("conn-a", "alice");
        let result = fx
            .coordinator
            .relay("conn-a", signal(SignalKind::CallOffer, "alice", None));
        assert!(matches!(result, Err(SignalError::MissingTarget(_))));
    }

    #[test]
    fn test_targeted_request_stays_in_pair_room() {
        let fx = Fixture::new();
        let mut rx_a = fx.join("conn-a", "alice");
        let mut rx_b = fx.join("conn-b", "bob");
        let mut rx_c = fx.join("conn-c", "carol");

        fx.coordinator
            .relay("conn-a", signal(SignalKind::CallRequest, "alice", Some("bob")))
            .unwrap();

        assert_eq!(signals(&drain(&mut rx_b)).len(), 1);
        assert!(signals(&drain(&mut rx_c)).is_empty());
        // The sender is excluded from its own relay.
        assert!(signals(&drain(&mut rx_a)).is_empty());

        let members = fx.registry.room_members("alice-bob");
        assert!(members.contains(&"conn-a".to_string()));
        assert!(members.contains(&"conn-b".to_string()));
        assert!(!members.contains(&"conn-c".to_string()));
    }

    #[test]
    fn test_untargeted_request_reaches_whole_session() {
        let fx = Fixture::new();
        let _rx_a = fx.join("conn-a", "alice");
        let mut rx_b = fx.join("conn-b", "bob");
        let mut rx_c = fx.join("conn-c", "carol");

        fx.coordinator
            .relay("conn-a", signal(SignalKind::CallRequest, "alice", None))
            .unwrap();

        assert_eq!(signals(&drain(&mut rx_b)).len(), 1);
        assert_eq!(signals(&drain(&mut rx_c)).len(), 1);
    }

    #[test]
    fn test_relay_stamps_sender_connection() {
        let fx = Fixture::new();
        let _rx_a = fx.join("conn-a", "alice");
        let mut rx_b = fx.join("conn-b", "bob");

        fx.coordinator
            .relay("conn-a", signal(SignalKind::CallOffer, "alice", Some("bob")))
            .unwrap();

        let events = drain(&mut rx_b);
        let relayed = signals(&events);
        assert_eq!(relayed[0].sender_conn.as_deref(), Some("conn-a"));
        // Payload passes through untouched.
        assert_eq!(relayed[0].payload["sdp"], "v=0");
    }

    #[test]
    fn test_offline_target_is_reported() {
        let fx = Fixture::new();
        let _rx_a = fx.join("conn-a", "alice");

        let result = fx
            .coordinator
            .relay("conn-a", signal(SignalKind::CallOffer, "alice", Some("bob")));
        assert!(matches!(
            result,
            Err(SignalError::TargetOffline { ref target, .. }) if target == "bob"
        ));
    }

    #[test]
    fn test_pair_room_survives_reconnect() {
        let fx = Fixture::new();
        let _rx_a = fx.join("conn-a", "alice");
        let _rx_b = fx.join("conn-b", "bob");

        fx.coordinator
            .relay("conn-a", signal(SignalKind::CallOffer, "alice", Some("bob")))
            .unwrap();

        // bob refreshes: new connection id, same display name.
        fx.registry.leave("conn-b");
        let mut rx_b2 = fx.join("conn-b2", "bob");

        fx.coordinator
            .relay(
                "conn-a",
                signal(SignalKind::IceCandidate, "alice", Some("bob")),
            )
            .unwrap();

        let events = drain(&mut rx_b2);
        assert_eq!(signals(&events).len(), 1);
    }
}
