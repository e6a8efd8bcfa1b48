//! Huddle - Session Chat and Call Signaling Library
//!
//! This library provides core functionality for token-based chat
//! sessions, message routing, WebRTC call signaling relay and the
//! client-side call state machine.

pub mod protocol;
pub mod session;
pub mod router;
pub mod signaling;
pub mod call;
pub mod media;
pub mod snapshot;
pub mod config;

pub use protocol::{ClientEvent, ServerEvent, CallSignal, SignalKind};
pub use session::{Session, SessionRegistry, Participant};
pub use router::MessageRouter;
pub use signaling::SignalingCoordinator;
pub use call::{CallManager, PeerLink};
pub use config::{ServerConfig, ClientConfig};
