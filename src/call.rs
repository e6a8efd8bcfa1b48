//! Call State Machine
//!
//! Client-side logic driving call setup, renegotiation, device toggling,
//! failure recovery and teardown. Each directed peer link is a pure
//! event-in/actions-out machine, so it can be tested without a live
//! transport; the `CallManager` generalizes links to a mesh (one link per
//! remote member, no media server) and owns the local device handle.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use crate::media::{DeviceManager, LocalMedia, MediaConstraints, MediaError};
use crate::protocol::{CallSignal, SignalKind};

/// What kind of call a link carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallMedia {
    Audio,
    Video,
}

impl CallMedia {
    pub fn constraints(self) -> MediaConstraints {
        match self {
            CallMedia::Audio => MediaConstraints::audio_only(),
            CallMedia::Video => MediaConstraints::audio_video(),
        }
    }
}

/// Timing knobs for a link.
#[derive(Debug, Clone, Copy)]
pub struct CallTuning {
    /// How long a caller waits for any answer before giving up.
    pub answer_timeout: Duration,
    /// First reconnect delay; doubles per attempt.
    pub reconnect_base_delay: Duration,
    pub max_reconnect_attempts: u32,
}

impl Default for CallTuning {
    fn default() -> Self {
        Self {
            answer_timeout: Duration::from_secs(30),
            reconnect_base_delay: Duration::from_secs(2),
            max_reconnect_attempts: 3,
        }
    }
}

/// Link lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    /// Caller side: request sent, waiting for an answer.
    Calling,
    /// Callee side: request received, waiting for the user to accept.
    Ringing,
    Negotiating,
    Connected,
    Reconnecting,
    Closed(CloseReason),
}

/// Why a link closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Hangup,
    RemoteHangup,
    Declined,
    NotAnswered,
    ConnectionFailed,
    MediaFailed,
}

/// Everything that can happen to a link.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    // Local user intent
    Dial { media: CallMedia, group: bool },
    Accept,
    Decline,
    HangUp,
    SetAudio(bool),
    SetVideo(bool),
    // Local plumbing results
    MediaReady,
    MediaFailed(MediaError),
    OfferReady { sdp: String },
    AnswerReady { sdp: String },
    // Relayed envelopes from the peer
    RemoteRequest { media: CallMedia },
    RemoteOffer { sdp: String },
    RemoteAnswer { sdp: String },
    RemoteIce { candidate: Value },
    RemoteEnd { declined: bool },
    RemoteStreamState { audio: bool, video: bool },
    RemoteStateRequest,
    RemoteStateResponse { in_call: bool },
    // Transport notifications
    TransportConnected,
    TransportDisconnected,
    TransportClosed,
    // Timers
    AnswerTimeout,
    ReconnectTick,
}

/// What a link asks its driver to do.
#[derive(Debug, Clone)]
pub enum LinkAction {
    /// Ship a signaling envelope to the peer.
    Send { kind: SignalKind, payload: Value },
    AcquireMedia { constraints: MediaConstraints },
    ReleaseMedia,
    CreateOffer,
    CreateAnswer { remote_sdp: String },
    ApplyRemoteAnswer { sdp: String },
    ApplyIce { candidate: Value },
    AddVideoTrack,
    SetTrackEnabled { audio: bool, video: bool },
    RestartIce,
    StartAnswerTimer,
    CancelAnswerTimer,
    ScheduleReconnect { delay: Duration },
    /// Surface an accept/decline affordance to the user.
    RingIncoming { media: CallMedia },
    RemoteMediaChanged { audio: bool, video: bool },
    Closed(CloseReason),
}

/// State machine for one directed peer link.
#[derive(Debug)]
pub struct PeerLink {
    pub peer: String,
    state: LinkState,
    media: CallMedia,
    tuning: CallTuning,
    initiator: bool,
    /// The callee pressed accept (media may still be pending).
    accepted: bool,
    media_acquired: bool,
    remote_desc_applied: bool,
    /// Offer that arrived before accept or before media was ready.
    pending_remote_offer: Option<String>,
    /// Candidates that arrived before the remote description was applied.
    pending_ice: Vec<Value>,
    local_audio: bool,
    local_video: bool,
    has_video_track: bool,
    remote_audio: bool,
    remote_video: bool,
    reconnect_attempts: u32,
}

impl PeerLink {
    pub fn new(peer: String, tuning: CallTuning) -> Self {
        Self {
            peer,
            state: LinkState::Idle,
            media: CallMedia::Video,
            tuning,
            initiator: false,
            accepted: false,
            media_acquired: false,
            remote_desc_applied: false,
            pending_remote_offer: None,
            pending_ice: Vec::new(),
            local_audio: true,
            local_video: false,
            has_video_track: false,
            remote_audio: true,
            remote_video: true,
            reconnect_attempts: 0,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        !matches!(self.state, LinkState::Idle | LinkState::Closed(_))
    }

    /// "In a call" for the purposes of state resynchronization.
    pub fn in_call(&self) -> bool {
        matches!(
            self.state,
            LinkState::Negotiating | LinkState::Connected | LinkState::Reconnecting
        )
    }

    /// Feed one event through the machine; returns the actions the driver
    /// must carry out, in order.
    pub fn handle(&mut self, event: LinkEvent) -> Vec<LinkAction> {
        use LinkEvent::*;
        use LinkState::*;

        match (self.state, event) {
            // ---- outgoing call -------------------------------------------------
            (Idle, Dial { media, group }) => {
                self.state = Calling;
                self.initiator = true;
                self.media = media;
                self.local_audio = true;
                self.local_video = media == CallMedia::Video;
                self.has_video_track = media == CallMedia::Video;
                // A group-marked request is a mesh link-dial; the receiving
                // member recognizes it and skips the ring.
                let payload = if group {
                    json!({ "media": media, "group": true })
                } else {
                    json!({ "media": media })
                };
                vec![
                    LinkAction::AcquireMedia {
                        constraints: media.constraints(),
                    },
                    LinkAction::Send {
                        kind: SignalKind::CallRequest,
                        payload,
                    },
                    LinkAction::StartAnswerTimer,
                ]
            }
            (Calling, MediaReady) => {
                self.media_acquired = true;
                vec![LinkAction::CreateOffer]
            }
            (Calling, OfferReady { sdp }) => vec![LinkAction::Send {
                kind: SignalKind::CallOffer,
                payload: json!({ "sdp": sdp, "media": self.media }),
            }],
            (Calling, RemoteAnswer { sdp }) => {
                self.state = Negotiating;
                self.remote_desc_applied = true;
                let mut actions = vec![
                    LinkAction::CancelAnswerTimer,
                    LinkAction::ApplyRemoteAnswer { sdp },
                ];
                actions.extend(self.flush_ice());
                actions
            }
            (Calling, AnswerTimeout) => {
                self.close_actions(CloseReason::NotAnswered, Some("no_answer"))
            }
            (Calling, RemoteEnd { declined }) => {
                let reason = if declined {
                    CloseReason::Declined
                } else {
                    CloseReason::RemoteHangup
                };
                self.close_actions(reason, None)
            }

            // ---- incoming call -------------------------------------------------
            (Idle, RemoteRequest { media }) => {
                self.state = Ringing;
                self.initiator = false;
                self.media = media;
                // No media is acquired until the user accepts; surprising
                // permission prompts are worse than a short accept delay.
                vec![LinkAction::RingIncoming { media }]
            }
            (Ringing, RemoteOffer { sdp }) => {
                self.pending_remote_offer = Some(sdp);
                vec![]
            }
            (Ringing, Accept) => {
                self.state = Negotiating;
                self.accepted = true;
                self.local_audio = true;
                self.local_video = self.media == CallMedia::Video;
                self.has_video_track = self.media == CallMedia::Video;
                vec![LinkAction::AcquireMedia {
                    constraints: self.media.constraints(),
                }]
            }
            (Ringing, Decline | HangUp) => self.close_actions(CloseReason::Declined, Some("declined")),
            (Ringing, RemoteEnd { .. }) => {
                // Caller gave up before we answered.
                self.state = Closed(CloseReason::RemoteHangup);
                vec![LinkAction::Closed(CloseReason::RemoteHangup)]
            }

            (Negotiating, MediaReady) => {
                self.media_acquired = true;
                match self.pending_remote_offer.take() {
                    Some(sdp) => {
                        self.remote_desc_applied = true;
                        let mut actions = vec![LinkAction::CreateAnswer { remote_sdp: sdp }];
                        actions.extend(self.flush_ice());
                        actions
                    }
                    None => vec![],
                }
            }
            (Negotiating, RemoteOffer { sdp }) => {
                if self.media_acquired {
                    self.remote_desc_applied = true;
                    let mut actions = vec![LinkAction::CreateAnswer { remote_sdp: sdp }];
                    actions.extend(self.flush_ice());
                    actions
                } else {
                    self.pending_remote_offer = Some(sdp);
                    vec![]
                }
            }
            (Negotiating, AnswerReady { sdp }) => vec![LinkAction::Send {
                kind: SignalKind::CallAnswer,
                payload: json!({ "sdp": sdp }),
            }],
            (Negotiating, RemoteAnswer { sdp }) => {
                // Answer to a renegotiation offer.
                self.remote_desc_applied = true;
                let mut actions = vec![LinkAction::ApplyRemoteAnswer { sdp }];
                actions.extend(self.flush_ice());
                actions
            }
            (Negotiating, TransportConnected) => {
                self.state = Connected;
                self.reconnect_attempts = 0;
                vec![LinkAction::CancelAnswerTimer]
            }
            (Negotiating, TransportDisconnected) => {
                self.close_actions(CloseReason::ConnectionFailed, Some("connection_failed"))
            }

            // ---- established call ----------------------------------------------
            (Connected, RemoteOffer { sdp }) => {
                // Renegotiation, e.g. the peer added a video track.
                vec![LinkAction::CreateAnswer { remote_sdp: sdp }]
            }
            (Connected, RemoteAnswer { sdp }) => vec![LinkAction::ApplyRemoteAnswer { sdp }],
            (Connected, OfferReady { sdp }) => vec![LinkAction::Send {
                kind: SignalKind::CallOffer,
                payload: json!({ "sdp": sdp, "media": self.media }),
            }],
            (Connected, AnswerReady { sdp }) => vec![LinkAction::Send {
                kind: SignalKind::CallAnswer,
                payload: json!({ "sdp": sdp }),
            }],
            (Connected, TransportDisconnected) => {
                self.state = Reconnecting;
                self.reconnect_attempts = 0;
                vec![LinkAction::ScheduleReconnect {
                    delay: self.tuning.reconnect_base_delay,
                }]
            }

            // ---- recovery ------------------------------------------------------
            (Reconnecting, ReconnectTick) => {
                if self.reconnect_attempts >= self.tuning.max_reconnect_attempts {
                    return self
                        .close_actions(CloseReason::ConnectionFailed, Some("connection_failed"));
                }
                self.reconnect_attempts += 1;
                let delay = self.tuning.reconnect_base_delay * 2u32.pow(self.reconnect_attempts);
                let mut actions = vec![LinkAction::RestartIce];
                if self.initiator {
                    actions.push(LinkAction::CreateOffer);
                }
                actions.push(LinkAction::ScheduleReconnect { delay });
                actions
            }
            (Reconnecting, TransportConnected) => {
                self.state = Connected;
                self.reconnect_attempts = 0;
                vec![]
            }
            (Reconnecting, OfferReady { sdp }) => vec![LinkAction::Send {
                kind: SignalKind::CallOffer,
                payload: json!({ "sdp": sdp, "media": self.media }),
            }],
            (Reconnecting, RemoteAnswer { sdp }) => {
                let mut actions = vec![LinkAction::ApplyRemoteAnswer { sdp }];
                actions.extend(self.flush_ice());
                actions
            }

            // ---- events valid in several states --------------------------------
            (Negotiating | Connected | Reconnecting, RemoteIce { candidate }) => {
                if self.remote_desc_applied {
                    vec![LinkAction::ApplyIce { candidate }]
                } else {
                    self.pending_ice.push(candidate);
                    vec![]
                }
            }
            (Calling | Ringing, RemoteIce { candidate }) => {
                self.pending_ice.push(candidate);
                vec![]
            }
            (Negotiating | Connected | Reconnecting, RemoteEnd { .. }) => {
                self.close_actions(CloseReason::RemoteHangup, None)
            }
            (Calling | Negotiating | Connected | Reconnecting, HangUp) => {
                self.close_actions(CloseReason::Hangup, Some("hangup"))
            }
            (Calling | Ringing | Negotiating | Connected | Reconnecting, MediaFailed(e)) => {
                log::warn!("media acquisition failed for {}: {}", self.peer, e);
                self.close_actions(CloseReason::MediaFailed, Some("media_error"))
            }
            (Connected | Reconnecting | Negotiating, SetAudio(enabled)) => {
                if !self.media_acquired {
                    return vec![];
                }
                self.local_audio = enabled;
                self.stream_state_actions()
            }
            (Connected | Reconnecting | Negotiating, SetVideo(enabled)) => {
                if !self.media_acquired {
                    return vec![];
                }
                self.local_video = enabled;
                if enabled && !self.has_video_track {
                    // Adding a track where none existed is the one toggle
                    // that does require renegotiation.
                    self.has_video_track = true;
                    let mut actions = vec![LinkAction::AddVideoTrack, LinkAction::CreateOffer];
                    actions.extend(self.stream_state_actions());
                    actions
                } else {
                    self.stream_state_actions()
                }
            }
            (_, RemoteStreamState { audio, video }) => {
                self.remote_audio = audio;
                self.remote_video = video;
                vec![LinkAction::RemoteMediaChanged { audio, video }]
            }
            (_, RemoteStateRequest) => vec![LinkAction::Send {
                kind: SignalKind::CallStateResponse,
                payload: json!({ "in_call": self.in_call(), "media": self.media }),
            }],
            (Negotiating | Connected | Reconnecting, RemoteStateResponse { in_call }) => {
                if in_call {
                    vec![]
                } else {
                    // The peer no longer considers us in a call; tear down.
                    self.close_actions(CloseReason::RemoteHangup, None)
                }
            }
            (Calling | Ringing | Negotiating | Connected | Reconnecting, TransportClosed) => {
                self.close_actions(CloseReason::ConnectionFailed, None)
            }

            (state, event) => {
                log::debug!("ignoring {:?} in state {:?} for {}", event, state, self.peer);
                vec![]
            }
        }
    }

    fn stream_state_actions(&self) -> Vec<LinkAction> {
        vec![
            LinkAction::SetTrackEnabled {
                audio: self.local_audio,
                video: self.local_video,
            },
            LinkAction::Send {
                kind: SignalKind::StreamState,
                payload: json!({ "audio": self.local_audio, "video": self.local_video }),
            },
        ]
    }

    /// Common teardown: optionally notify the peer, always release media
    /// that was acquired, and report the close reason.
    fn close_actions(&mut self, reason: CloseReason, notify: Option<&str>) -> Vec<LinkAction> {
        let was_calling = self.state == LinkState::Calling;
        self.state = LinkState::Closed(reason);
        let mut actions = Vec::new();
        if was_calling {
            actions.push(LinkAction::CancelAnswerTimer);
        }
        if let Some(why) = notify {
            actions.push(LinkAction::Send {
                kind: SignalKind::CallEnd,
                payload: json!({ "reason": why }),
            });
        }
        if self.media_acquired {
            actions.push(LinkAction::ReleaseMedia);
            self.media_acquired = false;
        }
        actions.push(LinkAction::Closed(reason));
        actions
    }

    fn flush_ice(&mut self) -> Vec<LinkAction> {
        std::mem::take(&mut self.pending_ice)
            .into_iter()
            .map(|candidate| LinkAction::ApplyIce { candidate })
            .collect()
    }
}

/// Timer kinds a driver must arm for a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkTimer {
    Answer(Duration),
    Reconnect(Duration),
}

/// Manager-level outputs, ready for the client's event loop.
#[derive(Debug)]
pub enum CallOutput {
    /// Envelope to ship to the server.
    Signal(CallSignal),
    /// Operation for the WebRTC driver on one peer link.
    Transport { peer: String, action: LinkAction },
    /// Surface an incoming call to the user.
    Incoming { peer: String, media: CallMedia },
    RemoteMedia {
        peer: String,
        audio: bool,
        video: bool,
    },
    LinkClosed { peer: String, reason: CloseReason },
    StartTimer { peer: String, timer: LinkTimer },
    CancelAnswerTimer { peer: String },
}

/// Drives one link per remote member (mesh topology: N-1 links for N
/// members, an accepted scaling ceiling) and owns the local media handle,
/// releasing it when the last link closes.
pub struct CallManager {
    session_id: String,
    self_name: String,
    devices: DeviceManager,
    tuning: CallTuning,
    media: Option<LocalMedia>,
    links: HashMap<String, PeerLink>,
    /// In a group call, incoming mesh requests are auto-accepted.
    group: bool,
}

impl CallManager {
    pub fn new(session_id: String, self_name: String, devices: DeviceManager) -> Self {
        Self::with_tuning(session_id, self_name, devices, CallTuning::default())
    }

    pub fn with_tuning(
        session_id: String,
        self_name: String,
        devices: DeviceManager,
        tuning: CallTuning,
    ) -> Self {
        Self {
            session_id,
            self_name,
            devices,
            tuning,
            media: None,
            links: HashMap::new(),
            group: false,
        }
    }

    /// Start a one-to-one call.
    pub fn start_call(&mut self, peer: &str, media: CallMedia) -> Vec<CallOutput> {
        self.dispatch(peer, LinkEvent::Dial { media, group: false })
    }

    /// Join (or start) a group call: broadcast a group-marked announce to
    /// the session. Every member already in the call dials us back with one
    /// new link, so a joiner ends up with one link per existing member.
    pub fn join_group(&mut self, media: CallMedia) -> Vec<CallOutput> {
        self.group = true;
        vec![CallOutput::Signal(CallSignal {
            kind: SignalKind::CallRequest,
            session_id: self.session_id.clone(),
            caller_name: self.self_name.clone(),
            target_user: None,
            payload: json!({ "media": media, "group": true }),
            sender_conn: None,
        })]
    }

    /// A new member announced itself to the group call; as an existing
    /// member we initiate the one new link toward them.
    pub fn peer_joined(&mut self, peer: &str, media: CallMedia) -> Vec<CallOutput> {
        if !self.group || peer == self.self_name {
            return Vec::new();
        }
        self.dispatch(peer, LinkEvent::Dial { media, group: true })
    }

    pub fn accept(&mut self, peer: &str) -> Vec<CallOutput> {
        self.dispatch(peer, LinkEvent::Accept)
    }

    pub fn decline(&mut self, peer: &str) -> Vec<CallOutput> {
        self.dispatch(peer, LinkEvent::Decline)
    }

    pub fn hang_up(&mut self, peer: &str) -> Vec<CallOutput> {
        self.dispatch(peer, LinkEvent::HangUp)
    }

    pub fn hang_up_all(&mut self) -> Vec<CallOutput> {
        self.group = false;
        let peers: Vec<String> = self
            .links
            .values()
            .filter(|l| l.is_active())
            .map(|l| l.peer.clone())
            .collect();
        let mut out = Vec::new();
        for peer in peers {
            out.extend(self.dispatch(&peer, LinkEvent::HangUp));
        }
        out
    }

    /// Toggle the microphone on every active link.
    pub fn set_audio(&mut self, enabled: bool) -> Vec<CallOutput> {
        self.toggle(LinkEvent::SetAudio(enabled))
    }

    /// Toggle the camera on every active link.
    pub fn set_video(&mut self, enabled: bool) -> Vec<CallOutput> {
        self.toggle(LinkEvent::SetVideo(enabled))
    }

    fn toggle(&mut self, event: LinkEvent) -> Vec<CallOutput> {
        let peers: Vec<String> = self
            .links
            .values()
            .filter(|l| l.is_active())
            .map(|l| l.peer.clone())
            .collect();
        let mut out = Vec::new();
        for peer in peers {
            out.extend(self.dispatch(&peer, event.clone()));
        }
        out
    }

    /// Feed a relayed envelope from the server into the right link.
    pub fn handle_signal(&mut self, signal: &CallSignal) -> Vec<CallOutput> {
        if signal.caller_name == self.self_name {
            // Our own broadcast echoed back.
            return Vec::new();
        }
        let peer = signal.caller_name.clone();
        let payload = &signal.payload;

        let event = match signal.kind {
            SignalKind::CallRequest => {
                let media = parse_media(payload);
                let group_marked = payload["group"].as_bool().unwrap_or(false);
                if signal.target_user.is_none() {
                    // Untargeted group announce: members already in the
                    // call each dial the announcer; bystanders ignore it.
                    return if self.group && group_marked {
                        self.peer_joined(&peer, media)
                    } else {
                        log::debug!("ignoring group announce from {}", peer);
                        Vec::new()
                    };
                }
                let mut out = self.dispatch(&peer, LinkEvent::RemoteRequest { media });
                if self.group && group_marked {
                    // Mesh link-dial inside a group call we already agreed
                    // to join. A plain request always rings.
                    out.extend(self.dispatch(&peer, LinkEvent::Accept));
                }
                return out;
            }
            SignalKind::CallOffer => match payload["sdp"].as_str() {
                Some(sdp) => LinkEvent::RemoteOffer {
                    sdp: sdp.to_string(),
                },
                None => {
                    log::warn!("call_offer from {} without sdp", peer);
                    return Vec::new();
                }
            },
            SignalKind::CallAnswer => match payload["sdp"].as_str() {
                Some(sdp) => LinkEvent::RemoteAnswer {
                    sdp: sdp.to_string(),
                },
                None => {
                    log::warn!("call_answer from {} without sdp", peer);
                    return Vec::new();
                }
            },
            SignalKind::IceCandidate => LinkEvent::RemoteIce {
                candidate: payload["candidate"].clone(),
            },
            SignalKind::CallEnd => LinkEvent::RemoteEnd {
                declined: payload["reason"] == "declined",
            },
            SignalKind::StreamState => LinkEvent::RemoteStreamState {
                audio: payload["audio"].as_bool().unwrap_or(true),
                video: payload["video"].as_bool().unwrap_or(false),
            },
            SignalKind::CallStateRequest => LinkEvent::RemoteStateRequest,
            SignalKind::CallStateResponse => LinkEvent::RemoteStateResponse {
                in_call: payload["in_call"].as_bool().unwrap_or(false),
            },
        };

        self.dispatch(&peer, event)
    }

    /// Ask a peer whether it still considers us in a call; used after a
    /// lost-and-regained connection.
    pub fn request_state_sync(&self, peer: &str) -> CallSignal {
        CallSignal {
            kind: SignalKind::CallStateRequest,
            session_id: self.session_id.clone(),
            caller_name: self.self_name.clone(),
            target_user: Some(peer.to_string()),
            payload: Value::Null,
            sender_conn: None,
        }
    }

    pub fn offer_ready(&mut self, peer: &str, sdp: String) -> Vec<CallOutput> {
        self.dispatch(peer, LinkEvent::OfferReady { sdp })
    }

    pub fn answer_ready(&mut self, peer: &str, sdp: String) -> Vec<CallOutput> {
        self.dispatch(peer, LinkEvent::AnswerReady { sdp })
    }

    pub fn transport_connected(&mut self, peer: &str) -> Vec<CallOutput> {
        self.dispatch(peer, LinkEvent::TransportConnected)
    }

    pub fn transport_disconnected(&mut self, peer: &str) -> Vec<CallOutput> {
        self.dispatch(peer, LinkEvent::TransportDisconnected)
    }

    pub fn transport_closed(&mut self, peer: &str) -> Vec<CallOutput> {
        self.dispatch(peer, LinkEvent::TransportClosed)
    }

    pub fn answer_timeout(&mut self, peer: &str) -> Vec<CallOutput> {
        self.dispatch(peer, LinkEvent::AnswerTimeout)
    }

    pub fn reconnect_tick(&mut self, peer: &str) -> Vec<CallOutput> {
        self.dispatch(peer, LinkEvent::ReconnectTick)
    }

    pub fn link_state(&self, peer: &str) -> Option<LinkState> {
        self.links.get(peer).map(|l| l.state())
    }

    pub fn active_peers(&self) -> Vec<String> {
        self.links
            .values()
            .filter(|l| l.is_active())
            .map(|l| l.peer.clone())
            .collect()
    }

    pub fn in_call(&self) -> bool {
        self.links.values().any(|l| l.in_call())
    }

    pub fn media_acquired(&self) -> bool {
        self.media.is_some()
    }

    fn dispatch(&mut self, peer: &str, event: LinkEvent) -> Vec<CallOutput> {
        // A closed link is history; a new call to the same peer starts a
        // fresh machine.
        if matches!(event, LinkEvent::Dial { .. } | LinkEvent::RemoteRequest { .. }) {
            if self.links.get(peer).map(|l| !l.is_active()).unwrap_or(false) {
                self.links.remove(peer);
            }
        }
        let mut queue = VecDeque::from([event]);
        let mut out = Vec::new();
        while let Some(event) = queue.pop_front() {
            let tuning = self.tuning;
            let link = self
                .links
                .entry(peer.to_string())
                .or_insert_with(|| PeerLink::new(peer.to_string(), tuning));
            let actions = link.handle(event);
            for action in actions {
                self.apply(peer, action, &mut queue, &mut out);
            }
        }
        // An event that never moved the link out of Idle was a stray for a
        // peer we have no call with; keep no entry for it.
        if self
            .links
            .get(peer)
            .map(|l| l.state() == LinkState::Idle)
            .unwrap_or(false)
        {
            self.links.remove(peer);
        }
        out
    }

    fn apply(
        &mut self,
        peer: &str,
        action: LinkAction,
        queue: &mut VecDeque<LinkEvent>,
        out: &mut Vec<CallOutput>,
    ) {
        match action {
            LinkAction::Send { kind, payload } => out.push(CallOutput::Signal(CallSignal {
                kind,
                session_id: self.session_id.clone(),
                caller_name: self.self_name.clone(),
                target_user: Some(peer.to_string()),
                payload,
                sender_conn: None,
            })),
            LinkAction::AcquireMedia { constraints } => {
                if self.media.is_some() {
                    queue.push_back(LinkEvent::MediaReady);
                } else {
                    match self.devices.acquire_with_fallback(constraints) {
                        Ok(media) => {
                            self.media = Some(media);
                            queue.push_back(LinkEvent::MediaReady);
                        }
                        Err(e) => queue.push_back(LinkEvent::MediaFailed(e)),
                    }
                }
            }
            LinkAction::ReleaseMedia => self.release_if_last(),
            LinkAction::SetTrackEnabled { audio, video } => {
                if let Some(media) = &mut self.media {
                    media.set_audio(audio);
                    if !media.set_video(video) {
                        log::debug!("video toggle for {} needs a track first", peer);
                    }
                }
                out.push(CallOutput::Transport {
                    peer: peer.to_string(),
                    action: LinkAction::SetTrackEnabled { audio, video },
                });
            }
            LinkAction::AddVideoTrack => {
                if let Some(media) = &mut self.media {
                    media.add_video_track();
                }
                out.push(CallOutput::Transport {
                    peer: peer.to_string(),
                    action: LinkAction::AddVideoTrack,
                });
            }
            LinkAction::StartAnswerTimer => out.push(CallOutput::StartTimer {
                peer: peer.to_string(),
                timer: LinkTimer::Answer(self.tuning.answer_timeout),
            }),
            LinkAction::ScheduleReconnect { delay } => out.push(CallOutput::StartTimer {
                peer: peer.to_string(),
                timer: LinkTimer::Reconnect(delay),
            }),
            LinkAction::CancelAnswerTimer => out.push(CallOutput::CancelAnswerTimer {
                peer: peer.to_string(),
            }),
            LinkAction::RingIncoming { media } => out.push(CallOutput::Incoming {
                peer: peer.to_string(),
                media,
            }),
            LinkAction::RemoteMediaChanged { audio, video } => out.push(CallOutput::RemoteMedia {
                peer: peer.to_string(),
                audio,
                video,
            }),
            LinkAction::Closed(reason) => {
                self.release_if_last();
                out.push(CallOutput::LinkClosed {
                    peer: peer.to_string(),
                    reason,
                });
            }
            // Pure transport operations pass through to the driver.
            action @ (LinkAction::CreateOffer
            | LinkAction::CreateAnswer { .. }
            | LinkAction::ApplyRemoteAnswer { .. }
            | LinkAction::ApplyIce { .. }
            | LinkAction::RestartIce) => out.push(CallOutput::Transport {
                peer: peer.to_string(),
                action,
            }),
        }
    }

    /// Release the device handle once no link still needs it.
    fn release_if_last(&mut self) {
        if self.links.values().any(|l| l.is_active()) {
            return;
        }
        if let Some(mut media) = self.media.take() {
            media.release();
        }
    }
}

fn parse_media(payload: &Value) -> CallMedia {
    serde_json::from_value(payload["media"].clone()).unwrap_or(CallMedia::Video)
}
