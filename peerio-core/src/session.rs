//! Peer session: peer table, connection state machine, message routing.
//! Host-driven: discovery and transport report what happened, the session
//! returns application events plus frames to put on the wire.

use std::collections::HashMap;
use std::sync::Arc;

use crate::identity::{Keypair, PeerId, PublicKey};
use crate::payload::{self, LegacyPayload};
use crate::protocol::{Message, PROTOCOL_VERSION, SERVICE_TAG};
use crate::wire;

const HEARTBEAT_TIMEOUT_TICKS: u64 = 5;

/// Connection lifecycle of a remote peer. Only ever moves
/// Disconnected -> Connecting -> Connected -> Disconnected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Disconnected,
    Connecting,
    Connected,
}

impl std::fmt::Display for PeerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PeerState::Disconnected => "disconnected",
            PeerState::Connecting => "connecting",
            PeerState::Connected => "connected",
        };
        f.write_str(s)
    }
}

/// Application-facing events. The daemon pushes these onto the single
/// handler queue; they never carry wire encoding details.
#[derive(Debug, Clone)]
pub enum Event {
    /// Text from a peer, exactly as sent.
    Text { from: PeerId, body: String },
    /// Opaque image bytes from a peer.
    Image { from: PeerId, bytes: Vec<u8> },
    /// A peer moved through its connection lifecycle.
    PeerState {
        peer: PeerId,
        display_name: String,
        state: PeerState,
    },
    /// A peer acknowledged delivery of something we sent.
    Acked { from: PeerId },
    /// A peer announced a graceful disconnect.
    Disconnect { from: PeerId },
}

/// A frame for the transport to deliver.
#[derive(Debug, Clone)]
pub enum Outbound {
    Frame { to: PeerId, bytes: Vec<u8> },
}

/// What one call into the session produced.
#[derive(Debug, Default)]
pub struct Step {
    pub events: Vec<Event>,
    pub outbound: Vec<Outbound>,
}

struct PeerEntry {
    display_name: String,
    #[allow(dead_code)]
    public_key: Option<PublicKey>,
    state: PeerState,
    last_seen_tick: u64,
}

/// The local node's session. One per identity.
pub struct PeerSession {
    keypair: Arc<Keypair>,
    session_id: [u8; 16],
    display_name: String,
    peers: HashMap<PeerId, PeerEntry>,
    tick_count: u64,
    heartbeat_timeout_ticks: u64,
}

impl PeerSession {
    pub fn new(display_name: impl Into<String>) -> Self {
        Self::with_keypair(Arc::new(Keypair::generate()), display_name)
    }

    pub fn with_keypair(keypair: Arc<Keypair>, display_name: impl Into<String>) -> Self {
        let mut display_name = display_name.into();
        if display_name.is_empty() {
            display_name = format!("peer-{}", keypair.peer_id().short());
        }
        Self {
            keypair,
            session_id: uuid::Uuid::new_v4().into_bytes(),
            display_name,
            peers: HashMap::new(),
            tick_count: 0,
            heartbeat_timeout_ticks: HEARTBEAT_TIMEOUT_TICKS,
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.keypair.peer_id()
    }

    pub fn public_key(&self) -> &PublicKey {
        self.keypair.public_key()
    }

    pub fn keypair(&self) -> Arc<Keypair> {
        self.keypair.clone()
    }

    pub fn session_id(&self) -> [u8; 16] {
        self.session_id
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// Ticks of heartbeat silence before a peer is considered gone.
    pub fn set_heartbeat_timeout(&mut self, ticks: u64) {
        self.heartbeat_timeout_ticks = ticks;
    }

    pub fn peer_state(&self, id: PeerId) -> Option<PeerState> {
        self.peers.get(&id).map(|e| e.state)
    }

    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.peers
            .iter()
            .filter(|(_, e)| e.state == PeerState::Connected)
            .map(|(&id, _)| id)
            .collect()
    }

    pub fn peer_display_name(&self, id: PeerId) -> String {
        self.peers
            .get(&id)
            .map(|e| e.display_name.clone())
            .unwrap_or_else(|| format!("peer-{}", id.short()))
    }

    /// Discovery beacon for the multicast channel.
    pub fn beacon(&self, listen_port: u16) -> Message {
        Message::Beacon {
            protocol_version: PROTOCOL_VERSION,
            service_tag: SERVICE_TAG.to_string(),
            peer_id: self.peer_id(),
            public_key: self.public_key().clone(),
            session_id: self.session_id,
            display_name: self.display_name.clone(),
            listen_port,
        }
    }

    /// Unicast answer to a received beacon.
    pub fn discovery_response(&self, listen_port: u16) -> Message {
        Message::DiscoveryResponse {
            protocol_version: PROTOCOL_VERSION,
            service_tag: SERVICE_TAG.to_string(),
            peer_id: self.peer_id(),
            public_key: self.public_key().clone(),
            session_id: self.session_id,
            display_name: self.display_name.clone(),
            listen_port,
        }
    }

    /// Discovery saw a peer. Refreshes the table; a previously unknown or
    /// disconnected peer moves to Connecting.
    pub fn on_peer_discovered(
        &mut self,
        id: PeerId,
        display_name: &str,
        public_key: &PublicKey,
    ) -> Step {
        let mut step = Step::default();
        let tick = self.tick_count;
        let entry = self.peers.entry(id).or_insert_with(|| PeerEntry {
            display_name: format!("peer-{}", id.short()),
            public_key: None,
            state: PeerState::Disconnected,
            last_seen_tick: tick,
        });
        if !display_name.is_empty() {
            entry.display_name = display_name.to_string();
        }
        entry.public_key = Some(public_key.clone());
        entry.last_seen_tick = tick;
        if entry.state == PeerState::Disconnected {
            self.transition(id, PeerState::Connecting, &mut step.events);
        }
        step
    }

    /// Transport finished its handshake with a peer.
    pub fn on_peer_connected(&mut self, id: PeerId) -> Step {
        let mut step = Step::default();
        self.touch(id);
        self.transition(id, PeerState::Connected, &mut step.events);
        step
    }

    /// Transport lost a peer (stream closed, connect failed).
    pub fn on_peer_lost(&mut self, id: PeerId) -> Step {
        let mut step = Step::default();
        if self.peers.contains_key(&id) {
            self.transition(id, PeerState::Disconnected, &mut step.events);
        }
        step
    }

    /// Route one decrypted payload from a peer. Tagged frames are the normal
    /// case; anything that fails to decode goes through the legacy
    /// classifier. Unrecognized input produces an empty step.
    pub fn on_frame(&mut self, from: PeerId, plaintext: &[u8]) -> Step {
        let mut step = Step::default();
        self.touch(from);
        match wire::decode_frame(plaintext) {
            Ok((msg, _)) => self.route_message(from, msg, &mut step),
            Err(_) => self.route_legacy(from, plaintext, &mut step),
        }
        step
    }

    fn route_message(&mut self, from: PeerId, msg: Message, step: &mut Step) {
        match msg {
            Message::Text { body } => {
                step.events.push(Event::Text { from, body });
                self.push_ack(from, step);
            }
            Message::Image { bytes } => {
                step.events.push(Event::Image { from, bytes });
                self.push_ack(from, step);
            }
            Message::Checked => {
                step.events.push(Event::Acked { from });
            }
            Message::Disconnect => {
                step.events.push(Event::Disconnect { from });
                self.transition(from, PeerState::Disconnected, &mut step.events);
            }
            Message::Heartbeat { .. } => {
                // Liveness only; touch already happened.
            }
            Message::Beacon {
                protocol_version,
                service_tag,
                peer_id,
                public_key,
                display_name,
                ..
            }
            | Message::DiscoveryResponse {
                protocol_version,
                service_tag,
                peer_id,
                public_key,
                display_name,
                ..
            } => {
                if protocol_version == PROTOCOL_VERSION
                    && service_tag == SERVICE_TAG
                    && peer_id != self.peer_id()
                {
                    let sub = self.on_peer_discovered(peer_id, &display_name, &public_key);
                    step.events.extend(sub.events);
                    step.outbound.extend(sub.outbound);
                }
            }
        }
    }

    fn route_legacy(&mut self, from: PeerId, plaintext: &[u8], step: &mut Step) {
        match payload::classify(plaintext) {
            LegacyPayload::Text(body) => {
                step.events.push(Event::Text { from, body });
                step.outbound.push(Outbound::Frame {
                    to: from,
                    bytes: payload::TOKEN_CHECKED.as_bytes().to_vec(),
                });
            }
            LegacyPayload::Image(bytes) => {
                step.events.push(Event::Image { from, bytes });
                step.outbound.push(Outbound::Frame {
                    to: from,
                    bytes: payload::TOKEN_CHECKED.as_bytes().to_vec(),
                });
            }
            LegacyPayload::Checked => {
                step.events.push(Event::Acked { from });
            }
            LegacyPayload::Disconnect => {
                step.events.push(Event::Disconnect { from });
                self.transition(from, PeerState::Disconnected, &mut step.events);
            }
            LegacyPayload::Unrecognized => {}
        }
    }

    /// Send text to every connected peer. No-op when none are connected.
    pub fn send_text(&self, body: &str) -> Step {
        self.broadcast(Message::Text {
            body: body.to_string(),
        })
    }

    /// Send already-encoded image bytes to every connected peer.
    pub fn send_image(&self, bytes: Vec<u8>) -> Step {
        self.broadcast(Message::Image { bytes })
    }

    /// Announce a graceful disconnect to every connected peer.
    pub fn send_disconnect(&self) -> Step {
        self.broadcast(Message::Disconnect)
    }

    /// Periodic tick: expire silent peers, heartbeat the rest.
    pub fn tick(&mut self) -> Step {
        self.tick_count = self.tick_count.saturating_add(1);
        let mut step = Step::default();

        let overdue: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|(_, e)| {
                e.state != PeerState::Disconnected
                    && self.tick_count.saturating_sub(e.last_seen_tick)
                        > self.heartbeat_timeout_ticks
            })
            .map(|(&id, _)| id)
            .collect();
        for id in overdue {
            self.transition(id, PeerState::Disconnected, &mut step.events);
        }

        let hb = Message::Heartbeat {
            peer_id: self.peer_id(),
        };
        if let Ok(frame) = wire::encode_frame(&hb) {
            for peer in self.connected_peers() {
                step.outbound.push(Outbound::Frame {
                    to: peer,
                    bytes: frame.clone(),
                });
            }
        }
        step
    }

    fn broadcast(&self, msg: Message) -> Step {
        let mut step = Step::default();
        let connected = self.connected_peers();
        if connected.is_empty() {
            return step;
        }
        if let Ok(frame) = wire::encode_frame(&msg) {
            for peer in connected {
                step.outbound.push(Outbound::Frame {
                    to: peer,
                    bytes: frame.clone(),
                });
            }
        }
        step
    }

    fn push_ack(&self, to: PeerId, step: &mut Step) {
        if let Ok(frame) = wire::encode_frame(&Message::Checked) {
            step.outbound.push(Outbound::Frame { to, bytes: frame });
        }
    }

    fn touch(&mut self, id: PeerId) {
        let tick = self.tick_count;
        if let Some(entry) = self.peers.get_mut(&id) {
            entry.last_seen_tick = tick;
        }
    }

    /// Move a peer toward `target`, never skipping a rung of the ladder:
    /// a Connected report on a Disconnected peer emits Connecting first.
    /// Downgrades from Connected to Connecting are stale reports and ignored.
    fn transition(&mut self, id: PeerId, target: PeerState, events: &mut Vec<Event>) {
        let tick = self.tick_count;
        let entry = self.peers.entry(id).or_insert_with(|| PeerEntry {
            display_name: format!("peer-{}", id.short()),
            public_key: None,
            state: PeerState::Disconnected,
            last_seen_tick: tick,
        });
        let current = entry.state;
        if current == target {
            return;
        }
        if current == PeerState::Connected && target == PeerState::Connecting {
            return;
        }
        entry.state = target;
        let display_name = entry.display_name.clone();
        if current == PeerState::Disconnected && target == PeerState::Connected {
            events.push(Event::PeerState {
                peer: id,
                display_name: display_name.clone(),
                state: PeerState::Connecting,
            });
        }
        events.push(Event::PeerState {
            peer: id,
            display_name,
            state: target,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linked_pair() -> (PeerSession, PeerSession) {
        let mut a = PeerSession::new("alice");
        let mut b = PeerSession::new("bob");
        a.on_peer_discovered(b.peer_id(), "bob", b.public_key());
        a.on_peer_connected(b.peer_id());
        b.on_peer_discovered(a.peer_id(), "alice", a.public_key());
        b.on_peer_connected(a.peer_id());
        (a, b)
    }

    fn frame_bytes(step: &Step) -> Vec<Vec<u8>> {
        step.outbound
            .iter()
            .map(|Outbound::Frame { bytes, .. }| bytes.clone())
            .collect()
    }

    #[test]
    fn send_text_with_no_connected_peers_is_noop() {
        let mut session = PeerSession::new("solo");
        let step = session.send_text("anyone there?");
        assert!(step.outbound.is_empty());
        assert!(step.events.is_empty());

        // A peer stuck in Connecting does not count as connected.
        let other = Keypair::generate();
        session.on_peer_discovered(other.peer_id(), "ghost", other.public_key());
        let step = session.send_text("still nothing");
        assert!(step.outbound.is_empty());
    }

    #[test]
    fn send_targets_only_connected_peers() {
        let mut session = PeerSession::new("hub");
        let connected = Keypair::generate();
        let connecting = Keypair::generate();
        session.on_peer_discovered(connected.peer_id(), "c1", connected.public_key());
        session.on_peer_connected(connected.peer_id());
        session.on_peer_discovered(connecting.peer_id(), "c2", connecting.public_key());

        let step = session.send_text("hi");
        assert_eq!(step.outbound.len(), 1);
        let Outbound::Frame { to, .. } = &step.outbound[0];
        assert_eq!(*to, connected.peer_id());
    }

    #[test]
    fn text_roundtrip_delivers_exact_body_and_acks() {
        let (mut a, mut b) = linked_pair();
        let body = "héllo peers ✨";
        let sent = a.send_text(body);
        assert_eq!(sent.outbound.len(), 1);

        let step = b.on_frame(a.peer_id(), &frame_bytes(&sent)[0]);
        match &step.events[..] {
            [Event::Text { from, body: got }] => {
                assert_eq!(*from, a.peer_id());
                assert_eq!(got, body);
            }
            other => panic!("expected one Text event, got {other:?}"),
        }
        // Receiver answers with a delivery acknowledgment.
        assert_eq!(step.outbound.len(), 1);
        let ack_step = a.on_frame(b.peer_id(), &frame_bytes(&step)[0]);
        assert!(
            matches!(&ack_step.events[..], [Event::Acked { from }] if *from == b.peer_id())
        );
    }

    #[test]
    fn image_roundtrip_preserves_bytes() {
        let (a, mut b) = linked_pair();
        let bytes = vec![0xff, 0xd8, 0xff, 0xe0, 9, 8, 7];
        let sent = a.send_image(bytes.clone());
        let step = b.on_frame(a.peer_id(), &frame_bytes(&sent)[0]);
        match &step.events[..] {
            [Event::Image { bytes: got, .. }] => assert_eq!(*got, bytes),
            other => panic!("expected one Image event, got {other:?}"),
        }
        assert_eq!(step.outbound.len(), 1);
    }

    #[test]
    fn disconnect_fires_callback_event_and_drops_peer() {
        let (a, mut b) = linked_pair();
        let sent = a.send_disconnect();
        let step = b.on_frame(a.peer_id(), &frame_bytes(&sent)[0]);
        assert!(step
            .events
            .iter()
            .any(|e| matches!(e, Event::Disconnect { from } if *from == a.peer_id())));
        assert!(step.events.iter().any(|e| matches!(
            e,
            Event::PeerState { state: PeerState::Disconnected, .. }
        )));
        assert_eq!(b.peer_state(a.peer_id()), Some(PeerState::Disconnected));
    }

    #[test]
    fn legacy_text_strips_prefix_once() {
        let (a, mut b) = linked_pair();
        let step = b.on_frame(a.peer_id(), b"msg:hello msg:world");
        match &step.events[..] {
            [Event::Text { body, .. }] => assert_eq!(body, "hello msg:world"),
            other => panic!("expected one Text event, got {other:?}"),
        }
        // Legacy senders get the legacy token back.
        assert_eq!(frame_bytes(&step)[0], b"checked".to_vec());
    }

    #[test]
    fn legacy_control_tokens_route() {
        let (a, mut b) = linked_pair();
        let step = b.on_frame(a.peer_id(), b"checked");
        assert!(matches!(&step.events[..], [Event::Acked { .. }]));

        let step = b.on_frame(a.peer_id(), b"disconnect");
        assert!(step
            .events
            .iter()
            .any(|e| matches!(e, Event::Disconnect { .. })));
    }

    #[test]
    fn unrecognized_payload_is_silently_dropped() {
        let (a, mut b) = linked_pair();
        let step = b.on_frame(a.peer_id(), b"not a frame");
        assert!(step.events.is_empty());
        assert!(step.outbound.is_empty());
        let step = b.on_frame(a.peer_id(), &[0x00, 0xfe, 0x01]);
        assert!(step.events.is_empty());
    }

    #[test]
    fn connected_report_synthesizes_connecting() {
        let mut session = PeerSession::new("watcher");
        let peer = Keypair::generate();
        // Transport reports Connected for a peer discovery never mentioned.
        let step = session.on_peer_connected(peer.peer_id());
        let states: Vec<PeerState> = step
            .events
            .iter()
            .map(|e| match e {
                Event::PeerState { state, .. } => *state,
                other => panic!("unexpected event {other:?}"),
            })
            .collect();
        assert_eq!(states, vec![PeerState::Connecting, PeerState::Connected]);
    }

    #[test]
    fn duplicate_state_reports_emit_nothing() {
        let mut session = PeerSession::new("watcher");
        let peer = Keypair::generate();
        session.on_peer_discovered(peer.peer_id(), "p", peer.public_key());
        session.on_peer_connected(peer.peer_id());
        assert!(session.on_peer_connected(peer.peer_id()).events.is_empty());
        // Stale discovery while connected does not downgrade.
        let step = session.on_peer_discovered(peer.peer_id(), "p", peer.public_key());
        assert!(step.events.is_empty());
        assert_eq!(session.peer_state(peer.peer_id()), Some(PeerState::Connected));
    }

    #[test]
    fn heartbeat_silence_expires_peer() {
        let mut session = PeerSession::new("hub");
        let peer = Keypair::generate();
        session.on_peer_discovered(peer.peer_id(), "p", peer.public_key());
        session.on_peer_connected(peer.peer_id());

        let mut saw_disconnect = false;
        for _ in 0..7 {
            let step = session.tick();
            saw_disconnect |= step.events.iter().any(|e| {
                matches!(e, Event::PeerState { state: PeerState::Disconnected, .. })
            });
        }
        assert!(saw_disconnect);
        assert!(session.connected_peers().is_empty());
    }

    #[test]
    fn heartbeats_keep_peer_alive_and_flow_out() {
        let mut session = PeerSession::new("hub");
        let peer = Keypair::generate();
        session.on_peer_discovered(peer.peer_id(), "p", peer.public_key());
        session.on_peer_connected(peer.peer_id());

        let hb = wire::encode_frame(&Message::Heartbeat {
            peer_id: peer.peer_id(),
        })
        .unwrap();
        for _ in 0..8 {
            let step = session.tick();
            // Each tick heartbeats the connected peer.
            assert_eq!(step.outbound.len(), 1);
            session.on_frame(peer.peer_id(), &hb);
        }
        assert_eq!(session.connected_peers(), vec![peer.peer_id()]);
    }

    #[test]
    fn beacon_carries_identity_and_tag() {
        let session = PeerSession::new("annie");
        match session.beacon(45679) {
            Message::Beacon {
                protocol_version,
                service_tag,
                peer_id,
                display_name,
                listen_port,
                ..
            } => {
                assert_eq!(protocol_version, PROTOCOL_VERSION);
                assert_eq!(service_tag, SERVICE_TAG);
                assert_eq!(peer_id, session.peer_id());
                assert_eq!(display_name, "annie");
                assert_eq!(listen_port, 45679);
            }
            other => panic!("expected Beacon, got {other:?}"),
        }
    }

    #[test]
    fn empty_display_name_defaults_to_short_id() {
        let session = PeerSession::new("");
        let expected = format!("peer-{}", session.peer_id().short());
        assert_eq!(session.display_name(), expected);
    }

    #[test]
    fn foreign_service_tag_beacon_ignored() {
        let (a, mut b) = linked_pair();
        let stranger = Keypair::generate();
        let msg = Message::Beacon {
            protocol_version: PROTOCOL_VERSION,
            service_tag: "other-app".to_string(),
            peer_id: stranger.peer_id(),
            public_key: stranger.public_key().clone(),
            session_id: [0u8; 16],
            display_name: "stranger".to_string(),
            listen_port: 1,
        };
        let frame = wire::encode_frame(&msg).unwrap();
        let step = b.on_frame(a.peer_id(), &frame);
        assert!(step.events.is_empty());
        assert_eq!(b.peer_state(stranger.peer_id()), None);
    }
}
