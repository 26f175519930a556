//! peer-io wire protocol: message types, version, service tag.

use serde::{Deserialize, Serialize};

use crate::identity::{PeerId, PublicKey};

/// Current protocol version. Carried in beacons and the transport handshake.
pub const PROTOCOL_VERSION: u8 = 1;

/// Discovery channel tag. Beacons for other services are ignored.
pub const SERVICE_TAG: &str = "peer-io";

/// All wire message types. Encoding is bincode; framing is length-prefix
/// (see wire module). Payload kind is carried by the enum tag; receivers
/// route on it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// Discovery: advertise presence on the multicast channel.
    Beacon {
        protocol_version: u8,
        service_tag: String,
        peer_id: PeerId,
        public_key: PublicKey,
        /// Random per-process ID; lets peers tell a restarted node from a live one.
        session_id: [u8; 16],
        display_name: String,
        listen_port: u16,
    },
    /// Unicast answer to a beacon: ack and advertise self.
    DiscoveryResponse {
        protocol_version: u8,
        service_tag: String,
        peer_id: PeerId,
        public_key: PublicKey,
        session_id: [u8; 16],
        display_name: String,
        listen_port: u16,
    },
    /// Liveness heartbeat.
    Heartbeat { peer_id: PeerId },
    /// User text. Delivered to the text handler verbatim.
    Text { body: String },
    /// Opaque, already-encoded image bytes. Delivered to the image handler.
    Image { bytes: Vec<u8> },
    /// Delivery acknowledgment; fires the sender's pending send callback.
    Checked,
    /// Graceful disconnect announcement.
    Disconnect,
}
