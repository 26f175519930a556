//! peer-io session protocol reference implementation.
//! Host-driven: no I/O; the daemon feeds frames and ticks, the session
//! returns application events and outbound frames.

pub mod identity;
pub mod payload;
pub mod protocol;
pub mod session;
pub mod wire;

pub use identity::{Keypair, PeerId, PublicKey};
pub use protocol::{Message, PROTOCOL_VERSION, SERVICE_TAG};
pub use session::{Event, Outbound, PeerSession, PeerState, Step};
pub use wire::{decode_frame, encode_frame, FrameError};
