//! GOConnect Network Layer
//!
//! Provides the agent's network primitives:
//! - Virtual TUN interface for overlay traffic
//! - Encrypted QUIC transport with peer lifecycle
//! - STUN probing for reflexive-address discovery
//! - Peer liveness registry

pub mod endpoint;
pub mod error;
pub mod frame;
pub mod peers;
pub mod quic;
pub mod stun;
pub mod tun;

pub use endpoint::{EndpointCallback, EndpointObservation};
pub use error::{NetworkError, NetworkResult};
pub use frame::{encode_frame, FrameDecoder, MAX_FRAME_BYTES};
pub use peers::{Peer, PeerRegistry};
pub use quic::{PacketTransport, QuicManager, QuicManagerConfig, TransportState, ALPN};
pub use tun::{create_device, Device, StubDevice, DEFAULT_MTU, INTERFACE_NAME};
