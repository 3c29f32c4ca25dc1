#![deny(unsafe_code)]
//! Block replication between peers over a pluggable byte transport.
//!
//! The pieces, bottom up: the closed [`SyncMessage`] wire protocol with
//! length-prefix [`framing`] for stream transports, the JSON identity
//! [`handshake`], the [`Transport`] seam with an in-memory hub, the
//! [`PeerManager`] driving discovery → handshake → peer lifecycle, and
//! the [`Synchronizer`] running the announce/want/request/deliver loop
//! against a block store and DAG index.

pub mod framing;
pub mod handshake;
pub mod manager;
pub mod messages;
pub mod peer;
pub mod synchronizer;
pub mod transport;

pub use handshake::{HandshakeError, HandshakeMessage};
pub use manager::{PeerManager, PeerManagerConfig, PeerManagerError, PeerManagerStats, RoutedMessage};
pub use messages::{SyncMessage, WireError};
pub use peer::{Peer, PeerEvent};
pub use synchronizer::{SyncConfig, SyncError, SyncEvent, SyncStats, Synchronizer};
pub use transport::{IncomingBytes, MemoryHub, MemoryTransport, Transport, TransportDevice, TransportError};
