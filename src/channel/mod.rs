//! Channel pipeline (C7): length framing, compression, handshake/keepalive,
//! and the application dedup/forward dispatcher.

pub mod connection;
pub mod dispatch;
pub mod error;
pub mod handshake;
pub mod messages;
#[cfg(feature = "disk-reputation")]
pub mod reputation;
pub mod stats;

pub use connection::{Channel, Direction, TaskState};
pub use dispatch::{DedupFilter, ForwardSelector, SourceCache};
pub use error::{ChannelError, ChannelResult};
pub use handshake::{HandshakeDriver, HandshakeOutcome, HandshakeState, Keepalive, KeepaliveAction};
pub use messages::{Disconnect, DisconnectReason, Hello, Status, TransportMessage};
#[cfg(feature = "disk-reputation")]
pub use reputation::{ReputationEntry, ReputationError, ReputationStore};
pub use stats::ChannelStats;
