//! Per-peer wiring: lifecycle state machine, the send and receive audio
//! chains around the codec engine, and the latency heartbeat.

mod heartbeat;
mod peer;

pub use peer::{Peer, PeerFactory, PeerRole, PeerSink, PeerSource};

use roundtable_audio::{AudioError, DeviceProperties};
use roundtable_codec::{CodecDescriptor, CodecError, FrameDuration};
use roundtable_transport::TransportError;

#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("no codecs configured")]
    NoCodecs,
    #[error("peer closed")]
    Closed,
    #[error("send sink already attached")]
    AlreadyAttached,
    #[error("receive stream already taken")]
    StreamTaken,
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
    #[error("codec: {0}")]
    Codec(#[from] CodecError),
    #[error("audio: {0}")]
    Audio(#[from] AudioError),
}

pub type Result<T> = std::result::Result<T, PeerError>;

/// Lifecycle: `New -> Connecting -> Connected -> Closed`; transport failure
/// or disconnect short-circuits to `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    Connecting,
    Connected,
    Closed,
}

/// Everything the factory needs to build one peer's pipeline.
#[derive(Clone)]
pub struct PeerConfig {
    /// Ordered codec preference list; the first entry is offered.
    pub codecs: Vec<CodecDescriptor>,
    pub frame_duration: FrameDuration,
    pub safety_factor: usize,
    /// Format of the local capture side; the peer's send sink accepts this.
    pub capture_properties: DeviceProperties,
    /// Format of the local playback side; the peer's receive source emits
    /// this.
    pub playback_properties: DeviceProperties,
}
