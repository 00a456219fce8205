//! The P2P transport surface the audio core consumes.
//!
//! The real session layer (ICE/DTLS/SRTP) lives behind these traits; the
//! core only needs per-peer ordered byte frames for encoded audio, labelled
//! side channels for small control messages, a negotiated codec descriptor
//! per track, and lifecycle state callbacks. The `memory` module provides
//! an in-process implementation so the whole pipeline runs without a
//! network.

pub mod memory;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use roundtable_codec::CodecDescriptor;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("invalid session description: {0}")]
    InvalidDescription(String),
    #[error("unknown session: {0}")]
    UnknownSession(Uuid),
    #[error("transport closed")]
    Closed,
    #[error("track closed")]
    TrackClosed,
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Session lifecycle as reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Opaque session description exchanged through signalling.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SessionDescription(pub serde_json::Value);

pub type StateHandler = Arc<dyn Fn(TransportState) + Send + Sync>;
pub type InboundTrackHandler =
    Arc<dyn Fn(Arc<dyn InboundTrack>, CodecDescriptor) + Send + Sync>;
pub type SideChannelHandler = Arc<dyn Fn(Arc<dyn SideChannel>) + Send + Sync>;
pub type MessageHandler = Arc<dyn Fn(Bytes) + Send + Sync>;

#[async_trait]
pub trait Transport: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription>;
    async fn create_answer(&self) -> Result<SessionDescription>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<()>;
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;

    /// Resolves once candidate gathering is complete and the local
    /// description is ready to ship.
    async fn await_ice_gathering(&self);

    async fn add_outbound_track(
        &self,
        codec: CodecDescriptor,
    ) -> Result<Arc<dyn OutboundTrack>>;
    fn on_inbound_track(&self, handler: InboundTrackHandler);

    async fn create_side_channel(&self, label: &str) -> Result<Arc<dyn SideChannel>>;
    fn on_side_channel(&self, handler: SideChannelHandler);

    fn on_state_change(&self, handler: StateHandler);
    fn state(&self) -> TransportState;

    async fn close(&self);
}

#[async_trait]
pub trait OutboundTrack: Send + Sync {
    fn codec(&self) -> CodecDescriptor;
    async fn write_sample(&self, payload: Bytes, duration: Duration) -> Result<()>;
}

#[async_trait]
pub trait InboundTrack: Send + Sync {
    fn codec(&self) -> CodecDescriptor;
    /// Next encoded frame, in order. Fails with `TrackClosed` at end.
    async fn read(&self) -> Result<Bytes>;
}

#[async_trait]
pub trait SideChannel: Send + Sync {
    fn label(&self) -> String;
    async fn send(&self, payload: Bytes) -> Result<()>;
    fn on_message(&self, handler: MessageHandler);
}

#[derive(Debug, Clone, Default)]
pub struct TransportConfig {
    pub ice_servers: Vec<String>,
}

/// Builds one transport per peer session.
pub trait TransportFactory: Send + Sync {
    fn create(&self, config: &TransportConfig) -> Result<Arc<dyn Transport>>;
}
