//! Real-time audio pipeline: sources, sinks and the transformer nodes that
//! sit between a capture device and a playback device.
//!
//! Frames travel between nodes over bounded channels; the channel closing is
//! end-of-stream and tears the receiving node down (close cascade).

mod augment;
mod convert;
mod fanin;
mod fanout;
mod frame;
mod node;

pub mod devices;

pub use augment::{AugmentNode, SampleTransform, Volume};
pub use convert::{ConvertNode, FormatConverter, SCRATCH_CAPACITY};
pub use fanin::FanIn;
pub use fanout::{FanOut, SINK_TIMEOUT};
pub use frame::{frame_channel, DeviceProperties, FrameRx, FrameTx, PcmFrame, FRAME_CHANNEL_CAPACITY};
pub use node::{connect, Sink, Source};

#[derive(Debug, thiserror::Error)]
pub enum AudioError {
    #[error("source closed or output stream already taken")]
    SourceClosed,
    #[error("sink already attached")]
    SinkAlreadyAttached,
    #[error("property mismatch: expected {expected:?}, got {actual:?}")]
    PropertyMismatch {
        expected: DeviceProperties,
        actual: DeviceProperties,
    },
    #[error("frame of {len} samples exceeds capacity {capacity}")]
    OversizedFrame { len: usize, capacity: usize },
    #[error("sink exceeded its back-pressure deadline")]
    DeadlinedSink,
    #[error("invalid device properties: {0}")]
    InvalidProperties(String),
    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("device error: {0}")]
    DeviceError(#[from] cpal::DevicesError),
}

pub type Result<T> = std::result::Result<T, AudioError>;
