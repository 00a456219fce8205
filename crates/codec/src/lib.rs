//! Opus framing: codec descriptors, negotiation and the per-peer
//! encoder/decoder engine with its buffering discipline.

mod descriptor;
mod engine;

pub use descriptor::{
    negotiate, parse_codec_list, CodecDescriptor, FrameDuration, OPUS_SAMPLE_RATES,
};
pub use engine::{CodecEngine, EncodeOutcome, DEFAULT_SAFETY_FACTOR, MAX_ENCODED_FRAME_BYTES};

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("frame of {len} samples exceeds free capacity {free}")]
    OversizedFrame { len: usize, free: usize },
    #[error("unsupported codec: {0}")]
    UnsupportedCodec(String),
    #[error("invalid frame duration: {0} ms")]
    InvalidFrameDuration(f64),
    #[error("invalid safety factor: {0}")]
    InvalidSafetyFactor(usize),
    #[error("opus: {0}")]
    Opus(#[from] opus::Error),
}

pub type Result<T> = std::result::Result<T, CodecError>;
