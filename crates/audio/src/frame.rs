use std::time::Duration;

use tokio::sync::mpsc;

/// Bounded capacity of the frame channels linking pipeline nodes.
///
/// At 20 ms per frame this buffers well over half a second of audio, which is
/// enough slack for scheduling jitter without hiding a genuinely stuck sink.
pub const FRAME_CHANNEL_CAPACITY: usize = 32;

pub type FrameTx = mpsc::Sender<PcmFrame>;
pub type FrameRx = mpsc::Receiver<PcmFrame>;

/// Create a bounded frame channel with the pipeline's standard capacity.
pub fn frame_channel() -> (FrameTx, FrameRx) {
    mpsc::channel(FRAME_CHANNEL_CAPACITY)
}

/// One time-slice of interleaved, normalized float samples in [-1.0, +1.0].
///
/// A frame carries no format metadata of its own; every edge in the pipeline
/// declares its properties up front and frames flowing over that edge conform
/// to them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PcmFrame {
    samples: Vec<f32>,
}

impl PcmFrame {
    pub fn new(samples: Vec<f32>) -> Self {
        Self { samples }
    }

    /// An all-zero frame of `len` samples.
    pub fn silence(len: usize) -> Self {
        Self {
            samples: vec![0.0; len],
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn samples_mut(&mut self) -> &mut [f32] {
        &mut self.samples
    }

    pub fn into_samples(self) -> Vec<f32> {
        self.samples
    }

    /// Wall-clock duration of this frame under the given properties.
    pub fn duration(&self, props: DeviceProperties) -> Duration {
        let per_second = props.samples_per_second();
        if per_second == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples.len() as f64 / per_second as f64)
    }
}

impl From<Vec<f32>> for PcmFrame {
    fn from(samples: Vec<f32>) -> Self {
        Self::new(samples)
    }
}

/// Immutable format of one pipeline edge: sample rate and channel count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DeviceProperties {
    pub sample_rate: u32,
    pub channels: u16,
}

impl DeviceProperties {
    /// Validated constructor; rates must be positive and only mono and
    /// stereo layouts are supported.
    pub fn new(sample_rate: u32, channels: u16) -> crate::Result<Self> {
        if sample_rate == 0 {
            return Err(crate::AudioError::InvalidProperties(
                "sample rate must be positive".to_string(),
            ));
        }
        if channels == 0 || channels > 2 {
            return Err(crate::AudioError::InvalidProperties(format!(
                "unsupported channel count: {channels}"
            )));
        }
        Ok(Self {
            sample_rate,
            channels,
        })
    }

    pub const fn mono(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            channels: 1,
        }
    }

    pub const fn stereo(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            channels: 2,
        }
    }

    /// Interleaved samples flowing per second on an edge with these
    /// properties.
    pub fn samples_per_second(&self) -> usize {
        self.sample_rate as usize * self.channels as usize
    }

    /// Interleaved sample count covering `duration` of audio.
    pub fn samples_per(&self, duration: Duration) -> usize {
        (self.samples_per_second() as f64 * duration.as_secs_f64()).round() as usize
    }
}
