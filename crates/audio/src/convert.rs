//! Channel-count and sample-rate conversion between two edge formats.
//!
//! Conversions are applied in a fixed order: channel layout first, then
//! rate. Resampling runs per channel (planar internally for stereo) through
//! an FFT-based fixed-ratio resampler fed in fixed chunks; partial chunks
//! are held back until enough input accumulates.

use rubato::{FftFixedIn, Resampler};
use tokio_util::sync::CancellationToken;

use crate::frame::{frame_channel, DeviceProperties, FrameRx, FrameTx, PcmFrame};
use crate::node::{Sink, Source};
use crate::{AudioError, Result};

/// Reusable scratch capacity in samples; frames that would not fit are
/// rejected with `OversizedFrame`.
pub const SCRATCH_CAPACITY: usize = 16_384;

/// Input frames (per channel) handed to the resampler per process call.
const RESAMPLER_CHUNK: usize = 256;

/// FFT sub-chunk count; two sub-chunks trade a little latency for quality.
const RESAMPLER_SUB_CHUNKS: usize = 2;

fn mono_to_stereo(input: &[f32], out: &mut Vec<f32>) {
    out.clear();
    out.reserve(input.len() * 2);
    for &s in input {
        out.push(s);
        out.push(s);
    }
}

fn stereo_to_mono(input: &[f32], out: &mut Vec<f32>) {
    out.clear();
    out.reserve(input.len() / 2);
    // An odd trailing sample has no pair and is discarded.
    for pair in input.chunks_exact(2) {
        out.push((pair[0] + pair[1]) / 2.0);
    }
}

/// Fixed-ratio resampler that accepts arbitrary-length interleaved input by
/// buffering up to whole chunks.
struct ChunkResampler {
    resampler: FftFixedIn<f32>,
    pending: Vec<f32>,
    channels: usize,
}

impl ChunkResampler {
    fn new(from_rate: u32, to_rate: u32, channels: usize) -> Result<Self> {
        let resampler = FftFixedIn::<f32>::new(
            from_rate as usize,
            to_rate as usize,
            RESAMPLER_CHUNK,
            RESAMPLER_SUB_CHUNKS,
            channels,
        )
        .map_err(|e| AudioError::InvalidProperties(format!("resampler: {e}")))?;

        Ok(Self {
            resampler,
            pending: Vec::with_capacity(RESAMPLER_CHUNK * channels * 2),
            channels,
        })
    }

    /// Feed interleaved samples; returns whatever full chunks produced,
    /// which may be empty while input accumulates.
    fn process(&mut self, interleaved: &[f32]) -> Vec<f32> {
        self.pending.extend_from_slice(interleaved);

        let chunk_len = RESAMPLER_CHUNK * self.channels;
        let mut out = Vec::new();

        while self.pending.len() >= chunk_len {
            let chunk: Vec<f32> = self.pending.drain(..chunk_len).collect();

            let mut planar = vec![Vec::with_capacity(RESAMPLER_CHUNK); self.channels];
            for frame in chunk.chunks_exact(self.channels) {
                for (ch, &s) in frame.iter().enumerate() {
                    planar[ch].push(s);
                }
            }

            match self.resampler.process(&planar, None) {
                Ok(resampled) => {
                    if resampled.is_empty() {
                        continue;
                    }
                    let frames = resampled[0].len();
                    out.reserve(frames * self.channels);
                    for i in 0..frames {
                        for channel in &resampled {
                            out.push(channel[i]);
                        }
                    }
                }
                Err(e) => tracing::warn!(error = %e, "resampler chunk failed, dropping"),
            }
        }

        out
    }
}

/// The pure conversion core: synchronous, no channels, unit-testable.
pub struct FormatConverter {
    input: DeviceProperties,
    output: DeviceProperties,
    resampler: Option<ChunkResampler>,
    scratch: Vec<f32>,
}

impl FormatConverter {
    pub fn new(input: DeviceProperties, output: DeviceProperties) -> Result<Self> {
        DeviceProperties::new(input.sample_rate, input.channels)?;
        DeviceProperties::new(output.sample_rate, output.channels)?;

        let resampler = if input.sample_rate != output.sample_rate {
            // Channel conversion runs first, so the resampler sees the
            // output channel count.
            Some(ChunkResampler::new(
                input.sample_rate,
                output.sample_rate,
                output.channels as usize,
            )?)
        } else {
            None
        };

        Ok(Self {
            input,
            output,
            resampler,
            scratch: Vec::with_capacity(SCRATCH_CAPACITY),
        })
    }

    pub fn input_properties(&self) -> DeviceProperties {
        self.input
    }

    pub fn output_properties(&self) -> DeviceProperties {
        self.output
    }

    /// Convert one frame of interleaved samples. Output may be empty while
    /// the resampler accumulates input.
    pub fn convert(&mut self, samples: &[f32]) -> Result<Vec<f32>> {
        if samples.len() > SCRATCH_CAPACITY {
            return Err(AudioError::OversizedFrame {
                len: samples.len(),
                capacity: SCRATCH_CAPACITY,
            });
        }

        let converted: &[f32] = match (self.input.channels, self.output.channels) {
            (1, 2) => {
                if samples.len() * 2 > SCRATCH_CAPACITY {
                    return Err(AudioError::OversizedFrame {
                        len: samples.len() * 2,
                        capacity: SCRATCH_CAPACITY,
                    });
                }
                mono_to_stereo(samples, &mut self.scratch);
                &self.scratch
            }
            (2, 1) => {
                stereo_to_mono(samples, &mut self.scratch);
                &self.scratch
            }
            _ => samples,
        };

        match &mut self.resampler {
            Some(r) => Ok(r.process(converted)),
            None => Ok(converted.to_vec()),
        }
    }
}

/// Pass-through node wrapping `FormatConverter`: a Sink on the input format
/// and a Source on the output format.
pub struct ConvertNode {
    converter: Option<FormatConverter>,
    input: DeviceProperties,
    output: DeviceProperties,
    tx: Option<FrameTx>,
    rx: Option<FrameRx>,
    cancel: CancellationToken,
}

impl ConvertNode {
    pub fn new(input: DeviceProperties, output: DeviceProperties) -> Result<Self> {
        let converter = FormatConverter::new(input, output)?;
        let (tx, rx) = frame_channel();
        Ok(Self {
            converter: Some(converter),
            input,
            output,
            tx: Some(tx),
            rx: Some(rx),
            cancel: CancellationToken::new(),
        })
    }
}

impl Sink for ConvertNode {
    fn properties(&self) -> DeviceProperties {
        self.input
    }

    fn attach(&mut self, mut input: FrameRx) -> Result<()> {
        let Some(tx) = self.tx.take() else {
            return Err(AudioError::SinkAlreadyAttached);
        };
        let mut converter = self
            .converter
            .take()
            .ok_or(AudioError::SinkAlreadyAttached)?;
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    frame = input.recv() => {
                        let Some(frame) = frame else { break };
                        match converter.convert(frame.samples()) {
                            Ok(out) if out.is_empty() => {}
                            Ok(out) => {
                                tokio::select! {
                                    _ = cancel.cancelled() => break,
                                    sent = tx.send(PcmFrame::new(out)) => {
                                        if sent.is_err() {
                                            break;
                                        }
                                    }
                                }
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "dropping unconvertible frame");
                            }
                        }
                    }
                }
            }
            tracing::debug!("format conversion ended");
        });

        Ok(())
    }
}

impl Source for ConvertNode {
    fn properties(&self) -> DeviceProperties {
        self.output
    }

    fn output_stream(&mut self) -> Result<FrameRx> {
        if self.cancel.is_cancelled() {
            return Err(AudioError::SourceClosed);
        }
        self.rx.take().ok_or(AudioError::SourceClosed)
    }

    fn close(&self) {
        self.cancel.cancel();
    }
}
