//! The per-peer, per-direction Opus engine.
//!
//! Incoming PCM accumulates in a compacting buffer and is encoded one
//! `frame_size` window at a time into a reusable byte buffer; the returned
//! views stay valid until the next `encode` call (the borrow enforces
//! this). Decoded samples land in a wrapping buffer the same way. The
//! engine is not thread-safe; the pipeline gives each direction exactly one
//! driver task.

use opus::{Application, Channels};

use crate::descriptor::{CodecDescriptor, FrameDuration};
use crate::{CodecError, Result};

pub const DEFAULT_SAFETY_FACTOR: usize = 16;

/// Opus never emits more than 1275 bytes for a single frame; round up a
/// little for headroom. The encoded buffer is sized by this bound, one slot
/// per window the PCM buffer can hold.
pub const MAX_ENCODED_FRAME_BYTES: usize = 1500;

/// Encoded views produced by one `encode` call, in input order, plus the
/// error that stopped the call early if a window failed to encode.
pub struct EncodeOutcome<'a> {
    pub frames: Vec<&'a [u8]>,
    pub window_error: Option<CodecError>,
}

pub struct CodecEngine {
    descriptor: CodecDescriptor,
    frame_duration: FrameDuration,
    frame_size: usize,
    capacity: usize,

    encoder: opus::Encoder,
    decoder: opus::Decoder,

    // PCM awaiting encoding: live samples are pcm[pcm_start..].
    pcm: Vec<f32>,
    pcm_start: usize,

    encoded: Vec<u8>,

    decoded: Vec<f32>,
    decoded_pos: usize,
    // Largest possible single decode: Opus caps frames at 120 ms.
    max_decode: usize,
}

impl CodecEngine {
    pub fn new(
        descriptor: CodecDescriptor,
        frame_duration: FrameDuration,
        safety_factor: usize,
    ) -> Result<Self> {
        if safety_factor == 0 {
            return Err(CodecError::InvalidSafetyFactor(safety_factor));
        }

        let channels = match descriptor.channels {
            1 => Channels::Mono,
            2 => Channels::Stereo,
            _ => return Err(CodecError::UnsupportedCodec(descriptor.name())),
        };

        let mut encoder =
            opus::Encoder::new(descriptor.clock_rate, channels, Application::Voip)?;
        encoder.set_inband_fec(true)?;
        let decoder = opus::Decoder::new(descriptor.clock_rate, channels)?;

        let frame_size = frame_duration.frame_size(descriptor);
        let capacity = safety_factor * frame_size;
        let max_decode =
            (descriptor.clock_rate as usize * 120 / 1000) * descriptor.channels as usize;

        Ok(Self {
            descriptor,
            frame_duration,
            frame_size,
            capacity,
            encoder,
            decoder,
            pcm: Vec::with_capacity(capacity),
            pcm_start: 0,
            encoded: vec![0u8; safety_factor * MAX_ENCODED_FRAME_BYTES],
            decoded: vec![0.0f32; capacity.max(max_decode)],
            decoded_pos: 0,
            max_decode,
        })
    }

    pub fn descriptor(&self) -> CodecDescriptor {
        self.descriptor
    }

    pub fn frame_duration(&self) -> FrameDuration {
        self.frame_duration
    }

    /// Interleaved samples per encoded window.
    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Samples buffered but not yet covering a whole window.
    pub fn residual(&self) -> usize {
        self.pcm.len() - self.pcm_start
    }

    /// Append PCM and encode every complete window.
    ///
    /// Emits exactly `floor(buffered / frame_size)` frames and retains the
    /// remainder for the next call. A window the encoder rejects is skipped
    /// and ends the call early with the error attached.
    pub fn encode(&mut self, pcm: &[f32]) -> Result<EncodeOutcome<'_>> {
        let live = self.residual();
        if pcm.len() > self.capacity - live {
            return Err(CodecError::OversizedFrame {
                len: pcm.len(),
                free: self.capacity - live,
            });
        }

        // Compact when the tail cannot take the append.
        if self.pcm.len() + pcm.len() > self.capacity {
            self.pcm.drain(..self.pcm_start);
            self.pcm_start = 0;
        }
        self.pcm.extend_from_slice(pcm);

        let mut spans: Vec<(usize, usize)> = Vec::new();
        let mut write_pos = 0usize;
        let mut window_error = None;

        while self.pcm.len() - self.pcm_start >= self.frame_size {
            let window = &self.pcm[self.pcm_start..self.pcm_start + self.frame_size];
            let out = &mut self.encoded[write_pos..write_pos + MAX_ENCODED_FRAME_BYTES];
            match self.encoder.encode_float(window, out) {
                Ok(len) => {
                    spans.push((write_pos, len));
                    write_pos += len;
                    self.pcm_start += self.frame_size;
                }
                Err(e) => {
                    // Skip the bad window so the stream can continue.
                    self.pcm_start += self.frame_size;
                    window_error = Some(CodecError::Opus(e));
                    break;
                }
            }
        }

        let encoded = &self.encoded;
        Ok(EncodeOutcome {
            frames: spans
                .into_iter()
                .map(|(off, len)| &encoded[off..off + len])
                .collect(),
            window_error,
        })
    }

    /// Decode one packet; the returned view is valid until the next call.
    /// Decoder errors propagate with no buffer state change.
    pub fn decode(&mut self, packet: &[u8]) -> Result<&[f32]> {
        if self.decoded_pos + self.max_decode > self.decoded.len() {
            self.decoded_pos = 0;
        }
        let out = &mut self.decoded[self.decoded_pos..self.decoded_pos + self.max_decode];
        let per_channel = self.decoder.decode_float(packet, out, false)?;
        let len = per_channel * self.descriptor.channels as usize;
        let view = &self.decoded[self.decoded_pos..self.decoded_pos + len];
        self.decoded_pos += len;
        Ok(view)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(rate: u32, channels: u16) -> CodecEngine {
        let descriptor = CodecDescriptor {
            clock_rate: rate,
            channels,
        };
        CodecEngine::new(descriptor, FrameDuration::Ms20, DEFAULT_SAFETY_FACTOR).unwrap()
    }

    fn sine(len: usize, freq: f32, rate: f32) -> Vec<f32> {
        (0..len)
            .map(|i| 0.4 * (2.0 * std::f32::consts::PI * freq * i as f32 / rate).sin())
            .collect()
    }

    #[test]
    fn test_framing_residual_sequence() {
        // frame_size = 960 at 48 kHz mono, 20 ms.
        let mut engine = engine(48_000, 1);
        assert_eq!(engine.frame_size(), 960);

        let pcm = sine(500, 440.0, 48_000.0);
        let out = engine.encode(&pcm).unwrap();
        assert_eq!(out.frames.len(), 0);
        assert_eq!(engine.residual(), 500);

        let out = engine.encode(&pcm).unwrap();
        assert_eq!(out.frames.len(), 1);
        assert_eq!(engine.residual(), 40);

        let out = engine.encode(&pcm).unwrap();
        assert_eq!(out.frames.len(), 1);
        assert_eq!(engine.residual(), 80);
    }

    #[test]
    fn test_framing_emits_floor_of_buffered_windows() {
        let mut engine = engine(48_000, 1);
        let pcm = sine(2500, 440.0, 48_000.0);
        let out = engine.encode(&pcm).unwrap();
        assert_eq!(out.frames.len(), 2);
        assert!(out.window_error.is_none());
        for frame in &out.frames {
            assert!(!frame.is_empty());
            assert!(frame.len() <= MAX_ENCODED_FRAME_BYTES);
        }
        assert_eq!(engine.residual(), 580);
    }

    #[test]
    fn test_oversized_input_rejected_without_state_change() {
        let mut engine = engine(48_000, 1);
        engine.encode(&sine(500, 440.0, 48_000.0)).unwrap();

        let capacity = DEFAULT_SAFETY_FACTOR * 960;
        let too_big = vec![0.0f32; capacity - 500 + 1];
        match engine.encode(&too_big) {
            Err(CodecError::OversizedFrame { len, free }) => {
                assert_eq!(len, too_big.len());
                assert_eq!(free, capacity - 500);
            }
            Err(e) => panic!("unexpected error: {e}"),
            Ok(_) => panic!("expected OversizedFrame"),
        }
        assert_eq!(engine.residual(), 500);
    }

    #[test]
    fn test_round_trip_preserves_shape() {
        let mut engine = engine(48_000, 1);
        let pcm = sine(960, 440.0, 48_000.0);
        let packet = {
            let out = engine.encode(&pcm).unwrap();
            assert_eq!(out.frames.len(), 1);
            out.frames[0].to_vec()
        };

        let decoded = engine.decode(&packet).unwrap();
        assert_eq!(decoded.len(), 960);
    }

    #[test]
    fn test_round_trip_stereo_shape() {
        let mut engine = engine(48_000, 2);
        assert_eq!(engine.frame_size(), 1920);
        let pcm = sine(1920, 440.0, 48_000.0);
        let packet = {
            let out = engine.encode(&pcm).unwrap();
            assert_eq!(out.frames.len(), 1);
            out.frames[0].to_vec()
        };
        let decoded = engine.decode(&packet).unwrap();
        assert_eq!(decoded.len(), 1920);
    }

    #[test]
    fn test_decode_invalid_packet_propagates_error() {
        let mut engine = engine(48_000, 1);
        // A lone code-3 TOC byte with no frame-count byte is malformed.
        assert!(engine.decode(&[0x03]).is_err());
    }

    #[test]
    fn test_sustained_encoding_compacts() {
        // Push many odd-sized appends to force compaction repeatedly.
        let mut engine = engine(48_000, 1);
        let pcm = sine(700, 330.0, 48_000.0);
        let mut frames = 0usize;
        for _ in 0..200 {
            let out = engine.encode(&pcm).unwrap();
            assert!(out.window_error.is_none());
            frames += out.frames.len();
        }
        // 140_000 samples total: exactly floor(140000/960) windows.
        assert_eq!(frames, 140_000 / 960);
        assert_eq!(engine.residual(), 140_000 % 960);
    }

    #[test]
    fn test_decoded_ring_wraps() {
        let mut engine = engine(48_000, 1);
        let pcm = sine(960, 440.0, 48_000.0);
        let packet = {
            let out = engine.encode(&pcm).unwrap();
            out.frames[0].to_vec()
        };
        // Decode far past the buffer capacity; every view stays coherent.
        for _ in 0..100 {
            let decoded = engine.decode(&packet).unwrap();
            assert_eq!(decoded.len(), 960);
        }
    }
}
