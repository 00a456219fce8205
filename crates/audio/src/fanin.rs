//! Additive mixer: a dynamic set of inbound streams, one timed outbound.
//!
//! Each source buffers about one second of audio in its own ring. A tick
//! loop at the configured frame duration sums whichever sources have a full
//! frame ready, clamps, and publishes without ever blocking. Sources that
//! cannot fill a frame this tick contribute silence; their samples are never
//! rescheduled into a later tick.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use ringbuf::{
    traits::{Consumer, Observer, Producer, Split},
    HeapCons, HeapRb,
};
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::frame::{frame_channel, DeviceProperties, FrameRx, PcmFrame};
use crate::node::Source;
use crate::{AudioError, Result};

struct SourceEntry {
    id: u64,
    consumer: Mutex<HeapCons<f32>>,
    finished: Arc<AtomicBool>,
}

pub struct FanIn {
    props: DeviceProperties,
    frame_duration: Duration,
    sources: Arc<RwLock<Vec<SourceEntry>>>,
    next_id: AtomicU64,
    rx: Option<FrameRx>,
    cancel: CancellationToken,
}

impl FanIn {
    /// Create the mixer and start its tick loop. The first frame is
    /// published one frame duration after creation.
    pub fn new(props: DeviceProperties, frame_duration: Duration) -> Self {
        let (tx, rx) = frame_channel();
        let sources: Arc<RwLock<Vec<SourceEntry>>> = Arc::new(RwLock::new(Vec::new()));
        let cancel = CancellationToken::new();

        let frame_len = props.samples_per(frame_duration);
        let loop_sources = sources.clone();
        let loop_cancel = cancel.clone();

        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + frame_duration;
            let mut ticker = tokio::time::interval_at(start, frame_duration);
            // Skip missed ticks instead of catching up; a stall must not
            // burst stale audio afterwards.
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            let mut mix = vec![0.0f32; frame_len];
            let mut scratch = vec![0.0f32; frame_len];

            loop {
                tokio::select! {
                    _ = loop_cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                mix.fill(0.0);
                let mut remove = Vec::new();
                {
                    let sources = loop_sources.read().expect("fan-in source list poisoned");
                    for entry in sources.iter() {
                        if entry.finished.load(Ordering::Acquire) {
                            remove.push(entry.id);
                            continue;
                        }
                        let mut consumer =
                            entry.consumer.lock().expect("fan-in consumer poisoned");
                        if consumer.occupied_len() >= frame_len {
                            let n = consumer.pop_slice(&mut scratch);
                            for (m, s) in mix.iter_mut().zip(&scratch[..n]) {
                                *m += s;
                            }
                        }
                        // Short this tick: silent contribution.
                    }
                }

                if !remove.is_empty() {
                    let mut sources =
                        loop_sources.write().expect("fan-in source list poisoned");
                    sources.retain(|e| !remove.contains(&e.id));
                    tracing::debug!(removed = remove.len(), "fan-in sources ended");
                }

                for s in mix.iter_mut() {
                    *s = s.clamp(-1.0, 1.0);
                }

                match tx.try_send(PcmFrame::new(mix.clone())) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        tracing::debug!("fan-in outbound back-pressured, dropping frame");
                    }
                    Err(TrySendError::Closed(_)) => break,
                }
            }
            tracing::debug!("fan-in mix loop ended");
        });

        Self {
            props,
            frame_duration,
            sources,
            next_id: AtomicU64::new(0),
            rx: Some(rx),
            cancel,
        }
    }

    pub fn frame_duration(&self) -> Duration {
        self.frame_duration
    }

    /// Attach one inbound stream. Its samples buffer in a ring holding one
    /// second of audio; overflow beyond that is dropped.
    pub fn add_source(&self, mut input: FrameRx) {
        if self.cancel.is_cancelled() {
            return;
        }

        let ring = HeapRb::<f32>::new(self.props.samples_per_second());
        let (mut producer, consumer) = ring.split();
        let finished = Arc::new(AtomicBool::new(false));
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        self.sources
            .write()
            .expect("fan-in source list poisoned")
            .push(SourceEntry {
                id,
                consumer: Mutex::new(consumer),
                finished: finished.clone(),
            });
        tracing::debug!(source = id, "fan-in source added");

        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = cancel.cancelled() => break,
                    frame = input.recv() => frame,
                };
                let Some(frame) = frame else {
                    finished.store(true, Ordering::Release);
                    break;
                };
                let pushed = producer.push_slice(frame.samples());
                if pushed < frame.len() {
                    tracing::warn!(
                        source = id,
                        dropped = frame.len() - pushed,
                        "fan-in ring overflow"
                    );
                }
            }
        });
    }

    /// Property-checked variant of `add_source` for wiring whole nodes.
    pub fn attach_source(&self, source: &mut dyn Source) -> Result<()> {
        let actual = source.properties();
        if actual != self.props {
            return Err(AudioError::PropertyMismatch {
                expected: self.props,
                actual,
            });
        }
        self.add_source(source.output_stream()?);
        Ok(())
    }

    pub fn source_count(&self) -> usize {
        self.sources
            .read()
            .expect("fan-in source list poisoned")
            .len()
    }
}

impl Source for FanIn {
    fn properties(&self) -> DeviceProperties {
        self.props
    }

    fn output_stream(&mut self) -> Result<FrameRx> {
        if self.cancel.is_cancelled() {
            return Err(AudioError::SourceClosed);
        }
        self.rx.take().ok_or(AudioError::SourceClosed)
    }

    fn close(&self) {
        self.cancel.cancel();
        self.sources
            .write()
            .expect("fan-in source list poisoned")
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::frame_channel;

    const FRAME: Duration = Duration::from_millis(20);

    /// Magnitude of the signal's correlation with a sine at `freq`.
    fn tone_magnitude(samples: &[f32], rate: f32, freq: f32) -> f32 {
        let mut re = 0.0f64;
        let mut im = 0.0f64;
        for (i, &s) in samples.iter().enumerate() {
            let phase = 2.0 * std::f64::consts::PI * freq as f64 * i as f64 / rate as f64;
            re += s as f64 * phase.cos();
            im += s as f64 * phase.sin();
        }
        ((re * re + im * im).sqrt() / samples.len() as f64) as f32
    }

    fn sine(freq: f32, amplitude: f32, rate: u32, channels: u16, frames: usize) -> Vec<PcmFrame> {
        let per_frame = rate as usize / 50;
        let mut out = Vec::new();
        let mut n = 0usize;
        for _ in 0..frames {
            let mut samples = Vec::with_capacity(per_frame * channels as usize);
            for _ in 0..per_frame {
                let v = amplitude
                    * (2.0 * std::f32::consts::PI * freq * n as f32 / rate as f32).sin();
                for _ in 0..channels {
                    samples.push(v);
                }
                n += 1;
            }
            out.push(PcmFrame::new(samples));
        }
        out
    }

    #[tokio::test]
    async fn test_zero_sources_emit_silence() {
        let mut node = FanIn::new(DeviceProperties::mono(48_000), FRAME);
        let mut out = node.output_stream().unwrap();
        let frame = out.recv().await.unwrap();
        assert_eq!(frame.len(), 960);
        assert!(frame.samples().iter().all(|&s| s == 0.0));
    }

    #[tokio::test]
    async fn test_short_source_contributes_silence() {
        let mut node = FanIn::new(DeviceProperties::mono(48_000), FRAME);
        let mut out = node.output_stream().unwrap();
        let (tx, rx) = frame_channel();
        node.add_source(rx);

        // 100 samples is far short of the 960-sample frame.
        tx.send(PcmFrame::new(vec![0.7; 100])).await.unwrap();
        let frame = out.recv().await.unwrap();
        assert!(frame.samples().iter().all(|&s| s == 0.0));
        drop(tx);
    }

    #[tokio::test]
    async fn test_exact_frame_single_additive_pass() {
        let mut node = FanIn::new(DeviceProperties::mono(48_000), FRAME);
        let mut out = node.output_stream().unwrap();
        let (tx, rx) = frame_channel();
        node.add_source(rx);

        tx.send(PcmFrame::new(vec![0.3; 960])).await.unwrap();

        let mut saw_tone = false;
        for _ in 0..10 {
            let frame = out.recv().await.unwrap();
            if frame.samples()[0] != 0.0 {
                assert!(frame.samples().iter().all(|&s| (s - 0.3).abs() < 1e-6));
                saw_tone = true;
                break;
            }
        }
        assert!(saw_tone, "buffered frame never mixed");

        // No residual: the next frames are silent again.
        let frame = out.recv().await.unwrap();
        assert!(frame.samples().iter().all(|&s| s == 0.0));
        drop(tx);
    }

    #[tokio::test]
    async fn test_mix_clips_to_unit_range() {
        let mut node = FanIn::new(DeviceProperties::mono(48_000), FRAME);
        let mut out = node.output_stream().unwrap();
        let (tx_a, rx_a) = frame_channel();
        let (tx_b, rx_b) = frame_channel();
        node.add_source(rx_a);
        node.add_source(rx_b);

        tx_a.send(PcmFrame::new(vec![0.8; 960])).await.unwrap();
        tx_b.send(PcmFrame::new(vec![0.8; 960])).await.unwrap();

        let mut saw_clipped = false;
        for _ in 0..10 {
            let frame = out.recv().await.unwrap();
            assert!(frame.samples().iter().all(|&s| s.abs() <= 1.0));
            if frame.samples()[0] == 1.0 {
                saw_clipped = true;
                break;
            }
        }
        assert!(saw_clipped, "sum of 1.6 never observed as clamped 1.0");
        drop(tx_a);
        drop(tx_b);
    }

    #[tokio::test]
    async fn test_mix_two_sines_has_both_tones() {
        let props = DeviceProperties::stereo(48_000);
        let mut node = FanIn::new(props, FRAME);
        let mut out = node.output_stream().unwrap();
        let (tx_a, rx_a) = frame_channel();
        let (tx_b, rx_b) = frame_channel();
        node.add_source(rx_a);
        node.add_source(rx_b);

        let feeder = tokio::spawn(async move {
            let a = sine(440.0, 0.4, 48_000, 2, 30);
            let b = sine(660.0, 0.4, 48_000, 2, 30);
            for (fa, fb) in a.into_iter().zip(b) {
                let _ = tx_a.send(fa).await;
                let _ = tx_b.send(fb).await;
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        });

        let mut left = Vec::new();
        while left.len() < 24_000 {
            let frame = out.recv().await.unwrap();
            assert_eq!(frame.len(), 1920);
            assert!(frame.samples().iter().all(|&s| s.abs() <= 1.0));
            for pair in frame.samples().chunks_exact(2) {
                left.push(pair[0]);
            }
        }
        feeder.await.unwrap();

        // Trim leading silence before the sources filled.
        let start = left.iter().position(|&s| s != 0.0).unwrap_or(0);
        let signal = &left[start..];

        let m440 = tone_magnitude(signal, 48_000.0, 440.0);
        let m660 = tone_magnitude(signal, 48_000.0, 660.0);
        let m550 = tone_magnitude(signal, 48_000.0, 550.0);
        assert!(m440 > 5.0 * m550, "440 Hz not dominant: {m440} vs {m550}");
        assert!(m660 > 5.0 * m550, "660 Hz not dominant: {m660} vs {m550}");
    }

    #[tokio::test]
    async fn test_ended_source_removed() {
        let node = FanIn::new(DeviceProperties::mono(48_000), FRAME);
        let (tx, rx) = frame_channel();
        node.add_source(rx);
        assert_eq!(node.source_count(), 1);

        drop(tx);
        tokio::time::sleep(FRAME * 3).await;
        assert_eq!(node.source_count(), 0);
    }

    #[tokio::test]
    async fn test_close_idempotent() {
        let mut node = FanIn::new(DeviceProperties::mono(48_000), FRAME);
        let mut out = node.output_stream().unwrap();
        node.close();
        node.close();
        // Mix loop exits and the outbound stream drains to a close.
        while out.recv().await.is_some() {}
        assert!(node.output_stream().is_err());
    }
}
