//! In-place per-sample transforms. Frame properties are unchanged.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::frame::{frame_channel, DeviceProperties, FrameRx, FrameTx};
use crate::node::{Sink, Source};
use crate::{AudioError, Result};

/// One in-place sample transform applied by an `AugmentNode`.
pub trait SampleTransform: Send + Sync {
    fn apply(&self, samples: &mut [f32]);
}

/// Shared volume multiplier, adjustable while the node runs.
///
/// 1.0 is identity, 0.0 mutes; there is no upper cap, clipping is the
/// mixer's job. The value is stored as f32 bits for lock-free updates.
pub struct Volume {
    bits: AtomicU32,
}

impl Volume {
    pub fn new(multiplier: f32) -> Arc<Self> {
        let v = Arc::new(Self {
            bits: AtomicU32::new(1.0f32.to_bits()),
        });
        v.set(multiplier);
        v
    }

    /// Negative multipliers clamp to 0.0.
    pub fn set(&self, multiplier: f32) {
        let clamped = if multiplier.is_finite() && multiplier > 0.0 {
            multiplier
        } else {
            0.0
        };
        self.bits.store(clamped.to_bits(), Ordering::Relaxed);
    }

    pub fn get(&self) -> f32 {
        f32::from_bits(self.bits.load(Ordering::Relaxed))
    }
}

impl SampleTransform for Volume {
    fn apply(&self, samples: &mut [f32]) {
        let gain = self.get();
        if gain == 1.0 {
            return;
        }
        for s in samples.iter_mut() {
            *s *= gain;
        }
    }
}

/// Pass-through node applying a pipeline of in-place transforms.
pub struct AugmentNode {
    props: DeviceProperties,
    transforms: Option<Vec<Arc<dyn SampleTransform>>>,
    tx: Option<FrameTx>,
    rx: Option<FrameRx>,
    cancel: CancellationToken,
}

impl AugmentNode {
    pub fn new(props: DeviceProperties, transforms: Vec<Arc<dyn SampleTransform>>) -> Self {
        let (tx, rx) = frame_channel();
        Self {
            props,
            transforms: Some(transforms),
            tx: Some(tx),
            rx: Some(rx),
            cancel: CancellationToken::new(),
        }
    }

    /// Convenience constructor for the common single-transform case.
    pub fn with_volume(props: DeviceProperties, volume: Arc<Volume>) -> Self {
        Self::new(props, vec![volume as Arc<dyn SampleTransform>])
    }
}

impl Sink for AugmentNode {
    fn properties(&self) -> DeviceProperties {
        self.props
    }

    fn attach(&mut self, mut input: FrameRx) -> Result<()> {
        let Some(tx) = self.tx.take() else {
            return Err(AudioError::SinkAlreadyAttached);
        };
        let transforms = self
            .transforms
            .take()
            .ok_or(AudioError::SinkAlreadyAttached)?;
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    frame = input.recv() => {
                        let Some(mut frame) = frame else { break };
                        for t in &transforms {
                            t.apply(frame.samples_mut());
                        }
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            sent = tx.send(frame) => {
                                if sent.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                }
            }
            tracing::debug!("augmentation ended");
        });

        Ok(())
    }
}

impl Source for AugmentNode {
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
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PcmFrame;

    #[test]
    fn test_volume_identity() {
        let volume = Volume::new(1.0);
        let mut samples = vec![0.25, -0.5, 0.75];
        let original = samples.clone();
        volume.apply(&mut samples);
        assert_eq!(samples, original);
    }

    #[test]
    fn test_volume_mute() {
        let volume = Volume::new(0.0);
        let mut samples = vec![0.25, -0.5, 0.75];
        volume.apply(&mut samples);
        assert!(samples.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_volume_clamps_negative() {
        let volume = Volume::new(0.5);
        volume.set(-2.0);
        assert_eq!(volume.get(), 0.0);
    }

    #[test]
    fn test_volume_no_upper_cap() {
        let volume = Volume::new(3.0);
        assert_eq!(volume.get(), 3.0);
        let mut samples = vec![0.5];
        volume.apply(&mut samples);
        assert_eq!(samples[0], 1.5);
    }

    #[tokio::test]
    async fn test_node_applies_volume_in_order() {
        let props = DeviceProperties::mono(48_000);
        let volume = Volume::new(0.5);
        let mut node = AugmentNode::with_volume(props, volume.clone());

        let (tx, rx) = frame_channel();
        let mut out = Source::output_stream(&mut node).unwrap();
        Sink::attach(&mut node, rx).unwrap();

        tx.send(PcmFrame::new(vec![0.8, -0.8])).await.unwrap();
        let frame = out.recv().await.unwrap();
        assert!((frame.samples()[0] - 0.4).abs() < 1e-6);
        assert!((frame.samples()[1] + 0.4).abs() < 1e-6);

        volume.set(0.0);
        tx.send(PcmFrame::new(vec![0.8])).await.unwrap();
        let frame = out.recv().await.unwrap();
        assert_eq!(frame.samples()[0], 0.0);

        drop(tx);
        assert!(out.recv().await.is_none());
    }
}
