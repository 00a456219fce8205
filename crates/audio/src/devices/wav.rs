//! WAV file endpoints: 16-bit signed little-endian PCM, RIFF container.

use std::io::BufWriter;
use std::path::Path;
use std::time::Duration;

use hound::{SampleFormat, WavSpec, WavWriter};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::frame::{frame_channel, DeviceProperties, FrameRx, PcmFrame};
use crate::node::{Sink, Source};
use crate::{AudioError, Result};

/// Timed reader emitting one frame per frame duration until end of file.
#[derive(Debug)]
pub struct WavFileSource {
    props: DeviceProperties,
    rx: Option<FrameRx>,
    cancel: CancellationToken,
}

impl WavFileSource {
    pub fn open(path: impl AsRef<Path>, frame_duration: Duration) -> Result<Self> {
        let mut reader = hound::WavReader::open(path.as_ref())
            .map_err(|e| AudioError::DeviceUnavailable(format!("wav open: {e}")))?;
        let spec = reader.spec();
        if spec.sample_format != SampleFormat::Int || spec.bits_per_sample != 16 {
            return Err(AudioError::DeviceUnavailable(format!(
                "unsupported wav format: {:?} {} bits",
                spec.sample_format, spec.bits_per_sample
            )));
        }
        let props = DeviceProperties::new(spec.sample_rate, spec.channels)?;

        let samples: Vec<f32> = reader
            .samples::<i16>()
            .map(|s| s.map(|v| v as f32 / 32768.0))
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| AudioError::DeviceUnavailable(format!("wav read: {e}")))?;

        let (tx, rx) = frame_channel();
        let cancel = CancellationToken::new();
        let frame_len = props.samples_per(frame_duration);

        let loop_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(frame_duration);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut offset = 0usize;
            while offset < samples.len() {
                tokio::select! {
                    _ = loop_cancel.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                let end = (offset + frame_len).min(samples.len());
                let frame = PcmFrame::new(samples[offset..end].to_vec());
                offset = end;
                tokio::select! {
                    _ = loop_cancel.cancelled() => return,
                    sent = tx.send(frame) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
            }
            tracing::debug!("wav source reached end of file");
        });

        Ok(Self {
            props,
            rx: Some(rx),
            cancel,
        })
    }
}

impl Source for WavFileSource {
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

/// Writer sink; the file is finalized when the inbound stream ends.
pub struct WavFileSink {
    props: DeviceProperties,
    writer: Option<WavWriter<BufWriter<std::fs::File>>>,
    attached: bool,
}

impl WavFileSink {
    pub fn create(path: impl AsRef<Path>, props: DeviceProperties) -> Result<Self> {
        let spec = WavSpec {
            channels: props.channels,
            sample_rate: props.sample_rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let writer = WavWriter::create(path.as_ref(), spec)
            .map_err(|e| AudioError::DeviceUnavailable(format!("wav create: {e}")))?;
        Ok(Self {
            props,
            writer: Some(writer),
            attached: false,
        })
    }

    fn write_frame(
        writer: &mut WavWriter<BufWriter<std::fs::File>>,
        frame: &PcmFrame,
    ) -> hound::Result<()> {
        for &s in frame.samples() {
            let v = (s * 32767.0).clamp(-32768.0, 32767.0) as i16;
            writer.write_sample(v)?;
        }
        Ok(())
    }
}

impl Sink for WavFileSink {
    fn properties(&self) -> DeviceProperties {
        self.props
    }

    fn attach(&mut self, mut input: FrameRx) -> Result<()> {
        if self.attached {
            return Err(AudioError::SinkAlreadyAttached);
        }
        self.attached = true;
        let mut writer = self.writer.take().ok_or(AudioError::SinkAlreadyAttached)?;

        tokio::spawn(async move {
            while let Some(frame) = input.recv().await {
                if let Err(e) = Self::write_frame(&mut writer, &frame) {
                    tracing::error!(error = %e, "wav write failed, stopping sink");
                    return;
                }
            }
            if let Err(e) = writer.finalize() {
                tracing::error!(error = %e, "wav finalize failed");
            }
        });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_wav_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        let props = DeviceProperties::mono(48_000);

        // One second of a quiet ramp.
        let mut sink = WavFileSink::create(&path, props).unwrap();
        let (tx, rx) = frame_channel();
        sink.attach(rx).unwrap();
        for chunk in 0..50 {
            let samples: Vec<f32> = (0..960)
                .map(|i| ((chunk * 960 + i) % 1000) as f32 / 10_000.0)
                .collect();
            tx.send(PcmFrame::new(samples)).await.unwrap();
        }
        drop(tx);
        // Give the writer task a moment to finalize.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut source = WavFileSource::open(&path, Duration::from_millis(20)).unwrap();
        assert_eq!(source.properties(), props);
        let mut out = source.output_stream().unwrap();

        let mut total = 0usize;
        let mut first: Option<PcmFrame> = None;
        while let Some(frame) = out.recv().await {
            if first.is_none() {
                first = Some(frame.clone());
            }
            total += frame.len();
        }
        assert_eq!(total, 48_000);
        // 16-bit quantization keeps values within half a step.
        let first = first.unwrap();
        for (i, &s) in first.samples().iter().enumerate() {
            let expected = (i % 1000) as f32 / 10_000.0;
            assert!((s - expected).abs() < 1.0 / 32_768.0 + 1e-6);
        }
    }

    #[tokio::test]
    async fn test_missing_file_is_device_unavailable() {
        let err = WavFileSource::open("/nonexistent/nope.wav", Duration::from_millis(20))
            .unwrap_err();
        assert!(matches!(err, AudioError::DeviceUnavailable(_)));
    }
}
