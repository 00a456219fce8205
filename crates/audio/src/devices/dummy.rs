//! No-hardware endpoints for demos and tests.

use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::frame::{frame_channel, DeviceProperties, FrameRx, PcmFrame};
use crate::node::{Sink, Source};
use crate::{AudioError, Result};

/// Source emitting zeroed frames at a steady cadence.
pub struct SilenceSource {
    props: DeviceProperties,
    rx: Option<FrameRx>,
    cancel: CancellationToken,
}

impl SilenceSource {
    pub fn new(props: DeviceProperties, frame_duration: Duration) -> Self {
        let (tx, rx) = frame_channel();
        let cancel = CancellationToken::new();
        let frame_len = props.samples_per(frame_duration);

        let loop_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(frame_duration);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = loop_cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                // Real-time producer: drop on back-pressure.
                if tx.try_send(PcmFrame::silence(frame_len)).is_err()
                    && tx.is_closed()
                {
                    break;
                }
            }
        });

        Self {
            props,
            rx: Some(rx),
            cancel,
        }
    }
}

impl Source for SilenceSource {
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

/// Sink draining and discarding its inbound stream.
pub struct NullSink {
    props: DeviceProperties,
    attached: bool,
}

impl NullSink {
    pub fn new(props: DeviceProperties) -> Self {
        Self {
            props,
            attached: false,
        }
    }
}

impl Sink for NullSink {
    fn properties(&self) -> DeviceProperties {
        self.props
    }

    fn attach(&mut self, mut input: FrameRx) -> Result<()> {
        if self.attached {
            return Err(AudioError::SinkAlreadyAttached);
        }
        self.attached = true;
        tokio::spawn(async move { while input.recv().await.is_some() {} });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_silence_source_emits_conformant_frames() {
        let props = DeviceProperties::mono(48_000);
        let mut source = SilenceSource::new(props, Duration::from_millis(20));
        let mut out = source.output_stream().unwrap();

        let frame = out.recv().await.unwrap();
        assert_eq!(frame.len(), 960);
        assert!(frame.samples().iter().all(|&s| s == 0.0));

        source.close();
        source.close();
        while out.recv().await.is_some() {}
    }

    #[tokio::test]
    async fn test_null_sink_drains() {
        let mut sink = NullSink::new(DeviceProperties::mono(48_000));
        let (tx, rx) = frame_channel();
        sink.attach(rx).unwrap();
        for _ in 0..100 {
            tx.send(PcmFrame::silence(960)).await.unwrap();
        }
        let (_tx2, rx2) = frame_channel();
        assert!(matches!(
            sink.attach(rx2),
            Err(AudioError::SinkAlreadyAttached)
        ));
    }
}
