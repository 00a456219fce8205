//! Hardware endpoints over cpal.
//!
//! cpal streams are not `Send`, so each device runs on a dedicated thread
//! that owns the stream and parks until shutdown. Audio callbacks complete
//! in bounded time: the input callback hands frames off with a non-blocking
//! send and drops on back-pressure, the output callback drains a ring and
//! zero-fills on underrun.

use std::sync::mpsc as std_mpsc;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat};
use ringbuf::{
    traits::{Consumer, Producer, Split},
    HeapProd, HeapRb,
};

use crate::frame::{frame_channel, DeviceProperties, FrameRx, FrameTx, PcmFrame};
use crate::node::{Sink, Source};
use crate::{AudioError, Result};

fn find_device(host: &cpal::Host, id: Option<&str>, output: bool) -> Result<Device> {
    match id {
        Some(id) => {
            let mut devices = if output {
                host.output_devices()?
            } else {
                host.input_devices()?
            };
            devices
                .find(|d| d.name().ok().as_deref() == Some(id))
                .ok_or_else(|| AudioError::DeviceUnavailable(format!("device not found: {id}")))
        }
        None => {
            let device = if output {
                host.default_output_device()
            } else {
                host.default_input_device()
            };
            device.ok_or_else(|| AudioError::DeviceUnavailable("no default device".to_string()))
        }
    }
}

/// Microphone capture source.
pub struct MicrophoneSource {
    props: DeviceProperties,
    rx: Option<FrameRx>,
    shutdown: std_mpsc::Sender<()>,
}

impl MicrophoneSource {
    pub fn open(device_id: Option<&str>) -> Result<Self> {
        let (frame_tx, frame_rx) = frame_channel();
        let (init_tx, init_rx) = std_mpsc::channel();
        let (shutdown_tx, shutdown_rx) = std_mpsc::channel::<()>();
        let device_id = device_id.map(str::to_string);

        std::thread::spawn(move || {
            match build_input(device_id.as_deref(), frame_tx) {
                Ok((stream, props)) => {
                    let _ = init_tx.send(Ok(props));
                    // Park until close or drop; the stream lives here.
                    let _ = shutdown_rx.recv();
                    drop(stream);
                    tracing::debug!("microphone thread exiting");
                }
                Err(e) => {
                    let _ = init_tx.send(Err(e));
                }
            }
        });

        let props = init_rx
            .recv()
            .map_err(|_| AudioError::DeviceUnavailable("input thread died".to_string()))??;

        Ok(Self {
            props,
            rx: Some(frame_rx),
            shutdown: shutdown_tx,
        })
    }
}

impl Source for MicrophoneSource {
    fn properties(&self) -> DeviceProperties {
        self.props
    }

    fn output_stream(&mut self) -> Result<FrameRx> {
        self.rx.take().ok_or(AudioError::SourceClosed)
    }

    fn close(&self) {
        let _ = self.shutdown.send(());
    }
}

impl Drop for MicrophoneSource {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
    }
}

fn build_input(
    device_id: Option<&str>,
    tx: FrameTx,
) -> Result<(cpal::Stream, DeviceProperties)> {
    let host = cpal::default_host();
    let device = find_device(&host, device_id, false)?;
    let config = device
        .default_input_config()
        .map_err(|e| AudioError::DeviceUnavailable(format!("input config: {e}")))?;
    let props = DeviceProperties::new(config.sample_rate().0, config.channels())?;

    let err_fn = |e| tracing::error!(error = %e, "input stream error");
    let stream = match config.sample_format() {
        SampleFormat::F32 => {
            let mut dropped = 0u64;
            device
                .build_input_stream(
                    &config.into(),
                    move |data: &[f32], _| {
                        push_capture(&tx, data.to_vec(), &mut dropped);
                    },
                    err_fn,
                    None,
                )
                .map_err(|e| AudioError::DeviceUnavailable(format!("build input: {e}")))?
        }
        SampleFormat::I16 => {
            let mut dropped = 0u64;
            device
                .build_input_stream(
                    &config.into(),
                    move |data: &[i16], _| {
                        let samples: Vec<f32> =
                            data.iter().map(|&s| s as f32 / 32768.0).collect();
                        push_capture(&tx, samples, &mut dropped);
                    },
                    err_fn,
                    None,
                )
                .map_err(|e| AudioError::DeviceUnavailable(format!("build input: {e}")))?
        }
        format => {
            return Err(AudioError::DeviceUnavailable(format!(
                "unsupported sample format: {format:?}"
            )));
        }
    };

    stream
        .play()
        .map_err(|e| AudioError::DeviceUnavailable(format!("start input: {e}")))?;

    Ok((stream, props))
}

fn push_capture(tx: &FrameTx, samples: Vec<f32>, dropped: &mut u64) {
    if tx.try_send(PcmFrame::new(samples)).is_err() {
        *dropped += 1;
        if *dropped % 50 == 1 {
            tracing::warn!(dropped = *dropped, "capture overflow, dropping frames");
        }
    }
}

/// Speaker playback sink.
pub struct SpeakerSink {
    props: DeviceProperties,
    producer: Option<HeapProd<f32>>,
    shutdown: std_mpsc::Sender<()>,
    attached: bool,
}

impl SpeakerSink {
    pub fn open(device_id: Option<&str>) -> Result<Self> {
        let (init_tx, init_rx) = std_mpsc::channel();
        let (shutdown_tx, shutdown_rx) = std_mpsc::channel::<()>();
        let device_id = device_id.map(str::to_string);

        std::thread::spawn(move || match build_output(device_id.as_deref()) {
            Ok((stream, props, producer)) => {
                let _ = init_tx.send(Ok((props, producer)));
                let _ = shutdown_rx.recv();
                drop(stream);
                tracing::debug!("speaker thread exiting");
            }
            Err(e) => {
                let _ = init_tx.send(Err(e));
            }
        });

        let (props, producer) = init_rx
            .recv()
            .map_err(|_| AudioError::DeviceUnavailable("output thread died".to_string()))??;

        Ok(Self {
            props,
            producer: Some(producer),
            shutdown: shutdown_tx,
            attached: false,
        })
    }
}

impl Sink for SpeakerSink {
    fn properties(&self) -> DeviceProperties {
        self.props
    }

    fn attach(&mut self, mut input: FrameRx) -> Result<()> {
        if self.attached {
            return Err(AudioError::SinkAlreadyAttached);
        }
        self.attached = true;
        let mut producer = self.producer.take().ok_or(AudioError::SinkAlreadyAttached)?;

        tokio::spawn(async move {
            let mut dropped = 0u64;
            while let Some(frame) = input.recv().await {
                let pushed = producer.push_slice(frame.samples());
                if pushed < frame.len() {
                    dropped += 1;
                    if dropped % 50 == 1 {
                        tracing::warn!(dropped, "playback overflow, dropping samples");
                    }
                }
            }
            tracing::debug!("speaker sink input ended");
        });

        Ok(())
    }
}

impl Drop for SpeakerSink {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
    }
}

type OutputParts = (cpal::Stream, DeviceProperties, HeapProd<f32>);

fn build_output(device_id: Option<&str>) -> Result<OutputParts> {
    let host = cpal::default_host();
    let device = find_device(&host, device_id, true)?;
    let config = device
        .default_output_config()
        .map_err(|e| AudioError::DeviceUnavailable(format!("output config: {e}")))?;
    let props = DeviceProperties::new(config.sample_rate().0, config.channels())?;

    // One second of buffered playback between the pipeline and the card.
    let ring = HeapRb::<f32>::new(props.samples_per_second());
    let (producer, mut consumer) = ring.split();

    let err_fn = |e| tracing::error!(error = %e, "output stream error");
    let stream = match config.sample_format() {
        SampleFormat::F32 => device
            .build_output_stream(
                &config.into(),
                move |data: &mut [f32], _| {
                    let n = consumer.pop_slice(data);
                    data[n..].fill(0.0);
                },
                err_fn,
                None,
            )
            .map_err(|e| AudioError::DeviceUnavailable(format!("build output: {e}")))?,
        SampleFormat::I16 => {
            let mut scratch: Vec<f32> = Vec::new();
            device
                .build_output_stream(
                    &config.into(),
                    move |data: &mut [i16], _| {
                        scratch.resize(data.len(), 0.0);
                        let n = consumer.pop_slice(&mut scratch);
                        for (d, s) in data.iter_mut().zip(&scratch[..n]) {
                            *d = (s * 32767.0).clamp(-32768.0, 32767.0) as i16;
                        }
                        for d in data[n..].iter_mut() {
                            *d = 0;
                        }
                    },
                    err_fn,
                    None,
                )
                .map_err(|e| AudioError::DeviceUnavailable(format!("build output: {e}")))?
        }
        format => {
            return Err(AudioError::DeviceUnavailable(format!(
                "unsupported sample format: {format:?}"
            )));
        }
    };

    stream
        .play()
        .map_err(|e| AudioError::DeviceUnavailable(format!("start output: {e}")))?;

    Ok((stream, props, producer))
}
