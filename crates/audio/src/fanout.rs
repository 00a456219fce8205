//! One inbound stream copied to a dynamic set of outbound sinks.
//!
//! Delivery never blocks the dispatcher: a slow sink loses frames, and a
//! sink that stays back-pressured past its deadline is evicted.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

use crate::frame::{frame_channel, DeviceProperties, FrameRx, FrameTx};
use crate::node::Sink;
use crate::{AudioError, Result};

/// Uninterrupted back-pressure budget before a subscriber is evicted.
pub const SINK_TIMEOUT: Duration = Duration::from_secs(5);

struct Outlet {
    id: u64,
    tx: FrameTx,
    last_delivery: Mutex<Instant>,
}

pub struct FanOut {
    props: DeviceProperties,
    outlets: Arc<RwLock<Vec<Outlet>>>,
    next_id: AtomicU64,
    ended: Arc<AtomicBool>,
    cancel: CancellationToken,
    attached: bool,
    timeout: Duration,
}

impl FanOut {
    pub fn new(props: DeviceProperties) -> Self {
        Self::with_timeout(props, SINK_TIMEOUT)
    }

    pub fn with_timeout(props: DeviceProperties, timeout: Duration) -> Self {
        Self {
            props,
            outlets: Arc::new(RwLock::new(Vec::new())),
            next_id: AtomicU64::new(0),
            ended: Arc::new(AtomicBool::new(false)),
            cancel: CancellationToken::new(),
            attached: false,
            timeout,
        }
    }

    /// Register a new outbound sink and return its stream.
    ///
    /// After the inbound stream has ended (or the node was closed) the
    /// returned stream is already closed.
    pub fn subscribe(&self) -> FrameRx {
        let (tx, rx) = frame_channel();
        if self.ended.load(Ordering::Acquire) || self.cancel.is_cancelled() {
            drop(tx);
            return rx;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.outlets
            .write()
            .expect("fan-out outlet list poisoned")
            .push(Outlet {
                id,
                tx,
                last_delivery: Mutex::new(Instant::now()),
            });
        tracing::debug!(outlet = id, "fan-out subscriber added");
        rx
    }

    pub fn subscriber_count(&self) -> usize {
        self.outlets
            .read()
            .expect("fan-out outlet list poisoned")
            .len()
    }

    /// Close all outbound sinks and stop dispatching. Idempotent.
    pub fn close(&self) {
        self.cancel.cancel();
        self.ended.store(true, Ordering::Release);
        self.outlets
            .write()
            .expect("fan-out outlet list poisoned")
            .clear();
    }
}

impl Sink for FanOut {
    fn properties(&self) -> DeviceProperties {
        self.props
    }

    fn attach(&mut self, mut input: FrameRx) -> Result<()> {
        if self.attached {
            return Err(AudioError::SinkAlreadyAttached);
        }
        self.attached = true;

        let outlets = self.outlets.clone();
        let ended = self.ended.clone();
        let cancel = self.cancel.clone();
        let timeout = self.timeout;

        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = cancel.cancelled() => break,
                    frame = input.recv() => frame,
                };
                let Some(frame) = frame else { break };

                let mut evict = Vec::new();
                {
                    let outlets = outlets.read().expect("fan-out outlet list poisoned");
                    for outlet in outlets.iter() {
                        match outlet.tx.try_send(frame.clone()) {
                            Ok(()) => {
                                *outlet
                                    .last_delivery
                                    .lock()
                                    .expect("fan-out deadline poisoned") = Instant::now();
                            }
                            Err(TrySendError::Full(_)) => {
                                let last = *outlet
                                    .last_delivery
                                    .lock()
                                    .expect("fan-out deadline poisoned");
                                if last.elapsed() >= timeout {
                                    evict.push(outlet.id);
                                }
                                // Not yet past the deadline: this frame is
                                // simply lost for this sink.
                            }
                            Err(TrySendError::Closed(_)) => evict.push(outlet.id),
                        }
                    }
                }

                if !evict.is_empty() {
                    let mut outlets = outlets.write().expect("fan-out outlet list poisoned");
                    outlets.retain(|o| {
                        if evict.contains(&o.id) {
                            tracing::warn!(
                                outlet = o.id,
                                error = %AudioError::DeadlinedSink,
                                "removing fan-out subscriber"
                            );
                            false
                        } else {
                            true
                        }
                    });
                }
            }

            // End of input or close: drop every outbound sender so
            // subscribers observe end-of-stream.
            ended.store(true, Ordering::Release);
            outlets
                .write()
                .expect("fan-out outlet list poisoned")
                .clear();
            tracing::debug!("fan-out dispatch ended");
        });

        Ok(())
    }
}
