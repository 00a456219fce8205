use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use chrono::Utc;
use roundtable_audio::{
    frame_channel, AugmentNode, ConvertNode, DeviceProperties, FrameRx, FrameTx, PcmFrame, Sink,
    Source, Volume,
};
use roundtable_codec::{CodecDescriptor, CodecEngine};
use roundtable_transport::{InboundTrack, OutboundTrack, Transport, TransportState};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::heartbeat::{
    decode_timestamp, encode_timestamp, plausible, HEARTBEAT_LABEL, HEARTBEAT_PERIOD,
};
use crate::{PeerConfig, PeerError, PeerState, Result};

const LATENCY_UNKNOWN: i64 = i64::MIN;

/// Whether this side initiated the session. The offering side owns the
/// heartbeat channel; both sides own an outbound audio track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    Offering,
    Answering,
}

struct SendSlot {
    track: Arc<dyn OutboundTrack>,
    engine: CodecEngine,
    convert: ConvertNode,
}

/// One remote participant: transport handles, codec engines and the audio
/// chains gluing them to the local pipeline.
pub struct Peer {
    uuid: Uuid,
    address: String,
    role: PeerRole,
    config: PeerConfig,
    transport: Arc<dyn Transport>,
    state_tx: watch::Sender<PeerState>,
    state_rx: watch::Receiver<PeerState>,
    cancel: CancellationToken,
    latency_ms: AtomicI64,
    volume: Arc<Volume>,
    outer_tx: Mutex<Option<FrameTx>>,
    receive_rx: Mutex<Option<FrameRx>>,
    send: Mutex<Option<SendSlot>>,
}

impl Peer {
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn role(&self) -> PeerRole {
        self.role
    }

    pub fn state(&self) -> PeerState {
        *self.state_rx.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Token cancelled when the peer closes; the graph watches it to tear
    /// down edges.
    pub fn closed(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Per-peer playback volume applied on the receive chain.
    pub fn volume(&self) -> Arc<Volume> {
        self.volume.clone()
    }

    /// Latest one-way latency from the heartbeat, if any was recorded.
    pub fn latency_ms(&self) -> Option<i64> {
        match self.latency_ms.load(Ordering::Relaxed) {
            LATENCY_UNKNOWN => None,
            v => Some(v),
        }
    }

    fn record_latency(&self, latency: i64) {
        self.latency_ms.store(latency, Ordering::Relaxed);
    }

    /// Resolves once the transport reports connected. Fails if the peer
    /// closes first.
    pub async fn wait_connected(&self) -> Result<()> {
        let mut rx = self.state_rx.clone();
        loop {
            match *rx.borrow() {
                PeerState::Connected => return Ok(()),
                PeerState::Closed => return Err(PeerError::Closed),
                _ => {}
            }
            if rx.changed().await.is_err() {
                return Err(PeerError::Closed);
            }
        }
    }

    fn set_state(&self, next: PeerState) {
        self.state_tx.send_if_modified(|state| {
            // Closed is terminal.
            if *state == PeerState::Closed || *state == next {
                return false;
            }
            tracing::debug!(peer = %self.uuid, from = ?*state, to = ?next, "peer state");
            *state = next;
            true
        });
    }

    /// The peer as a pipeline Source: its receive chain's output.
    pub fn source(self: &Arc<Self>) -> PeerSource {
        PeerSource { peer: self.clone() }
    }

    /// The peer as a pipeline Sink: its send chain's input.
    pub fn sink(self: &Arc<Self>) -> PeerSink {
        PeerSink { peer: self.clone() }
    }

    fn take_receive_stream(&self) -> Result<FrameRx> {
        if self.is_closed() {
            return Err(PeerError::Closed);
        }
        self.receive_rx
            .lock()
            .expect("peer receive slot poisoned")
            .take()
            .ok_or(PeerError::StreamTaken)
    }

    /// Wire the local capture stream into the send chain:
    /// convert -> encode -> transport.
    fn attach_send(&self, input: FrameRx) -> Result<()> {
        if self.is_closed() {
            return Err(PeerError::Closed);
        }
        let slot = self
            .send
            .lock()
            .expect("peer send slot poisoned")
            .take()
            .ok_or(PeerError::AlreadyAttached)?;

        let SendSlot {
            track,
            mut engine,
            mut convert,
        } = slot;

        Sink::attach(&mut convert, input)?;
        let mut converted = Source::output_stream(&mut convert)?;

        let cancel = self.cancel.clone();
        let frame_duration = self.config.frame_duration.as_duration();
        let peer = self.uuid;

        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = cancel.cancelled() => break,
                    frame = converted.recv() => frame,
                };
                let Some(frame) = frame else { break };

                let packets: Vec<Bytes> = match engine.encode(frame.samples()) {
                    Ok(outcome) => {
                        if let Some(e) = &outcome.window_error {
                            tracing::warn!(%peer, error = %e, "encoder skipped a window");
                        }
                        outcome
                            .frames
                            .iter()
                            .map(|f| Bytes::copy_from_slice(f))
                            .collect()
                    }
                    Err(e) => {
                        tracing::warn!(%peer, error = %e, "dropping unencodable frame");
                        continue;
                    }
                };

                for packet in packets {
                    let write = tokio::select! {
                        _ = cancel.cancelled() => return,
                        res = track.write_sample(packet, frame_duration) => res,
                    };
                    if write.is_err() {
                        tracing::debug!(%peer, "outbound track closed, stopping send chain");
                        return;
                    }
                }
            }
            tracing::debug!(%peer, "send chain ended");
        });

        Ok(())
    }

    /// Wire one announced inbound track into the receive chain:
    /// transport.read -> decode -> convert -> augment -> receive stream.
    fn spawn_receive_chain(self: &Arc<Self>, track: Arc<dyn InboundTrack>, codec: CodecDescriptor) {
        if self.is_closed() {
            return;
        }
        if !self.config.codecs.contains(&codec) {
            // Keep the peer; the stream still decodes with a matching
            // engine even if the codec was not on our preference list.
            tracing::warn!(
                peer = %self.uuid,
                codec = %codec.name(),
                "negotiated codec not in configured list, continuing"
            );
        }

        let mut engine = match CodecEngine::new(
            codec,
            self.config.frame_duration,
            self.config.safety_factor,
        ) {
            Ok(engine) => engine,
            Err(e) => {
                tracing::error!(peer = %self.uuid, error = %e, "cannot build decode engine");
                return;
            }
        };

        let playback = self.config.playback_properties;
        let mut convert = match ConvertNode::new(codec.properties(), playback) {
            Ok(node) => node,
            Err(e) => {
                tracing::error!(peer = %self.uuid, error = %e, "cannot build conversion node");
                return;
            }
        };
        let mut augment = AugmentNode::with_volume(playback, self.volume.clone());

        let (decode_tx, decode_rx) = frame_channel();
        let chain = (|| -> Result<FrameRx> {
            Sink::attach(&mut convert, decode_rx)?;
            let converted = Source::output_stream(&mut convert)?;
            Sink::attach(&mut augment, converted)?;
            Ok(Source::output_stream(&mut augment)?)
        })();
        let mut augmented = match chain {
            Ok(rx) => rx,
            Err(e) => {
                tracing::error!(peer = %self.uuid, error = %e, "cannot wire receive chain");
                return;
            }
        };

        let outer_tx = self
            .outer_tx
            .lock()
            .expect("peer outer sender poisoned")
            .clone();
        let Some(outer_tx) = outer_tx else { return };

        // Pump the chain's end into the peer's exposed receive stream.
        let pump_cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = pump_cancel.cancelled() => break,
                    frame = augmented.recv() => frame,
                };
                let Some(frame) = frame else { break };
                tokio::select! {
                    _ = pump_cancel.cancelled() => break,
                    sent = outer_tx.send(frame) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        // Read + decode loop; decoder errors skip the packet, read errors
        // end the stream.
        let cancel = self.cancel.clone();
        let peer = self.uuid;
        tokio::spawn(async move {
            loop {
                let packet = tokio::select! {
                    _ = cancel.cancelled() => break,
                    packet = track.read() => packet,
                };
                let Ok(packet) = packet else { break };

                let frame = match engine.decode(&packet) {
                    Ok(view) => PcmFrame::new(view.to_vec()),
                    Err(e) => {
                        tracing::warn!(%peer, error = %e, "skipping undecodable packet");
                        continue;
                    }
                };
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    sent = decode_tx.send(frame) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!(%peer, "receive chain ended");
        });
    }

    /// Idempotent close: cancels every chain task, ends the receive stream
    /// and closes the transport. Downstream nodes cascade on their own.
    pub fn close(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        tracing::info!(peer = %self.uuid, "closing peer");
        self.cancel.cancel();
        let _ = self.state_tx.send(PeerState::Closed);
        self.outer_tx
            .lock()
            .expect("peer outer sender poisoned")
            .take();
        self.send.lock().expect("peer send slot poisoned").take();

        let transport = self.transport.clone();
        tokio::spawn(async move { transport.close().await });
    }
}

/// The peer's receive chain viewed as a pipeline Source.
pub struct PeerSource {
    peer: Arc<Peer>,
}

impl Source for PeerSource {
    fn properties(&self) -> DeviceProperties {
        self.peer.config.playback_properties
    }

    fn output_stream(&mut self) -> roundtable_audio::Result<FrameRx> {
        self.peer
            .take_receive_stream()
            .map_err(|_| roundtable_audio::AudioError::SourceClosed)
    }

    fn close(&self) {
        self.peer.close();
    }
}

/// The peer's send chain viewed as a pipeline Sink.
pub struct PeerSink {
    peer: Arc<Peer>,
}

impl Sink for PeerSink {
    fn properties(&self) -> DeviceProperties {
        self.peer.config.capture_properties
    }

    fn attach(&mut self, input: FrameRx) -> roundtable_audio::Result<()> {
        self.peer
            .attach_send(input)
            .map_err(|_| roundtable_audio::AudioError::SinkAlreadyAttached)
    }
}

/// Builds peers around a transport, wiring handlers for tracks, side
/// channels and lifecycle state.
pub struct PeerFactory {
    config: PeerConfig,
}

impl PeerFactory {
    pub fn new(config: PeerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PeerConfig {
        &self.config
    }

    /// The dialing side: outbound audio track plus the heartbeat channel.
    pub async fn offering(
        &self,
        remote_uuid: Uuid,
        remote_address: impl Into<String>,
        transport: Arc<dyn Transport>,
    ) -> Result<Arc<Peer>> {
        let peer = self
            .build(remote_uuid, remote_address.into(), PeerRole::Offering, transport)
            .await?;
        self.spawn_heartbeat_sender(&peer).await?;
        Ok(peer)
    }

    /// The answering side: outbound audio track only, heartbeat received.
    pub async fn answering(
        &self,
        remote_uuid: Uuid,
        remote_address: impl Into<String>,
        transport: Arc<dyn Transport>,
    ) -> Result<Arc<Peer>> {
        self.build(remote_uuid, remote_address.into(), PeerRole::Answering, transport)
            .await
    }

    async fn build(
        &self,
        remote_uuid: Uuid,
        address: String,
        role: PeerRole,
        transport: Arc<dyn Transport>,
    ) -> Result<Arc<Peer>> {
        let preferred = *self.config.codecs.first().ok_or(PeerError::NoCodecs)?;
        let track = transport.add_outbound_track(preferred).await?;

        let engine = CodecEngine::new(
            preferred,
            self.config.frame_duration,
            self.config.safety_factor,
        )?;
        let convert = ConvertNode::new(self.config.capture_properties, preferred.properties())?;

        let (outer_tx, outer_rx) = frame_channel();
        let (state_tx, state_rx) = watch::channel(PeerState::New);

        let peer = Arc::new(Peer {
            uuid: remote_uuid,
            address,
            role,
            config: self.config.clone(),
            transport: transport.clone(),
            state_tx,
            state_rx,
            cancel: CancellationToken::new(),
            latency_ms: AtomicI64::new(LATENCY_UNKNOWN),
            volume: Volume::new(1.0),
            outer_tx: Mutex::new(Some(outer_tx)),
            receive_rx: Mutex::new(Some(outer_rx)),
            send: Mutex::new(Some(SendSlot {
                track,
                engine,
                convert,
            })),
        });
        peer.set_state(PeerState::Connecting);

        // Inbound audio: build the receive chain per announced track.
        let weak = Arc::downgrade(&peer);
        transport.on_inbound_track(Arc::new(move |track, codec| {
            if let Some(peer) = weak.upgrade() {
                peer.spawn_receive_chain(track, codec);
            }
        }));

        // Heartbeat receipt.
        let weak = Arc::downgrade(&peer);
        transport.on_side_channel(Arc::new(move |channel| {
            let Some(peer) = weak.upgrade() else { return };
            let label = channel.label();
            if label != HEARTBEAT_LABEL {
                tracing::debug!(peer = %peer.uuid, %label, "ignoring side channel");
                return;
            }
            let weak = Arc::downgrade(&peer);
            channel.on_message(Arc::new(move |payload| {
                let Some(peer) = weak.upgrade() else { return };
                let Some(sent_at) = decode_timestamp(&payload) else {
                    tracing::warn!(peer = %peer.uuid, "ignoring malformed heartbeat");
                    return;
                };
                let latency = Utc::now().timestamp_millis() - sent_at;
                if plausible(latency) {
                    peer.record_latency(latency);
                    tracing::debug!(peer = %peer.uuid, latency_ms = latency, "heartbeat");
                } else {
                    tracing::warn!(
                        peer = %peer.uuid,
                        latency_ms = latency,
                        "ignoring implausible heartbeat"
                    );
                }
            }));
        }));

        // Lifecycle: connected promotes the peer, terminal states close it.
        let weak = Arc::downgrade(&peer);
        transport.on_state_change(Arc::new(move |state| {
            let Some(peer) = weak.upgrade() else { return };
            match state {
                TransportState::Connected => peer.set_state(PeerState::Connected),
                TransportState::Failed => {
                    tracing::warn!(peer = %peer.uuid, "transport failed");
                    peer.close();
                }
                TransportState::Disconnected => {
                    tracing::info!(peer = %peer.uuid, "transport disconnected");
                    peer.close();
                }
                TransportState::Closed => peer.close(),
                TransportState::New | TransportState::Connecting => {}
            }
        }));

        Ok(peer)
    }

    async fn spawn_heartbeat_sender(&self, peer: &Arc<Peer>) -> Result<()> {
        let channel = peer.transport.create_side_channel(HEARTBEAT_LABEL).await?;
        let cancel = peer.cancel.clone();
        let mut state_rx = peer.state_rx.clone();
        let uuid = peer.uuid;

        tokio::spawn(async move {
            // Hold fire until the session is up.
            loop {
                match *state_rx.borrow() {
                    PeerState::Connected => break,
                    PeerState::Closed => return,
                    _ => {}
                }
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    changed = state_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
            }

            let mut ticker = tokio::time::interval(HEARTBEAT_PERIOD);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                let now = Utc::now().timestamp_millis();
                if channel.send(encode_timestamp(now)).await.is_err() {
                    tracing::debug!(peer = %uuid, "heartbeat channel closed");
                    return;
                }
                tracing::trace!(peer = %uuid, ts = now, "heartbeat sent");
            }
        });

        Ok(())
    }
}
