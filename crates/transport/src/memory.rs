//! In-process transport: two halves linked through channels, with the
//! offer/answer handshake flowing through a process-global session table so
//! the dial path works end-to-end without a network.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use roundtable_codec::CodecDescriptor;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    InboundTrack, InboundTrackHandler, MessageHandler, OutboundTrack, Result, SessionDescription,
    SideChannel, SideChannelHandler, StateHandler, Transport, TransportConfig, TransportError,
    TransportFactory, TransportState,
};

const TRACK_CHANNEL_CAPACITY: usize = 64;

enum LinkMsg {
    Track {
        codec: CodecDescriptor,
        rx: mpsc::Receiver<Bytes>,
    },
    Channel {
        label: String,
        incoming: mpsc::UnboundedReceiver<Bytes>,
        outgoing: mpsc::UnboundedSender<Bytes>,
    },
    Hello,
}

struct SessionSlot {
    to_answerer: mpsc::UnboundedReceiver<LinkMsg>,
    from_answerer: mpsc::UnboundedSender<LinkMsg>,
}

static SESSIONS: LazyLock<Mutex<HashMap<Uuid, SessionSlot>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

fn describe(kind: &str, session: Uuid) -> SessionDescription {
    SessionDescription(serde_json::json!({ "kind": kind, "session": session }))
}

fn parse_description(desc: &SessionDescription) -> Result<(String, Uuid)> {
    let kind = desc.0["kind"]
        .as_str()
        .ok_or_else(|| TransportError::InvalidDescription("missing kind".to_string()))?;
    let session = desc.0["session"]
        .as_str()
        .and_then(|s| Uuid::parse_str(s).ok())
        .ok_or_else(|| TransportError::InvalidDescription("missing session".to_string()))?;
    Ok((kind.to_string(), session))
}

struct TrackBacklog {
    handler: Option<InboundTrackHandler>,
    backlog: Vec<(Arc<dyn InboundTrack>, CodecDescriptor)>,
}

struct ChannelBacklog {
    handler: Option<SideChannelHandler>,
    backlog: Vec<Arc<dyn SideChannel>>,
}

struct Inner {
    session: Mutex<Option<Uuid>>,
    state: Mutex<TransportState>,
    state_handlers: Mutex<Vec<StateHandler>>,
    tracks: Mutex<TrackBacklog>,
    channels: Mutex<ChannelBacklog>,
    peer_tx: Mutex<Option<mpsc::UnboundedSender<LinkMsg>>>,
    pending_peer_rx: Mutex<Option<mpsc::UnboundedReceiver<LinkMsg>>>,
    pending_out: Mutex<Vec<LinkMsg>>,
    cancel: CancellationToken,
}

impl Inner {
    fn set_state(&self, next: TransportState) {
        {
            let mut state = self.state.lock().expect("transport state poisoned");
            if *state == next || *state == TransportState::Closed {
                return;
            }
            *state = next;
        }
        tracing::debug!(state = ?next, "transport state changed");
        let handlers: Vec<StateHandler> = self
            .state_handlers
            .lock()
            .expect("transport handlers poisoned")
            .clone();
        for handler in handlers {
            handler(next);
        }
    }

    fn announce(&self, msg: LinkMsg) {
        let peer_tx = self.peer_tx.lock().expect("transport peer poisoned");
        match peer_tx.as_ref() {
            Some(tx) => {
                let _ = tx.send(msg);
            }
            None => {
                drop(peer_tx);
                self.pending_out
                    .lock()
                    .expect("transport pending poisoned")
                    .push(msg);
            }
        }
    }

    fn bind_peer(&self, tx: mpsc::UnboundedSender<LinkMsg>) {
        let pending: Vec<LinkMsg> = std::mem::take(
            &mut *self
                .pending_out
                .lock()
                .expect("transport pending poisoned"),
        );
        for msg in pending {
            let _ = tx.send(msg);
        }
        *self.peer_tx.lock().expect("transport peer poisoned") = Some(tx);
    }

    fn deliver_track(&self, track: Arc<dyn InboundTrack>, codec: CodecDescriptor) {
        let handler = {
            let mut slot = self.tracks.lock().expect("transport tracks poisoned");
            match slot.handler.clone() {
                Some(h) => Some(h),
                None => {
                    slot.backlog.push((track.clone(), codec));
                    None
                }
            }
        };
        if let Some(handler) = handler {
            handler(track, codec);
        }
    }

    fn deliver_channel(&self, channel: Arc<dyn SideChannel>) {
        let handler = {
            let mut slot = self.channels.lock().expect("transport channels poisoned");
            match slot.handler.clone() {
                Some(h) => Some(h),
                None => {
                    slot.backlog.push(channel.clone());
                    None
                }
            }
        };
        if let Some(handler) = handler {
            handler(channel);
        }
    }
}

async fn run_link(inner: Arc<Inner>, mut rx: mpsc::UnboundedReceiver<LinkMsg>) {
    loop {
        let msg = tokio::select! {
            _ = inner.cancel.cancelled() => return,
            msg = rx.recv() => msg,
        };
        match msg {
            Some(LinkMsg::Track { codec, rx }) => {
                let track: Arc<dyn InboundTrack> = Arc::new(MemoryInboundTrack {
                    codec,
                    rx: tokio::sync::Mutex::new(rx),
                });
                inner.deliver_track(track, codec);
            }
            Some(LinkMsg::Channel {
                label,
                incoming,
                outgoing,
            }) => {
                let channel = MemorySideChannel::remote(label, incoming, outgoing);
                inner.deliver_channel(channel);
            }
            Some(LinkMsg::Hello) => inner.set_state(TransportState::Connected),
            None => {
                // The other half dropped its sender: the session is gone.
                inner.set_state(TransportState::Disconnected);
                return;
            }
        }
    }
}

pub struct MemoryTransport {
    inner: Arc<Inner>,
}

impl MemoryTransport {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Arc::new(Inner {
                session: Mutex::new(None),
                state: Mutex::new(TransportState::New),
                state_handlers: Mutex::new(Vec::new()),
                tracks: Mutex::new(TrackBacklog {
                    handler: None,
                    backlog: Vec::new(),
                }),
                channels: Mutex::new(ChannelBacklog {
                    handler: None,
                    backlog: Vec::new(),
                }),
                peer_tx: Mutex::new(None),
                pending_peer_rx: Mutex::new(None),
                pending_out: Mutex::new(Vec::new()),
                cancel: CancellationToken::new(),
            }),
        })
    }

    /// Two already-handshaken halves, for tests and demos.
    pub async fn pair() -> Result<(Arc<Self>, Arc<Self>)> {
        let a = Self::new();
        let b = Self::new();
        let offer = a.create_offer().await?;
        a.set_local_description(offer.clone()).await?;
        b.set_remote_description(offer).await?;
        let answer = b.create_answer().await?;
        b.set_local_description(answer.clone()).await?;
        a.set_remote_description(answer).await?;
        Ok((a, b))
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let session = Uuid::new_v4();
        *self.inner.session.lock().expect("session poisoned") = Some(session);

        let (o2a_tx, o2a_rx) = mpsc::unbounded_channel();
        let (a2o_tx, a2o_rx) = mpsc::unbounded_channel();

        SESSIONS
            .lock()
            .expect("session table poisoned")
            .insert(
                session,
                SessionSlot {
                    to_answerer: o2a_rx,
                    from_answerer: a2o_tx,
                },
            );

        self.inner.bind_peer(o2a_tx);
        *self
            .inner
            .pending_peer_rx
            .lock()
            .expect("pending rx poisoned") = Some(a2o_rx);

        self.inner.set_state(TransportState::Connecting);
        Ok(describe("offer", session))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let session = self
            .inner
            .session
            .lock()
            .expect("session poisoned")
            .ok_or_else(|| {
                TransportError::InvalidDescription("answer before offer".to_string())
            })?;
        Ok(describe("answer", session))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        parse_description(&desc)?;
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        let (kind, session) = parse_description(&desc)?;
        match kind.as_str() {
            "offer" => {
                let slot = SESSIONS
                    .lock()
                    .expect("session table poisoned")
                    .remove(&session)
                    .ok_or(TransportError::UnknownSession(session))?;

                *self.inner.session.lock().expect("session poisoned") = Some(session);
                self.inner.bind_peer(slot.from_answerer);
                tokio::spawn(run_link(self.inner.clone(), slot.to_answerer));
                self.inner.set_state(TransportState::Connecting);
                Ok(())
            }
            "answer" => {
                let local = *self.inner.session.lock().expect("session poisoned");
                if local != Some(session) {
                    return Err(TransportError::UnknownSession(session));
                }
                let rx = self
                    .inner
                    .pending_peer_rx
                    .lock()
                    .expect("pending rx poisoned")
                    .take()
                    .ok_or_else(|| {
                        TransportError::InvalidDescription("answer without offer".to_string())
                    })?;
                tokio::spawn(run_link(self.inner.clone(), rx));
                self.inner.announce(LinkMsg::Hello);
                self.inner.set_state(TransportState::Connected);
                Ok(())
            }
            other => Err(TransportError::InvalidDescription(format!(
                "unknown kind: {other}"
            ))),
        }
    }

    async fn await_ice_gathering(&self) {
        // Loopback gathers nothing.
    }

    async fn add_outbound_track(
        &self,
        codec: CodecDescriptor,
    ) -> Result<Arc<dyn OutboundTrack>> {
        if self.state() == TransportState::Closed {
            return Err(TransportError::Closed);
        }
        let (tx, rx) = mpsc::channel(TRACK_CHANNEL_CAPACITY);
        self.inner.announce(LinkMsg::Track { codec, rx });
        Ok(Arc::new(MemoryOutboundTrack {
            codec,
            tx,
            cancel: self.inner.cancel.clone(),
        }))
    }

    fn on_inbound_track(&self, handler: InboundTrackHandler) {
        let backlog = {
            let mut slot = self.inner.tracks.lock().expect("transport tracks poisoned");
            slot.handler = Some(handler.clone());
            std::mem::take(&mut slot.backlog)
        };
        for (track, codec) in backlog {
            handler(track, codec);
        }
    }

    async fn create_side_channel(&self, label: &str) -> Result<Arc<dyn SideChannel>> {
        if self.state() == TransportState::Closed {
            return Err(TransportError::Closed);
        }
        let (channel, announce) = MemorySideChannel::local(label.to_string());
        self.inner.announce(announce);
        Ok(channel)
    }

    fn on_side_channel(&self, handler: SideChannelHandler) {
        let backlog = {
            let mut slot = self
                .inner
                .channels
                .lock()
                .expect("transport channels poisoned");
            slot.handler = Some(handler.clone());
            std::mem::take(&mut slot.backlog)
        };
        for channel in backlog {
            handler(channel);
        }
    }

    fn on_state_change(&self, handler: StateHandler) {
        self.inner
            .state_handlers
            .lock()
            .expect("transport handlers poisoned")
            .push(handler);
    }

    fn state(&self) -> TransportState {
        *self.inner.state.lock().expect("transport state poisoned")
    }

    async fn close(&self) {
        self.inner.set_state(TransportState::Closed);
        self.inner.cancel.cancel();
        // Dropping our sender tells the other half we are gone.
        self.inner
            .peer_tx
            .lock()
            .expect("transport peer poisoned")
            .take();
    }
}

struct MemoryOutboundTrack {
    codec: CodecDescriptor,
    tx: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
}

#[async_trait]
impl OutboundTrack for MemoryOutboundTrack {
    fn codec(&self) -> CodecDescriptor {
        self.codec
    }

    async fn write_sample(&self, payload: Bytes, _duration: Duration) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(TransportError::Closed);
        }
        self.tx
            .send(payload)
            .await
            .map_err(|_| TransportError::TrackClosed)
    }
}

struct MemoryInboundTrack {
    codec: CodecDescriptor,
    rx: tokio::sync::Mutex<mpsc::Receiver<Bytes>>,
}

#[async_trait]
impl InboundTrack for MemoryInboundTrack {
    fn codec(&self) -> CodecDescriptor {
        self.codec
    }

    async fn read(&self) -> Result<Bytes> {
        self.rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(TransportError::TrackClosed)
    }
}

struct MessageSlot {
    handler: Option<MessageHandler>,
    backlog: Vec<Bytes>,
}

struct MemorySideChannel {
    label: String,
    tx: mpsc::UnboundedSender<Bytes>,
    slot: Arc<Mutex<MessageSlot>>,
}

impl MemorySideChannel {
    fn local(label: String) -> (Arc<Self>, LinkMsg) {
        let (l2r_tx, l2r_rx) = mpsc::unbounded_channel();
        let (r2l_tx, r2l_rx) = mpsc::unbounded_channel();
        let channel = Arc::new(Self {
            label: label.clone(),
            tx: l2r_tx,
            slot: Arc::new(Mutex::new(MessageSlot {
                handler: None,
                backlog: Vec::new(),
            })),
        });
        channel.spawn_reader(r2l_rx);
        let announce = LinkMsg::Channel {
            label,
            incoming: l2r_rx,
            outgoing: r2l_tx,
        };
        (channel, announce)
    }

    fn remote(
        label: String,
        incoming: mpsc::UnboundedReceiver<Bytes>,
        outgoing: mpsc::UnboundedSender<Bytes>,
    ) -> Arc<Self> {
        let channel = Arc::new(Self {
            label,
            tx: outgoing,
            slot: Arc::new(Mutex::new(MessageSlot {
                handler: None,
                backlog: Vec::new(),
            })),
        });
        channel.spawn_reader(incoming);
        channel
    }

    fn spawn_reader(&self, mut rx: mpsc::UnboundedReceiver<Bytes>) {
        let slot = self.slot.clone();
        tokio::spawn(async move {
            while let Some(payload) = rx.recv().await {
                let handler = {
                    let mut slot = slot.lock().expect("side channel slot poisoned");
                    match slot.handler.clone() {
                        Some(h) => Some(h),
                        None => {
                            slot.backlog.push(payload.clone());
                            None
                        }
                    }
                };
                if let Some(handler) = handler {
                    handler(payload);
                }
            }
        });
    }
}

#[async_trait]
impl SideChannel for MemorySideChannel {
    fn label(&self) -> String {
        self.label.clone()
    }

    async fn send(&self, payload: Bytes) -> Result<()> {
        self.tx.send(payload).map_err(|_| TransportError::Closed)
    }

    fn on_message(&self, handler: MessageHandler) {
        let backlog = {
            let mut slot = self.slot.lock().expect("side channel slot poisoned");
            slot.handler = Some(handler.clone());
            std::mem::take(&mut slot.backlog)
        };
        for payload in backlog {
            handler(payload);
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryTransportFactory;

impl TransportFactory for MemoryTransportFactory {
    fn create(&self, _config: &TransportConfig) -> Result<Arc<dyn Transport>> {
        Ok(MemoryTransport::new())
    }
}
