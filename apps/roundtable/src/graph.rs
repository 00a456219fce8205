//! The process-wide audio graph.
//!
//! ```text
//! local source -> augment -> fan-out -> per-peer send sink
//! per-peer receive source -> fan-in -> local sink
//! ```
//!
//! New peers get one fan-out outlet and one fan-in slot; both edges tear
//! down through the close cascade when the peer goes away.

use std::sync::Arc;
use std::time::Duration;

use roundtable_audio::{connect, AugmentNode, FanIn, FanOut, Sink, Source, Volume};
use roundtable_peer::Peer;
use tokio::sync::mpsc;

pub struct AudioGraph {
    fanout: FanOut,
    fanin: FanIn,
    mic_volume: Arc<Volume>,
    source: Box<dyn Source>,
    _sink: Box<dyn Sink>,
}

impl AudioGraph {
    pub fn new(
        mut source: Box<dyn Source>,
        mut sink: Box<dyn Sink>,
        frame_duration: Duration,
    ) -> roundtable_audio::Result<Self> {
        let capture = source.properties();
        let playback = Sink::properties(sink.as_ref());

        let mic_volume = Volume::new(1.0);
        let mut augment = AugmentNode::with_volume(capture, mic_volume.clone());
        let mut fanout = FanOut::new(capture);
        let mut fanin = FanIn::new(playback, frame_duration);

        connect(source.as_mut(), &mut augment)?;
        connect(&mut augment, &mut fanout)?;
        connect(&mut fanin, sink.as_mut())?;

        tracing::info!(
            capture = ?capture,
            playback = ?playback,
            "audio graph wired"
        );

        Ok(Self {
            fanout,
            fanin,
            mic_volume,
            source,
            _sink: sink,
        })
    }

    /// Local capture volume.
    pub fn mic_volume(&self) -> Arc<Volume> {
        self.mic_volume.clone()
    }

    /// Wire one connected peer: fan-out outlet into its send sink, its
    /// receive source into the mixer.
    pub fn add_peer(&self, peer: &Arc<Peer>) {
        let outlet = self.fanout.subscribe();
        let mut sink = peer.sink();
        if let Err(e) = sink.attach(outlet) {
            tracing::warn!(peer = %peer.uuid(), error = %e, "cannot attach send chain");
        }

        let mut source = peer.source();
        if let Err(e) = self.fanin.attach_source(&mut source) {
            tracing::warn!(peer = %peer.uuid(), error = %e, "cannot attach receive chain");
        }

        tracing::info!(peer = %peer.uuid(), "peer wired into audio graph");
    }

    /// Consume the connected-peers stream until it ends.
    pub async fn run(self: Arc<Self>, mut peers: mpsc::Receiver<Arc<Peer>>) {
        while let Some(peer) = peers.recv().await {
            self.add_peer(&peer);
        }
        tracing::debug!("connected-peers stream ended");
    }

    pub fn close(&self) {
        self.source.close();
        self.fanout.close();
        Source::close(&self.fanin);
    }
}
