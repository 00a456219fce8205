//! Connection manager: answers forwarded offers, dials remote peers, and
//! publishes fully-connected peers to the application graph.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::Context;
use roundtable_peer::{Peer, PeerFactory};
use roundtable_signalling::{
    OfferHandler, PeerIdentifier, RendezvousClient, SignallingAnswer, SignallingError,
    SignallingOffer,
};
use roundtable_transport::{SessionDescription, TransportConfig, TransportFactory};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Buffered connected-peers stream capacity.
const PEER_STREAM_CAPACITY: usize = 16;

pub struct ConnectionManager {
    factory: PeerFactory,
    transports: Arc<dyn TransportFactory>,
    transport_config: TransportConfig,
    client: RendezvousClient,
    local_id: PeerIdentifier,
    registry: Arc<RwLock<HashMap<Uuid, Arc<Peer>>>>,
    peers_tx: mpsc::Sender<Arc<Peer>>,
    timeout: Duration,
}

impl ConnectionManager {
    pub fn new(
        signalling_server: &str,
        timeout: Duration,
        public_ip: &str,
        ice_servers: Vec<String>,
        factory: PeerFactory,
        transports: Arc<dyn TransportFactory>,
    ) -> anyhow::Result<(Arc<Self>, mpsc::Receiver<Arc<Peer>>)> {
        let client = RendezvousClient::new(signalling_server, timeout)
            .context("building rendezvous client")?;
        let (peers_tx, peers_rx) = mpsc::channel(PEER_STREAM_CAPACITY);

        let manager = Arc::new(Self {
            factory,
            transports,
            transport_config: TransportConfig { ice_servers },
            client,
            local_id: PeerIdentifier::new(public_ip),
            registry: Arc::new(RwLock::new(HashMap::new())),
            peers_tx,
            timeout,
        });
        Ok((manager, peers_rx))
    }

    /// The identity to share with anyone who wants to dial us.
    pub fn local_identifier(&self) -> &PeerIdentifier {
        &self.local_id
    }

    pub fn peer_count(&self) -> usize {
        self.registry.read().expect("peer registry poisoned").len()
    }

    pub fn peer(&self, uuid: &Uuid) -> Option<Arc<Peer>> {
        self.registry
            .read()
            .expect("peer registry poisoned")
            .get(uuid)
            .cloned()
    }

    /// Callback for the local `/signal` endpoint.
    pub fn offer_handler(self: &Arc<Self>) -> OfferHandler {
        let manager = self.clone();
        Arc::new(move |offer| {
            let manager = manager.clone();
            Box::pin(async move { manager.handle_offer(offer).await })
        })
    }

    /// Answer one forwarded offer: build the answering peer, run the
    /// description exchange and reply. The peer is published only once its
    /// transport reports connected.
    async fn handle_offer(
        self: Arc<Self>,
        offer: SignallingOffer,
    ) -> std::result::Result<SignallingAnswer, SignallingError> {
        tracing::info!(
            offer = %offer.offer_uuid,
            from = %offer.offering_peer_id.uuid,
            "answering offer"
        );

        let transport = self
            .transports
            .create(&self.transport_config)
            .map_err(|e| SignallingError::Handshake(e.to_string()))?;
        let peer = self
            .factory
            .answering(
                offer.offering_peer_id.uuid,
                offer.offering_peer_id.public_ip.clone(),
                transport.clone(),
            )
            .await
            .map_err(|e| SignallingError::Handshake(e.to_string()))?;

        let exchanged: std::result::Result<SignallingAnswer, SignallingError> = async {
            transport
                .set_remote_description(SessionDescription(offer.session_description.clone()))
                .await
                .map_err(|e| SignallingError::Handshake(e.to_string()))?;
            let answer = transport
                .create_answer()
                .await
                .map_err(|e| SignallingError::Handshake(e.to_string()))?;
            transport
                .set_local_description(answer.clone())
                .await
                .map_err(|e| SignallingError::Handshake(e.to_string()))?;
            transport.await_ice_gathering().await;
            Ok(SignallingAnswer {
                offer_uuid: offer.offer_uuid,
                session_description: answer.0,
            })
        }
        .await;

        match exchanged {
            Ok(answer) => {
                self.publish_when_connected(peer);
                Ok(answer)
            }
            Err(e) => {
                peer.close();
                Err(e)
            }
        }
    }

    /// Dial a remote participant by its shared identifier.
    pub async fn dial(&self, encoded_identifier: &str) -> anyhow::Result<Arc<Peer>> {
        let remote = PeerIdentifier::decode(encoded_identifier)
            .context("decoding peer identifier")?;
        tracing::info!(peer = %remote.uuid, address = %remote.public_ip, "dialing");

        let transport = self
            .transports
            .create(&self.transport_config)
            .context("creating transport")?;
        let peer = self
            .factory
            .offering(remote.uuid, remote.public_ip.clone(), transport.clone())
            .await
            .context("building offering peer")?;

        let dialed: anyhow::Result<()> = async {
            let offer = transport.create_offer().await?;
            transport.set_local_description(offer.clone()).await?;
            transport.await_ice_gathering().await;

            let envelope = SignallingOffer {
                answering_peer_id: remote.clone(),
                offering_peer_id: self.local_id.clone(),
                offer_uuid: Uuid::new_v4(),
                session_description: offer.0,
            };
            let answer = self.client.forward_offer(&envelope).await?;
            transport
                .set_remote_description(SessionDescription(answer.session_description))
                .await?;

            tokio::time::timeout(self.timeout, peer.wait_connected())
                .await
                .context("timed out waiting for the session")??;
            Ok(())
        }
        .await;

        match dialed {
            Ok(()) => {
                self.register(peer.clone()).await;
                Ok(peer)
            }
            Err(e) => {
                peer.close();
                Err(e)
            }
        }
    }

    /// Register a connected peer and watch for its departure.
    async fn register(&self, peer: Arc<Peer>) {
        self.registry
            .write()
            .expect("peer registry poisoned")
            .insert(peer.uuid(), peer.clone());
        tracing::info!(
            peer = %peer.uuid(),
            address = peer.address(),
            total = self.peer_count(),
            "peer connected"
        );

        let registry = self.registry.clone();
        let watched = peer.clone();
        tokio::spawn(async move {
            watched.closed().cancelled().await;
            registry
                .write()
                .expect("peer registry poisoned")
                .remove(&watched.uuid());
            tracing::info!(peer = %watched.uuid(), "peer removed from registry");
        });

        if self.peers_tx.send(peer).await.is_err() {
            tracing::warn!("connected-peers stream consumer is gone");
        }
    }

    fn publish_when_connected(self: &Arc<Self>, peer: Arc<Peer>) {
        let manager = self.clone();
        tokio::spawn(async move {
            if peer.wait_connected().await.is_err() {
                // Closed before connected: released, never published.
                tracing::debug!(peer = %peer.uuid(), "peer closed before connecting");
                return;
            }
            manager.register(peer).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roundtable_audio::DeviceProperties;
    use roundtable_codec::{CodecDescriptor, FrameDuration};
    use roundtable_peer::PeerConfig;
    use roundtable_signalling::SignalServer;
    use roundtable_transport::memory::{MemoryTransport, MemoryTransportFactory};

    fn peer_config() -> PeerConfig {
        PeerConfig {
            codecs: vec![CodecDescriptor {
                clock_rate: 48_000,
                channels: 1,
            }],
            frame_duration: FrameDuration::Ms20,
            safety_factor: 16,
            capture_properties: DeviceProperties::mono(48_000),
            playback_properties: DeviceProperties::mono(48_000),
        }
    }

    fn manager(
        signalling: &str,
    ) -> (Arc<ConnectionManager>, mpsc::Receiver<Arc<Peer>>) {
        ConnectionManager::new(
            signalling,
            Duration::from_secs(5),
            "127.0.0.1:1066",
            vec!["stun:stun.example.org".to_string()],
            PeerFactory::new(peer_config()),
            Arc::new(MemoryTransportFactory),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_dial_connects_and_publishes_both_sides() {
        // The answering side's /signal endpoint stands in for the
        // rendezvous: it relays verbatim, so pointing the dialer straight
        // at it exercises the same path.
        let (answering, mut answering_peers) = manager("http://unused.example.org");
        let server = SignalServer::bind(0, answering.offer_handler()).await.unwrap();

        let base = format!("http://{}", server.local_addr());
        let (dialing, mut dialing_peers) = manager(&base);

        let peer = dialing
            .dial(&answering.local_identifier().encode())
            .await
            .unwrap();
        assert_eq!(peer.uuid(), answering.local_identifier().uuid);
        assert_eq!(dialing.peer_count(), 1);

        let published = tokio::time::timeout(Duration::from_secs(5), dialing_peers.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(published.uuid(), peer.uuid());

        let remote = tokio::time::timeout(Duration::from_secs(5), answering_peers.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(remote.uuid(), dialing.local_identifier().uuid);
        assert_eq!(answering.peer_count(), 1);
    }

    #[tokio::test]
    async fn test_dial_unreachable_rendezvous_fails() {
        let (dialing, _peers) = manager("http://127.0.0.1:9");
        let target = PeerIdentifier::new("203.0.113.9:1066");
        assert!(dialing.dial(&target.encode()).await.is_err());
        assert_eq!(dialing.peer_count(), 0);
    }

    #[tokio::test]
    async fn test_dial_garbage_identifier_fails() {
        let (dialing, _peers) = manager("http://127.0.0.1:9");
        assert!(dialing.dial("not-an-identifier").await.is_err());
    }

    #[tokio::test]
    async fn test_peer_failure_leaves_others_connected() {
        let (local, mut local_peers) = manager("http://unused.example.org");
        let server = SignalServer::bind(0, local.offer_handler()).await.unwrap();
        let base = format!("http://{}", server.local_addr());

        // Three remote participants dial us, each from its own manager.
        let mut remotes = Vec::new();
        for _ in 0..3 {
            let (remote, _rx) = manager(&base);
            let peer = remote
                .dial(&local.local_identifier().encode())
                .await
                .unwrap();
            remotes.push((remote, _rx, peer));
        }

        for _ in 0..3 {
            tokio::time::timeout(Duration::from_secs(5), local_peers.recv())
                .await
                .unwrap()
                .unwrap();
        }
        assert_eq!(local.peer_count(), 3);

        // Kill the second remote's session.
        remotes[1].2.close();

        let mut settled = false;
        for _ in 0..200 {
            if local.peer_count() == 2 {
                settled = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(settled, "registry never dropped the failed peer");

        // The survivors are still registered and connected.
        assert!(local.peer(&remotes[0].0.local_identifier().uuid).is_some());
        assert!(local.peer(&remotes[2].0.local_identifier().uuid).is_some());
    }

    #[tokio::test]
    async fn test_peer_closed_before_connected_is_not_published() {
        let (local, mut local_peers) = manager("http://unused.example.org");
        let _server = SignalServer::bind(0, local.offer_handler()).await.unwrap();

        // Drive a half-handshake by hand: offer in, answer out, but the
        // offerer vanishes before applying the answer.
        let offerer = MemoryTransport::new();
        let offer = offerer.create_offer().await.unwrap();
        let envelope = SignallingOffer {
            answering_peer_id: local.local_identifier().clone(),
            offering_peer_id: PeerIdentifier::new("203.0.113.5:1066"),
            offer_uuid: Uuid::new_v4(),
            session_description: offer.0,
        };
        let _answer = local
            .clone()
            .handle_offer(envelope)
            .await
            .unwrap();

        offerer.close().await;

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(local.peer_count(), 0);
        assert!(
            tokio::time::timeout(Duration::from_millis(200), local_peers.recv())
                .await
                .is_err(),
            "peer must not be published"
        );
    }
}
