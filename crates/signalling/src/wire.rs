use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use uuid::Uuid;

use crate::{Result, SignallingError};

/// The identity one user shares to be dialed: UUID plus public address,
/// exchanged as base64 of the JSON encoding.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PeerIdentifier {
    #[serde(rename = "Uuid")]
    pub uuid: Uuid,
    #[serde(rename = "PublicIP")]
    pub public_ip: String,
}

impl PeerIdentifier {
    pub fn new(public_ip: impl Into<String>) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            public_ip: public_ip.into(),
        }
    }

    pub fn encode(&self) -> String {
        BASE64.encode(serde_json::to_vec(self).expect("peer identifier serializes"))
    }

    pub fn decode(encoded: &str) -> Result<Self> {
        let raw = BASE64
            .decode(encoded.trim())
            .map_err(|e| SignallingError::InvalidIdentifier(e.to_string()))?;
        serde_json::from_slice(&raw).map_err(|e| SignallingError::InvalidIdentifier(e.to_string()))
    }
}

/// Offer envelope POSTed to `{rendezvous}/signal` and forwarded verbatim to
/// the answering peer.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SignallingOffer {
    #[serde(rename = "AnsweringPeerID")]
    pub answering_peer_id: PeerIdentifier,
    #[serde(rename = "OfferingPeerID")]
    pub offering_peer_id: PeerIdentifier,
    #[serde(rename = "OfferUUID")]
    pub offer_uuid: Uuid,
    #[serde(rename = "WebRTCSessionDescription")]
    pub session_description: serde_json::Value,
}

/// Answer envelope relayed back to the offerer.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SignallingAnswer {
    #[serde(rename = "OfferUUID")]
    pub offer_uuid: Uuid,
    #[serde(rename = "WebRTCSessionDescription")]
    pub session_description: serde_json::Value,
}
