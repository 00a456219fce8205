//! Rendezvous signalling: the wire envelopes, the shareable peer
//! identifier, the dial-side HTTP client and the local `/signal` endpoint.

mod client;
mod server;
mod wire;

pub use client::RendezvousClient;
pub use server::{OfferHandler, SignalServer};
pub use wire::{PeerIdentifier, SignallingAnswer, SignallingOffer};

#[derive(Debug, thiserror::Error)]
pub enum SignallingError {
    #[error("rendezvous unreachable: {0}")]
    RendezvousUnreachable(String),
    #[error("malformed signalling payload: {0}")]
    Protocol(String),
    #[error("invalid peer identifier: {0}")]
    InvalidIdentifier(String),
    #[error("bind failed: {0}")]
    Bind(String),
    #[error("handshake failed: {0}")]
    Handshake(String),
}

pub type Result<T> = std::result::Result<T, SignallingError>;
