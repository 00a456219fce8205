use std::time::Duration;

use crate::wire::{SignallingAnswer, SignallingOffer};
use crate::{Result, SignallingError};

/// Dial-side HTTP client POSTing one offer envelope and awaiting the
/// relayed answer within the configured round-trip timeout.
#[derive(Clone)]
pub struct RendezvousClient {
    http: reqwest::Client,
    base_url: String,
}

impl RendezvousClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SignallingError::RendezvousUnreachable(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.into(),
        })
    }

    pub async fn forward_offer(&self, offer: &SignallingOffer) -> Result<SignallingAnswer> {
        let url = format!("{}/signal", self.base_url.trim_end_matches('/'));
        tracing::debug!(%url, offer = %offer.offer_uuid, "forwarding offer");

        let response = self
            .http
            .post(&url)
            .json(offer)
            .send()
            .await
            .map_err(|e| SignallingError::RendezvousUnreachable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SignallingError::RendezvousUnreachable(format!(
                "status {status}: {body}"
            )));
        }

        response
            .json::<SignallingAnswer>()
            .await
            .map_err(|e| SignallingError::Protocol(e.to_string()))
    }
}
