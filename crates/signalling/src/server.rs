use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::wire::{SignallingAnswer, SignallingOffer};
use crate::{Result, SignallingError};

/// Application callback answering one forwarded offer.
pub type OfferHandler = Arc<
    dyn Fn(SignallingOffer) -> BoxFuture<'static, std::result::Result<SignallingAnswer, SignallingError>>
        + Send
        + Sync,
>;

/// The local `/signal` endpoint the rendezvous forwards offers to.
///
/// A malformed body is answered with 400 and never takes the server down;
/// handler failures map to 500.
pub struct SignalServer {
    addr: SocketAddr,
    cancel: CancellationToken,
}

impl SignalServer {
    pub async fn bind(port: u16, handler: OfferHandler) -> Result<Self> {
        let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(|e| SignallingError::Bind(e.to_string()))?;
        let addr = listener
            .local_addr()
            .map_err(|e| SignallingError::Bind(e.to_string()))?;

        let app = Router::new()
            .route("/signal", post(handle_signal))
            .with_state(handler);

        let cancel = CancellationToken::new();
        let shutdown = cancel.clone();
        tokio::spawn(async move {
            let serve = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await });
            if let Err(e) = serve.await {
                tracing::error!(error = %e, "signal server stopped");
            }
        });

        tracing::info!(%addr, "signal endpoint listening");
        Ok(Self { addr, cancel })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Drop for SignalServer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn handle_signal(State(handler): State<OfferHandler>, body: String) -> Response {
    let offer: SignallingOffer = match serde_json::from_str(&body) {
        Ok(offer) => offer,
        Err(e) => {
            tracing::warn!(error = %e, "rejecting malformed offer");
            return (StatusCode::BAD_REQUEST, format!("malformed offer: {e}")).into_response();
        }
    };

    tracing::debug!(offer = %offer.offer_uuid, from = %offer.offering_peer_id.uuid, "offer received");
    match handler(offer).await {
        Ok(answer) => Json(answer).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "offer handling failed");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::PeerIdentifier;
    use crate::RendezvousClient;
    use std::time::Duration;
    use uuid::Uuid;

    fn echo_handler() -> OfferHandler {
        Arc::new(|offer: SignallingOffer| {
            Box::pin(async move {
                Ok(SignallingAnswer {
                    offer_uuid: offer.offer_uuid,
                    session_description: serde_json::json!({"type": "answer"}),
                })
            })
        })
    }

    fn offer() -> SignallingOffer {
        SignallingOffer {
            answering_peer_id: PeerIdentifier::new("198.51.100.1:1066"),
            offering_peer_id: PeerIdentifier::new("203.0.113.7:1066"),
            offer_uuid: Uuid::new_v4(),
            session_description: serde_json::json!({"type": "offer"}),
        }
    }

    #[tokio::test]
    async fn test_malformed_offer_is_400_and_server_survives() {
        let server = SignalServer::bind(0, echo_handler()).await.unwrap();
        let url = format!("http://{}/signal", server.local_addr());
        let http = reqwest::Client::new();

        let response = http
            .post(&url)
            .header("content-type", "application/json")
            .body(r#"{"garbage": true}"#)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);

        // A subsequent valid offer still succeeds.
        let valid = offer();
        let response = http.post(&url).json(&valid).send().await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        let answer: SignallingAnswer = response.json().await.unwrap();
        assert_eq!(answer.offer_uuid, valid.offer_uuid);
    }

    #[tokio::test]
    async fn test_client_round_trip_and_unreachable() {
        let server = SignalServer::bind(0, echo_handler()).await.unwrap();
        let base = format!("http://{}", server.local_addr());

        let client = RendezvousClient::new(base, Duration::from_secs(5)).unwrap();
        let sent = offer();
        let answer = client.forward_offer(&sent).await.unwrap();
        assert_eq!(answer.offer_uuid, sent.offer_uuid);

        server.shutdown();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let err = client.forward_offer(&sent).await.unwrap_err();
        assert!(matches!(err, SignallingError::RendezvousUnreachable(_)));
    }
}
