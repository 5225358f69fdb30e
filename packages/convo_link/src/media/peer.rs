//! Peer connection assembly and the offer/answer HTTP exchange.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;

use crate::error::{LinkError, Result};

pub(crate) fn media_err(context: &str, e: impl std::fmt::Display) -> LinkError {
    LinkError::Transport(format!("{context}: {e}"))
}

/// Build a peer connection with default codecs and interceptors.
pub(crate) async fn build_peer(ice_servers: &[String]) -> Result<Arc<RTCPeerConnection>> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(|e| media_err("codec registration failed", e))?;

    let registry = register_default_interceptors(Registry::new(), &mut media_engine)
        .map_err(|e| media_err("interceptor registration failed", e))?;

    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build();

    let config = RTCConfiguration {
        ice_servers: if ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: ice_servers.to_vec(),
                ..Default::default()
            }]
        },
        ..Default::default()
    };

    let pc = api
        .new_peer_connection(config)
        .await
        .map_err(|e| media_err("peer connection creation failed", e))?;
    Ok(Arc::new(pc))
}

#[derive(Serialize)]
struct OfferBody<'a> {
    sdp: &'a str,
    #[serde(rename = "type")]
    kind: &'a str,
    backend_connection_id: &'a str,
}

#[derive(Deserialize)]
struct AnswerBody {
    sdp: String,
    #[serde(rename = "type")]
    #[allow(dead_code)]
    kind: String,
}

/// One-shot offer/answer exchange. The session identifier routes the offer
/// to the backend resources bound to this connection.
pub(crate) async fn exchange_offer(
    endpoint: &str,
    session_id: &str,
    offer_sdp: &str,
    timeout: Duration,
) -> Result<String> {
    let client = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| media_err("http client build failed", e))?;

    let body = OfferBody {
        sdp: offer_sdp,
        kind: "offer",
        backend_connection_id: session_id,
    };

    let response = client
        .post(endpoint)
        .json(&body)
        .send()
        .await
        .map_err(|e| media_err("offer exchange request failed", e))?;

    if !response.status().is_success() {
        return Err(LinkError::Server(format!(
            "offer exchange rejected: {}",
            response.status()
        )));
    }

    let answer: AnswerBody = response
        .json()
        .await
        .map_err(|e| LinkError::Protocol(format!("malformed answer body: {e}")))?;

    Ok(answer.sdp)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offer_body_wire_shape() {
        let body = OfferBody {
            sdp: "v=0...",
            kind: "offer",
            backend_connection_id: "abc",
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["type"], "offer");
        assert_eq!(value["backend_connection_id"], "abc");
        assert_eq!(value["sdp"], "v=0...");
    }

    #[test]
    fn answer_body_parses() {
        let answer: AnswerBody =
            serde_json::from_str(r#"{"sdp":"v=0...","type":"answer"}"#).unwrap();
        assert_eq!(answer.sdp, "v=0...");
    }
}
