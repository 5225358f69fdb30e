//! Media session.
//!
//! Optional real-time audio channel, negotiated once per session: local
//! capture (injected), an opus track, a low-latency data channel for
//! signaling events such as "remote party started speaking", and an SDP
//! offer/answer exchange over HTTP routed by the session identifier.
//!
//! Failure semantics: any step failure rolls back partially-acquired
//! resources (capture released, peer connection closed) and leaves the
//! session idle. There is no automatic retry; re-starting mic capture
//! without explicit user action is avoided.

mod capture;
mod peer;

pub use capture::{AudioCapture, CaptureFactory};

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use webrtc::api::media_engine::MIME_TYPE_OPUS;
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

use crate::config::LinkConfig;
use crate::error::{LinkError, Result};
use peer::{build_peer, exchange_offer, media_err};

/// Opaque handle to the remote audio track. The audio rendering pipeline is
/// the host's concern; the core only hands over the track.
#[derive(Clone)]
pub struct MediaHandle(pub Arc<TrackRemote>);

impl std::fmt::Debug for MediaHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MediaHandle(remote audio track)")
    }
}

/// Low-latency signaling events delivered over the media side-channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SideChannelEvent {
    RemoteSpeechStarted,
    RemoteSpeechStopped,
    /// Unrecognized event kind, surfaced for forward compatibility.
    Other(String),
}

/// Events emitted by a live media session.
#[derive(Debug, Clone)]
pub enum MediaEvent {
    Remote(MediaHandle),
    SideChannel(SideChannelEvent),
    Error(LinkError),
}

fn parse_side_channel(data: &[u8]) -> Option<SideChannelEvent> {
    let value: serde_json::Value = serde_json::from_slice(data).ok()?;
    let kind = value.get("event")?.as_str()?;
    Some(match kind {
        "speech-started" => SideChannelEvent::RemoteSpeechStarted,
        "speech-stopped" => SideChannelEvent::RemoteSpeechStopped,
        other => SideChannelEvent::Other(other.to_string()),
    })
}

/// An established (or establishing) media session. Owns the peer connection,
/// the side-channel and the capture pump exclusively.
pub(crate) struct MediaSession {
    pc: Arc<RTCPeerConnection>,
    data_channel: Arc<RTCDataChannel>,
    pump_cancel: CancellationToken,
}

impl MediaSession {
    /// Run the full negotiation: capture acquisition, peer setup, offer/ICE,
    /// HTTP exchange, remote answer. On any failure all acquired resources
    /// are released and the error is returned.
    pub(crate) async fn negotiate(
        cfg: LinkConfig,
        session_id: String,
        capture_factory: CaptureFactory,
        events: mpsc::Sender<MediaEvent>,
    ) -> Result<Self> {
        // Device first: if the user denies the microphone there is nothing
        // to roll back yet.
        let capture = capture_factory()?;

        let pc = build_peer(&cfg.ice_servers).await?;
        // `capture` is moved into the pump inside negotiate_inner; its Drop
        // releases the device on every failure path before that point.
        match Self::negotiate_inner(&cfg, &session_id, Arc::clone(&pc), capture, events).await {
            Ok(session) => Ok(session),
            Err(e) => {
                let _ = pc.close().await;
                Err(e)
            }
        }
    }

    async fn negotiate_inner(
        cfg: &LinkConfig,
        session_id: &str,
        pc: Arc<RTCPeerConnection>,
        capture: AudioCapture,
        events: mpsc::Sender<MediaEvent>,
    ) -> Result<Self> {
        let data_channel = pc
            .create_data_channel("events", None)
            .await
            .map_err(|e| media_err("side-channel creation failed", e))?;

        let side_events = events.clone();
        data_channel.on_message(Box::new(move |msg: DataChannelMessage| {
            let side_events = side_events.clone();
            Box::pin(async move {
                match parse_side_channel(&msg.data) {
                    Some(event) => {
                        let _ = side_events.send(MediaEvent::SideChannel(event)).await;
                    }
                    None => warn!("unparseable side-channel payload, ignoring"),
                }
            })
        }));

        let remote_events = events.clone();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let remote_events = remote_events.clone();
            Box::pin(async move {
                debug!(kind = %track.kind(), "remote media track attached");
                let _ = remote_events
                    .send(MediaEvent::Remote(MediaHandle(track)))
                    .await;
            })
        }));

        let local_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48_000,
                channels: 2,
                ..Default::default()
            },
            "audio".to_owned(),
            "convo-link".to_owned(),
        ));
        pc.add_track(Arc::clone(&local_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| media_err("local track attach failed", e))?;

        let pump_cancel = CancellationToken::new();
        tokio::spawn(pump_samples(
            capture,
            Arc::clone(&local_track),
            pump_cancel.clone(),
        ));

        // Everything past this point must cancel the pump on failure so the
        // capture device is released.
        let negotiated = async {
            let offer = pc
                .create_offer(None)
                .await
                .map_err(|e| media_err("offer creation failed", e))?;

            let mut gather_complete = pc.gathering_complete_promise().await;
            pc.set_local_description(offer)
                .await
                .map_err(|e| media_err("local description failed", e))?;
            let _ = tokio::time::timeout(cfg.connect_timeout(), gather_complete.recv())
                .await
                .map_err(|_| LinkError::Timeout("ice gathering"))?;

            let local = pc
                .local_description()
                .await
                .ok_or_else(|| LinkError::Protocol("no local description after gather".into()))?;

            let answer_sdp = exchange_offer(
                &cfg.media_endpoint,
                session_id,
                &local.sdp,
                cfg.connect_timeout(),
            )
            .await?;

            let answer = RTCSessionDescription::answer(answer_sdp)
                .map_err(|e| LinkError::Protocol(format!("invalid remote answer: {e}")))?;
            pc.set_remote_description(answer)
                .await
                .map_err(|e| media_err("remote description failed", e))?;
            Ok(())
        }
        .await;

        if let Err(e) = negotiated {
            pump_cancel.cancel();
            return Err(e);
        }

        debug!("media session established");
        Ok(Self {
            pc,
            data_channel,
            pump_cancel,
        })
    }

    /// Release the capture device, close the side-channel and the peer
    /// connection. Always safe to call.
    pub(crate) async fn stop(self) {
        self.pump_cancel.cancel();
        let _ = self.data_channel.close().await;
        let _ = self.pc.close().await;
        debug!("media session stopped");
    }
}

/// Feed capture samples into the local track until cancelled or the source
/// runs dry. Dropping the capture handle releases the device.
async fn pump_samples(
    mut capture: AudioCapture,
    track: Arc<TrackLocalStaticSample>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            sample = capture.next_sample() => match sample {
                Some(sample) => {
                    if let Err(e) = track.write_sample(&sample).await {
                        warn!(error = %e, "failed to write capture sample, stopping pump");
                        break;
                    }
                }
                None => {
                    debug!("capture source ended");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_channel_kinds_parse() {
        assert_eq!(
            parse_side_channel(br#"{"event":"speech-started"}"#),
            Some(SideChannelEvent::RemoteSpeechStarted)
        );
        assert_eq!(
            parse_side_channel(br#"{"event":"speech-stopped"}"#),
            Some(SideChannelEvent::RemoteSpeechStopped)
        );
        assert_eq!(
            parse_side_channel(br#"{"event":"barge-in"}"#),
            Some(SideChannelEvent::Other("barge-in".into()))
        );
    }

    #[test]
    fn side_channel_garbage_is_none() {
        assert_eq!(parse_side_channel(b"not json"), None);
        assert_eq!(parse_side_channel(br#"{"no_event":1}"#), None);
    }

    #[tokio::test]
    async fn pump_stops_when_cancelled_and_releases_capture() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicBool, Ordering};

        let released = Arc::new(AtomicBool::new(false));
        let flag = released.clone();
        let (_tx, rx) = tokio::sync::mpsc::channel(1);
        let capture = AudioCapture::with_release(rx, move || flag.store(true, Ordering::SeqCst));

        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48_000,
                channels: 2,
                ..Default::default()
            },
            "audio".to_owned(),
            "test".to_owned(),
        ));

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(pump_samples(capture, track, cancel.clone()));
        cancel.cancel();
        handle.await.unwrap();
        assert!(released.load(Ordering::SeqCst));
    }
}
