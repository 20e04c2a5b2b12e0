//! Peer connection plumbing
//!
//! One place for everything webrtc-rs: the API factory, per-client observer
//! wiring, and codec preference handling. Both roles get the same peer
//! connection shape; only the track direction differs.

use std::sync::Arc;

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_H264};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecParameters, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;

use crate::error::Result;
use crate::session::Client;
use crate::signal::SignalMessage;

const STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// Build a peer connection with the default codec set and interceptors
pub async fn create_peer_connection() -> Result<Arc<RTCPeerConnection>> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs()?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)?;

    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build();

    let config = RTCConfiguration {
        ice_servers: vec![RTCIceServer {
            urls: vec![STUN_SERVER.to_owned()],
            ..Default::default()
        }],
        ..Default::default()
    };

    Ok(Arc::new(api.new_peer_connection(config).await?))
}

/// Attach the ICE and state observers that tie a peer connection to its
/// client
///
/// Callbacks hold a `Weak` reference so a dangling peer connection can never
/// keep a disconnected client alive.
pub fn wire_observers(pc: &Arc<RTCPeerConnection>, client: &Arc<Client>) {
    let weak = Arc::downgrade(client);
    pc.on_ice_candidate(Box::new(move |candidate| {
        let client = weak.clone();
        Box::pin(async move {
            let (Some(candidate), Some(client)) = (candidate, client.upgrade()) else {
                return;
            };
            let init = match candidate.to_json() {
                Ok(init) => init,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to serialize ICE candidate");
                    return;
                }
            };
            let msg = SignalMessage::ice(init.candidate, init.sdp_mid, init.sdp_mline_index);
            if let Err(e) = client.send_signal(&msg) {
                tracing::warn!(session_id = client.id(), error = %e, "Failed to send ICE candidate");
            }
        })
    }));

    let weak = Arc::downgrade(client);
    pc.on_peer_connection_state_change(Box::new(move |state| {
        let client = weak.clone();
        Box::pin(async move {
            let Some(client) = client.upgrade() else {
                return;
            };
            tracing::info!(session_id = client.id(), role = %client.role(), %state, "Peer connection state changed");
            if matches!(
                state,
                RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed
            ) {
                client.close().await;
            }
        })
    }));
}

/// Reorder a video sender's codec list so H.264 is negotiated first
///
/// A no-op when the sender is not a video sender or offers no H.264 payload
/// types at all.
pub async fn prefer_h264(pc: &Arc<RTCPeerConnection>, sender: &Arc<RTCRtpSender>) -> Result<()> {
    let mut transceiver = None;
    for t in pc.get_transceivers().await {
        if Arc::ptr_eq(&t.sender().await, sender) {
            transceiver = Some(t);
            break;
        }
    }
    let Some(transceiver) = transceiver else {
        return Ok(());
    };
    if transceiver.kind() != RTPCodecType::Video {
        return Ok(());
    }

    let params = sender.get_parameters().await;
    if params.rtp_parameters.codecs.is_empty() {
        return Ok(());
    }

    let (mut preferred, fallback): (Vec<RTCRtpCodecParameters>, Vec<RTCRtpCodecParameters>) =
        params
            .rtp_parameters
            .codecs
            .into_iter()
            .partition(|c| c.capability.mime_type.eq_ignore_ascii_case(MIME_TYPE_H264));
    if preferred.is_empty() {
        return Ok(());
    }
    preferred.extend(fallback);
    transceiver.set_codec_preferences(preferred).await?;
    Ok(())
}
