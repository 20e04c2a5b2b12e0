//! Connected client state
//!
//! A [`Client`] is one WebSocket connection bound to a stream and a role.
//! Signaling goes out through a bounded channel drained by the write pump;
//! a full queue drops the message rather than stalling the media path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::error::{Result, SignalError};
use crate::registry::Stream;
use crate::signal::{ErrorMessage, SignalKind, SignalMessage, Telemetry};

/// What a connection is allowed to do on its stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Publisher,
    Subscriber,
}

impl Role {
    /// Parse the `role` query parameter
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "publisher" => Some(Role::Publisher),
            "subscriber" => Some(Role::Subscriber),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Publisher => "publisher",
            Role::Subscriber => "subscriber",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One signaling connection
pub struct Client {
    id: u64,
    role: Role,
    stream: Arc<Stream>,
    outbound: mpsc::Sender<Message>,
    peer: OnceLock<Arc<RTCPeerConnection>>,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

impl Client {
    /// Create a client and the receiving end of its outbound queue
    pub fn new(
        id: u64,
        role: Role,
        stream: Arc<Stream>,
        queue_depth: usize,
    ) -> (Arc<Self>, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(queue_depth);
        let client = Arc::new(Self {
            id,
            role,
            stream,
            outbound: tx,
            peer: OnceLock::new(),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        });
        (client, rx)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn stream(&self) -> &Arc<Stream> {
        &self.stream
    }

    /// Token cancelled when the client shuts down; drains the write pump
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Bind the peer connection. Only the first call takes effect.
    pub fn set_peer(&self, pc: Arc<RTCPeerConnection>) {
        let _ = self.peer.set(pc);
    }

    pub fn peer(&self) -> Option<&Arc<RTCPeerConnection>> {
        self.peer.get()
    }

    /// Queue a signaling message for delivery
    pub fn send_signal(&self, msg: &SignalMessage) -> Result<()> {
        let text = serde_json::to_string(msg)?;
        self.outbound
            .try_send(Message::Text(text))
            .map_err(|_| SignalError::QueueFull)?;
        Ok(())
    }

    /// Queue an `{error, code}` frame, best effort
    pub fn send_error(&self, description: &str, code: &str) {
        let frame = ErrorMessage::new(description, code);
        let text = match serde_json::to_string(&frame) {
            Ok(text) => text,
            Err(e) => {
                tracing::error!(session_id = self.id, error = %e, "Failed to serialize error frame");
                return;
            }
        };
        if self.outbound.try_send(Message::Text(text)).is_err() {
            tracing::warn!(session_id = self.id, "Failed to deliver error frame: queue full");
        }
    }

    /// Create an SDP offer and send it to the client
    pub async fn send_offer(&self) -> Result<()> {
        let pc = self.peer.get().ok_or(SignalError::PeerNotReady)?;
        let offer = pc.create_offer(None).await?;
        pc.set_local_description(offer.clone()).await?;
        self.send_signal(&SignalMessage::sdp(offer.sdp, offer.sdp_type.to_string()))
    }

    /// Tear the client down: peer connection, write pump, stream membership.
    /// Idempotent; safe to call from any task.
    pub async fn close(self: &Arc<Self>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(pc) = self.peer.get() {
            if let Err(e) = pc.close().await {
                tracing::debug!(session_id = self.id, error = %e, "Peer connection close");
            }
        }
        self.shutdown.cancel();
        self.stream.remove_client(self).await;
        tracing::info!(session_id = self.id, role = %self.role, stream = %self.stream.id(), "Client closed");
    }

    /// Apply one inbound signaling message
    ///
    /// Errors are protocol-level and reported back to this client only; the
    /// connection stays open.
    pub async fn handle_signal(self: &Arc<Self>, msg: SignalMessage) -> Result<()> {
        let pc = self.peer.get().ok_or(SignalError::PeerNotReady)?;

        match msg.kind {
            SignalKind::Sdp => {
                let sdp = msg
                    .sdp
                    .filter(|s| !s.is_empty())
                    .ok_or(SignalError::MissingSdp)?;
                let desc = match msg.sdp_type.as_deref() {
                    None | Some("") | Some("answer") => RTCSessionDescription::answer(sdp)?,
                    Some("offer") => RTCSessionDescription::offer(sdp)?,
                    Some("pranswer") => RTCSessionDescription::pranswer(sdp)?,
                    Some(other) => {
                        return Err(SignalError::UnsupportedSdpType(other.to_string()).into())
                    }
                };
                let is_offer = desc.sdp_type == RTCSdpType::Offer;
                pc.set_remote_description(desc).await?;
                if is_offer {
                    let answer = pc.create_answer(None).await?;
                    pc.set_local_description(answer.clone()).await?;
                    self.send_signal(&SignalMessage::sdp(
                        answer.sdp,
                        answer.sdp_type.to_string(),
                    ))?;
                }
            }
            SignalKind::Ice => {
                let mut init = webrtc::ice_transport::ice_candidate::RTCIceCandidateInit::default();
                if let Some(candidate) = msg.candidate.filter(|c| !c.is_empty()) {
                    init.candidate = candidate;
                    init.sdp_mid = msg.sdp_mid.filter(|m| !m.is_empty());
                    init.sdp_mline_index = msg.sdp_mline_index;
                }
                pc.add_ice_candidate(init).await?;
            }
            SignalKind::Telemetry => {
                if self.role != Role::Publisher {
                    return Err(SignalError::RoleMismatch {
                        kind: "telemetry",
                        role: "publisher",
                    }
                    .into());
                }
                let telemetry = Telemetry::from_signal(&msg)?;
                self.stream.update_telemetry(telemetry).await;
            }
            SignalKind::GcsCommand | SignalKind::RawStream => {
                if self.role != Role::Subscriber {
                    return Err(SignalError::RoleMismatch {
                        kind: msg.kind.name(),
                        role: "subscriber",
                    }
                    .into());
                }
                if !msg.payload.as_ref().is_some_and(|p| !p.is_null()) {
                    return Err(SignalError::MissingPayload(msg.kind.name()).into());
                }
                tracing::debug!(session_id = self.id, kind = msg.kind.name(), "Forwarding command to publisher");
                self.stream.forward_to_publisher(msg, self).await?;
            }
            SignalKind::GcsCommandAck | SignalKind::RawStreamAck => {
                if self.role != Role::Publisher {
                    return Err(SignalError::RoleMismatch {
                        kind: msg.kind.name(),
                        role: "publisher",
                    }
                    .into());
                }
                self.stream.broadcast_to_subscribers(msg, self).await?;
            }
            SignalKind::Register => {
                // Legacy clients still send this even though role and stream
                // come from the query string. Accept silently.
                tracing::debug!(
                    session_id = self.id,
                    role = %self.role,
                    stream = %self.stream.id(),
                    "Received legacy register message"
                );
            }
            SignalKind::Unknown => {
                return Err(SignalError::UnsupportedType(msg.kind.name()).into());
            }
        }
        Ok(())
    }
}
