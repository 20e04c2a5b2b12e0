//! Error types
//!
//! Three tiers, matching how failures are handled:
//!
//! - [`SignalError`]: protocol errors surfaced to the offending client as an
//!   `{error, code}` frame. Never fatal to the process.
//! - [`MediaError`]: recoverable parse/mux failures in the recording path.
//!   Logged only; live forwarding is unaffected.
//! - [`Error`]: everything a fallible operation can return, including
//!   transport and startup failures.

use thiserror::Error;

/// Crate-wide result alias
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Top-level error type
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error(transparent)]
    WebRtc(#[from] webrtc::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Signal(#[from] SignalError),

    #[error(transparent)]
    Media(#[from] MediaError),

    /// Fatal startup misconfiguration (bad flag combinations, no listeners)
    #[error("{0}")]
    Config(String),
}

/// Protocol errors reported back to the originating client
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignalError {
    #[error("publisher already connected")]
    PublisherAlreadyConnected,

    #[error("publisher not connected")]
    PublisherNotConnected,

    #[error("peer connection not ready")]
    PeerNotReady,

    #[error("missing SDP")]
    MissingSdp,

    #[error("unsupported SDP type: {0}")]
    UnsupportedSdpType(String),

    #[error("{kind} messages only accepted from {role}s")]
    RoleMismatch {
        kind: &'static str,
        role: &'static str,
    },

    #[error("{0} message missing payload")]
    MissingPayload(&'static str),

    #[error("telemetry message missing coordinates")]
    MissingCoordinates,

    #[error("invalid telemetry coordinates")]
    InvalidCoordinates,

    #[error("unsupported signal type: {0}")]
    UnsupportedType(&'static str),

    #[error("client send queue full")]
    QueueFull,
}

/// Recoverable media parsing and container errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediaError {
    #[error("SPS too short")]
    SpsTooShort,

    #[error("invalid SPS geometry")]
    InvalidSpsGeometry,

    #[error("bit reader overflow")]
    BitReaderOverflow,

    #[error("missing SPS/PPS data")]
    MissingParameterSets,

    #[error("segment already closed")]
    SegmentClosed,
}
