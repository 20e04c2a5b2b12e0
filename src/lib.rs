//! WebRTC media relay and recording server
//!
//! Relays a single publisher's H.264 video to any number of subscribers
//! over WebRTC, signaled via JSON over WebSocket, while recording the
//! published stream to rotating MP4 segments on disk.
//!
//! The moving parts:
//!
//! - [`server`]: WebSocket listeners (plain and TLS) and connection pumps
//! - [`signal`]: the JSON signaling envelope and telemetry validation
//! - [`registry`]: stream lookup plus per-stream publisher/subscriber state
//! - [`session`]: one connected client, its role and outbound queue
//! - [`peer`]: webrtc-rs peer connection factory and observer wiring
//! - [`recording`]: MP4 muxing for H.264 tracks, raw RTP dumps for the rest
//! - [`media`]: the bit-level H.264 parsing the recorder depends on

pub mod error;
pub mod media;
pub mod peer;
pub mod recording;
pub mod registry;
pub mod server;
pub mod session;
pub mod signal;

pub use error::{Error, Result};
pub use registry::StreamRegistry;
pub use server::{RelayServer, ServerConfig};
