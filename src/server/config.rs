//! Server configuration

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

/// Relay server configuration options
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Plain HTTP/WebSocket listen address (`None` disables it)
    pub addr: Option<SocketAddr>,

    /// TLS listen address (`None` disables it)
    pub tls_addr: Option<SocketAddr>,

    /// Path to a PEM certificate chain
    pub tls_cert: Option<PathBuf>,

    /// Path to the PEM private key
    pub tls_key: Option<PathBuf>,

    /// Root directory for MP4 segments and RTP dumps
    pub recordings_dir: PathBuf,

    /// Deadline for one WebSocket write
    pub write_wait: Duration,

    /// How long a client may stay silent before its socket is dropped
    pub pong_wait: Duration,

    /// Largest accepted WebSocket message
    pub max_message_size: usize,

    /// Outbound signaling queue depth per client
    pub send_queue: usize,

    /// MP4 segment rotation interval
    pub segment_duration: Duration,

    /// PLI keyframe request interval
    pub keyframe_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: Some(SocketAddr::from(([0, 0, 0, 0], 8080))),
            tls_addr: None,
            tls_cert: None,
            tls_key: None,
            recordings_dir: PathBuf::from("recordings"),
            write_wait: Duration::from_secs(10),
            pong_wait: Duration::from_secs(60),
            max_message_size: 64 * 1024,
            send_queue: 32,
            segment_duration: Duration::from_secs(300),
            keyframe_interval: Duration::from_secs(2),
        }
    }
}

impl ServerConfig {
    /// Set the plain listen address
    pub fn bind(mut self, addr: Option<SocketAddr>) -> Self {
        self.addr = addr;
        self
    }

    /// Set the TLS listen address
    pub fn bind_tls(mut self, addr: Option<SocketAddr>) -> Self {
        self.tls_addr = addr;
        self
    }

    /// Set the TLS certificate and key paths
    pub fn tls_files(mut self, cert: Option<PathBuf>, key: Option<PathBuf>) -> Self {
        self.tls_cert = cert;
        self.tls_key = key;
        self
    }

    /// Set the recordings directory
    pub fn recordings_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.recordings_dir = dir.into();
        self
    }

    /// Set the MP4 segment rotation interval
    pub fn segment_duration(mut self, duration: Duration) -> Self {
        self.segment_duration = duration;
        self
    }

    /// Set the client silence deadline
    pub fn pong_wait(mut self, wait: Duration) -> Self {
        self.pong_wait = wait;
        self
    }

    /// Keepalive ping interval, derived so a ping always lands well before
    /// the pong deadline
    pub fn ping_period(&self) -> Duration {
        self.pong_wait * 9 / 10
    }

    /// Check flag combinations that cannot produce a working server
    pub fn validate(&self) -> Result<()> {
        if self.tls_cert.is_some() != self.tls_key.is_some() {
            return Err(Error::Config(
                "both --tls-cert and --tls-key must be provided to enable TLS".into(),
            ));
        }
        if self.tls_addr.is_some() && self.tls_cert.is_none() {
            return Err(Error::Config(
                "--https-addr requires both --tls-cert and --tls-key".into(),
            ));
        }
        if self.addr.is_none() && self.tls_addr.is_none() {
            return Err(Error::Config(
                "no listeners configured: provide --addr or --https-addr".into(),
            ));
        }
        Ok(())
    }
}
