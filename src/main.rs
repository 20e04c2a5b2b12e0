use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

use webrtc_relay::{RelayServer, ServerConfig};

/// WebRTC media relay and recording server
#[derive(Debug, Parser)]
#[command(name = "webrtc-relay", version, about)]
struct Args {
    /// WebSocket listen address (empty to disable)
    #[arg(long, default_value = "0.0.0.0:8080")]
    addr: String,

    /// TLS WebSocket listen address (requires TLS flags; empty disables)
    #[arg(long, default_value = "")]
    https_addr: String,

    /// Path to a TLS certificate in PEM format
    #[arg(long)]
    tls_cert: Option<PathBuf>,

    /// Path to the TLS private key in PEM format
    #[arg(long)]
    tls_key: Option<PathBuf>,

    /// Directory for MP4 segments and RTP dumps
    #[arg(long, default_value = "recordings")]
    recordings_dir: PathBuf,
}

fn parse_addr(flag: &str, value: &str) -> Result<Option<SocketAddr>, String> {
    if value.is_empty() {
        return Ok(None);
    }
    value
        .parse()
        .map(Some)
        .map_err(|e| format!("invalid {flag} '{value}': {e}"))
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "webrtc_relay=info".into()),
        )
        .init();

    let args = Args::parse();

    let addr = match parse_addr("--addr", &args.addr) {
        Ok(addr) => addr,
        Err(e) => {
            tracing::error!("{e}");
            std::process::exit(1);
        }
    };
    let tls_addr = match parse_addr("--https-addr", &args.https_addr) {
        Ok(addr) => addr,
        Err(e) => {
            tracing::error!("{e}");
            std::process::exit(1);
        }
    };

    let config = ServerConfig::default()
        .bind(addr)
        .bind_tls(tls_addr)
        .tls_files(args.tls_cert, args.tls_key)
        .recordings_dir(args.recordings_dir);

    if let Err(e) = config.validate() {
        tracing::error!("{e}");
        std::process::exit(1);
    }
    if let Err(e) = std::fs::create_dir_all(&config.recordings_dir) {
        tracing::error!(dir = %config.recordings_dir.display(), "failed to create recordings directory: {e}");
        std::process::exit(1);
    }

    if let Err(e) = RelayServer::new(config).run().await {
        tracing::error!("server failed: {e}");
        std::process::exit(1);
    }
}
