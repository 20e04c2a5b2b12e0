//! WebSocket connection lifecycle
//!
//! The role and stream ID ride on the upgrade request
//! (`/ws?role=publisher&streamId=drone-1`); anything malformed is refused
//! before the upgrade completes. After that, a read pump applies signaling
//! and a write pump drains the client's outbound queue and keeps the socket
//! alive with pings.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async_with_config, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::registry::StreamRegistry;
use crate::session::{Client, Role};
use crate::signal::SignalMessage;

const WS_PATH: &str = "/ws";

/// Serve one accepted socket end to end
pub async fn serve<S>(
    io: S,
    peer_addr: SocketAddr,
    session_id: u64,
    registry: &Arc<StreamRegistry>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let config = registry.config().clone();
    let ws_config = WebSocketConfig {
        max_message_size: Some(config.max_message_size),
        ..Default::default()
    };

    let mut params: Option<(Role, String)> = None;
    let callback = |req: &Request, resp: Response| -> std::result::Result<Response, ErrorResponse> {
        match parse_upgrade_request(req) {
            Ok(parsed) => {
                params = Some(parsed);
                Ok(resp)
            }
            Err((status, reason)) => {
                let mut response = ErrorResponse::new(Some(reason.to_string()));
                *response.status_mut() = status;
                Err(response)
            }
        }
    };
    let ws = accept_hdr_async_with_config(io, callback, Some(ws_config)).await?;
    let Some((role, stream_id)) = params else {
        // The callback always fills this in on success
        return Ok(());
    };

    tracing::info!(%peer_addr, session_id, %role, stream = %stream_id, "Client connected");

    let stream = registry.resolve(&stream_id).await;
    let (client, outbound) = Client::new(session_id, role, stream.clone(), config.send_queue);

    let (sink, source) = ws.split();
    tokio::spawn(write_pump(
        sink,
        outbound,
        client.shutdown_token(),
        config.write_wait,
        config.ping_period(),
    ));

    let registration = match role {
        Role::Publisher => stream.register_publisher(&client).await,
        Role::Subscriber => stream.register_subscriber(&client).await,
    };
    if let Err(e) = registration {
        tracing::warn!(session_id, stream = %stream_id, error = %e, "Registration failed");
        client.send_error(&e.to_string(), "REGISTRATION_FAILED");
        client.close().await;
        return Ok(());
    }

    read_pump(source, &client, config.pong_wait).await;
    client.close().await;
    Ok(())
}

/// Extract and validate `role` and `streamId` before upgrading
fn parse_upgrade_request(req: &Request) -> std::result::Result<(Role, String), (StatusCode, &'static str)> {
    if req.uri().path() != WS_PATH {
        return Err((StatusCode::NOT_FOUND, "not found"));
    }
    let query = req.uri().query().unwrap_or("");
    let mut role = None;
    let mut stream_id = None;
    for pair in query.split('&') {
        match pair.split_once('=') {
            Some(("role", value)) => role = Some(value),
            Some(("streamId", value)) => stream_id = Some(value),
            _ => {}
        }
    }
    let (Some(role), Some(stream_id)) = (role, stream_id) else {
        return Err((StatusCode::BAD_REQUEST, "role and streamId are required"));
    };
    if stream_id.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "role and streamId are required"));
    }
    let Some(role) = Role::parse(role) else {
        return Err((StatusCode::BAD_REQUEST, "unknown role"));
    };
    Ok((role, stream_id.to_string()))
}

/// Apply inbound frames until the socket closes or goes silent
///
/// A frame that is not valid JSON gets an `INVALID_JSON` error back but
/// does not end the connection; signaling errors likewise.
async fn read_pump<S>(
    mut source: SplitStream<WebSocketStream<S>>,
    client: &Arc<Client>,
    pong_wait: Duration,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let msg = match tokio::time::timeout(pong_wait, source.next()).await {
            Err(_) => {
                tracing::info!(session_id = client.id(), "Client silent past pong deadline");
                return;
            }
            Ok(None) => return,
            Ok(Some(Err(e))) => {
                tracing::debug!(session_id = client.id(), error = %e, "WebSocket read error");
                return;
            }
            Ok(Some(Ok(msg))) => msg,
        };

        let text = match &msg {
            Message::Text(text) => text.as_str(),
            Message::Binary(data) => match std::str::from_utf8(data) {
                Ok(text) => text,
                Err(_) => {
                    client.send_error("invalid signaling message", "INVALID_JSON");
                    continue;
                }
            },
            Message::Close(_) => return,
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
        };

        let signal: SignalMessage = match serde_json::from_str(text) {
            Ok(signal) => signal,
            Err(_) => {
                client.send_error("invalid signaling message", "INVALID_JSON");
                continue;
            }
        };
        if let Err(e) = client.handle_signal(signal).await {
            client.send_error(&e.to_string(), "SIGNALING_ERROR");
        }
    }
}

/// Drain the outbound queue onto the socket, interleaving keepalive pings
async fn write_pump<S>(
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    mut outbound: mpsc::Receiver<Message>,
    shutdown: CancellationToken,
    write_wait: Duration,
    ping_period: Duration,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut ping = tokio::time::interval(ping_period);
    // Skip the interval's immediate first tick
    ping.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                // Frames queued before the shutdown (registration errors in
                // particular) must still reach the client before the close
                while let Ok(msg) = outbound.try_recv() {
                    let sent = tokio::time::timeout(write_wait, sink.send(msg)).await;
                    if !matches!(sent, Ok(Ok(()))) {
                        return;
                    }
                }
                let _ = tokio::time::timeout(write_wait, sink.send(Message::Close(None))).await;
                return;
            }
            msg = outbound.recv() => {
                let Some(msg) = msg else {
                    let _ = tokio::time::timeout(write_wait, sink.send(Message::Close(None))).await;
                    return;
                };
                match tokio::time::timeout(write_wait, sink.send(msg)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        tracing::debug!(error = %e, "WebSocket write failed");
                        return;
                    }
                    Err(_) => {
                        tracing::debug!("WebSocket write timed out");
                        return;
                    }
                }
            }
            _ = ping.tick() => {
                let sent = tokio::time::timeout(write_wait, sink.send(Message::Ping(Vec::new()))).await;
                if !matches!(sent, Ok(Ok(()))) {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upgrade_request(uri: &str) -> Request {
        Request::builder()
            .uri(uri)
            .body(())
            .expect("valid test request")
    }

    #[test]
    fn test_parse_valid_request() {
        let req = upgrade_request("/ws?role=publisher&streamId=drone-1");
        let (role, stream_id) = parse_upgrade_request(&req).unwrap();
        assert_eq!(role, Role::Publisher);
        assert_eq!(stream_id, "drone-1");
    }

    #[test]
    fn test_missing_params_rejected() {
        for uri in ["/ws", "/ws?role=publisher", "/ws?streamId=a", "/ws?role=publisher&streamId="] {
            let (status, _) = parse_upgrade_request(&upgrade_request(uri)).unwrap_err();
            assert_eq!(status, StatusCode::BAD_REQUEST, "{uri}");
        }
    }

    #[test]
    fn test_unknown_role_rejected() {
        let req = upgrade_request("/ws?role=admin&streamId=a");
        let (status, reason) = parse_upgrade_request(&req).unwrap_err();
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(reason, "unknown role");
    }

    #[test]
    fn test_wrong_path_rejected() {
        let req = upgrade_request("/metrics?role=publisher&streamId=a");
        let (status, _) = parse_upgrade_request(&req).unwrap_err();
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_extra_params_ignored() {
        let req = upgrade_request("/ws?token=abc&role=subscriber&streamId=s&x=1");
        let (role, stream_id) = parse_upgrade_request(&req).unwrap();
        assert_eq!(role, Role::Subscriber);
        assert_eq!(stream_id, "s");
    }

    #[tokio::test]
    async fn test_registration_conflict_error_frame_delivered() {
        use crate::server::ServerConfig;

        let registry = Arc::new(StreamRegistry::new(Arc::new(ServerConfig::default())));
        let peer_addr: SocketAddr = "127.0.0.1:1".parse().unwrap();

        let (io, client_io) = tokio::io::duplex(4096);
        let reg = registry.clone();
        tokio::spawn(async move {
            let _ = serve(io, peer_addr, 1, &reg).await;
        });
        let (_first, _) = tokio_tungstenite::client_async(
            "ws://localhost/ws?role=publisher&streamId=s",
            client_io,
        )
        .await
        .unwrap();

        // Wait until the first publisher holds the slot, then connect a
        // second one to the same stream
        let stream = registry.resolve("s").await;
        while !stream.has_publisher().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let (io, client_io) = tokio::io::duplex(4096);
        let reg = registry.clone();
        tokio::spawn(async move {
            let _ = serve(io, peer_addr, 2, &reg).await;
        });
        let (mut second, _) = tokio_tungstenite::client_async(
            "ws://localhost/ws?role=publisher&streamId=s",
            client_io,
        )
        .await
        .unwrap();

        // The error frame arrives before the connection closes
        let frame = second.next().await.unwrap().unwrap();
        let value: serde_json::Value =
            serde_json::from_str(frame.to_text().unwrap()).unwrap();
        assert_eq!(value["error"], "publisher already connected");
        assert_eq!(value["code"], "REGISTRATION_FAILED");

        let close = second.next().await.unwrap().unwrap();
        assert!(matches!(close, Message::Close(_)));
    }
}
