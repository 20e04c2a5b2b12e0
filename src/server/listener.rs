//! Listener setup and accept loops
//!
//! The relay can serve plain WebSocket, TLS WebSocket, or both at once.
//! Both accept loops feed the same registry, so a publisher on the plain
//! port reaches subscribers on the TLS port and vice versa.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_rustls::rustls;
use tokio_rustls::TlsAcceptor;

use crate::error::{Error, Result};
use crate::registry::StreamRegistry;
use crate::server::{connection, ServerConfig};

/// The WebRTC relay server
pub struct RelayServer {
    config: Arc<ServerConfig>,
    registry: Arc<StreamRegistry>,
    next_session: AtomicU64,
}

impl RelayServer {
    pub fn new(config: ServerConfig) -> Arc<Self> {
        let config = Arc::new(config);
        Arc::new(Self {
            registry: Arc::new(StreamRegistry::new(config.clone())),
            config,
            next_session: AtomicU64::new(1),
        })
    }

    pub fn registry(&self) -> &Arc<StreamRegistry> {
        &self.registry
    }

    /// Bind every configured listener and serve until one fails
    ///
    /// TLS files with no dedicated TLS address turn the main listener into
    /// a TLS listener instead of adding a second one.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        self.config.validate()?;

        let acceptor = if self.config.tls_cert.is_some() {
            Some(self.tls_acceptor()?)
        } else {
            None
        };

        let mut loops = Vec::new();
        if let Some(addr) = self.config.addr {
            let main_acceptor = if self.config.tls_addr.is_none() {
                acceptor.clone()
            } else {
                None
            };
            let listener = TcpListener::bind(addr).await?;
            tracing::info!(%addr, tls = main_acceptor.is_some(), "Relay listening");
            let server = self.clone();
            loops.push(tokio::spawn(server.accept_loop(listener, main_acceptor)));
        }
        if let Some(addr) = self.config.tls_addr {
            let acceptor = acceptor.ok_or_else(|| {
                Error::Config("--https-addr requires both --tls-cert and --tls-key".into())
            })?;
            let listener = TcpListener::bind(addr).await?;
            tracing::info!(%addr, tls = true, "Relay listening");
            let server = self.clone();
            loops.push(tokio::spawn(server.accept_loop(listener, Some(acceptor))));
        }

        let (result, _, _) = futures_util::future::select_all(loops).await;
        match result {
            Ok(result) => result,
            Err(e) => Err(Error::Config(format!("accept loop panicked: {e}"))),
        }
    }

    async fn accept_loop(
        self: Arc<Self>,
        listener: TcpListener,
        acceptor: Option<TlsAcceptor>,
    ) -> Result<()> {
        loop {
            let (socket, peer_addr) = listener.accept().await?;
            let server = self.clone();
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                server.handle_socket(socket, peer_addr, acceptor).await;
            });
        }
    }

    async fn handle_socket(
        &self,
        socket: tokio::net::TcpStream,
        peer_addr: SocketAddr,
        acceptor: Option<TlsAcceptor>,
    ) {
        let session_id = self.next_session.fetch_add(1, Ordering::Relaxed);
        let result = match acceptor {
            Some(acceptor) => match acceptor.accept(socket).await {
                Ok(tls) => connection::serve(tls, peer_addr, session_id, &self.registry).await,
                Err(e) => {
                    tracing::debug!(%peer_addr, error = %e, "TLS handshake failed");
                    return;
                }
            },
            None => connection::serve(socket, peer_addr, session_id, &self.registry).await,
        };
        if let Err(e) = result {
            tracing::debug!(%peer_addr, session_id, error = %e, "Connection ended with error");
        }
    }

    fn tls_acceptor(&self) -> Result<TlsAcceptor> {
        let (Some(cert_path), Some(key_path)) = (&self.config.tls_cert, &self.config.tls_key)
        else {
            return Err(Error::Config(
                "--https-addr requires both --tls-cert and --tls-key".into(),
            ));
        };

        let mut cert_reader = std::io::BufReader::new(std::fs::File::open(cert_path)?);
        let certs = rustls_pemfile::certs(&mut cert_reader).collect::<std::io::Result<Vec<_>>>()?;
        if certs.is_empty() {
            return Err(Error::Config(format!(
                "no certificates found in {}",
                cert_path.display()
            )));
        }

        let mut key_reader = std::io::BufReader::new(std::fs::File::open(key_path)?);
        let key = rustls_pemfile::private_key(&mut key_reader)?.ok_or_else(|| {
            Error::Config(format!("no private key found in {}", key_path.display()))
        })?;

        let tls_config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| Error::Config(format!("invalid TLS certificate/key: {e}")))?;
        Ok(TlsAcceptor::from(Arc::new(tls_config)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tls_addr_without_files_fails() {
        let config = ServerConfig::default().bind_tls(Some("127.0.0.1:0".parse().unwrap()));
        let server = RelayServer::new(config);
        assert!(server.run().await.is_err());
    }

    #[tokio::test]
    async fn test_missing_cert_file_fails() {
        let config = ServerConfig::default()
            .bind(None)
            .bind_tls(Some("127.0.0.1:0".parse().unwrap()))
            .tls_files(
                Some("/nonexistent/cert.pem".into()),
                Some("/nonexistent/key.pem".into()),
            );
        let server = RelayServer::new(config);
        assert!(server.run().await.is_err());
    }
}
