//! Text-frame transport underneath the Cortex session.
//!
//! [`SessionClient`][crate::session::SessionClient] only needs to send one
//! text frame and receive the next one, so the WebSocket is hidden behind
//! [`RpcTransport`]. Tests substitute a scripted in-memory transport.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use neogrip_types::NeoError;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream, connect_async_tls_with_config};
use tracing::{debug, info};

/// A duplex, message-oriented text channel.
#[async_trait]
pub trait RpcTransport: Send {
    /// Send one text frame.
    async fn send(&mut self, text: String) -> Result<(), NeoError>;

    /// Next inbound text frame, or `None` once the peer has closed.
    async fn recv(&mut self) -> Result<Option<String>, NeoError>;

    /// Close the connection. Calling it twice is harmless.
    async fn close(&mut self) -> Result<(), NeoError>;
}

/// [`RpcTransport`] over a (TLS) WebSocket.
pub struct WsTransport {
    url: String,
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    closed: bool,
}

impl WsTransport {
    /// Open a WebSocket to `url`.
    ///
    /// The Cortex service listens on `wss://localhost:6868` with a
    /// self-signed certificate; `insecure_tls` skips certificate and host
    /// name verification for such local endpoints.
    ///
    /// # Errors
    ///
    /// [`NeoError::Connectivity`] if the handshake fails.
    pub async fn connect(url: &str, insecure_tls: bool) -> Result<Self, NeoError> {
        let connector = if url.starts_with("wss://") {
            // Idempotent; an already installed provider is kept.
            let _ = rustls::crypto::ring::default_provider().install_default();
            insecure_tls.then(insecure_connector).transpose()?
        } else {
            None
        };
        let (ws, _response) = connect_async_tls_with_config(url, None, true, connector)
            .await
            .map_err(|e| ws_error(url, e))?;
        info!(url, insecure_tls, "connected to Cortex");
        Ok(Self {
            url: url.to_string(),
            ws,
            closed: false,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl RpcTransport for WsTransport {
    async fn send(&mut self, text: String) -> Result<(), NeoError> {
        self.ws
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| ws_error(&self.url, e))
    }

    async fn recv(&mut self) -> Result<Option<String>, NeoError> {
        if self.closed {
            return Ok(None);
        }
        while let Some(frame) = self.ws.next().await {
            match frame.map_err(|e| ws_error(&self.url, e))? {
                Message::Text(text) => return Ok(Some(text.as_str().to_owned())),
                Message::Binary(bytes) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => return Ok(Some(text)),
                    Err(_) => debug!(len = bytes.len(), "ignoring non-UTF-8 binary frame"),
                },
                Message::Close(frame) => {
                    debug!(?frame, "Cortex closed the connection");
                    self.closed = true;
                    return Ok(None);
                }
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
            }
        }
        self.closed = true;
        Ok(None)
    }

    async fn close(&mut self) -> Result<(), NeoError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        match self.ws.close(None).await {
            Ok(()) | Err(tungstenite::Error::ConnectionClosed) => Ok(()),
            Err(e) => Err(ws_error(&self.url, e)),
        }
    }
}

fn insecure_connector() -> Result<Connector, NeoError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| NeoError::Connectivity(format!("TLS setup: {e}")))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate(provider)))
        .with_no_client_auth();
    Ok(Connector::Rustls(Arc::new(config)))
}

/// Accepts whatever certificate the server presents; handshake signatures
/// are still checked.
#[derive(Debug)]
struct AcceptAnyCertificate(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

fn ws_error(url: &str, e: tungstenite::Error) -> NeoError {
    NeoError::Connectivity(format!("{url}: {e}"))
}
