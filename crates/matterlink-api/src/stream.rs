//! Duplex WebSocket event channel.
//!
//! [`StreamConnection::connect`] performs the bearer-authenticated upgrade
//! and spawns two background tasks:
//!
//! - a **reader** that classifies text frames into events and action
//!   replies, records the first read failure as the *listen error*, and
//!   cancels the *hard-timeout* token when nothing at all (server pings
//!   included) arrives within the ping timeout;
//! - a **writer** that serializes outbound action frames.
//!
//! The stream itself never reconnects. Deciding what a dead stream means
//! is the session supervisor's job.
//!
//! ```rust,ignore
//! let url = stream_url(&server)?;
//! let StreamConnection { handle, mut inbound } =
//!     StreamConnection::connect(StreamOptions::new(url, token)).await?;
//!
//! handle.ping().await?;
//! while let Some(event) = inbound.events.recv().await {
//!     println!("{}", event.event);
//! }
//! handle.close();
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::{self, ClientRequestBuilder, Message};
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::error::Error;
use crate::events::{ActionFrame, Frame, RawEvent, RawResponse};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ── Options ──────────────────────────────────────────────────────────

/// Server pings every 60 s; allow a 5 s buffer before declaring death.
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(65);

const DEFAULT_BUFFER: usize = 100;

/// Connection parameters for the event stream.
#[derive(Debug, Clone)]
pub struct StreamOptions {
    /// Full `ws://` or `wss://` endpoint URL.
    pub url: Url,
    /// Session token sent as `Authorization: Bearer`.
    pub token: SecretString,
    /// Optional `Cookie` header value (session-cookie credentials).
    pub cookie: Option<String>,
    /// Skip TLS certificate verification.
    pub accept_invalid_certs: bool,
    /// Silence longer than this cancels the hard-timeout token.
    pub ping_timeout: Duration,
    /// Capacity of the inbound event and response channels.
    pub buffer: usize,
}

impl StreamOptions {
    pub fn new(url: Url, token: SecretString) -> Self {
        Self {
            url,
            token,
            cookie: None,
            accept_invalid_certs: false,
            ping_timeout: DEFAULT_PING_TIMEOUT,
            buffer: DEFAULT_BUFFER,
        }
    }
}

/// Derive `{ws|wss}://server/api/v4/websocket` from the REST server URL.
pub fn stream_url(server: &Url) -> Result<Url, Error> {
    let mut url = server.clone();
    let scheme = match server.scheme() {
        "https" | "wss" => "wss",
        _ => "ws",
    };
    url.set_scheme(scheme)
        .map_err(|()| Error::WebSocketConnect(format!("cannot derive stream URL from {server}")))?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url.join("api/v4/websocket")?)
}

// ── Handle ───────────────────────────────────────────────────────────

struct HandleInner {
    outbound: mpsc::Sender<ActionFrame>,
    seq: AtomicI64,
    listen_error: Arc<watch::Sender<Option<String>>>,
    hard_timeout: CancellationToken,
    shutdown: CancellationToken,
}

/// Control side of a live stream. Cheaply cloneable.
#[derive(Clone)]
pub struct StreamHandle {
    inner: Arc<HandleInner>,
}

impl StreamHandle {
    /// Queue an action frame. Returns the sequence number assigned to it.
    pub async fn send_action(&self, action: &str, data: Option<Value>) -> Result<i64, Error> {
        let seq = self.inner.seq.fetch_add(1, Ordering::Relaxed) + 1;
        let frame = ActionFrame {
            seq,
            action: action.to_owned(),
            data,
        };
        self.inner
            .outbound
            .send(frame)
            .await
            .map_err(|_| Error::StreamClosed)?;
        Ok(seq)
    }

    /// Send a `ping` action; the server answers with a `pong` response.
    pub async fn ping(&self) -> Result<i64, Error> {
        self.send_action("ping", None).await
    }

    /// The first read failure observed on this connection, if any.
    pub fn listen_error(&self) -> Option<String> {
        self.inner.listen_error.borrow().clone()
    }

    /// Cancelled when the connection has been silent past the ping timeout.
    pub fn hard_timeout(&self) -> CancellationToken {
        self.inner.hard_timeout.clone()
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Stop both background tasks and send a close frame.
    pub fn close(&self) {
        self.inner.shutdown.cancel();
    }
}

impl std::fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandle")
            .field("seq", &self.inner.seq.load(Ordering::Relaxed))
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Receive side of a live stream.
#[derive(Debug)]
pub struct StreamInbound {
    pub events: mpsc::Receiver<RawEvent>,
    pub responses: mpsc::Receiver<RawResponse>,
}

/// A freshly attached stream.
#[derive(Debug)]
pub struct StreamConnection {
    pub handle: StreamHandle,
    pub inbound: StreamInbound,
}

impl StreamConnection {
    /// Open the WebSocket and spawn the reader and writer tasks.
    pub async fn connect(options: StreamOptions) -> Result<Self, Error> {
        info!(url = %options.url, "connecting event stream");

        let uri: tungstenite::http::Uri = options
            .url
            .as_str()
            .parse()
            .map_err(|e: tungstenite::http::uri::InvalidUri| Error::WebSocketConnect(e.to_string()))?;

        let mut request = ClientRequestBuilder::new(uri).with_header(
            "Authorization",
            format!("Bearer {}", options.token.expose_secret()),
        );
        if let Some(ref cookie) = options.cookie {
            request = request.with_header("Cookie", cookie.clone());
        }

        let connector = if options.accept_invalid_certs {
            Some(Connector::Rustls(Arc::new(insecure::client_config()?)))
        } else {
            None
        };

        let (ws, _response) =
            tokio_tungstenite::connect_async_tls_with_config(request, None, false, connector)
                .await
                .map_err(|e| Error::WebSocketConnect(e.to_string()))?;

        info!("event stream connected");
        Ok(Self::spawn(ws, options.ping_timeout, options.buffer))
    }

    fn spawn(ws: WsStream, ping_timeout: Duration, buffer: usize) -> Self {
        let (write, read) = ws.split();
        let (event_tx, event_rx) = mpsc::channel(buffer);
        let (response_tx, response_rx) = mpsc::channel(buffer);
        let (outbound_tx, outbound_rx) = mpsc::channel(buffer);
        let (listen_error, _) = watch::channel(None);
        let listen_error = Arc::new(listen_error);
        let hard_timeout = CancellationToken::new();
        let shutdown = CancellationToken::new();

        tokio::spawn(read_loop(
            read,
            event_tx,
            response_tx,
            Arc::clone(&listen_error),
            hard_timeout.clone(),
            shutdown.clone(),
            ping_timeout,
        ));
        tokio::spawn(write_loop(
            write,
            outbound_rx,
            Arc::clone(&listen_error),
            shutdown.clone(),
        ));

        let handle = StreamHandle {
            inner: Arc::new(HandleInner {
                outbound: outbound_tx,
                seq: AtomicI64::new(0),
                listen_error,
                hard_timeout,
                shutdown,
            }),
        };
        let inbound = StreamInbound {
            events: event_rx,
            responses: response_rx,
        };
        Self { handle, inbound }
    }
}

// ── Background tasks ─────────────────────────────────────────────────

/// Keep only the first failure: later ones are consequences of it.
fn record_error(listen_error: &watch::Sender<Option<String>>, message: String) {
    listen_error.send_if_modified(|current| {
        if current.is_none() {
            *current = Some(message);
            true
        } else {
            false
        }
    });
}

async fn read_loop(
    mut read: SplitStream<WsStream>,
    event_tx: mpsc::Sender<RawEvent>,
    response_tx: mpsc::Sender<RawResponse>,
    listen_error: Arc<watch::Sender<Option<String>>>,
    hard_timeout: CancellationToken,
    shutdown: CancellationToken,
    ping_timeout: Duration,
) {
    loop {
        tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            frame = tokio::time::timeout(ping_timeout, read.next()) => {
                match frame {
                    Err(_) => {
                        warn!(timeout_secs = ping_timeout.as_secs(), "event stream silent, hard timeout");
                        record_error(&listen_error, "no frames within ping timeout".into());
                        hard_timeout.cancel();
                        break;
                    }
                    Ok(Some(Ok(Message::Text(text)))) => match Frame::parse(text.as_str()) {
                        Some(Frame::Event(event)) => {
                            if event_tx.send(event).await.is_err() {
                                debug!("event receiver dropped");
                                break;
                            }
                        }
                        Some(Frame::Response(response)) => {
                            if response_tx.send(response).await.is_err() {
                                debug!("response receiver dropped");
                                break;
                            }
                        }
                        None => {}
                    },
                    Ok(Some(Ok(Message::Ping(_)))) => {
                        // tungstenite queues the pong reply itself
                        trace!("stream ping");
                    }
                    Ok(Some(Ok(Message::Close(frame)))) => {
                        let message = match frame {
                            Some(cf) => {
                                info!(code = %cf.code, reason = %cf.reason, "close frame received");
                                format!("closed by server (code {}): {}", cf.code, cf.reason)
                            }
                            None => {
                                info!("close frame received (no payload)");
                                "closed by server".to_owned()
                            }
                        };
                        record_error(&listen_error, message);
                        break;
                    }
                    Ok(Some(Err(e))) => {
                        warn!(error = %e, "event stream read failed");
                        record_error(&listen_error, e.to_string());
                        break;
                    }
                    Ok(None) => {
                        info!("event stream ended");
                        record_error(&listen_error, "stream ended".into());
                        break;
                    }
                    Ok(Some(Ok(_))) => {
                        // Binary, Pong, Frame -- ignore
                    }
                }
            }
        }
    }
    debug!("stream reader exiting");
}

async fn write_loop(
    mut write: SplitSink<WsStream, Message>,
    mut outbound: mpsc::Receiver<ActionFrame>,
    listen_error: Arc<watch::Sender<Option<String>>>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            () = shutdown.cancelled() => {
                let _ = write.send(Message::Close(None)).await;
                break;
            }
            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                let text = match serde_json::to_string(&frame) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(error = %e, action = %frame.action, "failed to encode action");
                        continue;
                    }
                };
                trace!(seq = frame.seq, action = %frame.action, "sending action");
                if let Err(e) = write.send(Message::Text(text.into())).await {
                    warn!(error = %e, "event stream write failed");
                    record_error(&listen_error, e.to_string());
                    break;
                }
            }
        }
    }
    debug!("stream writer exiting");
}

// ── TLS ──────────────────────────────────────────────────────────────

mod insecure {
    use std::sync::Arc;

    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};

    use crate::error::Error;

    /// rustls config that accepts any server certificate but still checks
    /// handshake signatures.
    pub(super) fn client_config() -> Result<ClientConfig, Error> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = ClientConfig::builder_with_provider(Arc::clone(&provider))
            .with_safe_default_protocol_versions()
            .map_err(|e| Error::Tls(e.to_string()))?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCert(provider)))
            .with_no_client_auth();
        Ok(config)
    }

    #[derive(Debug)]
    struct AcceptAnyCert(Arc<CryptoProvider>);

    impl ServerCertVerifier for AcceptAnyCert {
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
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn stream_url_switches_scheme_and_keeps_port() {
        let server = Url::parse("https://chat.example.com:8443").unwrap();
        assert_eq!(
            stream_url(&server).unwrap().as_str(),
            "wss://chat.example.com:8443/api/v4/websocket"
        );

        let plain = Url::parse("http://localhost:8065/mm").unwrap();
        assert_eq!(
            stream_url(&plain).unwrap().as_str(),
            "ws://localhost:8065/mm/api/v4/websocket"
        );
    }

    #[test]
    fn options_default_to_65s_ping_timeout() {
        let url = Url::parse("ws://localhost/api/v4/websocket").unwrap();
        let opts = StreamOptions::new(url, SecretString::from("t".to_string()));
        assert_eq!(opts.ping_timeout, Duration::from_secs(65));
        assert!(opts.cookie.is_none());
    }

    #[test]
    fn insecure_config_builds() {
        assert!(insecure::client_config().is_ok());
    }
}
