use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use rand::Rng;
use subtle::ConstantTimeEq;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use super::message::RelayMessage;
use super::router::{Endpoint, FrameMessageRouter};
use crate::error::{DevframeError, Result};

/// Token prefix for relay session tokens.
const TOKEN_PREFIX: &str = "dfr_";

/// Protocol version we speak and the minimum we accept in hello.
pub const PROTOCOL_VERSION: &str = "1.0.0";

const HELLO_TIMEOUT: Duration = Duration::from_secs(5);

/// Generate a new session token: `dfr_` + 32 random hex characters.
pub fn generate_token() -> String {
    let mut rng = rand::thread_rng();
    let bytes: [u8; 16] = rng.gen();
    let hex: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
    format!("{}{}", TOKEN_PREFIX, hex)
}

/// Bind the relay listener on loopback.
pub async fn bind(port: u16) -> Result<TcpListener> {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    TcpListener::bind(addr)
        .await
        .map_err(|source| DevframeError::BindFailure { addr, source })
}

/// WebSocket front door of the [`FrameMessageRouter`].
///
/// Each connection says hello with its role and the session token, then
/// every text frame it sends is dispatched from that role and everything
/// routed to that role is written back.
#[derive(Clone)]
pub struct RelayServer {
    router: Arc<FrameMessageRouter>,
    token: Arc<str>,
    extra_origins: Arc<Vec<String>>,
}

impl RelayServer {
    pub fn new(router: Arc<FrameMessageRouter>, token: impl Into<String>) -> Self {
        Self {
            router,
            token: Arc::from(token.into()),
            extra_origins: Arc::new(Vec::new()),
        }
    }

    /// Also accept connections whose `Origin` is exactly `origin`, such as a
    /// tunnelled public address of the proxy.
    pub fn allow_origin(mut self, origin: impl Into<String>) -> Self {
        let mut origins = (*self.extra_origins).clone();
        origins.push(origin.into().trim_end_matches('/').to_lowercase());
        self.extra_origins = Arc::new(origins);
        self
    }

    /// Accept connections until `shutdown` fires.
    pub async fn serve(self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        if let Ok(addr) = listener.local_addr() {
            tracing::info!("Relay listening on ws://{}", addr);
        }

        loop {
            let (stream, peer) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => accepted
                    .map_err(|e| DevframeError::RelayError(format!("Accept failed: {}", e)))?,
            };

            tracing::debug!("New relay connection from {}", peer);
            // Only loopback peers may reach the relay
            if !peer.ip().is_loopback() {
                tracing::warn!("Rejected non-loopback relay connection from {}", peer);
                continue;
            }

            let server = self.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { server.handle_connection(stream, shutdown).await });
        }

        tracing::info!("Relay stopped");
        Ok(())
    }

    fn is_origin_allowed(&self, origin: Option<&str>) -> bool {
        let Some(origin) = origin else {
            return true;
        };
        let lower = origin.trim_end_matches('/').to_lowercase();
        if self.extra_origins.iter().any(|o| *o == lower) {
            return true;
        }
        is_origin_allowed(Some(&lower))
    }

    async fn handle_connection(self, stream: TcpStream, shutdown: CancellationToken) {
        let ws = match tokio_tungstenite::accept_hdr_async(
            stream,
            |req: &tokio_tungstenite::tungstenite::http::Request<()>,
             resp: tokio_tungstenite::tungstenite::http::Response<()>|
             -> std::result::Result<
                tokio_tungstenite::tungstenite::http::Response<()>,
                tokio_tungstenite::tungstenite::http::Response<Option<String>>,
            > {
                let origin = req.headers().get("origin").and_then(|v| v.to_str().ok());
                if !self.is_origin_allowed(origin) {
                    tracing::warn!("Rejected relay connection with origin: {:?}", origin);
                    let mut rejection = tokio_tungstenite::tungstenite::http::Response::new(Some(
                        "Forbidden origin".to_string(),
                    ));
                    *rejection.status_mut() = StatusCode::FORBIDDEN;
                    return Err(rejection);
                }
                Ok(resp)
            },
        )
        .await
        {
            Ok(ws) => ws,
            Err(e) => {
                tracing::debug!("Relay handshake failed: {}", e);
                return;
            }
        };

        let (mut write, mut read) = ws.split();

        let first = match tokio::time::timeout(HELLO_TIMEOUT, read.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => text.to_string(),
            _ => {
                tracing::warn!("Relay client disconnected or timed out before hello");
                return;
            }
        };

        let role = match self.check_hello(&first) {
            Ok(role) => role,
            Err(reply) => {
                let _ = write.send(Message::Text(reply.to_string().into())).await;
                return;
            }
        };

        // Attach before acking so a client may send right after hello_ack
        let (attachment, mut rx) = self.router.attach(role);
        let ack = serde_json::json!({
            "type": "hello_ack",
            "version": PROTOCOL_VERSION,
            "role": role.as_str(),
        });
        if write.send(Message::Text(ack.to_string().into())).await.is_err() {
            self.router.detach(role, attachment);
            return;
        }
        tracing::info!("{} attached to relay", role.as_str());

        let writer = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if write.send(Message::Text(msg.to_json().into())).await.is_err() {
                    break;
                }
            }
            let _ = write.close().await;
        });

        loop {
            let frame = tokio::select! {
                _ = shutdown.cancelled() => break,
                frame = read.next() => frame,
            };
            match frame {
                Some(Ok(Message::Text(text))) => {
                    let Some(message) = RelayMessage::parse(text.as_str()) else {
                        continue;
                    };
                    if matches!(message, RelayMessage::StorageUpdate { .. }) {
                        // Persisting syncs to disk
                        let router = Arc::clone(&self.router);
                        if let Err(e) =
                            tokio::task::spawn_blocking(move || router.dispatch(role, message)).await
                        {
                            tracing::warn!("storageUpdate from {} failed: {}", role.as_str(), e);
                        }
                    } else {
                        self.router.dispatch(role, message);
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    tracing::debug!("{} relay connection error: {}", role.as_str(), e);
                    break;
                }
                Some(Ok(_)) => {}
            }
        }

        self.router.detach(role, attachment);
        writer.abort();
        tracing::info!("{} detached from relay", role.as_str());
    }

    /// Validate the hello frame; on failure returns the `hello_error` to send.
    fn check_hello(&self, raw: &str) -> std::result::Result<Endpoint, serde_json::Value> {
        let hello_error = |error: &str, message: String| {
            serde_json::json!({ "type": "hello_error", "error": error, "message": message })
        };

        let parsed: serde_json::Value = serde_json::from_str(raw)
            .map_err(|_| hello_error("invalid_json", "hello must be a JSON object".to_string()))?;

        if parsed.get("type").and_then(|t| t.as_str()) != Some("hello") {
            return Err(hello_error("expected_hello", "first message must be hello".to_string()));
        }

        let version = parsed.get("version").and_then(|v| v.as_str()).unwrap_or("0.0.0");
        let min_version = semver::Version::new(1, 0, 0);
        match semver::Version::parse(version) {
            Ok(v) if v >= min_version => {}
            _ => {
                tracing::warn!("Rejected relay client with version {}", version);
                let mut err = hello_error(
                    "version_mismatch",
                    format!(
                        "Protocol version {} is not supported. Minimum required: {}",
                        version, PROTOCOL_VERSION
                    ),
                );
                err["required_version"] = PROTOCOL_VERSION.into();
                return Err(err);
            }
        }

        // Constant-time to avoid leaking the token through timing
        let token = parsed.get("token").and_then(|t| t.as_str()).unwrap_or("");
        if token.as_bytes().ct_eq(self.token.as_bytes()).unwrap_u8() != 1 {
            tracing::warn!("Invalid relay token");
            return Err(hello_error("invalid_token", "Token mismatch".to_string()));
        }

        let role = parsed.get("role").and_then(|r| r.as_str()).unwrap_or("");
        role.parse::<Endpoint>()
            .map_err(|e| hello_error("unknown_role", e))
    }
}

/// Parse an origin string into (scheme, host, optional_port).
fn parse_origin(origin: &str) -> Option<(&str, &str, Option<&str>)> {
    let (scheme, rest) = origin.split_once("://")?;
    let rest = rest.trim_end_matches('/');
    if rest.is_empty() {
        return None;
    }
    if rest.starts_with('[') {
        let end = rest.find(']')?;
        let host = &rest[..=end];
        match &rest[end + 1..] {
            "" => Some((scheme, host, None)),
            after => after.strip_prefix(':').map(|port| (scheme, host, Some(port))),
        }
    } else {
        match rest.split_once(':') {
            Some((host, port)) if !host.is_empty() => Some((scheme, host, Some(port))),
            Some(_) => None,
            None => Some((scheme, rest, None)),
        }
    }
}

/// Loopback http(s) pages and webview/extension hosts may connect.
fn is_origin_allowed(origin: Option<&str>) -> bool {
    let Some(origin) = origin else {
        return true;
    };
    let lower = origin.to_lowercase();
    match parse_origin(&lower) {
        Some((scheme, _, _)) if scheme.ends_with("-webview") || scheme.ends_with("-extension") => true,
        Some(("http" | "https", host, _)) => matches!(host, "127.0.0.1" | "localhost" | "[::1]"),
        _ => false,
    }
}
