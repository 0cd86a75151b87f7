use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use serde::Serialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::forward::{self, ProxyContext};
use super::inject::Injection;
use crate::config::ProxyConfig;
use crate::error::{DevframeError, Result};
use crate::storage::StorageBridge;

/// Read-only view of the running session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub target_port: u16,
    pub proxy_port: u16,
    pub started_at: DateTime<Utc>,
    /// Address to load in the frame, before any host-side tunnelling
    pub url: String,
}

struct Session {
    info: SessionInfo,
    graceful: CancellationToken,
    force: CancellationToken,
    tracker: TaskTracker,
    accept: JoinHandle<()>,
}

impl Session {
    fn is_live(&self) -> bool {
        !self.accept.is_finished() && !self.graceful.is_cancelled()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.graceful.cancel();
        self.force.cancel();
    }
}

/// Per-panel reverse proxy with at most one live session.
pub struct ProxyEngine {
    config: ProxyConfig,
    injection: Injection,
    storage: Option<Arc<StorageBridge>>,
    session: Mutex<Option<Session>>,
}

impl ProxyEngine {
    pub fn new(config: ProxyConfig) -> Self {
        let injection = Injection::new(config.mount_id.clone(), config.bundle_src.clone());
        Self {
            config,
            injection,
            storage: None,
            session: Mutex::new(None),
        }
    }

    /// Attach a cookie jar: outbound requests get its `Cookie` header and
    /// upstream `Set-Cookie`s are stored.
    pub fn with_storage(mut self, storage: Arc<StorageBridge>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Advertise a relay to the injected script.
    pub fn with_relay(mut self, url: impl Into<String>, token: impl Into<String>) -> Self {
        self.injection = self.injection.with_relay(url, token);
        self
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    fn bind_addr(&self) -> Result<SocketAddr> {
        let host = self.config.bind_host.trim();
        let ip: IpAddr = if host.eq_ignore_ascii_case("localhost") {
            Ipv4Addr::LOCALHOST.into()
        } else {
            host.parse().map_err(|_| {
                DevframeError::ConfigError(format!("proxy.bind_host '{}' is not an IP address", host))
            })?
        };
        Ok(SocketAddr::new(ip, self.config.listen_port))
    }

    async fn load_bundle(&self) -> Option<Bytes> {
        let path = match self.config.resolve_bundle_file() {
            Ok(path) => path?,
            Err(e) => {
                tracing::warn!("Ignoring proxy.bundle_file: {}", e);
                return None;
            }
        };
        match tokio::fs::read(&path).await {
            Ok(content) => Some(Bytes::from(content)),
            Err(e) => {
                tracing::warn!("Cannot read bundle {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Start proxying to `target_port` and return the local proxy port.
    ///
    /// A live session for the same target is reused. A session for another
    /// target is drained first.
    pub async fn start(&self, target_port: u16) -> Result<u16> {
        let mut current = self.session.lock().await;

        if let Some(session) = current.as_ref() {
            if session.info.target_port == target_port && session.is_live() {
                tracing::debug!(
                    "Reusing proxy session :{} -> :{}",
                    session.info.proxy_port,
                    target_port
                );
                return Ok(session.info.proxy_port);
            }
        }
        if let Some(old) = current.take() {
            self.drain(old).await;
        }

        let addr = self.bind_addr()?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| DevframeError::BindFailure { addr, source })?;
        let local = listener.local_addr()?;

        let bundle = self.load_bundle().await;

        let graceful = CancellationToken::new();
        let force = CancellationToken::new();
        let tracker = TaskTracker::new();

        let ctx = Arc::new(ProxyContext {
            upstream_host: self.config.upstream_host.clone(),
            target_port,
            public_origin: self.config.public_origin.clone(),
            injection: self.injection.clone(),
            bundle,
            bundle_path: self.config.bundle_src.clone(),
            storage: self.storage.clone(),
            tracker: tracker.clone(),
            shutdown: graceful.clone(),
            force: force.clone(),
        });

        let accept = tokio::spawn(accept_loop(
            listener,
            ctx,
            graceful.clone(),
            force.clone(),
            tracker.clone(),
        ));

        let info = SessionInfo {
            target_port,
            proxy_port: local.port(),
            started_at: Utc::now(),
            url: format!("http://{}/", local),
        };
        tracing::info!("Proxy started on {} -> {}:{}", local, self.config.upstream_host, target_port);

        *current = Some(Session {
            info,
            graceful,
            force,
            tracker,
            accept,
        });

        Ok(local.port())
    }

    /// Drain and close the current session. No-op without one.
    pub async fn stop(&self) {
        let session = self.session.lock().await.take();
        if let Some(session) = session {
            self.drain(session).await;
        }
    }

    pub async fn session(&self) -> Option<SessionInfo> {
        self.session
            .lock()
            .await
            .as_ref()
            .filter(|s| s.is_live())
            .map(|s| s.info.clone())
    }

    async fn drain(&self, mut session: Session) {
        let port = session.info.proxy_port;
        session.graceful.cancel();
        session.tracker.close();
        if let Err(e) = (&mut session.accept).await {
            tracing::debug!("Accept loop for :{} ended abnormally: {}", port, e);
        }

        let grace = self.config.drain_grace();
        if tokio::time::timeout(grace, session.tracker.wait()).await.is_err() {
            tracing::warn!(
                "Proxy :{} still busy after {:?}, closing remaining connections",
                port,
                grace
            );
            session.force.cancel();
            session.tracker.wait().await;
        }
        tracing::info!("Proxy on :{} stopped", port);
    }
}

async fn accept_loop(
    listener: TcpListener,
    ctx: Arc<ProxyContext>,
    graceful: CancellationToken,
    force: CancellationToken,
    tracker: TaskTracker,
) {
    loop {
        tokio::select! {
            _ = graceful.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tracing::debug!("Proxy connection from {}", peer);
                    tracker.spawn(serve_connection(
                        stream,
                        Arc::clone(&ctx),
                        graceful.clone(),
                        force.clone(),
                    ));
                }
                Err(e) => {
                    tracing::warn!("Proxy accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    ctx: Arc<ProxyContext>,
    graceful: CancellationToken,
    force: CancellationToken,
) {
    let service = service_fn(move |req| forward::handle(req, Arc::clone(&ctx)));
    let conn = http1::Builder::new()
        .serve_connection(TokioIo::new(stream), service)
        .with_upgrades();
    tokio::pin!(conn);

    tokio::select! {
        result = conn.as_mut() => {
            if let Err(e) = result {
                tracing::debug!("Proxy connection error: {}", e);
            }
        }
        _ = graceful.cancelled() => {
            conn.as_mut().graceful_shutdown();
            tokio::select! {
                _ = conn.as_mut() => {}
                _ = force.cancelled() => {}
            }
        }
        _ = force.cancelled() => {}
    }
}
