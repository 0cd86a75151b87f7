//! Navigation glue between the relay, the proxy and devtools discovery.
//!
//! The panel plays the `host` endpoint: it owns the current URL, decides
//! whether a page goes through the proxy or is fetched directly, and turns
//! picks and screenshots into [`HostEvent`]s for whoever embeds it.

pub mod fetch;
pub mod url;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::Engine;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use self::fetch::{FetchedPage, SiteFetcher};
use crate::config::Config;
use crate::devtools::{DevToolsLocator, DiscoveryResult};
use crate::error::{DevframeError, Result};
use crate::proxy::{Injection, ProxyEngine, SessionInfo};
use crate::relay::{Endpoint, FrameMessageRouter, RelayMessage};

/// Where a navigation ended up.
#[derive(Debug, Clone)]
pub enum Navigation {
    /// Loopback page served through the proxy
    Proxied {
        url: ::url::Url,
        proxy_url: ::url::Url,
    },
    /// Remote page fetched directly and injected
    External(FetchedPage),
}

/// Something the embedding application should act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    ElementPicked {
        text: String,
        screenshot: Option<String>,
    },
    ScreenshotCaptured {
        data: String,
    },
}

pub struct Panel {
    proxy: Arc<ProxyEngine>,
    devtools: Arc<DevToolsLocator>,
    router: Arc<FrameMessageRouter>,
    fetcher: SiteFetcher,
    background_delay: Duration,
    relay: Option<(String, String)>,
    current: Mutex<Option<::url::Url>>,
    background: Mutex<Option<JoinHandle<()>>>,
}

impl Panel {
    pub fn new(
        config: &Config,
        proxy: Arc<ProxyEngine>,
        devtools: Arc<DevToolsLocator>,
        router: Arc<FrameMessageRouter>,
    ) -> Result<Self> {
        let fetcher = SiteFetcher::new(Arc::clone(router.storage()), Duration::from_secs(30))?;
        Ok(Self {
            proxy,
            devtools,
            router,
            fetcher,
            background_delay: Duration::from_millis(config.devtools.background_delay_ms),
            relay: None,
            current: Mutex::new(None),
            background: Mutex::new(None),
        })
    }

    /// Relay address and token handed to scripts injected into fetched pages.
    pub fn with_relay(mut self, url: impl Into<String>, token: impl Into<String>) -> Self {
        self.relay = Some((url.into(), token.into()));
        self
    }

    pub fn current_url(&self) -> Option<::url::Url> {
        lock(&self.current).clone()
    }

    /// Navigate to what the user typed or the page requested.
    pub async fn load_url(&self, raw: &str) -> Result<Navigation> {
        let url = url::normalize(raw, self.current_url().as_ref())?;
        *lock(&self.current) = Some(url.clone());

        if url::is_loopback(&url) {
            self.load_proxied(url).await
        } else {
            Ok(self.load_external(url).await)
        }
    }

    async fn load_proxied(&self, url: ::url::Url) -> Result<Navigation> {
        let target_port = url::target_port(&url);
        let previous = self.proxy.session().await;
        let proxy_port = self.proxy.start(target_port).await?;
        let session = self.proxy.session().await;

        // A fixed listen port survives a target switch, so compare sessions
        if session_identity(previous.as_ref()) != session_identity(session.as_ref()) {
            self.devtools.invalidate();
        }

        let session_url = session
            .map(|s| s.url)
            .unwrap_or_else(|| format!("http://127.0.0.1:{}/", proxy_port));
        let proxy_url = ::url::Url::parse(&session_url)
            .and_then(|base| base.join(&url::path_and_query(&url)))
            .map_err(|e| DevframeError::InvalidUrl(e.to_string()))?;

        tracing::info!("Proxying {} via {}", url, proxy_url);
        self.router
            .dispatch(Endpoint::Host, RelayMessage::UpdateUrl { url: url.to_string() });
        self.router
            .dispatch(Endpoint::Host, RelayMessage::PickerEligibility { eligible: true });
        self.schedule_discovery(proxy_port);

        Ok(Navigation::Proxied { url, proxy_url })
    }

    async fn load_external(&self, url: ::url::Url) -> Navigation {
        let page = self.fetcher.fetch(&url, &self.external_injection().await).await;

        if page.url != url.as_str() {
            if let Ok(final_url) = ::url::Url::parse(&page.url) {
                *lock(&self.current) = Some(final_url);
            }
        }
        self.router
            .dispatch(Endpoint::Host, RelayMessage::UpdateUrl { url: page.url.clone() });
        self.router
            .dispatch(Endpoint::Host, RelayMessage::PickerEligibility { eligible: page.ok });

        Navigation::External(page)
    }

    /// Fetched pages resolve relative URLs against the remote site, so the
    /// bundle must be addressed absolutely through the running proxy.
    async fn external_injection(&self) -> Injection {
        let config = self.proxy.config();
        let script_src = match self.proxy.session().await {
            Some(session) if config.bundle_src.starts_with('/') => {
                format!("{}{}", session.url.trim_end_matches('/'), config.bundle_src)
            }
            _ => config.bundle_src.clone(),
        };
        let injection = Injection::new(config.mount_id.clone(), script_src);
        match &self.relay {
            Some((url, token)) => injection.with_relay(url.clone(), token.clone()),
            None => injection,
        }
    }

    fn schedule_discovery(&self, proxy_port: u16) {
        let devtools = Arc::clone(&self.devtools);
        let router = Arc::clone(&self.router);
        let delay = self.background_delay;

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            match devtools.discover(Some(proxy_port)).await {
                DiscoveryResult::Ready { url } => {
                    router.dispatch(Endpoint::Host, RelayMessage::UpdateChiiUrl { url });
                }
                DiscoveryResult::Error { error, .. } => {
                    tracing::debug!("Background devtools discovery failed: {}", error);
                }
            }
        });

        if let Some(previous) = lock(&self.background).replace(handle) {
            previous.abort();
        }
    }

    /// Locate devtools for the current page and tell the surface to show them.
    pub async fn open_devtools(&self) -> DiscoveryResult {
        let local = self.current_url().is_some_and(|u| url::is_loopback(&u));
        let result = if local {
            let hint = self.proxy.session().await.map(|s| s.proxy_port);
            self.devtools.discover(hint).await
        } else {
            DiscoveryResult::Error {
                attempts: 0,
                error: "DevTools is only available when viewing a localhost URL".to_string(),
            }
        };

        let message = match &result {
            DiscoveryResult::Ready { url } => RelayMessage::ToggleInternalDevTools {
                url: url.clone(),
                auto_open: None,
            },
            DiscoveryResult::Error { error, .. } => RelayMessage::DevToolsStatus {
                error: error.clone(),
            },
        };
        self.router.dispatch(Endpoint::Host, message);
        result
    }

    /// Handle everything routed to the host until the channel closes.
    pub async fn run_host(
        &self,
        mut inbox: mpsc::UnboundedReceiver<RelayMessage>,
        events: mpsc::UnboundedSender<HostEvent>,
    ) {
        while let Some(message) = inbox.recv().await {
            match message {
                RelayMessage::OpenDevTools => {
                    self.open_devtools().await;
                }
                RelayMessage::LoadUrl { url } => {
                    if let Err(e) = self.load_url(&url).await {
                        tracing::warn!("Navigation to {} failed: {}", url, e);
                    }
                }
                RelayMessage::ElementPicked { text, screenshot } => {
                    let _ = events.send(HostEvent::ElementPicked { text, screenshot });
                }
                RelayMessage::ScreenshotCaptured { data } => {
                    let _ = events.send(HostEvent::ScreenshotCaptured { data });
                }
                other => tracing::debug!("Host ignoring {}", other.command()),
            }
        }
    }

    /// Stop the proxy and forget discovery state.
    pub async fn dispose(&self) {
        if let Some(handle) = lock(&self.background).take() {
            handle.abort();
        }
        self.proxy.stop().await;
        self.devtools.invalidate();
        *lock(&self.current) = None;
    }
}

fn session_identity(session: Option<&SessionInfo>) -> Option<(u16, chrono::DateTime<chrono::Utc>)> {
    session.map(|s| (s.target_port, s.started_at))
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Decode a `data:image/...;base64,` URL and write it under `dir`.
pub fn save_screenshot(data_url: &str, dir: &Path) -> Result<PathBuf> {
    let (meta, payload) = data_url
        .strip_prefix("data:")
        .and_then(|rest| rest.split_once(','))
        .ok_or_else(|| DevframeError::MalformedMessage("screenshot is not a data URL".to_string()))?;
    let mime = meta
        .strip_suffix(";base64")
        .ok_or_else(|| DevframeError::MalformedMessage("screenshot is not base64".to_string()))?;
    let ext = match mime {
        "image/png" => "png",
        "image/jpeg" | "image/jpg" => "jpg",
        "image/webp" => "webp",
        other => {
            return Err(DevframeError::MalformedMessage(format!(
                "unsupported screenshot type {}",
                other
            )))
        }
    };

    let bytes = base64::engine::general_purpose::STANDARD
        .decode(payload.trim())
        .map_err(|e| DevframeError::MalformedMessage(format!("Failed to decode screenshot base64: {}", e)))?;

    std::fs::create_dir_all(dir)?;
    let path = dir.join(format!(
        "devframe-screenshot-{}.{}",
        chrono::Utc::now().format("%Y%m%d-%H%M%S%3f"),
        ext
    ));
    std::fs::write(&path, bytes)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DevToolsConfig;
    use crate::devtools::{DebugTarget, Sleeper, TargetProbe};
    use crate::storage::StorageBridge;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NoTargets;

    #[async_trait]
    impl TargetProbe for NoTargets {
        async fn targets(&self) -> Result<Vec<DebugTarget>> {
            Ok(Vec::new())
        }
    }

    struct OneTarget;

    #[async_trait]
    impl TargetProbe for OneTarget {
        async fn targets(&self) -> Result<Vec<DebugTarget>> {
            Ok(vec![DebugTarget {
                id: "t1".into(),
                title: String::new(),
                url: String::new(),
            }])
        }
    }

    /// Each probe sees a fresh target: t1, t2, ...
    #[derive(Default)]
    struct NewTargetEachTime(AtomicUsize);

    #[async_trait]
    impl TargetProbe for NewTargetEachTime {
        async fn targets(&self) -> Result<Vec<DebugTarget>> {
            let n = self.0.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(vec![DebugTarget {
                id: format!("t{}", n),
                title: String::new(),
                url: String::new(),
            }])
        }
    }

    struct NoSleep;

    #[async_trait]
    impl Sleeper for NoSleep {
        async fn sleep(&self, _: Duration) {}
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        panel: Arc<Panel>,
        router: Arc<FrameMessageRouter>,
    }

    fn fixture(probe: Arc<dyn TargetProbe>) -> Fixture {
        fixture_with(probe, |_| {})
    }

    fn fixture_with(probe: Arc<dyn TargetProbe>, configure: impl FnOnce(&mut Config)) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.devtools.background_delay_ms = 0;
        configure(&mut config);

        let storage = Arc::new(StorageBridge::open(dir.path()).unwrap());
        let router = Arc::new(FrameMessageRouter::new(Arc::clone(&storage)));
        let proxy = Arc::new(ProxyEngine::new(config.proxy.clone()).with_storage(storage));
        let devtools = Arc::new(
            DevToolsLocator::new(&DevToolsConfig::default())
                .unwrap()
                .with_probe(probe)
                .with_sleeper(Arc::new(NoSleep)),
        );
        let panel = Arc::new(Panel::new(&config, proxy, devtools, Arc::clone(&router)).unwrap());

        Fixture { _dir: dir, panel, router }
    }

    #[tokio::test]
    async fn loopback_navigation_goes_through_proxy() {
        let f = fixture(Arc::new(NoTargets));
        let (_id, mut surface) = f.router.attach(Endpoint::Surface);

        let nav = f.panel.load_url("localhost:3999/app?x=1").await.unwrap();
        let Navigation::Proxied { url, proxy_url } = nav else {
            panic!("expected proxied navigation");
        };
        assert_eq!(url.as_str(), "http://localhost:3999/app?x=1");
        assert_eq!(proxy_url.host_str(), Some("127.0.0.1"));
        assert_eq!(proxy_url.path(), "/app");
        assert_eq!(proxy_url.query(), Some("x=1"));

        assert_eq!(
            surface.recv().await,
            Some(RelayMessage::UpdateUrl { url: "http://localhost:3999/app?x=1".into() })
        );
        assert_eq!(
            surface.recv().await,
            Some(RelayMessage::PickerEligibility { eligible: true })
        );
        f.panel.dispose().await;
    }

    #[tokio::test]
    async fn background_discovery_publishes_chii_url() {
        let f = fixture(Arc::new(OneTarget));
        let (_id, mut surface) = f.router.attach(Endpoint::Surface);

        f.panel.load_url("http://127.0.0.1:3998/").await.unwrap();

        let chii = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match surface.recv().await {
                    Some(RelayMessage::UpdateChiiUrl { url }) => break url,
                    Some(_) => continue,
                    None => panic!("surface channel closed"),
                }
            }
        })
        .await
        .unwrap();
        assert!(chii.ends_with("?target=t1"));
        f.panel.dispose().await;
    }

    #[tokio::test]
    async fn open_devtools_requires_local_page() {
        let f = fixture(Arc::new(OneTarget));
        let (_id, mut surface) = f.router.attach(Endpoint::Surface);

        let result = f.panel.open_devtools().await;
        assert!(result.url().is_none());
        assert!(matches!(
            surface.recv().await,
            Some(RelayMessage::DevToolsStatus { .. })
        ));
    }

    #[tokio::test]
    async fn open_devtools_reports_exhaustion() {
        let f = fixture(Arc::new(NoTargets));
        f.panel.load_url("localhost:3997").await.unwrap();
        let (_id, mut surface) = f.router.attach(Endpoint::Surface);

        let result = f.panel.open_devtools().await;
        assert!(matches!(
            result.into_result(),
            Err(DevframeError::DiscoveryTimeout { attempts: 3, .. })
        ));
        assert!(matches!(
            surface.recv().await,
            Some(RelayMessage::DevToolsStatus { .. })
        ));
        f.panel.dispose().await;
    }

    #[tokio::test]
    async fn target_switch_on_fixed_port_forgets_devtools() {
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let f = fixture_with(Arc::new(NewTargetEachTime::default()), |config| {
            config.proxy.listen_port = port;
            config.devtools.background_delay_ms = 60_000;
        });

        f.panel.load_url("localhost:3001").await.unwrap();
        let first = f.panel.open_devtools().await;
        assert!(first.url().unwrap().ends_with("?target=t1"));

        f.panel.load_url("localhost:3002").await.unwrap();
        let session = f.panel.proxy.session().await.unwrap();
        assert_eq!(session.proxy_port, port);
        assert_eq!(session.target_port, 3002);
        assert!(f.panel.devtools.cached().is_none());

        let second = f.panel.open_devtools().await;
        assert!(second.url().unwrap().ends_with("?target=t2"));
        f.panel.dispose().await;
    }

    #[tokio::test]
    async fn reload_of_same_target_keeps_devtools() {
        let f = fixture_with(Arc::new(NewTargetEachTime::default()), |config| {
            config.devtools.background_delay_ms = 60_000;
        });

        f.panel.load_url("localhost:3003").await.unwrap();
        f.panel.open_devtools().await;
        f.panel.load_url("localhost:3003/other").await.unwrap();

        assert!(f.panel.devtools.cached().unwrap().ends_with("?target=t1"));
        f.panel.dispose().await;
    }

    #[tokio::test]
    async fn run_host_forwards_picks_as_events() {
        let f = fixture(Arc::new(NoTargets));
        let (_id, inbox) = f.router.attach(Endpoint::Host);
        let (tx, mut events) = mpsc::unbounded_channel();

        let panel = Arc::clone(&f.panel);
        let host = tokio::spawn(async move { panel.run_host(inbox, tx).await });

        f.router.dispatch(
            Endpoint::Frame,
            RelayMessage::ElementPicked { text: "<h1>".into(), screenshot: None },
        );
        assert_eq!(
            events.recv().await,
            Some(HostEvent::ElementPicked { text: "<h1>".into(), screenshot: None })
        );
        host.abort();
    }

    #[tokio::test]
    async fn dispose_stops_the_proxy() {
        let f = fixture(Arc::new(NoTargets));
        f.panel.load_url("localhost:3996").await.unwrap();
        f.panel.dispose().await;

        assert!(f.panel.current_url().is_none());
        assert!(f.panel.proxy.session().await.is_none());
    }

    #[test]
    fn screenshot_data_url_is_written_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = save_screenshot("data:image/png;base64,iVBORw0KGgo=", dir.path()).unwrap();

        assert_eq!(path.extension().unwrap(), "png");
        assert_eq!(std::fs::read(&path).unwrap(), b"\x89PNG\r\n\x1a\n");
    }

    #[test]
    fn screenshot_rejects_non_data_urls() {
        let dir = tempfile::tempdir().unwrap();
        assert!(save_screenshot("http://x/y.png", dir.path()).is_err());
        assert!(save_screenshot("data:image/png,raw", dir.path()).is_err());
        assert!(save_screenshot("data:text/html;base64,AA==", dir.path()).is_err());
    }
}
