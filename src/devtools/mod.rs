//! Locating the remote-debugging (Chii) frontend for the proxied page.
//!
//! The debugging server only lists a target once the injected target script
//! has connected, which happens some time after the page loads. Discovery
//! therefore polls a bounded number of times before giving up.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::config::DevToolsConfig;
use crate::error::{DevframeError, Result};

/// One debuggable page as listed by the debugging server.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DebugTarget {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Deserialize)]
struct TargetList {
    #[serde(default)]
    targets: Vec<DebugTarget>,
}

/// Source of the current target list.
#[async_trait]
pub trait TargetProbe: Send + Sync {
    async fn targets(&self) -> Result<Vec<DebugTarget>>;
}

/// Probe that asks `{endpoint}/targets` over HTTP.
pub struct HttpProbe {
    client: reqwest::Client,
    targets_url: String,
}

impl HttpProbe {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .no_proxy()
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            targets_url: format!("{}/targets", endpoint.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl TargetProbe for HttpProbe {
    async fn targets(&self) -> Result<Vec<DebugTarget>> {
        let resp = self
            .client
            .get(&self.targets_url)
            .send()
            .await?
            .error_for_status()?;
        let list: TargetList = resp.json().await?;
        Ok(list.targets)
    }
}

/// Delay between attempts. Injectable so tests never wait.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Outcome of a discovery run, as sent across the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum DiscoveryResult {
    Ready { url: String },
    Error {
        #[serde(skip)]
        attempts: u32,
        error: String,
    },
}

impl DiscoveryResult {
    pub fn url(&self) -> Option<&str> {
        match self {
            DiscoveryResult::Ready { url } => Some(url),
            DiscoveryResult::Error { .. } => None,
        }
    }

    pub fn into_result(self) -> Result<String> {
        match self {
            DiscoveryResult::Ready { url } => Ok(url),
            DiscoveryResult::Error { attempts, error } => Err(DevframeError::DiscoveryTimeout {
                attempts,
                message: error,
            }),
        }
    }
}

pub struct DevToolsLocator {
    endpoint: String,
    attempts: u32,
    delay: Duration,
    probe: Arc<dyn TargetProbe>,
    sleeper: Arc<dyn Sleeper>,
    cached: Mutex<Option<String>>,
}

impl DevToolsLocator {
    pub fn new(config: &DevToolsConfig) -> Result<Self> {
        let endpoint = config.endpoint.trim_end_matches('/').to_string();
        Url::parse(&endpoint)
            .map_err(|e| DevframeError::InvalidUrl(format!("{}: {}", endpoint, e)))?;
        let probe = HttpProbe::new(&endpoint, Duration::from_millis(config.probe_timeout_ms))?;

        Ok(Self {
            endpoint,
            attempts: config.retry_attempts.max(1),
            delay: Duration::from_millis(config.retry_delay_ms),
            probe: Arc::new(probe),
            sleeper: Arc::new(TokioSleeper),
            cached: Mutex::new(None),
        })
    }

    pub fn with_probe(mut self, probe: Arc<dyn TargetProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Frontend URL from the last successful discovery, if still valid.
    pub fn cached(&self) -> Option<String> {
        self.cached
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Forget the cached frontend URL. Called whenever the proxy session changes.
    pub fn invalidate(&self) {
        *self.cached.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
    }

    /// Find a debug target and build its frontend URL.
    ///
    /// `hint` is the proxy port of the current page; a target whose URL
    /// mentions it wins over the others.
    pub async fn discover(&self, hint: Option<u16>) -> DiscoveryResult {
        if let Some(url) = self.cached() {
            return DiscoveryResult::Ready { url };
        }

        let mut last_error = String::new();
        for attempt in 1..=self.attempts {
            match self.probe.targets().await {
                Ok(targets) => match pick_target(&targets, hint) {
                    Some(target) => {
                        let url = self.frontend_url(target);
                        tracing::info!("DevTools target '{}' found on attempt {}", target.id, attempt);
                        *self.cached.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) =
                            Some(url.clone());
                        return DiscoveryResult::Ready { url };
                    }
                    None => last_error = "no debug targets attached yet".to_string(),
                },
                Err(e) => last_error = e.to_string(),
            }

            tracing::debug!(
                "DevTools discovery attempt {}/{} failed: {}",
                attempt,
                self.attempts,
                last_error
            );
            if attempt < self.attempts {
                self.sleeper.sleep(self.delay).await;
            }
        }

        DiscoveryResult::Error {
            attempts: self.attempts,
            error: format!(
                "DevTools not ready at {} after {} attempt(s): {}",
                self.endpoint, self.attempts, last_error
            ),
        }
    }

    fn frontend_url(&self, target: &DebugTarget) -> String {
        let ws_host = Url::parse(&self.endpoint)
            .ok()
            .and_then(|u| {
                u.host_str()
                    .map(|h| match u.port() {
                        Some(port) => format!("{}:{}", h, port),
                        None => h.to_string(),
                    })
            })
            .unwrap_or_else(|| self.endpoint.clone());

        let client_id: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(6)
            .map(char::from)
            .collect();

        format!(
            "{}/front_end/chii_app.html?ws={}/client/{}?target={}",
            self.endpoint, ws_host, client_id, target.id
        )
    }
}

/// Prefer a target on the hinted port, otherwise the most recently attached one.
fn pick_target(targets: &[DebugTarget], hint: Option<u16>) -> Option<&DebugTarget> {
    if let Some(port) = hint {
        let needle = format!(":{}", port);
        if let Some(target) = targets.iter().find(|t| t.url.contains(&needle)) {
            return Some(target);
        }
    }
    targets.last()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct ScriptedProbe {
        calls: AtomicU32,
        answers: Mutex<VecDeque<Result<Vec<DebugTarget>>>>,
    }

    impl ScriptedProbe {
        fn new(answers: Vec<Result<Vec<DebugTarget>>>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                answers: Mutex::new(answers.into()),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TargetProbe for ScriptedProbe {
        async fn targets(&self) -> Result<Vec<DebugTarget>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.answers
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(DevframeError::Other("connection refused".into())))
        }
    }

    #[derive(Default)]
    struct RecordingSleeper {
        slept: Mutex<Vec<Duration>>,
    }

    #[async_trait]
    impl Sleeper for RecordingSleeper {
        async fn sleep(&self, duration: Duration) {
            self.slept.lock().unwrap().push(duration);
        }
    }

    fn target(id: &str, url: &str) -> DebugTarget {
        DebugTarget {
            id: id.to_string(),
            title: String::new(),
            url: url.to_string(),
        }
    }

    fn locator(probe: Arc<ScriptedProbe>, sleeper: Arc<RecordingSleeper>) -> DevToolsLocator {
        DevToolsLocator::new(&DevToolsConfig::default())
            .unwrap()
            .with_probe(probe)
            .with_sleeper(sleeper)
    }

    #[tokio::test]
    async fn gives_up_after_configured_attempts() {
        let probe = ScriptedProbe::new(vec![]);
        let sleeper = Arc::new(RecordingSleeper::default());
        let locator = locator(probe.clone(), sleeper.clone());

        let result = locator.discover(None).await;

        assert_eq!(probe.calls(), 3);
        assert_eq!(*sleeper.slept.lock().unwrap(), vec![Duration::from_millis(1000); 2]);
        let err = result.into_result().unwrap_err();
        assert!(matches!(err, DevframeError::DiscoveryTimeout { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn empty_target_list_counts_as_not_ready() {
        let probe = ScriptedProbe::new(vec![
            Ok(vec![]),
            Ok(vec![target("abc", "http://127.0.0.1:40000/")]),
        ]);
        let locator = locator(probe.clone(), Arc::new(RecordingSleeper::default()));

        let result = locator.discover(None).await;

        assert_eq!(probe.calls(), 2);
        let url = result.url().unwrap();
        assert!(url.starts_with("http://127.0.0.1:8080/front_end/chii_app.html?ws=127.0.0.1:8080/client/"));
        assert!(url.ends_with("?target=abc"));
    }

    #[tokio::test]
    async fn success_is_cached_until_invalidated() {
        let probe = ScriptedProbe::new(vec![
            Ok(vec![target("one", "")]),
            Ok(vec![target("two", "")]),
        ]);
        let locator = locator(probe.clone(), Arc::new(RecordingSleeper::default()));

        let first = locator.discover(None).await;
        let again = locator.discover(None).await;
        assert_eq!(first, again);
        assert_eq!(probe.calls(), 1);

        locator.invalidate();
        let fresh = locator.discover(None).await;
        assert!(fresh.url().unwrap().ends_with("target=two"));
        assert_eq!(probe.calls(), 2);
    }

    #[tokio::test]
    async fn failures_are_not_cached() {
        let probe = ScriptedProbe::new(vec![
            Err(DevframeError::Other("down".into())),
            Err(DevframeError::Other("down".into())),
            Err(DevframeError::Other("down".into())),
            Ok(vec![target("late", "")]),
        ]);
        let locator = locator(probe.clone(), Arc::new(RecordingSleeper::default()));

        assert!(locator.discover(None).await.url().is_none());
        assert!(locator.discover(None).await.url().is_some());
    }

    #[test]
    fn hint_prefers_target_on_proxy_port() {
        let targets = vec![
            target("a", "http://127.0.0.1:5000/"),
            target("b", "http://127.0.0.1:6000/"),
            target("c", "http://example.com/"),
        ];
        assert_eq!(pick_target(&targets, Some(5000)).unwrap().id, "a");
        assert_eq!(pick_target(&targets, Some(7000)).unwrap().id, "c");
        assert_eq!(pick_target(&targets, None).unwrap().id, "c");
        assert!(pick_target(&[], None).is_none());
    }

    #[test]
    fn result_serializes_as_url_or_error() {
        let ready = serde_json::to_value(DiscoveryResult::Ready { url: "http://x".into() }).unwrap();
        assert_eq!(ready, serde_json::json!({ "url": "http://x" }));

        let failed = serde_json::to_value(DiscoveryResult::Error {
            attempts: 3,
            error: "nope".into(),
        })
        .unwrap();
        assert_eq!(failed, serde_json::json!({ "error": "nope" }));
    }

    #[tokio::test]
    async fn http_probe_reports_unreachable_endpoint() {
        let probe = HttpProbe::new("http://127.0.0.1:1", Duration::from_millis(500)).unwrap();
        tokio_test::assert_err!(probe.targets().await);
    }
}
