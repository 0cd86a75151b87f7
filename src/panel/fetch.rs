use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::Regex;
use reqwest::header;
use reqwest::redirect::Policy;
use serde::Serialize;
use url::Url;

use crate::error::{DevframeError, Result};
use crate::proxy::inject::{escape_attr, Injection};
use crate::storage::StorageBridge;

const MAX_REDIRECTS: usize = 10;

/// Desktop browser UA; some sites serve a stripped page to unknown clients.
const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                          (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

static TITLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<title\b[^>]*>(.*?)</title\s*>").unwrap());

/// A page fetched for display in the frame.
#[derive(Debug, Clone, Serialize)]
pub struct FetchedPage {
    /// Final URL after redirects
    pub url: String,
    pub status: u16,
    pub title: Option<String>,
    pub html: String,
    /// False when `html` is the inline error document
    pub ok: bool,
}

/// Direct fetch of non-local sites, sharing the cookie jar with the proxy.
pub struct SiteFetcher {
    client: reqwest::Client,
    storage: Arc<StorageBridge>,
}

impl SiteFetcher {
    pub fn new(storage: Arc<StorageBridge>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(Policy::none())
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()?;
        Ok(Self { client, storage })
    }

    /// Fetch `url` and apply `injection`. Never fails: network errors come
    /// back as an inline error document.
    pub async fn fetch(&self, url: &Url, injection: &Injection) -> FetchedPage {
        match self.fetch_following(url).await {
            Ok((final_url, status, body)) => FetchedPage {
                title: extract_title(&body),
                html: String::from_utf8_lossy(&injection.apply(body.as_bytes(), final_url.as_str()))
                    .into_owned(),
                url: final_url.to_string(),
                status,
                ok: true,
            },
            Err(e) => {
                tracing::warn!("Fetching {} failed: {}", url, e);
                FetchedPage {
                    url: url.to_string(),
                    status: 0,
                    title: None,
                    html: error_document(&e),
                    ok: false,
                }
            }
        }
    }

    async fn fetch_following(&self, start: &Url) -> Result<(Url, u16, String)> {
        let mut url = start.clone();

        for _ in 0..=MAX_REDIRECTS {
            let mut request = self.client.get(url.as_str());
            let cookies = self.storage.cookies_for(&url);
            if !cookies.is_empty() {
                request = request.header(header::COOKIE, cookies);
            }

            let resp = request.send().await?;
            for value in resp.headers().get_all(header::SET_COOKIE) {
                if let Ok(value) = value.to_str() {
                    self.storage.ingest(value, &url);
                }
            }

            if resp.status().is_redirection() {
                if let Some(location) = resp
                    .headers()
                    .get(header::LOCATION)
                    .and_then(|v| v.to_str().ok())
                {
                    let next = url.join(location).map_err(|e| {
                        DevframeError::InvalidUrl(format!("redirect to {}: {}", location, e))
                    })?;
                    tracing::debug!("{} redirected to {}", url, next);
                    url = next;
                    continue;
                }
            }

            let status = resp.status().as_u16();
            let body = resp.text().await?;
            return Ok((url, status, body));
        }

        Err(DevframeError::Other(format!(
            "{}: more than {} redirects",
            start, MAX_REDIRECTS
        )))
    }
}

pub fn extract_title(html: &str) -> Option<String> {
    let raw = TITLE.captures(html)?.get(1)?.as_str();
    let title = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    (!title.is_empty()).then_some(title)
}

fn error_document(err: &DevframeError) -> String {
    format!(
        "<!DOCTYPE html><html><head><title>Error loading page</title></head>\
         <body><h1>Error loading page</h1><p>{}</p></body></html>",
        escape_attr(&err.to_string())
    )
}
