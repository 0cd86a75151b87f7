use std::net::IpAddr;
use std::path::PathBuf;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use super::write_atomic;
use crate::error::{DevframeError, Result};

/// Snapshot format version written to `cookies.json`.
const SNAPSHOT_VERSION: u32 = 1;

/// A stored cookie.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cookie {
    pub name: String,
    pub value: String,
    /// Lowercased domain without a leading dot
    pub domain: String,
    pub path: String,
    /// Unix timestamp in seconds; `None` is a session cookie
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<i64>,
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub http_only: bool,
    /// Set when the cookie had no Domain attribute: only the exact host gets it back
    #[serde(default)]
    pub host_only: bool,
}

impl Cookie {
    /// Parse one `Set-Cookie` header value received from `url`.
    ///
    /// Returns `None` for values a browser would reject: no `name=value` pair,
    /// a Domain the request host does not belong to, or a Secure cookie set
    /// from an insecure origin.
    pub fn parse(set_cookie: &str, url: &Url, now: DateTime<Utc>) -> Option<Cookie> {
        let host = url.host_str()?.trim_matches(['[', ']']).to_ascii_lowercase();

        let mut parts = set_cookie.split(';');
        let (name, value) = parts.next()?.split_once('=')?;
        let name = name.trim();
        if name.is_empty() {
            return None;
        }

        let mut domain_attr = None;
        let mut path_attr = None;
        let mut expires_attr = None;
        let mut max_age = None;
        let mut secure = false;
        let mut http_only = false;

        for attr in parts {
            let attr = attr.trim();
            if attr.is_empty() {
                continue;
            }
            let (key, val) = match attr.split_once('=') {
                Some((k, v)) => (k.trim(), v.trim()),
                None => (attr, ""),
            };
            match key.to_ascii_lowercase().as_str() {
                "domain" => {
                    let domain = val.trim_start_matches('.').to_ascii_lowercase();
                    if !domain.is_empty() {
                        domain_attr = Some(domain);
                    }
                }
                "path" if val.starts_with('/') => path_attr = Some(val.to_string()),
                "expires" => expires_attr = parse_cookie_date(val),
                "max-age" => max_age = val.parse::<i64>().ok(),
                "secure" => secure = true,
                "httponly" => http_only = true,
                _ => {}
            }
        }

        if secure && !is_secure_context(url) {
            return None;
        }

        let (domain, host_only) = match domain_attr {
            Some(domain) => {
                if !domain_matches(&host, &domain) {
                    return None;
                }
                (domain, false)
            }
            None => (host, true),
        };

        // Max-Age wins over Expires; a non-positive Max-Age expires immediately
        let expires = match max_age {
            Some(secs) if secs <= 0 => Some(0),
            Some(secs) => Some(now.timestamp().saturating_add(secs)),
            None => expires_attr,
        };

        Some(Cookie {
            name: name.to_string(),
            value: value.trim().to_string(),
            domain,
            path: path_attr.unwrap_or_else(|| default_path(url.path())),
            expires,
            secure,
            http_only,
            host_only,
        })
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires.is_some_and(|at| at <= now.timestamp())
    }

    /// Whether this cookie should be sent with a request to `url`.
    pub fn matches(&self, url: &Url, now: DateTime<Utc>) -> bool {
        let Some(host) = url.host_str() else {
            return false;
        };
        let host = host.trim_matches(['[', ']']).to_ascii_lowercase();

        let domain_ok = if self.host_only {
            host == self.domain
        } else {
            domain_matches(&host, &self.domain)
        };

        domain_ok
            && !self.is_expired(now)
            && path_matches(url.path(), &self.path)
            && (!self.secure || is_secure_context(url))
    }

    fn same_identity(&self, other: &Cookie) -> bool {
        self.name == other.name && self.domain == other.domain && self.path == other.path
    }
}

fn parse_cookie_date(value: &str) -> Option<i64> {
    if let Ok(dt) = DateTime::parse_from_rfc2822(value) {
        return Some(dt.timestamp());
    }
    // Netscape and RFC 850 spellings still common in the wild
    ["%a, %d-%b-%Y %H:%M:%S GMT", "%A, %d-%b-%y %H:%M:%S GMT", "%a, %d %b %Y %H:%M:%S GMT"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
        .map(|dt| dt.and_utc().timestamp())
}

fn domain_matches(host: &str, domain: &str) -> bool {
    if host == domain {
        return true;
    }
    host.parse::<IpAddr>().is_err()
        && host.len() > domain.len()
        && host.ends_with(domain)
        && host.as_bytes()[host.len() - domain.len() - 1] == b'.'
}

fn path_matches(request_path: &str, cookie_path: &str) -> bool {
    if request_path == cookie_path {
        return true;
    }
    request_path.starts_with(cookie_path)
        && (cookie_path.ends_with('/')
            || request_path.as_bytes().get(cookie_path.len()) == Some(&b'/'))
}

/// Directory of the request path, as used when a cookie has no Path attribute.
fn default_path(request_path: &str) -> String {
    if !request_path.starts_with('/') {
        return "/".to_string();
    }
    match request_path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => request_path[..idx].to_string(),
    }
}

/// https, or a loopback host, which browsers also treat as secure.
fn is_secure_context(url: &Url) -> bool {
    if matches!(url.scheme(), "https" | "wss") {
        return true;
    }
    match url.host() {
        Some(url::Host::Domain(d)) => d.eq_ignore_ascii_case("localhost"),
        Some(url::Host::Ipv4(ip)) => ip.is_loopback(),
        Some(url::Host::Ipv6(ip)) => ip.is_loopback(),
        None => false,
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CookieSnapshot {
    version: u32,
    cookies: Vec<Cookie>,
}

/// Cookie jar with write-through file persistence.
#[derive(Debug, Default)]
pub struct CookieStore {
    path: Option<PathBuf>,
    cookies: Vec<Cookie>,
}

impl CookieStore {
    /// A jar that never touches disk.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load the jar from `path`. A missing file yields an empty jar; a corrupt
    /// one is logged and replaced by an empty jar.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut cookies = match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<CookieSnapshot>(&content) {
                Ok(snapshot) => snapshot.cookies,
                Err(e) => {
                    tracing::warn!("Failed to parse {}, starting with an empty jar: {}", path.display(), e);
                    Vec::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                tracing::warn!("Failed to read {}, starting with an empty jar: {}", path.display(), e);
                Vec::new()
            }
        };
        let now = Utc::now();
        cookies.retain(|c| !c.is_expired(now));

        Self {
            path: Some(path),
            cookies,
        }
    }

    /// Parse and store one `Set-Cookie` value. Returns whether the jar changed.
    pub fn ingest(&mut self, set_cookie: &str, url: &Url, now: DateTime<Utc>) -> bool {
        match Cookie::parse(set_cookie, url, now) {
            Some(cookie) => self.insert(cookie, now),
            None => {
                tracing::debug!("Ignoring Set-Cookie for {}: {}", url, set_cookie);
                false
            }
        }
    }

    /// Insert or replace a cookie. An already-expired cookie deletes its match.
    pub fn insert(&mut self, cookie: Cookie, now: DateTime<Utc>) -> bool {
        let existing = self.cookies.iter().position(|c| c.same_identity(&cookie));

        if cookie.is_expired(now) {
            return match existing {
                Some(idx) => {
                    self.cookies.remove(idx);
                    true
                }
                None => false,
            };
        }

        match existing {
            Some(idx) if self.cookies[idx] == cookie => false,
            Some(idx) => {
                self.cookies[idx] = cookie;
                true
            }
            None => {
                self.cookies.push(cookie);
                true
            }
        }
    }

    /// Cookies to send to `url`, longest path first, then oldest first.
    pub fn matching(&self, url: &Url, now: DateTime<Utc>) -> Vec<&Cookie> {
        let mut found: Vec<&Cookie> = self.cookies.iter().filter(|c| c.matches(url, now)).collect();
        found.sort_by(|a, b| b.path.len().cmp(&a.path.len()));
        found
    }

    /// `Cookie` request header value for `url`; empty when nothing matches.
    pub fn header_for(&self, url: &Url, now: DateTime<Utc>) -> String {
        self.matching(url, now)
            .iter()
            .map(|c| format!("{}={}", c.name, c.value))
            .collect::<Vec<_>>()
            .join("; ")
    }

    pub fn purge_expired(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.cookies.len();
        self.cookies.retain(|c| !c.is_expired(now));
        before - self.cookies.len()
    }

    pub fn clear(&mut self) {
        self.cookies.clear();
    }

    pub fn cookies(&self) -> &[Cookie] {
        &self.cookies
    }

    pub fn len(&self) -> usize {
        self.cookies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }

    /// Write the jar to its snapshot file. No-op for in-memory jars.
    pub fn persist(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let snapshot = CookieSnapshot {
            version: SNAPSHOT_VERSION,
            cookies: self.cookies.clone(),
        };
        let content = serde_json::to_vec_pretty(&snapshot)?;
        write_atomic(path, &content).map_err(|e| {
            DevframeError::PersistenceFailure(format!("{}: {}", path.display(), e))
        })
    }
}
