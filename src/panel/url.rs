use std::net::IpAddr;

use url::{Host, Url};

use crate::error::{DevframeError, Result};

/// Turn what the user typed into an absolute http(s) URL.
///
/// Relative references (`/x`, `./x`, `?q`, `#h`) resolve against `current`.
/// Bare hosts get `http://` when they look local and `https://` otherwise.
pub fn normalize(raw: &str, current: Option<&Url>) -> Result<Url> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(DevframeError::InvalidUrl("empty URL".to_string()));
    }

    let lower = raw.to_ascii_lowercase();
    let candidate = if lower.starts_with("http://") || lower.starts_with("https://") {
        raw.to_string()
    } else if is_relative(raw) {
        let base = current.ok_or_else(|| {
            DevframeError::InvalidUrl(format!("{}: relative URL without a current page", raw))
        })?;
        return base
            .join(raw)
            .map_err(|e| DevframeError::InvalidUrl(format!("{}: {}", raw, e)));
    } else if lower.contains("localhost") || lower.contains("127.0.0.1") || lower.starts_with("[::1]") {
        format!("http://{}", raw)
    } else {
        format!("https://{}", raw)
    };

    let url = Url::parse(&candidate)
        .map_err(|e| DevframeError::InvalidUrl(format!("{}: {}", raw, e)))?;
    if url.host_str().is_none() {
        return Err(DevframeError::InvalidUrl(format!("{}: missing host", raw)));
    }
    Ok(url)
}

fn is_relative(raw: &str) -> bool {
    raw.starts_with('/')
        || raw.starts_with("./")
        || raw.starts_with("../")
        || raw.starts_with('?')
        || raw.starts_with('#')
}

/// Whether the URL points at this machine.
pub fn is_loopback(url: &Url) -> bool {
    match url.host() {
        Some(Host::Domain(domain)) => {
            let domain = domain.to_ascii_lowercase();
            domain == "localhost" || domain.ends_with(".localhost")
        }
        Some(Host::Ipv4(ip)) => IpAddr::V4(ip).is_loopback(),
        Some(Host::Ipv6(ip)) => IpAddr::V6(ip).is_loopback(),
        None => false,
    }
}

/// Port of the target application behind a loopback URL.
pub fn target_port(url: &Url) -> u16 {
    url.port_or_known_default().unwrap_or(80)
}

/// Path, query and fragment of `url`, for replaying it on another origin.
pub fn path_and_query(url: &Url) -> String {
    let mut out = url.path().to_string();
    if let Some(query) = url.query() {
        out.push('?');
        out.push_str(query);
    }
    if let Some(fragment) = url.fragment() {
        out.push('#');
        out.push_str(fragment);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_local_hosts_get_http() {
        assert_eq!(normalize("localhost:3000", None).unwrap().as_str(), "http://localhost:3000/");
        assert_eq!(
            normalize("127.0.0.1:5173/app", None).unwrap().as_str(),
            "http://127.0.0.1:5173/app"
        );
    }

    #[test]
    fn bare_remote_hosts_get_https() {
        assert_eq!(normalize("example.com", None).unwrap().as_str(), "https://example.com/");
        assert_eq!(
            normalize("  docs.rs/tokio ", None).unwrap().as_str(),
            "https://docs.rs/tokio"
        );
    }

    #[test]
    fn explicit_scheme_is_kept() {
        assert_eq!(
            normalize("HTTP://Example.com/a", None).unwrap().as_str(),
            "http://example.com/a"
        );
    }

    #[test]
    fn relative_references_resolve_against_current() {
        let current = Url::parse("http://localhost:3000/app/page").unwrap();
        assert_eq!(
            normalize("/about", Some(&current)).unwrap().as_str(),
            "http://localhost:3000/about"
        );
        assert_eq!(
            normalize("./next", Some(&current)).unwrap().as_str(),
            "http://localhost:3000/app/next"
        );
        assert_eq!(
            normalize("?q=1", Some(&current)).unwrap().as_str(),
            "http://localhost:3000/app/page?q=1"
        );
        assert!(normalize("/about", None).is_err());
    }

    #[test]
    fn rejects_empty_input() {
        assert!(normalize("   ", None).is_err());
    }

    #[test]
    fn loopback_detection_and_ports() {
        let local = Url::parse("http://localhost:4000/").unwrap();
        assert!(is_loopback(&local));
        assert_eq!(target_port(&local), 4000);

        assert!(is_loopback(&Url::parse("http://127.0.0.2/").unwrap()));
        assert!(is_loopback(&Url::parse("http://[::1]:81/").unwrap()));
        assert!(is_loopback(&Url::parse("http://app.localhost/").unwrap()));
        assert!(!is_loopback(&Url::parse("https://localhost.example.com/").unwrap()));
        assert_eq!(target_port(&Url::parse("http://localhost/").unwrap()), 80);
        assert_eq!(target_port(&Url::parse("https://localhost/").unwrap()), 443);
    }

    #[test]
    fn path_and_query_keeps_everything_after_origin() {
        let url = Url::parse("http://localhost:3000/a/b?x=1#top").unwrap();
        assert_eq!(path_and_query(&url), "/a/b?x=1#top");
    }
}
