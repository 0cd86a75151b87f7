//! HTML rewrite that adds the toolbar bundle to every proxied document.
//!
//! Every fragment carries a `data-devframe` marker so a document that
//! already went through the rewrite (a cached page, a second hop) is
//! stripped first and ends up with exactly one copy of each.
//!
//! The rewrite works on raw bytes: every pattern is ASCII, so pages in any
//! ASCII-compatible charset pass through untouched apart from the inserts.

use std::sync::LazyLock;

use regex::bytes::Regex;

static INJECTED_BASE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i-u)<base\b[^>]*\bdata-devframe\b[^>]*>").unwrap());

static INJECTED_SCRIPT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is-u)<script\b[^>]*\bdata-devframe\b[^>]*>.*?</script\s*>").unwrap()
});

/// The empty mount element a previous rewrite inserted.
static INJECTED_MOUNT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i-u)<div\b[^>]*\bdata-devframe\s*=\s*["']mount["'][^>]*>\s*</div\s*>"#).unwrap()
});

static HEAD_OPEN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i-u)<head(?:\s[^>]*)?>").unwrap());
static HEAD_CLOSE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i-u)</head\s*>").unwrap());
static BODY_OPEN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i-u)<body(?:\s[^>]*)?>").unwrap());
static BODY_CLOSE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i-u)</body\s*>").unwrap());
static HTML_CLOSE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i-u)</html\s*>").unwrap());

/// Leading doctype and `<html>` open tag, possibly empty.
static PROLOGUE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is-u)^\s*(?:<!doctype[^>]*>\s*)?(?:<html(?:\s[^>]*)?>)?").unwrap()
});

#[derive(Debug, Clone)]
pub struct Injection {
    mount_id: String,
    script_src: String,
    relay_url: Option<String>,
    relay_token: Option<String>,
    /// Page element that already claims the mount id; group 1 is the tag up
    /// to the attribute
    claimed_id: Regex,
}

impl Injection {
    pub fn new(mount_id: impl Into<String>, script_src: impl Into<String>) -> Self {
        let mount_id = mount_id.into();
        let id = regex::escape(&mount_id);
        let claimed_id = Regex::new(&format!(
            r#"(?i-u)(<[a-z][a-z0-9-]*(?:\s[^>]*?)?)\sid\s*=\s*(?:"{id}"|'{id}'|{id}(?:\s|/?>))"#
        ))
        .expect("escaped mount id always forms a valid pattern");

        Self {
            mount_id,
            script_src: script_src.into(),
            relay_url: None,
            relay_token: None,
            claimed_id,
        }
    }

    /// Tell the injected script where the relay lives and how to authenticate.
    pub fn with_relay(mut self, url: impl Into<String>, token: impl Into<String>) -> Self {
        self.relay_url = Some(url.into());
        self.relay_token = Some(token.into());
        self
    }

    fn base_tag(&self, base_href: &str) -> String {
        format!(r#"<base href="{}" data-devframe>"#, escape_attr(base_href))
    }

    fn mount_tag(&self) -> String {
        format!(
            r#"<div id="{}" data-devframe="mount"></div>"#,
            escape_attr(&self.mount_id)
        )
    }

    fn script_tag(&self) -> String {
        let mut tag = format!(
            r#"<script src="{}" data-devframe="script""#,
            escape_attr(&self.script_src)
        );
        if let Some(url) = &self.relay_url {
            tag.push_str(&format!(r#" data-relay="{}""#, escape_attr(url)));
        }
        if let Some(token) = &self.relay_token {
            tag.push_str(&format!(r#" data-token="{}""#, escape_attr(token)));
        }
        tag.push_str("></script>");
        tag
    }

    /// Strip earlier injections, then add the base, mount and script.
    ///
    /// Never fails: documents without `<head>`/`<body>` get the fragments
    /// after their prologue, and documents without `</body>` get the script
    /// before `</html>` or at the very end. A page element already using the
    /// mount id keeps its content and loses only the id.
    pub fn apply(&self, html: &[u8], base_href: &str) -> Vec<u8> {
        let html = INJECTED_SCRIPT.replace_all(html, &b""[..]);
        let html = INJECTED_BASE.replace_all(&html, &b""[..]);
        let html = INJECTED_MOUNT.replace_all(&html, &b""[..]);
        let mut html = self.release_mount_id(&html);

        let mut prologue_fragments = Vec::new();

        let base = self.base_tag(base_href);
        match HEAD_OPEN.find(&html).map(|m| m.end()) {
            Some(at) => insert(&mut html, at, base.as_bytes()),
            None => prologue_fragments.extend_from_slice(base.as_bytes()),
        }

        let mount = self.mount_tag();
        if let Some(at) = BODY_OPEN.find(&html).map(|m| m.end()) {
            insert(&mut html, at, mount.as_bytes());
        } else if let Some(at) = HEAD_CLOSE.find(&html).map(|m| m.end()) {
            insert(&mut html, at, mount.as_bytes());
        } else {
            prologue_fragments.extend_from_slice(mount.as_bytes());
        }

        if !prologue_fragments.is_empty() {
            let at = PROLOGUE.find(&html).map(|m| m.end()).unwrap_or(0);
            insert(&mut html, at, &prologue_fragments);
        }

        let script = self.script_tag();
        let close = BODY_CLOSE
            .find_iter(&html)
            .last()
            .or_else(|| HTML_CLOSE.find_iter(&html).last())
            .map(|m| m.start());
        match close {
            Some(at) => insert(&mut html, at, script.as_bytes()),
            None => html.extend_from_slice(script.as_bytes()),
        }

        html
    }

    /// Drop the mount id from page elements that use it, keeping the
    /// elements themselves so the markup stays balanced.
    fn release_mount_id(&self, html: &[u8]) -> Vec<u8> {
        self.claimed_id
            .replace_all(html, |caps: &regex::bytes::Captures| {
                let whole = &caps[0];
                let mut out = caps[1].to_vec();
                // An unquoted id swallowed the tag end
                if whole.ends_with(b"/>") {
                    out.extend_from_slice(b"/>");
                } else if whole.ends_with(b">") {
                    out.push(b'>');
                } else if let Some(&last) = whole.last().filter(|b| b.is_ascii_whitespace()) {
                    out.push(last);
                }
                out
            })
            .into_owned()
    }
}

fn insert(html: &mut Vec<u8>, at: usize, fragment: &[u8]) {
    html.splice(at..at, fragment.iter().copied());
}

/// Escape a value for use inside a double-quoted HTML attribute.
pub fn escape_attr(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
    out
}

/// Directory part of a request path, used as the document's base.
pub fn directory_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[..=idx],
        None => "/",
    }
}
