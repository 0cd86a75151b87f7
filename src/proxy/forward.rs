use std::convert::Infallible;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::{self, HeaderMap, HeaderName, HeaderValue};
use hyper::{Method, Request, Response, StatusCode, Version};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use url::Url;

use super::body::{self, BoxBody};
use super::inject::{self, Injection};
use super::tunnel;
use crate::error::{DevframeError, Result};
use crate::storage::StorageBridge;

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Everything a request handler needs, shared by all connections of a session.
pub(crate) struct ProxyContext {
    pub upstream_host: String,
    pub target_port: u16,
    pub public_origin: Option<String>,
    pub injection: Injection,
    /// Bundle served locally at `bundle_path` instead of asking the upstream
    pub bundle: Option<Bytes>,
    pub bundle_path: String,
    pub storage: Option<Arc<StorageBridge>>,
    pub tracker: TaskTracker,
    /// Fires on stop; ends tunnels at once
    pub shutdown: CancellationToken,
    /// Fires when the drain grace runs out
    pub force: CancellationToken,
}

impl ProxyContext {
    fn upstream_url(&self, path_and_query: &str) -> Result<Url> {
        let raw = format!("http://{}:{}{}", self.upstream_host, self.target_port, path_and_query);
        Url::parse(&raw).map_err(|e| DevframeError::InvalidUrl(format!("{}: {}", raw, e)))
    }

    fn upstream_authority(&self) -> String {
        format!("{}:{}", self.upstream_host, self.target_port)
    }
}

pub(crate) async fn handle(
    req: Request<Incoming>,
    ctx: Arc<ProxyContext>,
) -> std::result::Result<Response<BoxBody>, Infallible> {
    let method = req.method().clone();
    let uri = req.uri().clone();

    match forward(req, &ctx).await {
        Ok(resp) => {
            tracing::debug!("{} {} -> {}", method, uri, resp.status());
            Ok(resp)
        }
        Err(e) => {
            tracing::warn!("{} {} failed: {}", method, uri, e);
            Ok(error_page(&e))
        }
    }
}

async fn forward(mut req: Request<Incoming>, ctx: &ProxyContext) -> Result<Response<BoxBody>> {
    if let Some(bundle) = &ctx.bundle {
        if req.uri().path() == ctx.bundle_path && matches!(*req.method(), Method::GET | Method::HEAD) {
            return Ok(bundle_response(bundle.clone()));
        }
    }

    let upgrade = is_websocket_upgrade(req.headers());
    let client_upgrade = upgrade.then(|| hyper::upgrade::on(&mut req));

    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let request_path = req.uri().path().to_string();
    let target_url = ctx.upstream_url(&path_and_query)?;
    let embedder_host = req
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(String::from);
    let method = req.method().clone();

    let (mut parts, body) = req.into_parts();
    parts.uri = path_and_query
        .parse()
        .map_err(|e| DevframeError::InvalidUrl(format!("{}: {}", path_and_query, e)))?;
    parts.version = Version::HTTP_11;
    prepare_request_headers(&mut parts.headers, ctx, &target_url, upgrade)?;
    let upstream_req = Request::from_parts(parts, body);

    let stream = TcpStream::connect((ctx.upstream_host.as_str(), ctx.target_port))
        .await
        .map_err(|e| {
            DevframeError::UpstreamUnreachable(format!("{}: {}", ctx.upstream_authority(), e))
        })?;
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .map_err(|e| DevframeError::UpstreamUnreachable(e.to_string()))?;

    let force = ctx.force.clone();
    ctx.tracker.spawn(async move {
        tokio::select! {
            result = conn.with_upgrades() => {
                if let Err(e) = result {
                    tracing::debug!("Upstream connection ended: {}", e);
                }
            }
            _ = force.cancelled() => {}
        }
    });

    let mut resp = sender
        .send_request(upstream_req)
        .await
        .map_err(|e| DevframeError::UpstreamUnreachable(e.to_string()))?;

    if let Some(storage) = &ctx.storage {
        let set_cookies: Vec<String> = resp
            .headers()
            .get_all(header::SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok().map(String::from))
            .collect();
        if !set_cookies.is_empty() {
            // Persisting syncs the jar to disk; finish before the page can reuse it
            let storage = Arc::clone(storage);
            let url = target_url.clone();
            let ingested = tokio::task::spawn_blocking(move || {
                for value in &set_cookies {
                    storage.ingest(value, &url);
                }
            })
            .await;
            if let Err(e) = ingested {
                tracing::warn!("Storing cookies from {} failed: {}", target_url, e);
            }
        }
    }

    if let Some(client_upgrade) = client_upgrade {
        if resp.status() == StatusCode::SWITCHING_PROTOCOLS {
            let upstream_upgrade = hyper::upgrade::on(&mut resp);
            tunnel::spawn(
                &ctx.tracker,
                ctx.shutdown.clone(),
                client_upgrade,
                upstream_upgrade,
                request_path,
            );
            let (parts, _) = resp.into_parts();
            return Ok(Response::from_parts(parts, body::empty()));
        }
        return Ok(resp.map(body::boxed));
    }

    if !should_rewrite(&method, resp.status(), resp.headers()) {
        strip_hop_by_hop(resp.headers_mut(), false);
        return Ok(resp.map(body::boxed));
    }

    let (mut parts, incoming) = resp.into_parts();
    let raw = incoming
        .collect()
        .await
        .map_err(|e| DevframeError::UpstreamUnreachable(format!("reading body: {}", e)))?
        .to_bytes();
    strip_hop_by_hop(&mut parts.headers, false);

    let encoding = parts
        .headers
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok());
    let Some(decoded) = body::decode(encoding, &raw) else {
        parts.headers.insert(header::CONTENT_LENGTH, HeaderValue::from(raw.len()));
        return Ok(Response::from_parts(parts, body::full(raw)));
    };

    let origin = match (&ctx.public_origin, &embedder_host) {
        (Some(origin), _) => origin.trim_end_matches('/').to_string(),
        (None, Some(host)) => format!("http://{}", host),
        (None, None) => format!("http://{}", ctx.upstream_authority()),
    };
    let base_href = format!("{}{}", origin, inject::directory_of(&request_path));

    let rewritten = ctx.injection.apply(&decoded, &base_href);

    parts.headers.remove(header::CONTENT_ENCODING);
    parts.headers.insert(header::CONTENT_LENGTH, HeaderValue::from(rewritten.len()));
    Ok(Response::from_parts(parts, body::full(rewritten)))
}

fn prepare_request_headers(
    headers: &mut HeaderMap,
    ctx: &ProxyContext,
    target_url: &Url,
    upgrade: bool,
) -> Result<()> {
    strip_hop_by_hop(headers, upgrade);

    let authority = HeaderValue::from_str(&ctx.upstream_authority())
        .map_err(|e| DevframeError::InvalidUrl(e.to_string()))?;
    headers.insert(header::HOST, authority);
    headers.insert(header::ACCEPT_ENCODING, HeaderValue::from_static("gzip, deflate"));

    if let Some(storage) = &ctx.storage {
        if !headers.contains_key(header::COOKIE) {
            let jar = storage.cookies_for(target_url);
            if !jar.is_empty() {
                if let Ok(value) = HeaderValue::from_str(&jar) {
                    headers.insert(header::COOKIE, value);
                }
            }
        }
    }

    Ok(())
}

/// Remove hop-by-hop headers, including any listed in `Connection`.
/// An upgrade request keeps `Connection` and `Upgrade` so the handshake
/// reaches the upstream.
fn strip_hop_by_hop(headers: &mut HeaderMap, keep_upgrade: bool) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        if keep_upgrade && name == header::UPGRADE {
            continue;
        }
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        if keep_upgrade && (*name == "connection" || *name == "upgrade") {
            continue;
        }
        headers.remove(*name);
    }
}

fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    let connection_upgrade = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
    let websocket = headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
    connection_upgrade && websocket
}

fn should_rewrite(method: &Method, status: StatusCode, headers: &HeaderMap) -> bool {
    if method == Method::HEAD || !(status.is_success() || status.is_redirection()) {
        return false;
    }
    if status == StatusCode::NO_CONTENT || status == StatusCode::NOT_MODIFIED {
        return false;
    }
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.to_ascii_lowercase().contains("text/html"))
}

fn bundle_response(bundle: Bytes) -> Response<BoxBody> {
    let mut resp = Response::new(body::full(bundle));
    let headers = resp.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/javascript; charset=utf-8"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    resp
}

/// Minimal page shown in the frame when the target cannot be reached.
pub(crate) fn error_page(err: &DevframeError) -> Response<BoxBody> {
    let html = format!(
        "<!DOCTYPE html><html><head><title>Devframe: upstream error</title></head>\
         <body style=\"font-family:sans-serif;padding:2em\"><h1>Bad Gateway</h1><p>{}</p></body></html>",
        inject::escape_attr(&err.to_string())
    );
    let mut resp = Response::new(body::full(html));
    *resp.status_mut() = StatusCode::BAD_GATEWAY;
    resp.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/html; charset=utf-8"),
    );
    resp
}
