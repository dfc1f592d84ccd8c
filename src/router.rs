//! Per-request dispatch: render a document or forward to the upstream.

use crate::cache::Served;
use crate::encoder::{self, Encoding};
use crate::error::{error_response, GateErrorCode};
use crate::pool::{full, Forwarded, UpstreamPool, X_FORWARDED_HOST, X_FORWARDED_PROTO};
use crate::prerender::{PageUrl, Prerenderer};
use http_body_util::combinators::BoxBody;
use hyper::body::{Bytes, Incoming};
use hyper::header::{self, HeaderMap, HeaderValue};
use hyper::{Method, Request, Response, StatusCode, Uri};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Path suffixes served straight from the upstream
const ASSET_SUFFIXES: &[&str] = &[
    ".js", ".js.map", ".map", ".css", ".jpg", ".jpeg", ".png", ".gif", ".svg", ".webp", ".ico",
    ".txt", ".xml", ".woff", ".woff2", ".ttf",
];

/// Maximum host length per DNS specification, plus room for a port
const MAX_HOST_LEN: usize = 253 + 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Render,
    Forward,
}

pub fn is_asset(path: &str) -> bool {
    ASSET_SUFFIXES.iter().any(|suffix| path.ends_with(suffix))
}

/// Only GET and HEAD on non-asset paths are rendered
pub fn classify(method: &Method, path: &str) -> Route {
    if (method == Method::GET || method == Method::HEAD) && !is_asset(path) {
        Route::Render
    } else {
        Route::Forward
    }
}

/// Scheme and host the client used to reach us
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundOrigin {
    pub scheme: String,
    pub host: String,
}

impl InboundOrigin {
    pub fn origin(&self) -> String {
        format!("{}://{}", self.scheme, self.host)
    }
}

/// Work out the public origin of a request.
///
/// With `trust_proxy`, X-Forwarded-Proto and X-Forwarded-Host win over the
/// listener scheme and the Host header. HTTP/2 requests may carry the host
/// only in the URI authority.
pub fn derive_origin(
    headers: &HeaderMap,
    uri: &Uri,
    is_tls: bool,
    trust_proxy: bool,
) -> Option<InboundOrigin> {
    let forwarded = |name: &str| -> Option<String> {
        if !trust_proxy {
            return None;
        }
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    };

    let scheme = forwarded(X_FORWARDED_PROTO)
        .map(|s| s.to_ascii_lowercase())
        .filter(|s| s == "http" || s == "https")
        .unwrap_or_else(|| if is_tls { "https" } else { "http" }.to_string());

    let host = forwarded(X_FORWARDED_HOST)
        .or_else(|| {
            headers
                .get(header::HOST)
                .and_then(|h| h.to_str().ok())
                .map(String::from)
        })
        .or_else(|| uri.authority().map(|a| a.as_str().to_string()))?;

    if !valid_host(&host) {
        return None;
    }

    Some(InboundOrigin { scheme, host })
}

/// Hostnames, IPv4/IPv6 literals and an optional port; nothing that could
/// smuggle a path or break a log line
fn valid_host(host: &str) -> bool {
    !host.is_empty()
        && host.len() <= MAX_HOST_LEN
        && host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | ':' | '[' | ']'))
}

#[derive(Debug, Clone)]
pub struct RouterOptions {
    pub trust_proxy: bool,
    pub compression: bool,
    pub proxy_timeout: Duration,
}

impl Default for RouterOptions {
    fn default() -> Self {
        Self {
            trust_proxy: false,
            compression: false,
            proxy_timeout: Duration::from_secs(30),
        }
    }
}

pub struct RequestRouter {
    prerenderer: Arc<Prerenderer>,
    upstream: Arc<UpstreamPool>,
    options: RouterOptions,
}

impl RequestRouter {
    pub fn new(prerenderer: Arc<Prerenderer>, upstream: Arc<UpstreamPool>, options: RouterOptions) -> Self {
        Self {
            prerenderer,
            upstream,
            options,
        }
    }

    pub async fn handle(
        &self,
        req: Request<Incoming>,
        client_addr: SocketAddr,
        is_tls: bool,
    ) -> Response<BoxBody<Bytes, hyper::Error>> {
        let inbound = match derive_origin(req.headers(), req.uri(), is_tls, self.options.trust_proxy) {
            Some(inbound) => inbound,
            None => {
                return error_response(GateErrorCode::MissingHost, "Missing or invalid Host header");
            }
        };

        let route = classify(req.method(), req.uri().path());
        debug!(
            origin = %inbound.origin(),
            method = %req.method(),
            uri = %req.uri(),
            ?route,
            "Incoming request"
        );

        match route {
            Route::Render => self.render(req, &inbound).await,
            Route::Forward => self.forward(req, &inbound, client_addr).await,
        }
    }

    async fn render(
        &self,
        req: Request<Incoming>,
        inbound: &InboundOrigin,
    ) -> Response<BoxBody<Bytes, hyper::Error>> {
        let accept = req
            .headers()
            .get(header::ACCEPT_ENCODING)
            .and_then(|v| v.to_str().ok());
        let encoding = encoder::negotiate(accept);
        debug!(?accept, encoding = encoding.as_header_value(), "Negotiated response encoding");

        let target = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
        let page = PageUrl::new(inbound.origin(), target);

        match self.prerenderer.prerender(&page).await {
            Ok(served) => render_response(&served, encoding, req.method() == Method::HEAD),
            Err(e) => {
                error!(url = %page.cache_key(), error = %e, "Render error");
                error_response(GateErrorCode::RenderFailed, "error with rendering")
            }
        }
    }

    async fn forward(
        &self,
        req: Request<Incoming>,
        inbound: &InboundOrigin,
        client_addr: SocketAddr,
    ) -> Response<BoxBody<Bytes, hyper::Error>> {
        let origin = inbound.origin();
        let target = self.prerenderer.hosts().target_for(&origin).to_string();
        let accept = req
            .headers()
            .get(header::ACCEPT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        let forwarded = Forwarded {
            client_ip: client_addr.ip(),
            host: inbound.host.clone(),
            proto: inbound.scheme.clone(),
        };

        debug!(from = %origin, to = %target, "Proxying request");
        let timeout = self.options.proxy_timeout;
        let result = tokio::time::timeout(timeout, self.upstream.forward(req, &target, &forwarded)).await;

        match result {
            Ok(Ok(response)) if self.options.compression => {
                match self.upstream.compress(response, accept.as_deref()).await {
                    Ok(response) => response,
                    Err(e) => {
                        warn!(target = %target, error = %e, "Upstream body failed");
                        error_response(GateErrorCode::UpstreamFailed, "Failed to read upstream response")
                    }
                }
            }
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                warn!(from = %origin, target = %target, error = %e, "Failed to forward request");
                error_response(GateErrorCode::UpstreamFailed, "Failed to connect to upstream")
            }
            Err(_) => {
                warn!(target = %target, timeout_secs = timeout.as_secs(), "Upstream timed out");
                error_response(
                    GateErrorCode::UpstreamTimeout,
                    format!("Upstream timed out after {} seconds", timeout.as_secs()),
                )
            }
        }
    }
}

/// 200 response for a rendered document in the negotiated encoding.
///
/// A variant that failed to encode falls back to identity.
pub fn render_response(
    served: &Served,
    encoding: Encoding,
    head_only: bool,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let (encoding, bytes) = match served.variants.get(encoding) {
        Some(bytes) => (encoding, bytes.clone()),
        None => (Encoding::Identity, served.variants.identity.clone()),
    };

    let timing = format!(
        "Prerender;dur={};desc=\"Headless render time (ms)\"",
        served.render_time.as_millis()
    );
    let length = bytes.len();
    let body = if head_only { Bytes::new() } else { bytes };

    let mut response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/html")
        .header(header::CONTENT_ENCODING, encoding.as_header_value())
        .header(header::CONTENT_LENGTH, length)
        .header(header::VARY, "Accept-Encoding")
        .body(full(body))
        .expect("valid response builder");

    if let Ok(value) = HeaderValue::from_str(&timing) {
        response.headers_mut().insert("server-timing", value);
    }
    response
}
