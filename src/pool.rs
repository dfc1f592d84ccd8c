//! Pooled client for forwarding requests to upstream origins
//!
//! Connections to each upstream are kept alive and reused across requests.

use crate::encoder::{self, Encoding};
use flate2::Compression;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{self, HeaderMap, HeaderName, HeaderValue};
use hyper::{Request, Response, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Header name for forwarded-for
pub const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
pub const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
pub const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Smallest proxied body worth compressing on the fly
pub const MIN_COMPRESS_SIZE: usize = 1024;

/// Headers that describe one connection and never cross the proxy
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Client error: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),
    #[error("Request build error: {0}")]
    RequestBuild(String),
    #[error("Invalid upstream target: {0}")]
    InvalidTarget(String),
}

/// Statistics for the upstream pool
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Total number of requests forwarded
    pub total_requests: AtomicU64,
    /// Responses compressed on the fly
    pub compressed_responses: AtomicU64,
}

impl PoolStats {
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_compression(&self) {
        self.compressed_responses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn get_compressed_responses(&self) -> u64 {
        self.compressed_responses.load(Ordering::Relaxed)
    }
}

/// Configuration for the upstream pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections per host
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

/// Where a forwarded request came from, for the X-Forwarded-* headers
#[derive(Debug, Clone)]
pub struct Forwarded {
    pub client_ip: IpAddr,
    pub host: String,
    pub proto: String,
}

pub struct UpstreamPool {
    client: Client<HttpConnector, Incoming>,
    stats: Arc<PoolStats>,
    config: PoolConfig,
}

impl UpstreamPool {
    pub fn new(config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Upstream pool initialized"
        );

        Self {
            client,
            stats: Arc::new(PoolStats::default()),
            config,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn stats(&self) -> Arc<PoolStats> {
        Arc::clone(&self.stats)
    }

    /// Forward `req` to `target` (an origin such as `http://10.0.0.5:3000`).
    ///
    /// Method, path, query, body and end-to-end headers are kept. Host is
    /// rewritten to the target authority and X-Forwarded-* are set.
    pub async fn forward(
        &self,
        req: Request<Incoming>,
        target: &str,
        forwarded: &Forwarded,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, PoolError> {
        let target_uri: Uri = target
            .parse()
            .map_err(|_| PoolError::InvalidTarget(target.to_string()))?;
        let (scheme, authority) = match (target_uri.scheme_str(), target_uri.authority()) {
            (Some(scheme), Some(authority)) => (scheme, authority.as_str()),
            _ => return Err(PoolError::InvalidTarget(target.to_string())),
        };

        let path = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
        let uri = format!("{}://{}{}", scheme, authority, path);

        let (parts, body) = req.into_parts();
        let mut builder = Request::builder().method(parts.method).uri(&uri);

        let dropped = connection_scoped(&parts.headers);
        for (key, value) in parts.headers.iter() {
            if dropped.contains(key)
                || key == header::HOST
                || key.as_str() == X_FORWARDED_FOR
                || key.as_str() == X_FORWARDED_HOST
                || key.as_str() == X_FORWARDED_PROTO
            {
                continue;
            }
            builder = builder.header(key, value);
        }

        builder = builder
            .header(header::HOST, authority)
            .header(X_FORWARDED_FOR, forwarded.client_ip.to_string())
            .header(X_FORWARDED_HOST, forwarded.host.as_str())
            .header(X_FORWARDED_PROTO, forwarded.proto.as_str());

        let upstream_req = builder
            .body(body)
            .map_err(|e| PoolError::RequestBuild(e.to_string()))?;

        self.stats.record_request();
        debug!(uri = %uri, "Forwarding to upstream");

        let response = self.client.request(upstream_req).await?;

        let (mut parts, body) = response.into_parts();
        for name in connection_scoped(&parts.headers) {
            if name != header::TRANSFER_ENCODING {
                parts.headers.remove(&name);
            }
        }

        Ok(Response::from_parts(parts, body.boxed()))
    }

    /// Gzip a proxied response when the client accepts it and the body is
    /// uncompressed, compressible and at least [`MIN_COMPRESS_SIZE`] bytes
    pub async fn compress(
        &self,
        response: Response<BoxBody<Bytes, hyper::Error>>,
        accept_encoding: Option<&str>,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
        if !encoder::accepts(accept_encoding, Encoding::Gzip) || !is_compressible(response.headers()) {
            return Ok(response);
        }
        if content_length(response.headers()).is_some_and(|len| len < MIN_COMPRESS_SIZE) {
            return Ok(response);
        }

        let (mut parts, body) = response.into_parts();
        let bytes = body.collect().await?.to_bytes();
        // The body is complete now, so upstream chunked framing no longer applies
        parts.headers.remove(header::TRANSFER_ENCODING);
        if bytes.len() < MIN_COMPRESS_SIZE {
            return Ok(Response::from_parts(parts, full(bytes)));
        }

        let input = bytes.clone();
        let compressed =
            match tokio::task::spawn_blocking(move || encoder::gzip(&input, Compression::best())).await {
                Ok(Ok(compressed)) => compressed,
                _ => {
                    debug!("On-the-fly compression failed, sending identity");
                    return Ok(Response::from_parts(parts, full(bytes)));
                }
            };

        self.stats.record_compression();
        parts
            .headers
            .insert(header::CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        parts
            .headers
            .insert(header::CONTENT_LENGTH, HeaderValue::from(compressed.len()));
        parts
            .headers
            .append(header::VARY, HeaderValue::from_static("accept-encoding"));
        Ok(Response::from_parts(parts, full(compressed)))
    }
}

/// Box a complete body
pub fn full(data: impl Into<Bytes>) -> BoxBody<Bytes, hyper::Error> {
    Full::new(data.into()).map_err(|never| match never {}).boxed()
}

/// Hop-by-hop headers plus any named in Connection
fn connection_scoped(headers: &HeaderMap) -> Vec<HeaderName> {
    let mut names: Vec<HeaderName> = HOP_BY_HOP
        .iter()
        .map(|name| HeaderName::from_static(name))
        .collect();
    for value in headers.get_all(header::CONNECTION) {
        if let Ok(value) = value.to_str() {
            for token in value.split(',') {
                if let Ok(name) = HeaderName::from_bytes(token.trim().to_ascii_lowercase().as_bytes()) {
                    names.push(name);
                }
            }
        }
    }
    names
}

fn content_length(headers: &HeaderMap) -> Option<usize> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

fn is_compressible(headers: &HeaderMap) -> bool {
    if headers.contains_key(header::CONTENT_ENCODING) {
        return false;
    }
    let no_transform = headers
        .get(header::CACHE_CONTROL)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.to_ascii_lowercase().contains("no-transform"));
    if no_transform {
        return false;
    }

    let content_type = match headers.get(header::CONTENT_TYPE).and_then(|v| v.to_str().ok()) {
        Some(ct) => ct.split(';').next().unwrap_or("").trim().to_ascii_lowercase(),
        None => return false,
    };
    content_type.starts_with("text/")
        || content_type.ends_with("+json")
        || content_type.ends_with("+xml")
        || matches!(
            content_type.as_str(),
            "application/javascript" | "application/json" | "application/xml" | "image/svg+xml"
        )
}
