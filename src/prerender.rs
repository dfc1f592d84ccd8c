//! The render pipeline: host mapping, render, encode, cache, persist

use crate::cache::{RenderCache, RenderResult, Served};
use crate::encoder::{self, EncodedVariants};
use crate::engine::RenderEngine;
use crate::error::RenderError;
use crate::host_map::HostMapper;
use crate::persist::PersistenceWriter;
use hyper::Uri;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error};

/// A client-facing document URL split into origin and request target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageUrl {
    pub origin: String,
    pub path_and_query: String,
}

impl PageUrl {
    pub fn new(origin: impl Into<String>, path_and_query: impl Into<String>) -> Self {
        let path_and_query = path_and_query.into();
        Self {
            origin: origin.into(),
            path_and_query: if path_and_query.is_empty() {
                "/".to_string()
            } else {
                path_and_query
            },
        }
    }

    /// Parse an absolute URL; any fragment is dropped
    pub fn parse(url: &str) -> Option<Self> {
        let uri: Uri = url.parse().ok()?;
        let scheme = uri.scheme_str()?;
        let authority = uri.authority()?;
        let target = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
        Some(Self::new(format!("{}://{}", scheme, authority), target))
    }

    /// Cache key: the URL exactly as the client addressed it
    pub fn cache_key(&self) -> String {
        format!("{}{}", self.origin, self.path_and_query)
    }
}

pub struct Prerenderer {
    hosts: Arc<HostMapper>,
    engine: Arc<RenderEngine>,
    cache: Arc<RenderCache>,
    writer: Option<PersistenceWriter>,
    headless_query: String,
}

impl Prerenderer {
    pub fn new(
        hosts: Arc<HostMapper>,
        engine: Arc<RenderEngine>,
        cache: Arc<RenderCache>,
        writer: Option<PersistenceWriter>,
        headless_query: impl Into<String>,
    ) -> Self {
        Self {
            hosts,
            engine,
            cache,
            writer,
            headless_query: headless_query.into(),
        }
    }

    pub fn cache(&self) -> &Arc<RenderCache> {
        &self.cache
    }

    pub fn hosts(&self) -> &Arc<HostMapper> {
        &self.hosts
    }

    /// URL the browser loads: mapped target origin, same path and query,
    /// plus the headless marker so the origin can spot prerender traffic
    pub fn fetch_url_for(&self, page: &PageUrl) -> String {
        let target = self.hosts.target_for(&page.origin);
        let mut fetch = format!("{}{}", target, page.path_and_query);
        if !self.headless_query.is_empty() {
            let separator = if page.path_and_query.contains('?') { '&' } else { '?' };
            fetch.push(separator);
            fetch.push_str(&self.headless_query);
        }
        fetch
    }

    /// Cached variants for `page`, rendering them at most once per URL
    pub async fn prerender(&self, page: &PageUrl) -> Result<Served, RenderError> {
        let key = page.cache_key();
        let fetch_url = self.fetch_url_for(page);
        debug!(url = %key, fetch = %fetch_url, "Prerender request");

        let engine = Arc::clone(&self.engine);
        let fetch = fetch_url.clone();
        let render = async move {
            let start = Instant::now();
            let output = engine.render(&fetch).await?;
            let variants = encoder::encode_all(output.markup).await;
            Ok(RenderResult {
                variants,
                elapsed: start.elapsed(),
            })
        };

        let writer = self.writer.clone();
        let on_recorded = move |variants: Arc<EncodedVariants>| async move {
            if let Some(writer) = writer {
                if let Err(e) = writer.write(&fetch_url, &variants).await {
                    error!(url = %fetch_url, error = %e, "Unable to persist rendered page");
                }
            }
        };

        self.cache.get_or_render(&key, render, on_recorded).await
    }
}
