//! Render engine: one shared browser session, one fresh page per render.
//!
//! The browser itself sits behind [`BrowserSession`] / [`RenderPage`] so the
//! pipeline does not depend on how the browser is driven. The production
//! session is [`crate::chrome::ChromeSession`].

use crate::error::RenderError;
use crate::policy::ResourcePolicy;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// A long-lived connection to a rendering engine, shared by every render
#[async_trait]
pub trait BrowserSession: Send + Sync + 'static {
    /// Open an isolated page whose sub-resource loads are gated by `policy`
    async fn open_page(&self, policy: Arc<ResourcePolicy>) -> Result<Box<dyn RenderPage>, RenderError>;

    /// Tear the session down at process shutdown
    async fn shutdown(&self) {}
}

/// One isolated rendering context, owned by a single render job
#[async_trait]
pub trait RenderPage: Send {
    /// Navigate and wait for the main document to load
    async fn navigate(&mut self, url: &str) -> Result<(), RenderError>;

    /// Wait until no request has been in flight for `quiet`
    async fn wait_for_network_idle(&mut self, quiet: Duration) -> Result<(), RenderError>;

    /// Serialized markup of the current DOM
    async fn content(&mut self) -> Result<String, RenderError>;

    /// Abort anything pending and release the page
    async fn close(self: Box<Self>);
}

/// Markup produced by one successful render
#[derive(Debug, Clone)]
pub struct RenderOutput {
    pub markup: String,
    pub elapsed: Duration,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Budget for the whole render: open, navigate, network-idle wait, extract
    pub timeout: Duration,
    /// Quiet period that counts as network idle
    pub idle_window: Duration,
    /// Renders allowed in parallel on the shared session
    pub max_concurrent: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(5000),
            idle_window: Duration::from_millis(500),
            max_concurrent: 4,
        }
    }
}

pub struct RenderEngine {
    session: Arc<dyn BrowserSession>,
    policy: Arc<ResourcePolicy>,
    config: EngineConfig,
    permits: Semaphore,
}

impl RenderEngine {
    pub fn new(session: Arc<dyn BrowserSession>, policy: ResourcePolicy, config: EngineConfig) -> Self {
        let permits = Semaphore::new(config.max_concurrent.max(1));
        Self {
            session,
            policy: Arc::new(policy),
            config,
            permits,
        }
    }

    /// Render `fetch_url` in a fresh page and return its serialized markup.
    ///
    /// The page is closed on every path, including timeouts.
    pub async fn render(&self, fetch_url: &str) -> Result<RenderOutput, RenderError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| RenderError::SessionUnavailable("render limiter closed".to_string()))?;

        let start = Instant::now();
        debug!(url = %fetch_url, "Opening render page");

        let timeout = self.config.timeout;
        let idle_window = self.config.idle_window;
        let mut opened: Option<Box<dyn RenderPage>> = None;
        let finished = tokio::time::timeout(timeout, async {
            let page = opened.insert(self.session.open_page(Arc::clone(&self.policy)).await?);
            page.navigate(fetch_url).await?;
            page.wait_for_network_idle(idle_window).await?;
            page.content().await
        })
        .await;

        let result = finished.unwrap_or_else(|_| {
            Err(RenderError::navigation(
                fetch_url,
                format!("render did not finish within {}ms", timeout.as_millis()),
            ))
        });

        if let Some(page) = opened.take() {
            page.close().await;
        }

        match result {
            Ok(markup) => {
                let elapsed = start.elapsed();
                info!(url = %fetch_url, elapsed_ms = elapsed.as_millis() as u64, "Headless render complete");
                Ok(RenderOutput { markup, elapsed })
            }
            Err(e) => {
                warn!(url = %fetch_url, error = %e, "Headless render failed");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted in-memory browser used by unit tests

    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone)]
    pub enum Script {
        Markup(String),
        Hang,
        /// Loads, then never returns its markup
        HangOnContent,
        Fail(String),
    }

    #[derive(Default)]
    pub struct FakeSession {
        pub scripts: Mutex<HashMap<String, Script>>,
        pub navigations: Mutex<Vec<String>>,
        pub open_pages: AtomicUsize,
        pub closed_pages: AtomicUsize,
    }

    impl FakeSession {
        pub fn with_page(self, url: &str, script: Script) -> Self {
            self.scripts.lock().insert(url.to_string(), script);
            self
        }

        pub fn navigation_count(&self) -> usize {
            self.navigations.lock().len()
        }
    }

    pub struct FakePage {
        session: Arc<FakeSession>,
        script: Option<Script>,
    }

    pub struct SharedFake(pub Arc<FakeSession>);

    #[async_trait]
    impl BrowserSession for SharedFake {
        async fn open_page(&self, _policy: Arc<ResourcePolicy>) -> Result<Box<dyn RenderPage>, RenderError> {
            self.0.open_pages.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakePage {
                session: Arc::clone(&self.0),
                script: None,
            }))
        }
    }

    #[async_trait]
    impl RenderPage for FakePage {
        async fn navigate(&mut self, url: &str) -> Result<(), RenderError> {
            self.session.navigations.lock().push(url.to_string());
            let script = self
                .session
                .scripts
                .lock()
                .get(url)
                .cloned()
                .unwrap_or(Script::Markup(format!("<html><body>{}</body></html>", url)));
            match &script {
                Script::Fail(reason) => return Err(RenderError::navigation(url, reason)),
                Script::Hang => futures::future::pending::<()>().await,
                Script::Markup(_) | Script::HangOnContent => {}
            }
            self.script = Some(script);
            Ok(())
        }

        async fn wait_for_network_idle(&mut self, _quiet: Duration) -> Result<(), RenderError> {
            Ok(())
        }

        async fn content(&mut self) -> Result<String, RenderError> {
            match &self.script {
                Some(Script::Markup(markup)) => Ok(markup.clone()),
                Some(Script::HangOnContent) => futures::future::pending().await,
                _ => Err(RenderError::Extraction {
                    url: String::new(),
                    reason: "no document".to_string(),
                }),
            }
        }

        async fn close(self: Box<Self>) {
            self.session.closed_pages.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn engine(fake: &Arc<FakeSession>, timeout: Duration) -> RenderEngine {
        RenderEngine::new(
            Arc::new(SharedFake(Arc::clone(fake))),
            ResourcePolicy::default(),
            EngineConfig {
                timeout,
                ..EngineConfig::default()
            },
        )
    }
}
