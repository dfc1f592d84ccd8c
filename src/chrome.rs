//! Chrome DevTools Protocol session backing the render engine

use crate::config::RenderConfig;
use crate::engine::{BrowserSession, RenderPage};
use crate::error::RenderError;
use crate::policy::{Decision, ResourcePolicy};
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::fetch::{
    ContinueRequestParams, EnableParams, EventRequestPaused, FailRequestParams, RequestPattern,
    RequestStage,
};
use chromiumoxide::cdp::browser_protocol::network::{
    ErrorReason, EventLoadingFailed, EventLoadingFinished, EventRequestWillBeSent,
};
use chromiumoxide::Page;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Polling interval while waiting for the network to go quiet
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// The process-wide browser. A crashed browser is not restarted.
pub struct ChromeSession {
    browser: AsyncMutex<Browser>,
    alive: Arc<AtomicBool>,
    handler_task: JoinHandle<()>,
}

impl ChromeSession {
    /// Launch the browser; failing here must abort startup
    pub async fn launch(config: &RenderConfig) -> anyhow::Result<Self> {
        let mut builder = BrowserConfig::builder().arg("--no-proxy-server");
        if !config.headless {
            builder = builder.with_head();
        }
        if let Some(path) = &config.chrome_executable {
            builder = builder.chrome_executable(path);
        }
        let browser_config = builder
            .build()
            .map_err(|e| anyhow::anyhow!("Invalid browser configuration: {}", e))?;

        debug!(headless = config.headless, "Spawning browser");
        let (browser, mut handler) = Browser::launch(browser_config)
            .await
            .map_err(|e| anyhow::anyhow!("Unable to launch browser: {}", e))?;

        let alive = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&alive);
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!(error = %e, "Browser handler error");
                }
            }
            flag.store(false, Ordering::SeqCst);
            error!("Browser connection closed, renders will fail until restart");
        });

        info!("Browser session created");
        Ok(Self {
            browser: AsyncMutex::new(browser),
            alive,
            handler_task,
        })
    }
}

#[async_trait]
impl BrowserSession for ChromeSession {
    async fn open_page(&self, policy: Arc<ResourcePolicy>) -> Result<Box<dyn RenderPage>, RenderError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(RenderError::SessionUnavailable("browser connection closed".to_string()));
        }

        let page = self
            .browser
            .lock()
            .await
            .new_page("about:blank")
            .await
            .map_err(session_error)?;

        match ChromePage::attach(page.clone(), policy).await {
            Ok(chrome_page) => Ok(Box::new(chrome_page)),
            Err(e) => {
                let _ = page.close().await;
                Err(e)
            }
        }
    }

    async fn shutdown(&self) {
        let mut browser = self.browser.lock().await;
        if let Err(e) = browser.close().await {
            debug!(error = %e, "Browser close failed");
        }
        self.handler_task.abort();
        info!("Browser session closed");
    }
}

fn session_error(e: chromiumoxide::error::CdpError) -> RenderError {
    RenderError::SessionUnavailable(e.to_string())
}

/// In-flight request bookkeeping for the network-idle wait
#[derive(Debug)]
struct NetworkActivity {
    in_flight: HashSet<String>,
    last_change: Instant,
}

impl NetworkActivity {
    fn new(now: Instant) -> Self {
        Self {
            in_flight: HashSet::new(),
            last_change: now,
        }
    }

    fn started(&mut self, id: String, now: Instant) {
        self.in_flight.insert(id);
        self.last_change = now;
    }

    /// Unknown ids (requests seen before tracking began) change nothing
    fn ended(&mut self, id: &str, now: Instant) {
        if self.in_flight.remove(id) {
            self.last_change = now;
        }
    }

    /// The quiet window never starts before the wait does
    fn begin_wait(&mut self, now: Instant) {
        self.last_change = self.last_change.max(now);
    }

    fn is_idle(&self, now: Instant, quiet: Duration) -> bool {
        self.in_flight.is_empty() && now.saturating_duration_since(self.last_change) >= quiet
    }
}

struct ChromePage {
    page: Page,
    url: String,
    activity: Arc<Mutex<NetworkActivity>>,
    tasks: Vec<JoinHandle<()>>,
}

impl ChromePage {
    /// Install the request gate and network tracker on a blank page
    async fn attach(page: Page, policy: Arc<ResourcePolicy>) -> Result<Self, RenderError> {
        let mut paused = page
            .event_listener::<EventRequestPaused>()
            .await
            .map_err(session_error)?;
        let mut sent = page
            .event_listener::<EventRequestWillBeSent>()
            .await
            .map_err(session_error)?;
        let mut finished = page
            .event_listener::<EventLoadingFinished>()
            .await
            .map_err(session_error)?;
        let mut failed = page
            .event_listener::<EventLoadingFailed>()
            .await
            .map_err(session_error)?;

        let gate_page = page.clone();
        let gate = tokio::spawn(async move {
            while let Some(event) = paused.next().await {
                let url = event.request.url.as_str();
                let kind = event.resource_type.as_ref();
                let outcome = match policy.permit_tag(kind, url) {
                    Decision::Allow => {
                        debug!(kind, url, "Render policy allows");
                        gate_page
                            .execute(ContinueRequestParams::new(event.request_id.clone()))
                            .await
                            .map(|_| ())
                    }
                    Decision::Deny => {
                        debug!(kind, url, "Render policy rejects");
                        gate_page
                            .execute(FailRequestParams::new(
                                event.request_id.clone(),
                                ErrorReason::BlockedByClient,
                            ))
                            .await
                            .map(|_| ())
                    }
                };
                if let Err(e) = outcome {
                    debug!(url, error = %e, "Unable to resolve paused request");
                }
            }
        });

        let activity = Arc::new(Mutex::new(NetworkActivity::new(Instant::now())));
        let tracker = Arc::clone(&activity);
        let network = tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(event) = sent.next() => {
                        tracker.lock().started(event.request_id.inner().clone(), Instant::now())
                    }
                    Some(event) = finished.next() => tracker.lock().ended(event.request_id.inner(), Instant::now()),
                    Some(event) = failed.next() => tracker.lock().ended(event.request_id.inner(), Instant::now()),
                    else => break,
                }
            }
        });

        let interception = EnableParams::builder()
            .pattern(
                RequestPattern::builder()
                    .url_pattern("*")
                    .request_stage(RequestStage::Request)
                    .build(),
            )
            .build();
        if let Err(e) = page.execute(interception).await {
            gate.abort();
            network.abort();
            return Err(session_error(e));
        }

        Ok(Self {
            page,
            url: String::new(),
            activity,
            tasks: vec![gate, network],
        })
    }
}

#[async_trait]
impl RenderPage for ChromePage {
    async fn navigate(&mut self, url: &str) -> Result<(), RenderError> {
        self.url = url.to_string();
        self.page
            .goto(url)
            .await
            .map(|_| ())
            .map_err(|e| RenderError::navigation(url, e))
    }

    async fn wait_for_network_idle(&mut self, quiet: Duration) -> Result<(), RenderError> {
        self.activity.lock().begin_wait(Instant::now());
        loop {
            if self.activity.lock().is_idle(Instant::now(), quiet) {
                return Ok(());
            }
            tokio::time::sleep(IDLE_POLL_INTERVAL.min(quiet)).await;
        }
    }

    async fn content(&mut self) -> Result<String, RenderError> {
        self.page.content().await.map_err(|e| RenderError::Extraction {
            url: self.url.clone(),
            reason: e.to_string(),
        })
    }

    async fn close(self: Box<Self>) {
        let ChromePage { page, tasks, .. } = *self;
        for task in &tasks {
            task.abort();
        }
        if let Err(e) = page.close().await {
            debug!(error = %e, "Unable to close render page");
        }
    }
}
