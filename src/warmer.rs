//! Startup cache warming from the configured seed URLs

use crate::prerender::{PageUrl, Prerenderer};
use std::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WarmReport {
    pub rendered: usize,
    pub failed: usize,
}

/// Render each seed URL in order, one at a time.
///
/// A failing seed is logged and skipped; it never stops the rest.
pub async fn warm(prerenderer: &Prerenderer, seeds: &[String]) -> WarmReport {
    let mut report = WarmReport::default();
    if seeds.is_empty() {
        return report;
    }

    let start = Instant::now();
    info!(count = seeds.len(), "Early prerender starting");

    for seed in seeds {
        let page = match PageUrl::parse(seed) {
            Some(page) => page,
            None => {
                warn!(url = %seed, "Seed is not an absolute URL, skipping");
                report.failed += 1;
                continue;
            }
        };

        debug!(url = %seed, "Early prerender");
        match prerenderer.prerender(&page).await {
            Ok(_) => report.rendered += 1,
            Err(e) => {
                warn!(url = %seed, fetch = %prerenderer.fetch_url_for(&page), error = %e, "Unable to early render");
                report.failed += 1;
            }
        }
    }

    info!(
        rendered = report.rendered,
        failed = report.failed,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "Early prerender finished"
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::RenderCache;
    use crate::config::MapEntry;
    use crate::engine::testing::{engine, FakeSession, Script};
    use crate::host_map::HostMapper;
    use std::sync::Arc;
    use std::time::Duration;

    fn prerenderer(fake: &Arc<FakeSession>) -> Prerenderer {
        let hosts = HostMapper::new(&[MapEntry::new("https://shop.example.com", "http://127.0.0.1:3000")]);
        Prerenderer::new(
            Arc::new(hosts),
            Arc::new(engine(fake, Duration::from_millis(100))),
            RenderCache::new(),
            None,
            "headless=true",
        )
    }

    #[tokio::test]
    async fn test_warm_populates_cache() {
        let fake = Arc::new(FakeSession::default());
        let prerenderer = prerenderer(&fake);

        let report = warm(
            &prerenderer,
            &["https://shop.example.com/".to_string(), "https://shop.example.com/sale".to_string()],
        )
        .await;
        assert_eq!(report, WarmReport { rendered: 2, failed: 0 });

        let hit = prerenderer
            .prerender(&PageUrl::new("https://shop.example.com", "/sale"))
            .await
            .unwrap();
        assert_eq!(hit.render_time, Duration::ZERO);
        assert_eq!(fake.navigation_count(), 2);
    }

    #[tokio::test]
    async fn test_failing_seed_does_not_stop_warming() {
        let fake = Arc::new(
            FakeSession::default().with_page("http://127.0.0.1:3000/broken?headless=true", Script::Hang),
        );
        let prerenderer = prerenderer(&fake);

        let report = warm(
            &prerenderer,
            &[
                "https://shop.example.com/broken".to_string(),
                "not a url".to_string(),
                "https://shop.example.com/ok".to_string(),
            ],
        )
        .await;

        assert_eq!(report, WarmReport { rendered: 1, failed: 2 });
        assert_eq!(prerenderer.cache().len(), 1);
    }

    #[tokio::test]
    async fn test_seed_fetch_preserves_query() {
        let fake = Arc::new(FakeSession::default());
        let prerenderer = prerenderer(&fake);

        warm(&prerenderer, &["https://shop.example.com/list?page=2#reviews".to_string()]).await;

        let navigations = fake.navigations.lock().clone();
        assert_eq!(navigations, vec!["http://127.0.0.1:3000/list?page=2&headless=true".to_string()]);
    }
}
