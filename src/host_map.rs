//! Public origin to upstream origin resolution

use crate::config::MapEntry;
use std::collections::HashMap;
use tracing::debug;

/// Forward target for origins with no mapping.
///
/// Port 9 is the discard service; nothing listens there on a normal host,
/// so unmapped traffic fails fast with a connection error.
pub const NO_ROUTE_SINK: &str = "http://127.0.0.1:9";

/// Immutable lookup built once from the configured mappings
#[derive(Debug, Clone, Default)]
pub struct HostMapper {
    routes: HashMap<String, String>,
}

impl HostMapper {
    /// Build from ordered pairs; a later duplicate `from` replaces an earlier one
    pub fn new(entries: &[MapEntry]) -> Self {
        let mut routes = HashMap::with_capacity(entries.len());
        for entry in entries {
            if let Some(previous) = routes.insert(entry.from.clone(), entry.to.clone()) {
                debug!(from = %entry.from, previous = %previous, to = %entry.to, "Host mapping overridden");
            }
        }
        Self { routes }
    }

    pub fn resolve(&self, origin: &str) -> Option<&str> {
        self.routes.get(origin).map(String::as_str)
    }

    /// Like `resolve`, but unmapped origins go to the no-route sink
    pub fn target_for(&self, origin: &str) -> &str {
        self.resolve(origin).unwrap_or(NO_ROUTE_SINK)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
