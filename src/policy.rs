//! Allow/deny decisions for sub-resources requested by a page while it renders.
//!
//! Only the render engine consults this; proxied traffic is never filtered.

use regex::RegexSet;
use std::collections::HashSet;
use std::str::FromStr;

/// Kind of resource a page asks the browser to load
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Document,
    Stylesheet,
    Image,
    Media,
    Font,
    Script,
    TextTrack,
    Xhr,
    Fetch,
    EventSource,
    WebSocket,
    Manifest,
    Other,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Document => "document",
            ResourceKind::Stylesheet => "stylesheet",
            ResourceKind::Image => "image",
            ResourceKind::Media => "media",
            ResourceKind::Font => "font",
            ResourceKind::Script => "script",
            ResourceKind::TextTrack => "texttrack",
            ResourceKind::Xhr => "xhr",
            ResourceKind::Fetch => "fetch",
            ResourceKind::EventSource => "eventsource",
            ResourceKind::WebSocket => "websocket",
            ResourceKind::Manifest => "manifest",
            ResourceKind::Other => "other",
        }
    }
}

impl FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let kind = match s.to_ascii_lowercase().as_str() {
            "document" => ResourceKind::Document,
            "stylesheet" => ResourceKind::Stylesheet,
            "image" => ResourceKind::Image,
            "media" => ResourceKind::Media,
            "font" => ResourceKind::Font,
            "script" => ResourceKind::Script,
            "texttrack" => ResourceKind::TextTrack,
            "xhr" => ResourceKind::Xhr,
            "fetch" => ResourceKind::Fetch,
            "eventsource" => ResourceKind::EventSource,
            "websocket" => ResourceKind::WebSocket,
            "manifest" => ResourceKind::Manifest,
            "other" => ResourceKind::Other,
            other => return Err(format!("unknown resource type '{}'", other)),
        };
        Ok(kind)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny,
}

/// Whitelist of resource kinds plus a precompiled URL blacklist
#[derive(Debug, Clone)]
pub struct ResourcePolicy {
    whitelist: HashSet<ResourceKind>,
    blacklist: RegexSet,
}

impl ResourcePolicy {
    pub fn new(whitelist: &[String], blacklist: &[String]) -> Result<Self, regex::Error> {
        let whitelist = whitelist
            .iter()
            .filter_map(|tag| tag.parse::<ResourceKind>().ok())
            .collect();
        let blacklist = RegexSet::new(blacklist)?;
        Ok(Self {
            whitelist,
            blacklist,
        })
    }

    pub fn permit(&self, kind: ResourceKind, url: &str) -> Decision {
        if !self.whitelist.contains(&kind) {
            return Decision::Deny;
        }
        if self.blacklist.is_match(url) {
            return Decision::Deny;
        }
        Decision::Allow
    }

    /// Decide from a raw type tag; anything unparseable is denied
    pub fn permit_tag(&self, tag: &str, url: &str) -> Decision {
        match tag.parse::<ResourceKind>() {
            Ok(kind) => self.permit(kind, url),
            Err(_) => Decision::Deny,
        }
    }
}

impl Default for ResourcePolicy {
    fn default() -> Self {
        Self {
            whitelist: [
                ResourceKind::Document,
                ResourceKind::Script,
                ResourceKind::Xhr,
                ResourceKind::Fetch,
            ]
            .into_iter()
            .collect(),
            blacklist: RegexSet::empty(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(blacklist: &[&str]) -> ResourcePolicy {
        let whitelist: Vec<String> = ["document", "script", "xhr", "fetch"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let blacklist: Vec<String> = blacklist.iter().map(|s| s.to_string()).collect();
        ResourcePolicy::new(&whitelist, &blacklist).unwrap()
    }

    #[test]
    fn test_kind_outside_whitelist_denied() {
        let policy = policy(&[]);
        assert_eq!(
            policy.permit(ResourceKind::Image, "http://origin/logo.png"),
            Decision::Deny
        );
        assert_eq!(
            policy.permit(ResourceKind::Stylesheet, "http://origin/app.css"),
            Decision::Deny
        );
    }

    #[test]
    fn test_blacklisted_url_denied_even_if_whitelisted() {
        let policy = policy(&[r"google-analytics\.com", r"/tracking/"]);
        assert_eq!(
            policy.permit(ResourceKind::Script, "https://www.google-analytics.com/analytics.js"),
            Decision::Deny
        );
        assert_eq!(
            policy.permit(ResourceKind::Xhr, "http://origin/tracking/event"),
            Decision::Deny
        );
    }

    #[test]
    fn test_whitelisted_script_allowed() {
        let policy = policy(&[r"google-analytics\.com"]);
        assert_eq!(
            policy.permit(ResourceKind::Script, "http://origin/app/bundle.js"),
            Decision::Allow
        );
        assert_eq!(
            policy.permit(ResourceKind::Document, "http://origin/products/42"),
            Decision::Allow
        );
    }

    #[test]
    fn test_unknown_tag_fails_closed() {
        let policy = policy(&[]);
        assert_eq!(policy.permit_tag("Script", "http://origin/a.js"), Decision::Allow);
        assert_eq!(policy.permit_tag("prefetch", "http://origin/a.js"), Decision::Deny);
        assert_eq!(policy.permit_tag("", "http://origin/a.js"), Decision::Deny);
    }

    #[test]
    fn test_invalid_blacklist_pattern_rejected() {
        let result = ResourcePolicy::new(&[], &["(".to_string()]);
        assert!(result.is_err());
    }

    #[test]
    fn test_default_policy_matches_default_whitelist() {
        let policy = ResourcePolicy::default();
        assert_eq!(policy.permit(ResourceKind::Fetch, "http://x/api"), Decision::Allow);
        assert_eq!(policy.permit(ResourceKind::Font, "http://x/f.woff"), Decision::Deny);
    }
}
