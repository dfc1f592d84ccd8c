use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Global configuration for the prerendering proxy
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listener and proxy settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Headless rendering settings
    #[serde(default)]
    pub render: RenderConfig,

    /// Optional on-disk copies of rendered pages
    #[serde(default)]
    pub persist: PersistConfig,

    /// Host mappings as written; checked by [`Config::parse`]
    #[serde(default, rename = "map")]
    raw_map: Option<toml::Value>,

    /// Host mappings from the public origin to the upstream origin
    #[serde(skip)]
    pub map: Vec<MapEntry>,

    /// Why the host mappings were ignored, reported once logging is up
    #[serde(skip)]
    pub map_error: Option<String>,

    /// URLs rendered before the server starts accepting traffic
    #[serde(default)]
    pub early: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Listen port (default: 8080)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Path to TLS certificate file (PEM format)
    pub tls_cert: Option<String>,

    /// Path to TLS private key file (PEM format)
    pub tls_key: Option<String>,

    /// Trust X-Forwarded-Proto / X-Forwarded-Host from a fronting proxy
    #[serde(default)]
    pub trust_proxy: bool,

    /// Gzip proxied responses on the fly (default: false)
    #[serde(default)]
    pub compression: bool,

    /// "uid:gid" to switch to once the listener is ready (unix only)
    pub drop_privileges: Option<String>,

    /// Accept traffic after warm-up. When false, only prerender and exit.
    #[serde(default = "default_true")]
    pub serve: bool,

    /// Default log level for the rendergate target (RUST_LOG overrides)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Maximum idle upstream connections per host (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle upstream connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// Max time to wait for the upstream to respond to a proxied request
    #[serde(default = "default_proxy_timeout")]
    pub proxy_timeout_secs: u64,
}

impl ServerConfig {
    pub fn tls_enabled(&self) -> bool {
        self.tls_cert.is_some() && self.tls_key.is_some()
    }

    pub fn proxy_timeout(&self) -> Duration {
        Duration::from_secs(self.proxy_timeout_secs)
    }

    /// Parse `drop_privileges` into (uid, gid)
    pub fn privilege_ids(&self) -> Option<Result<(u32, u32), String>> {
        self.drop_privileges.as_deref().map(parse_ids)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            tls_cert: None,
            tls_key: None,
            trust_proxy: false,
            compression: false,
            drop_privileges: None,
            serve: true,
            log_level: default_log_level(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            proxy_timeout_secs: default_proxy_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RenderConfig {
    /// Per-render navigation budget in milliseconds (default: 5000)
    #[serde(default = "default_render_timeout")]
    pub timeout_ms: u64,

    /// Quiet period with no in-flight requests that counts as network idle
    #[serde(default = "default_idle_window")]
    pub idle_window_ms: u64,

    /// Renders allowed to run at the same time on the shared browser
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Resource types a page may load while rendering
    #[serde(default = "default_whitelist")]
    pub whitelist: Vec<String>,

    /// URL regexes a page may never load while rendering
    #[serde(default)]
    pub blacklist: Vec<String>,

    /// Run the browser without a window (default: true)
    #[serde(default = "default_true")]
    pub headless: bool,

    /// Explicit Chrome/Chromium binary; auto-detected when unset
    pub chrome_executable: Option<String>,

    /// Query pair appended to the fetch URL; empty disables it
    #[serde(default = "default_headless_query")]
    pub headless_query: String,
}

impl RenderConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn idle_window(&self) -> Duration {
        Duration::from_millis(self.idle_window_ms)
    }
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_render_timeout(),
            idle_window_ms: default_idle_window(),
            max_concurrent: default_max_concurrent(),
            whitelist: default_whitelist(),
            blacklist: Vec::new(),
            headless: true,
            chrome_executable: None,
            headless_query: default_headless_query(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PersistConfig {
    /// Directory receiving a copy of each rendered page
    pub dir: Option<String>,

    /// Extension appended to every written file (e.g. ".html")
    #[serde(default)]
    pub file_ext: String,

    /// Octal file mode for written files (default: "444")
    #[serde(default = "default_file_mode")]
    pub mode: String,
}

impl PersistConfig {
    pub fn parsed_mode(&self) -> Option<u32> {
        u32::from_str_radix(&self.mode, 8).ok()
    }
}

impl Default for PersistConfig {
    fn default() -> Self {
        Self {
            dir: None,
            file_ext: String::new(),
            mode: default_file_mode(),
        }
    }
}

/// One `from -> to` origin mapping
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct MapEntry {
    pub from: String,
    pub to: String,
}

impl MapEntry {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }
}

/// Resource type tags understood by the render policy
pub const RESOURCE_TYPES: &[&str] = &[
    "document",
    "stylesheet",
    "image",
    "media",
    "font",
    "script",
    "texttrack",
    "xhr",
    "fetch",
    "eventsource",
    "websocket",
    "manifest",
    "other",
];

// A broken map must not keep the proxy from starting: route nowhere instead.
fn lenient_host_map(raw: toml::Value) -> Result<Vec<MapEntry>, String> {
    let entries: Vec<MapEntry> = raw
        .try_into()
        .map_err(|e| format!("unable to parse host mapping: {}", e))?;
    if let Some(bad) = entries.iter().find(|e| !is_origin(&e.from) || !is_origin(&e.to)) {
        return Err(format!(
            "host mapping entry '{}' -> '{}' is not an origin",
            bad.from, bad.to
        ));
    }
    Ok(entries)
}

/// `scheme://authority` with nothing after the authority
pub fn is_origin(value: &str) -> bool {
    match value.parse::<hyper::Uri>() {
        Ok(uri) => {
            uri.scheme().is_some()
                && uri.authority().is_some()
                && uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/") == "/"
                && !value.ends_with('/')
        }
        Err(_) => false,
    }
}

fn parse_ids(value: &str) -> Result<(u32, u32), String> {
    let (uid, gid) = value
        .split_once(':')
        .ok_or_else(|| format!("drop_privileges '{}' must be in uid:gid format", value))?;
    let uid = uid
        .parse()
        .map_err(|_| format!("drop_privileges uid '{}' is not a number", uid))?;
    let gid = gid
        .parse()
        .map_err(|_| format!("drop_privileges gid '{}' is not a number", gid))?;
    Ok((uid, gid))
}

// Default value functions
fn default_listen_port() -> u16 {
    8080
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_proxy_timeout() -> u64 {
    30
}

fn default_render_timeout() -> u64 {
    5000
}

fn default_idle_window() -> u64 {
    500 // same quiet period as a networkidle0 wait
}

fn default_max_concurrent() -> usize {
    4
}

fn default_whitelist() -> Vec<String> {
    ["document", "script", "xhr", "fetch"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_headless_query() -> String {
    "headless=true".to_string()
}

fn default_file_mode() -> String {
    "444".to_string()
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::parse(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse TOML without validating. A malformed `map` leaves no mappings
    /// and records the reason in `map_error`.
    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let mut config: Config = toml::from_str(content)?;
        if let Some(raw) = config.raw_map.take() {
            match lenient_host_map(raw) {
                Ok(entries) => config.map = entries,
                Err(reason) => config.map_error = Some(reason),
            }
        }
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        for pattern in &self.render.blacklist {
            if let Err(e) = regex::Regex::new(pattern) {
                errors.push(format!("blacklist pattern '{}' is invalid: {}", pattern, e));
            }
        }

        for tag in &self.render.whitelist {
            if !RESOURCE_TYPES.contains(&tag.as_str()) {
                errors.push(format!("whitelist entry '{}' is not a known resource type", tag));
            }
        }

        if self.render.max_concurrent == 0 {
            errors.push("render.max_concurrent must be greater than 0".to_string());
        }

        if self.persist.parsed_mode().is_none() {
            errors.push(format!("persist.mode '{}' is not an octal file mode", self.persist.mode));
        }

        if let Some(dir) = &self.persist.dir {
            if !Path::new(dir).is_dir() {
                errors.push(format!("persist.dir '{}' doesn't exist", dir));
            }
        }

        if !self.server.serve && (self.persist.dir.is_none() || self.early.is_empty()) {
            errors.push("server.serve = false requires persist.dir and early to be set".to_string());
        }

        for url in &self.early {
            let absolute = url
                .parse::<hyper::Uri>()
                .map(|u| u.scheme().is_some() && u.authority().is_some())
                .unwrap_or(false);
            if !absolute {
                errors.push(format!("early URL '{}' is not an absolute URL", url));
            }
        }

        if let Some(Err(e)) = self.server.privilege_ids() {
            errors.push(e);
        }

        if self.server.tls_cert.is_some() != self.server.tls_key.is_some() {
            errors.push("tls_cert and tls_key must be set together".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
