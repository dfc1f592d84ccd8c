use rendergate::cache::RenderCache;
use rendergate::chrome::ChromeSession;
use rendergate::config::Config;
use rendergate::engine::{BrowserSession, EngineConfig, RenderEngine};
use rendergate::host_map::HostMapper;
use rendergate::persist::PersistenceWriter;
use rendergate::policy::ResourcePolicy;
use rendergate::pool::{PoolConfig, UpstreamPool};
use rendergate::prerender::Prerenderer;
use rendergate::proxy::ProxyServer;
use rendergate::router::{RequestRouter, RouterOptions};
use rendergate::{warmer, PKG_NAME, VERSION};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("rendergate.toml"));

    let loaded = Config::load(&config_path);

    // Initialize logging; the level comes from the config when it parsed
    let log_level = loaded
        .as_ref()
        .map(|c| c.server.log_level.clone())
        .unwrap_or_else(|_| "info".to_string());
    let directive: tracing_subscriber::filter::Directive = format!("rendergate={}", log_level)
        .parse()
        .unwrap_or_else(|_| "rendergate=info".parse().expect("valid log directive"));
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(directive))
        .init();

    let config = loaded.map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    if let Some(reason) = &config.map_error {
        error!(error = %reason, "Ignoring all host mappings");
    }

    print_startup_banner(&config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Certificates are read and the port bound before privileges are dropped
    let tls_acceptor = if config.server.serve && config.server.tls_enabled() {
        let (Some(cert_path), Some(key_path)) = (&config.server.tls_cert, &config.server.tls_key) else {
            anyhow::bail!("tls_cert and tls_key must be set together");
        };
        let certs = load_certs(cert_path)?;
        let key = load_key(key_path)?;
        info!(cert = %cert_path, key = %key_path, "TLS enabled with provided certificates");

        let tls_config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| anyhow::anyhow!("TLS configuration error: {}", e))?;
        Some(TlsAcceptor::from(Arc::new(tls_config)))
    } else {
        None
    };

    let listener = if config.server.serve {
        let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
            .parse()
            .map_err(|e| {
                error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
                anyhow::anyhow!("Invalid bind address: {}", e)
            })?;
        Some(
            tokio::net::TcpListener::bind(addr)
                .await
                .map_err(|e| anyhow::anyhow!("Failed to bind {}: {}", addr, e))?,
        )
    } else {
        None
    };

    if let Some(ids) = config.server.privilege_ids() {
        let (uid, gid) = ids.map_err(|e| anyhow::anyhow!(e))?;
        drop_privileges(uid, gid)?;
    }

    // Without a browser nothing can render
    let session = Arc::new(ChromeSession::launch(&config.render).await.map_err(|e| {
        error!(error = %e, "Unable to start the browser");
        e
    })?);

    let policy = ResourcePolicy::new(&config.render.whitelist, &config.render.blacklist)?;
    let engine = RenderEngine::new(
        Arc::clone(&session) as Arc<dyn BrowserSession>,
        policy,
        EngineConfig {
            timeout: config.render.timeout(),
            idle_window: config.render.idle_window(),
            max_concurrent: config.render.max_concurrent,
        },
    );

    let hosts = HostMapper::new(&config.map);
    if hosts.is_empty() {
        warn!("No host mappings configured, every request goes to the no-route sink");
    }

    let writer = PersistenceWriter::from_config(&config.persist);
    if let Some(writer) = &writer {
        info!(dir = %writer.dir().display(), "Persisting rendered pages");
    }

    let prerenderer = Arc::new(Prerenderer::new(
        Arc::new(hosts),
        Arc::new(engine),
        RenderCache::new(),
        writer,
        config.render.headless_query.clone(),
    ));

    warmer::warm(&prerenderer, &config.early).await;

    let Some(listener) = listener else {
        session.shutdown().await;
        info!("Done prerendering all pages, exiting");
        return Ok(());
    };

    let pool_config = PoolConfig {
        max_idle_per_host: config.server.pool_max_idle_per_host,
        idle_timeout: Duration::from_secs(config.server.pool_idle_timeout_secs),
    };
    info!(
        max_idle = pool_config.max_idle_per_host,
        idle_timeout_secs = pool_config.idle_timeout.as_secs(),
        "Upstream pool configured"
    );

    let router = Arc::new(RequestRouter::new(
        Arc::clone(&prerenderer),
        Arc::new(UpstreamPool::new(pool_config)),
        RouterOptions {
            trust_proxy: config.server.trust_proxy,
            compression: config.server.compression,
            proxy_timeout: config.server.proxy_timeout(),
        },
    ));

    let mut server = ProxyServer::new(listener, router, shutdown_rx.clone());
    if let Some(acceptor) = tls_acceptor {
        server = server.with_tls(acceptor);
    }

    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "Proxy server error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())
            .expect("Failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }

    let _ = shutdown_tx.send(true);

    let _ = tokio::time::timeout(Duration::from_secs(5), server_handle).await;

    info!("Closing browser session...");
    session.shutdown().await;

    let cache = prerenderer.cache();
    info!(
        cached_pages = cache.len(),
        renders = cache.stats().get_renders(),
        hits = cache.stats().get_hits(),
        "Shutdown complete"
    );
    Ok(())
}

#[cfg(unix)]
fn drop_privileges(uid: u32, gid: u32) -> anyhow::Result<()> {
    debug!(uid, gid, "Dropping privileges");

    // Group first: once the uid changes we may no longer be allowed to
    if unsafe { libc::setgid(gid) } != 0 {
        let err = std::io::Error::last_os_error();
        anyhow::bail!("Failed to set gid {}: {}", gid, err);
    }
    if unsafe { libc::setuid(uid) } != 0 {
        let err = std::io::Error::last_os_error();
        anyhow::bail!("Failed to set uid {}: {}", uid, err);
    }

    let (now_uid, now_gid) = unsafe { (libc::getuid(), libc::getgid()) };
    info!(uid = now_uid, gid = now_gid, "Privileges dropped");
    Ok(())
}

#[cfg(not(unix))]
fn drop_privileges(_uid: u32, _gid: u32) -> anyhow::Result<()> {
    anyhow::bail!("drop_privileges is only supported on unix")
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting prerender proxy");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        serve = config.server.serve,
        tls = config.server.tls_enabled(),
        trust_proxy = config.server.trust_proxy,
        compression = config.server.compression,
        "Server configuration"
    );
    info!(
        timeout_ms = config.render.timeout_ms,
        idle_window_ms = config.render.idle_window_ms,
        max_concurrent = config.render.max_concurrent,
        headless = config.render.headless,
        whitelist = ?config.render.whitelist,
        blacklist_patterns = config.render.blacklist.len(),
        "Render settings"
    );
    info!(
        mappings = ?config.map.iter().map(|m| format!("{} -> {}", m.from, m.to)).collect::<Vec<_>>(),
        early = config.early.len(),
        persist_dir = ?config.persist.dir,
        "Routing and warm-up"
    );
}

fn load_certs(path: &str) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| anyhow::anyhow!("Failed to open certificate file {}: {}", path, e))?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| anyhow::anyhow!("Failed to parse certificates from {}: {}", path, e))?;

    if certs.is_empty() {
        anyhow::bail!("No certificates found in {}", path);
    }

    Ok(certs)
}

fn load_key(path: &str) -> anyhow::Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| anyhow::anyhow!("Failed to open key file {}: {}", path, e))?;
    let mut reader = BufReader::new(file);

    loop {
        match rustls_pemfile::read_one(&mut reader)
            .map_err(|e| anyhow::anyhow!("Failed to parse key from {}: {}", path, e))?
        {
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Sec1Key(key)) => return Ok(key.into()),
            None => break,
            _ => continue,
        }
    }

    anyhow::bail!("No private key found in {}", path)
}
