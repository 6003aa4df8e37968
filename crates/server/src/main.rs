use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::Result;
use axum::{serve, Router};
use clap::Parser;
use portcullis_core::{
    auth::{AuthPipeline, CachedTokenStore, JwtVerifier, KvTokenStore, TokenStore},
    cache::ResponseCache,
    config::Configuration,
    discovery::DnsResolver,
    dispatcher::{
        AuthenticationBehavior, Behavior, CachingBehavior, Dispatcher, RateLimitBehavior,
    },
    kv::{KvBackend, RedisKv},
    proxy::ProxyForwarder,
    ratelimit::RateLimiter,
};
use server::{admin, audit::AuditLogListener, monitoring};
use tokio::signal;
use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Maximum accepted client request body.
const MAX_REQUEST_BODY: usize = 32 * 1024 * 1024;

#[derive(Debug, Parser)]
#[command(name = "portcullis", about = "Microservice API gateway")]
struct Args {
    /// Configuration file (JSON or TOML).
    #[arg(long, default_value = "/etc/portcullis.json")]
    config: PathBuf,

    /// Dispatching mode. Only 'path' is supported.
    #[arg(long, default_value = "path")]
    dispatch: String,

    /// HTTP port to listen on.
    #[arg(long, default_value_t = 8080)]
    port: u16,

    /// Address to listen on (administration port).
    #[arg(long, default_value = "127.0.0.1")]
    admin_addr: String,

    /// HTTP port to listen on (administration port).
    #[arg(long, default_value_t = 8081)]
    admin_port: u16,

    /// Address to listen on (monitoring port).
    #[arg(long, default_value = "0.0.0.0")]
    monitor_addr: String,

    /// HTTP port to listen on (monitoring port).
    #[arg(long, default_value_t = 8082)]
    monitor_port: u16,
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,portcullis_core=info,server=info,audit=info"));
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
}

/// Container for the initialized core services.
struct CoreServices {
    token_store: Arc<dyn TokenStore>,
    verifier: Arc<JwtVerifier>,
    proxy_router: Router,
}

async fn init_core_services(config: Arc<Configuration>) -> Result<CoreServices> {
    let kv: Arc<dyn KvBackend> = Arc::new(
        RedisKv::connect(&config.redis)
            .await
            .map_err(|e| anyhow::anyhow!("redis backend initialization failed: {e}"))?,
    );

    let verifier = Arc::new(
        JwtVerifier::new(&config.authentication)
            .map_err(|e| anyhow::anyhow!("JWT verifier initialization failed: {e}"))?,
    );

    let token_store: Arc<dyn TokenStore> = Arc::new(CachedTokenStore::new(Arc::new(
        KvTokenStore::new(kv.clone(), verifier.clone()),
    )));

    let pipeline = Arc::new(AuthPipeline::new(
        config.clone(),
        token_store.clone(),
        verifier.clone(),
    ));
    if config.logging.iter().any(|sink| sink.kind == "audit") {
        pipeline.register_listener(Arc::new(AuditLogListener));
    }

    let limiter = Arc::new(RateLimiter::new(&config.rate_limiting, kv));
    let cache = Arc::new(ResponseCache::new(ResponseCache::DEFAULT_CAPACITY));
    let forwarder = Arc::new(
        ProxyForwarder::new(Arc::new(config.proxy.clone()))
            .map_err(|e| anyhow::anyhow!("proxy forwarder initialization failed: {e}"))?,
    );
    let resolver = Arc::new(DnsResolver::from_config(config.consul.as_ref()));

    let mut dispatcher = Dispatcher::new(config.clone(), forwarder, resolver);
    // Order matters: behaviours run in LIFO order, so the one added last is
    // evaluated first on each request.
    dispatcher.add_behaviour(vec![
        Arc::new(CachingBehavior::new(cache)) as Arc<dyn Behavior>,
        Arc::new(AuthenticationBehavior::new(pipeline)),
        Arc::new(RateLimitBehavior::new(limiter)),
    ]);

    for (name, app) in &config.applications {
        dispatcher
            .register_application(name, app)
            .map_err(|e| anyhow::anyhow!("could not register application: {e}"))?;
    }
    dispatcher.initialize();
    info!(applications = config.applications.len(), "dispatcher initialized");

    Ok(CoreServices {
        token_store,
        verifier,
        proxy_router: dispatcher.into_router(),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let args = Args::parse();
    if args.dispatch != "path" {
        anyhow::bail!("unsupported dispatching mode: '{}'", args.dispatch);
    }

    let config = Configuration::from_file(&args.config)
        .map_err(|e| anyhow::anyhow!("could not load configuration: {e}"))?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;
    let config = Arc::new(config);
    info!(config = %args.config.display(), "configuration loaded");

    let metrics_handle = monitoring::install_recorder()
        .map_err(|e| anyhow::anyhow!("could not install metrics recorder: {e}"))?;

    let services = init_core_services(config.clone()).await?;

    let proxy_app = services
        .proxy_router
        .layer(TraceLayer::new_for_http())
        .layer(RequestBodyLimitLayer::new(MAX_REQUEST_BODY));
    let admin_app = admin::create_admin_router(admin::AdminState::new(
        services.token_store,
        services.verifier,
    ));
    let monitor_app = monitoring::create_monitoring_router(metrics_handle);

    let proxy_addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    let admin_addr: SocketAddr = format!("{}:{}", args.admin_addr, args.admin_port)
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid admin bind address: {e}"))?;
    let monitor_addr: SocketAddr = format!("{}:{}", args.monitor_addr, args.monitor_port)
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid monitor bind address: {e}"))?;

    let proxy_listener = tokio::net::TcpListener::bind(proxy_addr).await?;
    let admin_listener = tokio::net::TcpListener::bind(admin_addr).await?;
    let monitor_listener = tokio::net::TcpListener::bind(monitor_addr).await?;

    info!(address = %proxy_addr, "proxy server listening");
    info!(address = %admin_addr, "admin server listening");
    info!(address = %monitor_addr, "monitoring server listening");

    let proxy_server = serve(
        proxy_listener,
        proxy_app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal());
    let admin_server = serve(
        admin_listener,
        admin_app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal());
    let monitor_server =
        serve(monitor_listener, monitor_app.into_make_service())
            .with_graceful_shutdown(shutdown_signal());

    // All three servers drain to completion; returning on the first one to
    // finish would cancel the others mid-drain.
    let servers = async {
        let (proxy_result, admin_result, monitor_result) =
            tokio::join!(proxy_server, admin_server, monitor_server);
        for (name, result) in [
            ("proxy", proxy_result),
            ("admin", admin_result),
            ("monitoring", monitor_result),
        ] {
            if let Err(e) = result {
                error!(error = %e, server = name, "server error occurred");
            }
        }
    };

    let drain_deadline = async {
        shutdown_signal().await;
        info!(
            "shutdown signal received, starting graceful shutdown (timeout: {}s)",
            GRACEFUL_SHUTDOWN_TIMEOUT_SECS
        );
        tokio::time::sleep(std::time::Duration::from_secs(GRACEFUL_SHUTDOWN_TIMEOUT_SECS)).await;
    };

    tokio::select! {
        () = servers => {
            info!("server shutdown complete");
        }
        () = drain_deadline => {
            error!("graceful shutdown timed out, terminating");
            std::process::exit(1);
        }
    }

    Ok(())
}

/// Graceful shutdown timeout in seconds. In-flight requests get this long
/// to drain after the signal; the process is terminated on expiry.
const GRACEFUL_SHUTDOWN_TIMEOUT_SECS: u64 = 30;

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install signal handler");
                () = std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
