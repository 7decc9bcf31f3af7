use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use tollgate::config::{Environment, TollgateConfig};
use tollgate::http::{router, AppState, HttpServer};
use tollgate::ratelimit::{
    ClientIdentityResolver, CounterStore, FallbackSweeper, FallbackTable, PolicyEngine,
    RedisCounterStore, Registry,
};

/// Distributed fixed-window rate limiting service.
#[derive(Debug, Parser)]
#[command(name = "tollgate", version, about)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long, env = "TOLLGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Deployment environment (development or production)
    #[arg(short, long)]
    environment: Option<Environment>,

    /// Address for the HTTP server
    #[arg(long)]
    http_addr: Option<SocketAddr>,

    /// Redis connection URL for the shared counters
    #[arg(long)]
    redis_url: Option<String>,

    /// Trust X-Forwarded-For style headers from a reverse proxy
    #[arg(long)]
    trust_proxy: bool,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);

    info!("Starting Tollgate Rate Limiting Service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = TollgateConfig::load(args.config.as_deref())?;
    if let Some(environment) = args.environment {
        config.rate_limiting.environment = environment;
    }
    if let Some(addr) = args.http_addr {
        config.server.http_addr = addr;
    }
    if let Some(url) = args.redis_url {
        config.store.redis_url = url;
    }
    if args.trust_proxy {
        config.rate_limiting.trust_proxy = true;
    }

    let environment = config.rate_limiting.environment;
    info!(
        http_addr = %config.server.http_addr,
        environment = %environment,
        instance = %config.server.instance_id,
        trust_proxy = config.rate_limiting.trust_proxy,
        "Configuration loaded"
    );

    let store = Arc::new(RedisCounterStore::new(
        &config.store.redis_url,
        config.store.timeout(),
    )?);
    // The service starts without the store; requests degrade per environment.
    if let Err(e) = store.health_check().await {
        warn!(error = %e, "Counter store unreachable at startup");
    } else {
        info!("Counter store reachable");
    }

    let fallback = Arc::new(FallbackTable::default());
    let sweeper = FallbackSweeper::start(fallback.clone(), config.rate_limiting.sweep_interval());

    let engine = PolicyEngine::new(
        store,
        fallback,
        ClientIdentityResolver::new(config.rate_limiting.trust_proxy),
        environment,
    )
    .with_store_timeout(config.store.timeout())
    .with_development_fallback(config.rate_limiting.fallback_on_store_failure);

    let registry = Registry::with_overrides(environment, &config.rate_limiting.overrides)?;
    for (kind, policy) in registry.iter() {
        info!(
            limiter = %kind,
            limit = policy.limit(),
            window_ms = policy.window().as_millis() as u64,
            "Limiter registered"
        );
    }

    let state = AppState::new(
        Arc::new(engine),
        Arc::new(registry),
        &config.server.instance_id,
    );
    let server = HttpServer::new(config.server.http_addr, router(state));

    let result = server.serve_with_shutdown(shutdown_signal()).await;
    sweeper.shutdown().await;
    result?;

    info!("Tollgate Rate Limiting Service stopped");
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_cli_overrides_parse() {
        let args = Args::try_parse_from([
            "tollgate",
            "--config",
            "/etc/tollgate.yaml",
            "--environment",
            "prod",
            "--http-addr",
            "0.0.0.0:9090",
            "--trust-proxy",
            "--log-format",
            "json",
        ])
        .unwrap();

        assert_eq!(args.config, Some(PathBuf::from("/etc/tollgate.yaml")));
        assert_eq!(args.environment, Some(Environment::Production));
        assert_eq!(args.http_addr, Some("0.0.0.0:9090".parse().unwrap()));
        assert!(args.trust_proxy);
        assert_eq!(args.log_format, LogFormat::Json);
    }
}
