//! Bastion Gate - TLS-terminating security gateway
//!
//! Wires the pieces together: configuration with file watching, the
//! certificate store, the OCSP refresher, the policy composer, rate
//! limiter, WAF gate and dispatcher, then runs the HTTPS, QUIC and
//! redirect listeners until a shutdown signal arrives.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use bastion_gate::config::{ConfigManager, ConfigReloadEvent};
use bastion_gate::{
    BackendDispatcher, CertificateStore, GatewayState, OcspRefresher, OsNonceSource,
    PolicyComposer, QuicListener, SensitiveRateLimiter, StaticAssets, WafGate,
};

/// TLS-terminating security gateway
#[derive(Parser, Debug)]
#[command(name = "bastion-gate")]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(
        short,
        long,
        default_value = "/etc/bastion-gate/config.toml",
        env = "BASTION_CONFIG"
    )]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "BASTION_LOG_LEVEL")]
    log_level: Option<String>,

    /// Emit JSON log records
    #[arg(long, env = "BASTION_JSON_LOGS")]
    json_logs: bool,

    /// Watch the configuration file for changes
    #[arg(long, default_value = "true")]
    watch_config: bool,

    /// Validate the configuration and exit
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Crypto provider must be installed before any rustls construction.
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("rustls crypto provider already installed"))?;

    let args = Args::parse();

    let (config_manager, mut reload_rx) = ConfigManager::new(&args.config)?;
    let config_manager = Arc::new(config_manager);
    let config = config_manager.get();

    let level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    let json = args.json_logs || config.logging.format == "json";
    init_logging(&level, json);

    info!(version = env!("CARGO_PKG_VERSION"), config = %args.config.display(), "bastion-gate starting");

    if args.validate {
        info!("configuration valid");
        return Ok(());
    }

    let store = Arc::new(CertificateStore::new(&config.tls)?);
    let ocsp = Arc::new(OcspRefresher::new(&config.ocsp, store.clone()));
    ocsp.clone().start();

    let state = GatewayState {
        config: config_manager.clone(),
        policy: Arc::new(PolicyComposer::new(
            &config.policy,
            Arc::new(OsNonceSource),
        )),
        waf: Arc::new(WafGate::new(&config.waf)),
        limiter: Arc::new(SensitiveRateLimiter::new(&config.rate_limit)),
        dispatcher: Arc::new(BackendDispatcher::new(&config.backend)),
        assets: Arc::new(StaticAssets::new(&config.static_assets)),
    };

    if args.watch_config {
        config_manager.clone().start_watching()?;
    }

    // Reload events fan out to every component that keeps derived state.
    {
        let state = state.clone();
        let store = store.clone();
        let ocsp = ocsp.clone();
        tokio::spawn(async move {
            while let Some(event) = reload_rx.recv().await {
                match event {
                    ConfigReloadEvent::Reloaded(config) => {
                        state.policy.install(&config.policy);
                        state.waf.install(&config.waf);
                        state.limiter.install(&config.rate_limit);
                        state.dispatcher.install(&config.backend);
                        state.assets.install(&config.static_assets);
                        ocsp.install(&config.ocsp);
                        if let Err(e) = store.reload(&config.tls) {
                            error!(error = %e, "certificate reload failed, previous bundles stay active");
                        }
                        info!("configuration reload applied");
                    }
                    ConfigReloadEvent::ReloadFailed(msg) => {
                        warn!(error = %msg, "configuration reload rejected");
                    }
                }
            }
        });
    }

    let https_handle = axum_server::Handle::new();
    let redirect_handle = axum_server::Handle::new();
    let (quic_shutdown_tx, quic_shutdown_rx) = mpsc::channel::<()>(1);

    {
        let state = state.clone();
        let store = store.clone();
        let handle = https_handle.clone();
        tokio::spawn(async move {
            if let Err(e) = bastion_gate::run_https_listener(state, store, handle).await {
                error!(error = %e, "https listener exited");
            }
        });
    }

    if config.server.enable_quic {
        let quic = QuicListener::new(state.clone(), &store, quic_shutdown_rx)?;
        tokio::spawn(quic.run());
    }

    {
        let state = state.clone();
        let handle = redirect_handle.clone();
        tokio::spawn(async move {
            if let Err(e) = bastion_gate::run_http_redirect(state, handle).await {
                error!(error = %e, "redirect listener exited");
            }
        });
    }

    info!(
        https = config.server.https_port,
        http = config.http_redirect.port,
        quic = config.server.enable_quic,
        backend = %config.backend.address,
        "gateway ready"
    );

    tokio::select! {
        _ = signal::ctrl_c() => info!("ctrl-c received"),
        _ = shutdown_signal() => info!("shutdown signal received"),
    }

    let drain = Duration::from_secs(config.server.graceful_shutdown_timeout_secs);
    info!(drain_secs = drain.as_secs(), "draining in-flight requests");
    https_handle.graceful_shutdown(Some(drain));
    redirect_handle.graceful_shutdown(Some(Duration::from_secs(1)));
    let _ = quic_shutdown_tx.send(()).await;
    ocsp.stop().await;
    tokio::time::sleep(drain).await;

    info!("bastion-gate stopped");
    Ok(())
}

fn init_logging(level: &str, json: bool) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            error!(error = %e, "failed to install SIGTERM handler");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    std::future::pending::<()>().await;
}
