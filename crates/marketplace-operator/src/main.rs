//! Marketplace Operator
//!
//! Migrates leftovers of earlier releases, then mirrors external app
//! registries into in-cluster catalogs and reports its health through the
//! `marketplace` ClusterOperator.

use anyhow::{Context, Result};
use clap::Parser;
use kube::Client;
use marketplace_operator::clock::{Clock, SystemClock};
use marketplace_operator::config::{
    MaterializerConfig, OperatorConfig, ReporterConfig, SyncerConfig, DEFAULT_NAMESPACE,
    DEFAULT_REGISTRY_SERVER_IMAGE,
};
use marketplace_operator::defaults::{ensure_defaults, load_defaults};
use marketplace_operator::health::health_channels;
use marketplace_operator::materializer::run_materializer;
use marketplace_operator::migrator::{KubeMigrationStore, Migrator};
use marketplace_operator::registry_client::{HttpRegistryClient, RegistryClientConfig};
use marketplace_operator::shutdown::Shutdown;
use marketplace_operator::status::{KubeStatusStore, StatusReporter};
use marketplace_operator::syncer::{
    notification_channel, watch_sources, KubeSourceStore, RegistrySyncer,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, Level};
use tracing_subscriber::fmt::format::FmtSpan;

/// Marketplace Operator
#[derive(Parser, Debug)]
#[command(name = "marketplace-operator")]
#[command(about = "Kubernetes operator that mirrors external operator registries into catalogs")]
#[command(version)]
struct Args {
    /// Metrics server address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8383")]
    metrics_addr: SocketAddr,

    /// Health probe address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8080")]
    health_addr: SocketAddr,

    /// Namespace the operator runs in and watches
    #[arg(long, env = "WATCH_NAMESPACE", default_value = DEFAULT_NAMESPACE)]
    namespace: String,

    /// Image of the registry-serving containers
    #[arg(long, env = "REGISTRY_SERVER_IMAGE", default_value = DEFAULT_REGISTRY_SERVER_IMAGE)]
    registry_server_image: String,

    /// Directory with default OperatorSource manifests
    #[arg(long, env = "DEFAULTS_DIR")]
    defaults_dir: Option<PathBuf>,

    /// Release version reported in status and migration records
    #[arg(long, env = "RELEASE_VERSION", default_value = "0.0.1-snapshot")]
    release_version: String,

    /// Seconds to wait before the first registry sync
    #[arg(long, default_value = "60")]
    initial_wait_secs: u64,

    /// Seconds between regular registry syncs
    #[arg(long, default_value = "3600", value_parser = clap::value_parser!(u64).range(1..))]
    resync_interval_secs: u64,

    /// Minimum seconds between change-triggered syncs
    #[arg(long, default_value = "600")]
    debounce_window_secs: u64,

    /// Seconds between status recomputations
    #[arg(long, default_value = "20", value_parser = clap::value_parser!(u64).range(1..))]
    report_interval_secs: u64,

    /// Consecutive failures before the operator reports Degraded
    #[arg(long, default_value = "3", value_parser = clap::value_parser!(u32).range(1..))]
    failure_threshold: u32,

    /// Timeout for one registry fetch, in seconds
    #[arg(long, default_value = "30", value_parser = clap::value_parser!(u64).range(1..))]
    fetch_timeout_secs: u64,

    /// Timeout for one cluster API call, in seconds
    #[arg(long, default_value = "15", value_parser = clap::value_parser!(u64).range(1..))]
    api_timeout_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: Level,

    /// Enable JSON log format
    #[arg(long, env = "LOG_JSON", default_value = "false")]
    log_json: bool,

    /// Print CRD YAML and exit
    #[arg(long)]
    print_crds: bool,
}

impl Args {
    fn operator_config(&self) -> OperatorConfig {
        let api_timeout = Duration::from_secs(self.api_timeout_secs);
        OperatorConfig {
            namespace: self.namespace.clone(),
            release_version: self.release_version.clone(),
            defaults_dir: self.defaults_dir.clone(),
            syncer: SyncerConfig {
                initial_wait: Duration::from_secs(self.initial_wait_secs),
                resync_interval: Duration::from_secs(self.resync_interval_secs),
                debounce_window: Duration::from_secs(self.debounce_window_secs),
                fetch_timeout: Duration::from_secs(self.fetch_timeout_secs),
                api_timeout,
            },
            materializer: MaterializerConfig {
                registry_server_image: self.registry_server_image.clone(),
                api_timeout,
                ..MaterializerConfig::default()
            },
            reporter: ReporterConfig {
                report_interval: Duration::from_secs(self.report_interval_secs),
                failure_threshold: self.failure_threshold,
                api_timeout,
                ..ReporterConfig::default()
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_crds {
        print_crds()?;
        return Ok(());
    }

    init_logging(&args)?;

    let config = args.operator_config();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        release = %config.release_version,
        namespace = %config.namespace,
        "Starting Marketplace Operator"
    );

    let metrics_addr = args.metrics_addr;
    tokio::spawn(async move {
        if let Err(e) = start_metrics_server(metrics_addr).await {
            error!(error = %e, "Metrics server failed");
        }
    });

    let health_addr = args.health_addr;
    tokio::spawn(async move {
        if let Err(e) = start_health_server(health_addr).await {
            error!(error = %e, "Health server failed");
        }
    });

    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    run(client, config).await
}

async fn run(client: Client, config: OperatorConfig) -> Result<()> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let namespace = config.namespace.clone();

    let shutdown = Shutdown::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            wait_for_shutdown_signal().await;
            shutdown.trigger();
        });
    }

    let mut reporter = StatusReporter::new(
        Arc::new(KubeStatusStore::new(client.clone())),
        clock.clone(),
        config.reporter.clone(),
        &config.release_version,
    );

    reporter.report_migration().await;
    let migrator = Migrator::new(
        Arc::new(KubeMigrationStore::new(client.clone())),
        &config.release_version,
        clock.clone(),
    )
    .with_api_timeout(config.reporter.api_timeout);

    if let Err(e) = migrator.migrate(&namespace).await {
        error!(error = %e, "Migration failed, refusing to start");
        reporter.report_failure(&e).await;
        return Err(e).context("Migration failed");
    }

    if let Some(dir) = &config.defaults_dir {
        let applied = match load_defaults(dir) {
            Ok(sources) => ensure_defaults(client.clone(), &namespace, &sources).await,
            Err(e) => Err(e),
        };
        if let Err(e) = applied {
            error!(error = %e, "Failed to ensure default OperatorSources");
            reporter.report_failure(&e).await;
            return Err(e).context("Failed to ensure default OperatorSources");
        }
    }

    let (sync_health, materializer_health, observer) = health_channels();
    let done = reporter.start_reporting(observer, shutdown.clone());

    let registry = HttpRegistryClient::with_config(RegistryClientConfig {
        request_timeout: config.syncer.fetch_timeout,
        ..RegistryClientConfig::default()
    })
    .context("Failed to build registry client")?;

    let syncer = RegistrySyncer::new(
        Arc::new(registry),
        Arc::new(KubeSourceStore::new(client.clone(), &namespace)),
        clock.clone(),
        config.syncer.clone(),
        sync_health,
    );
    let (notifier, notifications) = notification_channel();

    let sync_task = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { syncer.sync(shutdown, notifications).await })
    };

    let watch_task = {
        let client = client.clone();
        let namespace = namespace.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { watch_sources(client, &namespace, notifier, shutdown).await })
    };

    let materializer_result = run_materializer(
        client,
        &namespace,
        config.materializer.clone(),
        clock,
        materializer_health,
        shutdown.clone(),
    )
    .await;

    if let Err(e) = &materializer_result {
        shutdown.fail(e);
    } else if !shutdown.is_cancelled() {
        shutdown.fail("materializer controller exited unexpectedly");
    }

    let _ = sync_task.await;
    let _ = watch_task.await;

    // The final status write must land before the process exits
    done.wait().await;

    match shutdown.failure() {
        Some(failure) => anyhow::bail!("Operator stopped on error: {}", failure),
        None => {
            info!("Marketplace Operator stopped");
            Ok(())
        }
    }
}

/// Initialize logging subsystem
fn init_logging(args: &Args) -> Result<()> {
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(args.log_level)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(true)
        .with_thread_ids(false)
        .with_line_number(false);

    if args.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    Ok(())
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
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
            info!("Received Ctrl+C");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }
}

/// Start the Prometheus metrics server
async fn start_metrics_server(addr: SocketAddr) -> Result<()> {
    use metrics_exporter_prometheus::PrometheusBuilder;

    info!(address = %addr, "Starting metrics server");

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;

    std::future::pending::<()>().await;

    Ok(())
}

/// Start the health probe server
async fn start_health_server(addr: SocketAddr) -> Result<()> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    info!(address = %addr, "Starting health server");

    let listener = TcpListener::bind(addr)
        .await
        .context("Failed to bind health server")?;

    loop {
        let (mut socket, _) = listener.accept().await?;

        tokio::spawn(async move {
            let mut buf = [0; 1024];
            if socket.read(&mut buf).await.is_ok() {
                let response = "HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nOK";
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });
    }
}

/// Print the YAML of every CRD the operator owns
fn print_crds() -> Result<()> {
    use kube::CustomResourceExt;
    use marketplace_operator::crd::{CatalogSourceConfig, MigrationRecord, OperatorSource};

    for crd in [
        OperatorSource::crd(),
        CatalogSourceConfig::crd(),
        MigrationRecord::crd(),
    ] {
        println!("---");
        print!("{}", serde_yaml::to_string(&crd)?);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_args() {
        let args = Args::parse_from(["marketplace-operator"]);
        let config = args.operator_config();

        assert_eq!(config.namespace, DEFAULT_NAMESPACE);
        assert_eq!(config.syncer.initial_wait, Duration::from_secs(60));
        assert_eq!(config.syncer.resync_interval, Duration::from_secs(3600));
        assert_eq!(config.reporter.failure_threshold, 3);
        assert_eq!(args.metrics_addr.port(), 8383);
    }

    #[test]
    fn test_timing_flags() {
        let args = Args::parse_from([
            "marketplace-operator",
            "--resync-interval-secs",
            "120",
            "--api-timeout-secs",
            "5",
            "--registry-server-image",
            "registry.local/server:1",
        ]);
        let config = args.operator_config();

        assert_eq!(config.syncer.resync_interval, Duration::from_secs(120));
        assert_eq!(config.materializer.api_timeout, Duration::from_secs(5));
        assert_eq!(config.reporter.api_timeout, Duration::from_secs(5));
        assert_eq!(
            config.materializer.registry_server_image,
            "registry.local/server:1"
        );
    }

    #[test]
    fn test_zero_periods_rejected() {
        for flag in [
            "--resync-interval-secs",
            "--report-interval-secs",
            "--failure-threshold",
            "--fetch-timeout-secs",
            "--api-timeout-secs",
        ] {
            let result = Args::try_parse_from(["marketplace-operator", flag, "0"]);
            assert!(result.is_err(), "{} accepted 0", flag);
        }

        // Zero grace period and debounce window are meaningful
        let args = Args::parse_from([
            "marketplace-operator",
            "--initial-wait-secs",
            "0",
            "--debounce-window-secs",
            "0",
        ]);
        assert_eq!(args.operator_config().syncer.initial_wait, Duration::ZERO);
    }
}
