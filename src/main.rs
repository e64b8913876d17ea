//! Telemetry bridge daemon
//!
//! ## Configuration
//!
//! An optional TOML file named by `BRIDGE_CONFIG` (or the first argument),
//! then `BRIDGE_*` environment overrides. See `telemetry_bridge::config`.
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | BRIDGE_BROKER_HOST | localhost | MQTT broker host |
//! | BRIDGE_BROKER_PORT | 1883 | MQTT broker port |
//! | BRIDGE_TOPIC_PATTERN | sensores/# | Subscription filter |
//! | BRIDGE_LOG_PATH | mqtt_logs.txt | Durable log file |
//! | BRIDGE_STORE_ENDPOINT | http://127.0.0.1:5001/api/v0 | IPFS HTTP API |
//! | BRIDGE_GATEWAY_URL | http://localhost:8080 | Gateway for access URLs |
//! | BRIDGE_UPLOAD_INTERVAL_SECS | 30 | Upload period |
//! | BRIDGE_FSYNC | always | always, everysec or no |
//! | BRIDGE_LOG_FORMAT | pretty | pretty or json |

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use std::path::PathBuf;
use std::sync::Arc;
use telemetry_bridge::config::CONFIG_PATH_ENV;
use telemetry_bridge::ingress::MqttTransport;
use telemetry_bridge::log::LocalLogStore;
use telemetry_bridge::observability::init_tracing;
use telemetry_bridge::{BridgeConfig, IpfsHttpStore, Pipeline, PipelineConfig};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config_path = std::env::var(CONFIG_PATH_ENV)
        .ok()
        .or_else(|| std::env::args().nth(1))
        .map(PathBuf::from);
    let config = BridgeConfig::load(config_path.as_deref())?;

    if let Err(e) = init_tracing(config.log_format) {
        eprintln!("tracing already initialised: {}", e);
    }

    info!(
        broker = %format!("{}:{}", config.broker_host, config.broker_port),
        topic = %config.topic_pattern,
        log = %config.log_path.display(),
        store = %config.store_endpoint,
        fsync = %config.fsync,
        "Telemetry bridge starting"
    );

    let transport = MqttTransport::new(config.mqtt_config());
    let store = IpfsHttpStore::new(
        config.store_endpoint.clone(),
        config.gateway_url.clone(),
        std::time::Duration::from_secs(config.upload_timeout_seconds),
    )?;
    let (log_store, _) = LocalLogStore::for_file(&config.log_path)?;

    let pipeline = Pipeline::start(
        PipelineConfig::from(&config),
        transport,
        Arc::new(store),
        log_store,
    )?;

    let mut results = pipeline.uploader().subscribe_results();
    tokio::spawn(async move {
        loop {
            match results.recv().await {
                Ok(Ok(result)) => {
                    println!("CID: {}", result.content_id);
                    println!("URL: {}", result.access_url);
                }
                Ok(Err(_)) => {}
                Err(RecvError::Lagged(missed)) => warn!(missed, "Upload reporter fell behind"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let stats = pipeline.run_until(shutdown_signal()).await;
    info!(
        appended = stats.subscriber.appended,
        uploads = stats.uploader.succeeded,
        "Telemetry bridge stopped"
    );
    Ok(())
}

/// Ctrl-C, or SIGTERM on unix
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
