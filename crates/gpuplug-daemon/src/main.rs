//! gpuplug daemon
//!
//! Discovers GPUs, classifies them into resource pools, watches their health
//! and serves allocation hints over HTTP.

use anyhow::Context;
use clap::Parser;
use gpuplug_api::create_router;
use gpuplug_core::{LoggingConfig, MigStrategy, PluginConfig};
use gpuplug_nvml::DeviceLib;
use gpuplug_rm::{add_default_resources, build_resource_managers, ResourceManager};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// gpuplug daemon - GPU device plugin for container orchestrators
#[derive(Parser, Debug)]
#[command(name = "gpuplugd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to a TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Partition strategy: none, single or mixed
    #[arg(long)]
    mig_strategy: Option<MigStrategy>,

    /// Fail when the GPU library cannot be initialized
    #[arg(long)]
    fail_on_init_error: Option<bool>,

    /// Address to bind the API server
    #[arg(long)]
    address: Option<String>,

    /// Port for the REST API server
    #[arg(long)]
    port: Option<u16>,

    /// Log level
    #[arg(long)]
    log_level: Option<String>,
}

impl Args {
    /// Load the config file, if any, and apply command line overrides
    fn into_config(self) -> anyhow::Result<PluginConfig> {
        let mut config = match &self.config {
            Some(path) => PluginConfig::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => PluginConfig::default(),
        };

        if let Some(strategy) = self.mig_strategy {
            config.flags.mig_strategy = strategy;
        }
        if let Some(fail) = self.fail_on_init_error {
            config.flags.fail_on_init_error = fail;
        }
        if let Some(address) = self.address {
            config.api.address = address;
        }
        if let Some(port) = self.port {
            config.api.port = port;
        }
        if let Some(level) = self.log_level {
            config.logging.level = level;
        }

        Ok(config)
    }
}

fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let log_level = match config.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let builder = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false);

    match &config.file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            let subscriber = builder.with_ansi(false).with_writer(Mutex::new(file)).finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
        None => tracing::subscriber::set_global_default(builder.finish())?,
    }

    Ok(())
}

#[cfg(feature = "nvml")]
fn device_lib() -> Arc<dyn DeviceLib> {
    Arc::new(gpuplug_nvml::NvmlLib)
}

#[cfg(not(feature = "nvml"))]
fn device_lib() -> Arc<dyn DeviceLib> {
    Arc::new(gpuplug_nvml::NullDeviceLib)
}

/// Start one health monitor per manager, all feeding `unhealthy`
fn spawn_monitors(
    managers: &[ResourceManager],
    stop: &CancellationToken,
    unhealthy: mpsc::Sender<Arc<gpuplug_core::Device>>,
) -> Vec<JoinHandle<()>> {
    managers
        .iter()
        .cloned()
        .map(|rm| {
            let stop = stop.clone();
            let unhealthy = unhealthy.clone();
            tokio::spawn(async move {
                match rm.check_health(stop, unhealthy).await {
                    Ok(()) => info!(resource = %rm.resource(), "Health monitor stopped"),
                    Err(e) => {
                        error!(resource = %rm.resource(), error = %e, "Health monitor failed")
                    }
                }
            })
        })
        .collect()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut config = args.into_config()?;

    init_logging(&config.logging)?;

    info!("Starting gpuplug daemon v{}", env!("CARGO_PKG_VERSION"));

    let lib = device_lib();
    info!(
        backend = lib.name(),
        mig_strategy = %config.flags.mig_strategy,
        "Using device library"
    );

    add_default_resources(&mut config, lib.as_ref()).context("installing default resources")?;
    let managers =
        build_resource_managers(&config, lib.clone()).context("building resource managers")?;

    if managers.is_empty() {
        warn!("No devices found; serving an empty inventory");
    }
    for rm in &managers {
        info!(resource = %rm.resource(), devices = rm.devices().len(), "Registered resource");
    }

    let stop = CancellationToken::new();
    let (tx, mut rx) = mpsc::channel(managers.len().max(1) * 8);
    let monitors = spawn_monitors(&managers, &stop, tx);

    let reporter = tokio::spawn(async move {
        while let Some(device) = rx.recv().await {
            warn!(
                device = device.id(),
                index = %device.index(),
                model = device.model(),
                "Device marked unhealthy"
            );
        }
    });

    let router = create_router(managers);

    let addr: SocketAddr = format!("{}:{}", config.api.address, config.api.port)
        .parse()
        .context("invalid API address")?;

    info!("API server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for shutdown signal");
            }
            info!("Shutting down");
        })
        .await
        .context("server error")?;

    stop.cancel();
    for monitor in monitors {
        if let Err(e) = monitor.await {
            error!(error = %e, "Health monitor task panicked");
        }
    }
    let _ = reporter.await;

    info!("gpuplug daemon stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_config() {
        let args = Args::parse_from([
            "gpuplugd",
            "--mig-strategy",
            "mixed",
            "--fail-on-init-error",
            "false",
            "--port",
            "9200",
        ]);
        let config = args.into_config().unwrap();

        assert_eq!(config.flags.mig_strategy, MigStrategy::Mixed);
        assert!(!config.flags.fail_on_init_error);
        assert_eq!(config.api.port, 9200);
        assert_eq!(config.api.address, "127.0.0.1");
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_invalid_strategy_rejected() {
        let result = Args::try_parse_from(["gpuplugd", "--mig-strategy", "sometimes"]);
        assert!(result.is_err());
    }
}
