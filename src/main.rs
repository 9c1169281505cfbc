use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use lora_joinserver::config::Config;
use lora_joinserver::registry::memory::{MemoryDeviceRegistry, MemoryKeyRegistry};
use lora_joinserver::registry::DeviceRegistry;
use lora_joinserver::server::{JoinServer, JoinServerConfig};
use lora_joinserver::udp;

#[derive(Parser)]
#[command(name = "lora-joinserver")]
#[command(about = "LoRaWAN Join Server: OTAA activation and session key derivation")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = Config::load(&cli.config).unwrap_or_else(|e| {
        eprintln!("Warning: Failed to load config from {:?}: {}", cli.config, e);
        eprintln!("Using default configuration");
        Config::default()
    });

    // Initialize tracing/logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .init();

    info!("lora-joinserver v{}", env!("CARGO_PKG_VERSION"));

    let js_config: JoinServerConfig = config.join_server_config()?;
    if js_config.join_eui_prefixes.is_empty() {
        warn!("No JoinEUI prefixes configured; every join will be rejected");
    }
    if config.server.cluster_auth_token.is_empty() {
        warn!("No cluster auth token configured; every caller will be rejected");
    }

    let devices = Arc::new(MemoryDeviceRegistry::new());
    let keys = Arc::new(MemoryKeyRegistry::new());
    warn!("Using in-memory registries; device and session state is not persisted");

    provision_devices(&config, devices.as_ref()).await?;

    let server = Arc::new(JoinServer::new(js_config, devices, keys));
    udp::run_server(&config, server).await
}

/// Creates the statically configured devices through the registry's
/// create path. Existing records are left untouched.
async fn provision_devices(
    config: &Config,
    devices: &MemoryDeviceRegistry,
) -> anyhow::Result<()> {
    for entry in &config.devices {
        let device = entry.to_end_device(Utc::now())?;
        let (join_eui, dev_eui) = (device.ids.join_eui, device.ids.dev_eui);
        devices
            .set_by_eui(
                join_eui,
                dev_eui,
                Box::new(move |existing| Ok(existing.unwrap_or(device))),
            )
            .await
            .map_err(|e| anyhow::anyhow!("failed to provision {:016X}: {}", dev_eui, e))?;
        info!(
            "provisioned device JoinEUI={:016X} DevEUI={:016X}",
            join_eui, dev_eui
        );
    }
    Ok(())
}
