//! Signet - firmware update tooling
//!
//! Operator commands around the update stack: bridge probing, offline
//! upgrade resolution and release verification.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::de::DeserializeOwned;
use signet_core::{
    ComponentUpdateInfo, DeviceType, FeatureSnapshot, FirmwareComponent, FirmwareType,
    ReleaseDescriptor,
};
use signet_transport::{BridgeClient, BRIDGE_PROBE_TIMEOUT};
use signet_update::backend::UNCHANGED_VERSION;
use signet_update::{
    load_config, save_default_config, HttpReleaseBackend, ReleaseBackend, VerifyRequest,
};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "signet")]
#[command(about = "Firmware update tooling for Signet hardware wallets")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "signet.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check whether the bridge daemon answers and list its devices
    ProbeBridge,
    /// Decide whether a component needs an upgrade from saved JSON inputs
    Resolve {
        #[arg(long, value_parser = parse_enum::<FirmwareComponent>)]
        component: FirmwareComponent,
        /// Release descriptor JSON
        #[arg(long)]
        release: PathBuf,
        /// Feature snapshot JSON
        #[arg(long)]
        snapshot: PathBuf,
    },
    /// Ask the release backend for verified download links
    Verify {
        #[arg(long, value_parser = parse_enum::<DeviceType>)]
        device_type: DeviceType,
        #[arg(long, default_value = UNCHANGED_VERSION)]
        firmware: String,
        #[arg(long, default_value = UNCHANGED_VERSION)]
        ble: String,
        #[arg(long, default_value = UNCHANGED_VERSION)]
        bootloader: String,
        #[arg(long, default_value = "universal", value_parser = parse_enum::<FirmwareType>)]
        firmware_type: FirmwareType,
    },
    /// Write a default configuration file
    InitConfig,
}

/// Parse a snake_case enum name through its serde representation
fn parse_enum<T: DeserializeOwned>(s: &str) -> std::result::Result<T, String> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|_| format!("unknown value '{}'", s))
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Signet v{}", env!("CARGO_PKG_VERSION"));

    if let Command::InitConfig = args.command {
        save_default_config(&args.config)?;
        info!("Wrote default configuration to {:?}", args.config);
        return Ok(());
    }

    let config = load_config(&args.config)?;

    match args.command {
        Command::ProbeBridge => {
            let client = BridgeClient::new(&config.transport.bridge_url, BRIDGE_PROBE_TIMEOUT)?;
            match client.enumerate().await {
                Ok(devices) => {
                    info!(count = devices.len(), "Bridge reachable");
                    println!("{}", serde_json::to_string_pretty(&devices)?);
                }
                Err(e) => {
                    println!("Bridge unreachable at {}: {}", client.enumerate_url(), e);
                }
            }
        }
        Command::Resolve {
            component,
            release,
            snapshot,
        } => {
            let descriptor: ReleaseDescriptor = read_json(&release)?;
            let snapshot: FeatureSnapshot = read_json(&snapshot)?;
            let info =
                ComponentUpdateInfo::new(component, &snapshot, descriptor, &config.dev.overrides);
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
        Command::Verify {
            device_type,
            firmware,
            ble,
            bootloader,
            firmware_type,
        } => {
            let backend = HttpReleaseBackend::new(
                config.backend.url.clone(),
                Duration::from_secs(config.backend.timeout_secs),
            )?;
            let request = VerifyRequest {
                device_type,
                firmware_version: firmware,
                ble_version: ble,
                bootloader_version: bootloader,
                firmware_type,
            };
            let infos = backend.fetch_verified_version_info(&request).await?;
            println!("{}", serde_json::to_string_pretty(&infos)?);
        }
        Command::InitConfig => {}
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verify_defaults_to_unchanged_versions() {
        let args = Args::try_parse_from(["signet", "verify", "--device-type", "pro"]).unwrap();
        match args.command {
            Command::Verify {
                device_type,
                firmware,
                ble,
                bootloader,
                firmware_type,
            } => {
                assert_eq!(device_type, DeviceType::Pro);
                assert_eq!(firmware, UNCHANGED_VERSION);
                assert_eq!(ble, UNCHANGED_VERSION);
                assert_eq!(bootloader, UNCHANGED_VERSION);
                assert_eq!(firmware_type, FirmwareType::Universal);
            }
            other => panic!("unexpected command {:?}", other),
        }
        assert_eq!(args.config, PathBuf::from("signet.toml"));
    }

    #[test]
    fn test_unknown_component_rejected() {
        assert!(parse_enum::<FirmwareComponent>("ble").is_ok());
        assert!(Args::try_parse_from([
            "signet",
            "resolve",
            "--component",
            "radio",
            "--release",
            "r.json",
            "--snapshot",
            "s.json",
        ])
        .is_err());
    }
}
