//! # vbox-cloud
//!
//! Operator CLI for a VirtualBox host exposed as a small cloud: images,
//! instances, storage volumes, hardware profiles and realms.
//!
//! ## Usage
//! ```bash
//! vbox-cloud images
//! vbox-cloud create --image <image-id> --hwp small --user-data-file user-data.yaml
//! vbox-cloud instances --state running
//! vbox-cloud --dev profiles
//! ```

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};

mod cli;
mod commands;
mod config;

use cli::Args;
use config::{Config, ExecutorBackend, DEFAULT_CONFIG_PATH};
use vbox_cloud_driver::{
    CommandExecutor, MockVBoxManage, VBoxManage, VBoxManageExecutor, VirtualBoxDriver,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let args = Args::parse();

    // Load configuration before logging so the file can set the level
    let (config, source) = load_config(&args)?;
    let config = config.with_cli_overrides(&args);

    vbox_cloud_common::init_logging_with(&config.logging.level, config.logging.format.into())?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %source,
        "Starting vbox-cloud"
    );

    let driver = build_driver(&config)?;

    let mut stdout = std::io::stdout().lock();
    if let Err(e) = commands::run(&driver, args.command, &mut stdout).await {
        error!(error = %e, "Command failed");
        return Err(e);
    }

    Ok(())
}

/// Explicit `--config` must load; the default location is optional.
fn load_config(args: &Args) -> Result<(Config, String)> {
    match &args.config {
        Some(path) => Ok((Config::load(path)?, path.clone())),
        None => match Config::load(DEFAULT_CONFIG_PATH) {
            Ok(config) => Ok((config, DEFAULT_CONFIG_PATH.to_string())),
            Err(_) => Ok((Config::default(), "defaults".to_string())),
        },
    }
}

fn build_driver(config: &Config) -> Result<VirtualBoxDriver> {
    let executor: Arc<dyn CommandExecutor> = match config.driver.backend {
        ExecutorBackend::Mock => {
            info!("Using in-memory VirtualBox");
            let mock = MockVBoxManage::new();
            mock.add_vm_with_disk("ubuntu-22.04", 2, 2048, 10240);
            mock.add_vm_with_disk("debian-12", 1, 1024, 8192);
            Arc::new(mock)
        }
        ExecutorBackend::Vboxmanage => {
            info!(path = %config.driver.vboxmanage_path, "Using VBoxManage");
            Arc::new(VBoxManageExecutor::new(&config.driver.vboxmanage_path))
        }
    };

    let vbox = VBoxManage::new(executor, config.timeouts());
    Ok(VirtualBoxDriver::new(vbox, config.catalog()?, config.driver_config()))
}
