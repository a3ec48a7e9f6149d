//! # vbox-cloud Driver
//!
//! Cloud-compute control plane for a single VirtualBox host.
//!
//! This crate exposes images, instances, storage volumes, hardware profiles
//! and realms over a local VirtualBox installation, driven entirely through
//! the `VBoxManage` command-line tool.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │           CloudDriver Trait             │
//! │ (list_instances, create_instance, ...)  │
//! └─────────────────────┬───────────────────┘
//!                       │
//!                       ▼
//!             ┌───────────────────┐
//!             │ VirtualBoxDriver  │──► Translator ──► boot_disk / volume /
//!             └─────────┬─────────┘                   profiles / state
//!                       │
//!                       ▼
//!             ┌───────────────────┐
//!             │    VBoxManage     │  timeouts, run vs. query
//!             └─────────┬─────────┘
//!                       │ CommandExecutor
//!         ┌─────────────┴─────────────┐
//!         ▼                           ▼
//! ┌───────────────────┐     ┌───────────────────┐
//! │ VBoxManageExecutor│     │  MockVBoxManage   │
//! │  (real process)   │     │   (in-memory)     │
//! └───────────────────┘     └───────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use vbox_cloud_driver::*;
//!
//! #[tokio::main]
//! async fn main() {
//!     let vbox = VBoxManage::new(Arc::new(MockVBoxManage::new()), CommandTimeouts::default());
//!     let driver = VirtualBoxDriver::new(vbox, HardwareProfileCatalog::default(), DriverConfig::default());
//!
//!     let creds = Credentials::default();
//!     let images = driver.list_images(&creds, &DriverOptions::new()).await.unwrap();
//!     let instance = driver
//!         .create_instance(&creds, &images[0].id, &DriverOptions::new().with_hwp_id("small"))
//!         .await
//!         .unwrap();
//!
//!     driver.wait_for_provisioning(&instance.id).await;
//! }
//! ```

pub mod attributes;
pub mod boot_disk;
pub mod cloudinit;
pub mod command;
pub mod error;
pub mod mock;
pub mod profiles;
pub mod provision;
pub mod state;
pub mod traits;
pub mod translate;
pub mod types;
pub mod virtualbox;
pub mod volume;

pub use attributes::RawAttributes;
pub use cloudinit::{CloudInitConfig, CloudInitGenerator, IsoTool};
pub use command::{CommandExecutor, CommandTimeouts, ToolOutput, VBoxManage, VBoxManageExecutor};
pub use error::{DriverError, Result};
pub use mock::MockVBoxManage;
pub use profiles::{HardwareProfile, HardwareProfileCatalog};
pub use provision::ProvisionStatus;
pub use state::{InstanceAction, InstanceState};
pub use traits::CloudDriver;
pub use types::*;
pub use virtualbox::{DriverConfig, VirtualBoxDriver};
