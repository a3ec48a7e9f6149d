//! Cloud-init NoCloud media synthesis.
//!
//! VirtualBox has no metadata service, so guest bootstrap data is delivered
//! the NoCloud way: an ISO labelled `cidata` holding `meta-data` and
//! `user-data`, attached to the VM as a DVD.
//!
//! Attaching is best-effort. An IDE controller is reused if the VM has one
//! (created otherwise) and the ISO goes into the first empty slot. A VM with
//! no free slot keeps booting without bootstrap data.
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! let config = CloudInitConfig::new(&vm_id, "web-01")
//!     .with_user_data("#cloud-config\npackages:\n  - nginx");
//!
//! let iso = CloudInitGenerator::new()
//!     .generate_iso(&config, media_dir, Duration::from_secs(60))
//!     .await?;
//! attach_seed_media(&vbox, &vm_id, &iso).await?;
//! ```

use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;

use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::{debug, info, instrument, warn};

use crate::boot_disk::{attachment_slots, storage_controllers, StorageController};
use crate::command::VBoxManage;
use crate::error::{DriverError, Result};

/// Volume label the NoCloud datasource looks for.
pub const CIDATA_LABEL: &str = "cidata";

/// Controller chipsets that make a controller IDE-class.
pub const IDE_CONTROLLER_TYPES: &[&str] = &["PIIX3", "PIIX4", "ICH6"];

/// Name given to an IDE controller created for the seed ISO.
pub const SEED_CONTROLLER_NAME: &str = "IDE Controller";

/// Cloud-init configuration for one VM.
#[derive(Debug, Clone, Default)]
pub struct CloudInitConfig {
    /// Unique instance ID (the VM UUID)
    pub instance_id: String,

    /// Hostname for the VM
    pub hostname: String,

    /// Raw user-data, passed through untouched
    pub user_data: String,
}

impl CloudInitConfig {
    pub fn new(instance_id: impl Into<String>, hostname: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            hostname: hostname.into(),
            ..Default::default()
        }
    }

    pub fn with_user_data(mut self, user_data: impl Into<String>) -> Self {
        self.user_data = user_data.into();
        self
    }

    /// Generate meta-data content.
    pub fn generate_meta_data(&self) -> String {
        format!(
            "instance-id: {}\nlocal-hostname: {}\n",
            self.instance_id,
            sanitize_hostname(&self.hostname)
        )
    }
}

/// Reduce a VM display name to a valid hostname label.
pub fn sanitize_hostname(name: &str) -> String {
    let mut label = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            label.push(c.to_ascii_lowercase());
        } else if !label.ends_with('-') {
            label.push('-');
        }
    }

    let label = label.trim_matches('-');
    if label.is_empty() {
        "localhost".to_string()
    } else {
        label.chars().take(63).collect()
    }
}

/// Write `meta-data` and `user-data` into `dir`.
pub fn write_seed_files(config: &CloudInitConfig, dir: &Path) -> Result<()> {
    let meta_data = config.generate_meta_data();
    std::fs::write(dir.join("meta-data"), &meta_data)
        .map_err(|e| DriverError::CloudInit(format!("Failed to write meta-data: {}", e)))?;
    debug!(content = %meta_data, "Wrote meta-data");

    std::fs::write(dir.join("user-data"), &config.user_data)
        .map_err(|e| DriverError::CloudInit(format!("Failed to write user-data: {}", e)))?;
    debug!(bytes = config.user_data.len(), "Wrote user-data");

    Ok(())
}

/// ISO authoring tool available on this platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IsoTool {
    /// genisoimage, mkisofs or xorrisofs (shared flag set)
    Mkisofs(String),
    /// macOS `hdiutil makehybrid`
    Hdiutil,
}

/// Bound for each `--version` probe during tool detection.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Run an external tool to completion, killing it if it outlives `timeout`.
pub async fn run_tool(mut cmd: Command, timeout: Duration) -> Result<Output> {
    let program = cmd.as_std().get_program().to_string_lossy().to_string();

    let child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| DriverError::CloudInit(format!("Failed to run {}: {}", program, e)))?;

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(e)) => Err(DriverError::CloudInit(format!("{} failed: {}", program, e))),
        Err(_) => {
            warn!(tool = %program, timeout_secs = timeout.as_secs(), "ISO tool timed out");
            Err(DriverError::Timeout {
                command: program,
                timeout,
            })
        }
    }
}

/// Generator for cloud-init NoCloud ISO images.
///
/// The authoring tool is detected on first use, not at construction.
#[derive(Default)]
pub struct CloudInitGenerator {
    iso_tool: OnceCell<IsoTool>,
}

impl CloudInitGenerator {
    /// Create a generator that picks the first ISO tool found on this host.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a generator with an explicit tool.
    pub fn with_tool(iso_tool: IsoTool) -> Self {
        Self {
            iso_tool: OnceCell::from(iso_tool),
        }
    }

    /// The tool in use, probing the host the first time.
    pub async fn iso_tool(&self) -> &IsoTool {
        self.iso_tool.get_or_init(find_iso_tool).await
    }

    fn iso_command(iso_tool: &IsoTool, iso_path: &Path, source_dir: &Path) -> Command {
        match iso_tool {
            IsoTool::Mkisofs(tool) => {
                let mut cmd = Command::new(tool);
                cmd.arg("-o")
                    .arg(iso_path)
                    .args(["-V", CIDATA_LABEL, "-J", "-r"])
                    .arg(source_dir);
                cmd
            }
            IsoTool::Hdiutil => {
                let mut cmd = Command::new("hdiutil");
                cmd.args(["makehybrid", "-iso", "-joliet", "-default-volume-name", CIDATA_LABEL, "-o"])
                    .arg(iso_path)
                    .arg(source_dir);
                cmd
            }
        }
    }

    /// Build `<output_dir>/<instance_id>-cidata.iso`, giving the tool at
    /// most `timeout`.
    #[instrument(skip(self, config), fields(instance_id = %config.instance_id))]
    pub async fn generate_iso(&self, config: &CloudInitConfig, output_dir: &Path, timeout: Duration) -> Result<PathBuf> {
        info!("Generating cloud-init ISO");

        let temp_dir = tempfile::tempdir()
            .map_err(|e| DriverError::CloudInit(format!("Failed to create temp dir: {}", e)))?;
        write_seed_files(config, temp_dir.path())?;

        std::fs::create_dir_all(output_dir)
            .map_err(|e| DriverError::CloudInit(format!("Failed to create output dir: {}", e)))?;

        let iso_path = output_dir.join(format!("{}-{}.iso", config.instance_id, CIDATA_LABEL));
        if iso_path.exists() {
            // hdiutil refuses to overwrite
            std::fs::remove_file(&iso_path)
                .map_err(|e| DriverError::CloudInit(format!("Failed to replace old ISO: {}", e)))?;
        }

        let iso_tool = self.iso_tool().await;
        let output = run_tool(Self::iso_command(iso_tool, &iso_path, temp_dir.path()), timeout).await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DriverError::CloudInit(format!("ISO generation failed: {}", stderr)));
        }

        info!(path = %iso_path.display(), "Cloud-init ISO generated");
        Ok(iso_path)
    }
}

async fn find_iso_tool() -> IsoTool {
    if cfg!(target_os = "macos") {
        return IsoTool::Hdiutil;
    }

    for tool in ["genisoimage", "mkisofs", "xorrisofs"] {
        let mut probe = Command::new(tool);
        probe.arg("--version");
        if run_tool(probe, PROBE_TIMEOUT).await.is_ok() {
            debug!(tool, "Found ISO tool");
            return IsoTool::Mkisofs(tool.to_string());
        }
    }

    // Fails later with a clear error if missing
    IsoTool::Mkisofs("genisoimage".to_string())
}

/// Where a seed ISO ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeedAttachment {
    pub controller: String,
    pub port: u32,
    pub device: u32,
}

fn is_ide_controller(controller: &StorageController) -> bool {
    controller
        .controller_type
        .as_deref()
        .is_some_and(|t| IDE_CONTROLLER_TYPES.iter().any(|ide| ide.eq_ignore_ascii_case(t)))
}

/// Attach `iso_path` as a read-only DVD in the first free IDE slot.
///
/// Returns `Ok(None)` when the IDE controller has no free slot.
#[instrument(skip(vbox), fields(vm_id = %vm_id, iso = %iso_path.display()))]
pub async fn attach_seed_media(vbox: &VBoxManage, vm_id: &str, iso_path: &Path) -> Result<Option<SeedAttachment>> {
    let raw = vbox
        .vm_info(vm_id)
        .await?
        .ok_or_else(|| DriverError::NotFound(format!("VM {}", vm_id)))?;

    let raw = match storage_controllers(&raw).into_iter().find(is_ide_controller) {
        Some(_) => raw,
        None => {
            info!("No IDE controller, adding one for the seed ISO");
            vbox.run(&[
                "storagectl", vm_id,
                "--name", SEED_CONTROLLER_NAME,
                "--add", "ide",
                "--controller", "PIIX4",
            ])
            .await?;

            vbox.vm_info(vm_id)
                .await?
                .ok_or_else(|| DriverError::NotFound(format!("VM {}", vm_id)))?
        }
    };

    let Some(controller) = storage_controllers(&raw).into_iter().find(is_ide_controller) else {
        warn!("IDE controller not visible after creation, skipping seed ISO");
        return Ok(None);
    };

    let Some(slot) = attachment_slots(&raw, &controller)
        .into_iter()
        .find(|slot| slot.medium.is_none())
    else {
        warn!(controller = %controller.name, "No free IDE slot, skipping seed ISO");
        return Ok(None);
    };

    let port = slot.port.to_string();
    let device = slot.device.to_string();
    let medium = iso_path.to_string_lossy().to_string();
    vbox.run(&[
        "storageattach", vm_id,
        "--storagectl", controller.name.as_str(),
        "--port", port.as_str(),
        "--device", device.as_str(),
        "--type", "dvddrive",
        "--medium", medium.as_str(),
    ])
    .await?;

    info!(controller = %controller.name, port = slot.port, device = slot.device, "Seed ISO attached");

    Ok(Some(SeedAttachment {
        controller: controller.name,
        port: slot.port,
        device: slot.device,
    }))
}
