//! The VirtualBox cloud driver.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use super::provision_job::{ProvisionJob, SeedRequest};
use crate::boot_disk::resolve_boot_disk;
use crate::cloudinit::{CloudInitConfig, CloudInitGenerator, CIDATA_LABEL};
use crate::command::VBoxManage;
use crate::error::{DriverError, Result};
use crate::profiles::{HardwareProfile, HardwareProfileCatalog};
use crate::provision::{ProvisionStatus, ProvisionTracker};
use crate::state::{is_allowed, InstanceAction, InstanceState};
use crate::traits::CloudDriver;
use crate::translate::{InstanceView, Translator, ORIGIN_IMAGE_KEY};
use crate::types::*;
use crate::volume::translate_volume;

/// Video memory given to every new VM.
const VRAM_MB: &str = "16";

/// Polls of `SessionState` after a power-off before unregistering anyway.
const SESSION_RELEASE_POLLS: u32 = 20;
const SESSION_RELEASE_INTERVAL: Duration = Duration::from_millis(250);

/// Host-level settings the driver applies to new instances.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Reported as `owner_id` on every record
    pub owner: String,
    /// Host interface bridged to NIC 1
    pub bridge_adapter: String,
    /// `--ostype` for new VMs
    pub os_type: String,
    /// Where cloud-init ISOs are written
    pub media_dir: PathBuf,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            owner: default_owner(),
            bridge_adapter: "eth0".to_string(),
            os_type: "Linux".to_string(),
            media_dir: std::env::temp_dir().join("vbox-cloud"),
        }
    }
}

/// `$USER`, then `$USERNAME`, then `nobody`.
fn default_owner() -> String {
    owner_from(|var| std::env::var(var).ok())
}

fn owner_from(lookup: impl Fn(&str) -> Option<String>) -> String {
    ["USER", "USERNAME"]
        .into_iter()
        .find_map(|var| lookup(var).filter(|v| !v.is_empty()))
        .unwrap_or_else(|| "nobody".to_string())
}

/// Cloud driver backed by a local VirtualBox installation.
///
/// Stateless with respect to VirtualBox: every read re-queries VBoxManage.
/// The only state held here is the registry of background provisioning
/// tasks.
pub struct VirtualBoxDriver {
    vbox: VBoxManage,
    catalog: HardwareProfileCatalog,
    config: DriverConfig,
    tracker: ProvisionTracker,
    iso_generator: Arc<CloudInitGenerator>,
}

impl VirtualBoxDriver {
    pub fn new(vbox: VBoxManage, catalog: HardwareProfileCatalog, config: DriverConfig) -> Self {
        info!(
            owner = %config.owner,
            architecture = %catalog.architecture(),
            profiles = catalog.profiles().len(),
            "Creating VirtualBox driver"
        );

        Self {
            vbox,
            catalog,
            config,
            tracker: ProvisionTracker::new(),
            iso_generator: Arc::new(CloudInitGenerator::new()),
        }
    }

    /// Use a specific cloud-init ISO generator.
    pub fn with_iso_generator(mut self, generator: CloudInitGenerator) -> Self {
        self.iso_generator = Arc::new(generator);
        self
    }

    pub fn catalog(&self) -> &HardwareProfileCatalog {
        &self.catalog
    }

    /// Status of the background provisioning of `instance_id`.
    ///
    /// `None` for instances this driver did not create.
    pub async fn provision_status(&self, instance_id: &str) -> Option<ProvisionStatus> {
        self.tracker.status(instance_id).await
    }

    /// Wait for the background provisioning of `instance_id` to finish.
    pub async fn wait_for_provisioning(&self, instance_id: &str) -> Option<ProvisionStatus> {
        self.tracker.wait(instance_id).await
    }

    fn translator(&self) -> Translator<'_> {
        Translator::new(&self.vbox, &self.catalog, &self.config.owner)
    }

    async fn require_instance(&self, instance_id: &str) -> Result<InstanceView> {
        self.translator()
            .instance(instance_id)
            .await?
            .ok_or_else(|| DriverError::NotFound(format!("instance {}", instance_id)))
    }

    fn check_action(instance: &Instance, action: InstanceAction) -> Result<()> {
        if is_allowed(instance.state, action) {
            return Ok(());
        }

        Err(DriverError::InvalidState(format!(
            "cannot {} instance {} in state {}",
            action, instance.id, instance.state
        )))
    }

    /// Resolve the requested profile, or the source's own shape if none given.
    fn resolve_profile(&self, hwp_id: Option<&str>, source_cpu: u32, source_memory_mb: u64) -> Result<HardwareProfile> {
        match hwp_id {
            Some(id) => self
                .catalog
                .get(id)
                .cloned()
                .ok_or_else(|| DriverError::InvalidConfig(format!("unknown hardware profile '{}'", id))),
            None => Ok(self.catalog.match_profile(source_cpu, source_memory_mb, 0.0)),
        }
    }

    /// Wait until VirtualBox releases the session lock after a power-off.
    async fn wait_for_session_release(&self, vm_id: &str) -> Result<()> {
        for _ in 0..SESSION_RELEASE_POLLS {
            let locked = self
                .vbox
                .vm_info(vm_id)
                .await?
                .is_some_and(|raw| raw.get("sessionstate") == Some("locked"));

            if !locked {
                return Ok(());
            }

            tokio::time::sleep(SESSION_RELEASE_INTERVAL).await;
        }

        warn!(vm_id = %vm_id, "Session still locked after power-off");
        Ok(())
    }

    /// Best-effort removal of a VM registered by a failed create.
    async fn discard_vm(&self, vm_id: &str) {
        if let Err(e) = self.vbox.run(&["unregistervm", vm_id, "--delete"]).await {
            warn!(vm_id = %vm_id, error = %e, "Failed to clean up partially created VM");
        }
    }

    async fn remove_seed_iso(&self, vm_id: &str) {
        let iso = self.config.media_dir.join(format!("{}-{}.iso", vm_id, CIDATA_LABEL));
        if !iso.exists() {
            return;
        }

        if let Err(e) = tokio::fs::remove_file(&iso).await {
            warn!(path = %iso.display(), error = %e, "Failed to remove seed ISO");
        }
    }

    async fn configure_vm(&self, vm_id: &str, profile: &HardwareProfile) -> Result<()> {
        let memory = profile.memory_mb.to_string();
        let cpus = profile.cpu.to_string();

        self.vbox
            .run(&[
                "modifyvm",
                vm_id,
                "--ostype",
                self.config.os_type.as_str(),
                "--memory",
                memory.as_str(),
                "--vram",
                VRAM_MB,
                "--nic1",
                "bridged",
                "--bridgeadapter1",
                self.config.bridge_adapter.as_str(),
                "--cableconnected1",
                "on",
                "--cpus",
                cpus.as_str(),
            ])
            .await?;

        Ok(())
    }
}

/// Pull the new machine's UUID out of `createvm` output.
fn parse_created_uuid(output: &str) -> Option<String> {
    output
        .lines()
        .find_map(|line| line.trim().strip_prefix("UUID:"))
        .map(|uuid| uuid.trim().to_string())
        .filter(|uuid| !uuid.is_empty())
}

/// File name for a cloned disk, safe for any display name.
fn disk_file_name(name: &str) -> String {
    let stem: String = name
        .chars()
        .map(|c| if c == '/' || c == '\\' { '_' } else { c })
        .collect();
    format!("{}.vdi", stem)
}

#[async_trait]
impl CloudDriver for VirtualBoxDriver {
    // =========================================================================
    // Catalog
    // =========================================================================

    #[instrument(skip(self, _credentials, opts))]
    async fn list_images(&self, _credentials: &Credentials, opts: &DriverOptions) -> Result<Vec<Image>> {
        let ids = match &opts.id {
            Some(id) => vec![id.clone()],
            None => self.vbox.list_vms().await?.into_iter().map(|(_, uuid)| uuid).collect(),
        };

        let translator = self.translator();
        let mut images = Vec::new();
        for id in &ids {
            if let Some(image) = translator.image(id).await? {
                images.push(image);
            }
        }

        images.retain(|image| {
            filter_matches(opts.id.as_deref(), &image.id)
                && filter_matches(opts.architecture.as_deref(), &image.architecture)
        });
        images.sort_by(|a, b| (&a.owner_id, &a.description).cmp(&(&b.owner_id, &b.description)));

        debug!(count = images.len(), "Listed images");
        Ok(images)
    }

    #[instrument(skip(self, _credentials), fields(vm_id = %image_id))]
    async fn destroy_image(&self, _credentials: &Credentials, image_id: &str) -> Result<()> {
        if self.vbox.vm_info(image_id).await?.is_none() {
            info!("Image already absent");
            return Ok(());
        }

        info!("Destroying image");
        self.vbox.run(&["unregistervm", image_id, "--delete"]).await?;
        info!("Image destroyed");
        Ok(())
    }

    async fn list_realms(&self, _credentials: &Credentials, opts: &DriverOptions) -> Result<Vec<Realm>> {
        Ok(vec![Realm::local()]
            .into_iter()
            .filter(|realm| filter_matches(opts.id.as_deref(), &realm.id))
            .collect())
    }

    async fn list_hardware_profiles(
        &self,
        _credentials: &Credentials,
        opts: &DriverOptions,
    ) -> Result<Vec<HardwareProfile>> {
        Ok(self
            .catalog
            .profiles()
            .iter()
            .filter(|p| {
                filter_matches(opts.id.as_deref(), &p.id)
                    && filter_matches(opts.architecture.as_deref(), &p.architecture)
            })
            .cloned()
            .collect())
    }

    // =========================================================================
    // Instance Lifecycle
    // =========================================================================

    #[instrument(skip(self, _credentials, opts), fields(image_id = %image_id))]
    async fn create_instance(
        &self,
        _credentials: &Credentials,
        image_id: &str,
        opts: &DriverOptions,
    ) -> Result<Instance> {
        let source = self
            .vbox
            .vm_info(image_id)
            .await?
            .ok_or_else(|| DriverError::NotFound(format!("image {}", image_id)))?;

        let source_disk = resolve_boot_disk(&source)
            .ok_or_else(|| DriverError::InvalidState(format!("image {} has no boot disk", image_id)))?;

        let source_location = self
            .vbox
            .hd_info(&source_disk)
            .await?
            .and_then(|hd| hd.get_non_empty("location").map(str::to_string))
            .ok_or_else(|| DriverError::NotFound(format!("boot disk {} of image {}", source_disk, image_id)))?;

        let source_id = source.get_non_empty("uuid").unwrap_or(image_id).to_string();
        let source_name = source.get_non_empty("name").unwrap_or(image_id);

        let profile = self.resolve_profile(
            opts.hwp_id.as_deref(),
            source.get_u32("cpus").unwrap_or(1),
            source.get_u64("memory").unwrap_or(0),
        )?;

        let name = opts
            .name
            .clone()
            .unwrap_or_else(|| format!("{} - {}", source_name, Utc::now().timestamp()));

        info!(name = %name, profile = %profile.id, "Creating instance");

        let output = self.vbox.run(&["createvm", "--name", name.as_str(), "--register"]).await?;
        let vm_id = parse_created_uuid(&output)
            .ok_or_else(|| DriverError::Internal(format!("createvm printed no UUID: {}", output)))?;

        let prepared = async {
            self.configure_vm(&vm_id, &profile).await?;
            self.vbox
                .run(&["setextradata", vm_id.as_str(), ORIGIN_IMAGE_KEY, source_id.as_str()])
                .await?;
            self.require_instance(&vm_id).await
        }
        .await;

        let view = match prepared {
            Ok(view) => view,
            Err(e) => {
                self.discard_vm(&vm_id).await;
                return Err(e);
            }
        };

        let target_dir = Path::new(&source_location)
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.config.media_dir.clone());

        let seed = opts.user_data.as_ref().map(|user_data| SeedRequest {
            config: CloudInitConfig::new(vm_id.clone(), name.clone()).with_user_data(user_data.clone()),
            generator: Arc::clone(&self.iso_generator),
            media_dir: self.config.media_dir.clone(),
        });

        let job = ProvisionJob {
            vbox: self.vbox.clone(),
            vm_id: vm_id.clone(),
            source_location,
            target_location: target_dir.join(disk_file_name(&name)).to_string_lossy().to_string(),
            controller: format!("{}-hd0", name),
            source_lock: self.tracker.source_lock(&source_id).await,
            seed,
        };

        self.tracker.spawn(&vm_id, job.run()).await;

        info!(vm_id = %vm_id, "Instance registered, provisioning in background");
        Ok(view.instance)
    }

    #[instrument(skip(self, _credentials), fields(vm_id = %instance_id))]
    async fn start_instance(&self, _credentials: &Credentials, instance_id: &str) -> Result<Instance> {
        let view = self.require_instance(instance_id).await?;
        Self::check_action(&view.instance, InstanceAction::Start)?;

        let id = view.instance.id.as_str();
        if view.native_state.eq_ignore_ascii_case("paused") {
            info!("Resuming instance");
            self.vbox.run(&["controlvm", id, "resume"]).await?;
        } else {
            info!("Starting instance");
            self.vbox.run(&["startvm", id, "--type", "headless"]).await?;
        }

        Ok(self.require_instance(id).await?.instance)
    }

    #[instrument(skip(self, _credentials), fields(vm_id = %instance_id))]
    async fn stop_instance(&self, _credentials: &Credentials, instance_id: &str) -> Result<Instance> {
        let view = self.require_instance(instance_id).await?;
        Self::check_action(&view.instance, InstanceAction::Stop)?;

        info!("Stopping instance");
        let id = view.instance.id.as_str();
        self.vbox.run(&["controlvm", id, "pause"]).await?;

        Ok(self.require_instance(id).await?.instance)
    }

    #[instrument(skip(self, _credentials), fields(vm_id = %instance_id))]
    async fn reboot_instance(&self, _credentials: &Credentials, instance_id: &str) -> Result<Instance> {
        let view = self.require_instance(instance_id).await?;
        Self::check_action(&view.instance, InstanceAction::Reboot)?;

        info!("Rebooting instance");
        let id = view.instance.id.as_str();
        self.vbox.run(&["controlvm", id, "reset"]).await?;

        Ok(self.require_instance(id).await?.instance)
    }

    #[instrument(skip(self, _credentials), fields(vm_id = %instance_id))]
    async fn destroy_instance(&self, _credentials: &Credentials, instance_id: &str) -> Result<()> {
        let Some(view) = self.translator().instance(instance_id).await? else {
            info!("Instance already absent");
            self.tracker.forget(instance_id).await;
            return Ok(());
        };

        let instance = &view.instance;
        if !is_allowed(instance.state, InstanceAction::Destroy) {
            // A pending instance nobody is provisioning can never leave PENDING
            let provisioning = self
                .tracker
                .status(&instance.id)
                .await
                .is_some_and(|status| status.is_in_progress());

            if instance.state != InstanceState::Pending || provisioning {
                return Self::check_action(instance, InstanceAction::Destroy);
            }
        }

        info!("Destroying instance");
        let id = instance.id.as_str();
        match self.vbox.run(&["controlvm", id, "poweroff"]).await {
            Ok(_) => self.wait_for_session_release(id).await?,
            Err(e) => debug!(error = %e, "Power off skipped"),
        }

        self.vbox.run(&["unregistervm", id, "--delete"]).await?;
        self.tracker.forget(id).await;
        self.remove_seed_iso(id).await;

        info!("Instance destroyed");
        Ok(())
    }

    // =========================================================================
    // Queries
    // =========================================================================

    #[instrument(skip(self, _credentials, opts))]
    async fn list_instances(&self, _credentials: &Credentials, opts: &DriverOptions) -> Result<Vec<Instance>> {
        let ids = match &opts.id {
            Some(id) => vec![id.clone()],
            None => self.vbox.list_vms().await?.into_iter().map(|(_, uuid)| uuid).collect(),
        };

        let translator = self.translator();
        let mut instances = Vec::new();
        for id in &ids {
            // A VM can vanish between `list vms` and `showvminfo`
            if let Some(view) = translator.instance(id).await? {
                instances.push(view.instance);
            }
        }

        instances.retain(|instance| {
            filter_matches(opts.id.as_deref(), &instance.id)
                && filter_matches(opts.image_id.as_deref(), &instance.image_id)
                && opts
                    .state
                    .as_deref()
                    .map_or(true, |state| instance.state.as_str().eq_ignore_ascii_case(state))
        });

        debug!(count = instances.len(), "Listed instances");
        Ok(instances)
    }

    #[instrument(skip(self, _credentials, opts))]
    async fn list_storage_volumes(
        &self,
        _credentials: &Credentials,
        opts: &DriverOptions,
    ) -> Result<Vec<StorageVolume>> {
        let ids = match &opts.id {
            Some(id) => vec![id.clone()],
            None => self.vbox.list_hdds().await?,
        };

        let mut volumes = Vec::new();
        for id in &ids {
            if let Some(volume) = self
                .vbox
                .hd_info(id)
                .await?
                .and_then(|hd| translate_volume(&hd, LOCAL_REALM_ID))
            {
                volumes.push(volume);
            }
        }

        volumes.retain(|volume| filter_matches(opts.id.as_deref(), &volume.id));

        debug!(count = volumes.len(), "Listed storage volumes");
        Ok(volumes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_created_uuid() {
        let output = "Virtual machine 'web' is created and registered.\n\
                      UUID: 0f6b1b5e-7a4c-4c55-9b0e-3c1d2e3f4a5b\n\
                      Settings file: '/vms/web/web.vbox'";
        assert_eq!(
            parse_created_uuid(output).as_deref(),
            Some("0f6b1b5e-7a4c-4c55-9b0e-3c1d2e3f4a5b")
        );
        assert_eq!(parse_created_uuid("Virtual machine 'web' is created."), None);
    }

    #[test]
    fn test_owner_fallback_chain() {
        let env = |user: Option<&str>, username: Option<&str>| {
            owner_from(move |var| match var {
                "USER" => user.map(str::to_string),
                "USERNAME" => username.map(str::to_string),
                _ => None,
            })
        };

        assert_eq!(env(Some("alice"), Some("ALICE")), "alice");
        assert_eq!(env(None, Some("ALICE")), "ALICE");
        assert_eq!(env(Some(""), None), "nobody");
        assert_eq!(env(None, None), "nobody");
    }

    #[test]
    fn test_disk_file_name() {
        assert_eq!(disk_file_name("base - 1700000000"), "base - 1700000000.vdi");
        assert_eq!(disk_file_name("a/b"), "a_b.vdi");
    }
}
