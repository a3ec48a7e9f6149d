//! Raw VirtualBox attributes to normalized records.
//!
//! The pure `build_*` functions do the shaping; [`Translator`] gathers the
//! extra facts they need (boot volume, guest address, origin image) with a
//! handful of follow-up queries.

use chrono::{DateTime, NaiveDateTime, Utc};
use tracing::{debug, instrument};

use crate::attributes::RawAttributes;
use crate::boot_disk::{attached_disk_ids, resolve_boot_disk};
use crate::command::VBoxManage;
use crate::error::Result;
use crate::profiles::HardwareProfileCatalog;
use crate::state::{actions_for, display_state};
use crate::types::{Image, Instance, StorageVolume, LOCAL_REALM_ID};
use crate::volume::translate_volume;

/// Extradata key recording which image a VM was cloned from.
pub const ORIGIN_IMAGE_KEY: &str = "vbox-cloud/image-id";

/// Facts about one VM gathered beyond `showvminfo`.
#[derive(Debug, Clone, Default)]
pub struct VmFacts {
    /// Translated boot volume, `None` while provisioning
    pub boot_volume: Option<StorageVolume>,
    pub guest_ip: Option<String>,
    pub origin_image: Option<String>,
}

/// Shape an instance record. `None` if the attributes carry no UUID.
pub fn build_instance(
    raw: &RawAttributes,
    facts: &VmFacts,
    catalog: &HardwareProfileCatalog,
    owner: &str,
) -> Option<Instance> {
    let id = raw.get_non_empty("uuid")?.to_string();
    let native = raw.get("vmstate").unwrap_or_default();
    let state = display_state(native, facts.boot_volume.is_some());

    let cpu = raw.get_u32("cpus").unwrap_or(1);
    let memory_mb = raw.get_u64("memory").unwrap_or(0);
    let storage_gb = facts
        .boot_volume
        .as_ref()
        .and_then(|v| v.capacity.as_deref())
        .and_then(|c| c.parse::<f64>().ok())
        .unwrap_or(0.0);

    let addresses: Vec<String> = facts.guest_ip.iter().cloned().collect();

    Some(Instance {
        name: raw.get("name").unwrap_or(&id).to_string(),
        state,
        owner_id: owner.to_string(),
        realm_id: LOCAL_REALM_ID.to_string(),
        public_addresses: addresses.clone(),
        private_addresses: addresses,
        image_id: facts.origin_image.clone().unwrap_or_else(|| id.clone()),
        hardware_profile: catalog.match_profile(cpu, memory_mb, storage_gb),
        storage_volumes: attached_disk_ids(raw),
        launch_time: raw
            .get_non_empty("vmstatechangetime")
            .and_then(parse_state_change_time)
            .unwrap_or_else(Utc::now),
        actions: actions_for(state),
        id,
    })
}

/// Shape an image record. VMs without a boot volume are not images.
pub fn build_image(
    raw: &RawAttributes,
    boot_volume: Option<&StorageVolume>,
    catalog: &HardwareProfileCatalog,
    owner: &str,
) -> Option<Image> {
    let id = raw.get_non_empty("uuid")?;
    let volume = boot_volume?;

    let description = format!(
        "{} MB RAM, {} CPU, {} HDD",
        raw.get_u64("memory").unwrap_or(0),
        raw.get_u64("cpus").unwrap_or(1),
        volume.capacity.as_deref().unwrap_or("0.00"),
    );

    Some(Image {
        id: id.to_string(),
        name: raw.get("name").unwrap_or(id).to_string(),
        description,
        owner_id: owner.to_string(),
        architecture: catalog.architecture().to_string(),
        hardware_profiles: catalog.eligible_ids(),
    })
}

/// Parse `VMStateChangeTime` (`2024-05-01T10:00:00.000000000`, UTC).
pub fn parse_state_change_time(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.with_timezone(&Utc));
    }

    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Queries VirtualBox and assembles records.
pub struct Translator<'a> {
    vbox: &'a VBoxManage,
    catalog: &'a HardwareProfileCatalog,
    owner: &'a str,
}

/// An instance together with the native state it was derived from.
#[derive(Debug, Clone)]
pub struct InstanceView {
    pub instance: Instance,
    pub native_state: String,
}

impl<'a> Translator<'a> {
    pub fn new(vbox: &'a VBoxManage, catalog: &'a HardwareProfileCatalog, owner: &'a str) -> Self {
        Self { vbox, catalog, owner }
    }

    /// Translate the boot volume of `raw`, if it resolves to a real medium.
    pub async fn boot_volume(&self, raw: &RawAttributes) -> Result<Option<StorageVolume>> {
        let Some(disk_id) = resolve_boot_disk(raw) else {
            return Ok(None);
        };

        let hd = self.vbox.hd_info(&disk_id).await?;
        Ok(hd.and_then(|hd| translate_volume(&hd, LOCAL_REALM_ID)))
    }

    /// Look up one VM as an instance. `Ok(None)` if it does not exist.
    #[instrument(skip(self), fields(vm_id = %vm_id))]
    pub async fn instance(&self, vm_id: &str) -> Result<Option<InstanceView>> {
        let Some(raw) = self.vbox.vm_info(vm_id).await? else {
            debug!("VM not found");
            return Ok(None);
        };

        let facts = VmFacts {
            boot_volume: self.boot_volume(&raw).await?,
            guest_ip: self.vbox.guest_ip(vm_id).await?,
            origin_image: self.vbox.extradata(vm_id, ORIGIN_IMAGE_KEY).await?,
        };

        Ok(build_instance(&raw, &facts, self.catalog, self.owner).map(|instance| InstanceView {
            instance,
            native_state: raw.get("vmstate").unwrap_or_default().to_string(),
        }))
    }

    /// Look up one VM as an image. `Ok(None)` if absent or without a disk.
    #[instrument(skip(self), fields(vm_id = %vm_id))]
    pub async fn image(&self, vm_id: &str) -> Result<Option<Image>> {
        let Some(raw) = self.vbox.vm_info(vm_id).await? else {
            return Ok(None);
        };

        let volume = self.boot_volume(&raw).await?;
        Ok(build_image(&raw, volume.as_ref(), self.catalog, self.owner))
    }
}
