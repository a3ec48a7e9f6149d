//! Storage volume translation.

use chrono::Utc;

use crate::attributes::RawAttributes;
use crate::types::StorageVolume;

/// The only durable volume state VirtualBox exposes to us.
pub const VOLUME_STATE_AVAILABLE: &str = "AVAILABLE";

/// Translate a `showhdinfo` block into a storage volume.
///
/// Returns `None` when the block has no `uuid`, which is how VBoxManage
/// answers for a medium that does not exist (e.g. a VM whose boot disk is
/// still being cloned).
pub fn translate_volume(raw: &RawAttributes, realm_id: &str) -> Option<StorageVolume> {
    let id = raw.get_non_empty("uuid")?;

    let capacity = raw
        .get_non_empty("logical-size")
        .or_else(|| raw.get_non_empty("capacity"))
        .and_then(normalize_capacity);

    Some(StorageVolume {
        id: id.to_string(),
        created: Utc::now(),
        state: VOLUME_STATE_AVAILABLE.to_string(),
        capacity,
        instance_id: raw.get("in-use-by-vms").map(owner_vm_id).unwrap_or_default(),
        device: raw.get("type").unwrap_or_default().to_string(),
        realm_id: realm_id.to_string(),
    })
}

/// Normalize a VBoxManage size (`"10240 MBytes"`) to gigabytes with two decimals.
///
/// Kilobyte units are divided by 1,000,000 and megabyte units by 1,000;
/// anything else is taken as gigabytes already.
pub fn normalize_capacity(raw: &str) -> Option<String> {
    let mut parts = raw.split_whitespace();
    let magnitude: f64 = parts.next()?.parse().ok()?;
    let unit = parts.next().unwrap_or_default().to_ascii_lowercase();

    let gigabytes = match unit.as_str() {
        "kbytes" | "kb" | "kib" => magnitude / 1_000_000.0,
        "mbytes" | "mb" | "mib" => magnitude / 1_000.0,
        _ => magnitude,
    };

    Some(format!("{:.2}", gigabytes))
}

/// Extract the VM id from an `In use by VMs` value such as `web-01 (UUID: 9a3f`.
fn owner_vm_id(value: &str) -> String {
    match value.split_once("UUID:") {
        Some((_, uuid)) => uuid.trim().trim_end_matches(')').trim().to_string(),
        None => value.trim().to_string(),
    }
}
