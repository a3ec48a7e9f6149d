//! Storage controller walking and boot-disk resolution.
//!
//! VirtualBox never labels a "boot disk". `showvminfo --machinereadable`
//! lists controllers and their attachment slots instead:
//!
//! ```text
//! storagecontrollername0="IDE Controller"
//! storagecontrollertype0="PIIX4"
//! "IDE Controller-0-0"="/vms/seed.iso"
//! "IDE Controller-1-0"="/vms/web-01.vdi"
//! "IDE Controller-ImageUUID-1-0"="5d1c..."
//! "IDE Controller-0-1"="none"
//! ```
//!
//! The boot disk is the first slot, in controller order, holding a
//! disk-image file. ISOs and empty slots are skipped.

use crate::attributes::RawAttributes;

/// File extensions recognized as bootable disk images.
pub const DISK_IMAGE_EXTENSIONS: &[&str] = &["vdi", "vmdk"];

/// Slot value VBoxManage prints for an empty attachment point.
pub const EMPTY_SLOT: &str = "none";

const CONTROLLER_NAME_PREFIX: &str = "storagecontrollername";
const CONTROLLER_TYPE_PREFIX: &str = "storagecontrollertype";

/// A storage controller as listed by `showvminfo`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageController {
    /// Position in the machine-readable listing
    pub index: usize,
    /// Name as VirtualBox reports it (used for `--storagectl`)
    pub name: String,
    /// Controller chipset, e.g. `PIIX4` or `IntelAhci`
    pub controller_type: Option<String>,
}

impl StorageController {
    /// Lowercased name, the prefix of this controller's slot keys.
    pub fn key(&self) -> String {
        self.name.to_lowercase()
    }
}

/// One attachment point on a controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentSlot {
    pub port: u32,
    pub device: u32,
    /// Attached medium path, `None` for an empty slot
    pub medium: Option<String>,
}

/// All controllers, in listing order.
pub fn storage_controllers(raw: &RawAttributes) -> Vec<StorageController> {
    let mut controllers: Vec<StorageController> = raw
        .iter()
        .filter_map(|(key, value)| {
            let index: usize = key.strip_prefix(CONTROLLER_NAME_PREFIX)?.parse().ok()?;
            Some(StorageController {
                index,
                name: value.to_string(),
                controller_type: raw
                    .get_non_empty(&format!("{CONTROLLER_TYPE_PREFIX}{index}"))
                    .map(str::to_string),
            })
        })
        .collect();

    controllers.sort_by_key(|c| c.index);
    controllers
}

/// Attachment slots of one controller, ordered by (port, device).
pub fn attachment_slots(raw: &RawAttributes, controller: &StorageController) -> Vec<AttachmentSlot> {
    let prefix = format!("{}-", controller.key());

    let mut slots: Vec<AttachmentSlot> = raw
        .iter()
        .filter_map(|(key, value)| {
            let (port, device) = key.strip_prefix(&prefix)?.split_once('-')?;
            let port = port.parse().ok()?;
            let device = device.parse().ok()?;
            let medium = if value.eq_ignore_ascii_case(EMPTY_SLOT) || value.is_empty() {
                None
            } else {
                Some(value.to_string())
            };
            Some(AttachmentSlot { port, device, medium })
        })
        .collect();

    slots.sort_by_key(|s| (s.port, s.device));
    slots
}

/// Whether a medium path names a disk image (not an ISO or floppy).
pub fn is_disk_image(path: &str) -> bool {
    let lower = path.to_lowercase();
    DISK_IMAGE_EXTENSIONS
        .iter()
        .any(|ext| lower.ends_with(&format!(".{ext}")))
}

/// Attribute key holding the medium UUID of a slot.
pub fn image_uuid_key(controller: &StorageController, slot: &AttachmentSlot) -> String {
    format!("{}-imageuuid-{}-{}", controller.key(), slot.port, slot.device)
}

/// Resolve the attribute key naming the boot medium's UUID.
///
/// Returns `None` when no controller has a disk image attached.
pub fn resolve_boot_disk_key(raw: &RawAttributes) -> Option<String> {
    storage_controllers(raw).iter().find_map(|controller| {
        attachment_slots(raw, controller)
            .iter()
            .find(|slot| slot.medium.as_deref().is_some_and(is_disk_image))
            .map(|slot| image_uuid_key(controller, slot))
    })
}

/// UUID of the boot medium, if one is attached.
pub fn resolve_boot_disk(raw: &RawAttributes) -> Option<String> {
    resolve_boot_disk_key(raw).and_then(|key| raw.get_non_empty(&key).map(str::to_string))
}

/// UUIDs of every attached disk image, boot disk first.
pub fn attached_disk_ids(raw: &RawAttributes) -> Vec<String> {
    storage_controllers(raw)
        .iter()
        .flat_map(|controller| {
            attachment_slots(raw, controller)
                .into_iter()
                .filter(|slot| slot.medium.as_deref().is_some_and(is_disk_image))
                .filter_map(|slot| raw.get_non_empty(&image_uuid_key(controller, &slot)).map(str::to_string))
                .collect::<Vec<_>>()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::parse_machine_readable;

    #[test]
    fn test_iso_controller_is_skipped_for_disk_controller() {
        let raw = parse_machine_readable(
            r#"storagecontrollername0="IDE"
storagecontrollertype0="PIIX4"
"IDE-0-0"="/media/seed.iso"
"IDE-ImageUUID-0-0"="iso-uuid"
storagecontrollername1="SATA"
storagecontrollertype1="IntelAhci"
"SATA-0-0"="/vms/web.vdi"
"SATA-ImageUUID-0-0"="disk-uuid"
"#,
        );

        assert_eq!(resolve_boot_disk_key(&raw).as_deref(), Some("sata-imageuuid-0-0"));
        assert_eq!(resolve_boot_disk(&raw).as_deref(), Some("disk-uuid"));
    }

    #[test]
    fn test_first_disk_slot_wins() {
        let raw = parse_machine_readable(
            r#"storagecontrollername0="web-hd0"
"web-hd0-0-0"="none"
"web-hd0-0-1"="/vms/data.VMDK"
"web-hd0-ImageUUID-0-1"="data-uuid"
"web-hd0-1-0"="/vms/other.vdi"
"web-hd0-ImageUUID-1-0"="other-uuid"
"#,
        );

        assert_eq!(resolve_boot_disk(&raw).as_deref(), Some("data-uuid"));
        assert_eq!(attached_disk_ids(&raw), vec!["data-uuid", "other-uuid"]);
    }

    #[test]
    fn test_no_disk_means_no_boot_disk() {
        let raw = parse_machine_readable(
            r#"storagecontrollername0="IDE Controller"
"IDE Controller-0-0"="none"
"IDE Controller-1-0"="/media/installer.iso"
"#,
        );

        assert_eq!(resolve_boot_disk_key(&raw), None);
        assert!(attached_disk_ids(&raw).is_empty());
    }

    #[test]
    fn test_controller_listing() {
        let raw = parse_machine_readable(
            r#"storagecontrollername1="SATA"
storagecontrollername0="IDE Controller"
storagecontrollertype0="PIIX4"
"IDE Controller-1-1"="none"
"IDE Controller-0-0"="/vms/a.vdi"
"IDE Controller-ImageUUID-0-0"="a"
"#,
        );

        let controllers = storage_controllers(&raw);
        assert_eq!(controllers.len(), 2);
        assert_eq!(controllers[0].name, "IDE Controller");
        assert_eq!(controllers[0].controller_type.as_deref(), Some("PIIX4"));
        assert_eq!(controllers[1].controller_type, None);

        let slots = attachment_slots(&raw, &controllers[0]);
        assert_eq!(slots.len(), 2);
        assert_eq!((slots[0].port, slots[0].device), (0, 0));
        assert_eq!(slots[1].medium, None);
    }
}
