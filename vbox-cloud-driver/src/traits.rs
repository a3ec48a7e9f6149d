//! Core cloud-compute abstraction trait.

use async_trait::async_trait;

use crate::error::{DriverError, Result};
use crate::profiles::HardwareProfile;
use crate::types::*;

/// Normalized cloud-compute API.
///
/// This trait defines the operations a front end exposes for one hypervisor
/// host: images to launch from, instances launched from them, and the disks
/// and placement information around them. Every call takes the caller's
/// credentials and a set of options; list operations treat the options as
/// filters.
#[async_trait]
pub trait CloudDriver: Send + Sync {
    // =========================================================================
    // Catalog
    // =========================================================================

    /// List images, sorted by (owner, description).
    async fn list_images(&self, credentials: &Credentials, opts: &DriverOptions) -> Result<Vec<Image>>;

    /// Unregister an image and delete its disks. Absent images are a no-op.
    async fn destroy_image(&self, credentials: &Credentials, image_id: &str) -> Result<()>;

    /// List realms (always the single local one).
    async fn list_realms(&self, credentials: &Credentials, opts: &DriverOptions) -> Result<Vec<Realm>>;

    /// List the configured hardware profiles.
    async fn list_hardware_profiles(
        &self,
        credentials: &Credentials,
        opts: &DriverOptions,
    ) -> Result<Vec<HardwareProfile>>;

    // =========================================================================
    // Instance Lifecycle
    // =========================================================================

    /// Create an instance from an image.
    ///
    /// Returns as soon as the VM is registered; the disk is cloned in the
    /// background and the instance shows `PENDING` until it is attached.
    async fn create_instance(
        &self,
        credentials: &Credentials,
        image_id: &str,
        opts: &DriverOptions,
    ) -> Result<Instance>;

    /// Start a `START` or `STOPPED` instance.
    async fn start_instance(&self, credentials: &Credentials, instance_id: &str) -> Result<Instance>;

    /// Stop (pause) a running instance.
    async fn stop_instance(&self, credentials: &Credentials, instance_id: &str) -> Result<Instance>;

    /// Hard-reset a running instance.
    async fn reboot_instance(&self, credentials: &Credentials, instance_id: &str) -> Result<Instance>;

    /// Power off and delete an instance with its disks. Absent instances are a no-op.
    async fn destroy_instance(&self, credentials: &Credentials, instance_id: &str) -> Result<()>;

    // =========================================================================
    // Queries
    // =========================================================================

    /// List instances, filtered by id, state and image id.
    async fn list_instances(&self, credentials: &Credentials, opts: &DriverOptions) -> Result<Vec<Instance>>;

    /// List registered hard disks.
    async fn list_storage_volumes(
        &self,
        credentials: &Credentials,
        opts: &DriverOptions,
    ) -> Result<Vec<StorageVolume>>;

    // =========================================================================
    // Storage Management
    // =========================================================================

    /// Create a standalone storage volume.
    async fn create_storage_volume(
        &self,
        _credentials: &Credentials,
        _opts: &DriverOptions,
    ) -> Result<StorageVolume> {
        Err(DriverError::UnsupportedOperation("create_storage_volume".to_string()))
    }

    /// Attach a storage volume to an instance.
    async fn attach_storage_volume(
        &self,
        _credentials: &Credentials,
        _volume_id: &str,
        _instance_id: &str,
    ) -> Result<()> {
        Err(DriverError::UnsupportedOperation("attach_storage_volume".to_string()))
    }

    /// Snapshot a storage volume.
    async fn create_storage_snapshot(&self, _credentials: &Credentials, _volume_id: &str) -> Result<()> {
        Err(DriverError::UnsupportedOperation("create_storage_snapshot".to_string()))
    }
}
