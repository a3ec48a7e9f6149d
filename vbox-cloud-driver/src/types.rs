//! Records returned by the driver and the options it accepts.
//!
//! Every record is a value object built fresh from VBoxManage output on each
//! query. Nothing here is cached or mutated after construction.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::profiles::HardwareProfile;
use crate::state::{InstanceAction, InstanceState};

/// The only realm: this host.
pub const LOCAL_REALM_ID: &str = "local";

// =============================================================================
// RECORDS
// =============================================================================

/// A virtual machine as seen through the instance API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    /// VirtualBox machine UUID
    pub id: String,
    pub name: String,
    /// Displayed state
    pub state: InstanceState,
    pub owner_id: String,
    pub realm_id: String,
    pub public_addresses: Vec<String>,
    pub private_addresses: Vec<String>,
    /// Image this instance was created from (own id when unknown)
    pub image_id: String,
    pub hardware_profile: HardwareProfile,
    /// Attached disk UUIDs, boot disk first
    pub storage_volumes: Vec<String>,
    /// Last native state change, or translation time if not reported
    pub launch_time: DateTime<Utc>,
    /// Legal next actions for `state`
    pub actions: Vec<InstanceAction>,
}

/// A VM surfaced as a clone source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Image {
    pub id: String,
    pub name: String,
    /// e.g. "2048 MB RAM, 2 CPU, 10.24 HDD"
    pub description: String,
    pub owner_id: String,
    pub architecture: String,
    /// Ids of the profiles this image can be launched with
    pub hardware_profiles: Vec<String>,
}

/// A virtual disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageVolume {
    /// Medium UUID
    pub id: String,
    /// Translation time; VirtualBox does not report creation time
    pub created: DateTime<Utc>,
    pub state: String,
    /// Capacity in GB with two decimals
    pub capacity: Option<String>,
    /// Owning VM UUID, empty when detached
    pub instance_id: String,
    /// Medium type tag (e.g. "normal (base)")
    pub device: String,
    pub realm_id: String,
}

/// A placement domain. There is exactly one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Realm {
    pub id: String,
    pub name: String,
    pub limit: u32,
    pub state: String,
}

impl Realm {
    /// The single host-local realm.
    pub fn local() -> Self {
        let name = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "localhost".to_string());

        Self {
            id: LOCAL_REALM_ID.to_string(),
            name,
            limit: 100,
            state: "AVAILABLE".to_string(),
        }
    }
}

// =============================================================================
// REQUEST INPUTS
// =============================================================================

/// Caller credentials. VirtualBox has no API auth, so these are never read.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub user: Option<String>,
    pub password: Option<String>,
}

/// Filter and creation options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverOptions {
    pub id: Option<String>,
    pub image_id: Option<String>,
    pub state: Option<String>,
    pub architecture: Option<String>,
    pub name: Option<String>,
    pub hwp_id: Option<String>,
    pub user_data: Option<String>,
}

impl DriverOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_image_id(mut self, image_id: impl Into<String>) -> Self {
        self.image_id = Some(image_id.into());
        self
    }

    pub fn with_state(mut self, state: impl Into<String>) -> Self {
        self.state = Some(state.into());
        self
    }

    pub fn with_architecture(mut self, architecture: impl Into<String>) -> Self {
        self.architecture = Some(architecture.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_hwp_id(mut self, hwp_id: impl Into<String>) -> Self {
        self.hwp_id = Some(hwp_id.into());
        self
    }

    pub fn with_user_data(mut self, user_data: impl Into<String>) -> Self {
        self.user_data = Some(user_data.into());
        self
    }
}

/// Whether an optional filter accepts `value`. Unset filters accept everything.
pub(crate) fn filter_matches(filter: Option<&str>, value: &str) -> bool {
    filter.map_or(true, |f| f == value)
}
