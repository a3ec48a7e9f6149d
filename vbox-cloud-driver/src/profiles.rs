//! Hardware profile catalog and matching.
//!
//! Callers see named resource shapes instead of raw CPU/memory numbers. The
//! catalog is fixed configuration owned by the driver; a VM whose allocation
//! matches no entry exactly is reported with a synthesized `custom` profile.

use serde::{Deserialize, Serialize};

use crate::error::{DriverError, Result};

/// Id of the synthesized profile for VMs that match no catalog entry.
pub const CUSTOM_PROFILE_ID: &str = "custom";

/// Named (CPU, memory, storage) resource shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HardwareProfile {
    pub id: String,
    /// Number of virtual CPUs
    pub cpu: u32,
    /// Memory in MB
    pub memory_mb: u64,
    /// Storage hint in GB
    #[serde(default)]
    pub storage_gb: f64,
    #[serde(default = "host_architecture")]
    pub architecture: String,
}

impl HardwareProfile {
    pub fn new(id: impl Into<String>, cpu: u32, memory_mb: u64, storage_gb: f64) -> Self {
        Self {
            id: id.into(),
            cpu,
            memory_mb,
            storage_gb,
            architecture: host_architecture(),
        }
    }

    /// Profile carrying a VM's actual allocation.
    pub fn custom(cpu: u32, memory_mb: u64, storage_gb: f64, architecture: impl Into<String>) -> Self {
        Self {
            id: CUSTOM_PROFILE_ID.to_string(),
            cpu,
            memory_mb,
            storage_gb,
            architecture: architecture.into(),
        }
    }

    pub fn is_custom(&self) -> bool {
        self.id == CUSTOM_PROFILE_ID
    }
}

/// Architecture of the host, which is also the guest architecture here.
pub fn host_architecture() -> String {
    std::env::consts::ARCH.to_string()
}

/// Immutable table of named profiles.
#[derive(Debug, Clone)]
pub struct HardwareProfileCatalog {
    profiles: Vec<HardwareProfile>,
    architecture: String,
}

impl Default for HardwareProfileCatalog {
    fn default() -> Self {
        Self {
            profiles: default_profiles(),
            architecture: host_architecture(),
        }
    }
}

/// The stock catalog: micro, small, medium, large.
pub fn default_profiles() -> Vec<HardwareProfile> {
    vec![
        HardwareProfile::new("micro", 1, 512, 1.0),
        HardwareProfile::new("small", 1, 1024, 1.0),
        HardwareProfile::new("medium", 2, 2048, 1.0),
        HardwareProfile::new("large", 4, 4096, 1.0),
    ]
}

impl HardwareProfileCatalog {
    /// Build a catalog, rejecting duplicate ids and the reserved `custom` id.
    pub fn new(profiles: Vec<HardwareProfile>, architecture: impl Into<String>) -> Result<Self> {
        let architecture = architecture.into();

        for (i, profile) in profiles.iter().enumerate() {
            if profile.is_custom() {
                return Err(DriverError::InvalidConfig(format!(
                    "hardware profile id '{}' is reserved",
                    CUSTOM_PROFILE_ID
                )));
            }
            if profile.cpu == 0 || profile.memory_mb == 0 {
                return Err(DriverError::InvalidConfig(format!(
                    "hardware profile '{}' must have non-zero cpu and memory",
                    profile.id
                )));
            }
            if profiles[..i].iter().any(|p| p.id == profile.id) {
                return Err(DriverError::InvalidConfig(format!(
                    "duplicate hardware profile '{}'",
                    profile.id
                )));
            }
        }

        let profiles = profiles
            .into_iter()
            .map(|p| HardwareProfile {
                architecture: architecture.clone(),
                ..p
            })
            .collect();

        Ok(Self { profiles, architecture })
    }

    pub fn architecture(&self) -> &str {
        &self.architecture
    }

    pub fn get(&self, id: &str) -> Option<&HardwareProfile> {
        self.profiles.iter().find(|p| p.id == id)
    }

    /// All named profiles (never includes `custom`).
    pub fn profiles(&self) -> &[HardwareProfile] {
        &self.profiles
    }

    /// Ids of the profiles an image can be launched with.
    pub fn eligible_ids(&self) -> Vec<String> {
        self.profiles
            .iter()
            .filter(|p| !p.is_custom())
            .map(|p| p.id.clone())
            .collect()
    }

    /// Exact-match a VM's allocation, else synthesize a `custom` profile.
    ///
    /// There is deliberately no nearest-fit: a 3-CPU VM is not "medium".
    pub fn match_profile(&self, cpu: u32, memory_mb: u64, storage_gb: f64) -> HardwareProfile {
        self.profiles
            .iter()
            .find(|p| p.cpu == cpu && p.memory_mb == memory_mb)
            .cloned()
            .unwrap_or_else(|| HardwareProfile::custom(cpu, memory_mb, storage_gb, self.architecture.clone()))
    }
}
