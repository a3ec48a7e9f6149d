//! Instance state machine.
//!
//! The state a caller sees is computed on every query from two facts: the
//! native VirtualBox `VMState` and whether a boot disk can be resolved. It is
//! never stored.
//!
//! ```text
//!            start                 stop
//!   START ──────────► PENDING   RUNNING ──────► STOPPING
//!     │                  │ auto   ▲  │ ▲ reboot    │ auto
//!     │ destroy          ▼        │  │ └──┘        ▼
//!     │               RUNNING ◄───┼──┼─────────  STOPPED
//!     ▼                           │  │ destroy     │ start / destroy
//!   FINISH ◄──────────────────────┴──┴─────────────┘
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

/// Normalized instance state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceState {
    /// Provisioned and powered off, ready for its first start
    Start,
    /// Still being provisioned (no boot disk yet)
    Pending,
    Running,
    Stopping,
    Stopped,
    /// Destroyed
    Finish,
}

impl InstanceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceState::Start => "START",
            InstanceState::Pending => "PENDING",
            InstanceState::Running => "RUNNING",
            InstanceState::Stopping => "STOPPING",
            InstanceState::Stopped => "STOPPED",
            InstanceState::Finish => "FINISH",
        }
    }

    /// Parse a state filter value, case-insensitively.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "START" => Some(InstanceState::Start),
            "PENDING" => Some(InstanceState::Pending),
            "RUNNING" => Some(InstanceState::Running),
            "STOPPING" => Some(InstanceState::Stopping),
            "STOPPED" => Some(InstanceState::Stopped),
            "FINISH" => Some(InstanceState::Finish),
            _ => None,
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller-initiated instance action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceAction {
    Start,
    Stop,
    Reboot,
    Destroy,
}

impl InstanceAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceAction::Start => "start",
            InstanceAction::Stop => "stop",
            InstanceAction::Reboot => "reboot",
            InstanceAction::Destroy => "destroy",
        }
    }
}

impl fmt::Display for InstanceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What moves an instance along an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Action(InstanceAction),
    /// Observed from the hypervisor, no caller involvement
    Automatic,
}

/// One edge of the state graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: InstanceState,
    pub to: InstanceState,
    pub trigger: Trigger,
}

const fn edge(from: InstanceState, to: InstanceState, trigger: Trigger) -> Transition {
    Transition { from, to, trigger }
}

/// The complete transition graph.
pub const TRANSITIONS: &[Transition] = &[
    edge(InstanceState::Start, InstanceState::Pending, Trigger::Action(InstanceAction::Start)),
    edge(InstanceState::Start, InstanceState::Finish, Trigger::Action(InstanceAction::Destroy)),
    edge(InstanceState::Pending, InstanceState::Running, Trigger::Automatic),
    edge(InstanceState::Running, InstanceState::Running, Trigger::Action(InstanceAction::Reboot)),
    edge(InstanceState::Running, InstanceState::Stopping, Trigger::Action(InstanceAction::Stop)),
    edge(InstanceState::Running, InstanceState::Finish, Trigger::Action(InstanceAction::Destroy)),
    edge(InstanceState::Stopping, InstanceState::Stopped, Trigger::Automatic),
    edge(InstanceState::Stopped, InstanceState::Running, Trigger::Action(InstanceAction::Start)),
    edge(InstanceState::Stopped, InstanceState::Finish, Trigger::Action(InstanceAction::Destroy)),
];

/// Actions legal from `state`, in graph order.
pub fn actions_for(state: InstanceState) -> Vec<InstanceAction> {
    TRANSITIONS
        .iter()
        .filter(|t| t.from == state)
        .filter_map(|t| match t.trigger {
            Trigger::Action(action) => Some(action),
            Trigger::Automatic => None,
        })
        .collect()
}

/// Whether `action` is legal from `state`.
pub fn is_allowed(state: InstanceState, action: InstanceAction) -> bool {
    TRANSITIONS
        .iter()
        .any(|t| t.from == state && t.trigger == Trigger::Action(action))
}

/// Compute the displayed state.
///
/// Without a resolvable boot disk the instance is still provisioning and
/// shows `PENDING` whatever VirtualBox says. Otherwise the native state is
/// mapped onto the enum.
pub fn display_state(native: &str, has_boot_disk: bool) -> InstanceState {
    if !has_boot_disk {
        return InstanceState::Pending;
    }

    map_native_state(native)
}

/// Map a VirtualBox `VMState` value onto the normalized enum.
pub fn map_native_state(native: &str) -> InstanceState {
    match native.trim().to_ascii_lowercase().as_str() {
        "poweroff" => InstanceState::Start,
        "aborted" | "saved" | "paused" => InstanceState::Stopped,
        "running" => InstanceState::Running,
        "stopping" => InstanceState::Stopping,
        // Transient states on the way to or while still running
        "starting" | "restoring" | "teleportingin" | "livesnapshotting" | "onlinesnapshotting"
        | "teleporting" | "deletingsnapshotlive" | "settingup" => InstanceState::Running,
        "saving" => InstanceState::Stopping,
        // Offline maintenance on a powered-off machine
        "snapshotting" | "restoringsnapshot" | "deletingsnapshot" => InstanceState::Start,
        // teleported, stuck, gurumeditation, paused variants and anything new
        _ => InstanceState::Stopped,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_boot_disk_is_always_pending() {
        for native in ["poweroff", "running", "paused", "aborted", "saved", "whatever"] {
            assert_eq!(display_state(native, false), InstanceState::Pending);
        }
    }

    #[test]
    fn test_boot_disk_is_never_pending() {
        for native in [
            "poweroff", "running", "paused", "aborted", "saved", "starting", "stopping",
            "saving", "snapshotting", "gurumeditation", "", "unknown-future-state",
        ] {
            assert_ne!(display_state(native, true), InstanceState::Pending, "native={native}");
        }
    }

    #[test]
    fn test_native_mapping() {
        assert_eq!(display_state("poweroff", true), InstanceState::Start);
        assert_eq!(display_state("aborted", true), InstanceState::Stopped);
        assert_eq!(display_state("saved", true), InstanceState::Stopped);
        assert_eq!(display_state("paused", true), InstanceState::Stopped);
        assert_eq!(display_state("running", true), InstanceState::Running);
        assert_eq!(display_state("Running", true), InstanceState::Running);
        assert_eq!(display_state("stopping", true), InstanceState::Stopping);
    }

    #[test]
    fn test_actions_match_graph() {
        use InstanceAction::*;

        assert_eq!(actions_for(InstanceState::Start), vec![Start, Destroy]);
        assert!(actions_for(InstanceState::Pending).is_empty());
        assert_eq!(actions_for(InstanceState::Running), vec![Reboot, Stop, Destroy]);
        assert!(actions_for(InstanceState::Stopping).is_empty());
        assert_eq!(actions_for(InstanceState::Stopped), vec![Start, Destroy]);
        assert!(actions_for(InstanceState::Finish).is_empty());
    }

    #[test]
    fn test_is_allowed() {
        assert!(is_allowed(InstanceState::Running, InstanceAction::Stop));
        assert!(!is_allowed(InstanceState::Stopped, InstanceAction::Stop));
        assert!(!is_allowed(InstanceState::Pending, InstanceAction::Destroy));
    }

    #[test]
    fn test_state_serializes_uppercase() {
        assert_eq!(serde_json::to_string(&InstanceState::Running).unwrap(), "\"RUNNING\"");
        assert_eq!(InstanceState::parse("stopped"), Some(InstanceState::Stopped));
        assert_eq!(InstanceState::parse("bogus"), None);
    }
}
