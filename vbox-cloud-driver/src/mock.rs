//! In-memory VBoxManage for testing and development.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info};

use crate::command::{CommandExecutor, ToolOutput};
use crate::error::{DriverError, Result};

/// Mock VBoxManage executor.
///
/// Keeps a small VirtualBox inventory in memory and answers subcommands with
/// text in the same shapes the real tool prints. Useful for:
/// - Unit and integration testing of the driver
/// - Development without VirtualBox installed (`--dev`)
pub struct MockVBoxManage {
    state: RwLock<MockState>,
    invocations: RwLock<Vec<Vec<String>>>,
    failures: RwLock<HashMap<String, String>>,
    clone_gate: RwLock<Option<Arc<Semaphore>>>,
}

#[derive(Default)]
struct MockState {
    vms: Vec<MockVm>,
    media: Vec<MockMedium>,
}

struct MockVm {
    uuid: String,
    name: String,
    ostype: String,
    state: String,
    state_change: String,
    cpus: u32,
    memory_mb: u64,
    controllers: Vec<MockController>,
    extradata: HashMap<String, String>,
    guest_ip: Option<String>,
}

struct MockController {
    name: String,
    controller_type: String,
    ports: u32,
    devices: u32,
    slots: HashMap<(u32, u32), MockAttachment>,
}

#[derive(Clone)]
struct MockAttachment {
    medium_uuid: String,
    location: String,
}

struct MockMedium {
    uuid: String,
    location: String,
    capacity_mb: u64,
}

impl MockVm {
    fn new(name: &str, cpus: u32, memory_mb: u64) -> Self {
        Self {
            uuid: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            ostype: "Linux".to_string(),
            state: "poweroff".to_string(),
            state_change: now_timestamp(),
            cpus,
            memory_mb,
            controllers: Vec::new(),
            extradata: HashMap::new(),
            guest_ip: None,
        }
    }

    fn set_state(&mut self, state: &str) {
        self.state = state.to_string();
        self.state_change = now_timestamp();
    }

    fn controller_mut(&mut self, name: &str) -> Option<&mut MockController> {
        self.controllers.iter_mut().find(|c| c.name == name)
    }

    fn render(&self) -> String {
        let mut lines = vec![
            format!("name=\"{}\"", self.name),
            "groups=\"/\"".to_string(),
            format!("ostype=\"{}\"", self.ostype),
            format!("UUID=\"{}\"", self.uuid),
            format!("CfgFile=\"/vms/{0}/{0}.vbox\"", self.name),
            format!("memory={}", self.memory_mb),
            "vram=16".to_string(),
            format!("cpus={}", self.cpus),
            format!("VMState=\"{}\"", self.state),
            format!("VMStateChangeTime=\"{}\"", self.state_change),
        ];

        for (i, controller) in self.controllers.iter().enumerate() {
            lines.push(format!("storagecontrollername{}=\"{}\"", i, controller.name));
            lines.push(format!("storagecontrollertype{}=\"{}\"", i, controller.controller_type));
            lines.push(format!("storagecontrollerinstance{}=\"0\"", i));
            lines.push(format!("storagecontrollerportcount{}=\"{}\"", i, controller.ports));
            lines.push(format!("storagecontrollerbootable{}=\"on\"", i));
        }

        for controller in &self.controllers {
            for port in 0..controller.ports {
                for device in 0..controller.devices {
                    match controller.slots.get(&(port, device)) {
                        Some(attachment) => {
                            lines.push(format!("\"{}-{}-{}\"=\"{}\"", controller.name, port, device, attachment.location));
                            lines.push(format!(
                                "\"{}-ImageUUID-{}-{}\"=\"{}\"",
                                controller.name, port, device, attachment.medium_uuid
                            ));
                        }
                        None => lines.push(format!("\"{}-{}-{}\"=\"none\"", controller.name, port, device)),
                    }
                }
            }
        }

        lines.push("nic1=\"bridged\"".to_string());
        lines.join("\n")
    }

    fn attached_media(&self) -> impl Iterator<Item = &MockAttachment> {
        self.controllers.iter().flat_map(|c| c.slots.values())
    }
}

impl MockController {
    fn new(name: &str, bus: &str, controller_type: &str) -> Self {
        let (ports, devices) = if bus.eq_ignore_ascii_case("ide") { (2, 2) } else { (4, 1) };
        Self {
            name: name.to_string(),
            controller_type: controller_type.to_string(),
            ports,
            devices,
            slots: HashMap::new(),
        }
    }
}

impl MockState {
    fn find_vm(&self, id: &str) -> Option<&MockVm> {
        self.vms.iter().find(|vm| vm.uuid == id || vm.name == id)
    }

    fn find_vm_mut(&mut self, id: &str) -> Option<&mut MockVm> {
        self.vms.iter_mut().find(|vm| vm.uuid == id || vm.name == id)
    }

    fn find_medium(&self, id: &str) -> Option<&MockMedium> {
        self.media.iter().find(|m| m.uuid == id || m.location == id)
    }

    fn owner_of(&self, medium_uuid: &str) -> Option<&MockVm> {
        self.vms
            .iter()
            .find(|vm| vm.attached_media().any(|a| a.medium_uuid == medium_uuid))
    }

    fn render_medium(&self, medium: &MockMedium) -> String {
        let mut lines = vec![
            format!("UUID:           {}", medium.uuid),
            "Parent UUID:    base".to_string(),
            "State:          created".to_string(),
            "Type:           normal (base)".to_string(),
            format!("Location:       {}", medium.location),
            "Storage format: VDI".to_string(),
            "Format variant: dynamic default".to_string(),
            format!("Capacity:       {} MBytes", medium.capacity_mb),
            "Encryption:     disabled".to_string(),
        ];

        if let Some(vm) = self.owner_of(&medium.uuid) {
            lines.push(format!("In use by VMs:  {} (UUID: {})", vm.name, vm.uuid));
        }

        lines.join("\n")
    }
}

impl MockVBoxManage {
    /// Create an empty mock inventory.
    pub fn new() -> Self {
        info!("Creating mock VBoxManage");
        Self {
            state: RwLock::new(MockState::default()),
            invocations: RwLock::new(Vec::new()),
            failures: RwLock::new(HashMap::new()),
            clone_gate: RwLock::new(None),
        }
    }

    // =========================================================================
    // Seeding
    // =========================================================================

    /// Register a VM without storage. Returns its UUID.
    pub fn add_vm(&self, name: &str, cpus: u32, memory_mb: u64) -> String {
        let vm = MockVm::new(name, cpus, memory_mb);
        let uuid = vm.uuid.clone();
        self.write_state().vms.push(vm);
        uuid
    }

    /// Register a powered-off VM with a `.vdi` on `IDE Controller` port 0 device 0.
    pub fn add_vm_with_disk(&self, name: &str, cpus: u32, memory_mb: u64, capacity_mb: u64) -> String {
        let mut vm = MockVm::new(name, cpus, memory_mb);
        let medium = MockMedium {
            uuid: uuid::Uuid::new_v4().to_string(),
            location: format!("/vms/{0}/{0}.vdi", name),
            capacity_mb,
        };

        let mut controller = MockController::new("IDE Controller", "ide", "PIIX4");
        controller.slots.insert(
            (0, 0),
            MockAttachment {
                medium_uuid: medium.uuid.clone(),
                location: medium.location.clone(),
            },
        );
        vm.controllers.push(controller);

        let uuid = vm.uuid.clone();
        let mut state = self.write_state();
        state.media.push(medium);
        state.vms.push(vm);
        uuid
    }

    /// Register a medium not attached to any VM. Returns its UUID.
    pub fn add_detached_disk(&self, location: &str, capacity_mb: u64) -> String {
        let uuid = uuid::Uuid::new_v4().to_string();
        self.write_state().media.push(MockMedium {
            uuid: uuid.clone(),
            location: location.to_string(),
            capacity_mb,
        });
        uuid
    }

    /// Add a controller to an existing VM.
    pub fn add_controller(&self, vm_id: &str, name: &str, bus: &str, controller_type: &str) {
        if let Some(vm) = self.write_state().find_vm_mut(vm_id) {
            vm.controllers.push(MockController::new(name, bus, controller_type));
        }
    }

    /// Put an ISO (or any path) into a controller slot.
    pub fn attach_medium(&self, vm_id: &str, controller: &str, port: u32, device: u32, location: &str) {
        if let Some(c) = self
            .write_state()
            .find_vm_mut(vm_id)
            .and_then(|vm| vm.controller_mut(controller))
        {
            c.slots.insert(
                (port, device),
                MockAttachment {
                    medium_uuid: uuid::Uuid::new_v4().to_string(),
                    location: location.to_string(),
                },
            );
        }
    }

    /// Force a native VM state (e.g. "aborted").
    pub fn set_vm_state(&self, vm_id: &str, native_state: &str) {
        if let Some(vm) = self.write_state().find_vm_mut(vm_id) {
            vm.set_state(native_state);
        }
    }

    /// Publish a guest IP as Guest Additions would.
    pub fn set_guest_ip(&self, vm_id: &str, ip: &str) {
        if let Some(vm) = self.write_state().find_vm_mut(vm_id) {
            vm.guest_ip = Some(ip.to_string());
        }
    }

    /// Make every call of `subcommand` fail with `stderr`.
    pub fn fail_subcommand(&self, subcommand: &str, stderr: &str) {
        self.failures
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(subcommand.to_string(), stderr.to_string());
    }

    /// Block `clonehd` until [`release_clones`](Self::release_clones).
    pub fn hold_clones(&self) {
        *self.clone_gate.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(Semaphore::new(0)));
    }

    /// Let held and future `clonehd` calls proceed.
    pub fn release_clones(&self) {
        if let Some(gate) = self.clone_gate.write().unwrap_or_else(|e| e.into_inner()).take() {
            gate.add_permits(Semaphore::MAX_PERMITS / 2);
        }
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    /// Every invocation so far, without the `-q` flag.
    pub fn invocations(&self) -> Vec<Vec<String>> {
        self.invocations.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Invocations whose subcommand is `subcommand`.
    pub fn invocations_of(&self, subcommand: &str) -> Vec<Vec<String>> {
        self.invocations()
            .into_iter()
            .filter(|args| args.first().map(String::as_str) == Some(subcommand))
            .collect()
    }

    pub fn vm_exists(&self, vm_id: &str) -> bool {
        self.read_state().find_vm(vm_id).is_some()
    }

    /// Native state of a VM.
    pub fn vm_state(&self, vm_id: &str) -> Option<String> {
        self.read_state().find_vm(vm_id).map(|vm| vm.state.clone())
    }

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, MockState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, MockState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    // =========================================================================
    // Subcommands
    // =========================================================================

    fn handle(&self, args: &[String]) -> ToolOutput {
        let argv: Vec<&str> = args.iter().map(String::as_str).collect();

        match argv.as_slice() {
            ["list", "vms"] => self.list_vms(),
            ["list", "hdds"] => self.list_hdds(),
            ["showvminfo", "--machinereadable", id] => self.show_vm_info(id),
            ["showhdinfo", id] => self.show_hd_info(id),
            ["guestproperty", "get", id, _property] => self.guest_property(id),
            ["getextradata", id, key] => self.get_extradata(id, key),
            ["setextradata", id, key, value] => self.set_extradata(id, key, value),
            ["createvm", "--name", name, "--register"] => self.create_vm(name),
            ["modifyvm", id, flags @ ..] => self.modify_vm(id, flags),
            ["clonehd", source, target, ..] => self.clone_hd(source, target),
            ["storagectl", id, flags @ ..] => self.storage_ctl(id, flags),
            ["storageattach", id, flags @ ..] => self.storage_attach(id, flags),
            ["controlvm", id, action] => self.control_vm(id, action),
            ["startvm", id, ..] => self.start_vm(id),
            ["unregistervm", id, ..] => self.unregister_vm(id),
            _ => ToolOutput::failed(1, format!("VBoxManage: error: Unknown command {:?}", argv)),
        }
    }

    fn list_vms(&self) -> ToolOutput {
        let state = self.read_state();
        let lines: Vec<String> = state
            .vms
            .iter()
            .map(|vm| format!("\"{}\" {{{}}}", vm.name, vm.uuid))
            .collect();
        ToolOutput::ok(lines.join("\n"))
    }

    fn list_hdds(&self) -> ToolOutput {
        let state = self.read_state();
        let blocks: Vec<String> = state.media.iter().map(|m| state.render_medium(m)).collect();
        ToolOutput::ok(blocks.join("\n\n"))
    }

    fn show_vm_info(&self, id: &str) -> ToolOutput {
        match self.read_state().find_vm(id) {
            Some(vm) => ToolOutput::ok(vm.render()),
            None => vm_not_found(id),
        }
    }

    fn show_hd_info(&self, id: &str) -> ToolOutput {
        let state = self.read_state();
        match state.find_medium(id) {
            Some(medium) => ToolOutput::ok(state.render_medium(medium)),
            None => ToolOutput::failed(
                1,
                format!("VBoxManage: error: Could not find file for the medium '{}'", id),
            ),
        }
    }

    fn guest_property(&self, id: &str) -> ToolOutput {
        match self.read_state().find_vm(id) {
            Some(vm) => match &vm.guest_ip {
                Some(ip) => ToolOutput::ok(format!("Value: {}", ip)),
                None => ToolOutput::ok("No value set!"),
            },
            None => vm_not_found(id),
        }
    }

    fn get_extradata(&self, id: &str, key: &str) -> ToolOutput {
        match self.read_state().find_vm(id) {
            Some(vm) => match vm.extradata.get(key) {
                Some(value) => ToolOutput::ok(format!("Value: {}", value)),
                None => ToolOutput::ok("No value set!"),
            },
            None => vm_not_found(id),
        }
    }

    fn set_extradata(&self, id: &str, key: &str, value: &str) -> ToolOutput {
        match self.write_state().find_vm_mut(id) {
            Some(vm) => {
                vm.extradata.insert(key.to_string(), value.to_string());
                ToolOutput::ok("")
            }
            None => vm_not_found(id),
        }
    }

    fn create_vm(&self, name: &str) -> ToolOutput {
        let mut state = self.write_state();
        if state.vms.iter().any(|vm| vm.name == name) {
            return ToolOutput::failed(
                1,
                format!("VBoxManage: error: Machine settings file '/vms/{0}/{0}.vbox' already exists", name),
            );
        }

        let vm = MockVm::new(name, 1, 128);
        let uuid = vm.uuid.clone();
        state.vms.push(vm);

        ToolOutput::ok(format!(
            "Virtual machine '{0}' is created and registered.\nUUID: {1}\nSettings file: '/vms/{0}/{0}.vbox'",
            name, uuid
        ))
    }

    fn modify_vm(&self, id: &str, flags: &[&str]) -> ToolOutput {
        let mut state = self.write_state();
        let Some(vm) = state.find_vm_mut(id) else {
            return vm_not_found(id);
        };

        let options = flag_values(flags);
        if let Some(memory) = options.get("--memory").and_then(|v| v.parse().ok()) {
            vm.memory_mb = memory;
        }
        if let Some(cpus) = options.get("--cpus").and_then(|v| v.parse().ok()) {
            vm.cpus = cpus;
        }
        if let Some(ostype) = options.get("--ostype") {
            vm.ostype = ostype.to_string();
        }

        ToolOutput::ok("")
    }

    fn clone_hd(&self, source: &str, target: &str) -> ToolOutput {
        let mut state = self.write_state();
        let Some(capacity_mb) = state.find_medium(source).map(|m| m.capacity_mb) else {
            return ToolOutput::failed(
                1,
                format!("VBoxManage: error: Could not find file for the medium '{}'", source),
            );
        };

        if state.find_medium(target).is_some() {
            return ToolOutput::failed(
                1,
                format!("VBoxManage: error: Cannot create the clone medium '{}': file exists", target),
            );
        }

        let uuid = uuid::Uuid::new_v4().to_string();
        state.media.push(MockMedium {
            uuid: uuid.clone(),
            location: target.to_string(),
            capacity_mb,
        });

        ToolOutput::ok(format!(
            "0%...10%...20%...30%...40%...50%...60%...70%...80%...90%...100%\nClone medium created in format 'VDI'. UUID: {}",
            uuid
        ))
    }

    fn storage_ctl(&self, id: &str, flags: &[&str]) -> ToolOutput {
        let options = flag_values(flags);
        let (Some(name), Some(bus)) = (options.get("--name"), options.get("--add")) else {
            return ToolOutput::failed(1, "VBoxManage: error: Invalid storagectl arguments");
        };
        let controller_type = options.get("--controller").copied().unwrap_or("PIIX4");

        let mut state = self.write_state();
        let Some(vm) = state.find_vm_mut(id) else {
            return vm_not_found(id);
        };

        if vm.controllers.iter().any(|c| c.name == *name) {
            return ToolOutput::failed(
                1,
                format!("VBoxManage: error: Storage controller named '{}' already exists", name),
            );
        }

        vm.controllers.push(MockController::new(name, bus, controller_type));
        ToolOutput::ok("")
    }

    fn storage_attach(&self, id: &str, flags: &[&str]) -> ToolOutput {
        let options = flag_values(flags);
        let (Some(controller), Some(port), Some(device), Some(medium)) = (
            options.get("--storagectl"),
            options.get("--port").and_then(|v| v.parse::<u32>().ok()),
            options.get("--device").and_then(|v| v.parse::<u32>().ok()),
            options.get("--medium"),
        ) else {
            return ToolOutput::failed(1, "VBoxManage: error: Invalid storageattach arguments");
        };
        let medium_type = options.get("--type").copied().unwrap_or("hdd");

        let mut state = self.write_state();
        let attachment = if medium_type == "hdd" {
            match state.find_medium(medium) {
                Some(m) => MockAttachment {
                    medium_uuid: m.uuid.clone(),
                    location: m.location.clone(),
                },
                None => {
                    return ToolOutput::failed(
                        1,
                        format!("VBoxManage: error: Could not find file for the medium '{}'", medium),
                    );
                }
            }
        } else {
            MockAttachment {
                medium_uuid: uuid::Uuid::new_v4().to_string(),
                location: medium.to_string(),
            }
        };

        let Some(vm) = state.find_vm_mut(id) else {
            return vm_not_found(id);
        };
        let Some(c) = vm.controller_mut(controller) else {
            return ToolOutput::failed(
                1,
                format!("VBoxManage: error: Could not find a controller named '{}'", controller),
            );
        };

        if port >= c.ports || device >= c.devices {
            return ToolOutput::failed(1, "VBoxManage: error: The port and/or device parameter are out of range");
        }

        c.slots.insert((port, device), attachment);
        ToolOutput::ok("")
    }

    fn control_vm(&self, id: &str, action: &str) -> ToolOutput {
        let mut state = self.write_state();
        let Some(vm) = state.find_vm_mut(id) else {
            return vm_not_found(id);
        };

        let next = match (action, vm.state.as_str()) {
            ("pause", "running") => "paused",
            ("resume", "paused") => "running",
            ("reset", "running") => "running",
            ("poweroff", "running" | "paused" | "stuck") => "poweroff",
            _ => {
                return ToolOutput::failed(
                    1,
                    format!("VBoxManage: error: Machine '{}' is not currently running", vm.name),
                );
            }
        };

        debug!(vm = %vm.name, action = %action, next = %next, "Mock controlvm");
        vm.set_state(next);
        ToolOutput::ok("")
    }

    fn start_vm(&self, id: &str) -> ToolOutput {
        let mut state = self.write_state();
        let Some(vm) = state.find_vm_mut(id) else {
            return vm_not_found(id);
        };

        if !matches!(vm.state.as_str(), "poweroff" | "aborted" | "saved") {
            return ToolOutput::failed(
                1,
                format!("VBoxManage: error: The machine '{}' is already locked for a session", vm.name),
            );
        }

        vm.set_state("running");
        ToolOutput::ok(format!("Waiting for VM \"{}\" to power on...\nVM \"{}\" has been successfully started.", vm.uuid, vm.uuid))
    }

    fn unregister_vm(&self, id: &str) -> ToolOutput {
        let mut state = self.write_state();
        let Some(index) = state.vms.iter().position(|vm| vm.uuid == id || vm.name == id) else {
            return vm_not_found(id);
        };

        if matches!(state.vms[index].state.as_str(), "running" | "paused") {
            return ToolOutput::failed(
                1,
                "VBoxManage: error: Cannot unregister the machine because it is locked by a session",
            );
        }

        let vm = state.vms.remove(index);
        let disks: Vec<String> = vm.attached_media().map(|a| a.medium_uuid.clone()).collect();
        state.media.retain(|m| !disks.contains(&m.uuid));

        ToolOutput::ok("0%...10%...20%...30%...40%...50%...60%...70%...80%...90%...100%")
    }
}

impl Default for MockVBoxManage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CommandExecutor for MockVBoxManage {
    async fn invoke(&self, args: &[String], _timeout: Duration) -> Result<ToolOutput> {
        self.invocations
            .write()
            .map_err(|_| DriverError::Internal("Lock poisoned".to_string()))?
            .push(args.to_vec());

        let subcommand = args.first().cloned().unwrap_or_default();
        let injected = self
            .failures
            .read()
            .map_err(|_| DriverError::Internal("Lock poisoned".to_string()))?
            .get(&subcommand)
            .cloned();
        if let Some(stderr) = injected {
            return Ok(ToolOutput::failed(1, stderr));
        }

        if subcommand == "clonehd" {
            let gate = self
                .clone_gate
                .read()
                .map_err(|_| DriverError::Internal("Lock poisoned".to_string()))?
                .clone();
            if let Some(gate) = gate {
                debug!("Mock clone waiting for release");
                let permit = gate
                    .acquire()
                    .await
                    .map_err(|e| DriverError::Internal(e.to_string()))?;
                permit.forget();
            }
        }

        Ok(self.handle(args))
    }
}

fn vm_not_found(id: &str) -> ToolOutput {
    ToolOutput::failed(
        1,
        format!("VBoxManage: error: Could not find a registered machine named '{}'", id),
    )
}

/// Pair `--flag value` arguments.
fn flag_values<'a>(flags: &[&'a str]) -> HashMap<&'a str, &'a str> {
    flags
        .windows(2)
        .filter(|pair| pair[0].starts_with("--") && !pair[1].starts_with("--"))
        .map(|pair| (pair[0], pair[1]))
        .collect()
}

fn now_timestamp() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.9f").to_string()
}
