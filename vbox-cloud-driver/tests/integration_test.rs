//! Integration tests for the VirtualBox driver.
//!
//! These tests drive the full operation set against the in-memory VBoxManage.

use std::path::Path;
use std::sync::Arc;

use vbox_cloud_driver::cloudinit::{attach_seed_media, SeedAttachment};
use vbox_cloud_driver::*;

fn setup() -> (Arc<MockVBoxManage>, VirtualBoxDriver) {
    let mock = Arc::new(MockVBoxManage::new());
    let vbox = VBoxManage::new(mock.clone(), CommandTimeouts::default());
    let config = DriverConfig {
        owner: "tester".to_string(),
        media_dir: std::env::temp_dir().join("vbox-cloud-tests"),
        ..Default::default()
    };
    let driver = VirtualBoxDriver::new(vbox, HardwareProfileCatalog::default(), config)
        .with_iso_generator(CloudInitGenerator::with_tool(IsoTool::Mkisofs(
            "/nonexistent/genisoimage".to_string(),
        )));

    (mock, driver)
}

fn creds() -> Credentials {
    Credentials::default()
}

async fn find_instance(driver: &VirtualBoxDriver, id: &str) -> Option<Instance> {
    driver
        .list_instances(&creds(), &DriverOptions::new().with_id(id))
        .await
        .unwrap()
        .into_iter()
        .next()
}

/// Create, observe PENDING while cloning, then START with the requested profile.
#[tokio::test]
async fn test_create_instance_end_to_end() {
    let (mock, driver) = setup();
    let base = mock.add_vm_with_disk("base", 2, 2048, 10240);
    mock.hold_clones();

    let instance = driver
        .create_instance(&creds(), &base, &DriverOptions::new().with_name("web-01").with_hwp_id("small"))
        .await
        .unwrap();

    assert_eq!(instance.name, "web-01");
    assert_eq!(instance.state, InstanceState::Pending);
    assert!(instance.actions.is_empty());
    assert_eq!(instance.image_id, base);
    assert_eq!(instance.owner_id, "tester");

    let listed = find_instance(&driver, &instance.id).await.unwrap();
    assert_eq!(listed.state, InstanceState::Pending);
    assert_eq!(driver.provision_status(&instance.id).await, Some(ProvisionStatus::InProgress));

    mock.release_clones();
    assert_eq!(driver.wait_for_provisioning(&instance.id).await, Some(ProvisionStatus::Completed));

    let provisioned = find_instance(&driver, &instance.id).await.unwrap();
    assert_eq!(provisioned.state, InstanceState::Start);
    assert_eq!(provisioned.hardware_profile.id, "small");
    assert_eq!(provisioned.storage_volumes.len(), 1);
    assert_eq!(provisioned.actions, vec![InstanceAction::Start, InstanceAction::Destroy]);

    let clones = mock.invocations_of("clonehd");
    assert_eq!(clones.len(), 1);
    assert_eq!(clones[0][1], "/vms/base/base.vdi");
    assert_eq!(clones[0][2], "/vms/base/web-01.vdi");

    let modify = &mock.invocations_of("modifyvm")[0];
    for flag in ["--memory", "--cpus", "--vram", "--nic1", "--bridgeadapter1", "--cableconnected1"] {
        assert!(modify.iter().any(|arg| arg == flag), "missing {flag}");
    }
}

/// Without a name or profile the source name and shape are reused.
#[tokio::test]
async fn test_create_instance_defaults() {
    let (mock, driver) = setup();
    let base = mock.add_vm_with_disk("base", 2, 2048, 10240);

    let instance = driver
        .create_instance(&creds(), &base, &DriverOptions::new())
        .await
        .unwrap();
    driver.wait_for_provisioning(&instance.id).await;

    assert!(instance.name.starts_with("base - "));
    assert_eq!(instance.hardware_profile.id, "medium");

    let provisioned = find_instance(&driver, &instance.id).await.unwrap();
    assert_eq!(provisioned.state, InstanceState::Start);
    assert_eq!(provisioned.image_id, base);
}

/// Bad requests fail before anything is registered.
#[tokio::test]
async fn test_create_instance_rejects_bad_requests() {
    let (mock, driver) = setup();
    let base = mock.add_vm_with_disk("base", 1, 1024, 1024);
    let diskless = mock.add_vm("diskless", 1, 1024);

    let err = driver
        .create_instance(&creds(), "missing", &DriverOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(err, DriverError::NotFound(_)));

    let err = driver
        .create_instance(&creds(), &diskless, &DriverOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(err, DriverError::InvalidState(_)));

    let err = driver
        .create_instance(&creds(), &base, &DriverOptions::new().with_hwp_id("huge"))
        .await
        .unwrap_err();
    assert!(matches!(err, DriverError::InvalidConfig(_)));

    assert!(mock.invocations_of("createvm").is_empty());
}

/// Destroying twice ends in the same place both times.
#[tokio::test]
async fn test_destroy_is_idempotent() {
    let (mock, driver) = setup();
    let base = mock.add_vm_with_disk("base", 1, 1024, 1024);
    let instance = driver
        .create_instance(&creds(), &base, &DriverOptions::new().with_name("web"))
        .await
        .unwrap();
    driver.wait_for_provisioning(&instance.id).await;

    driver.destroy_instance(&creds(), &instance.id).await.unwrap();
    assert!(find_instance(&driver, &instance.id).await.is_none());
    assert!(!mock.vm_exists(&instance.id));

    driver.destroy_instance(&creds(), &instance.id).await.unwrap();
    assert!(find_instance(&driver, &instance.id).await.is_none());
    assert_eq!(mock.invocations_of("unregistervm").len(), 1);
    assert_eq!(driver.provision_status(&instance.id).await, None);
}

/// A running instance is powered off before it is unregistered.
#[tokio::test]
async fn test_destroy_running_instance() {
    let (mock, driver) = setup();
    let vm = mock.add_vm_with_disk("web", 1, 1024, 1024);
    mock.set_vm_state(&vm, "running");

    driver.destroy_instance(&creds(), &vm).await.unwrap();

    assert!(!mock.vm_exists(&vm));
    let controls = mock.invocations_of("controlvm");
    assert_eq!(controls, vec![vec!["controlvm".to_string(), vm.clone(), "poweroff".to_string()]]);
}

/// start, stop, start (resume) and reboot walk the state graph.
#[tokio::test]
async fn test_lifecycle_transitions() {
    let (mock, driver) = setup();
    let vm = mock.add_vm_with_disk("web", 1, 1024, 1024);

    let err = driver.stop_instance(&creds(), &vm).await.unwrap_err();
    assert!(matches!(err, DriverError::InvalidState(_)));

    let running = driver.start_instance(&creds(), &vm).await.unwrap();
    assert_eq!(running.state, InstanceState::Running);
    assert_eq!(
        running.actions,
        vec![InstanceAction::Reboot, InstanceAction::Stop, InstanceAction::Destroy]
    );

    let rebooted = driver.reboot_instance(&creds(), &vm).await.unwrap();
    assert_eq!(rebooted.state, InstanceState::Running);

    let stopped = driver.stop_instance(&creds(), &vm).await.unwrap();
    assert_eq!(stopped.state, InstanceState::Stopped);
    assert_eq!(mock.vm_state(&vm).as_deref(), Some("paused"));

    let err = driver.reboot_instance(&creds(), &vm).await.unwrap_err();
    assert!(matches!(err, DriverError::InvalidState(_)));

    let resumed = driver.start_instance(&creds(), &vm).await.unwrap();
    assert_eq!(resumed.state, InstanceState::Running);

    let controls: Vec<String> = mock
        .invocations_of("controlvm")
        .into_iter()
        .map(|args| args[2].clone())
        .collect();
    assert_eq!(controls, vec!["reset", "pause", "resume"]);
    assert_eq!(mock.invocations_of("startvm").len(), 1);
}

/// Aborted VMs show STOPPED and start with a fresh power-on.
#[tokio::test]
async fn test_aborted_instance_restarts() {
    let (mock, driver) = setup();
    let vm = mock.add_vm_with_disk("web", 1, 1024, 1024);
    mock.set_vm_state(&vm, "aborted");

    assert_eq!(find_instance(&driver, &vm).await.unwrap().state, InstanceState::Stopped);

    let started = driver.start_instance(&creds(), &vm).await.unwrap();
    assert_eq!(started.state, InstanceState::Running);
    assert!(mock.invocations_of("controlvm").is_empty());
}

/// Actions on unknown instances are NotFound.
#[tokio::test]
async fn test_actions_on_missing_instance() {
    let (_mock, driver) = setup();

    let err = driver.start_instance(&creds(), "missing").await.unwrap_err();
    assert!(matches!(err, DriverError::NotFound(_)));
}

/// A PENDING instance refuses every action while provisioning runs.
#[tokio::test]
async fn test_pending_instance_rejects_actions() {
    let (mock, driver) = setup();
    let base = mock.add_vm_with_disk("base", 1, 1024, 1024);
    mock.hold_clones();

    let instance = driver
        .create_instance(&creds(), &base, &DriverOptions::new().with_name("web"))
        .await
        .unwrap();

    let err = driver.start_instance(&creds(), &instance.id).await.unwrap_err();
    assert!(matches!(err, DriverError::InvalidState(_)));

    let err = driver.destroy_instance(&creds(), &instance.id).await.unwrap_err();
    assert!(matches!(err, DriverError::InvalidState(_)));

    mock.release_clones();
    driver.wait_for_provisioning(&instance.id).await;
    driver.destroy_instance(&creds(), &instance.id).await.unwrap();
}

/// A failed clone is reported and the stranded VM can still be destroyed.
#[tokio::test]
async fn test_failed_provisioning_is_reported() {
    let (mock, driver) = setup();
    let base = mock.add_vm_with_disk("base", 1, 1024, 1024);
    mock.fail_subcommand("clonehd", "VBOX_E_FILE_ERROR: disk full");

    let instance = driver
        .create_instance(&creds(), &base, &DriverOptions::new().with_name("web"))
        .await
        .unwrap();

    match driver.wait_for_provisioning(&instance.id).await {
        Some(ProvisionStatus::Failed { reason }) => assert!(reason.contains("VBOX_E_FILE_ERROR")),
        other => panic!("unexpected status: {other:?}"),
    }

    assert_eq!(find_instance(&driver, &instance.id).await.unwrap().state, InstanceState::Pending);

    driver.destroy_instance(&creds(), &instance.id).await.unwrap();
    assert!(!mock.vm_exists(&instance.id));
}

/// Cloud-init failures surface through the provisioning status.
#[tokio::test]
async fn test_cloud_init_failure_is_reported() {
    let (mock, driver) = setup();
    let base = mock.add_vm_with_disk("base", 1, 1024, 1024);

    let instance = driver
        .create_instance(
            &creds(),
            &base,
            &DriverOptions::new().with_name("web").with_user_data("#cloud-config\n"),
        )
        .await
        .unwrap();

    match driver.wait_for_provisioning(&instance.id).await {
        Some(ProvisionStatus::Failed { reason }) => assert!(reason.contains("Cloud-init")),
        other => panic!("unexpected status: {other:?}"),
    }

    // The disk was attached before the ISO step
    assert_eq!(find_instance(&driver, &instance.id).await.unwrap().state, InstanceState::Start);
}

/// Two creates from one source both complete.
#[tokio::test]
async fn test_concurrent_creates_from_one_source() {
    let (mock, driver) = setup();
    let base = mock.add_vm_with_disk("base", 1, 1024, 1024);
    mock.hold_clones();

    let a = driver
        .create_instance(&creds(), &base, &DriverOptions::new().with_name("a"))
        .await
        .unwrap();
    let b = driver
        .create_instance(&creds(), &base, &DriverOptions::new().with_name("b"))
        .await
        .unwrap();

    mock.release_clones();
    assert_eq!(driver.wait_for_provisioning(&a.id).await, Some(ProvisionStatus::Completed));
    assert_eq!(driver.wait_for_provisioning(&b.id).await, Some(ProvisionStatus::Completed));

    let instances = driver
        .list_instances(&creds(), &DriverOptions::new().with_image_id(base.clone()))
        .await
        .unwrap();
    // The source reports itself as its own image
    assert_eq!(instances.len(), 3);
    assert!(instances.iter().all(|i| i.state == InstanceState::Start));
    assert_ne!(a.name, b.name);
}

/// Instance listing filters by state and image.
#[tokio::test]
async fn test_list_instances_filters() {
    let (mock, driver) = setup();
    let web = mock.add_vm_with_disk("web", 1, 1024, 1024);
    let db = mock.add_vm_with_disk("db", 4, 4096, 20480);
    mock.set_vm_state(&db, "running");
    mock.set_guest_ip(&db, "192.168.56.10");

    let all = driver.list_instances(&creds(), &DriverOptions::new()).await.unwrap();
    assert_eq!(all.len(), 2);

    let running = driver
        .list_instances(&creds(), &DriverOptions::new().with_state("running"))
        .await
        .unwrap();
    assert_eq!(running.len(), 1);
    assert_eq!(running[0].id, db);
    assert_eq!(running[0].hardware_profile.id, "large");
    assert_eq!(running[0].public_addresses, vec!["192.168.56.10"]);

    // Unknown origin: an instance is its own image
    let by_image = driver
        .list_instances(&creds(), &DriverOptions::new().with_image_id(web.clone()))
        .await
        .unwrap();
    assert_eq!(by_image.len(), 1);
    assert_eq!(by_image[0].id, web);

    let none = driver
        .list_instances(&creds(), &DriverOptions::new().with_id("missing"))
        .await
        .unwrap();
    assert!(none.is_empty());
}

/// Only VMs with a boot disk are images, sorted by description.
#[tokio::test]
async fn test_list_images() {
    let (mock, driver) = setup();
    let large = mock.add_vm_with_disk("large-base", 4, 4096, 20480);
    let small = mock.add_vm_with_disk("small-base", 1, 1024, 10240);
    mock.add_vm("empty", 1, 512);

    let images = driver.list_images(&creds(), &DriverOptions::new()).await.unwrap();
    assert_eq!(images.len(), 2);
    assert_eq!(images[0].id, small);
    assert_eq!(images[0].description, "1024 MB RAM, 1 CPU, 10.24 HDD");
    assert_eq!(images[1].id, large);
    assert_eq!(images[1].owner_id, "tester");
    assert_eq!(images[1].hardware_profiles, vec!["micro", "small", "medium", "large"]);

    let arch = driver.catalog().architecture().to_string();
    let same_arch = driver
        .list_images(&creds(), &DriverOptions::new().with_architecture(arch))
        .await
        .unwrap();
    assert_eq!(same_arch.len(), 2);

    let other_arch = driver
        .list_images(&creds(), &DriverOptions::new().with_architecture("sparc"))
        .await
        .unwrap();
    assert!(other_arch.is_empty());
}

/// Destroying an image removes it; destroying it again is a no-op.
#[tokio::test]
async fn test_destroy_image() {
    let (mock, driver) = setup();
    let base = mock.add_vm_with_disk("base", 1, 1024, 1024);

    driver.destroy_image(&creds(), &base).await.unwrap();
    assert!(!mock.vm_exists(&base));
    driver.destroy_image(&creds(), &base).await.unwrap();

    let images = driver.list_images(&creds(), &DriverOptions::new()).await.unwrap();
    assert!(images.is_empty());
}

/// Volumes cover attached and detached disks.
#[tokio::test]
async fn test_list_storage_volumes() {
    let (mock, driver) = setup();
    let vm = mock.add_vm_with_disk("web", 1, 1024, 10240);
    let detached = mock.add_detached_disk("/vms/spare.vdi", 5000);

    let volumes = driver
        .list_storage_volumes(&creds(), &DriverOptions::new())
        .await
        .unwrap();
    assert_eq!(volumes.len(), 2);

    let attached = volumes.iter().find(|v| v.id != detached).unwrap();
    assert_eq!(attached.instance_id, vm);
    assert_eq!(attached.capacity.as_deref(), Some("10.24"));
    assert_eq!(attached.state, "AVAILABLE");
    assert_eq!(attached.realm_id, "local");

    let spare = driver
        .list_storage_volumes(&creds(), &DriverOptions::new().with_id(detached.clone()))
        .await
        .unwrap();
    assert_eq!(spare.len(), 1);
    assert_eq!(spare[0].instance_id, "");
    assert_eq!(spare[0].capacity.as_deref(), Some("5.00"));
}

/// The single local realm and the configured profiles.
#[tokio::test]
async fn test_realms_and_profiles() {
    let (_mock, driver) = setup();

    let realms = driver.list_realms(&creds(), &DriverOptions::new()).await.unwrap();
    assert_eq!(realms.len(), 1);
    assert_eq!(realms[0].id, "local");
    assert_eq!(realms[0].state, "AVAILABLE");

    let none = driver
        .list_realms(&creds(), &DriverOptions::new().with_id("us-east"))
        .await
        .unwrap();
    assert!(none.is_empty());

    let profiles = driver
        .list_hardware_profiles(&creds(), &DriverOptions::new())
        .await
        .unwrap();
    assert_eq!(profiles.len(), 4);

    let small = driver
        .list_hardware_profiles(&creds(), &DriverOptions::new().with_id("small"))
        .await
        .unwrap();
    assert_eq!(small.len(), 1);
    assert_eq!((small[0].cpu, small[0].memory_mb), (1, 1024));
}

/// Volume management beyond listing is not supported.
#[tokio::test]
async fn test_unsupported_storage_operations() {
    let (_mock, driver) = setup();

    let err = driver
        .create_storage_volume(&creds(), &DriverOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(err, DriverError::UnsupportedOperation(_)));

    let err = driver
        .attach_storage_volume(&creds(), "vol", "vm")
        .await
        .unwrap_err();
    assert!(matches!(err, DriverError::UnsupportedOperation(_)));

    let err = driver.create_storage_snapshot(&creds(), "vol").await.unwrap_err();
    assert!(matches!(err, DriverError::UnsupportedOperation(_)));
}

/// Seed ISOs go into the first free IDE slot, creating a controller if needed.
#[tokio::test]
async fn test_attach_seed_media() {
    let mock = Arc::new(MockVBoxManage::new());
    let vbox = VBoxManage::new(mock.clone(), CommandTimeouts::default());
    let iso = Path::new("/tmp/seed-cidata.iso");

    let with_ide = mock.add_vm_with_disk("web", 1, 1024, 1024);
    let attached = attach_seed_media(&vbox, &with_ide, iso).await.unwrap();
    assert_eq!(
        attached,
        Some(SeedAttachment {
            controller: "IDE Controller".to_string(),
            port: 0,
            device: 1,
        })
    );
    assert!(mock.invocations_of("storagectl").is_empty());

    let sata_only = mock.add_vm("sata", 1, 1024);
    mock.add_controller(&sata_only, "SATA", "sata", "IntelAhci");
    let attached = attach_seed_media(&vbox, &sata_only, iso).await.unwrap().unwrap();
    assert_eq!((attached.controller.as_str(), attached.port, attached.device), ("IDE Controller", 0, 0));
    assert_eq!(mock.invocations_of("storagectl").len(), 1);

    let full = mock.add_vm_with_disk("full", 1, 1024, 1024);
    for (port, device) in [(0, 1), (1, 0), (1, 1)] {
        mock.attach_medium(&full, "IDE Controller", port, device, "/media/other.iso");
    }
    assert_eq!(attach_seed_media(&vbox, &full, iso).await.unwrap(), None);
}
