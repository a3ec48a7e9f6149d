//! Background clone-and-attach sequence for a new instance.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, instrument};

use crate::cloudinit::{attach_seed_media, CloudInitConfig, CloudInitGenerator};
use crate::command::VBoxManage;
use crate::error::Result;

/// Cloud-init media to build once the disk is attached.
pub(super) struct SeedRequest {
    pub config: CloudInitConfig,
    pub generator: Arc<CloudInitGenerator>,
    pub media_dir: PathBuf,
}

/// Everything the background task needs, owned so it can outlive the request.
pub(super) struct ProvisionJob {
    pub vbox: VBoxManage,
    pub vm_id: String,
    pub source_location: String,
    pub target_location: String,
    pub controller: String,
    pub source_lock: Arc<Mutex<()>>,
    pub seed: Option<SeedRequest>,
}

impl ProvisionJob {
    #[instrument(skip(self), fields(vm_id = %self.vm_id))]
    pub async fn run(self) -> Result<()> {
        {
            // Concurrent clones of one source are serialized
            let _guard = self.source_lock.lock().await;
            info!(source = %self.source_location, target = %self.target_location, "Cloning boot disk");
            self.vbox
                .run_slow(&[
                    "clonehd",
                    self.source_location.as_str(),
                    self.target_location.as_str(),
                    "--format",
                    "VDI",
                ])
                .await?;
        }

        self.vbox
            .run(&[
                "storagectl",
                self.vm_id.as_str(),
                "--name",
                self.controller.as_str(),
                "--add",
                "ide",
                "--controller",
                "PIIX4",
            ])
            .await?;

        self.vbox
            .run(&[
                "storageattach",
                self.vm_id.as_str(),
                "--storagectl",
                self.controller.as_str(),
                "--port",
                "0",
                "--device",
                "0",
                "--type",
                "hdd",
                "--medium",
                self.target_location.as_str(),
            ])
            .await?;

        info!(controller = %self.controller, "Boot disk attached");

        if let Some(seed) = self.seed {
            let SeedRequest {
                config,
                generator,
                media_dir,
            } = seed;

            let iso = generator
                .generate_iso(&config, &media_dir, self.vbox.timeouts().command)
                .await?;

            attach_seed_media(&self.vbox, &self.vm_id, &iso).await?;
        }

        Ok(())
    }
}
