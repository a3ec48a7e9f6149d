//! Subcommand execution.

use anyhow::{Context, Result};
use serde::Serialize;
use std::io::Write;
use tracing::{info, warn};

use vbox_cloud_driver::{CloudDriver, Credentials, DriverOptions, ProvisionStatus, VirtualBoxDriver};

use crate::cli::Command;

/// Run one subcommand and write its result as pretty JSON to `out`.
pub async fn run(driver: &VirtualBoxDriver, command: Command, out: &mut impl Write) -> Result<()> {
    let creds = Credentials::default();

    match command {
        Command::Images { id, architecture } => {
            let opts = DriverOptions {
                id,
                architecture,
                ..Default::default()
            };
            print_json(out, &driver.list_images(&creds, &opts).await?)
        }
        Command::DestroyImage { id } => {
            driver.destroy_image(&creds, &id).await?;
            print_json(out, &serde_json::json!({ "destroyed": id }))
        }
        Command::Realms => print_json(out, &driver.list_realms(&creds, &DriverOptions::new()).await?),
        Command::Profiles => print_json(
            out,
            &driver.list_hardware_profiles(&creds, &DriverOptions::new()).await?,
        ),
        Command::Instances { id, state, image_id } => {
            let opts = DriverOptions {
                id,
                state,
                image_id,
                ..Default::default()
            };
            print_json(out, &driver.list_instances(&creds, &opts).await?)
        }
        Command::Volumes { id } => {
            let opts = DriverOptions {
                id,
                ..Default::default()
            };
            print_json(out, &driver.list_storage_volumes(&creds, &opts).await?)
        }
        Command::Create {
            image,
            name,
            hwp,
            user_data_file,
        } => {
            let user_data = match user_data_file {
                Some(path) => Some(
                    std::fs::read_to_string(&path)
                        .with_context(|| format!("Failed to read user-data file: {}", path.display()))?,
                ),
                None => None,
            };

            let opts = DriverOptions {
                name,
                hwp_id: hwp,
                user_data,
                ..Default::default()
            };

            let instance = driver.create_instance(&creds, &image, &opts).await?;
            print_json(out, &instance)?;

            // The clone runs on this process's runtime; returning early would abort it
            info!(instance_id = %instance.id, "Waiting for provisioning");
            match driver.wait_for_provisioning(&instance.id).await {
                Some(ProvisionStatus::Failed { reason }) => {
                    warn!(instance_id = %instance.id, reason = %reason, "Provisioning failed");
                    anyhow::bail!("provisioning of {} failed: {}", instance.id, reason)
                }
                _ => {
                    let opts = DriverOptions::new().with_id(instance.id.clone());
                    print_json(out, &driver.list_instances(&creds, &opts).await?)
                }
            }
        }
        Command::Start { id } => print_json(out, &driver.start_instance(&creds, &id).await?),
        Command::Stop { id } => print_json(out, &driver.stop_instance(&creds, &id).await?),
        Command::Reboot { id } => print_json(out, &driver.reboot_instance(&creds, &id).await?),
        Command::Destroy { id } => {
            driver.destroy_instance(&creds, &id).await?;
            print_json(out, &serde_json::json!({ "destroyed": id }))
        }
    }
}

fn print_json<T: Serialize + ?Sized>(out: &mut impl Write, value: &T) -> Result<()> {
    serde_json::to_writer_pretty(&mut *out, value)?;
    writeln!(out)?;
    Ok(())
}
