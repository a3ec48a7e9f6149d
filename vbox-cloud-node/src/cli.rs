//! Command-line argument parsing.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// vbox-cloud - cloud-style control of a VirtualBox host
#[derive(Parser, Debug)]
#[command(name = "vbox-cloud")]
#[command(about = "vbox-cloud - cloud-style control of a VirtualBox host")]
#[command(version)]
pub struct Args {
    /// Path to configuration file (optional, defaults used if not found)
    #[arg(short, long, env = "VBOX_CLOUD_CONFIG")]
    pub config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, env = "VBOX_CLOUD_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    pub log_json: bool,

    /// Path to the VBoxManage binary
    #[arg(long, env = "VBOX_MANAGE")]
    pub vboxmanage: Option<String>,

    /// Host interface bridged to new instances
    #[arg(long)]
    pub bridge_adapter: Option<String>,

    /// Enable development mode (in-memory VirtualBox)
    #[arg(long)]
    pub dev: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// List images
    Images {
        #[arg(long)]
        id: Option<String>,
        #[arg(long)]
        architecture: Option<String>,
    },

    /// Unregister an image and delete its disks
    DestroyImage { id: String },

    /// List realms
    Realms,

    /// List hardware profiles
    Profiles,

    /// List instances
    Instances {
        #[arg(long)]
        id: Option<String>,
        /// START, PENDING, RUNNING, STOPPING or STOPPED
        #[arg(long)]
        state: Option<String>,
        #[arg(long)]
        image_id: Option<String>,
    },

    /// List storage volumes
    Volumes {
        #[arg(long)]
        id: Option<String>,
    },

    /// Create an instance from an image and wait for its disk
    Create {
        /// Source image id
        #[arg(long)]
        image: String,
        #[arg(long)]
        name: Option<String>,
        /// Hardware profile id
        #[arg(long)]
        hwp: Option<String>,
        /// Cloud-init user-data file
        #[arg(long)]
        user_data_file: Option<PathBuf>,
    },

    /// Start an instance
    Start { id: String },

    /// Stop (pause) an instance
    Stop { id: String },

    /// Reboot an instance
    Reboot { id: String },

    /// Destroy an instance
    Destroy { id: String },
}
