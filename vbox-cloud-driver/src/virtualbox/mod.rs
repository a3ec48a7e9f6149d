//! VirtualBox driver implementation.
//!
//! Drives a local VirtualBox installation through VBoxManage.

mod driver;
mod provision_job;

pub use driver::{DriverConfig, VirtualBoxDriver};
