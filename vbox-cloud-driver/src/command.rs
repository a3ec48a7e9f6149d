//! VBoxManage invocation boundary.
//!
//! Everything the driver knows about VirtualBox comes from running
//! `VBoxManage -q <subcommand> <args>` and reading its standard output. The
//! [`CommandExecutor`] trait is the only place a process is spawned, so the
//! rest of the crate can be exercised against recorded output (see
//! [`crate::mock::MockVBoxManage`]).
//!
//! [`VBoxManage`] layers the invocation policy on top of an executor:
//! - every call runs under an explicit timeout (cloning gets a longer one)
//! - `run` treats a non-zero exit as an operation failure
//! - `query` treats a non-zero exit or empty output as "not found"
//! - nothing is retried

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::attributes::{self, RawAttributes};
use crate::error::{DriverError, Result};

/// Default VBoxManage location on Linux hosts.
pub const DEFAULT_VBOXMANAGE_PATH: &str = "/usr/bin/VBoxManage";

/// Default bound for ordinary VBoxManage calls.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// Default bound for disk cloning, which scales with image size.
pub const DEFAULT_CLONE_TIMEOUT: Duration = Duration::from_secs(3600);

/// Guest property holding the first IPv4 address (needs Guest Additions).
pub const GUEST_IP_PROPERTY: &str = "/VirtualBox/GuestInfo/Net/0/V4/IP";

/// Text VBoxManage prints when a guest property or extradata key is unset.
const NO_VALUE: &str = "No value set!";

/// Captured result of one tool invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutput {
    /// Standard output, lossily decoded
    pub stdout: String,
    /// Standard error, lossily decoded
    pub stderr: String,
    /// Exit code (None if terminated by a signal)
    pub status: Option<i32>,
}

impl ToolOutput {
    /// Successful invocation with the given stdout.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            status: Some(0),
        }
    }

    /// Failed invocation with the given stderr.
    pub fn failed(status: i32, stderr: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            status: Some(status),
        }
    }

    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

/// Narrow command-execution interface: `invoke(args) -> (output, status)`.
///
/// Implementations receive the subcommand and its arguments without the
/// binary name or the `-q` flag.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Run one VBoxManage subcommand, waiting at most `timeout`.
    ///
    /// Returns `Err` only when the process could not be run or timed out;
    /// a non-zero exit is reported through [`ToolOutput::status`].
    async fn invoke(&self, args: &[String], timeout: Duration) -> Result<ToolOutput>;
}

/// Executor that spawns the real VBoxManage binary.
pub struct VBoxManageExecutor {
    binary: PathBuf,
}

impl VBoxManageExecutor {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl Default for VBoxManageExecutor {
    fn default() -> Self {
        Self::new(DEFAULT_VBOXMANAGE_PATH)
    }
}

#[async_trait]
impl CommandExecutor for VBoxManageExecutor {
    async fn invoke(&self, args: &[String], timeout: Duration) -> Result<ToolOutput> {
        let subcommand = args.first().cloned().unwrap_or_default();
        debug!(binary = %self.binary.display(), args = ?args, "Invoking VBoxManage");

        let child = Command::new(&self.binary)
            .arg("-q")
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| DriverError::ToolInvocationFailed {
                command: subcommand.clone(),
                status: None,
                message: format!("failed to spawn {}: {}", self.binary.display(), e),
            })?;

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(DriverError::ToolInvocationFailed {
                    command: subcommand,
                    status: None,
                    message: e.to_string(),
                });
            }
            Err(_) => {
                warn!(command = %subcommand, timeout_secs = timeout.as_secs(), "VBoxManage timed out");
                return Err(DriverError::Timeout {
                    command: subcommand,
                    timeout,
                });
            }
        };

        Ok(ToolOutput {
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            status: output.status.code(),
        })
    }
}

/// Timeout policy for tool invocations.
#[derive(Debug, Clone, Copy)]
pub struct CommandTimeouts {
    pub command: Duration,
    pub clone: Duration,
}

impl Default for CommandTimeouts {
    fn default() -> Self {
        Self {
            command: DEFAULT_COMMAND_TIMEOUT,
            clone: DEFAULT_CLONE_TIMEOUT,
        }
    }
}

/// VBoxManage client: an executor plus the invocation policy.
#[derive(Clone)]
pub struct VBoxManage {
    executor: Arc<dyn CommandExecutor>,
    timeouts: CommandTimeouts,
}

impl VBoxManage {
    pub fn new(executor: Arc<dyn CommandExecutor>, timeouts: CommandTimeouts) -> Self {
        Self { executor, timeouts }
    }

    pub fn timeouts(&self) -> CommandTimeouts {
        self.timeouts
    }

    /// Run a mutating subcommand; a non-zero exit is an error.
    pub async fn run<S: AsRef<str>>(&self, args: &[S]) -> Result<String> {
        self.run_with_timeout(args, self.timeouts.command).await
    }

    /// Run a slow subcommand (disk cloning) under the clone timeout.
    pub async fn run_slow<S: AsRef<str>>(&self, args: &[S]) -> Result<String> {
        self.run_with_timeout(args, self.timeouts.clone).await
    }

    async fn run_with_timeout<S: AsRef<str>>(&self, args: &[S], timeout: Duration) -> Result<String> {
        let args = to_args(args);
        let output = self.executor.invoke(&args, timeout).await?;

        if !output.success() {
            return Err(DriverError::ToolInvocationFailed {
                command: args.first().cloned().unwrap_or_default(),
                status: output.status,
                message: output.stderr,
            });
        }

        Ok(output.stdout)
    }

    /// Run an informational subcommand.
    ///
    /// Returns `None` when the tool exits non-zero or prints nothing, which
    /// VBoxManage does for unknown machines and media.
    pub async fn query<S: AsRef<str>>(&self, args: &[S]) -> Result<Option<String>> {
        let args = to_args(args);
        let output = self.executor.invoke(&args, self.timeouts.command).await?;

        if !output.success() {
            debug!(args = ?args, status = ?output.status, "Query returned no entity");
            return Ok(None);
        }

        let stdout = output.stdout.trim();
        if stdout.is_empty() {
            return Ok(None);
        }

        Ok(Some(stdout.to_string()))
    }

    /// `list vms` as `(name, uuid)` pairs.
    pub async fn list_vms(&self) -> Result<Vec<(String, String)>> {
        let output = self.query(&["list", "vms"]).await?.unwrap_or_default();
        Ok(attributes::parse_vm_list(&output))
    }

    /// `showvminfo --machinereadable` parsed into raw attributes.
    pub async fn vm_info(&self, vm_id: &str) -> Result<Option<RawAttributes>> {
        let output = self
            .query(&["showvminfo", "--machinereadable", vm_id])
            .await?;

        Ok(output
            .map(|text| attributes::parse_machine_readable(&text))
            .filter(|raw| !raw.is_empty()))
    }

    /// `showhdinfo` parsed into raw attributes.
    pub async fn hd_info(&self, medium: &str) -> Result<Option<RawAttributes>> {
        let output = self.query(&["showhdinfo", medium]).await?;
        Ok(output.map(|text| attributes::parse_colon_block(&text)))
    }

    /// UUIDs of every registered hard disk (`list hdds`).
    pub async fn list_hdds(&self) -> Result<Vec<String>> {
        let output = self.query(&["list", "hdds"]).await?.unwrap_or_default();

        Ok(attributes::split_blocks(&output)
            .into_iter()
            .filter_map(|block| attributes::parse_colon_block(block).get("uuid").map(str::to_string))
            .collect())
    }

    /// First guest-reported IPv4 address, if Guest Additions publish one.
    pub async fn guest_ip(&self, vm_id: &str) -> Result<Option<String>> {
        let output = self
            .query(&["guestproperty", "get", vm_id, GUEST_IP_PROPERTY])
            .await?;
        Ok(output.and_then(|text| parse_value_line(&text)))
    }

    /// Read one extradata key.
    pub async fn extradata(&self, vm_id: &str, key: &str) -> Result<Option<String>> {
        let output = self.query(&["getextradata", vm_id, key]).await?;
        Ok(output.and_then(|text| parse_value_line(&text)))
    }
}

/// Parse `Value: <v>` output; `No value set!` means absent.
pub fn parse_value_line(text: &str) -> Option<String> {
    let text = text.trim();
    if text.is_empty() || text.ends_with(NO_VALUE) {
        return None;
    }

    let value = match text.split_once(':') {
        Some((_, value)) => value.trim(),
        None => text,
    };

    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

fn to_args<S: AsRef<str>>(args: &[S]) -> Vec<String> {
    args.iter().map(|a| a.as_ref().to_string()).collect()
}
