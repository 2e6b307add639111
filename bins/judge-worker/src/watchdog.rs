// Wire format of the in-container watchdog
//
// The watchdog reads one request as JSON on stdin, runs the command as the
// guest user under the given limits, and prints one response as JSON on
// stdout. Anything it writes to its own stderr means it failed.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::config::SandboxConfig;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchdogRequest {
    pub command: String,
    pub stdin: String,
    pub timeout_ms: u64,
    pub memory_limit_mb: u64,
    pub uid: u32,
    pub gid: u32,
    pub stdout_max_bytes: usize,
    pub stderr_max_bytes: usize,
}

impl WatchdogRequest {
    pub fn new(command: &str, stdin: String, time_ms: u64, memory_mb: u64, sandbox: &SandboxConfig) -> Self {
        Self {
            command: command.to_string(),
            stdin,
            timeout_ms: time_ms,
            memory_limit_mb: memory_mb,
            uid: sandbox.guest_uid,
            gid: sandbox.guest_gid,
            stdout_max_bytes: sandbox.stdout_max_bytes,
            stderr_max_bytes: sandbox.stderr_max_bytes,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WatchdogResponse {
    /// `None` when the program did not exit normally.
    pub exit_code: Option<i64>,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub time_ms: i64,
    #[serde(default)]
    pub memory_kb: i64,
    #[serde(rename = "TLE", default)]
    pub tle: bool,
    #[serde(rename = "MLE", default)]
    pub mle: bool,
    #[serde(rename = "OLE", default)]
    pub ole: bool,
}

/// Validate the raw result of one watchdog exec and decode its response.
///
/// A non-zero exit or any stderr output from the watchdog process itself is a
/// sandbox failure, not a verdict on the submission.
pub fn parse_response(exit_code: Option<i64>, stdout: &str, stderr: &str) -> Result<WatchdogResponse> {
    match exit_code {
        Some(0) => {}
        Some(code) => bail!("watchdog failed with exit code {}, stderr: {}", code, stderr),
        None => bail!("watchdog exit code unavailable, stderr: {}", stderr),
    }
    if !stderr.is_empty() {
        bail!("watchdog wrote to stderr: {}", stderr);
    }
    serde_json::from_str(stdout).context("failed to decode watchdog response")
}
