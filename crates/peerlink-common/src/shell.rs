//! Shell command execution utilities.
//!
//! Every kernel-facing component talks to the host through the standard
//! tools (`ip`, `bridge`, `iptables`, `wg`). Arguments that come from
//! configuration or resources are always passed through [`shellquote`].
//!
//! # Example
//!
//! ```ignore
//! use peerlink_common::shell::{self, IP_CMD, shellquote};
//!
//! let cmd = format!("{} link set dev {} mtu {}", IP_CMD, shellquote("vxlan.plk"), 1450);
//! shell::exec_or_throw(&cmd).await?;
//! ```

use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use std::process::Stdio;
use tokio::process::Command;

use crate::error::{PeerlinkError, PeerlinkResult};

/// Path to the `ip` command for link, address, route and rule configuration.
pub const IP_CMD: &str = "/sbin/ip";

/// Path to the `bridge` command for FDB manipulation.
pub const BRIDGE_CMD: &str = "/sbin/bridge";

/// Path to the `iptables` command for filter/NAT rules.
pub const IPTABLES_CMD: &str = "/sbin/iptables";

/// Path to the WireGuard control utility.
pub const WG_CMD: &str = "/usr/bin/wg";

/// Matches: $, `, ", \, and newline
static SHELL_ESCAPE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"([$`"\\\n])"#).expect("Invalid regex pattern"));

/// Quotes a string for safe use in shell commands.
///
/// The string is wrapped in double quotes and every character with special
/// meaning inside double quotes is escaped.
///
/// ```
/// use peerlink_common::shell::shellquote;
///
/// assert_eq!(shellquote("simple"), "\"simple\"");
/// assert_eq!(shellquote("with$var"), "\"with\\$var\"");
/// ```
pub fn shellquote(s: &str) -> String {
    let escaped = SHELL_ESCAPE_RE.replace_all(s, r"\$1");
    format!("\"{}\"", escaped)
}

/// Network namespace a command runs in.
///
/// The host namespace leaves commands untouched; a named namespace prefixes
/// them with `ip netns exec <name>`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Netns(Option<String>);

impl Netns {
    pub const fn host() -> Self {
        Netns(None)
    }

    pub fn named(name: impl Into<String>) -> Self {
        Netns(Some(name.into()))
    }

    /// Treats an empty name as the host namespace.
    pub fn from_config(name: Option<&str>) -> Self {
        match name {
            Some(n) if !n.is_empty() => Self::named(n),
            _ => Self::host(),
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.0.as_deref()
    }

    /// Returns `cmd` adjusted to run inside this namespace.
    pub fn wrap(&self, cmd: String) -> String {
        match &self.0 {
            None => cmd,
            Some(ns) => format!("{} netns exec {} {}", IP_CMD, shellquote(ns), cmd),
        }
    }
}

impl fmt::Display for Netns {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0.as_deref().unwrap_or("host"))
    }
}

/// Result of a shell command execution.
#[derive(Debug, Clone)]
pub struct ExecResult {
    /// The exit code of the command (0 = success).
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecResult {
    /// Returns true if the command succeeded (exit code 0).
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Returns the combined output (stdout + stderr) for error messages.
    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// Executes a shell command asynchronously through `/bin/sh -c`.
///
/// Only spawn failures are errors; a non-zero exit is reported in the
/// returned [`ExecResult`].
pub async fn exec(cmd: &str) -> PeerlinkResult<ExecResult> {
    tracing::debug!(command = %cmd, "Executing shell command");

    let output = Command::new("/bin/sh")
        .arg("-c")
        .arg(cmd)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| PeerlinkError::ShellExec {
            command: cmd.to_string(),
            source: e,
        })?;

    let exit_code = output.status.code().unwrap_or(-1);
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

    let result = ExecResult {
        exit_code,
        stdout,
        stderr,
    };

    if result.success() {
        tracing::trace!(command = %cmd, exit_code = exit_code, "Command succeeded");
    } else {
        tracing::warn!(
            command = %cmd,
            exit_code = exit_code,
            stderr = %result.stderr,
            "Command failed"
        );
    }

    Ok(result)
}

/// Executes a shell command and returns its stdout, failing on non-zero exit.
pub async fn exec_or_throw(cmd: &str) -> PeerlinkResult<String> {
    let result = exec(cmd).await?;
    if result.success() {
        Ok(result.stdout)
    } else {
        Err(PeerlinkError::ShellCommandFailed {
            command: cmd.to_string(),
            exit_code: result.exit_code,
            output: result.combined_output(),
        })
    }
}

/// Returns true if a failed command's output says the object already exists
/// or is already gone. Such races are treated as success by idempotent callers.
pub fn is_benign_race(err: &PeerlinkError) -> bool {
    match err {
        PeerlinkError::ShellCommandFailed { output, .. } => {
            let output = output.to_ascii_lowercase();
            output.contains("file exists")
                || output.contains("no such file or directory")
                || output.contains("no such process")
                || output.contains("cannot find device")
                || output.contains("does a matching rule exist")
                || output.contains("chain already exists")
        }
        _ => false,
    }
}
