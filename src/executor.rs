//! Running commands on this host or on a remote one over SSH.
//!
//! Every remote interaction goes through [`RemoteExecutor`]. Implementations
//! must keep "could not ask" ([`ShiftError::ExecutionFailed`],
//! [`ShiftError::CommandTimeout`], [`ShiftError::AuthenticationRejected`])
//! apart from "asked, answer was no" (an `Ok` output with a non-zero exit).

use crate::credentials::Credentials;
use crate::settings::SshSettings;
use crate::{Result, ShiftError, log_debug};
use async_trait::async_trait;
use std::borrow::Cow;
use std::fmt;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Host {
    Local,
    Remote(String),
}

impl Host {
    pub fn remote(address: impl Into<String>) -> Self {
        Host::Remote(address.into())
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Host::Local)
    }

    pub fn address(&self) -> &str {
        match self {
            Host::Local => "localhost",
            Host::Remote(address) => address,
        }
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.address())
    }
}

/// A shell command line, optionally run through `sudo`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCommand {
    script: String,
    privileged: bool,
}

impl RemoteCommand {
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            privileged: false,
        }
    }

    /// Builds `program arg...` with every argument shell-escaped.
    pub fn from_args<I, S>(program: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut script = program.to_string();
        for arg in args {
            script.push(' ');
            script.push_str(&shell_escape(arg.as_ref()));
        }
        Self::new(script)
    }

    pub fn as_privileged(mut self) -> Self {
        self.privileged = true;
        self
    }

    pub fn script(&self) -> &str {
        &self.script
    }

    pub fn is_privileged(&self) -> bool {
        self.privileged
    }

    /// The line handed to the target shell. With a password, sudo reads it
    /// from stdin; without one, sudo must not prompt at all.
    pub fn render(&self, sudo_password: bool) -> String {
        if !self.privileged {
            return self.script.clone();
        }
        let inner = shell_escape(&self.script);
        if sudo_password {
            format!("sudo -S -p '' sh -c {}", inner)
        } else {
            format!("sudo -n sh -c {}", inner)
        }
    }
}

impl fmt::Display for RemoteCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.privileged {
            write!(f, "sudo {}", self.script)
        } else {
            f.write_str(&self.script)
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: String,
}

impl CommandOutput {
    pub fn new(exit_code: i32, stdout: impl Into<Vec<u8>>, stderr: impl Into<String>) -> Self {
        Self {
            exit_code: Some(exit_code),
            stdout: stdout.into(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    pub fn stdout_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stdout)
    }

    /// Turns a non-zero exit into [`ShiftError::CommandFailed`].
    pub fn check(self, command: &str) -> Result<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(ShiftError::CommandFailed {
                command: command.to_string(),
                exit_code: self.exit_code,
                stderr: self.stderr.trim().to_string(),
            })
        }
    }

    /// stderr, falling back to stdout when stderr is empty.
    pub fn diagnostics(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout_str().trim().to_string()
        } else {
            stderr.to_string()
        }
    }
}

#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Runs `command` on `host`. A non-zero exit is returned as `Ok`.
    async fn run(
        &self,
        host: &Host,
        credentials: &Credentials,
        command: &RemoteCommand,
        timeout: Option<Duration>,
    ) -> Result<CommandOutput>;

    /// Copies `remote_path` on `host` to `local_path` on this host.
    async fn copy_from(
        &self,
        host: &Host,
        credentials: &Credentials,
        remote_path: &str,
        local_path: &Path,
    ) -> Result<CommandOutput>;

    /// Like [`RemoteExecutor::run`] but a non-zero exit is an error.
    async fn run_checked(
        &self,
        host: &Host,
        credentials: &Credentials,
        command: &RemoteCommand,
        timeout: Option<Duration>,
    ) -> Result<CommandOutput> {
        self.run(host, credentials, command, timeout)
            .await?
            .check(command.script())
    }
}

const SSH_TRANSPORT_EXIT: i32 = 255;
const SSHPASS_BAD_PASSWORD_EXIT: i32 = 5;

const AUTH_FAILURE_MARKERS: &[&str] = &[
    "permission denied (",
    "permission denied, please try again",
    "authentication failed",
    "incorrect password",
    "a password is required",
    "sorry, try again",
];

/// Executes through the system `ssh`/`scp` binaries; passwords go through
/// `sshpass -e` (environment) and `sudo -S` (stdin).
#[derive(Debug, Clone, Default)]
pub struct SshExecutor {
    settings: SshSettings,
}

impl SshExecutor {
    pub fn new(settings: SshSettings) -> Self {
        Self { settings }
    }

    fn base_command(&self, program: &str, credentials: &Credentials) -> Command {
        let mut cmd = match credentials.password() {
            Some(password) => {
                let mut cmd = Command::new("sshpass");
                cmd.arg("-e").arg(program).env("SSHPASS", password);
                cmd
            }
            None => {
                let mut cmd = Command::new(program);
                cmd.args(["-o", "BatchMode=yes"]);
                cmd
            }
        };
        cmd.args(self.common_options());
        cmd
    }

    fn common_options(&self) -> Vec<String> {
        let mut options = vec![
            "-o".to_string(),
            format!("ConnectTimeout={}", self.settings.connect_timeout_secs),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
        ];
        if let Some(identity) = &self.settings.identity_file {
            options.push("-i".to_string());
            options.push(identity.display().to_string());
        }
        options
    }

    fn ssh_command(&self, address: &str, credentials: &Credentials, line: &str) -> Command {
        let mut cmd = self.base_command("ssh", credentials);
        if let Some(port) = self.settings.port {
            cmd.arg("-p").arg(port.to_string());
        }
        cmd.arg(format!("{}@{}", credentials.username(), address))
            .arg(line);
        cmd
    }

    fn scp_command(
        &self,
        address: &str,
        credentials: &Credentials,
        remote_path: &str,
        local_path: &Path,
    ) -> Command {
        let mut cmd = self.base_command("scp", credentials);
        // Legacy protocol: the remote shell expands the quoted path.
        cmd.arg("-O");
        if let Some(port) = self.settings.port {
            cmd.arg("-P").arg(port.to_string());
        }
        cmd.arg(format!(
            "{}@{}:{}",
            credentials.username(),
            address,
            shell_escape(remote_path)
        ))
        .arg(local_path);
        cmd
    }

    async fn execute(
        &self,
        host: &Host,
        mut cmd: Command,
        stdin: Option<String>,
        timeout: Option<Duration>,
        description: &str,
    ) -> Result<CommandOutput> {
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| ShiftError::ExecutionFailed {
            host: host.to_string(),
            reason: format!("failed to spawn '{}': {}", description, e),
        })?;

        if let Some(mut pipe) = child.stdin.take() {
            if let Some(input) = stdin {
                // A process that never reads stdin closes the pipe early.
                let _ = pipe.write_all(input.as_bytes()).await;
            }
        }

        let output = match timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait_with_output()).await {
                Ok(output) => output?,
                Err(_) => {
                    return Err(ShiftError::CommandTimeout {
                        host: host.to_string(),
                        command: description.to_string(),
                        seconds: limit.as_secs(),
                    });
                }
            },
            None => child.wait_with_output().await?,
        };

        let output = CommandOutput {
            exit_code: output.status.code(),
            stdout: output.stdout,
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        classify_output(host, output)
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn run(
        &self,
        host: &Host,
        credentials: &Credentials,
        command: &RemoteCommand,
        timeout: Option<Duration>,
    ) -> Result<CommandOutput> {
        let sudo_password = command.is_privileged() && credentials.password().is_some();
        let line = command.render(sudo_password);
        let stdin = if sudo_password {
            credentials.password().map(|p| format!("{}\n", p))
        } else {
            None
        };

        log_debug!("[{}] {}", host, command);

        let cmd = match host {
            Host::Local => {
                let mut cmd = Command::new("sh");
                cmd.arg("-c").arg(&line);
                cmd
            }
            Host::Remote(address) => self.ssh_command(address, credentials, &line),
        };

        self.execute(host, cmd, stdin, timeout, command.script()).await
    }

    async fn copy_from(
        &self,
        host: &Host,
        credentials: &Credentials,
        remote_path: &str,
        local_path: &Path,
    ) -> Result<CommandOutput> {
        log_debug!("[{}] copy {} -> {}", host, remote_path, local_path.display());

        let cmd = match host {
            Host::Local => {
                let mut cmd = Command::new("cp");
                cmd.arg("--").arg(remote_path).arg(local_path);
                cmd
            }
            Host::Remote(address) => {
                self.scp_command(address, credentials, remote_path, local_path)
            }
        };

        self.execute(host, cmd, None, None, &format!("copy {}", remote_path))
            .await
    }
}

/// Maps transport-level failures out of an otherwise completed process.
pub fn classify_output(host: &Host, output: CommandOutput) -> Result<CommandOutput> {
    if output.success() {
        return Ok(output);
    }

    let stderr = output.stderr.to_lowercase();
    let auth_marker = AUTH_FAILURE_MARKERS.iter().any(|m| stderr.contains(m));
    let sshpass_rejected = !host.is_local()
        && output.exit_code == Some(SSHPASS_BAD_PASSWORD_EXIT)
        && stderr.trim().is_empty();

    if auth_marker || sshpass_rejected {
        return Err(ShiftError::AuthenticationRejected {
            host: host.to_string(),
            detail: output.diagnostics(),
        });
    }

    if !host.is_local() && output.exit_code == Some(SSH_TRANSPORT_EXIT) {
        return Err(ShiftError::ExecutionFailed {
            host: host.to_string(),
            reason: output.diagnostics(),
        });
    }

    Ok(output)
}

/// Quotes `s` for a POSIX shell when it contains anything special.
pub fn shell_escape(s: &str) -> Cow<'_, str> {
    if s.is_empty() {
        return Cow::Borrowed("''");
    }
    if s.contains(|c: char| c.is_whitespace() || "\"'\\$`!*?<>|&;()[]{}~#=%".contains(c)) {
        Cow::Owned(format!("'{}'", s.replace('\'', "'\"'\"'")))
    } else {
        Cow::Borrowed(s)
    }
}
