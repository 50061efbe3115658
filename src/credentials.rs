use crate::config::ConfigField;
use crate::{Result, ShiftError};
use std::fmt;
use std::io::{self, BufRead, Write};
use std::process::{Command, Stdio};

/// SSH/sudo credentials for one host. Lives in memory for one session and is
/// never serialized.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    username: String,
    password: Option<String>,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: Some(password.into()),
        }
    }

    /// Key-based SSH with passwordless sudo.
    pub fn key_only(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: None,
        }
    }

    /// Credentials for commands run on this host as the current user.
    pub fn local() -> Self {
        Self::key_only(std::env::var("USER").unwrap_or_else(|_| "root".to_string()))
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Supplies credentials for a remote host. `attempt` starts at 1 and grows
/// each time the previous credentials were rejected.
pub trait CredentialProvider: Send {
    fn credentials(&mut self, host: &str, attempt: u32) -> Result<Credentials>;
}

/// Resolves a cluster field that is missing from the persisted record.
pub trait FieldResolver: Send {
    fn resolve(&mut self, field: ConfigField) -> Result<Option<String>>;
}

/// Always hands out the same credentials.
pub struct StaticCredentialProvider {
    credentials: Credentials,
}

impl StaticCredentialProvider {
    pub fn new(credentials: Credentials) -> Self {
        Self { credentials }
    }
}

impl CredentialProvider for StaticCredentialProvider {
    fn credentials(&mut self, _host: &str, _attempt: u32) -> Result<Credentials> {
        Ok(self.credentials.clone())
    }
}

/// Never resolves anything, so missing fields surface as `ConfigurationMissing`.
pub struct NoFieldResolver;

impl FieldResolver for NoFieldResolver {
    fn resolve(&mut self, _field: ConfigField) -> Result<Option<String>> {
        Ok(None)
    }
}

/// Asks on the terminal.
pub struct PromptCredentialProvider;

impl CredentialProvider for PromptCredentialProvider {
    fn credentials(&mut self, host: &str, attempt: u32) -> Result<Credentials> {
        if attempt > 1 {
            println!("⚠️  Credentials for {} were rejected, please try again.", host);
        }

        let username = prompt_line(&format!("Enter SSH username for {}: ", host))
            .map_err(|e| unavailable(host, e))?;
        if username.is_empty() {
            return Err(ShiftError::CredentialsUnavailable {
                host: host.to_string(),
                reason: "empty username".to_string(),
            });
        }

        let password = prompt_secret(&format!("Sudo password for {}@{}: ", username, host))
            .map_err(|e| unavailable(host, e))?;

        if password.is_empty() {
            Ok(Credentials::key_only(username))
        } else {
            Ok(Credentials::new(username, password))
        }
    }
}

pub struct PromptFieldResolver;

impl FieldResolver for PromptFieldResolver {
    fn resolve(&mut self, field: ConfigField) -> Result<Option<String>> {
        let value = prompt_line(&format!("Enter value for {}: ", field.key()))?;
        Ok(Some(value).filter(|v| !v.is_empty()))
    }
}

fn unavailable(host: &str, err: io::Error) -> ShiftError {
    ShiftError::CredentialsUnavailable {
        host: host.to_string(),
        reason: err.to_string(),
    }
}

fn prompt_line(prompt: &str) -> io::Result<String> {
    print!("{}", prompt);
    io::stdout().flush()?;

    let mut input = String::new();
    let read = io::stdin().lock().read_line(&mut input)?;
    if read == 0 {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "stdin closed"));
    }
    Ok(input.trim().to_string())
}

fn prompt_secret(prompt: &str) -> io::Result<String> {
    let echo_disabled = set_terminal_echo(false);
    let result = prompt_line(prompt);
    if echo_disabled {
        set_terminal_echo(true);
        println!();
    }
    result
}

fn set_terminal_echo(enabled: bool) -> bool {
    Command::new("stty")
        .arg(if enabled { "echo" } else { "-echo" })
        .stdin(Stdio::inherit())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}
