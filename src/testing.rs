//! In-memory doubles for the executor, prober and credential seams, so
//! workflows can run without SSH, ping or libvirt.

use crate::credentials::{CredentialProvider, Credentials};
use crate::executor::{CommandOutput, Host, RemoteCommand, RemoteExecutor};
use crate::probe::HostProber;
use crate::{Result, ShiftError};
use async_trait::async_trait;
use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// What a scripted command does when matched.
#[derive(Debug, Clone)]
pub enum Reply {
    Output(CommandOutput),
    AuthRejected,
    Unreachable,
    Timeout,
}

impl Reply {
    pub fn ok(stdout: impl Into<Vec<u8>>) -> Self {
        Reply::Output(CommandOutput::new(0, stdout, ""))
    }

    pub fn exit(code: i32, stderr: impl Into<String>) -> Self {
        Reply::Output(CommandOutput::new(code, Vec::new(), stderr))
    }

    fn resolve(&self, host: &Host, script: &str) -> Result<CommandOutput> {
        match self {
            Reply::Output(output) => Ok(output.clone()),
            Reply::AuthRejected => Err(ShiftError::AuthenticationRejected {
                host: host.to_string(),
                detail: "Permission denied (publickey,password).".to_string(),
            }),
            Reply::Unreachable => Err(ShiftError::ExecutionFailed {
                host: host.to_string(),
                reason: "No route to host".to_string(),
            }),
            Reply::Timeout => Err(ShiftError::CommandTimeout {
                host: host.to_string(),
                command: script.to_string(),
                seconds: 10,
            }),
        }
    }
}

/// What a scripted copy does when matched.
#[derive(Debug, Clone)]
pub enum CopyReply {
    /// Writes the bytes to the destination and succeeds.
    Content(Vec<u8>),
    /// Writes the bytes, then fails like an interrupted transfer.
    Interrupted(Vec<u8>),
    Reply(Reply),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub host: Host,
    pub script: String,
    pub privileged: bool,
    pub username: String,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCopy {
    pub host: Host,
    pub remote_path: String,
    pub local_path: PathBuf,
}

struct Rule<T> {
    pattern: String,
    replies: VecDeque<T>,
}

/// Takes the next reply; the final one repeats forever.
fn next_reply<T: Clone>(rules: &mut [Rule<T>], subject: &str) -> Option<T> {
    let rule = rules.iter_mut().find(|rule| subject.contains(&rule.pattern))?;
    if rule.replies.len() > 1 {
        rule.replies.pop_front()
    } else {
        rule.replies.front().cloned()
    }
}

fn push_rule<T>(rules: &mut Vec<Rule<T>>, pattern: &str, reply: T) {
    match rules.iter_mut().find(|rule| rule.pattern == pattern) {
        Some(rule) => rule.replies.push_back(reply),
        None => rules.push(Rule {
            pattern: pattern.to_string(),
            replies: VecDeque::from([reply]),
        }),
    }
}

/// Executor answering from rules matched by substring against the command
/// script, in registration order. Unmatched commands succeed silently.
#[derive(Default)]
pub struct ScriptedExecutor {
    rules: Mutex<Vec<Rule<Reply>>>,
    copy_rules: Mutex<Vec<Rule<CopyReply>>>,
    calls: Mutex<Vec<RecordedCall>>,
    copies: Mutex<Vec<RecordedCopy>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `reply` for commands containing `pattern`.
    pub fn on(&self, pattern: &str, reply: Reply) -> &Self {
        if let Ok(mut rules) = self.rules.lock() {
            push_rule(&mut rules, pattern, reply);
        }
        self
    }

    pub fn on_sequence(&self, pattern: &str, replies: impl IntoIterator<Item = Reply>) -> &Self {
        for reply in replies {
            self.on(pattern, reply);
        }
        self
    }

    /// Queues `reply` for copies whose remote path contains `pattern`.
    pub fn on_copy(&self, pattern: &str, reply: CopyReply) -> &Self {
        if let Ok(mut rules) = self.copy_rules.lock() {
            push_rule(&mut rules, pattern, reply);
        }
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn copies(&self) -> Vec<RecordedCopy> {
        self.copies.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Number of executed commands containing `pattern`.
    pub fn count(&self, pattern: &str) -> usize {
        self.calls()
            .iter()
            .filter(|call| call.script.contains(pattern))
            .count()
    }
}

#[async_trait]
impl RemoteExecutor for ScriptedExecutor {
    async fn run(
        &self,
        host: &Host,
        credentials: &Credentials,
        command: &RemoteCommand,
        timeout: Option<Duration>,
    ) -> Result<CommandOutput> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(RecordedCall {
                host: host.clone(),
                script: command.script().to_string(),
                privileged: command.is_privileged(),
                username: credentials.username().to_string(),
                timeout,
            });
        }

        let reply = self
            .rules
            .lock()
            .ok()
            .and_then(|mut rules| next_reply(&mut rules, command.script()));

        match reply {
            Some(reply) => reply.resolve(host, command.script()),
            None => Ok(CommandOutput::new(0, Vec::new(), "")),
        }
    }

    async fn copy_from(
        &self,
        host: &Host,
        _credentials: &Credentials,
        remote_path: &str,
        local_path: &Path,
    ) -> Result<CommandOutput> {
        if let Ok(mut copies) = self.copies.lock() {
            copies.push(RecordedCopy {
                host: host.clone(),
                remote_path: remote_path.to_string(),
                local_path: local_path.to_path_buf(),
            });
        }

        let reply = self
            .copy_rules
            .lock()
            .ok()
            .and_then(|mut rules| next_reply(&mut rules, remote_path))
            .unwrap_or_else(|| CopyReply::Content(format!("copy of {}", remote_path).into_bytes()));

        match reply {
            CopyReply::Content(bytes) => {
                tokio::fs::write(local_path, bytes).await?;
                Ok(CommandOutput::new(0, Vec::new(), ""))
            }
            CopyReply::Interrupted(bytes) => {
                tokio::fs::write(local_path, bytes).await?;
                Ok(CommandOutput::new(1, Vec::new(), "lost connection"))
            }
            CopyReply::Reply(reply) => reply.resolve(host, remote_path),
        }
    }
}

/// Prober with a fixed set of reachable addresses.
#[derive(Default)]
pub struct StaticProber {
    reachable: HashSet<String>,
    probes: Mutex<Vec<String>>,
}

impl StaticProber {
    pub fn reachable<I, S>(addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            reachable: addresses.into_iter().map(Into::into).collect(),
            probes: Mutex::new(Vec::new()),
        }
    }

    pub fn probes(&self) -> Vec<String> {
        self.probes.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl HostProber for StaticProber {
    async fn probe(&self, address: &str) -> bool {
        if let Ok(mut probes) = self.probes.lock() {
            probes.push(address.to_string());
        }
        self.reachable.contains(address)
    }
}

/// Hands out queued credentials in order, repeating the last one, and
/// counts how often it was asked.
pub struct ScriptedCredentials {
    queue: VecDeque<Credentials>,
    requests: Arc<Mutex<Vec<(String, u32)>>>,
}

impl ScriptedCredentials {
    pub fn new(credentials: impl IntoIterator<Item = Credentials>) -> Self {
        Self {
            queue: credentials.into_iter().collect(),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Shared view of `(host, attempt)` requests, usable after the provider
    /// has been moved into an orchestrator.
    pub fn requests(&self) -> Arc<Mutex<Vec<(String, u32)>>> {
        self.requests.clone()
    }
}

impl CredentialProvider for ScriptedCredentials {
    fn credentials(&mut self, host: &str, attempt: u32) -> Result<Credentials> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push((host.to_string(), attempt));
        }
        let next = if self.queue.len() > 1 {
            self.queue.pop_front()
        } else {
            self.queue.front().cloned()
        };
        next.ok_or_else(|| ShiftError::CredentialsUnavailable {
            host: host.to_string(),
            reason: "no scripted credentials left".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_replies_advance_then_stick() {
        let executor = ScriptedExecutor::new();
        executor.on_sequence("fuser", [Reply::ok("123"), Reply::exit(1, "")]);

        let creds = Credentials::key_only("ops");
        let host = Host::remote("10.0.0.5");
        let cmd = RemoteCommand::new("fuser /mnt/nfs/web01.img");

        let codes: Vec<_> = exit_codes(&executor, &host, &creds, &cmd, 3).await;
        assert_eq!(codes, vec![Some(0), Some(1), Some(1)]);
        assert_eq!(executor.count("fuser"), 3);
    }

    async fn exit_codes(
        executor: &ScriptedExecutor,
        host: &Host,
        creds: &Credentials,
        cmd: &RemoteCommand,
        n: usize,
    ) -> Vec<Option<i32>> {
        let mut codes = Vec::new();
        for _ in 0..n {
            codes.push(executor.run(host, creds, cmd, None).await.unwrap().exit_code);
        }
        codes
    }
}
