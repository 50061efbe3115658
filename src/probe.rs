use crate::log_warn;
use async_trait::async_trait;
use std::net::UdpSocket;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// Fast network reachability gate, run before any SSH work. Never fails:
/// an unreachable host is just `false`.
#[async_trait]
pub trait HostProber: Send + Sync {
    async fn probe(&self, address: &str) -> bool;
}

/// One ICMP echo via the system `ping`.
#[derive(Debug, Clone)]
pub struct PingProber {
    timeout: Duration,
}

impl PingProber {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for PingProber {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

#[async_trait]
impl HostProber for PingProber {
    async fn probe(&self, address: &str) -> bool {
        let deadline = self.timeout.as_secs().max(1);
        let status = Command::new("ping")
            .args(["-c", "1", "-w", &deadline.to_string(), address])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status();

        // Guard against a ping binary that ignores -w.
        let grace = Duration::from_secs(deadline + 1);
        match tokio::time::timeout(grace, status).await {
            Ok(Ok(status)) if status.success() => true,
            Ok(Ok(_)) => {
                log_warn!("{} is not reachable", address);
                false
            }
            Ok(Err(e)) => {
                log_warn!("Error checking availability of {}: {}", address, e);
                false
            }
            Err(_) => {
                log_warn!("Reachability check of {} timed out", address);
                false
            }
        }
    }
}

/// Address of the interface holding the default route. No packet is sent:
/// connecting a UDP socket only selects a route.
pub fn local_address() -> Option<String> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    socket.local_addr().ok().map(|addr| addr.ip().to_string())
}

pub fn is_local_address(address: &str, local: Option<&str>) -> bool {
    matches!(address, "127.0.0.1" | "localhost" | "::1") || Some(address) == local
}
