//! Single-echo reachability check and `host:port` helpers.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::supervisor::hide_console;

/// Upper bound on one echo, including process start
const PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Reachability check used by the diagnostic run.
#[async_trait]
pub trait Reachability: Send + Sync {
    /// `true` if one echo to `host` was answered.
    async fn ping(&self, host: &str) -> bool;
}

/// Uses the platform `ping` command.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemPing;

#[async_trait]
impl Reachability for SystemPing {
    async fn ping(&self, host: &str) -> bool {
        let mut cmd = Command::new("ping");
        if cfg!(windows) {
            cmd.args(["-n", "1", "-w", "2000", host]);
        } else {
            cmd.args(["-c", "1", "-W", "2", host]);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        hide_console(&mut cmd);

        match tokio::time::timeout(PING_TIMEOUT, cmd.status()).await {
            Ok(Ok(status)) => status.success(),
            Ok(Err(e)) => {
                debug!(%e, host, "ping could not run");
                false
            }
            Err(_) => false,
        }
    }
}

/// Split on the last colon. Without a colon the whole string is the host.
pub fn split_host_port(addr: &str) -> Option<(&str, &str)> {
    addr.rfind(':').map(|idx| (&addr[..idx], &addr[idx + 1..]))
}

/// Host part, with IPv6 brackets removed.
pub fn extract_host(addr: &str) -> &str {
    split_host_port(addr)
        .map_or(addr, |(host, _)| host)
        .trim_start_matches('[')
        .trim_end_matches(']')
}

pub fn extract_port(addr: &str) -> &str {
    split_host_port(addr).map_or("", |(_, port)| port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_extraction() {
        assert_eq!(extract_host("1.2.3.4:9999"), "1.2.3.4");
        assert_eq!(extract_host("example.com:443"), "example.com");
        assert_eq!(extract_host("just-host"), "just-host");
    }

    #[test]
    fn port_extraction() {
        assert_eq!(extract_port("1.2.3.4:9999"), "9999");
        assert_eq!(extract_port("example.com:443"), "443");
        assert_eq!(extract_port("just-host"), "");
    }

    #[test]
    fn bracketed_ipv6() {
        assert_eq!(split_host_port("[::1]:8080"), Some(("[::1]", "8080")));
        assert_eq!(extract_host("[::1]:8080"), "::1");
    }
}
