//! Detection of the outbound interface, local address and gateway.

use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::DetectError;
use crate::options::TunnelOptions;
use crate::ping::extract_port;
use crate::supervisor::hide_console;

/// Port the injected packets originate from when the profile sets none
pub const DEFAULT_LOCAL_PORT: u16 = 12345;

/// Destination used to pick the default route
const ROUTE_PROBE_ADDR: &str = "1.1.1.1";

/// Detected network configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInfo {
    pub interface_name: String,
    pub local_ip: String,
    pub gateway_ip: String,
    pub gateway_mac: String,
    /// Npcap device GUID (Windows only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capture_device_id: Option<String>,
}

impl NetworkInfo {
    /// Fill the detected fields of `options`, keeping a port already set
    /// in `local_addr`.
    pub fn apply_to(&self, options: &mut TunnelOptions) {
        let port = match extract_port(&options.local_addr) {
            "" => DEFAULT_LOCAL_PORT.to_string(),
            port => port.to_string(),
        };
        options.interface_name = self.interface_name.clone();
        options.local_addr = format!("{}:{port}", self.local_ip);
        options.gateway_mac = self.gateway_mac.clone();
        options.capture_device_id = self.capture_device_id.clone();
    }
}

#[async_trait]
pub trait NetworkDetector: Send + Sync {
    async fn detect(&self) -> Result<NetworkInfo, DetectError>;
}

/// Runs an external command and returns its trimmed standard output.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[&str]) -> Result<String, DetectError>;
}

/// [`CommandRunner`] backed by real processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemCommand;

#[async_trait]
impl CommandRunner for SystemCommand {
    async fn run(&self, program: &str, args: &[&str]) -> Result<String, DetectError> {
        let mut cmd = Command::new(program);
        cmd.args(args).stdin(Stdio::null()).kill_on_drop(true);
        hide_console(&mut cmd);

        let out = cmd
            .output()
            .await
            .map_err(|e| DetectError::Command(format!("{program}: {e}")))?;
        if !out.status.success() {
            return Err(DetectError::Command(format!("{program}: {}", out.status)));
        }
        Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
    }
}

/// Uses `ip route` and `ip neigh`.
pub struct LinuxDetector<R = SystemCommand> {
    runner: R,
}

impl LinuxDetector {
    pub fn new() -> Self {
        Self {
            runner: SystemCommand,
        }
    }
}

impl Default for LinuxDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: CommandRunner> LinuxDetector<R> {
    pub fn with_runner(runner: R) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl<R: CommandRunner> NetworkDetector for LinuxDetector<R> {
    async fn detect(&self) -> Result<NetworkInfo, DetectError> {
        let route = self
            .runner
            .run("ip", &["route", "get", ROUTE_PROBE_ADDR])
            .await
            .map_err(|e| DetectError::Command(format!("failed to get route: {e}")))?;

        let interface_name = field_after(&route, "dev").ok_or(DetectError::Missing("network interface"))?;
        let local_ip = field_after(&route, "src").ok_or(DetectError::Missing("local IP"))?;
        let gateway_ip = field_after(&route, "via").ok_or(DetectError::Missing("gateway IP"))?;

        // Populate the ARP cache; the result does not matter.
        if let Err(e) = self
            .runner
            .run("ping", &["-c", "1", "-W", "1", gateway_ip])
            .await
        {
            debug!(%e, gateway_ip, "Gateway ping failed");
        }

        let neigh = self
            .runner
            .run("ip", &["neigh", "show", gateway_ip])
            .await
            .map_err(|e| DetectError::Command(format!("failed to get neighbor: {e}")))?;
        let gateway_mac = extract_mac(&neigh).ok_or(DetectError::Missing("gateway MAC address"))?;

        let info = NetworkInfo {
            interface_name: interface_name.to_string(),
            local_ip: local_ip.to_string(),
            gateway_ip: gateway_ip.to_string(),
            gateway_mac: gateway_mac.to_string(),
            capture_device_id: None,
        };
        info!(
            interface = %info.interface_name,
            local_ip = %info.local_ip,
            gateway = %info.gateway_ip,
            "Network detected"
        );
        Ok(info)
    }
}

fn field_after<'a>(output: &'a str, key: &str) -> Option<&'a str> {
    let mut parts = output.split_whitespace();
    while let Some(part) = parts.next() {
        if part == key {
            return parts.next();
        }
    }
    None
}

fn looks_like_mac(s: &str) -> bool {
    s.split(':').count() == 6
}

/// `ip neigh` line: `IP dev IFACE lladdr MAC STATE`
fn extract_mac(output: &str) -> Option<&str> {
    field_after(output, "lladdr").or_else(|| {
        output
            .split_whitespace()
            .nth(4)
            .filter(|candidate| looks_like_mac(candidate))
    })
}
