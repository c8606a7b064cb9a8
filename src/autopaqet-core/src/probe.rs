//! TCP flag markers and the one-shot flag probe battery.
//!
//! For each marker the battery renders a dedicated config with that marker on
//! both sides and runs `paqet ping -c <config>`, which injects a single probe
//! packet and exits. It never touches a `run`-mode tunnel.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::options::{ConfigGenerator, TunnelOptions};
use crate::supervisor::hide_console;

/// Subcommand for a single probe packet
pub const PROBE_SUBCOMMAND: &str = "ping";

/// Phrase the tunnel prints when the probe packet was accepted for injection
pub const SUCCESS_PHRASE: &str = "sent successfully";

pub const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// TCP flag combination used to initiate tunnel traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Marker {
    /// SYN
    #[serde(rename = "S")]
    Syn,
    /// PSH+ACK
    #[default]
    #[serde(rename = "PA")]
    PushAck,
    /// ACK
    #[serde(rename = "A")]
    Ack,
}

impl Marker {
    /// Fixed iteration order of the battery
    pub const PROBE_ORDER: [Marker; 3] = [Marker::Syn, Marker::PushAck, Marker::Ack];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Syn => "S",
            Self::PushAck => "PA",
            Self::Ack => "A",
        }
    }
}

impl fmt::Display for Marker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown TCP flag marker: {0}")]
pub struct UnknownMarker(pub String);

impl FromStr for Marker {
    type Err = UnknownMarker;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "S" => Ok(Self::Syn),
            "PA" => Ok(Self::PushAck),
            "A" => Ok(Self::Ack),
            _ => Err(UnknownMarker(s.to_string())),
        }
    }
}

/// Outcome of probing one marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlagProbeRecord {
    pub marker: Marker,
    pub success: bool,
    pub output: String,
}

/// Runs the one-shot probe for every marker in [`Marker::PROBE_ORDER`].
pub struct FlagProbeBattery {
    binary: PathBuf,
    scratch_dir: PathBuf,
    generator: Arc<dyn ConfigGenerator>,
    timeout: Duration,
}

impl FlagProbeBattery {
    pub fn new(
        binary: impl Into<PathBuf>,
        scratch_dir: impl Into<PathBuf>,
        generator: Arc<dyn ConfigGenerator>,
    ) -> Self {
        Self {
            binary: binary.into(),
            scratch_dir: scratch_dir.into(),
            generator,
            timeout: PROBE_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    pub fn scratch_path(&self, marker: Marker) -> PathBuf {
        self.scratch_dir
            .join(format!("paqet-probe-{}.yaml", marker.as_str().to_lowercase()))
    }

    /// Probe every marker in order. Stops early once `cancel` fires.
    pub async fn run<F>(
        &self,
        options: &TunnelOptions,
        cancel: &CancellationToken,
        mut on_marker: F,
    ) -> Vec<FlagProbeRecord>
    where
        F: FnMut(Marker),
    {
        let mut records = Vec::with_capacity(Marker::PROBE_ORDER.len());
        for marker in Marker::PROBE_ORDER {
            if cancel.is_cancelled() {
                break;
            }
            on_marker(marker);
            let record = tokio::select! {
                record = self.probe(options, marker) => record,
                _ = cancel.cancelled() => break,
            };
            info!(marker = %marker, success = record.success, "Flag probe finished");
            records.push(record);
        }
        records
    }

    /// Probe a single marker.
    pub async fn probe(&self, options: &TunnelOptions, marker: Marker) -> FlagProbeRecord {
        let failed = |output: String| FlagProbeRecord {
            marker,
            success: false,
            output,
        };

        let yaml = match self.generator.generate(&options.for_probe(marker)) {
            Ok(yaml) => yaml,
            Err(e) => return failed(format!("config error: {e}")),
        };

        let path = self.scratch_path(marker);
        if let Err(e) = tokio::fs::write(&path, yaml).await {
            return failed(format!("write error: {e}"));
        }

        let mut cmd = Command::new(&self.binary);
        cmd.arg(PROBE_SUBCOMMAND)
            .arg("-c")
            .arg(&path)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        hide_console(&mut cmd);

        debug!(marker = %marker, config = %path.display(), "Running flag probe");
        let out = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(out)) => out,
            Ok(Err(e)) => return failed(format!("failed to run probe: {e}")),
            Err(_) => return failed(format!("probe timed out after {:?}", self.timeout)),
        };

        let mut combined = String::from_utf8_lossy(&out.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&out.stderr));
        let output = combined.trim().to_string();

        if !out.status.success() {
            return failed(output);
        }

        let success = output.to_lowercase().contains(SUCCESS_PHRASE);
        FlagProbeRecord {
            marker,
            success,
            output,
        }
    }
}


#[cfg(all(test, unix))]
mod battery_tests {
    use super::*;
    use crate::options::YamlConfigGenerator;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn options() -> TunnelOptions {
        TunnelOptions {
            server_addr: "1.2.3.4:9999".into(),
            key: "k".into(),
            interface_name: "eth0".into(),
            local_addr: "10.0.0.1:12345".into(),
            gateway_mac: "aa:bb:cc:dd:ee:ff".into(),
            ..Default::default()
        }
    }

    fn battery(dir: &TempDir, body: &str) -> FlagProbeBattery {
        let script = dir.path().join("fake-paqet.sh");
        std::fs::write(&script, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        FlagProbeBattery::new(script, dir.path(), Arc::new(YamlConfigGenerator))
    }

    #[tokio::test]
    async fn success_phrase_marks_probe_ok() {
        let dir = TempDir::new().unwrap();
        let battery = battery(&dir, "echo 'Packet sent successfully!'");

        let record = battery.probe(&options(), Marker::Syn).await;
        assert!(record.success);
        assert_eq!(record.output, "Packet sent successfully!");
    }

    #[tokio::test]
    async fn probe_config_carries_marker_and_debug_logging() {
        let dir = TempDir::new().unwrap();
        let battery = battery(&dir, "cat \"$3\"");

        let record = battery.probe(&options(), Marker::Ack).await;
        assert!(!record.success);
        assert!(record.output.contains("level: debug"));
        assert!(dir.path().join("paqet-probe-a.yaml").exists());

        let doc: serde_yaml::Value = serde_yaml::from_str(&record.output).unwrap();
        assert_eq!(doc["network"]["tcp"]["local_flag"][0], "A");
        assert_eq!(doc["network"]["tcp"]["remote_flag"][0], "A");
    }

    #[tokio::test]
    async fn non_zero_exit_fails_even_with_phrase() {
        let dir = TempDir::new().unwrap();
        let battery = battery(&dir, "echo 'sent successfully'; exit 1");

        assert!(!battery.probe(&options(), Marker::PushAck).await.success);
    }

    #[tokio::test]
    async fn missing_binary_fails_probe() {
        let dir = TempDir::new().unwrap();
        let battery =
            FlagProbeBattery::new("/nonexistent/paqet", dir.path(), Arc::new(YamlConfigGenerator));

        let record = battery.probe(&options(), Marker::Syn).await;
        assert!(!record.success);
        assert!(record.output.starts_with("failed to run probe"));
    }

    #[tokio::test]
    async fn config_error_fails_probe() {
        let dir = TempDir::new().unwrap();
        let battery = battery(&dir, "echo 'Packet sent successfully!'");
        let mut opts = options();
        opts.key.clear();

        let record = battery.probe(&opts, Marker::Syn).await;
        assert!(!record.success);
        assert_eq!(record.output, "config error: key is required");
    }

    #[tokio::test]
    async fn hung_probe_times_out() {
        let dir = TempDir::new().unwrap();
        let battery = battery(&dir, "sleep 5").with_timeout(Duration::from_millis(200));

        let record = battery.probe(&options(), Marker::Syn).await;
        assert!(!record.success);
        assert!(record.output.contains("timed out"));
    }

    #[tokio::test]
    async fn run_visits_markers_in_order() {
        let dir = TempDir::new().unwrap();
        let battery = battery(
            &dir,
            "case \"$3\" in *probe-s.yaml) echo 'Packet sent successfully!';; *) echo 'send failed';; esac",
        );

        let mut visited = Vec::new();
        let records = battery
            .run(&options(), &CancellationToken::new(), |m| visited.push(m))
            .await;

        assert_eq!(visited, Marker::PROBE_ORDER.to_vec());
        let outcome: Vec<_> = records.iter().map(|r| (r.marker, r.success)).collect();
        assert_eq!(
            outcome,
            vec![
                (Marker::Syn, true),
                (Marker::PushAck, false),
                (Marker::Ack, false)
            ]
        );
    }

    #[tokio::test]
    async fn cancelled_run_probes_nothing() {
        let dir = TempDir::new().unwrap();
        let battery = battery(&dir, "echo 'Packet sent successfully!'");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let records = battery.run(&options(), &cancel, |_| {}).await;
        assert!(records.is_empty());
    }
}
