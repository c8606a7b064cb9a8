//! Connection diagnostics orchestrator
//!
//! One [`DiagnosticRunner::run`] drives a single connection attempt through a
//! fixed sequence of stages and always comes back with a [`DiagnosticResult`]:
//!
//! ```text
//! network -> driver-check -> reachability -> connect -> verify
//!                 |                             |          |
//!                 `-> (missing driver: stop)    `----------`-> root-cause
//! ```
//!
//! Each stage appends exactly one terminal [`StepRecord`]; transient
//! `running` notifications go to the [`StepSink`] only. The cancellation
//! token is checked between stages and the summary of a cancelled run is
//! exactly [`CANCELLED_SUMMARY`].

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::driver::{self, DriverChecker};
use crate::error::VerifyError;
use crate::log_buffer::RingLogBuffer;
use crate::options::{ConfigGenerator, TunnelOptions, YamlConfigGenerator};
use crate::ping::{extract_host, extract_port, Reachability, SystemPing};
use crate::probe::{FlagProbeBattery, PROBE_TIMEOUT};
use crate::socks5::{HttpVerifier, ReadinessProbe, Socks5Poller, TunnelVerifier, VERIFY_TIMEOUT};
use crate::suggestions::{self, DRIVER_DOWNLOAD_URL};
use crate::supervisor::TunnelRunner;

pub use crate::probe::FlagProbeRecord;

pub const CANCELLED_SUMMARY: &str = "cancelled";
pub const CONNECTED_SUMMARY: &str = "CONNECTED";
pub const DNS_WARNING_SUMMARY: &str = "CONNECTED (DNS warning)";
pub const FAILED_SUMMARY: &str = "FAILED — connection did not establish";

/// Readiness deadline for the connect stage
pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(15);

/// Scratch config used by the connect stage
pub const DIAG_CONFIG_FILE: &str = "paqet-diag.yaml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepId {
    Network,
    DriverCheck,
    Reachability,
    Connect,
    Verify,
    RootCause,
}

impl StepId {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::DriverCheck => "driver-check",
            Self::Reachability => "reachability",
            Self::Connect => "connect",
            Self::Verify => "verify",
            Self::RootCause => "root-cause",
        }
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Running,
    Pass,
    Fail,
    Skip,
    Warn,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Pass => "pass",
            Self::Fail => "fail",
            Self::Skip => "skip",
            Self::Warn => "warn",
        }
    }

    /// Everything but `running`
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    pub id: StepId,
    pub status: StepStatus,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl StepRecord {
    pub fn new(id: StepId, status: StepStatus, message: impl Into<String>) -> Self {
        Self {
            id,
            status,
            message: message.into(),
            detail: None,
        }
    }

    pub fn running(id: StepId, message: impl Into<String>) -> Self {
        Self::new(id, StepStatus::Running, message)
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Final outcome of one diagnostic run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticResult {
    pub success: bool,
    pub steps: Vec<StepRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub flag_probes: Vec<FlagProbeRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<String>,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_summary: Option<String>,
}

impl DiagnosticResult {
    pub fn step(&self, id: StepId) -> Option<&StepRecord> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn is_cancelled(&self) -> bool {
        self.summary == CANCELLED_SUMMARY
    }

    /// Human-readable report, one entry per line.
    pub fn render_report(&self, generated_at: DateTime<Local>) -> Vec<String> {
        let mut lines = vec![
            String::new(),
            "=== AutoPaqet Diagnostic Report ===".to_string(),
            format!("Time: {}", generated_at.format("%Y-%m-%d %H:%M:%S")),
            String::new(),
        ];

        for step in &self.steps {
            lines.push(format!(
                "[{}] {}",
                step.status.as_str().to_uppercase(),
                step.message
            ));
            if let Some(detail) = step.detail.as_deref().filter(|d| !d.is_empty()) {
                lines.extend(detail.lines().map(|l| format!("       {l}")));
            }
        }

        if let Some(summary) = &self.config_summary {
            lines.push(String::new());
            lines.push("--- Client Config ---".to_string());
            lines.push(format!("  {summary}"));
        }

        if !self.flag_probes.is_empty() {
            lines.push(String::new());
            lines.push("--- Flag Probe Results ---".to_string());
            for probe in &self.flag_probes {
                let tag = if probe.success { "PASS" } else { "FAIL" };
                lines.push(format!(
                    "[{tag}] paqet ping {} flags: {}",
                    probe.marker, probe.output
                ));
            }
        }

        lines.push(String::new());
        lines.push(format!("Result: {}", self.summary));

        if !self.suggestions.is_empty() {
            lines.push(String::new());
            lines.push("Suggestions:".to_string());
            for (i, s) in self.suggestions.iter().enumerate() {
                lines.push(format!("  {}. {s}", i + 1));
            }
        }

        lines.push("=== End Report ===".to_string());
        lines.push(String::new());
        lines
    }
}

/// Receives every step notification, transient and final.
pub trait StepSink: Send + Sync {
    fn emit(&self, step: &StepRecord);
}

impl<F> StepSink for F
where
    F: Fn(&StepRecord) + Send + Sync,
{
    fn emit(&self, step: &StepRecord) {
        self(step)
    }
}

/// Receives the rendered report.
pub trait LogSink: Send + Sync {
    fn emit(&self, line: &str);
}

impl<F> LogSink for F
where
    F: Fn(&str) + Send + Sync,
{
    fn emit(&self, line: &str) {
        self(line)
    }
}

impl LogSink for RingLogBuffer {
    fn emit(&self, line: &str) {
        self.append(line);
    }
}

/// Per-run inputs.
#[derive(Clone)]
pub struct RunOptions {
    pub options: TunnelOptions,
    /// Local SOCKS5 endpoint the tunnel exposes
    pub socks_addr: String,
    pub profile_name: String,
    pub requires_driver: bool,
    pub driver_checker: Option<Arc<dyn DriverChecker>>,
    pub attempt_timeout: Duration,
}

impl RunOptions {
    pub fn new(options: TunnelOptions) -> Self {
        Self {
            socks_addr: options.effective_socks_listen().to_string(),
            options,
            profile_name: String::new(),
            requires_driver: driver::requires_driver(),
            driver_checker: None,
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
        }
    }

    pub fn with_profile_name(mut self, name: impl Into<String>) -> Self {
        self.profile_name = name.into();
        self
    }

    pub fn with_driver_checker(mut self, checker: Arc<dyn DriverChecker>) -> Self {
        self.driver_checker = Some(checker);
        self
    }

    pub fn with_requires_driver(mut self, required: bool) -> Self {
        self.requires_driver = required;
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        if !timeout.is_zero() {
            self.attempt_timeout = timeout;
        }
        self
    }
}

/// Drives the staged connection diagnostics.
pub struct DiagnosticRunner {
    binary: PathBuf,
    scratch_dir: PathBuf,
    runner: Arc<dyn TunnelRunner>,
    generator: Arc<dyn ConfigGenerator>,
    readiness: Arc<dyn ReadinessProbe>,
    verifier: Arc<dyn TunnelVerifier>,
    reachability: Arc<dyn Reachability>,
    step_sink: Option<Arc<dyn StepSink>>,
    log_sink: Option<Arc<dyn LogSink>>,
    verify_timeout: Duration,
    probe_timeout: Duration,
}

impl DiagnosticRunner {
    /// `binary` is used for one-shot flag probes; `runner` owns the
    /// long-running tunnel. Scratch configs are written under `scratch_dir`.
    pub fn new(
        binary: impl Into<PathBuf>,
        scratch_dir: impl Into<PathBuf>,
        runner: Arc<dyn TunnelRunner>,
    ) -> Self {
        Self {
            binary: binary.into(),
            scratch_dir: scratch_dir.into(),
            runner,
            generator: Arc::new(YamlConfigGenerator),
            readiness: Arc::new(Socks5Poller::default()),
            verifier: Arc::new(HttpVerifier::default()),
            reachability: Arc::new(SystemPing),
            step_sink: None,
            log_sink: None,
            verify_timeout: VERIFY_TIMEOUT,
            probe_timeout: PROBE_TIMEOUT,
        }
    }

    pub fn with_generator(mut self, generator: Arc<dyn ConfigGenerator>) -> Self {
        self.generator = generator;
        self
    }

    pub fn with_readiness(mut self, readiness: Arc<dyn ReadinessProbe>) -> Self {
        self.readiness = readiness;
        self
    }

    pub fn with_verifier(mut self, verifier: Arc<dyn TunnelVerifier>) -> Self {
        self.verifier = verifier;
        self
    }

    pub fn with_reachability(mut self, reachability: Arc<dyn Reachability>) -> Self {
        self.reachability = reachability;
        self
    }

    pub fn with_step_sink(mut self, sink: impl StepSink + 'static) -> Self {
        self.step_sink = Some(Arc::new(sink));
        self
    }

    pub fn with_log_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.log_sink = Some(sink);
        self
    }

    pub fn with_verify_timeout(mut self, timeout: Duration) -> Self {
        self.verify_timeout = timeout;
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn scratch_config_path(&self) -> PathBuf {
        self.scratch_dir.join(DIAG_CONFIG_FILE)
    }

    fn battery(&self) -> FlagProbeBattery {
        FlagProbeBattery::new(&self.binary, &self.scratch_dir, self.generator.clone())
            .with_timeout(self.probe_timeout)
    }

    fn notify(&self, step: &StepRecord) {
        if let Some(sink) = &self.step_sink {
            sink.emit(step);
        }
    }

    fn record(&self, result: &mut DiagnosticResult, step: StepRecord) {
        debug!(step = %step.id, status = %step.status, "{}", step.message);
        self.notify(&step);
        result.steps.push(step);
    }

    fn emit_report(&self, result: &DiagnosticResult) {
        if let Some(sink) = &self.log_sink {
            for line in result.render_report(Local::now()) {
                sink.emit(&line);
            }
        }
    }

    async fn stop_tunnel(&self) {
        if let Err(e) = self.runner.stop().await {
            warn!(%e, "Failed to stop tunnel process");
        }
    }

    /// Run every stage once. Never fails: problems end up in the steps.
    pub async fn run(&self, opts: &RunOptions, cancel: &CancellationToken) -> DiagnosticResult {
        let mut result = DiagnosticResult::default();
        let o = &opts.options;

        info!(
            profile = %opts.profile_name,
            server = %o.server_addr,
            socks = %opts.socks_addr,
            "Starting connection diagnostics"
        );

        // Network: detection already happened, just report it.
        let mut network = StepRecord::new(
            StepId::Network,
            StepStatus::Pass,
            format!("{} / {} / gw {}", o.interface_name, o.local_addr, o.gateway_mac),
        );
        if let Some(id) = o.capture_device_id.as_deref().filter(|id| !id.is_empty()) {
            network = network.with_detail(format!("capture device {id}"));
        }
        self.record(&mut result, network);

        if cancel.is_cancelled() {
            return cancelled(result);
        }

        if !self.check_driver(opts, &mut result).await {
            return result;
        }

        if cancel.is_cancelled() {
            return cancelled(result);
        }

        self.check_reachability(o, &mut result).await;

        if cancel.is_cancelled() {
            return cancelled(result);
        }

        self.connect(opts, cancel, result).await
    }

    /// `false` ends the run.
    async fn check_driver(&self, opts: &RunOptions, result: &mut DiagnosticResult) -> bool {
        if !opts.requires_driver {
            self.record(
                result,
                StepRecord::new(StepId::DriverCheck, StepStatus::Skip, "Npcap check (Windows only)"),
            );
            return true;
        }
        let Some(checker) = &opts.driver_checker else {
            self.record(
                result,
                StepRecord::new(StepId::DriverCheck, StepStatus::Skip, "Npcap check not configured"),
            );
            return true;
        };

        self.notify(&StepRecord::running(StepId::DriverCheck, "Checking Npcap..."));
        let status = checker.check().await;
        if status.installed {
            self.record(
                result,
                StepRecord::new(StepId::DriverCheck, StepStatus::Pass, "Npcap installed"),
            );
            return true;
        }

        warn!(detail = %status.message, "Capture driver missing");
        self.record(
            result,
            StepRecord::new(StepId::DriverCheck, StepStatus::Fail, "Npcap not installed")
                .with_detail(status.message),
        );
        let url = if status.download_url.is_empty() {
            DRIVER_DOWNLOAD_URL
        } else {
            status.download_url.as_str()
        };
        result.summary = "Npcap is required but not installed".to_string();
        result.suggestions = vec![
            format!("Install Npcap from {url}"),
            "Restart the application after installation".to_string(),
        ];
        false
    }

    async fn check_reachability(&self, o: &TunnelOptions, result: &mut DiagnosticResult) {
        self.notify(&StepRecord::running(StepId::Reachability, "Pinging server..."));
        let host = extract_host(&o.server_addr);
        let step = if self.reachability.ping(host).await {
            StepRecord::new(
                StepId::Reachability,
                StepStatus::Pass,
                format!("Server reachable ({host})"),
            )
        } else {
            StepRecord::new(StepId::Reachability, StepStatus::Warn, "Server ping: timeout")
                .with_detail("ICMP may be blocked by ISP — continuing")
        };
        self.record(result, step);
    }

    async fn connect(
        &self,
        opts: &RunOptions,
        cancel: &CancellationToken,
        mut result: DiagnosticResult,
    ) -> DiagnosticResult {
        let o = &opts.options;
        let flags = o.effective_local_flag();

        self.notify(&StepRecord::running(
            StepId::Connect,
            format!("Connecting ({flags} flags, port {})...", extract_port(&o.server_addr)),
        ));
        // Crashes while diagnosing are reported by the run itself.
        self.runner.set_state_notifications(false);

        let yaml = match self.generator.generate(o) {
            Ok(yaml) => yaml,
            Err(e) => {
                self.record(
                    &mut result,
                    StepRecord::new(StepId::Connect, StepStatus::Fail, "Config generation failed")
                        .with_detail(e.to_string()),
                );
                result.summary = "Failed to generate configuration".to_string();
                return result;
            }
        };

        let config_path = self.scratch_config_path();
        if let Err(e) = tokio::fs::write(&config_path, yaml).await {
            self.record(
                &mut result,
                StepRecord::new(StepId::Connect, StepStatus::Fail, "Failed to write config")
                    .with_detail(e.to_string()),
            );
            result.summary = "Failed to write configuration file".to_string();
            return result;
        }
        result.config_summary = Some(o.transport_summary());

        let started = Instant::now();
        if let Err(e) = self.runner.start(&config_path).await {
            self.record(
                &mut result,
                StepRecord::new(StepId::Connect, StepStatus::Fail, "Failed to start paqet")
                    .with_detail(e.to_string()),
            );
            result.summary = "Failed to start paqet process".to_string();
            result.suggestions = vec![
                "Check that paqet binary exists and is executable".to_string(),
                "Try running as administrator".to_string(),
            ];
            return result;
        }

        match self
            .readiness
            .wait_ready(&opts.socks_addr, opts.attempt_timeout, cancel)
            .await
        {
            Ok(()) => {
                let elapsed = started.elapsed();
                info!(elapsed = ?elapsed, "SOCKS5 endpoint ready");
                self.record(
                    &mut result,
                    StepRecord::new(
                        StepId::Connect,
                        StepStatus::Pass,
                        format!(
                            "Connected ({flags} flags): SOCKS5 ready in {}",
                            format_secs(elapsed)
                        ),
                    ),
                );
                self.verify(opts, cancel, result).await
            }
            Err(e) => {
                warn!(%e, "SOCKS5 endpoint never became ready");
                self.record(
                    &mut result,
                    StepRecord::new(
                        StepId::Connect,
                        StepStatus::Fail,
                        format!(
                            "Connect ({flags} flags): SOCKS5 timeout after {}",
                            format_secs(opts.attempt_timeout)
                        ),
                    )
                    .with_detail(e.to_string()),
                );
                self.stop_tunnel().await;

                if cancel.is_cancelled() {
                    return cancelled(result);
                }
                self.root_cause(opts, cancel, result).await
            }
        }
    }

    async fn verify(
        &self,
        opts: &RunOptions,
        cancel: &CancellationToken,
        mut result: DiagnosticResult,
    ) -> DiagnosticResult {
        if cancel.is_cancelled() {
            return cancelled(result);
        }
        self.notify(&StepRecord::running(
            StepId::Verify,
            "Verifying tunnel (HTTP test)...",
        ));

        let outcome = self
            .verifier
            .verify(&opts.socks_addr, self.verify_timeout)
            .await
            .and_then(|outcome| {
                if outcome.data_flow {
                    Ok(outcome)
                } else {
                    Err(VerifyError::Request("no response through tunnel".to_string()))
                }
            });

        match outcome {
            Err(e) => {
                warn!(%e, "Tunnel accepted connections but forwarded nothing");
                self.record(
                    &mut result,
                    StepRecord::new(StepId::Verify, StepStatus::Fail, "Tunnel not forwarding traffic")
                        .with_detail(format!(
                            "SOCKS5 proxy responds but HTTP request through tunnel failed: {e}"
                        )),
                );
                self.stop_tunnel().await;

                if cancel.is_cancelled() {
                    return cancelled(result);
                }
                self.root_cause(opts, cancel, result).await
            }
            Ok(outcome) if !outcome.dns => {
                self.record(
                    &mut result,
                    StepRecord::new(
                        StepId::Verify,
                        StepStatus::Warn,
                        "Tunnel works but DNS not resolving through proxy",
                    )
                    .with_detail(
                        "HTTP to 1.1.1.1 succeeded. DNS-based requests failed. Configure DNS manually.",
                    ),
                );
                result.success = true;
                result.summary = DNS_WARNING_SUMMARY.to_string();
                result.suggestions = vec![
                    "DNS resolution through the tunnel is not working".to_string(),
                    "Configure browser to use DNS over HTTPS (DoH) with 8.8.8.8 or 1.1.1.1".to_string(),
                    "Or set system DNS to 8.8.8.8 / 1.1.1.1".to_string(),
                ];
                self.finish_connected(&result);
                result
            }
            Ok(_) => {
                self.record(
                    &mut result,
                    StepRecord::new(
                        StepId::Verify,
                        StepStatus::Pass,
                        "Tunnel verified — HTTP and DNS working through proxy",
                    ),
                );
                result.success = true;
                result.summary = CONNECTED_SUMMARY.to_string();
                self.finish_connected(&result);
                result
            }
        }
    }

    fn finish_connected(&self, result: &DiagnosticResult) {
        info!(summary = %result.summary, "Tunnel connected");
        // From here on a crash is news to the caller.
        self.runner.set_state_notifications(true);
        self.emit_report(result);
    }

    async fn root_cause(
        &self,
        opts: &RunOptions,
        cancel: &CancellationToken,
        mut result: DiagnosticResult,
    ) -> DiagnosticResult {
        self.notify(&StepRecord::running(StepId::RootCause, "Running diagnostics..."));

        let probes = self
            .battery()
            .run(&opts.options, cancel, |marker| {
                self.notify(&StepRecord::running(
                    StepId::RootCause,
                    format!("Testing {marker} flags with paqet ping..."),
                ));
            })
            .await;

        if cancel.is_cancelled() {
            return cancelled(result);
        }

        result.suggestions = suggestions::synthesize(&opts.options, &result.steps, &probes);

        let detail = probes
            .iter()
            .map(|p| {
                let outcome = if p.success { "sent OK" } else { "failed" };
                format!("  {} flags: {outcome}", p.marker)
            })
            .collect::<Vec<_>>()
            .join("\n");

        let step = if probes.iter().any(|p| p.success) {
            StepRecord::new(
                StepId::RootCause,
                StepStatus::Warn,
                "Packet injection works but connection failed",
            )
        } else {
            StepRecord::new(StepId::RootCause, StepStatus::Fail, "All packet injection tests failed")
        };
        self.record(&mut result, step.with_detail(detail));

        result.flag_probes = probes;
        result.success = false;
        result.summary = FAILED_SUMMARY.to_string();
        info!(suggestions = result.suggestions.len(), "Diagnostics finished without a connection");
        self.emit_report(&result);
        result
    }
}

fn cancelled(mut result: DiagnosticResult) -> DiagnosticResult {
    info!(steps = result.steps.len(), "Diagnostics cancelled");
    result.success = false;
    result.summary = CANCELLED_SUMMARY.to_string();
    result.suggestions.clear();
    result.flag_probes.clear();
    result
}

/// `15s`, `2.3s`
fn format_secs(d: Duration) -> String {
    if d.subsec_millis() == 0 {
        format!("{}s", d.as_secs())
    } else {
        format!("{:.1}s", d.as_secs_f64())
    }
}
