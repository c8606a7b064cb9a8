//! AutoPaqet core
//!
//! Supervision and connection diagnostics for the `paqet` packet-injection
//! tunnel:
//! - Tunnel process lifecycle with log capture and live fan-out
//! - SOCKS5 readiness polling and end-to-end tunnel verification
//! - Staged connection diagnostics with a TCP flag probe battery
//! - Remediation suggestions for failed connections
//! - Client config generation, network and capture driver detection

pub mod diagnostics;
pub mod driver;
pub mod error;
pub mod log_buffer;
pub mod network;
pub mod options;
pub mod ping;
pub mod probe;
pub mod socks5;
pub mod suggestions;
pub mod supervisor;

pub use diagnostics::{
    DiagnosticResult, DiagnosticRunner, LogSink, RunOptions, StepId, StepRecord, StepSink,
    StepStatus,
};
pub use driver::{DriverChecker, DriverStatus, PcapChecker};
pub use error::{ConfigError, DetectError, ReadinessError, SupervisorError, VerifyError};
pub use log_buffer::{LogSubscription, RingLogBuffer};
pub use network::{LinuxDetector, NetworkDetector, NetworkInfo};
pub use options::{ConfigGenerator, TunnelOptions, YamlConfigGenerator};
pub use probe::{FlagProbeBattery, FlagProbeRecord, Marker};
pub use supervisor::{find_tunnel_binary, ProcessState, ProcessSupervisor, TunnelRunner};
