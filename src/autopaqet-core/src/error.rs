//! Error types for the supervision and diagnostic layers.
//!
//! The diagnostic orchestrator itself never returns these: every failure it
//! meets is folded into a [`crate::diagnostics::StepRecord`]. They surface
//! from the individual building blocks so callers can use those directly.

use std::time::Duration;

use thiserror::Error;

use crate::supervisor::ProcessState;

/// Errors raised by the [`crate::supervisor::ProcessSupervisor`].
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// `start()` was called while a process is starting or running
    #[error("cannot start: current state is {0}")]
    AlreadyRunning(ProcessState),

    /// The tunnel binary could not be spawned
    #[error("failed to start tunnel process: {0}")]
    Spawn(#[source] std::io::Error),

    /// A stdio pipe was not available after spawn
    #[error("failed to capture {0} pipe")]
    Pipe(&'static str),

    /// No tunnel binary could be located
    #[error("tunnel binary not found: {0}")]
    BinaryNotFound(String),

    /// Delivering a termination signal failed
    #[error("failed to signal tunnel process: {0}")]
    Signal(String),
}

/// Errors raised while turning [`crate::options::TunnelOptions`] into a config document.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required option was left empty
    #[error("{0} is required")]
    MissingField(&'static str),

    /// The document could not be serialized
    #[error("failed to marshal config: {0}")]
    Serialize(String),

    /// Writing the document to disk failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(e: serde_yaml::Error) -> Self {
        ConfigError::Serialize(e.to_string())
    }
}

/// Errors raised by the SOCKS5 readiness poller.
#[derive(Debug, Error)]
pub enum ReadinessError {
    #[error("SOCKS5 timeout after {after:?}: tunnel not ready on {addr}")]
    Timeout { addr: String, after: Duration },

    #[error("readiness polling cancelled")]
    Cancelled,

    /// The proxy answered but refused or garbled the negotiation
    #[error("SOCKS5 handshake failed: {0}")]
    Handshake(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the tunnel verifier when no data flows at all.
#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("failed to create SOCKS5 client: {0}")]
    Client(String),

    #[error("HTTP via tunnel failed: {0}")]
    Request(String),
}

/// Errors raised by network detection.
#[derive(Debug, Error)]
pub enum DetectError {
    #[error("command failed: {0}")]
    Command(String),

    #[error("could not detect {0}")]
    Missing(&'static str),
}
