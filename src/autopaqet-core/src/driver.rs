//! Packet-capture driver detection (Npcap on Windows, libpcap elsewhere).

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::network::{CommandRunner, SystemCommand};
use crate::suggestions::DRIVER_DOWNLOAD_URL;

const LIBPCAP_PATHS: [&str; 3] = [
    "/usr/lib/x86_64-linux-gnu/libpcap.so",
    "/usr/lib/libpcap.so",
    "/usr/lib/aarch64-linux-gnu/libpcap.so",
];

/// Whether this platform needs a separately installed capture driver.
pub fn requires_driver() -> bool {
    cfg!(windows)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverStatus {
    pub installed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub download_url: String,
    #[serde(default)]
    pub message: String,
}

impl DriverStatus {
    fn found(message: &str) -> Self {
        Self {
            installed: true,
            version: None,
            download_url: String::new(),
            message: message.to_string(),
        }
    }

    fn missing(message: &str) -> Self {
        Self {
            installed: false,
            version: None,
            download_url: DRIVER_DOWNLOAD_URL.to_string(),
            message: message.to_string(),
        }
    }
}

#[async_trait]
pub trait DriverChecker: Send + Sync {
    async fn check(&self) -> DriverStatus;
}

type FileProbe = Box<dyn Fn(&Path) -> bool + Send + Sync>;

/// Looks for the capture library on disk, then asks the package tooling.
pub struct PcapChecker<R = SystemCommand> {
    runner: R,
    file_exists: FileProbe,
}

impl PcapChecker {
    pub fn new() -> Self {
        Self::with_probes(SystemCommand, |p: &Path| p.exists())
    }
}

impl Default for PcapChecker {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: CommandRunner> PcapChecker<R> {
    pub fn with_probes<F>(runner: R, file_exists: F) -> Self
    where
        F: Fn(&Path) -> bool + Send + Sync + 'static,
    {
        Self {
            runner,
            file_exists: Box::new(file_exists),
        }
    }

    /// Npcap DLL under `system_root`, or the legacy WinPcap location.
    pub fn check_npcap(&self, system_root: &Path) -> DriverStatus {
        let system32 = system_root.join("System32");
        if (self.file_exists)(&system32.join("Npcap").join("wpcap.dll")) {
            return DriverStatus::found("Npcap is installed");
        }
        if (self.file_exists)(&system32.join("wpcap.dll")) {
            return DriverStatus::found("WinPcap/Npcap is installed (legacy path)");
        }
        DriverStatus::missing(
            "Npcap is not installed. Download from npcap.com (free for personal use).",
        )
    }

    pub async fn check_libpcap(&self) -> DriverStatus {
        if LIBPCAP_PATHS
            .iter()
            .any(|p| (self.file_exists)(Path::new(p)))
        {
            return DriverStatus::found("libpcap found");
        }

        match self.runner.run("ldconfig", &["-p"]).await {
            Ok(out) if out.contains("libpcap") => {
                return DriverStatus::found("libpcap found via ldconfig")
            }
            Ok(_) => {}
            Err(e) => debug!(%e, "ldconfig lookup failed"),
        }

        match self.runner.run("dpkg", &["-l", "libpcap-dev"]).await {
            Ok(out) if out.contains("libpcap") => {
                return DriverStatus::found("libpcap-dev package installed")
            }
            Ok(_) => {}
            Err(e) => debug!(%e, "dpkg lookup failed"),
        }

        DriverStatus::missing("libpcap not found. Install with: sudo apt-get install libpcap-dev")
    }
}

#[async_trait]
impl<R: CommandRunner> DriverChecker for PcapChecker<R> {
    async fn check(&self) -> DriverStatus {
        if cfg!(windows) {
            let root = std::env::var_os("SystemRoot")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(r"C:\Windows"));
            self.check_npcap(&root)
        } else {
            self.check_libpcap().await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DetectError;

    struct FixedRunner {
        ldconfig: Option<&'static str>,
        dpkg: Option<&'static str>,
    }

    #[async_trait]
    impl CommandRunner for FixedRunner {
        async fn run(&self, program: &str, _args: &[&str]) -> Result<String, DetectError> {
            let reply = match program {
                "ldconfig" => self.ldconfig,
                "dpkg" => self.dpkg,
                _ => None,
            };
            reply
                .map(str::to_string)
                .ok_or_else(|| DetectError::Command(format!("{program}: not found")))
        }
    }

    const NO_COMMANDS: FixedRunner = FixedRunner {
        ldconfig: None,
        dpkg: None,
    };

    #[tokio::test]
    async fn library_file_is_enough() {
        let checker = PcapChecker::with_probes(NO_COMMANDS, |p: &Path| {
            p == Path::new("/usr/lib/libpcap.so")
        });
        let status = checker.check_libpcap().await;
        assert!(status.installed);
        assert_eq!(status.message, "libpcap found");
    }

    #[tokio::test]
    async fn falls_back_to_ldconfig_then_dpkg() {
        let checker = PcapChecker::with_probes(
            FixedRunner {
                ldconfig: Some("libpcap.so.0.8 (libc6,x86-64) => /lib/libpcap.so.0.8"),
                dpkg: None,
            },
            |_: &Path| false,
        );
        assert_eq!(checker.check_libpcap().await.message, "libpcap found via ldconfig");

        let checker = PcapChecker::with_probes(
            FixedRunner {
                ldconfig: Some("libc.so.6"),
                dpkg: Some("ii  libpcap-dev:amd64 1.10.1"),
            },
            |_: &Path| false,
        );
        assert_eq!(checker.check_libpcap().await.message, "libpcap-dev package installed");
    }

    #[tokio::test]
    async fn missing_library_carries_download_url() {
        let checker = PcapChecker::with_probes(NO_COMMANDS, |_: &Path| false);
        let status = checker.check_libpcap().await;
        assert!(!status.installed);
        assert_eq!(status.download_url, DRIVER_DOWNLOAD_URL);
        assert!(status.message.contains("apt-get install libpcap-dev"));
    }

    #[test]
    fn npcap_paths() {
        let root = Path::new("/win");
        let modern = PcapChecker::with_probes(NO_COMMANDS, |p: &Path| {
            p.ends_with("System32/Npcap/wpcap.dll")
        });
        assert_eq!(modern.check_npcap(root).message, "Npcap is installed");

        let legacy = PcapChecker::with_probes(NO_COMMANDS, |p: &Path| {
            p == Path::new("/win/System32/wpcap.dll")
        });
        assert!(legacy.check_npcap(root).message.contains("legacy path"));

        let none = PcapChecker::with_probes(NO_COMMANDS, |_: &Path| false);
        assert!(!none.check_npcap(root).installed);
    }
}
