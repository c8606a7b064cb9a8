//! Remediation advice derived from a failed run's evidence.
//!
//! The rules form a decision tree: the first branch that matches is the only
//! one applied. Advice from different branches contradicts each other
//! (a broken driver versus a filtered marker), so they never mix.

use crate::diagnostics::{StepId, StepRecord, StepStatus};
use crate::ping::extract_port;
use crate::probe::{FlagProbeRecord, Marker};
use crate::options::TunnelOptions;

pub const DRIVER_DOWNLOAD_URL: &str = "https://npcap.com/#download";

const HTTPS_PORT: &str = "443";

struct Evidence {
    verify_failed: bool,
    reachability_warned: bool,
    any_sent: bool,
    all_sent: bool,
    syn_sent: bool,
}

impl Evidence {
    fn collect(steps: &[StepRecord], probes: &[FlagProbeRecord]) -> Self {
        let has = |id: StepId, status: StepStatus| {
            steps.iter().any(|s| s.id == id && s.status == status)
        };
        Self {
            verify_failed: has(StepId::Verify, StepStatus::Fail),
            reachability_warned: has(StepId::Reachability, StepStatus::Warn),
            any_sent: probes.iter().any(|p| p.success),
            all_sent: probes.iter().all(|p| p.success),
            syn_sent: probes
                .iter()
                .any(|p| p.success && p.marker == Marker::Syn),
        }
    }
}

fn server_side_checks(port: &str) -> [String; 2] {
    [
        format!("Ask admin to run: tcpdump -i eth0 port {port} (on server, to check if packets arrive)"),
        "Ask admin to check server logs for errors or connection attempts".to_string(),
    ]
}

/// Ordered suggestions for the run described by `steps` and `probes`.
pub fn synthesize(
    options: &TunnelOptions,
    steps: &[StepRecord],
    probes: &[FlagProbeRecord],
) -> Vec<String> {
    let evidence = Evidence::collect(steps, probes);
    let port = extract_port(&options.server_addr);
    let mut out = Vec::new();

    if !evidence.any_sent {
        out.push("All packet injection tests failed — Npcap may not be working correctly".to_string());
        out.push(format!("Try reinstalling Npcap from {DRIVER_DOWNLOAD_URL}"));
        out.push("Ensure the application is running with administrator privileges".to_string());
        return out;
    }

    // Every marker leaves the host yet verify failed: the server sees the
    // packets but cannot decode them.
    if evidence.verify_failed && evidence.all_sent {
        out.push("SOCKS5 proxy started but tunnel is not forwarding traffic".to_string());
        out.push(format!(
            "Client KCP settings: mode={}, conn={}, block={} — these MUST match the server",
            options.effective_mode(),
            options.effective_conn(),
            options.effective_block(),
        ));
        out.push(
            "Ask admin for the server's transport settings (mode, conn, block) and update your profile to match"
                .to_string(),
        );
        out.push("Common fix: change Mode to 'fast' and Connections to 1 in Settings tab".to_string());
        out.extend(server_side_checks(port));
        return out;
    }

    let current = options.effective_local_flag();
    if evidence.all_sent {
        out.push("Packets can be sent locally with all flag types (Npcap working)".to_string());
        out.push(format!(
            "Server may not be receiving {current} packets — ISP/router may be blocking them"
        ));
    }
    if evidence.syn_sent && current != Marker::Syn {
        out.push(
            "Try: Update BOTH the profile AND server config to use S (SYN) flags — SYN passes most firewalls"
                .to_string(),
        );
    }
    if port != HTTPS_PORT {
        out.push("Try: Change server port to 443 (HTTPS port, less likely to be filtered)".to_string());
    }
    if evidence.reachability_warned {
        out.push(
            "Server IP may be unreachable — verify the server is running and the IP is correct"
                .to_string(),
        );
    }
    out.extend(server_side_checks(port));
    out
}
