//! Terminal rendering of diagnostic progress and results

use autopaqet_core::{DiagnosticResult, FlagProbeRecord, StepRecord, StepStatus};
use colored::{ColoredString, Colorize};

fn status_tag(status: StepStatus) -> ColoredString {
    let tag = format!("{:>4}", status.as_str().to_uppercase());
    match status {
        StepStatus::Running => tag.cyan(),
        StepStatus::Pass => tag.green(),
        StepStatus::Fail => tag.red(),
        StepStatus::Warn => tag.yellow(),
        StepStatus::Skip => tag.dimmed(),
    }
}

/// One line per step notification, detail lines indented below it.
pub fn print_step(step: &StepRecord) {
    let message = if step.status == StepStatus::Running {
        step.message.dimmed()
    } else {
        step.message.normal()
    };
    println!("  [{}] {:<13} {}", status_tag(step.status), step.id.as_str(), message);
    if step.status.is_terminal() {
        if let Some(detail) = &step.detail {
            for line in detail.lines() {
                println!("         {}", line.dimmed());
            }
        }
    }
}

pub fn print_probes(probes: &[FlagProbeRecord]) {
    for probe in probes {
        let tag = if probe.success {
            "PASS".green()
        } else {
            "FAIL".red()
        };
        println!("  [{}] {} flags: {}", tag, probe.marker, probe.output.dimmed());
    }
}

pub fn print_summary(result: &DiagnosticResult) {
    println!("\n{}", "─".repeat(60));
    if result.success {
        println!("{}", result.summary.green().bold());
    } else {
        println!("{}", result.summary.red().bold());
    }

    if let Some(config) = &result.config_summary {
        println!("Client config: {}", config.cyan());
    }

    if !result.suggestions.is_empty() {
        println!("\n{}", " Suggestions ".bold());
        for (i, suggestion) in result.suggestions.iter().enumerate() {
            println!("  {}. {}", i + 1, suggestion);
        }
    }
    println!("{}", "─".repeat(60));
}
