//! Console output helpers.
//!
//! Provides consistent formatting for operator-facing progress during a
//! restart. Structured diagnostics go through `tracing`; these lines are what
//! the operator watches while the workflow runs.

use colored::{ColoredString, Colorize};

use crate::health::PodStatus;
use crate::monitor::PodCounts;

/// Print a section header.
pub fn print_section(title: &str) {
    println!();
    println!("{}", "═".repeat(70).bright_black());
    println!("{}", title.cyan().bold());
    println!("{}", "═".repeat(70).bright_black());
}

/// Print a numbered workflow step header.
pub fn print_progress_step(current: u8, total: u8, message: &str) {
    println!();
    println!(
        "{} {} {}",
        format!("[{current}/{total}]").bright_black(),
        "▶".cyan(),
        message.bold()
    );
}

/// Print a step indicator with message.
pub fn print_step(message: &str) {
    println!("{} {}", "▶".cyan(), message.bold());
}

/// Print a success message.
pub fn print_success(message: &str) {
    println!("{} {}", "✓".green().bold(), message.green());
}

/// Print a warning message.
pub fn print_warning(message: &str) {
    println!("{} {}", "⚠".yellow().bold(), message.yellow());
}

/// Print an error message.
pub fn print_error(message: &str) {
    println!("{} {}", "✗".red().bold(), message.red());
}

/// Print an info message.
pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue().bold(), message);
}

/// Print a nested progress line.
pub fn print_progress(message: &str) {
    println!("  {} {}", "→".cyan(), message);
}

/// Print a pass/fail line.
pub fn print_check_result(name: &str, passed: bool, message: Option<&str>) {
    let status = if passed { "✓".green() } else { "✗".red() };

    let text = if let Some(msg) = message {
        format!("{name} - {msg}")
    } else {
        name.to_string()
    };

    println!("  {status} {text}");
}

// Kept as `ColoredString` so width specifiers pad the label, not the escape codes.
fn colored_status(status: &PodStatus) -> ColoredString {
    let label = status.status_label();
    if status.is_healthy() {
        label.green()
    } else {
        label.red()
    }
}

/// Print one health snapshot as a table.
pub fn print_pod_table(statuses: &[PodStatus]) {
    if statuses.is_empty() {
        println!("  {}", "(no pods)".bright_black());
        return;
    }
    println!("  {:<32} {:<8} {}", "NAME".bold(), "READY".bold(), "STATUS".bold());
    for status in statuses {
        println!(
            "  {:<32} {:<8} {}",
            status.name,
            status.ready_display(),
            colored_status(status)
        );
    }
}

/// Print a before/after comparison of two health snapshots, matched by pod name.
pub fn print_comparison_table(before: &[PodStatus], after: &[PodStatus]) {
    let mut names: Vec<&str> = before
        .iter()
        .chain(after.iter())
        .map(|s| s.name.as_str())
        .collect();
    names.sort_unstable();
    names.dedup();

    if names.is_empty() {
        println!("  {}", "(no pods observed)".bright_black());
        return;
    }

    println!(
        "  {:<32} {:<8} {:<20} {:<8} {}",
        "NAME".bold(),
        "BEFORE".bold(),
        "".bold(),
        "AFTER".bold(),
        "".bold()
    );
    for name in names {
        let pre = before.iter().find(|s| s.name == name);
        let post = after.iter().find(|s| s.name == name);
        println!("{}", comparison_row(name, pre, post));
    }
}

fn comparison_row(name: &str, pre: Option<&PodStatus>, post: Option<&PodStatus>) -> String {
    let missing = || "-".bright_black();
    format!(
        "  {:<32} {:<8} {:<20} {:<8} {}",
        name,
        pre.map_or_else(|| "-".to_string(), PodStatus::ready_display),
        pre.map_or_else(missing, colored_status),
        post.map_or_else(|| "-".to_string(), PodStatus::ready_display),
        post.map_or_else(missing, colored_status),
    )
}

/// Print one pod-monitor iteration.
pub fn print_monitor_row(iteration: u32, counts: &PodCounts) {
    if iteration == 1 {
        println!(
            "  {:<10}{:<12}{:<10}{:<18}{:<10}{:<10}",
            "Iteration", "Total Pods", "Running", "CrashLoopBackOff", "Error", "Completed"
        );
    }
    println!(
        "  {:<10}{:<12}{:<10}{:<18}{:<10}{:<10}",
        iteration,
        counts.total,
        counts.running,
        counts.crash_loop,
        counts.error,
        counts.completed
    );
}
