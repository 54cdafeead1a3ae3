//! Console output of a run: the settings header, one verdict line per
//! check and the closing table. Everything is rendered to a `String` first.

use std::fmt::Write as _;

use crate::runner::{CheckOutcome, CheckStatus, RunSummary};

const RULE_WIDTH: usize = 84;
const KEY_WIDTH: usize = 12;
const CHECK_WIDTH: usize = 5;
const ALGORITHM_WIDTH: usize = 36;
const DETAIL_INDENT: &str = "        ";

pub fn run_header(title: &str, settings: &[(&str, String)]) {
    println!("{}", render_header(title, settings));
}

/// Prints the verdict of one check; with `verbose` every failure
/// description follows, indented under it.
pub fn check_finished(outcome: &CheckOutcome, verbose: bool) {
    let line = verdict_line(outcome);
    match outcome.status {
        CheckStatus::Passed => println!("{line}"),
        CheckStatus::Failed | CheckStatus::Error => eprintln!("{line}"),
    }
    if verbose {
        for error in &outcome.errors {
            for detail in error.trim_end().lines() {
                println!("{DETAIL_INDENT}{detail}");
            }
        }
    }
}

pub fn run_finished(summary: &RunSummary) {
    println!("{}", render_summary(summary));
}

pub fn note(tag: &str, message: impl AsRef<str>) {
    println!("{} {}", prefix("INFO", tag), message.as_ref());
}

fn render_header(title: &str, settings: &[(&str, String)]) -> String {
    let rule = "=".repeat(RULE_WIDTH);
    let mut out = format!("{rule}\n{title:^width$}\n{rule}\n", width = RULE_WIDTH);
    for (key, value) in settings {
        let _ = writeln!(out, "{}", setting_line(key, value));
    }
    out.push_str(&rule);
    out
}

fn setting_line(key: &str, value: &str) -> String {
    format!("  {:<width$} {value}", format!("{key}:"), width = KEY_WIDTH)
}

fn status_tag(status: CheckStatus) -> &'static str {
    match status {
        CheckStatus::Passed => "PASS",
        CheckStatus::Failed => "FAIL",
        CheckStatus::Error => "ERR ",
    }
}

fn verdict_line(outcome: &CheckOutcome) -> String {
    let detail = match outcome.status {
        CheckStatus::Passed => format!("{} items ok", outcome.tested),
        CheckStatus::Failed => {
            let first = outcome
                .errors
                .first()
                .and_then(|error| error.lines().find(|line| !line.trim().is_empty()))
                .unwrap_or("no details");
            format!("{} error(s), first: {first}", outcome.errors.len())
        }
        CheckStatus::Error => outcome.errors.join("; "),
    };
    format!(
        "{} {} on {}: {detail}",
        prefix(status_tag(outcome.status), outcome.check.as_str()),
        outcome.algorithm,
        outcome.device
    )
}

fn render_summary(summary: &RunSummary) -> String {
    let rule = "-".repeat(RULE_WIDTH);
    let mut out = format!("{rule}\n");
    let _ = writeln!(
        out,
        "{:<check$} {:<algorithm$} {:<6} {:>8} {:>6}  device",
        "check",
        "algorithm",
        "status",
        "tested",
        "errors",
        check = CHECK_WIDTH,
        algorithm = ALGORITHM_WIDTH
    );
    for outcome in &summary.outcomes {
        let _ = writeln!(
            out,
            "{:<check$} {:<algorithm$} {:<6} {:>8} {:>6}  {}",
            outcome.check.as_str(),
            outcome.algorithm.to_string(),
            status_tag(outcome.status).trim_end(),
            outcome.tested,
            outcome.errors.len(),
            outcome.device,
            check = CHECK_WIDTH,
            algorithm = ALGORITHM_WIDTH
        );
    }
    let _ = write!(
        out,
        "{rule}\n{} passed, {} failed, {} could not run",
        summary.count(CheckStatus::Passed),
        summary.count(CheckStatus::Failed),
        summary.count(CheckStatus::Error)
    );
    if summary.interrupted {
        out.push_str(" (interrupted)");
    }
    out
}

fn prefix(level: &str, tag: &str) -> String {
    format!("[{level}][{tag:<width$}]", width = CHECK_WIDTH)
}
