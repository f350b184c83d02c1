//! Terminal rendering of task summaries and persisted results.
//!
//! Rendering is pure: functions return a [`String`] and colors come from the
//! `colored` crate, which honors the global override set for `--no-color`
//! and piped output.

use colored::Colorize;

use docloader::{TaskResult, TaskSummary};

const PAD_WIDTH: usize = 36;

/// Renders the outcome of one task run.
pub fn render_summary(summary: &TaskSummary) -> String {
    let mut lines = Vec::new();
    let total = summary.success + summary.failure;

    lines.push(format!(
        "\n  {} {}",
        summary.operation.to_string().bold(),
        summary.result_seed.dimmed()
    ));
    lines.push(format_row("success", &summary.success.to_string().green().to_string()));
    let failure = if summary.failure > 0 {
        summary.failure.to_string().red().to_string()
    } else {
        summary.failure.to_string()
    };
    lines.push(format_row("failure", &failure));
    lines.push(format_row("total", &total.to_string()));
    if summary.retried > 0 {
        lines.push(format_row("recovered_by_retry", &summary.retried.to_string().yellow().to_string()));
    }
    if summary.cancelled {
        lines.push(format_row("status", &"cancelled".yellow().to_string()));
    }
    push_categories(&mut lines, summary.failures_by_category.iter().map(|(c, n)| (c.as_str(), *n)));
    lines.join("\n")
}

/// Renders a persisted result, listing up to `limit` failed offsets per
/// category.
pub fn render_result(result: &TaskResult, limit: usize) -> String {
    let summary = TaskSummary::from_result(result, false);
    let mut lines = vec![render_summary(&summary)];
    lines.push(format_row("range", &format!("[{}, {})", result.start, result.end)));
    lines.push(format_row("updated_at", &result.updated_at.to_rfc3339()));

    for (category, failures) in &result.failures {
        lines.push(String::new());
        lines.push(format!("  {}:", category.red()));
        for failed in failures.values().take(limit) {
            lines.push(format!("    {:>10}  {}  {}", failed.offset, failed.key, failed.error.dimmed()));
        }
        if failures.len() > limit {
            lines.push(format!("    ... {} more", failures.len() - limit));
        }
    }
    for (category, ranges) in &result.bulk_errors {
        lines.push(String::new());
        lines.push(format!("  {} (whole batches):", category.red()));
        for range in ranges.iter().take(limit) {
            lines.push(format!("    [{}, {})  {}", range.start, range.end, range.error.dimmed()));
        }
    }
    lines.join("\n")
}

fn push_categories<'a>(lines: &mut Vec<String>, categories: impl Iterator<Item = (&'a str, u64)>) {
    let mut categories: Vec<_> = categories.collect();
    if categories.is_empty() {
        return;
    }
    categories.sort_by(|a, b| b.1.cmp(&a.1));
    lines.push(String::new());
    lines.push("  failures:".to_string());
    for (category, count) in categories {
        lines.push(format_row(&format!("  {category}"), &count.to_string().red().to_string()));
    }
}

fn format_row(name: &str, value: &str) -> String {
    format!("  {name:.<PAD_WIDTH$}: {value}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use docloader::OperationKind;
    use std::collections::BTreeMap;

    fn summary() -> TaskSummary {
        TaskSummary {
            result_seed: "abc".to_string(),
            operation: OperationKind::Create,
            success: 98,
            failure: 2,
            failures_by_category: BTreeMap::from([("timeout".to_string(), 2)]),
            retried: 1,
            cancelled: false,
        }
    }

    #[test]
    fn test_render_summary_rows() {
        colored::control::set_override(false);
        let out = render_summary(&summary());
        assert!(out.contains("create abc"));
        assert!(out.contains(&format_row("success", "98")));
        assert!(out.contains(": 100"));
        assert!(out.contains("recovered_by_retry"));
        assert!(out.contains("    timeout"));
        assert!(!out.contains("cancelled"));
    }

    #[test]
    fn test_format_row_pads_with_dots() {
        assert_eq!(format_row("ab", "1"), format!("  ab{}: 1", ".".repeat(PAD_WIDTH - 2)));
    }
}
