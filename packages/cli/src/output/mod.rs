//! Terminal output helpers.

use console::style;
use dockerpilot_core::{ProgressRecord, Stage};
use indicatif::{ProgressBar, ProgressStyle};

pub fn success(message: &str) {
    println!("{} {message}", style("✓").green());
}

pub fn failure(message: &str) {
    eprintln!("{} {message}", style("✗").red());
}

pub fn note(message: &str) {
    println!("  {}", style(message).dim());
}

/// Spinner used while waiting on an async engine operation.
pub fn spinner(message: &str) -> ProgressBar {
    let bar = ProgressBar::new_spinner();
    bar.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.cyan} {msg}")
            .expect("valid template"),
    );
    bar.set_message(message.to_string());
    bar.enable_steady_tick(std::time::Duration::from_millis(100));
    bar
}

/// One-line rendering of a progress record.
pub fn render_record(key: &str, record: &ProgressRecord) -> String {
    let stage = match record.stage {
        Stage::Completed => style(record.stage.as_str()).green(),
        Stage::Failed | Stage::Error => style(record.stage.as_str()).red(),
        Stage::Cancelled => style(record.stage.as_str()).yellow(),
        _ => style(record.stage.as_str()).cyan(),
    };
    format!(
        "{} [{stage}] {:>3}% {}",
        style(key).bold(),
        record.progress,
        record.message
    )
}
