pub mod config;
pub mod env;
pub mod history;
pub mod hosts;
pub mod migrate;
pub mod progress;
pub mod promote;

use dockerpilot_core::{DockerPilot, ProgressRecord, Stage};
use std::time::Duration;

/// Poll a registry until the key reaches a terminal stage, rendering each
/// update through the supplied spinner.
pub async fn wait_for_terminal(
    pilot: &DockerPilot,
    key: &str,
    migration: bool,
    bar: &indicatif::ProgressBar,
) -> Option<ProgressRecord> {
    let mut last: Option<ProgressRecord> = None;
    loop {
        let records = if migration {
            pilot.migration_progress(Some(key))
        } else {
            pilot.get_progress(Some(key))
        };
        match records.into_iter().next() {
            Some((_, record)) => {
                bar.set_message(crate::output::render_record(key, &record));
                let terminal = record.stage.is_terminal();
                last = Some(record);
                if terminal {
                    return last;
                }
            }
            // Evicted after the terminal linger; report what we last saw.
            None => return last,
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

/// Exit code semantics for a finished operation.
pub fn terminal_outcome(record: &ProgressRecord) -> anyhow::Result<()> {
    match record.stage {
        Stage::Completed => Ok(()),
        Stage::Cancelled => anyhow::bail!("operation cancelled: {}", record.message),
        _ => anyhow::bail!(
            "operation {}: {}",
            record.stage,
            record.message
        ),
    }
}
