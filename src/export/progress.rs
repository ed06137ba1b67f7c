//! Console progress for exports run from the terminal
//!
//! Consumes the export's event channel and renders two bars: records
//! written to the bulk upload and binaries settled. Totals come from the
//! `count` event; without it the bars degrade to spinners.

use std::time::Instant;

use indicatif::{HumanBytes, MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};

use super::event::{EventReceiver, TransferEvent};

/// What the tracker saw by the time the channel closed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackerSummary {
    pub records: u64,
    pub binaries: u64,
    pub failures: u64,
    pub terminal: Option<TransferEvent>,
}

/// Progress tracker driven by transfer events
pub struct ProgressTracker {
    multi: MultiProgress,
    records: ProgressBar,
    binaries: ProgressBar,
    start_time: Instant,
    summary: TrackerSummary,
}

impl ProgressTracker {
    /// Create a tracker; with `enable_bar` false nothing is drawn
    pub fn new(enable_bar: bool) -> Self {
        let multi = if enable_bar {
            MultiProgress::new()
        } else {
            MultiProgress::with_draw_target(ProgressDrawTarget::hidden())
        };

        let records = multi.add(ProgressBar::new_spinner());
        records.set_style(spinner_style("records"));
        let binaries = multi.add(ProgressBar::new_spinner());
        binaries.set_style(spinner_style("binaries"));

        Self {
            multi,
            records,
            binaries,
            start_time: Instant::now(),
            summary: TrackerSummary::default(),
        }
    }

    /// Apply one event
    pub fn handle(&mut self, event: &TransferEvent) {
        match event {
            TransferEvent::Count {
                total_records,
                total_binaries,
            } => {
                self.records.set_length(*total_records);
                self.records.set_style(bar_style("records"));
                self.binaries.set_length(*total_binaries);
                self.binaries.set_style(bar_style("binaries"));
            }
            TransferEvent::CountUnavailable => {
                self.records.set_message("(total unknown)");
            }
            TransferEvent::RecordProgress { processed } => {
                self.summary.records = *processed;
                self.records.set_position(*processed);

                let elapsed = self.start_time.elapsed().as_secs_f64();
                if elapsed > 0.0 {
                    let speed = *processed as f64 / elapsed;
                    self.records.set_message(format!("({:.0} docs/sec)", speed));
                }
            }
            TransferEvent::BinaryBytes { key, loaded, total } => {
                let message = match total {
                    Some(total) => format!("{key} {}/{}", HumanBytes(*loaded), HumanBytes(*total)),
                    None => format!("{key} {}", HumanBytes(*loaded)),
                };
                self.binaries.set_message(message);
            }
            TransferEvent::BinaryProgress { .. } => {
                self.summary.binaries += 1;
                self.binaries.inc(1);
            }
            TransferEvent::BinaryFailure { key, reason } => {
                self.summary.failures += 1;
                self.binaries.inc(1);
                let _ = self.multi.println(format!("skipped {key}: {reason}"));
            }
            TransferEvent::Complete { .. } | TransferEvent::FatalError { .. } => {
                self.summary.terminal = Some(event.clone());
                self.finish();
            }
        }
    }

    /// Drain the channel until the terminal event or until every sender is gone
    pub async fn consume(mut self, mut rx: EventReceiver) -> TrackerSummary {
        while let Some(event) = rx.recv().await {
            self.handle(&event);
            if event.is_terminal() {
                break;
            }
        }
        self.finish();
        self.summary
    }

    /// Finish and clear the progress bars
    pub fn finish(&self) {
        self.records.finish_and_clear();
        self.binaries.finish_and_clear();
    }
}

fn bar_style(label: &str) -> ProgressStyle {
    ProgressStyle::default_bar()
        .template(&format!(
            "{{spinner:.green}} {label:>8} [{{bar:40.cyan/blue}}] {{pos}}/{{len}} {{msg}}"
        ))
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-")
}

fn spinner_style(label: &str) -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template(&format!("{{spinner:.green}} {label:>8} {{pos}} {{msg}}"))
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}
