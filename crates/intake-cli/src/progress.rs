use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use intake_core::{QueueEvent, QueuePhase};
use std::time::Duration;

const TICK_CHARS: &str = "⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏";

/// Renders queue snapshots with indicatif.
///
/// - Scanning: spinner
/// - Hashing: progress bar over duplicate candidates
/// - Uploading: progress bar over ready files
pub struct CliReporter {
    bar: Option<ProgressBar>,
    phase: QueuePhase,
    warned_overdue: bool,
}

impl CliReporter {
    pub fn new() -> Self {
        Self::starting_at(QueuePhase::Idle)
    }

    /// Reporter for a queue already in `phase`, so it is not announced again.
    pub fn starting_at(phase: QueuePhase) -> Self {
        Self {
            bar: None,
            phase,
            warned_overdue: false,
        }
    }

    pub fn handle(&mut self, event: &QueueEvent) {
        if event.phase != self.phase {
            self.on_phase_change(event);
            self.phase = event.phase;
        }

        if let (Some(bar), Some(progress)) = (self.bar.as_ref(), event.progress) {
            if bar.length() != Some(progress.total as u64) {
                bar.set_length(progress.total as u64);
            }
            bar.set_position(progress.processed as u64);
        }

        if event.overdue && !self.warned_overdue {
            self.warned_overdue = true;
            let message = format!(
                "  {} {:.0}s past the estimate. Files synced from cloud storage \
                 (OneDrive, Dropbox, iCloud) may be downloading before they can be read.",
                style("!").yellow().bold(),
                event.overrun_secs
            );
            match self.bar.as_ref() {
                Some(bar) => bar.println(message),
                None => eprintln!("{}", message),
            }
        }
        if event.worker_restarts > 0 {
            if let Some(bar) = self.bar.as_ref() {
                bar.set_message(format!("({} worker restarts)", event.worker_restarts));
            }
        }
    }

    pub fn finish(&mut self) {
        if let Some(bar) = self.bar.take() {
            bar.finish_and_clear();
        }
    }

    fn on_phase_change(&mut self, event: &QueueEvent) {
        match event.phase {
            QueuePhase::Scanning => self.set_bar(spinner("Scanning files...")),
            QueuePhase::Hashing => {
                self.finish();
                eprintln!(
                    "  {} Scan complete: {} files",
                    style("✓").green(),
                    event.records.len()
                );
                if let Some(estimate) = event.estimate {
                    eprintln!(
                        "  {} Estimated {:.1}s",
                        style("·").dim(),
                        estimate.total_duration().as_secs_f64()
                    );
                }
                self.set_bar(bar("Hashing", "files"));
            }
            QueuePhase::Uploading => self.set_bar(bar("Uploading", "files")),
            QueuePhase::Ready => {
                self.finish();
                eprintln!("  {} Queue ready", style("✓").green());
            }
            QueuePhase::Completed => {
                self.finish();
                eprintln!("  {} Upload complete", style("✓").green());
            }
            QueuePhase::Cancelled => {
                self.finish();
                eprintln!("  {} Cancelled", style("✗").red());
            }
            QueuePhase::Error => {
                self.finish();
                eprintln!("  {} Queue failed", style("✗").red());
            }
            QueuePhase::Idle => self.finish(),
        }
    }

    fn set_bar(&mut self, pb: ProgressBar) {
        if let Some(old) = self.bar.replace(pb) {
            old.finish_and_clear();
        }
    }
}

impl Drop for CliReporter {
    fn drop(&mut self) {
        self.finish();
    }
}

fn spinner(message: &'static str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    let style = ProgressStyle::with_template("{spinner:.cyan} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
        .tick_chars(TICK_CHARS);
    pb.set_style(style);
    pb.set_message(message);
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

fn bar(label: &str, unit: &str) -> ProgressBar {
    let pb = ProgressBar::new(0);
    let template = format!(
        "  {{spinner:.cyan}} {} [{{bar:30.cyan/dim}}] {{pos}}/{{len}} {} ({{eta}} remaining) {{msg}}",
        label, unit
    );
    let style = ProgressStyle::with_template(&template)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("━╸─")
        .tick_chars(TICK_CHARS);
    pb.set_style(style);
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}
