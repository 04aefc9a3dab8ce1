//! Terminal progress bars for `plancrawl run`.

use std::sync::Mutex;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use plancrawl_core::{PhaseReport, ProgressReporter, ProgressUpdate};
use plancrawl_shared::Phase;

const BAR_TEMPLATE: &str = "{spinner:.cyan} {prefix:<12} [{bar:30.cyan/blue}] {pos}/{len} {msg}";

/// One indicatif bar per phase, replaced when the next phase starts.
pub(crate) struct CliProgress {
    bar: Mutex<Option<ProgressBar>>,
}

impl CliProgress {
    pub(crate) fn new() -> Self {
        Self {
            bar: Mutex::new(None),
        }
    }

    fn with_bar(&self, f: impl FnOnce(&ProgressBar)) {
        if let Ok(guard) = self.bar.lock() {
            if let Some(bar) = guard.as_ref() {
                f(bar);
            }
        }
    }
}

impl ProgressReporter for CliProgress {
    fn phase_started(&self, phase: Phase, total: usize) {
        let style = ProgressStyle::with_template(BAR_TEMPLATE)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> ")
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
        let bar = ProgressBar::new(total as u64)
            .with_style(style)
            .with_prefix(phase.label());
        bar.set_message("eta calculating");
        bar.enable_steady_tick(Duration::from_millis(80));

        if let Ok(mut guard) = self.bar.lock() {
            if let Some(previous) = guard.replace(bar) {
                previous.finish_and_clear();
            }
        }
    }

    fn task_finished(&self, update: &ProgressUpdate) {
        self.with_bar(|bar| {
            bar.set_position(update.done as u64);
            let failed = if update.failed > 0 {
                format!(", {} failed", update.failed)
            } else {
                String::new()
            };
            bar.set_message(format!("eta {}{failed}", update.eta));
        });
    }

    fn phase_finished(&self, report: &PhaseReport) {
        if let Some(bar) = self.bar.lock().ok().and_then(|mut guard| guard.take()) {
            bar.finish_and_clear();
        }
        if report.skipped {
            eprintln!("  {}: skipped", report.phase.label());
            return;
        }
        let suffix = if report.cancelled { " (interrupted)" } else { "" };
        eprintln!(
            "  {}: {} ok, {} failed of {} in {:.1}s{suffix}",
            report.phase.label(),
            report.succeeded,
            report.failed,
            report.scheduled,
            report.elapsed.as_secs_f64(),
        );
    }
}
