//! Terminal progress and summary output.
//!
//! [`SubmissionProgress`] is a [`BatchObserver`]: the engine ticks it once
//! per finished batch. Colors come from `console`, the bar from `indicatif`.

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::engine::{BatchObserver, BatchResult, ProcessingSummary};

/// Record-level progress bar for one run.
pub struct SubmissionProgress {
    pb: ProgressBar,
    red: Style,
    yellow: Style,
}

impl SubmissionProgress {
    pub fn start(total_records: u64) -> Self {
        let pb = ProgressBar::new(total_records);
        // Falls back to the default bar if the template fails to parse.
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.cyan} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} records {msg}")
        {
            pb.set_style(style.progress_chars("=>-"));
        }
        pb.enable_steady_tick(std::time::Duration::from_millis(100));

        Self {
            pb,
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
        }
    }

    pub fn finish(&self) {
        self.pb.finish_and_clear();
    }
}

impl BatchObserver for SubmissionProgress {
    fn on_batch_complete(&self, result: &BatchResult) {
        self.pb.inc(result.size as u64);
        if result.is_cancelled() {
            return;
        }
        if let Some(error) = &result.error {
            self.pb.println(format!(
                "  {} batch {} ({} records): {error}",
                self.red.apply_to("✗"),
                result.sequence,
                result.size
            ));
        } else if result.counts.rejected > 0 || result.counts.dropped > 0 {
            self.pb.println(format!(
                "  {} batch {}: {} rejected, {} dropped",
                self.yellow.apply_to("!"),
                result.sequence,
                result.counts.rejected,
                result.counts.dropped
            ));
        }
    }
}

/// One-line outcome followed by the counts, colored by overall success.
pub fn print_summary(summary: &ProcessingSummary) {
    let green = Style::new().green().bold();
    let red = Style::new().red().bold();
    let dim = Style::new().dim();

    let headline = if summary.success {
        green.apply_to(format!("✓ Submitted {} records", summary.records_submitted))
    } else {
        red.apply_to(format!(
            "✗ {} of {} batches failed",
            summary.batches_failed, summary.batches_total
        ))
    };
    eprintln!("{headline}");
    eprintln!(
        "  accepted {}  rejected {}  dropped {}  failed {}",
        summary.records_accepted,
        summary.records_rejected,
        summary.records_dropped,
        summary.records_failed
    );
    if summary.quota_exceeded {
        eprintln!("  {}", red.apply_to("Submission quota exceeded"));
    }
    eprintln!(
        "{}",
        dim.apply_to(format!(
            "  {} ms, {:.1} records/s, {} retries",
            summary.metrics.duration_ms, summary.metrics.records_per_second, summary.metrics.retries
        ))
    );
}
