use indicatif::{ProgressBar, ProgressStyle};
use std::sync::{Arc, Mutex};

/// Share of the bar reserved for setup; resource downloads start here.
pub const DOWNLOAD_START: f64 = 10.0;
/// Share of the bar covered by resource downloads.
pub const DOWNLOAD_SPAN: f64 = 80.0;

/// Receives `(percent, stage message)` updates from a running job.
#[cfg_attr(test, mockall::automock)]
pub trait ProgressReporter: Send + Sync {
    fn on_progress(&self, percent: f64, stage: &str);
}

impl<F> ProgressReporter for F
where
    F: Fn(f64, &str) + Send + Sync,
{
    fn on_progress(&self, percent: f64, stage: &str) {
        self(percent, stage)
    }
}

pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn on_progress(&self, _percent: f64, _stage: &str) {}
}

/// Forwards updates to a reporter, never letting the percentage go backwards.
#[derive(Clone)]
pub struct ProgressTracker {
    reporter: Arc<dyn ProgressReporter>,
    last: Arc<Mutex<f64>>,
}

impl ProgressTracker {
    pub fn new(reporter: Arc<dyn ProgressReporter>) -> Self {
        Self {
            reporter,
            last: Arc::new(Mutex::new(0.0)),
        }
    }

    pub fn report(&self, percent: f64, stage: &str) {
        let percent = {
            let mut last = match self.last.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let next = percent.clamp(0.0, 100.0).max(*last);
            *last = next;
            next
        };
        self.reporter.on_progress(percent, stage);
    }

    /// Percentage after `processed` of `total` resources have finished.
    pub fn download_percent(processed: usize, total: usize) -> f64 {
        let total = total.max(1) as f64;
        DOWNLOAD_START + (processed as f64 / total).min(1.0) * DOWNLOAD_SPAN
    }
}

/// Terminal progress bar for the CLI.
pub struct TerminalProgress {
    bar: ProgressBar,
}

impl TerminalProgress {
    pub fn new() -> Self {
        let bar = ProgressBar::new(100);
        if let Ok(style) =
            ProgressStyle::default_bar().template("{spinner} [{bar:40.cyan/blue}] {pos:>3}% {msg}")
        {
            bar.set_style(style.progress_chars("=> "));
        }
        Self { bar }
    }

    pub fn finish(&self) {
        self.bar.finish();
    }
}

impl Default for TerminalProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressReporter for TerminalProgress {
    fn on_progress(&self, percent: f64, stage: &str) {
        self.bar.set_position(percent.round() as u64);
        self.bar.set_message(stage.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::{always, eq};
    use mockall::Sequence;

    #[test]
    fn test_tracker_never_goes_backwards() {
        let mut mock = MockProgressReporter::new();
        let mut seq = Sequence::new();
        for expected in [0.0, 50.0, 50.0, 100.0] {
            mock.expect_on_progress()
                .with(eq(expected), always())
                .times(1)
                .in_sequence(&mut seq)
                .return_const(());
        }

        let tracker = ProgressTracker::new(Arc::new(mock));
        tracker.report(0.0, "start");
        tracker.report(50.0, "half");
        tracker.report(30.0, "late update");
        tracker.report(140.0, "done");
    }

    #[test]
    fn test_download_percent_interpolates_between_10_and_90() {
        assert_eq!(ProgressTracker::download_percent(0, 4), 10.0);
        assert_eq!(ProgressTracker::download_percent(2, 4), 50.0);
        assert_eq!(ProgressTracker::download_percent(4, 4), 90.0);
        assert_eq!(ProgressTracker::download_percent(0, 0), 10.0);
    }

    #[test]
    fn test_closures_are_reporters() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let reporter = move |percent: f64, stage: &str| {
            sink.lock().unwrap().push((percent, stage.to_string()));
        };

        ProgressTracker::new(Arc::new(reporter)).report(42.0, "working");
        assert_eq!(*seen.lock().unwrap(), vec![(42.0, "working".to_string())]);
    }
}
