//! Run progress reporting.

use crate::case::{CaseOutcome, CaseReport};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::fmt;
use std::io::IsTerminal;
use std::time::Duration;

/// Which replication and iteration a progress event belongs to. Both are 0-based here and
/// printed 1-based.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RunLabel {
    pub rep: usize,
    pub reps: usize,
    pub iteration: usize,
    pub iterations: usize,
}

impl fmt::Display for RunLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "rep {} of {}, iter {} of {}",
            self.rep + 1,
            self.reps.max(1),
            self.iteration + 1,
            self.iterations
        )
    }
}

/// Outcome counts for one pass over all cases.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IterationStats {
    pub optimal: usize,
    pub fallback: usize,
    pub failed: usize,
    pub elapsed: Duration,
}

impl IterationStats {
    pub fn record(&mut self, outcome: &CaseOutcome) {
        match outcome {
            CaseOutcome::Optimal { .. } => self.optimal += 1,
            CaseOutcome::DegradedFallback { .. } => self.fallback += 1,
            CaseOutcome::Failed(_) => self.failed += 1,
        }
    }
}

/// Hooks called by the engine. Every method defaults to doing nothing.
///
/// `case_finished` is called from the engine thread as reports arrive, in completion order.
pub trait RunObserver: Sync {
    fn iteration_started(&self, _: &RunLabel, _: usize) {}

    fn case_finished(&self, _: &CaseReport) {}

    fn iteration_finished(&self, _: &RunLabel, _: &IterationStats) {}

    fn run_finished(&self) {}
}

pub struct NoopObserver;

impl RunObserver for NoopObserver {}

/// Terminal progress bar; hidden when stderr is not a terminal.
pub struct ProgressBarObserver {
    pb: ProgressBar,
}

impl ProgressBarObserver {
    pub fn new() -> Self {
        let draw_target = if std::io::stderr().is_terminal() {
            ProgressDrawTarget::stderr_with_hz(20)
        } else {
            ProgressDrawTarget::hidden()
        };
        let pb = ProgressBar::with_draw_target(Some(0), draw_target);
        match ProgressStyle::with_template(
            "> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} cases ({eta}) {msg}",
        ) {
            Ok(style) => pb.set_style(style.progress_chars("█▉▊▋▌▍▎▏  ")),
            Err(e) => log::debug!("Falling back to the default progress style: {e}"),
        }
        Self { pb }
    }
}

impl Default for ProgressBarObserver {
    fn default() -> Self {
        Self::new()
    }
}

impl RunObserver for ProgressBarObserver {
    fn iteration_started(&self, label: &RunLabel, n_cases: usize) {
        self.pb.set_length(n_cases as u64);
        self.pb.set_position(0);
        self.pb.set_message(label.to_string());
    }

    fn case_finished(&self, _: &CaseReport) {
        self.pb.inc(1);
    }

    fn iteration_finished(&self, label: &RunLabel, stats: &IterationStats) {
        self.pb.set_message(format!(
            "{label}: {} optimal, {} fallback, {} failed",
            stats.optimal, stats.fallback, stats.failed
        ));
    }

    fn run_finished(&self) {
        self.pb.finish();
    }
}
