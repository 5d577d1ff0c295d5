//! `tracing`-backed progress reporting.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use cslb_core::{Phase, ProgressReporter, RunSummary};
use tracing::{error, info};

const DEFAULT_LOG_EVERY: usize = 10_000;

#[derive(Debug, Default)]
struct PhaseClock {
    current: Option<(Phase, Instant)>,
    completed: Vec<(Phase, Duration)>,
}

#[derive(Debug)]
pub struct TracingReporter {
    collector: String,
    started: Instant,
    log_every: usize,
    processed: AtomicUsize,
    clock: Mutex<PhaseClock>,
}

impl TracingReporter {
    pub fn new(collector: impl Into<String>) -> Self {
        Self {
            collector: collector.into(),
            started: Instant::now(),
            log_every: DEFAULT_LOG_EVERY,
            processed: AtomicUsize::new(0),
            clock: Mutex::new(PhaseClock::default()),
        }
    }

    pub fn with_log_every(mut self, rows: usize) -> Self {
        self.log_every = rows.max(1);
        self
    }

    pub fn processed(&self) -> usize {
        self.processed.load(Ordering::Relaxed)
    }

    /// Finished phases and how long each took, in order.
    pub fn phase_durations(&self) -> Vec<(Phase, Duration)> {
        let clock = self.clock.lock().unwrap_or_else(PoisonError::into_inner);
        clock.completed.clone()
    }
}

fn error_chain(error: &(dyn std::error::Error + 'static)) -> String {
    let mut out = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        // Variants that format their source inline already carry its text.
        let text = cause.to_string();
        if !out.contains(&text) {
            out.push_str(": ");
            out.push_str(&text);
        }
        source = cause.source();
    }
    out
}

impl ProgressReporter for TracingReporter {
    fn phase(&self, phase: Phase, detail: &str) {
        let mut clock = self.clock.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((previous, since)) = clock.current {
            if previous == phase {
                info!(collector = %self.collector, %phase, detail, "phase update");
                return;
            }
            let elapsed = since.elapsed();
            clock.completed.push((previous, elapsed));
            info!(
                collector = %self.collector,
                phase = %previous,
                elapsed_ms = elapsed.as_millis() as u64,
                "phase finished"
            );
        }
        clock.current = Some((phase, Instant::now()));
        info!(collector = %self.collector, %phase, detail, "phase started");
    }

    fn record_processed(&self, n: usize) {
        let before = self.processed.fetch_add(n, Ordering::Relaxed);
        let after = before + n;
        if after / self.log_every > before / self.log_every {
            info!(collector = %self.collector, processed = after, "records processed");
        }
    }

    fn error(&self, error: &(dyn std::error::Error + 'static), context: &str) {
        error!(
            collector = %self.collector,
            context,
            error = %error_chain(error),
            "collector error"
        );
    }

    fn summary(&self, summary: &RunSummary) {
        info!(
            collector = %self.collector,
            run_id = %summary.run_id,
            status = summary.status.as_str(),
            rows_seen = summary.rows_seen,
            valid_records = summary.valid_records,
            superseded = summary.superseded,
            skipped_no_affiliate = summary.skipped.no_affiliate,
            skipped_no_agency = summary.skipped.no_agency,
            skipped_invalid_license = summary.skipped.invalid_license,
            skipped_malformed_row = summary.skipped.malformed_row,
            unresolved_postal_codes = summary.unresolved_postal_codes.len(),
            staged = summary.staged,
            failed_records = summary.failed_records,
            failed_batches = summary.failed_batches.len(),
            merged = summary.merged,
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            "run summary"
        );
        for (phase, elapsed) in self.phase_durations() {
            info!(
                collector = %self.collector,
                %phase,
                elapsed_ms = elapsed.as_millis() as u64,
                "phase breakdown"
            );
        }
    }
}
