// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! In-process counters per operation type.
//!
//! A [`MetricsSpan`] is opened once the gate has admitted an invocation and
//! closed with its outcome. Spans that are dropped without being finished
//! count as failures.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;

/// Aggregated counters for one operation type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OperationStats {
    pub invocations: u64,
    pub successes: u64,
    pub failures: u64,
    pub retries: u64,
    pub writes: u64,
    pub total_duration: Duration,
    pub max_duration: Duration,
}

impl OperationStats {
    /// Mean duration of finished invocations.
    pub fn mean_duration(&self) -> Duration {
        let finished = self.successes + self.failures;
        if finished == 0 {
            return Duration::ZERO;
        }
        let nanos = self.total_duration.as_nanos() / u128::from(finished);
        Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanOutcome {
    Success,
    Failure,
}

#[derive(Debug, Default)]
pub struct MetricsRecorder {
    stats: Mutex<HashMap<String, OperationStats>>,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    // Counters stay usable after a panic elsewhere; a torn update is harmless.
    fn stats(&self) -> MutexGuard<'_, HashMap<String, OperationStats>> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Count an invocation and start timing it.
    pub fn start(&self, operation_type: &str) -> MetricsSpan<'_> {
        self.stats()
            .entry(operation_type.to_string())
            .or_default()
            .invocations += 1;
        MetricsSpan {
            recorder: self,
            operation_type: operation_type.to_string(),
            started: Instant::now(),
            retries: 0,
            writes: 0,
            finished: false,
        }
    }

    pub fn snapshot(&self, operation_type: &str) -> Option<OperationStats> {
        self.stats().get(operation_type).cloned()
    }

    /// Counters for every operation type seen so far.
    pub fn snapshot_all(&self) -> HashMap<String, OperationStats> {
        self.stats().clone()
    }

    fn close(&self, span: &MetricsSpan<'_>, outcome: SpanOutcome, elapsed: Duration) {
        let mut stats = self.stats();
        let entry = stats.entry(span.operation_type.clone()).or_default();
        match outcome {
            SpanOutcome::Success => entry.successes += 1,
            SpanOutcome::Failure => entry.failures += 1,
        }
        entry.retries += u64::from(span.retries);
        entry.writes += span.writes as u64;
        entry.total_duration = entry.total_duration.saturating_add(elapsed);
        entry.max_duration = entry.max_duration.max(elapsed);
    }
}

/// Timing and counters of one invocation.
#[derive(Debug)]
pub struct MetricsSpan<'a> {
    recorder: &'a MetricsRecorder,
    operation_type: String,
    started: Instant,
    retries: u32,
    writes: usize,
    finished: bool,
}

impl MetricsSpan<'_> {
    pub fn record_retry(&mut self) {
        self.retries += 1;
    }

    pub fn add_writes(&mut self, writes: usize) {
        self.writes += writes;
    }

    pub fn writes(&self) -> usize {
        self.writes
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Close the span; returns the measured duration.
    pub fn finish(mut self, outcome: SpanOutcome) -> Duration {
        let elapsed = self.started.elapsed();
        self.recorder.close(&self, outcome, elapsed);
        self.finished = true;
        elapsed
    }
}

impl Drop for MetricsSpan<'_> {
    fn drop(&mut self) {
        if !self.finished {
            let elapsed = self.started.elapsed();
            self.recorder.close(self, SpanOutcome::Failure, elapsed);
        }
    }
}
