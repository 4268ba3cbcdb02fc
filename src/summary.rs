//! Aggregation of records produced while replaying a log.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use tracing::info;

use crate::model::{ConfidenceState, TripId};
use crate::output::ConfidenceRecord;

/// Lead-time statistics for one confidence state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateSummary {
    pub records: usize,
    pub mean_minutes: f64,
    pub stddev_minutes: f64,
}

/// What a replay produced, tick by tick, condensed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplaySummary {
    pub first_tick: Option<DateTime<Utc>>,
    pub last_tick: Option<DateTime<Utc>>,
    pub ticks: usize,
    pub records: usize,
    pub trips: usize,
    /// Times a trip's state differed from its state at the previous tick.
    pub state_changes: usize,
    pub by_state: BTreeMap<ConfidenceState, StateSummary>,
    pub by_reason: BTreeMap<String, usize>,
}

/// Accumulates ticks into a [`ReplaySummary`].
#[derive(Debug, Default)]
pub struct SummaryBuilder {
    first_tick: Option<DateTime<Utc>>,
    last_tick: Option<DateTime<Utc>>,
    ticks: usize,
    minutes: BTreeMap<ConfidenceState, Vec<f64>>,
    by_reason: BTreeMap<String, usize>,
    last_state: HashMap<TripId, ConfidenceState>,
    state_changes: usize,
}

impl SummaryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_tick(&mut self, evaluated_at: DateTime<Utc>, records: &[ConfidenceRecord]) {
        self.first_tick.get_or_insert(evaluated_at);
        self.last_tick = Some(evaluated_at);
        self.ticks += 1;

        for record in records {
            self.minutes
                .entry(record.confidence_state)
                .or_default()
                .push(record.minutes_until_departure);
            *self.by_reason.entry(record.reason.clone()).or_default() += 1;

            let previous = self
                .last_state
                .insert(record.trip_id.clone(), record.confidence_state);
            if previous.is_some_and(|p| p != record.confidence_state) {
                self.state_changes += 1;
            }
        }
    }

    pub fn finish(self) -> ReplaySummary {
        let by_state: BTreeMap<_, _> = self
            .minutes
            .into_iter()
            .map(|(state, series)| {
                let avg = mean(&series);
                let summary = StateSummary {
                    records: series.len(),
                    mean_minutes: avg,
                    stddev_minutes: stddev(&series, avg),
                };
                (state, summary)
            })
            .collect();

        ReplaySummary {
            first_tick: self.first_tick,
            last_tick: self.last_tick,
            ticks: self.ticks,
            records: by_state.values().map(|s| s.records).sum(),
            trips: self.last_state.len(),
            state_changes: self.state_changes,
            by_state,
            by_reason: self.by_reason,
        }
    }
}

impl ReplaySummary {
    pub fn log(&self) {
        info!(
            ticks = self.ticks,
            records = self.records,
            trips = self.trips,
            state_changes = self.state_changes,
            "Replay summary"
        );
        for (state, s) in &self.by_state {
            info!(
                state = %state,
                records = s.records,
                mean_minutes = s.mean_minutes,
                "State breakdown"
            );
        }
        for (reason, count) in &self.by_reason {
            info!(reason = %reason, count, "Reason breakdown");
        }
    }
}

/// Computes the arithmetic mean of a slice of values. Returns 0.0 for empty input.
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population standard deviation given a pre-computed mean. Returns 0.0 for
/// empty input.
pub fn stddev(values: &[f64], mean: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}
