//! Evaluation ticks.
//!
//! A tick folds the polls visible at `now` into the caller's [`TickContext`],
//! then judges every candidate trip. All cross-tick state lives in the
//! context, so replaying the same prefix through a fresh context yields the
//! same records.

use chrono::{DateTime, Utc};
use std::borrow::Cow;
use std::collections::BTreeSet;
use tracing::{debug, info};

use crate::classifier::{ClassificationError, Classifier};
use crate::config::{ConfidenceConfig, ConfigError};
use crate::model::{PollEvent, TripId};
use crate::output::{ConfidenceRecord, rank_records};
use crate::schedule::Schedule;
use crate::signals::SignalExtractor;
use crate::timeline::{Diagnostic, TimelineStore, Trip};

/// State carried from one tick to the next.
#[derive(Debug, Clone, Default)]
pub struct TickContext {
    pub store: TimelineStore,
    pub ticks: u64,
    pub last_tick: Option<DateTime<Utc>>,
}

impl TickContext {
    pub fn new(schedule: Schedule) -> Self {
        Self {
            store: TimelineStore::new(schedule),
            ..Default::default()
        }
    }
}

/// Records judged at one instant plus what was left out.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub evaluated_at: DateTime<Utc>,
    pub records: Vec<ConfidenceRecord>,
    /// Trips with no departure reference or already departed.
    pub skipped: Vec<TripId>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TickReport {
    pub evaluation: Evaluation,
    pub ingested: usize,
    /// Events stamped after `now`, left for a later tick.
    pub deferred: usize,
    pub diagnostics: Vec<Diagnostic>,
}

#[derive(Debug, Clone)]
pub struct Engine {
    config: ConfidenceConfig,
    classifier: Classifier,
}

impl Engine {
    /// Builds an engine from a validated configuration.
    pub fn new(config: ConfidenceConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let classifier = Classifier::new(config.rules.clone(), config.thresholds.clone());
        Ok(Self { config, classifier })
    }

    pub fn config(&self) -> &ConfidenceConfig {
        &self.config
    }

    /// Ingests the events stamped no later than `now`, then evaluates.
    ///
    /// # Errors
    ///
    /// Fails on the first trip no rule matches.
    #[tracing::instrument(skip(self, ctx, events), fields(events = events.len()))]
    pub fn tick(
        &self,
        ctx: &mut TickContext,
        events: &[PollEvent],
        now: DateTime<Utc>,
    ) -> Result<TickReport, ClassificationError> {
        let mut ingested = 0;
        let mut deferred = 0;
        let mut diagnostics = Vec::new();

        for event in events {
            if event.poll_timestamp > now {
                deferred += 1;
                continue;
            }
            let report = ctx.store.ingest(event, &self.config.timeline);
            if report.accepted {
                ingested += 1;
            }
            diagnostics.extend(report.diagnostics);
        }

        ctx.ticks += 1;
        ctx.last_tick = Some(now);

        let evaluation = self.evaluate(&ctx.store, now)?;
        info!(
            tick = ctx.ticks,
            ingested,
            deferred,
            diagnostics = diagnostics.len(),
            records = evaluation.records.len(),
            skipped = evaluation.skipped.len(),
            "Tick complete"
        );

        Ok(TickReport {
            evaluation,
            ingested,
            deferred,
            diagnostics,
        })
    }

    /// Judges every candidate trip as of `now` without touching the store.
    ///
    /// Candidates are the trips already observed plus scheduled trips whose
    /// assignment window is open, so an unobserved trip is still judged.
    pub fn evaluate(
        &self,
        store: &TimelineStore,
        now: DateTime<Utc>,
    ) -> Result<Evaluation, ClassificationError> {
        let thresholds = &self.config.thresholds;
        let extractor = SignalExtractor::new(&self.config.route, thresholds);

        let horizon = now + thresholds.assignment_window();
        let scheduled = store.schedule().departing_between(now, horizon);
        let candidates: BTreeSet<&str> = store
            .trip_ids()
            .chain(scheduled.map(|(id, _)| id))
            .collect();

        let mut records = Vec::with_capacity(candidates.len());
        let mut skipped = Vec::new();

        for trip_id in candidates {
            let trip = match store.trip(trip_id) {
                Some(trip) => Cow::Borrowed(trip),
                None => Cow::Owned(Trip::new(trip_id, store.schedule().departure(trip_id))),
            };

            let signals = extractor.extract(store, &trip, now);
            let minutes = match signals.minutes_to_departure.known() {
                Some(m) if *m >= 0.0 => *m,
                _ => {
                    debug!(trip_id, minutes = ?signals.minutes_to_departure, "Skipping trip");
                    skipped.push(trip_id.to_string());
                    continue;
                }
            };

            let classification = self.classifier.classify(&signals)?;
            records.push(ConfidenceRecord::new(trip_id, minutes, &classification, now));
        }

        Ok(Evaluation {
            evaluated_at: now,
            records: rank_records(records, self.config.ranking.tie_epsilon_minutes),
            skipped,
        })
    }
}
