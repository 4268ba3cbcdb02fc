//! Trip timeline reconstruction.
//!
//! [`TimelineStore`] folds [`PollEvent`]s into one bounded, time-ordered
//! [`Trip`] per `trip_id`. Ingestion is idempotent: re-delivering a poll never
//! changes a timeline. Disappearance markers are derived from the set of
//! successful polls rather than from arrival order, so the same set of polls
//! always yields the same markers.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

use crate::config::TimelineConfig;
use crate::model::{PollEvent, PredictionSnapshot, TripId, VehiclePosition};
use crate::schedule::Schedule;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum EntryKind {
    Prediction,
    Vehicle,
}

/// Sort key of an observation: time first, then kind, then the stop or
/// vehicle it describes.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct EntryKey {
    observed_at: DateTime<Utc>,
    kind: EntryKind,
    subject: String,
}

/// One item in a trip's timeline.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TimelineEntry {
    Prediction(PredictionSnapshot),
    Vehicle(VehiclePosition),
    /// The trip was predicted in one successful poll and missing from the next.
    PredictionDropped {
        at: DateTime<Utc>,
        last_seen_at: DateTime<Utc>,
    },
    /// A dropped prediction showed up again.
    PredictionReappeared {
        at: DateTime<Utc>,
        dropped_at: DateTime<Utc>,
    },
}

impl TimelineEntry {
    pub fn observed_at(&self) -> DateTime<Utc> {
        match self {
            TimelineEntry::Prediction(p) => p.observed_at,
            TimelineEntry::Vehicle(v) => v.observed_at,
            TimelineEntry::PredictionDropped { at, .. } => *at,
            TimelineEntry::PredictionReappeared { at, .. } => *at,
        }
    }

    fn key(&self) -> Option<EntryKey> {
        match self {
            TimelineEntry::Prediction(p) => Some(EntryKey {
                observed_at: p.observed_at,
                kind: EntryKind::Prediction,
                subject: p.stop_id.clone(),
            }),
            TimelineEntry::Vehicle(v) => Some(EntryKey {
                observed_at: v.observed_at,
                kind: EntryKind::Vehicle,
                subject: v.vehicle_id.clone().unwrap_or_default(),
            }),
            _ => None,
        }
    }
}

/// A vehicle seen serving a trip, and when.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Assignment {
    pub vehicle_id: String,
    pub at: DateTime<Utc>,
}

/// Anything the reconstructor absorbed instead of failing on.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Diagnostic {
    LateArrivalIgnored {
        poll_timestamp: DateTime<Utc>,
        watermark: DateTime<Utc>,
    },
    InconsistentObservation {
        trip_id: TripId,
        subject: String,
        observed_at: DateTime<Utc>,
        kept_polled_at: DateTime<Utc>,
    },
    DataGap {
        poll_timestamp: DateTime<Utc>,
        description: String,
    },
}

/// A poll whose error marker was set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GapRecord {
    pub poll_timestamp: DateTime<Utc>,
    pub description: String,
}

#[derive(Debug, Default, Clone)]
struct PollRecord {
    ok: bool,
    error: Option<String>,
    trips: BTreeSet<TripId>,
}

/// Result of folding one poll into the store.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct IngestReport {
    pub accepted: bool,
    pub added: usize,
    pub duplicates: usize,
    pub diagnostics: Vec<Diagnostic>,
}

enum Upsert {
    Added,
    Duplicate,
    Replaced { kept_polled_at: DateTime<Utc> },
    KeptExisting { kept_polled_at: DateTime<Utc> },
}

/// One scheduled run, reconstructed from every observation sharing its id.
#[derive(Debug, Clone)]
pub struct Trip {
    pub trip_id: TripId,
    pub scheduled_departure: Option<DateTime<Utc>>,
    observations: BTreeMap<EntryKey, TimelineEntry>,
    markers: Vec<TimelineEntry>,
    first_assignment: Option<Assignment>,
    seen_in_polls: BTreeSet<DateTime<Utc>>,
}

impl Trip {
    pub fn new(trip_id: impl Into<TripId>, scheduled_departure: Option<DateTime<Utc>>) -> Self {
        Self {
            trip_id: trip_id.into(),
            scheduled_departure,
            observations: BTreeMap::new(),
            markers: Vec::new(),
            first_assignment: None,
            seen_in_polls: BTreeSet::new(),
        }
    }

    /// The merged, time-ordered timeline, markers included.
    pub fn timeline(&self) -> Vec<&TimelineEntry> {
        let mut all: Vec<&TimelineEntry> =
            self.observations.values().chain(self.markers.iter()).collect();
        // stable: observations keep their key order on equal timestamps
        all.sort_by_key(|e| e.observed_at());
        all
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    /// Predictions for `stop_id` observed no later than `until`, oldest first.
    pub fn predictions_at<'a>(
        &'a self,
        stop_id: &'a str,
        until: DateTime<Utc>,
    ) -> impl Iterator<Item = &'a PredictionSnapshot> + 'a {
        self.observations.values().filter_map(move |e| match e {
            TimelineEntry::Prediction(p) if p.stop_id == stop_id && p.observed_at <= until => {
                Some(p)
            }
            _ => None,
        })
    }

    /// Vehicle positions observed no later than `until`, oldest first.
    pub fn positions(&self, until: DateTime<Utc>) -> impl Iterator<Item = &VehiclePosition> {
        self.observations.values().filter_map(move |e| match e {
            TimelineEntry::Vehicle(v) if v.observed_at <= until => Some(v),
            _ => None,
        })
    }

    /// Disappearance markers up to `until`, oldest first.
    pub fn markers(&self, until: DateTime<Utc>) -> impl Iterator<Item = &TimelineEntry> {
        self.markers.iter().filter(move |m| m.observed_at() <= until)
    }

    pub fn ever_predicted(&self, until: DateTime<Utc>) -> bool {
        self.observations.values().any(|e| {
            matches!(e, TimelineEntry::Prediction(p) if p.observed_at <= until)
        })
    }

    /// First assignment known as of `until`.
    pub fn first_assignment(&self, until: DateTime<Utc>) -> Option<&Assignment> {
        self.first_assignment.as_ref().filter(|a| a.at <= until)
    }

    /// Most recent vehicle evidence as of `until`: a position naming this
    /// trip or a prediction carrying a vehicle id.
    pub fn latest_assignment(&self, until: DateTime<Utc>) -> Option<Assignment> {
        self.observations.values().rev().find_map(|e| {
            let (vehicle_id, at) = match e {
                TimelineEntry::Prediction(p) => (p.vehicle_id.as_ref()?, p.observed_at),
                TimelineEntry::Vehicle(v) => (v.vehicle_id.as_ref()?, v.observed_at),
                _ => return None,
            };
            (at <= until).then(|| Assignment {
                vehicle_id: vehicle_id.clone(),
                at,
            })
        })
    }

    /// Whether the poll stamped `poll_timestamp` carried a prediction for this trip.
    pub fn seen_in_poll(&self, poll_timestamp: DateTime<Utc>) -> bool {
        self.seen_in_polls.contains(&poll_timestamp)
    }

    pub fn last_observed_at(&self) -> Option<DateTime<Utc>> {
        self.observations.values().map(TimelineEntry::observed_at).max()
    }

    /// Latest time the upstream expected this trip at any stop.
    fn predicted_deadline(&self) -> Option<DateTime<Utc>> {
        self.observations
            .values()
            .filter_map(|e| match e {
                TimelineEntry::Prediction(p) => p.best_time(),
                _ => None,
            })
            .max()
    }

    fn note_assignment(&mut self, vehicle_id: &str, at: DateTime<Utc>) {
        let earlier = self.first_assignment.as_ref().is_none_or(|a| at < a.at);
        if earlier {
            self.first_assignment = Some(Assignment {
                vehicle_id: vehicle_id.to_string(),
                at,
            });
        }
    }

    fn upsert(&mut self, entry: TimelineEntry) -> Upsert {
        let Some(key) = entry.key() else {
            return Upsert::Duplicate;
        };
        match self.observations.get(&key) {
            None => {
                self.observations.insert(key, entry);
                Upsert::Added
            }
            Some(existing) => {
                let (same, existing_polled, new_polled) = match (existing, &entry) {
                    (TimelineEntry::Prediction(a), TimelineEntry::Prediction(b)) => {
                        (a.same_payload(b), a.polled_at, b.polled_at)
                    }
                    (TimelineEntry::Vehicle(a), TimelineEntry::Vehicle(b)) => {
                        (a.same_payload(b), a.polled_at, b.polled_at)
                    }
                    _ => return Upsert::Duplicate,
                };
                if same {
                    Upsert::Duplicate
                } else if new_polled >= existing_polled {
                    self.observations.insert(key, entry);
                    Upsert::Replaced {
                        kept_polled_at: new_polled,
                    }
                } else {
                    Upsert::KeptExisting {
                        kept_polled_at: existing_polled,
                    }
                }
            }
        }
    }

    fn evict(&mut self, cutoff: DateTime<Utc>, max_entries: usize) {
        self.observations.retain(|k, _| k.observed_at >= cutoff);
        while self.observations.len() > max_entries {
            self.observations.pop_first();
        }
        self.seen_in_polls.retain(|ts| *ts >= cutoff);
    }

    /// Rebuilds drop/reappear markers from the ordered successful polls.
    fn refresh_markers(&mut self, ok_polls: &[DateTime<Utc>]) {
        self.markers.clear();
        // a late-running trip is still due until its predicted departure
        let deadline = [self.scheduled_departure, self.predicted_deadline()]
            .into_iter()
            .flatten()
            .max();
        let Some(deadline) = deadline else {
            return;
        };

        let mut last_seen: Option<DateTime<Utc>> = None;
        let mut dropped_at: Option<DateTime<Utc>> = None;

        for &ts in ok_polls {
            if self.seen_in_polls.contains(&ts) {
                if let Some(d) = dropped_at.take() {
                    self.markers.push(TimelineEntry::PredictionReappeared {
                        at: ts,
                        dropped_at: d,
                    });
                }
                last_seen = Some(ts);
            } else if let Some(seen) = last_seen {
                if dropped_at.is_none() && ts < deadline {
                    self.markers.push(TimelineEntry::PredictionDropped {
                        at: ts,
                        last_seen_at: seen,
                    });
                    dropped_at = Some(ts);
                }
            }
        }
    }
}

/// All reconstructed trips plus the cross-trip state needed to build them:
/// watermark, per-poll trip membership, the gap log, unassigned vehicles and
/// each vehicle's own position history.
#[derive(Debug, Default, Clone)]
pub struct TimelineStore {
    trips: BTreeMap<TripId, Trip>,
    unassigned: BTreeMap<String, VehiclePosition>,
    vehicles: BTreeMap<String, BTreeMap<DateTime<Utc>, VehiclePosition>>,
    polls: BTreeMap<DateTime<Utc>, PollRecord>,
    watermark: Option<DateTime<Utc>>,
    schedule: Schedule,
}

impl TimelineStore {
    pub fn new(schedule: Schedule) -> Self {
        Self {
            schedule,
            ..Default::default()
        }
    }

    /// Newest poll timestamp ingested so far.
    pub fn watermark(&self) -> Option<DateTime<Utc>> {
        self.watermark
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    pub fn trip(&self, trip_id: &str) -> Option<&Trip> {
        self.trips.get(trip_id)
    }

    pub fn trips(&self) -> impl Iterator<Item = &Trip> {
        self.trips.values()
    }

    pub fn trip_ids(&self) -> impl Iterator<Item = &str> {
        self.trips.keys().map(String::as_str)
    }

    /// Vehicles seen without a trip and not yet assigned to one.
    pub fn unassigned_vehicles(&self) -> impl Iterator<Item = &VehiclePosition> {
        self.unassigned.values()
    }

    /// Error polls, oldest first.
    pub fn gaps(&self) -> impl Iterator<Item = GapRecord> + '_ {
        self.polls.iter().filter_map(|(ts, rec)| {
            if rec.ok {
                return None;
            }
            rec.error.as_ref().map(|e| GapRecord {
                poll_timestamp: *ts,
                description: e.clone(),
            })
        })
    }

    /// Newest poll that delivered data, as of `until`.
    pub fn last_successful_poll(&self, until: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.polls
            .range(..=until)
            .rev()
            .find(|(_, rec)| rec.ok)
            .map(|(ts, _)| *ts)
    }

    /// Positions reported by `vehicle_id` up to `until`, whatever trip they
    /// name, oldest first.
    pub fn vehicle_history(
        &self,
        vehicle_id: &str,
        until: DateTime<Utc>,
    ) -> impl Iterator<Item = &VehiclePosition> {
        self.vehicles
            .get(vehicle_id)
            .into_iter()
            .flat_map(move |h| h.range(..=until).map(|(_, p)| p))
    }

    /// Folds several polls, in the order given.
    pub fn ingest_all<'a>(
        &mut self,
        events: impl IntoIterator<Item = &'a PollEvent>,
        config: &TimelineConfig,
    ) -> Vec<IngestReport> {
        events
            .into_iter()
            .map(|event| self.ingest(event, config))
            .collect()
    }

    /// Folds one poll into the store.
    pub fn ingest(&mut self, event: &PollEvent, config: &TimelineConfig) -> IngestReport {
        let mut report = IngestReport::default();
        let ts = event.poll_timestamp;

        if let Some(watermark) = self.watermark {
            if ts < watermark - config.lateness_window() {
                warn!(
                    poll_timestamp = %ts,
                    watermark = %watermark,
                    "late-arrival ignored"
                );
                report.diagnostics.push(Diagnostic::LateArrivalIgnored {
                    poll_timestamp: ts,
                    watermark,
                });
                return report;
            }
        }
        report.accepted = true;

        let record = self.polls.entry(ts).or_default();
        if let Some(error) = &event.error {
            debug!(poll_timestamp = %ts, error = %error, "Recording data gap");
            if record.error.is_none() {
                record.error = Some(error.clone());
            }
            report.diagnostics.push(Diagnostic::DataGap {
                poll_timestamp: ts,
                description: error.clone(),
            });
        } else {
            record.ok = true;
            for p in &event.predictions {
                record.trips.insert(p.trip_id.clone());
            }
        }

        if !event.is_error() {
            for prediction in &event.predictions {
                let schedule = self.schedule.departure(&prediction.trip_id);
                let trip = self
                    .trips
                    .entry(prediction.trip_id.clone())
                    .or_insert_with(|| Trip::new(prediction.trip_id.clone(), schedule));
                trip.seen_in_polls.insert(ts);
                if let Some(vid) = &prediction.vehicle_id {
                    trip.note_assignment(vid, prediction.observed_at);
                }
                let outcome = trip.upsert(TimelineEntry::Prediction(prediction.clone()));
                tally(&mut report, outcome, trip, &prediction.stop_id, prediction.observed_at);
            }

            for position in &event.vehicles {
                self.ingest_position(position, &mut report);
            }
        }

        self.watermark = Some(self.watermark.map_or(ts, |w| w.max(ts)));
        self.evict(config);
        self.refresh_markers();
        report
    }

    fn ingest_position(&mut self, position: &VehiclePosition, report: &mut IngestReport) {
        if let Some(vid) = &position.vehicle_id {
            let history = self.vehicles.entry(vid.clone()).or_default();
            let newer = history
                .get(&position.observed_at)
                .is_none_or(|prev| position.polled_at >= prev.polled_at);
            if newer {
                history.insert(position.observed_at, position.clone());
            }
        }

        let Some(trip_id) = &position.trip_id else {
            match &position.vehicle_id {
                Some(vid) => {
                    let newer = self
                        .unassigned
                        .get(vid)
                        .is_none_or(|prev| position.observed_at >= prev.observed_at);
                    if newer {
                        self.unassigned.insert(vid.clone(), position.clone());
                    }
                }
                None => debug!("Skipping vehicle position with neither trip nor vehicle id"),
            }
            return;
        };

        if let Some(vid) = &position.vehicle_id {
            if self
                .unassigned
                .get(vid)
                .is_some_and(|prev| prev.observed_at <= position.observed_at)
            {
                debug!(vehicle_id = %vid, trip_id = %trip_id, "Vehicle assigned");
                self.unassigned.remove(vid);
            }
        }

        let schedule = self.schedule.departure(trip_id);
        let trip = self
            .trips
            .entry(trip_id.clone())
            .or_insert_with(|| Trip::new(trip_id.clone(), schedule));
        if let Some(vid) = &position.vehicle_id {
            trip.note_assignment(vid, position.observed_at);
        }
        let subject = position.vehicle_id.clone().unwrap_or_default();
        let outcome = trip.upsert(TimelineEntry::Vehicle(position.clone()));
        tally(report, outcome, trip, &subject, position.observed_at);
    }

    fn evict(&mut self, config: &TimelineConfig) {
        let Some(watermark) = self.watermark else {
            return;
        };
        let cutoff = watermark - config.retention();
        self.polls = self.polls.split_off(&cutoff);
        self.unassigned.retain(|_, v| v.observed_at >= cutoff);
        for history in self.vehicles.values_mut() {
            *history = history.split_off(&cutoff);
            while history.len() > config.max_entries_per_trip {
                history.pop_first();
            }
        }
        self.vehicles.retain(|_, h| !h.is_empty());
        for trip in self.trips.values_mut() {
            trip.evict(cutoff, config.max_entries_per_trip);
        }
        self.trips.retain(|id, trip| {
            let keep = !trip.is_empty();
            if !keep {
                debug!(trip_id = %id, "Trip aged out of retention window");
            }
            keep
        });
    }

    fn refresh_markers(&mut self) {
        let ok_polls: Vec<DateTime<Utc>> = self
            .polls
            .iter()
            .filter(|(_, rec)| rec.ok)
            .map(|(ts, _)| *ts)
            .collect();
        for trip in self.trips.values_mut() {
            trip.refresh_markers(&ok_polls);
        }
    }
}

fn tally(
    report: &mut IngestReport,
    outcome: Upsert,
    trip: &Trip,
    subject: &str,
    observed_at: DateTime<Utc>,
) {
    match outcome {
        Upsert::Added => report.added += 1,
        Upsert::Duplicate => report.duplicates += 1,
        Upsert::Replaced { kept_polled_at } | Upsert::KeptExisting { kept_polled_at } => {
            warn!(
                trip_id = %trip.trip_id,
                subject,
                observed_at = %observed_at,
                kept_polled_at = %kept_polled_at,
                "Inconsistent observation, keeping most recently polled snapshot"
            );
            report.diagnostics.push(Diagnostic::InconsistentObservation {
                trip_id: trip.trip_id.clone(),
                subject: subject.to_string(),
                observed_at,
                kept_polled_at,
            });
        }
    }
}

/// Window helper shared with the signal extractor.
pub(crate) fn within(ts: DateTime<Utc>, now: DateTime<Utc>, window: Duration) -> bool {
    ts <= now && ts >= now - window
}
